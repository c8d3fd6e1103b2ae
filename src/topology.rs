//! Topology compilation: preset in, compose document out.
//!
//! Every service class resolves through the same pipeline (class base,
//! network overlay, environment fill-in, debug overlay, raw overrides) and
//! lands in a name-keyed map so the emitted document is deterministic.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::compose::{
    debug_overlay, resolve_ports, vol, to_simple_hex, ComposeNetworks, DockerCompose,
    PortConfiguration, ServiceDefinition,
};
use crate::error::{BootstrapError, Result};
use crate::model::AddressBook;
use crate::preset::{OpenPort, Preset, ServiceSettings};

pub const COMPOSE_FILE_NAME: &str = "docker-compose.yml";

/// Mount point for a service's own state inside its container.
pub const NODE_WORKING_DIRECTORY: &str = "/node-workdir";
/// Mount point for the shared startup scripts.
pub const NODE_COMMANDS_DIRECTORY: &str = "/node-commands";

const DATABASE_PORT: u16 = 27017;
const NODE_PORT: u16 = 7900;
const BROKER_PORT: u16 = 7902;
const GATEWAY_PORT: u16 = 3000;
const WALLET_PORT: u16 = 80;
const EXPLORER_PORT: u16 = 4000;
const FAUCET_PORT: u16 = 4000;

pub struct ComposeCompiler {
    target: PathBuf,
    user: Option<String>,
    upgrade: bool,
}

impl ComposeCompiler {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            user: None,
            upgrade: false,
        }
    }

    /// Run containers as this `uid:gid` where the image supports it.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Discard any previously compiled document instead of reusing it.
    pub fn with_upgrade(mut self, upgrade: bool) -> Self {
        self.upgrade = upgrade;
        self
    }

    /// Compile the preset into a compose document under `<target>/docker`.
    ///
    /// An existing document is reused verbatim unless upgrading; manual edits
    /// survive repeated runs that way.
    pub fn compile(
        &self,
        preset: &Preset,
        address_book: Option<&AddressBook>,
    ) -> Result<DockerCompose> {
        let docker_folder = self.target.join("docker");
        let compose_file = docker_folder.join(COMPOSE_FILE_NAME);

        if self.upgrade && docker_folder.exists() {
            tracing::info!(
                "[ComposeCompiler] Upgrading, removing {:?}",
                docker_folder
            );
            std::fs::remove_dir_all(&docker_folder)?;
        }

        if compose_file.exists() {
            tracing::info!(
                "[ComposeCompiler] Reusing existing {:?}. Use upgrade to recompile",
                compose_file
            );
            let text = std::fs::read_to_string(&compose_file)?;
            return Ok(serde_yaml::from_str(&text)?);
        }

        let mut services: BTreeMap<String, ServiceDefinition> = BTreeMap::new();
        let mut add = |name: &str, service: ServiceDefinition| -> Result<()> {
            if services.insert(name.to_string(), service).is_some() {
                return Err(BootstrapError::Configuration(format!(
                    "Duplicate container name '{}' in preset",
                    name
                )));
            }
            Ok(())
        };

        for database in preset.databases.iter().filter(|d| !d.settings.exclude) {
            add(
                &database.name,
                self.resolve_database(preset, database),
            )?;
        }

        for node in preset.nodes.iter().filter(|n| !n.settings.exclude) {
            let node_service = self.resolve_node(preset, node);
            if let Some(broker_name) = &node.broker_name {
                add(broker_name, self.resolve_broker(preset, node, &node_service))?;
            }
            if node.reward_program.is_some() {
                let agent_name = format!("{}-agent", node.name);
                add(&agent_name, self.resolve_agent(preset, node, &agent_name))?;
            }
            add(&node.name, node_service)?;
        }

        for gateway in preset.gateways.iter().filter(|g| !g.settings.exclude) {
            add(&gateway.name, self.resolve_gateway(preset, gateway))?;
        }

        for proxy in preset.https_proxies.iter().filter(|p| !p.settings.exclude) {
            add(&proxy.name, self.resolve_proxy(preset, proxy)?)?;
        }

        for wallet in preset.wallets.iter().filter(|w| !w.settings.exclude) {
            add(&wallet.name, self.resolve_wallet(preset, wallet))?;
        }

        for explorer in preset.explorers.iter().filter(|e| !e.settings.exclude) {
            add(&explorer.name, self.resolve_explorer(preset, explorer))?;
        }

        for faucet in preset.faucets.iter().filter(|f| !f.settings.exclude) {
            add(
                &faucet.name,
                self.resolve_faucet(preset, faucet, address_book),
            )?;
        }

        let compose = DockerCompose {
            version: preset.compose_version.clone(),
            services,
            networks: preset
                .subnet
                .as_deref()
                .map(ComposeNetworks::with_subnet),
        };

        std::fs::create_dir_all(&docker_folder)?;
        std::fs::write(&compose_file, serde_yaml::to_string(&compose)?)?;
        tracing::info!("[ComposeCompiler] Compiled {:?}", compose_file);
        Ok(compose)
    }

    fn base(&self, preset: &Preset, name: &str, image: &str) -> ServiceDefinition {
        ServiceDefinition {
            user: self.user.clone(),
            container_name: Some(name.to_string()),
            image: Some(image.to_string()),
            restart: Some(preset.service_restart.clone()),
            ..Default::default()
        }
    }

    fn resolve_database(
        &self,
        preset: &Preset,
        database: &crate::preset::DatabasePreset,
    ) -> ServiceDefinition {
        let mut service = self.base(preset, &database.name, &preset.database_image);
        // The database manages its own lifecycle, no restart policy.
        service.restart = None;
        let command = format!(
            "mongod --dbpath=/dbdata --bind_ip={} {}",
            database.name, preset.database_run_param
        );
        service.command = Some(command.trim().to_string());
        service.stop_signal = Some("SIGINT".to_string());
        service.working_dir = Some("/docker-entrypoint-initdb.d".to_string());
        service.ports = resolve_ports(&[PortConfiguration {
            internal_port: DATABASE_PORT,
            open_port: database.settings.open_port.clone(),
        }]);
        service.volumes = vec![
            vol("./mongo", "/docker-entrypoint-initdb.d", true),
            vol(&format!("../databases/{}", database.name), "/dbdata", false),
        ];
        service.environment.insert(
            "MONGO_INITDB_DATABASE".to_string(),
            database
                .database_name
                .clone()
                .unwrap_or_else(|| preset.database_name.clone()),
        );
        resolve_service(service, &database.settings, preset.debug_mode)
    }

    fn resolve_node(
        &self,
        preset: &Preset,
        node: &crate::preset::NodePreset,
    ) -> ServiceDefinition {
        let debug = preset.debug_mode || node.settings.debug_mode.unwrap_or(false);
        let mut service = self.base(preset, &node.name, &preset.node_image);
        if debug {
            // Debugging needs root inside the container.
            service.user = None;
        }
        let mode = if debug { "DEBUG" } else { "NORMAL" };
        service.command = Some(format!(
            "/bin/bash {}/start.sh {} {} server broker {} {} {}",
            NODE_COMMANDS_DIRECTORY,
            preset.app_folder,
            preset.data_directory,
            node.name,
            mode,
            node.broker_name.is_some(),
        ));
        service.stop_signal = Some("SIGINT".to_string());
        service.working_dir = Some(NODE_WORKING_DIRECTORY.to_string());
        service.ports = resolve_ports(&[PortConfiguration {
            internal_port: NODE_PORT,
            open_port: node.settings.open_port.clone(),
        }]);
        service.volumes = vec![
            vol(&format!("../nodes/{}", node.name), NODE_WORKING_DIRECTORY, false),
            vol("./server", NODE_COMMANDS_DIRECTORY, true),
        ];
        if let Some(database_host) = &node.database_host {
            service.depends_on.push(database_host.clone());
        }
        if let Some(broker_name) = &node.broker_name {
            service.depends_on.push(broker_name.clone());
        }
        resolve_service(service, &node.settings, preset.debug_mode)
    }

    fn resolve_broker(
        &self,
        preset: &Preset,
        node: &crate::preset::NodePreset,
        node_service: &ServiceDefinition,
    ) -> ServiceDefinition {
        let settings = node.broker.clone().unwrap_or_default();
        let broker_name = node.broker_name.as_deref().unwrap_or_default();
        let debug = preset.debug_mode || settings.debug_mode.unwrap_or(false);
        let mut service = self.base(preset, broker_name, &preset.node_image);
        // Brokers run the same image and share the node's working volumes.
        service.image = node_service.image.clone();
        service.volumes = node_service.volumes.clone();
        if debug {
            service.user = None;
        }
        let mode = if debug { "DEBUG" } else { "NORMAL" };
        service.command = Some(format!(
            "/bin/bash {}/start.sh {} {} broker server {} {}",
            NODE_COMMANDS_DIRECTORY,
            preset.app_folder,
            preset.data_directory,
            broker_name,
            mode,
        ));
        service.stop_signal = Some("SIGINT".to_string());
        service.working_dir = Some(NODE_WORKING_DIRECTORY.to_string());
        service.ports = resolve_ports(&[PortConfiguration {
            internal_port: BROKER_PORT,
            open_port: settings.open_port.clone(),
        }]);
        if let Some(database_host) = &node.database_host {
            service.depends_on.push(database_host.clone());
        }
        resolve_service(service, &settings, preset.debug_mode)
    }

    fn resolve_agent(
        &self,
        preset: &Preset,
        node: &crate::preset::NodePreset,
        agent_name: &str,
    ) -> ServiceDefinition {
        let mut settings = node.agent.clone().unwrap_or_default();
        // Agents exist to be reachable by the reward controller.
        if settings.open_port.is_none() {
            settings.open_port = Some(OpenPort::Bool(true));
        }
        let port = node.agent_port.unwrap_or(preset.agent_port);
        let mut service = self.base(preset, agent_name, &preset.agent_image);
        service.entrypoint = Some("/app/agent-linux.bin --config agent.properties".to_string());
        service.working_dir = Some(NODE_WORKING_DIRECTORY.to_string());
        service.ports = resolve_ports(&[PortConfiguration {
            internal_port: port,
            open_port: settings.open_port.clone(),
        }]);
        service.volumes = vec![vol(
            &format!("../nodes/{}/agent", node.name),
            NODE_WORKING_DIRECTORY,
            false,
        )];
        resolve_service(service, &settings, preset.debug_mode)
    }

    fn resolve_gateway(
        &self,
        preset: &Preset,
        gateway: &crate::preset::GatewayPreset,
    ) -> ServiceDefinition {
        let mut service = self.base(preset, &gateway.name, &preset.gateway_image);
        service.command = Some(format!("npm start --prefix {}", preset.app_folder));
        service.stop_signal = Some("SIGINT".to_string());
        service.working_dir = Some(NODE_WORKING_DIRECTORY.to_string());
        service.ports = resolve_ports(&[PortConfiguration {
            internal_port: GATEWAY_PORT,
            open_port: gateway.settings.open_port.clone(),
        }]);
        service.volumes = vec![vol(
            &format!("../gateways/{}", gateway.name),
            NODE_WORKING_DIRECTORY,
            false,
        )];
        if let Some(database_host) = &gateway.database_host {
            service.depends_on.push(database_host.clone());
        }
        resolve_service(service, &gateway.settings, preset.debug_mode)
    }

    fn resolve_proxy(
        &self,
        preset: &Preset,
        proxy: &crate::preset::ProxyPreset,
    ) -> Result<ServiceDefinition> {
        let mut service = self.base(preset, &proxy.name, &preset.proxy_image);
        // Proxy images manage their own user.
        service.user = None;
        service.stop_signal = Some("SIGINT".to_string());

        let domains = match &proxy.domains {
            Some(domains) => domains.clone(),
            None => {
                let host = proxy
                    .settings
                    .host
                    .clone()
                    .or_else(|| {
                        preset
                            .nodes
                            .first()
                            .and_then(|n| n.settings.host.clone())
                    })
                    .ok_or_else(|| {
                        BootstrapError::Configuration(format!(
                            "HTTPS proxy {} needs a host, or a node with a host, to derive its domain",
                            proxy.name
                        ))
                    })?;
                let gateway = preset.gateways.first().ok_or_else(|| {
                    BootstrapError::Configuration(format!(
                        "HTTPS proxy {} needs a gateway to forward to",
                        proxy.name
                    ))
                })?;
                format!("{} -> http://{}:{}", host, gateway.name, GATEWAY_PORT)
            }
        };
        service.environment.insert("DOMAINS".to_string(), domains);
        if let Some(web_socket) = proxy.web_socket {
            service
                .environment
                .insert("WEBSOCKET".to_string(), web_socket.to_string());
        }
        if let Some(stage) = &proxy.stage {
            service.environment.insert("STAGE".to_string(), stage.clone());
        }
        if let Some(size) = proxy.server_names_hash_bucket_size {
            service.environment.insert(
                "SERVER_NAMES_HASH_BUCKET_SIZE".to_string(),
                size.to_string(),
            );
        }

        // 80 is always published so the ACME challenge can come through.
        service.ports = resolve_ports(&[
            PortConfiguration {
                internal_port: 80,
                open_port: Some(OpenPort::Bool(true)),
            },
            PortConfiguration {
                internal_port: 443,
                open_port: proxy.settings.open_port.clone(),
            },
        ]);
        service.volumes = vec![vol(
            &format!("../https-proxies/{}", proxy.name),
            "/var/lib/https-portal",
            false,
        )];
        if let Some(gateway) = preset.gateways.first() {
            service.depends_on.push(gateway.name.clone());
        }
        Ok(resolve_service(service, &proxy.settings, preset.debug_mode))
    }

    fn resolve_wallet(
        &self,
        preset: &Preset,
        wallet: &crate::preset::WalletPreset,
    ) -> ServiceDefinition {
        let mut service = self.base(preset, &wallet.name, &preset.wallet_image);
        service.user = None;
        service.stop_signal = Some("SIGINT".to_string());
        service.working_dir = Some(NODE_WORKING_DIRECTORY.to_string());
        service.ports = resolve_ports(&[PortConfiguration {
            internal_port: WALLET_PORT,
            open_port: wallet.settings.open_port.clone(),
        }]);
        service.volumes = vec![vol(
            &format!("../wallets/{}", wallet.name),
            "/usr/share/nginx/html/config",
            true,
        )];
        resolve_service(service, &wallet.settings, preset.debug_mode)
    }

    fn resolve_explorer(
        &self,
        preset: &Preset,
        explorer: &crate::preset::ExplorerPreset,
    ) -> ServiceDefinition {
        let mut service = self.base(preset, &explorer.name, &preset.explorer_image);
        service.user = None;
        service.entrypoint = Some(format!(
            "ash -c \"/bin/ash {}/run.sh {}\"",
            NODE_COMMANDS_DIRECTORY, explorer.name
        ));
        service.stop_signal = Some("SIGINT".to_string());
        service.working_dir = Some(NODE_WORKING_DIRECTORY.to_string());
        service.ports = resolve_ports(&[PortConfiguration {
            internal_port: EXPLORER_PORT,
            open_port: explorer.settings.open_port.clone(),
        }]);
        service.volumes = vec![
            vol(
                &format!("../explorers/{}", explorer.name),
                NODE_WORKING_DIRECTORY,
                true,
            ),
            vol("./explorer", NODE_COMMANDS_DIRECTORY, true),
        ];
        resolve_service(service, &explorer.settings, preset.debug_mode)
    }

    fn resolve_faucet(
        &self,
        preset: &Preset,
        faucet: &crate::preset::FaucetPreset,
        address_book: Option<&AddressBook>,
    ) -> ServiceDefinition {
        let mut service = self.base(preset, &faucet.name, &preset.faucet_image);
        service.user = None;
        service.stop_signal = Some("SIGINT".to_string());

        let env_override = |key: &str| {
            faucet
                .settings
                .environment
                .as_ref()
                .and_then(|env| env.get(key))
                .cloned()
        };
        let private_key = env_override("FAUCET_PRIVATE_KEY")
            .or_else(|| {
                address_book
                    .and_then(|book| book.main_account_private_key())
                    .map(|key| key.to_string())
            })
            .unwrap_or_default();
        service
            .environment
            .insert("FAUCET_PRIVATE_KEY".to_string(), private_key);
        let currency_id = env_override("NATIVE_CURRENCY_ID")
            .or_else(|| preset.currency_mosaic_id.clone())
            .unwrap_or_default();
        service
            .environment
            .insert("NATIVE_CURRENCY_ID".to_string(), to_simple_hex(&currency_id));

        service.ports = resolve_ports(&[PortConfiguration {
            internal_port: FAUCET_PORT,
            open_port: faucet.settings.open_port.clone(),
        }]);
        // Dependency edges are declared, never inferred.
        if let Some(gateway) = &faucet.gateway {
            service.depends_on.push(gateway.clone());
        }
        resolve_service(service, &faucet.settings, preset.debug_mode)
    }
}

/// Shared tail of the resolution pipeline. Order matters: the raw overrides
/// fragment is applied last so it wins everywhere.
fn resolve_service(
    mut service: ServiceDefinition,
    settings: &ServiceSettings,
    global_debug: bool,
) -> ServiceDefinition {
    service.apply_network_overlay(settings);
    service.apply_environment(settings);
    service.apply_debug_overlay(debug_overlay(global_debug, settings.debug_mode));
    service.apply_overrides(settings.compose.as_ref());
    service
}

/// Compose file location for a compiled target directory.
pub fn compose_file_path(target: &Path) -> PathBuf {
    target.join("docker").join(COMPOSE_FILE_NAME)
}
