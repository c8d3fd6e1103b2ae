//! Compose document model and the service merge pipeline.
//!
//! A service definition is assembled in a fixed order: class base, network
//! overlay, environment fill-in, debug overlay, then the raw overrides
//! fragment. Later layers win field by field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::preset::{OpenPort, ServiceSettings};

/// One service entry in the emitted compose document. Empty collections and
/// unset options are pruned from the output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<ServiceNetworks>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_opt: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceNetworks {
    pub default: NetworkAttachment,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeNetworks {
    pub default: NetworkIpam,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkIpam {
    pub ipam: Ipam,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ipam {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<IpamSubnet>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpamSubnet {
    pub subnet: String,
}

impl ComposeNetworks {
    pub fn with_subnet(subnet: &str) -> Self {
        Self {
            default: NetworkIpam {
                ipam: Ipam {
                    config: vec![IpamSubnet {
                        subnet: subnet.to_string(),
                    }],
                },
            },
        }
    }
}

/// The whole compose document, keyed by container name for deterministic
/// output ordering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerCompose {
    pub version: String,
    pub services: BTreeMap<String, ServiceDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<ComposeNetworks>,
}

/// Raw per-service fragment from the preset. Applied last; each set field
/// replaces the resolved value wholesale. The container name is fixed by the
/// service class and cannot be overridden.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_add: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_opt: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
}

/// The elevated-privilege fields set while debugging a service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugOverlay {
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub privileged: Option<bool>,
}

/// Resolve the debug overlay for one service. An explicit per-service `false`
/// beats the fleet-wide switch; otherwise either flag enables it.
pub fn debug_overlay(global: bool, service: Option<bool>) -> DebugOverlay {
    if service == Some(false) {
        return DebugOverlay::default();
    }
    if service.unwrap_or(false) || global {
        DebugOverlay {
            cap_add: vec!["ALL".to_string()],
            security_opt: vec!["seccomp:unconfined".to_string()],
            privileged: Some(true),
        }
    } else {
        DebugOverlay::default()
    }
}

impl ServiceDefinition {
    /// Apply host naming and static addressing from shared settings.
    pub fn apply_network_overlay(&mut self, settings: &ServiceSettings) {
        if let Some(host) = &settings.host {
            self.hostname = Some(host.clone());
            let networks = self.networks.get_or_insert_with(ServiceNetworks::default);
            networks.default.aliases.push(host.clone());
        }
        if let Some(ipv4) = &settings.ipv4_address {
            let networks = self.networks.get_or_insert_with(ServiceNetworks::default);
            networks.default.ipv4_address = Some(ipv4.clone());
        }
    }

    /// Fill environment gaps from the preset. Values already set by the class
    /// base keep their value.
    pub fn apply_environment(&mut self, settings: &ServiceSettings) {
        if let Some(env) = &settings.environment {
            for (key, value) in env {
                self.environment
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }
    }

    pub fn apply_debug_overlay(&mut self, overlay: DebugOverlay) {
        if !overlay.cap_add.is_empty() {
            self.cap_add = overlay.cap_add;
        }
        if !overlay.security_opt.is_empty() {
            self.security_opt = overlay.security_opt;
        }
        if overlay.privileged.is_some() {
            self.privileged = overlay.privileged;
        }
    }

    /// Apply the raw overrides fragment. Last writer wins, one field at a
    /// time; environment entries from the fragment replace resolved ones.
    pub fn apply_overrides(&mut self, overrides: Option<&ServiceOverrides>) {
        let Some(over) = overrides else {
            return;
        };
        if let Some(user) = &over.user {
            self.user = Some(user.clone());
        }
        if let Some(image) = &over.image {
            self.image = Some(image.clone());
        }
        if let Some(command) = &over.command {
            self.command = Some(command.clone());
        }
        if let Some(entrypoint) = &over.entrypoint {
            self.entrypoint = Some(entrypoint.clone());
        }
        if let Some(stop_signal) = &over.stop_signal {
            self.stop_signal = Some(stop_signal.clone());
        }
        if let Some(working_dir) = &over.working_dir {
            self.working_dir = Some(working_dir.clone());
        }
        if let Some(restart) = &over.restart {
            self.restart = Some(restart.clone());
        }
        if let Some(hostname) = &over.hostname {
            self.hostname = Some(hostname.clone());
        }
        if let Some(ports) = &over.ports {
            self.ports = ports.clone();
        }
        if let Some(volumes) = &over.volumes {
            self.volumes = volumes.clone();
        }
        if let Some(environment) = &over.environment {
            for (key, value) in environment {
                self.environment.insert(key.clone(), value.clone());
            }
        }
        if let Some(depends_on) = &over.depends_on {
            self.depends_on = depends_on.clone();
        }
        if let Some(cap_add) = &over.cap_add {
            self.cap_add = cap_add.clone();
        }
        if let Some(security_opt) = &over.security_opt {
            self.security_opt = security_opt.clone();
        }
        if let Some(privileged) = over.privileged {
            self.privileged = Some(privileged);
        }
    }
}

/// One internal port and how the preset asked to publish it.
#[derive(Debug, Clone)]
pub struct PortConfiguration {
    pub internal_port: u16,
    pub open_port: Option<OpenPort>,
}

/// Turn port requests into compose `host:container` bindings. A plain `true`
/// (boolean or the literal string) publishes on the same number; any other
/// open value is taken verbatim as the host side.
pub fn resolve_ports(configurations: &[PortConfiguration]) -> Vec<String> {
    configurations
        .iter()
        .filter_map(|config| {
            let open = config.open_port.as_ref()?;
            if !open.is_open() {
                return None;
            }
            let host_side = match open {
                OpenPort::Bool(_) => config.internal_port.to_string(),
                OpenPort::Text(s) if s == "true" => config.internal_port.to_string(),
                OpenPort::Text(s) => s.clone(),
                OpenPort::Number(n) => n.to_string(),
            };
            Some(format!("{}:{}", host_side, config.internal_port))
        })
        .collect()
}

/// Build a compose volume string.
pub fn vol(host: &str, container: &str, read_only: bool) -> String {
    let mode = if read_only { "ro" } else { "rw" };
    format!("{}:{}:{}", host, container, mode)
}

/// Strip quoting and a leading `0x` from a hex id.
pub fn to_simple_hex(value: &str) -> String {
    value
        .trim_matches(|c| c == '\'' || c == '"')
        .trim_start_matches("0x")
        .to_string()
}
