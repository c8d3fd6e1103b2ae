//! Node certificate lifecycle: decide, generate, verify, record.
//!
//! Generation shells out to an OpenSSL toolchain image through [`ToolRunner`]
//! and trusts nothing it prints: the stdout contract (success marker, exactly
//! two key blocks, keys matching the requested material) is enforced before
//! any metadata is recorded.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use rand::RngCore;

use crate::error::{BootstrapError, Result};
use crate::model::{CertificateMetadata, CertificatePair, ExpirationReport, NodeCertificates};
use crate::preset::Preset;
use crate::runner::{ToolCommand, ToolRunner};
use crate::templates::TemplateRenderer;

pub const CA_CERTIFICATE_FILE_NAME: &str = "ca.cert.pem";
pub const NODE_CERTIFICATE_FILE_NAME: &str = "node.crt.pem";
pub const METADATA_FILE_NAME: &str = "metadata.yml";

/// Bumped whenever the generated artifact layout changes; older folders are
/// regenerated on sight.
pub const METADATA_VERSION: u32 = 1;

/// PKCS#8 DER envelope for a raw ed25519 private key.
const PKCS8_ED25519_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
    0x20,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Main,
    Transport,
}

impl std::fmt::Display for KeyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyRole::Main => write!(f, "Main"),
            KeyRole::Transport => write!(f, "Transport"),
        }
    }
}

/// Supplies private key material for certificate generation. The seam exists
/// so interactive or vault-backed resolution can replace inline keys.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve_private_key(
        &self,
        role: KeyRole,
        pair: &CertificatePair,
        node_name: &str,
        purpose: &str,
    ) -> Result<String>;
}

/// Resolver over keys already present in the pair.
pub struct ProvidedKeyResolver;

#[async_trait]
impl KeyResolver for ProvidedKeyResolver {
    async fn resolve_private_key(
        &self,
        role: KeyRole,
        pair: &CertificatePair,
        node_name: &str,
        purpose: &str,
    ) -> Result<String> {
        if pair.private_key.is_empty() {
            return Err(BootstrapError::Configuration(format!(
                "Node {} has no {} private key available for {}",
                node_name, role, purpose
            )));
        }
        Ok(pair.private_key.to_uppercase())
    }
}

#[derive(Debug, Clone)]
pub struct CertificateConfig {
    pub server_image: String,
    pub ca_certificate_expiration_in_days: u32,
    pub node_certificate_expiration_in_days: u32,
    pub certificate_expiration_warning_in_days: u32,
}

impl CertificateConfig {
    pub fn from_preset(preset: &Preset) -> Self {
        Self {
            server_image: preset.node_image.clone(),
            ca_certificate_expiration_in_days: preset.ca_certificate_expiration_in_days,
            node_certificate_expiration_in_days: preset.node_certificate_expiration_in_days,
            certificate_expiration_warning_in_days: preset.certificate_expiration_warning_in_days,
        }
    }
}

pub struct CertificateManager<R, K> {
    runner: R,
    resolver: K,
    user_id: Option<String>,
}

impl<R: ToolRunner, K: KeyResolver> CertificateManager<R, K> {
    pub fn new(runner: R, resolver: K) -> Self {
        Self {
            runner,
            resolver,
            user_id: None,
        }
    }

    /// Run toolchain invocations as this user id.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Bring the certificate folder up to date. Returns whether a new
    /// certificate set was generated.
    ///
    /// Metadata that is absent, unreadable, from another schema version or
    /// recorded against different public keys always forces regeneration.
    /// With current metadata the installed node certificate is probed for
    /// expiration, and renewal happens only when `renew_if_required` is set.
    pub async fn ensure_certificate(
        &self,
        config: &CertificateConfig,
        node_name: &str,
        certificates: &NodeCertificates,
        renew_if_required: bool,
        cert_folder: &Path,
        random_serial: Option<&str>,
    ) -> Result<bool> {
        if self.should_generate(certificates, cert_folder) {
            tracing::info!(
                "[CertificateManager] Creating certificates for node {}",
                node_name
            );
            self.create_certificate(config, node_name, certificates, cert_folder, random_serial)
                .await?;
            return Ok(true);
        }

        let report = self
            .will_expire(
                &config.server_image,
                cert_folder,
                NODE_CERTIFICATE_FILE_NAME,
                config.certificate_expiration_warning_in_days,
            )
            .await?;

        if !report.will_expire {
            tracing::info!(
                "[CertificateManager] Certificates for node {} valid until {}",
                node_name,
                report.expiration_date
            );
            return Ok(false);
        }

        if renew_if_required {
            tracing::info!(
                "[CertificateManager] Certificates for node {} expire on {}, renewing",
                node_name,
                report.expiration_date
            );
            self.create_certificate(config, node_name, certificates, cert_folder, random_serial)
                .await?;
            Ok(true)
        } else {
            tracing::warn!(
                "[CertificateManager] Certificates for node {} expire on {} but renewal was not requested",
                node_name,
                report.expiration_date
            );
            Ok(false)
        }
    }

    fn should_generate(&self, certificates: &NodeCertificates, cert_folder: &Path) -> bool {
        let metadata_file = cert_folder.join(METADATA_FILE_NAME);
        if !metadata_file.exists() {
            return true;
        }
        let metadata: CertificateMetadata = match std::fs::read_to_string(&metadata_file)
            .map_err(BootstrapError::from)
            .and_then(|text| Ok(serde_yaml::from_str(&text)?))
        {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(
                    "[CertificateManager] Unreadable certificate metadata {:?}: {}. Regenerating",
                    metadata_file,
                    e
                );
                return true;
            }
        };
        metadata.version != METADATA_VERSION
            || !metadata
                .main_public_key
                .eq_ignore_ascii_case(&certificates.main.public_key)
            || !metadata
                .transport_public_key
                .eq_ignore_ascii_case(&certificates.transport.public_key)
    }

    async fn create_certificate(
        &self,
        config: &CertificateConfig,
        node_name: &str,
        certificates: &NodeCertificates,
        cert_folder: &Path,
        random_serial: Option<&str>,
    ) -> Result<()> {
        let main_private_key = self
            .resolver
            .resolve_private_key(
                KeyRole::Main,
                &certificates.main,
                node_name,
                "generating the server CA certificate",
            )
            .await?;
        let transport_private_key = self
            .resolver
            .resolve_private_key(
                KeyRole::Transport,
                &certificates.transport,
                node_name,
                "generating the server node certificate",
            )
            .await?;

        // Stale artifacts from a previous run would poison the CA database.
        if cert_folder.exists() {
            std::fs::remove_dir_all(cert_folder)?;
        }
        std::fs::create_dir_all(cert_folder.join("new_certs"))?;

        let renderer = TemplateRenderer::from_embedded()?;
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), node_name.to_string());
        renderer.render_to_file("cert/ca.cnf", &vars, &cert_folder.join("ca.cnf"))?;
        renderer.render_to_file("cert/node.cnf", &vars, &cert_folder.join("node.cnf"))?;

        write_der_file(&cert_folder.join("ca.der"), &main_private_key)?;
        write_der_file(&cert_folder.join("node.der"), &transport_private_key)?;

        let serial = match random_serial {
            Some(value) => value.trim().to_lowercase(),
            None => {
                let mut bytes = [0u8; 19];
                rand::thread_rng().fill_bytes(&mut bytes);
                hex::encode(bytes)
            }
        };
        std::fs::write(cert_folder.join("serial.dat"), format!("{}\n", serial))?;

        std::fs::write(
            cert_folder.join("create_certificates.sh"),
            create_certificate_script(
                config.ca_certificate_expiration_in_days,
                config.node_certificate_expiration_in_days,
            ),
        )?;

        let output = self
            .run_openssl(
                &config.server_image,
                cert_folder,
                "bash create_certificates.sh",
                false,
            )
            .await?;

        if !output.stdout.contains("Certificate Created") {
            tracing::error!(
                "[CertificateManager] Certificate generation failed for node {}: {}",
                node_name,
                secure_string(&output.stdout)
            );
            return Err(BootstrapError::Toolchain(format!(
                "Certificate generation for node {} did not report success",
                node_name
            )));
        }

        let pairs = parse_key_pairs(&output.stdout)?;
        if pairs.len() != 2 {
            return Err(BootstrapError::Toolchain(format!(
                "Expected 2 key pairs in toolchain output, found {}",
                pairs.len()
            )));
        }
        let (generated_main, generated_transport) = (&pairs[0], &pairs[1]);
        let checks = [
            ("main private", &generated_main.private_key, &main_private_key),
            (
                "main public",
                &generated_main.public_key,
                &certificates.main.public_key,
            ),
            (
                "transport private",
                &generated_transport.private_key,
                &transport_private_key,
            ),
            (
                "transport public",
                &generated_transport.public_key,
                &certificates.transport.public_key,
            ),
        ];
        for (label, generated, expected) in checks {
            if !generated.eq_ignore_ascii_case(expected) {
                return Err(BootstrapError::KeyMismatch(format!(
                    "Generated {} key does not match the provided key for node {}",
                    label, node_name
                )));
            }
        }

        let metadata = CertificateMetadata {
            version: METADATA_VERSION,
            main_public_key: certificates.main.public_key.to_uppercase(),
            transport_public_key: certificates.transport.public_key.to_uppercase(),
        };
        std::fs::write(
            cert_folder.join(METADATA_FILE_NAME),
            serde_yaml::to_string(&metadata)?,
        )?;
        tracing::info!(
            "[CertificateManager] Certificates for node {} created",
            node_name
        );
        Ok(())
    }

    /// Probe the installed certificate for expiration within the warning
    /// window, using the toolchain's own clock and parser.
    pub async fn will_expire(
        &self,
        image: &str,
        cert_folder: &Path,
        certificate_file_name: &str,
        warning_days: u32,
    ) -> Result<ExpirationReport> {
        let seconds = u64::from(warning_days) * 86400;
        let command = format!(
            "openssl x509 -enddate -noout -in {} -checkend {}",
            certificate_file_name, seconds
        );
        // The probe exits non-zero when the certificate will expire; that is
        // an answer, not a failure.
        let output = self.run_openssl(image, cert_folder, &command, true).await?;
        let combined = format!("{}{}", output.stdout, output.stderr);

        let expiration_date = combined
            .split("notAfter=")
            .nth(1)
            .map(|rest| rest.lines().next().unwrap_or("").trim().to_string())
            .unwrap_or_default();
        if expiration_date.is_empty() {
            return Err(BootstrapError::Toolchain(format!(
                "Expiration probe printed no notAfter date: {}",
                combined.trim()
            )));
        }

        let will_expire = if combined.contains("Certificate will not expire") {
            false
        } else if combined.contains("Certificate will expire") {
            true
        } else {
            return Err(BootstrapError::Toolchain(format!(
                "Expiration probe printed no verdict: {}",
                combined.trim()
            )));
        };
        Ok(ExpirationReport {
            will_expire,
            expiration_date,
        })
    }

    async fn run_openssl(
        &self,
        image: &str,
        cert_folder: &Path,
        command: &str,
        ignore_errors: bool,
    ) -> Result<crate::runner::ToolOutput> {
        let host_folder = cert_folder.canonicalize()?;
        let cmd = ToolCommand {
            image: image.to_string(),
            user_id: self.user_id.clone(),
            workdir: "/data".to_string(),
            args: command.split(' ').map(|s| s.to_string()).collect(),
            binds: vec![format!("{}:/data:rw", host_folder.display())],
            ignore_errors,
        };
        self.runner.run(cmd).await
    }
}

/// Parse `priv:`/`pub:` key blocks from toolchain output. Each block must end
/// before a line containing `Certificate`; keys are de-colonized, validated as
/// 64 hex characters and uppercased.
pub fn parse_key_pairs(output: &str) -> Result<Vec<CertificatePair>> {
    let lines: Vec<&str> = output.lines().collect();
    let mut pairs = Vec::new();
    let mut index = 0;
    while index < lines.len() {
        if !lines[index].trim().starts_with("priv:") {
            index += 1;
            continue;
        }
        let priv_start = index + 1;
        let pub_marker = (priv_start..lines.len())
            .find(|&i| lines[i].trim().starts_with("pub:"))
            .ok_or_else(|| {
                BootstrapError::Toolchain(
                    "Key block has a priv: marker but no pub: marker".to_string(),
                )
            })?;
        let block_end = (pub_marker + 1..lines.len())
            .find(|&i| lines[i].contains("Certificate"))
            .unwrap_or(lines.len());
        let private_key = extract_key(&lines[priv_start..pub_marker])?;
        let public_key = extract_key(&lines[pub_marker + 1..block_end])?;
        pairs.push(CertificatePair {
            private_key,
            public_key,
        });
        index = block_end;
    }
    Ok(pairs)
}

fn extract_key(lines: &[&str]) -> Result<String> {
    let key: String = lines
        .iter()
        .flat_map(|line| line.trim().split(':'))
        .map(|part| part.trim())
        .collect();
    if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        let preview: String = key.chars().take(80).collect();
        return Err(BootstrapError::Toolchain(format!(
            "Invalid key material in toolchain output: {:?}",
            preview
        )));
    }
    Ok(key.to_uppercase())
}

/// Mask 64-character hex runs so private keys never reach the logs.
pub fn secure_string(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut result = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_hexdigit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                i += 1;
            }
            if i - start == 64 {
                result.push_str("****");
            } else {
                result.push_str(&text[start..i]);
            }
        } else {
            let start = i;
            while i < bytes.len() && !bytes[i].is_ascii_hexdigit() {
                i += 1;
            }
            result.push_str(&text[start..i]);
        }
    }
    result
}

fn write_der_file(path: &Path, private_key_hex: &str) -> Result<()> {
    let key = hex::decode(private_key_hex).map_err(|e| {
        BootstrapError::Configuration(format!("Private key is not valid hex: {}", e))
    })?;
    if key.len() != 32 {
        return Err(BootstrapError::Configuration(format!(
            "Private key must be 32 bytes, got {}",
            key.len()
        )));
    }
    let mut der = Vec::with_capacity(PKCS8_ED25519_PREFIX.len() + key.len());
    der.extend_from_slice(&PKCS8_ED25519_PREFIX);
    der.extend_from_slice(&key);
    std::fs::write(path, der)?;
    Ok(())
}

fn create_certificate_script(ca_days: u32, node_days: u32) -> String {
    format!(
        r#"set -ex
mkdir -p new_certs
chmod 700 new_certs
touch index.txt.attr
touch index.txt

# Reuse the node private key as the CA private key.
openssl pkey -inform DER -in ca.der -out ca.key.pem
openssl pkey -inform DER -in node.der -out node.key.pem

# Print the CA key pair for verification.
openssl pkey -in ca.key.pem -text -noout
openssl pkey -in ca.key.pem -pubout -out ca.pubkey.pem

# Create the self-signed CA certificate.
openssl req -config ca.cnf -keyform PEM -key ca.key.pem -new -x509 -days {ca_days} -out ca.cert.pem

# Print the node key pair for verification.
openssl pkey -in node.key.pem -text -noout
openssl pkey -in node.key.pem -pubout -out node.pubkey.pem

# Create the node certificate signing request and sign it with the CA.
openssl req -config node.cnf -key node.key.pem -new -out node.csr.pem
openssl ca -config ca.cnf -days {node_days} -cert ca.cert.pem -keyfile ca.key.pem -in node.csr.pem -out node.crt.pem -batch -notext

# Full chain used by the server.
cat node.crt.pem ca.cert.pem > node.full.crt.pem

rm -rf new_certs index.txt* serial.dat* ca.der node.der ca.cnf node.cnf node.csr.pem ca.key.pem 2> /dev/null || true

echo "Certificate Created"
"#
    )
}
