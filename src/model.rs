//! Shared data model for certificate lifecycle and topology compilation.

use serde::{Deserialize, Serialize};

/// One ed25519 key pair as 64-character uppercase hex strings.
///
/// Outside of preset input and test fixtures, values are produced only by the
/// PKI toolchain output parser, which normalizes case and validates length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificatePair {
    pub private_key: String,
    pub public_key: String,
}

/// The identity (main) and network-transport key pairs a node must present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCertificates {
    pub main: CertificatePair,
    pub transport: CertificatePair,
}

/// Durable record of which keys and schema version produced the installed
/// certificate. Written wholesale at the end of every successful generation,
/// read at the start of every lifecycle decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateMetadata {
    pub version: u32,
    pub main_public_key: String,
    pub transport_public_key: String,
}

/// Result of a single expiration probe. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationReport {
    pub will_expire: bool,
    pub expiration_date: String,
}

/// Generated account keys, consumed read-only by the topology compiler to
/// derive the faucet private key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBook {
    #[serde(default)]
    pub mosaics: Vec<MosaicAddresses>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MosaicAddresses {
    #[serde(default)]
    pub accounts: Vec<AccountKeys>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountKeys {
    pub private_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl AddressBook {
    /// Load an address book from a YAML file.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// The first mosaic's first account private key, if any.
    pub fn main_account_private_key(&self) -> Option<&str> {
        self.mosaics
            .first()
            .and_then(|m| m.accounts.first())
            .map(|a| a.private_key.as_str())
    }
}
