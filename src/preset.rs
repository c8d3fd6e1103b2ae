//! Preset model: the declarative input describing a node fleet.
//!
//! A preset is plain YAML. Every field has a default so partial presets stay
//! valid; collections default to empty and images to the stock distribution.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compose::ServiceOverrides;
use crate::error::Result;

/// Whether (and how) a service port is published on the host.
///
/// Accepts booleans, numbers and strings; openness follows script-style
/// truthiness, so `0`, `false` and `""` all mean closed while any non-empty
/// string (including `"false"`) means open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpenPort {
    Bool(bool),
    Number(u16),
    Text(String),
}

impl OpenPort {
    pub fn is_open(&self) -> bool {
        match self {
            OpenPort::Bool(b) => *b,
            OpenPort::Number(n) => *n != 0,
            OpenPort::Text(s) => !s.is_empty(),
        }
    }
}

/// Settings every service class shares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_port: Option<OpenPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_mode: Option<bool>,
    /// Raw service fragment merged in last, field by field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose: Option<ServiceOverrides>,
    #[serde(default)]
    pub exclude: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabasePreset {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    #[serde(flatten)]
    pub settings: ServiceSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePreset {
    pub name: String,
    /// Database this node persists through; adds a startup dependency edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_host: Option<String>,
    /// When set, a broker companion service is emitted under this name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<ServiceSettings>,
    /// Enrolling in a reward program emits a monitoring agent companion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward_program: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<ServiceSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_port: Option<u16>,
    #[serde(flatten)]
    pub settings: ServiceSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPreset {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_host: Option<String>,
    #[serde(flatten)]
    pub settings: ServiceSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyPreset {
    pub name: String,
    /// Explicit `host -> upstream` mapping; derived from the first gateway
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_socket: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_names_hash_bucket_size: Option<u32>,
    #[serde(flatten)]
    pub settings: ServiceSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletPreset {
    pub name: String,
    #[serde(flatten)]
    pub settings: ServiceSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplorerPreset {
    pub name: String,
    #[serde(flatten)]
    pub settings: ServiceSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaucetPreset {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(flatten)]
    pub settings: ServiceSettings,
}

/// Full deployment preset. All fields are optional in the YAML source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct Preset {
    pub compose_version: String,
    pub database_image: String,
    pub node_image: String,
    pub gateway_image: String,
    pub proxy_image: String,
    pub wallet_image: String,
    pub explorer_image: String,
    pub faucet_image: String,
    pub agent_image: String,
    pub database_name: String,
    /// Extra arguments appended to the database server command line.
    pub database_run_param: String,
    pub app_folder: String,
    pub data_directory: String,
    pub service_restart: String,
    /// Fleet-wide debug switch; per-service `debugMode` can opt out or in.
    pub debug_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency_mosaic_id: Option<String>,
    pub agent_port: u16,
    pub ca_certificate_expiration_in_days: u32,
    pub node_certificate_expiration_in_days: u32,
    pub certificate_expiration_warning_in_days: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<DatabasePreset>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodePreset>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<GatewayPreset>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub https_proxies: Vec<ProxyPreset>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wallets: Vec<WalletPreset>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub explorers: Vec<ExplorerPreset>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub faucets: Vec<FaucetPreset>,
}

impl Default for Preset {
    fn default() -> Self {
        Self {
            compose_version: "2.4".to_string(),
            database_image: "mongo:4.4.3-bionic".to_string(),
            node_image: "chainops/server:latest".to_string(),
            gateway_image: "chainops/rest-gateway:latest".to_string(),
            proxy_image: "steveltn/https-portal:1".to_string(),
            wallet_image: "chainops/wallet:latest".to_string(),
            explorer_image: "chainops/explorer:latest".to_string(),
            faucet_image: "chainops/faucet:latest".to_string(),
            agent_image: "chainops/agent:latest".to_string(),
            database_name: "catapult".to_string(),
            database_run_param: String::new(),
            app_folder: "/usr/node".to_string(),
            data_directory: "./data".to_string(),
            service_restart: "unless-stopped".to_string(),
            debug_mode: false,
            subnet: None,
            currency_mosaic_id: None,
            agent_port: 7880,
            ca_certificate_expiration_in_days: 7300,
            node_certificate_expiration_in_days: 375,
            certificate_expiration_warning_in_days: 30,
            databases: Vec::new(),
            nodes: Vec::new(),
            gateways: Vec::new(),
            https_proxies: Vec::new(),
            wallets: Vec::new(),
            explorers: Vec::new(),
            faucets: Vec::new(),
        }
    }
}

impl Preset {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}
