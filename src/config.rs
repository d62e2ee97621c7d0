// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Service configuration — /etc/wolfmaint/config.toml

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wolfmaint/config.toml";

/// A Proxmox cluster reachable through one API endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Identifier used in API paths
    pub id: String,
    pub address: String,
    #[serde(default = "default_pve_port")]
    pub port: u16,
    /// PVEAPIToken string
    pub token: String,
}

/// An API user; only the SHA-256 of the token is stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub token_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_state_file")]
    pub state_file: String,

    // ── PVE client timeouts ──
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_migrate_timeout")]
    pub migrate_timeout_secs: u64,

    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,

    #[serde(default)]
    pub users: Vec<UserConfig>,
}

fn default_pve_port() -> u16 { 8006 }
fn default_sweep_interval() -> u64 { 300 }
fn default_state_file() -> String { "/etc/wolfmaint/state.json".to_string() }
fn default_request_timeout() -> u64 { 10 }
fn default_migrate_timeout() -> u64 { 60 }

impl Default for Config {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            state_file: default_state_file(),
            request_timeout_secs: default_request_timeout(),
            migrate_timeout_secs: default_migrate_timeout(),
            clusters: Vec::new(),
            users: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from disk; a missing or unparsable file yields defaults
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(data) => Self::parse(&data).unwrap_or_else(|e| {
                warn!("Invalid config {}: {} — using defaults", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                warn!("Cannot read config {}: {} — using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn parse(data: &str) -> Result<Self, toml::de::Error> {
        let mut config: Config = toml::from_str(data)?;
        // Zero would spin the sweep timer
        if config.sweep_interval_secs == 0 {
            config.sweep_interval_secs = default_sweep_interval();
        }
        Ok(config)
    }
}
