//! YAML configuration.
//!
//! Loaded from `$CENTAURI_CONFIG` when set, otherwise
//! `~/.centauri/config.yaml`, falling back to the relative path
//! `.centauri/config.yaml` when no home directory can be determined.  A
//! missing file is not an error; every option has a flag and flags
//! override config values when non-empty.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const DEFAULT_DATA_PORT: u16 = 5664;
pub const DEFAULT_GOSSIP_PORT: u16 = 5665;
pub const DEFAULT_SERVER_PORT: u16 = 5666;

#[derive(Debug)]
pub enum CfgError {
    Io(std::io::Error),
    Parse(serde_yaml::Error),
}

impl fmt::Display for CfgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CfgError::Io(error) => write!(f, "io error: {error}"),
            CfgError::Parse(error) => write!(f, "config parse error: {error}"),
        }
    }
}

impl std::error::Error for CfgError {}

impl From<std::io::Error> for CfgError {
    fn from(error: std::io::Error) -> Self {
        CfgError::Io(error)
    }
}

impl From<serde_yaml::Error> for CfgError {
    fn from(error: serde_yaml::Error) -> Self {
        CfgError::Parse(error)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerConfig {
    pub name: String,
    pub data_dir: String,
    pub connection_mode: String,
    pub gossip_bind_port: u16,
    pub gossip_advertise_port: u16,
    pub data_bind_port: u16,
    pub data_advertise_port: u16,
    pub advertise_addr: String,
    pub allowed_cidrs: Vec<String>,
    pub server_port: u16,
    pub server_cors: Vec<String>,
    #[serde(rename = "serverTLSCertPath")]
    pub server_tls_cert_path: String,
    #[serde(rename = "serverTLSKeyPath")]
    pub server_tls_key_path: String,
    pub peer_addrs: Vec<String>,
    pub server_auth_token: String,
    pub peer_key: String,
    pub fallback_peer_limit: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub channel: String,
    pub private_key_path: String,
    pub data_dir: String,
    pub server_auth_token: String,
    pub server_addrs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub channel: String,
    pub output: String,
    pub format: String,
    pub private_key_path: String,
    pub server_auth_token: String,
    pub server_addrs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Cfg {
    pub client: ClientConfig,
    pub peer: PeerConfig,
    pub agent: AgentConfig,
}

/// Resolve the config file path: `$CENTAURI_CONFIG`, then
/// `~/.centauri/config.yaml`, then the relative fallback.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CENTAURI_CONFIG") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => PathBuf::from(home).join(".centauri").join("config.yaml"),
        _ => PathBuf::from(".centauri").join("config.yaml"),
    }
}

impl Cfg {
    pub fn load(path: &std::path::Path) -> Result<Cfg, CfgError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    /// Load the resolved config path if it exists; a missing file yields
    /// the default (empty) config.
    pub fn init() -> Result<Cfg, CfgError> {
        let path = config_path();
        if !path.exists() {
            crate::clog!(debug, "cfg: no config file at {}", path.display());
            return Ok(Cfg::default());
        }
        crate::clog!(debug, "cfg: loading {}", path.display());
        Cfg::load(&path)
    }
}

impl PeerConfig {
    /// Apply the port-defaulting rules: advertise ports default to their
    /// bind ports, bind ports to the well-known defaults.
    pub fn normalize(&mut self) {
        if self.data_bind_port == 0 {
            self.data_bind_port = DEFAULT_DATA_PORT;
        }
        if self.gossip_bind_port == 0 {
            self.gossip_bind_port = DEFAULT_GOSSIP_PORT;
        }
        if self.server_port == 0 {
            self.server_port = DEFAULT_SERVER_PORT;
        }
        if self.gossip_advertise_port == 0 {
            self.gossip_advertise_port = self.gossip_bind_port;
        }
        if self.data_advertise_port == 0 {
            self.data_advertise_port = self.data_bind_port;
        }
        if self.fallback_peer_limit == 0 {
            self.fallback_peer_limit = 10;
        }
    }
}
