//! TOML-backed daemon configuration: which transports to bind and the
//! session/task timeouts to run with.

use std::net::SocketAddr;
use std::path::Path;

use dinoc_core::error::{Error, ErrorKind, Result};
use serde::Deserialize;

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_jitter_secs() -> u64 {
    0
}

fn default_sweep_period_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    pub bind: SocketAddr,
    pub zone: String,
}

/// Which transports to bind on startup. Any combination may be omitted;
/// a daemon with no transports configured still runs, just idle.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TransportsConfig {
    pub tcp: Option<SocketAddr>,
    pub udp: Option<SocketAddr>,
    pub ws: Option<SocketAddr>,
    pub icmp: Option<SocketAddr>,
    pub dns: Option<DnsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub transports: TransportsConfig,
    /// Default heartbeat cadence for agents that don't request their own in
    /// registration.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_jitter_secs")]
    pub heartbeat_jitter_secs: u64,
    #[serde(default = "default_sweep_period_secs")]
    pub heartbeat_sweep_period_secs: u64,
    #[serde(default = "default_sweep_period_secs")]
    pub task_sweep_period_secs: u64,
    /// Hex-encoded 32-byte pre-shared AEAD key. `--shared-key` on the command
    /// line takes precedence when both are given.
    #[serde(default)]
    pub shared_key_hex: Option<String>,
}

impl ServerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| Error::new(ErrorKind::InvalidArgument, err.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transports: TransportsConfig::default(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_jitter_secs: default_heartbeat_jitter_secs(),
            heartbeat_sweep_period_secs: default_sweep_period_secs(),
            task_sweep_period_secs: default_sweep_period_secs(),
            shared_key_hex: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
            [transports]
            tcp = "0.0.0.0:4444"
        "#;
        let config = ServerConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.heartbeat_jitter_secs, 0);
        assert!(config.transports.tcp.is_some());
        assert!(config.transports.dns.is_none());
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(ServerConfig::from_toml_str("not = [valid").is_err());
    }
}
