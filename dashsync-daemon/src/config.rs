//! Daemon settings read from `DASHSYNC_*` environment variables.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use dashsync_core::DEFAULT_BACKUP_CADENCE;
use dashsync_server::ServerConfig;

const DEFAULT_SWEEP_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub bind_addr: String,
    /// RocksDB directory; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// `token=user,token=user`
    pub tokens: String,
    pub backup_cadence: u64,
    pub sweep_interval: Duration,
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidNumber { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNumber { var, value } => {
                write!(f, "{var} must be a non-negative integer, got '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for DaemonConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            bind_addr: server.bind_addr,
            data_dir: None,
            tokens: String::new(),
            backup_cadence: DEFAULT_BACKUP_CADENCE,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_SECS),
            broadcast_capacity: server.broadcast_capacity,
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build from an explicit variable map. Unset or blank variables keep
    /// their defaults.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            vars.get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(bind) = get("DASHSYNC_BIND") {
            config.bind_addr = bind;
        }
        config.data_dir = get("DASHSYNC_DATA_DIR").map(PathBuf::from);
        if let Some(tokens) = get("DASHSYNC_TOKENS") {
            config.tokens = tokens;
        }
        if let Some(v) = get("DASHSYNC_BACKUP_CADENCE") {
            config.backup_cadence = number("DASHSYNC_BACKUP_CADENCE", &v)?;
        }
        if let Some(v) = get("DASHSYNC_SWEEP_SECS") {
            config.sweep_interval = Duration::from_secs(number("DASHSYNC_SWEEP_SECS", &v)?.max(1));
        }
        if let Some(v) = get("DASHSYNC_BROADCAST_CAPACITY") {
            config.broadcast_capacity = number("DASHSYNC_BROADCAST_CAPACITY", &v)? as usize;
        }

        Ok(config)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr.clone(),
            broadcast_capacity: self.broadcast_capacity,
        }
    }
}

fn number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::from_vars(HashMap::new()).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert!(config.data_dir.is_none());
        assert_eq!(config.sweep_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_overrides() {
        let config = DaemonConfig::from_vars(vars(&[
            ("DASHSYNC_BIND", "0.0.0.0:7000"),
            ("DASHSYNC_DATA_DIR", "/var/lib/dashsync"),
            ("DASHSYNC_TOKENS", "t1=alice"),
            ("DASHSYNC_BACKUP_CADENCE", "5"),
            ("DASHSYNC_SWEEP_SECS", "60"),
            ("DASHSYNC_BROADCAST_CAPACITY", "32"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/dashsync")));
        assert_eq!(config.tokens, "t1=alice");
        assert_eq!(config.backup_cadence, 5);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.server_config().broadcast_capacity, 32);
    }

    #[test]
    fn test_blank_values_keep_defaults() {
        let config = DaemonConfig::from_vars(vars(&[("DASHSYNC_DATA_DIR", "  ")])).unwrap();
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_invalid_number() {
        let err = DaemonConfig::from_vars(vars(&[("DASHSYNC_SWEEP_SECS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                var: "DASHSYNC_SWEEP_SECS",
                value: "soon".into()
            }
        );
    }
}
