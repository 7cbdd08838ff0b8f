//! Application configuration
//!
//! Stored as `config.json` in the XDG data directory. A missing file means
//! defaults; a malformed one is an error rather than a silent reset, since
//! it selects which firewall engine gets mutated.

use crate::backend::RetryPolicy;
use crate::utils::{get_data_dir, write_atomic};
use crate::validators::validate_object_name;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration loading and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("No data directory available; pass --config explicitly")]
    NoDataDir,
}

/// Firewall engine selection
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackendKind {
    /// Probe for `nft`, then `iptables`
    #[default]
    Auto,
    Nftables,
    Iptables,
    /// In-process engine; nothing reaches the host firewall
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendKind,
    /// Catalogue file; defaults to `catalogue.json` in the data directory
    pub catalogue_path: Option<PathBuf>,
    /// Bound on every backend call
    pub call_timeout_secs: u64,
    /// Total tries for transient backend failures
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub nft_table: String,
    pub iptables_chain: String,
    pub nft_persist_path: PathBuf,
    pub iptables_persist_v4: PathBuf,
    pub iptables_persist_v6: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            catalogue_path: None,
            call_timeout_secs: 5,
            retry_attempts: 3,
            retry_base_delay_ms: 100,
            nft_table: "hostfw".to_string(),
            iptables_chain: "HOSTFW".to_string(),
            nft_persist_path: PathBuf::from("/etc/nftables.d/hostfw.nft"),
            iptables_persist_v4: PathBuf::from("/etc/iptables/rules.v4"),
            iptables_persist_v6: PathBuf::from("/etc/iptables/rules.v6"),
        }
    }
}

impl AppConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }

    /// Resolved catalogue location
    pub fn catalogue_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.catalogue_path {
            Some(path) => Ok(path.clone()),
            None => get_data_dir()
                .map(|dir| dir.join("catalogue.json"))
                .ok_or(ConfigError::NoDataDir),
        }
    }

    /// Checks ranges and names that end up on backend command lines.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=300).contains(&self.call_timeout_secs) {
            return Err(ConfigError::Invalid {
                field: "call_timeout_secs",
                message: "must be between 1 and 300".to_string(),
            });
        }
        if !(1..=10).contains(&self.retry_attempts) {
            return Err(ConfigError::Invalid {
                field: "retry_attempts",
                message: "must be between 1 and 10".to_string(),
            });
        }
        if self.retry_base_delay_ms > 10_000 {
            return Err(ConfigError::Invalid {
                field: "retry_base_delay_ms",
                message: "must be at most 10000".to_string(),
            });
        }
        validate_object_name(&self.nft_table, 32).map_err(|message| ConfigError::Invalid {
            field: "nft_table",
            message,
        })?;
        // iptables chain names are limited to 28 characters
        validate_object_name(&self.iptables_chain, 28).map_err(|message| {
            ConfigError::Invalid {
                field: "iptables_chain",
                message,
            }
        })?;
        Ok(())
    }
}

/// Default location of the configuration file
pub fn default_config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join("config.json"))
}

/// Loads the configuration, or returns defaults if the file does not exist.
pub async fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AppConfig::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let config: AppConfig = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

/// Saves the configuration using an atomic write with mode 0o600.
pub async fn save_config(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    write_atomic(path, json.as_bytes()).await
}
