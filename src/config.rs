//! Application configuration
//!
//! Every path and tool invocation a component needs is named here and passed
//! in at construction. Nothing reads ambient global settings.

use crate::census::SocketTableFormat;
use crate::utils::{get_data_dir, get_state_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";
const SNAPSHOT_FILE: &str = "firewall_snapshot.json";
const LOG_FILE: &str = "hostwall.log";
const AUDIT_FILE: &str = "audit.log";

/// Upper bound for a single gateway call
pub const MAX_COMMAND_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Single-slot snapshot file (default: state dir)
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    /// Tracing output (default: state dir, stderr if unwritable)
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// JSON-lines audit trail of mutating operations
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
    /// Timeout in seconds for a single iptables/ss invocation (clamped to 1..=600)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Program plus leading arguments used for IPv4 rules
    #[serde(default = "default_iptables_command")]
    pub iptables_command: Vec<String>,
    /// Program plus leading arguments used for IPv6 rules
    #[serde(default = "default_ip6tables_command")]
    pub ip6tables_command: Vec<String>,
    /// Socket table tool override; autodetects `ss` then `netstat` when unset
    #[serde(default)]
    pub socket_command: Option<Vec<String>>,
    /// Output format of `socket_command`; required to parse an override
    #[serde(default)]
    pub socket_format: Option<SocketTableFormat>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            log_path: None,
            audit_log_path: None,
            command_timeout_secs: default_command_timeout(),
            iptables_command: default_iptables_command(),
            ip6tables_command: default_ip6tables_command(),
            socket_command: None,
            socket_format: None,
        }
    }
}

fn default_command_timeout() -> u64 {
    30
}

fn default_iptables_command() -> Vec<String> {
    vec!["iptables".to_string()]
}

fn default_ip6tables_command() -> Vec<String> {
    vec!["ip6tables".to_string()]
}

fn state_file(name: &str) -> PathBuf {
    get_state_dir().map_or_else(|| PathBuf::from(name), |dir| dir.join(name))
}

impl AppConfig {
    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot_path
            .clone()
            .unwrap_or_else(|| state_file(SNAPSHOT_FILE))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_path.clone().unwrap_or_else(|| state_file(LOG_FILE))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.audit_log_path
            .clone()
            .unwrap_or_else(|| state_file(AUDIT_FILE))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.clamp(1, MAX_COMMAND_TIMEOUT_SECS))
    }
}

/// Default location of the configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Saves the config using the atomic write pattern (temp file → rename, 0o600).
///
/// # Errors
///
/// Returns `Err` if serialization or the write fails, or if no path was given
/// and the data directory cannot be determined.
pub async fn save_config(config: &AppConfig, path: Option<&Path>) -> std::io::Result<()> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "Data directory not found")
        })?,
    };
    let json = serde_json::to_string_pretty(config)?;

    tokio::task::spawn_blocking(move || crate::utils::write_atomic(&path, json.as_bytes()))
        .await
        .map_err(std::io::Error::other)?
}

/// A config file that exists but cannot be used
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is not a valid configuration: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Loads the config from `path` (or the default location).
///
/// A missing file yields the defaults.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed;
/// the caller decides whether to fall back to defaults.
pub async fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
        return Ok(AppConfig::default());
    };

    match tokio::fs::read_to_string(&path).await {
        Ok(json) => {
            serde_json::from_str(&json).map_err(|source| ConfigError::Parse { path, source })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Read { path, source }),
    }
}
