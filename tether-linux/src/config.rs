//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tether_core::connection::BackoffPolicy;
use tether_core::storage::ReclaimOrder;
use tether_core::transfer::{IntegrityPolicy, TransferLimits};

/// Daemon configuration. File: ~/.config/tether/config.toml or /etc/tether/config.toml.
/// Env overrides: TETHER_SERVER_URL, TETHER_STORAGE_DIR, TETHER_INTERFACE, TETHER_MAC, TETHER_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Control link base URL; the node ID is appended (default ws://127.0.0.1:8000/ws/).
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Node ID prefix (default "esp32-s3-").
    #[serde(default = "default_node_prefix")]
    pub node_prefix: String,
    /// Network interface whose hardware address identifies the device (default eth0).
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Fixed MAC instead of reading the interface.
    #[serde(default)]
    pub mac: Option<String>,
    /// Directory holding stored files.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Storage capacity in bytes (default 16 MiB).
    #[serde(default = "default_capacity")]
    pub storage_capacity: u64,
    #[serde(default)]
    pub reclaim_order: ReclaimSetting,
    /// Largest accepted transfer in bytes (default 8 MiB).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub integrity: IntegritySetting,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffSetting,
    /// Cap for exponential backoff.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// A transfer that moves no bytes for this long is failed.
    #[serde(default = "default_transfer_idle_secs")]
    pub transfer_idle_timeout_secs: u64,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
    #[serde(default = "default_outbound_depth")]
    pub outbound_depth: usize,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Log filter when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReclaimSetting {
    #[default]
    OldestFirst,
    Enumeration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegritySetting {
    #[default]
    Reject,
    Warn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffSetting {
    #[default]
    Fixed,
    Exponential,
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8000/ws/".to_string()
}
fn default_node_prefix() -> String {
    tether_core::identity::DEFAULT_NODE_PREFIX.to_string()
}
fn default_interface() -> String {
    "eth0".to_string()
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/tether/files")
}
fn default_capacity() -> u64 {
    16 * 1024 * 1024
}
fn default_max_file_size() -> u64 {
    tether_core::transfer::DEFAULT_MAX_FILE_SIZE
}
fn default_chunk_size() -> usize {
    tether_core::transfer::DEFAULT_CHUNK_SIZE
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_reconnect_secs() -> u64 {
    5
}
fn default_max_attempts() -> u32 {
    tether_core::connection::DEFAULT_MAX_ATTEMPTS
}
fn default_backoff_max_secs() -> u64 {
    60
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_transfer_idle_secs() -> u64 {
    30
}
fn default_queue_depth() -> usize {
    8
}
fn default_enqueue_timeout_ms() -> u64 {
    10
}
fn default_outbound_depth() -> usize {
    32
}
fn default_send_timeout_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            node_prefix: default_node_prefix(),
            interface: default_interface(),
            mac: None,
            storage_dir: default_storage_dir(),
            storage_capacity: default_capacity(),
            reclaim_order: ReclaimSetting::default(),
            max_file_size: default_max_file_size(),
            chunk_size: default_chunk_size(),
            integrity: IntegritySetting::default(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            reconnect_interval_secs: default_reconnect_secs(),
            max_reconnect_attempts: default_max_attempts(),
            backoff: BackoffSetting::default(),
            backoff_max_secs: default_backoff_max_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            transfer_idle_timeout_secs: default_transfer_idle_secs(),
            queue_depth: default_queue_depth(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            outbound_depth: default_outbound_depth(),
            send_timeout_secs: default_send_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn transfer_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_idle_timeout_secs.max(1))
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        let base = Duration::from_secs(self.reconnect_interval_secs.max(1));
        match self.backoff {
            BackoffSetting::Fixed => BackoffPolicy::Fixed(base),
            BackoffSetting::Exponential => BackoffPolicy::Exponential {
                base,
                max: Duration::from_secs(self.backoff_max_secs).max(base),
            },
        }
    }

    pub fn reclaim(&self) -> ReclaimOrder {
        match self.reclaim_order {
            ReclaimSetting::OldestFirst => ReclaimOrder::OldestFirst,
            ReclaimSetting::Enumeration => ReclaimOrder::Enumeration,
        }
    }

    pub fn transfer_limits(&self) -> TransferLimits {
        TransferLimits {
            max_file_size: self.max_file_size,
            chunk_size: self.chunk_size.max(1),
            integrity: match self.integrity {
                IntegritySetting::Reject => IntegrityPolicy::Reject,
                IntegritySetting::Warn => IntegrityPolicy::Warn,
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: default, then the first config file found, then env vars.
/// A config file that exists but does not parse is an error.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("TETHER_SERVER_URL") {
        c.server_url = s;
    }
    if let Some(s) = var("TETHER_STORAGE_DIR") {
        c.storage_dir = PathBuf::from(s);
    }
    if let Some(s) = var("TETHER_INTERFACE") {
        c.interface = s;
    }
    if let Some(s) = var("TETHER_MAC") {
        c.mac = Some(s);
    }
    if let Some(s) = var("TETHER_LOG") {
        c.log_level = s;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tether/config.toml"));
    }
    out.push(PathBuf::from("/etc/tether/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}
