//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::FreshnessPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory holding the node key and the database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Public URL peers reach this node at
    #[serde(default)]
    pub url: Option<String>,

    /// Pubs to register on start
    #[serde(default)]
    pub bootstrap_pubs: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            url: None,
            bootstrap_pubs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between sync rounds
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Seconds a pub stays fresh after a successful check
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Upper bound on failure backoff
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Timeout for each peer request in milliseconds
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_ms: u64,

    /// Pending announcements held before new ones are dropped
    #[serde(default = "default_announce_queue")]
    pub announce_queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            check_interval_secs: default_check_interval(),
            max_backoff_secs: default_max_backoff(),
            peer_timeout_ms: default_peer_timeout(),
            announce_queue_capacity: default_announce_queue(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn freshness(&self) -> FreshnessPolicy {
        FreshnessPolicy::new(
            Duration::from_secs(self.check_interval_secs),
            Duration::from_secs(self.max_backoff_secs),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Database file name, relative to the data directory
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            db_file: default_db_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP port serving the peer wire surface
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
        }
    }
}

// Defaults
fn default_data_dir() -> PathBuf { PathBuf::from("./data") }
fn default_sync_interval() -> u64 { 10 }
fn default_check_interval() -> u64 { 10 }
fn default_max_backoff() -> u64 { 3600 }
fn default_peer_timeout() -> u64 { 5000 }
fn default_announce_queue() -> usize { 64 }
fn default_backend() -> StorageBackend { StorageBackend::Sqlite }
fn default_db_file() -> String { "mark.db".to_string() }
fn default_http_port() -> u16 { 8080 }

impl Config {
    /// Read `path` as TOML, or fall back to defaults when it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn key_path(&self) -> PathBuf {
        self.node.data_dir.join("node.key")
    }

    pub fn db_path(&self) -> PathBuf {
        self.node.data_dir.join(&self.storage.db_file)
    }

    /// URL advertised to peers, defaulting to localhost on the API port.
    pub fn public_url(&self) -> String {
        self.node
            .url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.api.http_port))
    }
}
