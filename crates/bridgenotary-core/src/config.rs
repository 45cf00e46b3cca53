//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{BridgeError, BridgeResult};

/// Offline worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin of the application; requests to any other origin pass through
    pub origin: String,

    /// Namespace prefix shared by every cache partition name
    pub cache_prefix: String,

    /// Cache version; bumping it retires all three partitions at once
    pub cache_version: String,

    /// Shell resources cached at install time
    pub precache: Vec<String>,

    /// Path prefix of the API namespace
    pub api_prefix: String,

    /// File extensions served cache-first from the static partition
    pub static_extensions: Vec<String>,

    /// Path of the relay endpoint accepting form submissions
    pub relay_path: String,

    /// Background sync tag that triggers a queue drain
    pub sync_tag: String,

    /// Directory holding the cache and queue databases
    pub data_dir: PathBuf,

    /// Upper bound for a live fetch, in seconds (none by default)
    pub network_timeout_secs: Option<u64>,

    /// Expiration for the static partition
    pub static_expiration: ExpirationConfig,

    /// Expiration for the runtime partition
    pub runtime_expiration: ExpirationConfig,

    /// Expiration for the api partition
    pub api_expiration: ExpirationConfig,
}

/// Optional expiration limits for one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
    /// Maximum number of entries kept
    pub max_entries: Option<usize>,

    /// Maximum entry age in seconds
    pub max_age_secs: Option<u64>,
}

impl ExpirationConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:5173".to_string(),
            cache_prefix: "bridgenotary".to_string(),
            cache_version: "v1".to_string(),
            precache: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
            ],
            api_prefix: "/api/".to_string(),
            static_extensions: ["png", "jpg", "jpeg", "svg", "gif", "webp", "css", "js"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            relay_path: "/api/request-form".to_string(),
            sync_tag: "sync-forms".to_string(),
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("bridgenotary"),
            network_timeout_secs: None,
            static_expiration: ExpirationConfig::default(),
            runtime_expiration: ExpirationConfig::default(),
            api_expiration: ExpirationConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> BridgeResult<()> {
        self.origin_url()?;
        if self.cache_prefix.is_empty() {
            return Err(BridgeError::config("cache_prefix must not be empty"));
        }
        if self.cache_version.is_empty() {
            return Err(BridgeError::config("cache_version must not be empty"));
        }
        if !self.api_prefix.starts_with('/') {
            return Err(BridgeError::config(format!(
                "api_prefix must start with '/': {}",
                self.api_prefix
            )));
        }
        if !self.relay_path.starts_with('/') {
            return Err(BridgeError::config(format!(
                "relay_path must start with '/': {}",
                self.relay_path
            )));
        }
        Ok(())
    }

    /// The application origin as a URL.
    pub fn origin_url(&self) -> BridgeResult<Url> {
        let url = Url::parse(&self.origin)?;
        if url.cannot_be_a_base() {
            return Err(BridgeError::config(format!("invalid origin: {}", self.origin)));
        }
        Ok(url)
    }

    /// Absolute URL of the relay endpoint.
    pub fn relay_url(&self) -> BridgeResult<Url> {
        Ok(self.origin_url()?.join(&self.relay_path)?)
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout_secs.map(Duration::from_secs)
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.data_dir.join("queue.db")
    }

    pub fn cache_db_path(&self) -> PathBuf {
        self.data_dir.join("caches.db")
    }
}
