//! Versioned cache partition names and their expiration policies.

use bridgenotary_core::{ExpirationConfig, WorkerConfig};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Logical role of a cache partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheRole {
    /// App shell and content-hashed assets.
    Static,
    /// Documents and navigations.
    Runtime,
    /// Responses from the API namespace.
    Api,
}

impl CacheRole {
    pub const ALL: [CacheRole; 3] = [CacheRole::Static, CacheRole::Runtime, CacheRole::Api];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheRole::Static => "static",
            CacheRole::Runtime => "runtime",
            CacheRole::Api => "api",
        }
    }
}

impl fmt::Display for CacheRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expiration limits for one partition. The default never expires anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirationPolicy {
    pub max_entries: Option<usize>,
    pub max_age: Option<Duration>,
}

impl ExpirationPolicy {
    pub fn is_expired(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let Some(max_age) = self.max_age else {
            return false;
        };
        now.signed_duration_since(cached_at)
            .to_std()
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}

impl From<&ExpirationConfig> for ExpirationPolicy {
    fn from(config: &ExpirationConfig) -> Self {
        Self {
            max_entries: config.max_entries,
            max_age: config.max_age(),
        }
    }
}

/// One current cache partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub role: CacheRole,
    pub name: String,
    pub expiration: ExpirationPolicy,
}

/// The three partitions of the current cache version.
#[derive(Debug, Clone)]
pub struct PartitionSet {
    prefix: String,
    version: String,
    partitions: [Partition; 3],
}

impl PartitionSet {
    pub fn new(prefix: &str, version: &str) -> Self {
        let partitions = CacheRole::ALL.map(|role| Partition {
            role,
            name: format!("{prefix}-{role}-{version}"),
            expiration: ExpirationPolicy::default(),
        });
        Self {
            prefix: prefix.to_string(),
            version: version.to_string(),
            partitions,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(&config.cache_prefix, &config.cache_version)
            .with_expiration(CacheRole::Static, (&config.static_expiration).into())
            .with_expiration(CacheRole::Runtime, (&config.runtime_expiration).into())
            .with_expiration(CacheRole::Api, (&config.api_expiration).into())
    }

    pub fn with_expiration(mut self, role: CacheRole, policy: ExpirationPolicy) -> Self {
        self.slot_mut(role).expiration = policy;
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn get(&self, role: CacheRole) -> &Partition {
        &self.partitions[Self::index(role)]
    }

    pub fn names(&self) -> Vec<&str> {
        self.partitions.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn is_current(&self, name: &str) -> bool {
        self.partitions.iter().any(|p| p.name == name)
    }

    /// Belongs to this application's namespace but not to the current version.
    pub fn is_stale(&self, name: &str) -> bool {
        name.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.starts_with('-'))
            && !self.is_current(name)
    }

    fn slot_mut(&mut self, role: CacheRole) -> &mut Partition {
        &mut self.partitions[Self::index(role)]
    }

    fn index(role: CacheRole) -> usize {
        match role {
            CacheRole::Static => 0,
            CacheRole::Runtime => 1,
            CacheRole::Api => 2,
        }
    }
}
