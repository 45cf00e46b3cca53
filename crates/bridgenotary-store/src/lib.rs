//! # Bridge Notary Store
//!
//! Durable state for the offline worker.
//!
//! ## Features
//!
//! - **Cache partitions**: named request → response caches ([`CacheStorage`])
//! - **Pending queue**: form submissions awaiting replay ([`QueueStore`])
//! - **Backends**: in-memory for tests, SQLite for persistence across restarts
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage (caches)
//!     └── partition name
//!             └── CacheKey (method + URL) → CacheEntry
//!
//! QueueStore (pendingSubmissions)
//!     └── id → PendingSubmission { id, data, timestamp }
//! ```

use thiserror::Error;

pub mod cache;
pub mod database;
pub mod queue;

pub use cache::{CacheEntry, CacheKey, CacheStorage, MemoryCacheStorage, SqliteCacheStorage};
pub use database::Database;
pub use queue::{MemoryQueueStore, Payload, PendingSubmission, QueueStore, SqliteQueueStore};

/// Errors that can occur in storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Constraint error: {0}")]
    ConstraintError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Storage lock poisoned")]
    Poisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
