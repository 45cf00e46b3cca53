//! Bridge Notary Core
//!
//! This crate provides shared configuration, errors, and logging setup for the
//! offline worker crates.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{ExpirationConfig, WorkerConfig};
pub use error::{BridgeError, BridgeResult};
pub use logging::{init_logging, LogConfig, LogFormat};
