//! Request classification.

use bridgenotary_core::WorkerConfig;
use bridgenotary_net::Request;
use url::{Origin, Url};

use crate::partition::CacheRole;
use crate::SwError;

/// How an intercepted request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not ours; the host performs its default network handling.
    Passthrough,
    NetworkFirst(CacheRole),
    CacheFirst(CacheRole),
}

/// Classifies first-party requests by path.
#[derive(Debug, Clone)]
pub struct Router {
    origin: Origin,
    api_prefix: String,
    static_suffixes: Vec<String>,
}

impl Router {
    pub fn new(origin: &Url, api_prefix: &str, static_extensions: &[String]) -> Self {
        Self {
            origin: origin.origin(),
            api_prefix: api_prefix.to_string(),
            static_suffixes: static_extensions
                .iter()
                .map(|ext| format!(".{}", ext.trim_start_matches('.')))
                .collect(),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self, SwError> {
        Ok(Self::new(
            &config.origin_url()?,
            &config.api_prefix,
            &config.static_extensions,
        ))
    }

    pub fn route(&self, request: &Request) -> Route {
        self.route_url(&request.url)
    }

    pub fn route_url(&self, url: &Url) -> Route {
        if url.origin() != self.origin {
            return Route::Passthrough;
        }

        let path = url.path();
        if path.starts_with(&self.api_prefix) {
            Route::NetworkFirst(CacheRole::Api)
        } else if self.is_static_asset(path) {
            Route::CacheFirst(CacheRole::Static)
        } else {
            Route::NetworkFirst(CacheRole::Runtime)
        }
    }

    pub fn is_static_asset(&self, path: &str) -> bool {
        self.static_suffixes
            .iter()
            .any(|suffix| path.ends_with(suffix.as_str()))
    }
}
