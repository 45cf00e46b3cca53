//! Network-first and cache-first strategies.
//!
//! Both entry points always produce a response: transport failures, non-2xx
//! statuses and cache errors end in a cached copy or [`offline_response`].

use std::sync::Arc;
use std::time::Duration;

use bridgenotary_net::{Fetcher, NetError, Request, Response};
use bridgenotary_store::{CacheEntry, CacheKey, CacheStorage};
use chrono::Utc;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::partition::Partition;

/// Body of the synthetic response served when nothing else is available.
pub const OFFLINE_BODY: &str = "Offline - Resource not available";

/// The synthetic 503 response.
pub fn offline_response(url: Url) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Response::new(url, StatusCode::SERVICE_UNAVAILABLE, headers, OFFLINE_BODY)
}

/// Cache key for a request; the fragment never reaches the network and is
/// not part of the identity.
pub fn cache_key(request: &Request) -> CacheKey {
    let mut url = request.url.clone();
    url.set_fragment(None);
    CacheKey::new(request.method.as_str(), url.as_str())
}

/// Only GET responses are stored or served from a partition. Replaying a
/// cached answer to a write would acknowledge a write that never happened.
fn is_cacheable(request: &Request) -> bool {
    request.method == Method::GET
}

/// Shared handles the strategies mediate between.
#[derive(Clone)]
pub struct Strategies {
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<dyn CacheStorage>,
    network_timeout: Option<Duration>,
    shell: Option<Partition>,
}

impl Strategies {
    pub fn new(fetcher: Arc<dyn Fetcher>, caches: Arc<dyn CacheStorage>) -> Self {
        Self {
            fetcher,
            caches,
            network_timeout: None,
            shell: None,
        }
    }

    /// Partition holding the pre-cached app shell. Network-first misses fall
    /// back to it before giving up.
    pub fn with_shell(mut self, partition: Partition) -> Self {
        self.shell = Some(partition);
        self
    }

    /// Bound every live fetch; an elapsed timeout counts as a transport failure.
    pub fn with_network_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.network_timeout = timeout;
        self
    }

    /// Live data first, cached copy on failure, 503 when neither exists.
    pub async fn network_first(&self, partition: &Partition, request: Request) -> Response {
        let key = cache_key(&request);
        let cacheable = is_cacheable(&request);
        let url = request.url.clone();

        if let Some(response) = self.fetch_live(request).await {
            if cacheable {
                self.store(partition, &key, &response).await;
            }
            return response;
        }

        if cacheable {
            if let Some(cached) = self.lookup(partition, &key, &url).await {
                debug!(partition = %partition.name, key = %key, "Serving cached copy");
                return cached;
            }
            if let Some(shell) = self.shell.as_ref().filter(|s| s.name != partition.name) {
                if let Some(cached) = self.lookup(shell, &key, &url).await {
                    debug!(partition = %shell.name, key = %key, "Serving pre-cached shell");
                    return cached;
                }
            }
        }

        warn!(partition = %partition.name, key = %key, "No network and no cached copy");
        offline_response(url)
    }

    /// Cached copy first, live fetch on a miss, 503 when the fetch fails.
    pub async fn cache_first(&self, partition: &Partition, request: Request) -> Response {
        let key = cache_key(&request);
        let cacheable = is_cacheable(&request);
        let url = request.url.clone();

        if cacheable {
            if let Some(cached) = self.lookup(partition, &key, &url).await {
                debug!(partition = %partition.name, key = %key, "Cache hit");
                return cached;
            }
            debug!(partition = %partition.name, key = %key, "Cache miss");
        }

        match self.fetch_live(request).await {
            Some(response) => {
                if cacheable {
                    self.store(partition, &key, &response).await;
                }
                response
            }
            None => {
                warn!(partition = %partition.name, key = %key, "Fetch failed, serving offline response");
                offline_response(url)
            }
        }
    }

    /// A successful (2xx) live response, or `None` for any kind of failure.
    async fn fetch_live(&self, request: Request) -> Option<Response> {
        let url = request.url.clone();
        let fetch = self.fetcher.fetch(request);
        let result = match self.network_timeout {
            Some(timeout) => tokio::time::timeout(timeout, fetch)
                .await
                .unwrap_or(Err(NetError::Timeout(timeout))),
            None => fetch.await,
        };

        match result {
            Ok(response) if response.ok() => Some(response),
            Ok(response) => {
                debug!(url = %url, status = %response.status, "Non-success status");
                None
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Network fetch failed");
                None
            }
        }
    }

    async fn lookup(&self, partition: &Partition, key: &CacheKey, url: &Url) -> Option<Response> {
        let entry = match self.caches.match_entry(&partition.name, key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(partition = %partition.name, key = %key, error = %e, "Cache read failed");
                return None;
            }
        };

        if partition.expiration.is_expired(entry.cached_at, Utc::now()) {
            debug!(partition = %partition.name, key = %key, "Cached copy expired");
            if let Err(e) = self.caches.remove(&partition.name, key).await {
                warn!(partition = %partition.name, key = %key, error = %e, "Eviction failed");
            }
            return None;
        }

        Some(response_from_entry(entry, url.clone()))
    }

    async fn store(&self, partition: &Partition, key: &CacheKey, response: &Response) {
        let entry = entry_from_response(key.clone(), response);
        if let Err(e) = self.caches.put(&partition.name, entry).await {
            warn!(partition = %partition.name, key = %key, error = %e, "Cache write failed");
            return;
        }

        if let Some(max_entries) = partition.expiration.max_entries {
            match self.caches.trim(&partition.name, max_entries).await {
                Ok(0) => {}
                Ok(evicted) => debug!(partition = %partition.name, evicted, "Trimmed partition"),
                Err(e) => warn!(partition = %partition.name, error = %e, "Trim failed"),
            }
        }
    }
}

pub(crate) fn entry_from_response(key: CacheKey, response: &Response) -> CacheEntry {
    let headers = response
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    CacheEntry::new(key, response.status.as_u16(), headers, response.body.to_vec())
}

fn response_from_entry(entry: CacheEntry, url: Url) -> Response {
    let mut headers = HeaderMap::new();
    for (name, value) in &entry.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.append(name, value);
        }
    }
    let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
    let mut response = Response::new(url, status, headers, entry.body);
    response.from_cache = true;
    response
}
