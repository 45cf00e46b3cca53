//! Scripted in-memory [`Fetcher`] for tests.
//!
//! Routes are keyed by method and absolute URL. Anything unscripted, and
//! everything while the fetcher is offline, fails like an unreachable network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use url::Url;

use crate::{Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
enum Scripted {
    Respond {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Fail(String),
}

/// A fetcher that replays canned responses and records every call.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<(Method, String), Scripted>>,
    calls: Mutex<Vec<Request>>,
    offline: AtomicBool,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `method url` with the given status and body.
    pub fn respond(&self, method: Method, url: &str, status: u16, body: impl Into<Bytes>) {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        self.script(
            method,
            url,
            Scripted::Respond {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                headers,
                body: body.into(),
            },
        );
    }

    /// Fail `method url` with a transport error.
    pub fn fail(&self, method: Method, url: &str) {
        self.script(method, url, Scripted::Fail(format!("connection refused: {url}")));
    }

    /// Toggle a simulated network outage for every route.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every request seen so far, in order.
    pub fn calls(&self) -> Vec<Request> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Number of requests issued to `url` (any method).
    pub fn calls_to(&self, url: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|request| request.url.as_str() == url)
            .count()
    }

    fn script(&self, method: Method, url: &str, scripted: Scripted) {
        let key = (method, normalize(url));
        lock(&self.routes).insert(key, scripted);
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        lock(&self.calls).push(request.clone());

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("network unreachable".to_string()));
        }

        let key = (request.method.clone(), request.url.to_string());
        let scripted = lock(&self.routes).get(&key).cloned();
        match scripted {
            Some(Scripted::Respond {
                status,
                headers,
                body,
            }) => Ok(Response::new(request.url, status, headers, body)),
            Some(Scripted::Fail(reason)) => Err(NetError::RequestFailed(reason)),
            None => Err(NetError::RequestFailed(format!(
                "no route for {} {}",
                request.method, request.url
            ))),
        }
    }
}

fn normalize(url: &str) -> String {
    Url::parse(url)
        .map(|parsed| parsed.to_string())
        .unwrap_or_else(|_| url.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
