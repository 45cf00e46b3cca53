//! Background sync: replay queued submissions to the relay.

use std::sync::Arc;

use bridgenotary_net::{Fetcher, Request};
use bridgenotary_store::QueueStore;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::SwError;

/// Outcome of one drain of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Records read from the queue.
    pub attempted: usize,
    /// Records the relay accepted and that were removed.
    pub replayed: usize,
    /// Records left in the queue for the next sync.
    pub failed: usize,
}

/// Drains the pending queue when the host fires the matching sync tag.
pub struct SyncTrigger {
    queue: Arc<dyn QueueStore>,
    fetcher: Arc<dyn Fetcher>,
    relay_url: Url,
    tag: String,
    in_flight: Mutex<()>,
}

impl SyncTrigger {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        fetcher: Arc<dyn Fetcher>,
        relay_url: Url,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            fetcher,
            relay_url,
            tag: tag.into(),
            in_flight: Mutex::new(()),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Drain the queue if `tag` is ours. Other tags are ignored.
    pub async fn handle_sync(&self, tag: &str) -> Result<Option<SyncReport>, SwError> {
        if tag != self.tag {
            debug!(tag, "Ignoring sync tag");
            return Ok(None);
        }
        self.drain().await.map(Some)
    }

    /// Replay every queued record once, oldest first.
    ///
    /// Accepted records are deleted; anything else stays queued with its
    /// payload untouched. Only one drain runs at a time.
    pub async fn drain(&self) -> Result<SyncReport, SwError> {
        let _guard = self.in_flight.lock().await;

        let pending = match self.queue.get_all().await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Sync aborted: failed to read pending submissions");
                return Err(e.into());
            }
        };

        let mut report = SyncReport {
            attempted: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        for submission in pending {
            let body = Bytes::copy_from_slice(submission.data.as_bytes());
            let request = Request::post_json(self.relay_url.clone(), body);

            match self.fetcher.fetch(request).await {
                Ok(response) if response.ok() => match self.queue.delete(&submission.id).await {
                    Ok(_) => {
                        debug!(id = %submission.id, "Replayed submission");
                        report.replayed += 1;
                    }
                    Err(e) => {
                        // Delivered but still queued; it will be sent again.
                        warn!(id = %submission.id, error = %e, "Failed to remove replayed submission");
                        report.failed += 1;
                    }
                },
                Ok(response) => {
                    warn!(id = %submission.id, status = %response.status, "Relay rejected submission");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(id = %submission.id, error = %e, "Failed to sync form");
                    report.failed += 1;
                }
            }
        }

        info!(
            attempted = report.attempted,
            replayed = report.replayed,
            failed = report.failed,
            "Sync complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridgenotary_net::mock::ScriptedFetcher;
    use bridgenotary_store::{
        MemoryQueueStore, Payload, PendingSubmission, StoreError, StoreResult,
    };
    use http::Method;

    const RELAY: &str = "https://bridgenotary.com/api/request-form";

    fn trigger(queue: Arc<dyn QueueStore>, fetcher: Arc<ScriptedFetcher>) -> SyncTrigger {
        SyncTrigger::new(queue, fetcher, Url::parse(RELAY).unwrap(), "sync-forms")
    }

    async fn enqueue(queue: &MemoryQueueStore, json: &str) -> PendingSubmission {
        let submission = PendingSubmission::new(Payload::new(json));
        queue.add(submission.clone()).await.unwrap();
        submission
    }

    #[tokio::test]
    async fn test_other_tags_are_ignored() {
        let queue = Arc::new(MemoryQueueStore::new());
        enqueue(&queue, r#"{"a":1}"#).await;
        let fetcher = Arc::new(ScriptedFetcher::new());
        let sync = trigger(queue.clone(), fetcher.clone());

        assert_eq!(sync.handle_sync("sync-photos").await.unwrap(), None);
        assert_eq!(fetcher.call_count(), 0);
        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_replays_and_deletes() {
        let queue = Arc::new(MemoryQueueStore::new());
        let jane = r#"{"fullName":"Jane Doe","email":"jane@x.com"}"#;
        enqueue(&queue, jane).await;
        enqueue(&queue, r#"{"fullName":"John Roe"}"#).await;

        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond(Method::POST, RELAY, 200, r#"{"success":true}"#);
        let sync = trigger(queue.clone(), fetcher.clone());

        let report = sync.handle_sync("sync-forms").await.unwrap().unwrap();
        assert_eq!(
            report,
            SyncReport {
                attempted: 2,
                replayed: 2,
                failed: 0
            }
        );
        assert_eq!(queue.count().await.unwrap(), 0);

        let calls = fetcher.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].method, Method::POST);
        assert_eq!(calls[0].body.as_deref(), Some(jane.as_bytes()));
        assert_eq!(
            calls[0].headers.get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_rejected_and_failed_records_stay_queued() {
        let queue = Arc::new(MemoryQueueStore::new());
        let first = enqueue(&queue, r#"{"n":1}"#).await;

        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond(Method::POST, RELAY, 500, "boom");
        let sync = trigger(queue.clone(), fetcher.clone());

        let report = sync.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(queue.get(&first.id).await.unwrap(), Some(first.clone()));

        fetcher.set_offline(true);
        let report = sync.drain().await.unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(queue.get_all().await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn test_empty_queue_makes_no_requests() {
        let queue = Arc::new(MemoryQueueStore::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        let sync = trigger(queue, fetcher.clone());

        assert_eq!(sync.drain().await.unwrap(), SyncReport::default());
        assert_eq!(sync.drain().await.unwrap(), SyncReport::default());
        assert_eq!(fetcher.call_count(), 0);
    }

    struct BrokenQueue;

    #[async_trait]
    impl QueueStore for BrokenQueue {
        async fn add(&self, _submission: PendingSubmission) -> StoreResult<()> {
            Err(StoreError::DataError("broken".into()))
        }
        async fn get_all(&self) -> StoreResult<Vec<PendingSubmission>> {
            Err(StoreError::DataError("broken".into()))
        }
        async fn get(&self, _id: &str) -> StoreResult<Option<PendingSubmission>> {
            Err(StoreError::DataError("broken".into()))
        }
        async fn delete(&self, _id: &str) -> StoreResult<bool> {
            Err(StoreError::DataError("broken".into()))
        }
        async fn count(&self) -> StoreResult<usize> {
            Err(StoreError::DataError("broken".into()))
        }
    }

    #[tokio::test]
    async fn test_unreadable_queue_is_reported() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let sync = trigger(Arc::new(BrokenQueue), fetcher.clone());

        assert!(matches!(sync.drain().await, Err(SwError::Store(_))));
        assert_eq!(fetcher.call_count(), 0);
    }
}
