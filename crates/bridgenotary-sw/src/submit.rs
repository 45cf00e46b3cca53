//! Direct form submission with an offline fallback to the pending queue.

use std::sync::Arc;

use bridgenotary_net::{Fetcher, Request};
use bridgenotary_store::{Payload, PendingSubmission, QueueStore, StoreError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::SwError;

/// Attempts at finding a free id before giving up.
const MAX_ID_ATTEMPTS: usize = 3;

/// What the relay answers to an accepted submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayResponse {
    pub success: bool,
    pub message: Option<String>,
    pub id: Option<String>,
}

/// Result of [`FormSubmitter::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// The relay accepted the form.
    Delivered { id: Option<String> },
    /// The relay was unreachable; the form waits for the next sync.
    Queued { id: String },
    /// Neither delivered nor stored.
    Undeliverable,
}

/// Sends forms to the relay, queueing them when it cannot be reached.
pub struct FormSubmitter {
    fetcher: Arc<dyn Fetcher>,
    queue: Arc<dyn QueueStore>,
    relay_url: Url,
}

impl FormSubmitter {
    pub fn new(fetcher: Arc<dyn Fetcher>, queue: Arc<dyn QueueStore>, relay_url: Url) -> Self {
        Self {
            fetcher,
            queue,
            relay_url,
        }
    }

    pub async fn submit(&self, payload: Payload) -> SubmissionOutcome {
        let request = Request::post_json(
            self.relay_url.clone(),
            Bytes::copy_from_slice(payload.as_bytes()),
        );

        match self.fetcher.fetch(request).await {
            Ok(response) if response.ok() => {
                let relay: RelayResponse = response.json().unwrap_or_else(|e| {
                    debug!(error = %e, "Relay answer is not JSON");
                    RelayResponse {
                        success: true,
                        ..Default::default()
                    }
                });
                info!(id = ?relay.id, "Form delivered");
                return SubmissionOutcome::Delivered { id: relay.id };
            }
            Ok(response) => {
                warn!(status = %response.status, "Relay rejected form, queueing");
            }
            Err(e) => {
                warn!(error = %e, "Relay unreachable, queueing");
            }
        }

        match self.enqueue(payload).await {
            Ok(submission) => SubmissionOutcome::Queued { id: submission.id },
            Err(e) => {
                error!(error = %e, "Failed to queue form");
                SubmissionOutcome::Undeliverable
            }
        }
    }

    /// Persist a payload for the next sync.
    ///
    /// A collision on the generated id is retried with a fresh one.
    pub async fn enqueue(&self, payload: Payload) -> Result<PendingSubmission, SwError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let submission = PendingSubmission::new(payload.clone());
            match self.queue.add(submission.clone()).await {
                Ok(()) => {
                    debug!(id = %submission.id, "Queued form submission");
                    return Ok(submission);
                }
                Err(StoreError::ConstraintError(msg)) if attempt < MAX_ID_ATTEMPTS => {
                    debug!(%msg, "Submission id taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
