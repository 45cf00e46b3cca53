//! Pending form submissions awaiting replay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::database::{Database, Migration};
use crate::{StoreError, StoreResult};

/// Exact JSON text of a form submission.
///
/// Never parsed or rewritten on the storage path; what was enqueued is what
/// gets replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(String);

impl Payload {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

// Serialized as embedded JSON text when the payload is JSON, as a string
// otherwise. Either way the original bytes come back on deserialization.
impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match RawValue::from_string(self.0.clone()) {
            Ok(raw) => raw.serialize(serializer),
            Err(_) => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        let text = raw.get();
        // A JSON string whose contents are not JSON is a non-JSON payload
        // written out by `serialize`.
        if text.starts_with('"') {
            if let Ok(inner) = serde_json::from_str::<String>(text) {
                if serde_json::from_str::<&RawValue>(&inner).is_err() {
                    return Ok(Self(inner));
                }
            }
        }
        Ok(Self(text.to_string()))
    }
}

/// A form submission that could not be delivered yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSubmission {
    pub id: String,
    pub data: Payload,
    pub timestamp: DateTime<Utc>,
}

impl PendingSubmission {
    /// A new submission with a fresh time-derived id.
    pub fn new(data: Payload) -> Self {
        let now = Utc::now();
        // Millisecond precision is what the SQLite backend keeps.
        let timestamp = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        Self {
            id: next_submission_id(&timestamp),
            data,
            timestamp,
        }
    }
}

fn next_submission_id(at: &DateTime<Utc>) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!(
        "{}-{:04x}",
        at.timestamp_millis(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Keyed store of pending submissions, key = id.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a submission. Fails with [`StoreError::ConstraintError`] if the
    /// id is already present.
    async fn add(&self, submission: PendingSubmission) -> StoreResult<()>;

    /// All submissions, oldest first.
    async fn get_all(&self) -> StoreResult<Vec<PendingSubmission>>;

    async fn get(&self, id: &str) -> StoreResult<Option<PendingSubmission>>;

    /// Remove a submission. Returns whether it existed.
    async fn delete(&self, id: &str) -> StoreResult<bool>;

    async fn count(&self) -> StoreResult<usize>;
}

// ==================== In-memory ====================

/// Process-local queue store.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    records: RwLock<HashMap<String, PendingSubmission>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn add(&self, submission: PendingSubmission) -> StoreResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&submission.id) {
            return Err(StoreError::ConstraintError(format!(
                "Key already exists: {}",
                submission.id
            )));
        }
        records.insert(submission.id.clone(), submission);
        Ok(())
    }

    async fn get_all(&self) -> StoreResult<Vec<PendingSubmission>> {
        let mut all: Vec<PendingSubmission> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<PendingSubmission>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.records.read().await.len())
    }
}

// ==================== SQLite ====================

static QUEUE_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: r#"
        CREATE TABLE IF NOT EXISTS pending_submissions (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        );
    "#,
}];

/// Queue store persisted in a SQLite file, opened on first use.
pub struct SqliteQueueStore {
    db: Database,
}

impl SqliteQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            db: Database::new(path, QUEUE_MIGRATIONS),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            db: Database::in_memory(QUEUE_MIGRATIONS),
        }
    }

    pub fn is_open(&self) -> bool {
        self.db.is_open()
    }
}

fn row_to_submission(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn into_submission((id, data, millis): (String, String, i64)) -> StoreResult<PendingSubmission> {
    let timestamp = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::DataError(format!("invalid timestamp for {id}: {millis}")))?;
    Ok(PendingSubmission {
        id,
        data: Payload::new(data),
        timestamp,
    })
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn add(&self, submission: PendingSubmission) -> StoreResult<()> {
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO pending_submissions (id, data, timestamp) VALUES (?1, ?2, ?3)",
                    params![
                        submission.id,
                        submission.data.as_str(),
                        submission.timestamp.timestamp_millis()
                    ],
                )
                .map_err(|e| match e {
                    rusqlite::Error::SqliteFailure(ref err, _)
                        if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        StoreError::ConstraintError(format!("Key already exists: {}", submission.id))
                    }
                    other => StoreError::Database(other),
                })?;
                debug!(id = %submission.id, "Stored pending submission");
                Ok(())
            })
            .await
    }

    async fn get_all(&self) -> StoreResult<Vec<PendingSubmission>> {
        let rows = self
            .db
            .run(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, data, timestamp FROM pending_submissions ORDER BY timestamp, id",
                )?;
                let rows = stmt
                    .query_map([], row_to_submission)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(into_submission).collect()
    }

    async fn get(&self, id: &str) -> StoreResult<Option<PendingSubmission>> {
        let id = id.to_string();
        let row = self
            .db
            .run(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, data, timestamp FROM pending_submissions WHERE id = ?1",
                        params![id],
                        row_to_submission,
                    )
                    .optional()?)
            })
            .await?;
        row.map(into_submission).transpose()
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_string();
        self.db
            .run(move |conn| {
                let removed =
                    conn.execute("DELETE FROM pending_submissions WHERE id = ?1", params![id])?;
                Ok(removed > 0)
            })
            .await
    }

    async fn count(&self) -> StoreResult<usize> {
        self.db
            .run(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM pending_submissions", [], |row| row.get(0))?;
                Ok(count as usize)
            })
            .await
    }
}
