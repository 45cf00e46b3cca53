//! Named response caches.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::database::{Database, Migration};
use crate::{StoreError, StoreResult};

/// Identity of a cached request: method plus URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A cached response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,

    /// Response status.
    pub status: u16,

    /// Response headers, in received order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            key,
            status,
            headers,
            body,
            cached_at: Utc::now(),
        }
    }
}

/// Storage for every cache partition, shared by all in-flight tasks.
///
/// Each call is atomic on its own; concurrent writers to the same key race
/// and the last one wins.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the partition if it does not exist.
    async fn open(&self, name: &str) -> StoreResult<()>;

    /// Delete a partition with all its entries. Returns whether it existed.
    async fn delete(&self, name: &str) -> StoreResult<bool>;

    /// Names of all partitions.
    async fn keys(&self) -> StoreResult<Vec<String>>;

    /// Store `entry`, replacing any entry under the same key. Creates the
    /// partition if needed.
    async fn put(&self, name: &str, entry: CacheEntry) -> StoreResult<()>;

    async fn match_entry(&self, name: &str, key: &CacheKey) -> StoreResult<Option<CacheEntry>>;

    /// Remove one entry. Returns whether it existed.
    async fn remove(&self, name: &str, key: &CacheKey) -> StoreResult<bool>;

    /// Number of entries in a partition (0 if it does not exist).
    async fn len(&self, name: &str) -> StoreResult<usize>;

    /// Evict the oldest entries so at most `max_entries` remain. Returns the
    /// number evicted.
    async fn trim(&self, name: &str, max_entries: usize) -> StoreResult<usize>;
}

// ==================== In-memory ====================

/// Process-local cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, HashMap<CacheKey, CacheEntry>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> StoreResult<()> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn delete(&self, name: &str) -> StoreResult<bool> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> StoreResult<()> {
        trace!(partition = name, key = %entry.key, "Cache put");
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn match_entry(&self, name: &str, key: &CacheKey) -> StoreResult<Option<CacheEntry>> {
        Ok(self
            .caches
            .read()
            .await
            .get(name)
            .and_then(|cache| cache.get(key))
            .cloned())
    }

    async fn remove(&self, name: &str, key: &CacheKey) -> StoreResult<bool> {
        Ok(self
            .caches
            .write()
            .await
            .get_mut(name)
            .map(|cache| cache.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn len(&self, name: &str) -> StoreResult<usize> {
        Ok(self.caches.read().await.get(name).map_or(0, |c| c.len()))
    }

    async fn trim(&self, name: &str, max_entries: usize) -> StoreResult<usize> {
        let mut caches = self.caches.write().await;
        let Some(cache) = caches.get_mut(name) else {
            return Ok(0);
        };
        if cache.len() <= max_entries {
            return Ok(0);
        }

        let mut by_age: Vec<(DateTime<Utc>, CacheKey)> = cache
            .values()
            .map(|entry| (entry.cached_at, entry.key.clone()))
            .collect();
        by_age.sort_by(|a, b| a.0.cmp(&b.0));

        let excess = cache.len() - max_entries;
        for (_, key) in by_age.into_iter().take(excess) {
            cache.remove(&key);
        }
        Ok(excess)
    }
}

// ==================== SQLite ====================

static CACHE_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: r#"
        CREATE TABLE IF NOT EXISTS partitions (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            partition TEXT NOT NULL,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (partition, method, url)
        );

        CREATE INDEX IF NOT EXISTS idx_entries_age ON entries(partition, cached_at);
    "#,
}];

/// Cache storage persisted in a SQLite file.
pub struct SqliteCacheStorage {
    db: Database,
}

impl SqliteCacheStorage {
    /// Storage at `path`, opened on first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            db: Database::new(path, CACHE_MIGRATIONS),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            db: Database::in_memory(CACHE_MIGRATIONS),
        }
    }

    fn ensure_partition(conn: &rusqlite::Connection, name: &str) -> StoreResult<()> {
        conn.execute(
            "INSERT OR IGNORE INTO partitions (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().timestamp()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for SqliteCacheStorage {
    async fn open(&self, name: &str) -> StoreResult<()> {
        let name = name.to_string();
        self.db
            .run(move |conn| Self::ensure_partition(conn, &name))
            .await
    }

    async fn delete(&self, name: &str) -> StoreResult<bool> {
        let name = name.to_string();
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM entries WHERE partition = ?1", params![name])?;
                let removed = tx.execute("DELETE FROM partitions WHERE name = ?1", params![name])?;
                tx.commit()?;
                debug!(partition = %name, existed = removed > 0, "Deleted partition");
                Ok(removed > 0)
            })
            .await
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        self.db
            .run(|conn| {
                let mut stmt = conn.prepare("SELECT name FROM partitions ORDER BY name")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> StoreResult<()> {
        let headers = serde_json::to_string(&entry.headers)?;
        let name = name.to_string();
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                Self::ensure_partition(&tx, &name)?;
                tx.execute(
                    "INSERT OR REPLACE INTO entries
                        (partition, method, url, status, headers, body, cached_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        name,
                        entry.key.method,
                        entry.key.url,
                        entry.status,
                        headers,
                        entry.body,
                        entry.cached_at.timestamp_millis(),
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn match_entry(&self, name: &str, key: &CacheKey) -> StoreResult<Option<CacheEntry>> {
        let name = name.to_string();
        let lookup = key.clone();
        let row = self
            .db
            .run(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT status, headers, body, cached_at FROM entries
                         WHERE partition = ?1 AND method = ?2 AND url = ?3",
                        params![name, lookup.method, lookup.url],
                        |row| {
                            Ok((
                                row.get::<_, u16>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, Vec<u8>>(2)?,
                                row.get::<_, i64>(3)?,
                            ))
                        },
                    )
                    .optional()?)
            })
            .await?;

        let Some((status, headers, body, cached_at)) = row else {
            return Ok(None);
        };
        let cached_at = DateTime::from_timestamp_millis(cached_at).ok_or_else(|| {
            StoreError::DataError(format!("invalid cached_at for {key}: {cached_at}"))
        })?;
        Ok(Some(CacheEntry {
            key: key.clone(),
            status,
            headers: serde_json::from_str(&headers)?,
            body,
            cached_at,
        }))
    }

    async fn remove(&self, name: &str, key: &CacheKey) -> StoreResult<bool> {
        let name = name.to_string();
        let key = key.clone();
        self.db
            .run(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM entries WHERE partition = ?1 AND method = ?2 AND url = ?3",
                    params![name, key.method, key.url],
                )?;
                Ok(removed > 0)
            })
            .await
    }

    async fn len(&self, name: &str) -> StoreResult<usize> {
        let name = name.to_string();
        self.db
            .run(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM entries WHERE partition = ?1",
                    params![name],
                    |row| row.get(0),
                )?;
                Ok(count as usize)
            })
            .await
    }

    async fn trim(&self, name: &str, max_entries: usize) -> StoreResult<usize> {
        let name = name.to_string();
        self.db
            .run(move |conn| {
                let evicted = conn.execute(
                    "DELETE FROM entries WHERE partition = ?1 AND rowid IN (
                        SELECT rowid FROM entries WHERE partition = ?1
                        ORDER BY cached_at DESC, rowid DESC
                        LIMIT -1 OFFSET ?2
                    )",
                    params![name, max_entries as i64],
                )?;
                Ok(evicted)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(url: &str, body: &str) -> CacheEntry {
        CacheEntry::new(
            CacheKey::get(url),
            200,
            vec![("content-type".to_string(), "text/css".to_string())],
            body.as_bytes().to_vec(),
        )
    }

    async fn exercise_partitions(storage: &dyn CacheStorage) {
        assert!(storage.keys().await.unwrap().is_empty());

        storage.open("bridgenotary-static-v1").await.unwrap();
        storage.open("bridgenotary-static-v1").await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["bridgenotary-static-v1"]);
        assert_eq!(storage.len("bridgenotary-static-v1").await.unwrap(), 0);

        storage
            .put("bridgenotary-api-v1", entry("https://bridgenotary.com/api/x", "1"))
            .await
            .unwrap();
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["bridgenotary-api-v1", "bridgenotary-static-v1"]
        );

        assert!(storage.delete("bridgenotary-api-v1").await.unwrap());
        assert!(!storage.delete("bridgenotary-api-v1").await.unwrap());
        assert!(storage
            .match_entry("bridgenotary-api-v1", &CacheKey::get("https://bridgenotary.com/api/x"))
            .await
            .unwrap()
            .is_none());
    }

    async fn exercise_entries(storage: &dyn CacheStorage) {
        let key = CacheKey::get("https://bridgenotary.com/app.css");
        storage
            .put("static", entry("https://bridgenotary.com/app.css", "a{}"))
            .await
            .unwrap();
        storage
            .put("static", entry("https://bridgenotary.com/app.css", "b{}"))
            .await
            .unwrap();

        let found = storage.match_entry("static", &key).await.unwrap().unwrap();
        assert_eq!(found.body, b"b{}");
        assert_eq!(found.headers[0].1, "text/css");
        assert_eq!(storage.len("static").await.unwrap(), 1);

        let head = CacheKey::new("head", "https://bridgenotary.com/app.css");
        assert!(storage.match_entry("static", &head).await.unwrap().is_none());

        assert!(storage.remove("static", &key).await.unwrap());
        assert!(!storage.remove("static", &key).await.unwrap());
    }

    async fn exercise_trim(storage: &dyn CacheStorage) {
        let base = Utc::now();
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            let mut e = entry(&format!("https://bridgenotary.com/{name}.js"), name);
            e.cached_at = base + Duration::seconds(i as i64);
            storage.put("runtime", e).await.unwrap();
        }

        assert_eq!(storage.trim("runtime", 2).await.unwrap(), 2);
        assert_eq!(storage.len("runtime").await.unwrap(), 2);
        assert!(storage
            .match_entry("runtime", &CacheKey::get("https://bridgenotary.com/a.js"))
            .await
            .unwrap()
            .is_none());
        assert!(storage
            .match_entry("runtime", &CacheKey::get("https://bridgenotary.com/d.js"))
            .await
            .unwrap()
            .is_some());
        assert_eq!(storage.trim("runtime", 5).await.unwrap(), 0);
        assert_eq!(storage.trim("absent", 0).await.unwrap(), 0);
    }

    #[test]
    fn test_cache_key() {
        let key = CacheKey::new("get", "https://bridgenotary.com/");
        assert_eq!(key, CacheKey::get("https://bridgenotary.com/"));
        assert_eq!(key.to_string(), "GET https://bridgenotary.com/");
    }

    #[tokio::test]
    async fn test_memory_storage() {
        exercise_partitions(&MemoryCacheStorage::new()).await;
        exercise_entries(&MemoryCacheStorage::new()).await;
        exercise_trim(&MemoryCacheStorage::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_storage() {
        exercise_partitions(&SqliteCacheStorage::in_memory()).await;
        exercise_entries(&SqliteCacheStorage::in_memory()).await;
        exercise_trim(&SqliteCacheStorage::in_memory()).await;
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.db");

        let original = entry("https://bridgenotary.com/images/logo.png", "png");
        SqliteCacheStorage::new(&path)
            .put("bridgenotary-static-v1", original.clone())
            .await
            .unwrap();

        let reopened = SqliteCacheStorage::new(&path);
        let found = reopened
            .match_entry("bridgenotary-static-v1", &original.key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.body, original.body);
        assert_eq!(
            found.cached_at.timestamp_millis(),
            original.cached_at.timestamp_millis()
        );
    }
}
