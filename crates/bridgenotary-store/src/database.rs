//! Lazily opened, version-migrated SQLite handle shared by the SQLite backends.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::{StoreError, StoreResult};

/// One schema step. `version` is the schema version after `sql` has run.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i32,
    pub sql: &'static str,
}

/// SQLite database opened on first use.
///
/// A failed open leaves the handle closed, so the next call tries again.
/// Clones share the same connection.
#[derive(Clone)]
pub struct Database {
    path: Option<PathBuf>,
    migrations: &'static [Migration],
    conn: Arc<Mutex<Option<Connection>>>,
}

impl Database {
    /// A database file at `path`; nothing touches the disk until first use.
    pub fn new(path: impl Into<PathBuf>, migrations: &'static [Migration]) -> Self {
        Self {
            path: Some(path.into()),
            migrations,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// A private in-memory database.
    pub fn in_memory(migrations: &'static [Migration]) -> Self {
        Self {
            path: None,
            migrations,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.lock().map(|conn| conn.is_some()).unwrap_or(false)
    }

    /// Run `f` against the connection, opening and migrating it first if needed.
    pub fn with_conn<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let mut guard = self.lock()?;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(StoreError::DataError("database not open".to_string())),
        }
    }

    /// [`Database::with_conn`] on the blocking thread pool, off the async
    /// worker threads.
    pub async fn run<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Connection) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f)).await?
    }

    /// Current schema version of the opened database.
    pub fn schema_version(&self) -> StoreResult<i32> {
        self.with_conn(|conn| current_version(conn))
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = match &self.path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                info!(path = %path.display(), "Opening database");
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        init_database(&conn, self.migrations)?;
        Ok(conn)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Option<Connection>>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Bring the schema up to the newest migration.
fn init_database(conn: &Connection, migrations: &[Migration]) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );",
    )?;

    let version = current_version(conn)?;
    for migration in migrations.iter().filter(|m| m.version > version) {
        debug!(from = version, to = migration.version, "Migrating schema");
        conn.execute_batch(migration.sql)?;
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![migration.version, Utc::now().timestamp()],
        )?;
    }
    Ok(())
}

fn current_version(conn: &Connection) -> StoreResult<i32> {
    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}
