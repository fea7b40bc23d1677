//! SQLite persistence shared by the cost tracker, breakers and fallback queue.
//!
//! Every CLI process opens its own connection to the same database file.
//! Read-modify-write sequences run inside `BEGIN IMMEDIATE` transactions so
//! writers in different processes serialize on SQLite's write lock; within a
//! process the connection sits behind a mutex. All I/O runs on the blocking
//! pool so async callers are never stalled by disk or lock waits.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::Connection;
use thiserror::Error;
use uuid::Uuid;

/// How long a writer waits for another process to release the write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cost_records (
    id TEXT PRIMARY KEY NOT NULL,
    service TEXT NOT NULL,
    operation TEXT NOT NULL,
    amount_micros INTEGER NOT NULL,
    occurred_at INTEGER NOT NULL,
    doc_slug TEXT,
    run_id TEXT,
    user_name TEXT,
    reservation_id TEXT,
    idempotency_key TEXT UNIQUE
);
CREATE INDEX IF NOT EXISTS idx_cost_records_occurred_at
    ON cost_records (occurred_at);

CREATE TABLE IF NOT EXISTS budget_reservations (
    id TEXT PRIMARY KEY NOT NULL,
    service TEXT NOT NULL,
    operation TEXT NOT NULL,
    amount_micros INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_budget_reservations_status
    ON budget_reservations (status, created_at);

CREATE TABLE IF NOT EXISTS circuit_breakers (
    name TEXT PRIMARY KEY NOT NULL,
    state TEXT NOT NULL,
    failure_count INTEGER NOT NULL DEFAULT 0,
    opened_at INTEGER,
    probe_started_at INTEGER,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS fallback_jobs (
    id TEXT PRIMARY KEY NOT NULL,
    job_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fallback_jobs_status
    ON fallback_jobs (status, created_at);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage task failed: {0}")]
    Join(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },
}

/// Handle to the shared database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let opened = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            if let Some(parent) = opened.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let conn = Connection::open(&opened)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!(path = %opened.display(), journal_mode = %mode, "Opened cost ledger");
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open a private in-memory database.
    ///
    /// State does not survive the process and is not visible to other
    /// processes; suitable for tests and single long-lived processes only.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection, StoreError> {
            let conn = Connection::open_in_memory()?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Path of the database file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn call<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Connection) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            // A panic while holding the lock leaves SQLite itself consistent
            // (the transaction rolls back on drop), so recover the guard.
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| E::from(StoreError::Join(e.to_string())))?
    }
}

/// Read a TEXT column holding a UUID.
pub(crate) fn uuid_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Nullable variant of [`uuid_column`].
pub(crate) fn opt_uuid_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    if version < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tracing::info!(from = version, to = SCHEMA_VERSION, "Migrated cost ledger schema");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_schema_and_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        let store = Store::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), Some(path.as_path()));

        let tables: Vec<String> = store
            .call(|conn| -> Result<Vec<String>, StoreError> {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok(rows.collect::<Result<_, _>>()?)
            })
            .await
            .unwrap();
        assert_eq!(
            tables,
            vec![
                "budget_reservations",
                "circuit_breakers",
                "cost_records",
                "fallback_jobs"
            ]
        );
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        drop(Store::open(&path).await.unwrap());
        let store = Store::open(&path).await.unwrap();
        let version: i64 = store
            .call(|conn| -> Result<i64, StoreError> {
                Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
                .unwrap();
        }
        let err = Store::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedSchema { .. }));
    }
}
