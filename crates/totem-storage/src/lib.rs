//! totem-storage: SQLite-backed task store and run log.
//!
//! Defines the [`TaskStore`] and [`RunLogStore`] contracts the scheduler
//! depends on, and [`TotemStorage`], a single SQLite database implementing both.

mod runs;
mod tasks;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use totem_types::{
    NewRunEntry, Retention, RunCompletion, RunId, RunLogEntry, Task, TaskFields, TaskFilter,
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Task {task_id} already has a run in flight")]
    AlreadyRunning { task_id: String },
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Persistence contract for task definitions.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// List tasks matching the filter, ordered by description.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    async fn get(&self, id: &str) -> Result<Option<Task>>;

    /// Create a task with a fresh id.
    async fn store(&self, fields: TaskFields) -> Result<Task>;

    /// Replace a task's fields. Returns `None` if the task does not exist.
    async fn update(&self, id: &str, fields: TaskFields) -> Result<Option<Task>>;

    /// Delete a task definition. Run history is not touched.
    async fn destroy(&self, id: &str) -> Result<bool>;
}

/// Append-only record of execution attempts.
///
/// At most one entry per task may be in flight (`finished_at IS NULL`);
/// [`RunLogStore::append`] enforces this atomically.
#[async_trait]
pub trait RunLogStore: Send + Sync {
    /// The task's in-flight entry, if any.
    async fn latest_in_flight(&self, task_id: &str) -> Result<Option<RunLogEntry>>;

    /// The task's most recently started entry, in flight or not.
    async fn latest_started(&self, task_id: &str) -> Result<Option<RunLogEntry>>;

    /// Insert an in-flight entry. Fails with [`StorageError::AlreadyRunning`]
    /// when the task already has one.
    async fn append(&self, entry: &NewRunEntry) -> Result<RunId>;

    /// Complete an in-flight entry. Returns `false` if it was not in flight.
    async fn complete(&self, id: RunId, completion: &RunCompletion) -> Result<bool>;

    /// Newest completed entries first.
    async fn recent_completed(&self, task_id: &str, limit: usize) -> Result<Vec<RunLogEntry>>;

    /// Newest entries of any state first.
    async fn history(&self, task_id: &str, limit: usize) -> Result<Vec<RunLogEntry>>;

    async fn get_run(&self, id: RunId) -> Result<Option<RunLogEntry>>;

    /// Mark every in-flight entry as abandoned. Returns the number reconciled.
    async fn reconcile_in_flight(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Apply a retention rule to the task's completed entries.
    async fn prune(&self, task_id: &str, retention: Retention, now: DateTime<Utc>)
    -> Result<usize>;

    /// Delete the task's completed entries. An in-flight entry is kept.
    async fn delete_for_task(&self, task_id: &str) -> Result<usize>;
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        description TEXT NOT NULL,
        command TEXT NOT NULL,
        frequency TEXT NOT NULL,
        timezone TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        timeout_secs INTEGER,
        retention TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS task_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        finished_at INTEGER,
        exit_kind TEXT,
        exit_code INTEGER,
        output TEXT NOT NULL DEFAULT ''
    );

    CREATE UNIQUE INDEX IF NOT EXISTS task_runs_in_flight
        ON task_runs(task_id) WHERE finished_at IS NULL;

    CREATE INDEX IF NOT EXISTS task_runs_by_task
        ON task_runs(task_id, started_at DESC);";

/// SQLite storage for tasks and their run log.
#[derive(Clone)]
pub struct TotemStorage {
    conn: Arc<Mutex<Connection>>,
}

impl TotemStorage {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Storage opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await?
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
