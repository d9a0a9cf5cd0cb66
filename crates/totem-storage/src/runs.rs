//! `RunLogStore` implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};

use totem_types::{ExitStatus, NewRunEntry, Retention, RunCompletion, RunId, RunLogEntry};

use crate::{
    Result, RunLogStore, StorageError, TotemStorage, from_millis, is_constraint_violation,
    to_millis,
};

const RUN_COLUMNS: &str = "id, task_id, started_at, finished_at, exit_kind, exit_code, output";

struct RunRow {
    id: i64,
    task_id: String,
    started_at: i64,
    finished_at: Option<i64>,
    exit_kind: Option<String>,
    exit_code: Option<i32>,
    output: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            started_at: row.get(2)?,
            finished_at: row.get(3)?,
            exit_kind: row.get(4)?,
            exit_code: row.get(5)?,
            output: row.get(6)?,
        })
    }

    fn into_entry(self) -> Result<RunLogEntry> {
        let exit_status = match self.exit_kind.as_deref() {
            Some(kind) => Some(ExitStatus::from_parts(kind, self.exit_code).ok_or_else(|| {
                StorageError::Corrupt(format!("run {}: bad exit status {kind}", self.id))
            })?),
            None => None,
        };
        Ok(RunLogEntry {
            id: self.id,
            task_id: self.task_id,
            started_at: from_millis(self.started_at)?,
            finished_at: self.finished_at.map(from_millis).transpose()?,
            exit_status,
            output: self.output,
        })
    }
}

fn query_runs(
    conn: &rusqlite::Connection,
    where_clause: &str,
    task_id: &str,
    limit: usize,
) -> Result<Vec<RunLogEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM task_runs WHERE task_id = ?1 {where_clause}
         ORDER BY started_at DESC, id DESC LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(
            rusqlite::params![task_id, limit as i64],
            RunRow::from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(RunRow::into_entry).collect()
}

#[async_trait]
impl RunLogStore for TotemStorage {
    async fn latest_in_flight(&self, task_id: &str) -> Result<Option<RunLogEntry>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            Ok(query_runs(conn, "AND finished_at IS NULL", &task_id, 1)?
                .into_iter()
                .next())
        })
        .await
    }

    async fn latest_started(&self, task_id: &str) -> Result<Option<RunLogEntry>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| Ok(query_runs(conn, "", &task_id, 1)?.into_iter().next()))
            .await
    }

    async fn append(&self, entry: &NewRunEntry) -> Result<RunId> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            // The partial unique index on in-flight rows turns a concurrent
            // second insert into a constraint violation.
            let inserted = conn.execute(
                "INSERT INTO task_runs (task_id, started_at) VALUES (?1, ?2)",
                rusqlite::params![entry.task_id, to_millis(entry.started_at)],
            );
            match inserted {
                Ok(_) => Ok(conn.last_insert_rowid()),
                Err(e) if is_constraint_violation(&e) => Err(StorageError::AlreadyRunning {
                    task_id: entry.task_id,
                }),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn complete(&self, id: RunId, completion: &RunCompletion) -> Result<bool> {
        let completion = completion.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE task_runs
                 SET finished_at = ?1, exit_kind = ?2, exit_code = ?3, output = ?4
                 WHERE id = ?5 AND finished_at IS NULL",
                rusqlite::params![
                    to_millis(completion.finished_at),
                    completion.exit_status.kind(),
                    completion.exit_status.code(),
                    completion.output,
                    id,
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn recent_completed(&self, task_id: &str, limit: usize) -> Result<Vec<RunLogEntry>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| query_runs(conn, "AND finished_at IS NOT NULL", &task_id, limit))
            .await
    }

    async fn history(&self, task_id: &str, limit: usize) -> Result<Vec<RunLogEntry>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| query_runs(conn, "", &task_id, limit))
            .await
    }

    async fn get_run(&self, id: RunId) -> Result<Option<RunLogEntry>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {RUN_COLUMNS} FROM task_runs WHERE id = ?1"),
                    rusqlite::params![id],
                    RunRow::from_row,
                )
                .optional()?;
            row.map(RunRow::into_entry).transpose()
        })
        .await
    }

    async fn reconcile_in_flight(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(move |conn| {
            let count = conn.execute(
                "UPDATE task_runs
                 SET finished_at = ?1, exit_kind = ?2, exit_code = NULL
                 WHERE finished_at IS NULL",
                rusqlite::params![to_millis(now), ExitStatus::Abandoned.kind()],
            )?;
            Ok(count)
        })
        .await
    }

    async fn prune(
        &self,
        task_id: &str,
        retention: Retention,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let count = match retention {
                Retention::Runs(keep) => conn.execute(
                    "DELETE FROM task_runs
                     WHERE task_id = ?1 AND finished_at IS NOT NULL AND id NOT IN (
                         SELECT id FROM task_runs
                         WHERE task_id = ?1 AND finished_at IS NOT NULL
                         ORDER BY started_at DESC, id DESC LIMIT ?2
                     )",
                    rusqlite::params![task_id, keep as i64],
                )?,
                Retention::Days(days) => {
                    let cutoff = now - chrono::Duration::days(days as i64);
                    conn.execute(
                        "DELETE FROM task_runs
                         WHERE task_id = ?1 AND finished_at IS NOT NULL AND started_at < ?2",
                        rusqlite::params![task_id, to_millis(cutoff)],
                    )?
                }
            };
            Ok(count)
        })
        .await
    }

    async fn delete_for_task(&self, task_id: &str) -> Result<usize> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let count = conn.execute(
                "DELETE FROM task_runs WHERE task_id = ?1 AND finished_at IS NOT NULL",
                rusqlite::params![task_id],
            )?;
            Ok(count)
        })
        .await
    }
}
