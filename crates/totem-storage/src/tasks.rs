//! `TaskStore` implementation.

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use rusqlite::{OptionalExtension, Row, types::Value};

use totem_types::{Task, TaskFields, TaskFilter};

use crate::{Result, StorageError, TaskStore, TotemStorage, from_millis, to_millis};

const TASK_COLUMNS: &str = "id, description, command, frequency, timezone, enabled, timeout_secs, retention, created_at, updated_at";

/// Raw column values of a `tasks` row; JSON and timezone columns are decoded
/// outside the rusqlite row callback.
struct TaskRow {
    id: String,
    description: String,
    command: String,
    frequency: String,
    timezone: String,
    enabled: bool,
    timeout_secs: Option<i64>,
    retention: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            description: row.get(1)?,
            command: row.get(2)?,
            frequency: row.get(3)?,
            timezone: row.get(4)?,
            enabled: row.get::<_, i64>(5)? != 0,
            timeout_secs: row.get(6)?,
            retention: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let timezone: Tz = self.timezone.parse().map_err(|_| {
            StorageError::Corrupt(format!("task {}: unknown timezone {}", self.id, self.timezone))
        })?;
        Ok(Task {
            command: serde_json::from_str(&self.command)?,
            frequency: serde_json::from_str(&self.frequency)?,
            timezone,
            enabled: self.enabled,
            timeout_secs: self.timeout_secs.map(|s| s.max(0) as u64),
            retention: self
                .retention
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            id: self.id,
            description: self.description,
        })
    }
}

/// Encoded column values shared by insert and update.
struct EncodedFields {
    command: String,
    frequency: String,
    retention: Option<String>,
}

fn encode(fields: &TaskFields) -> Result<EncodedFields> {
    Ok(EncodedFields {
        command: serde_json::to_string(&fields.command)?,
        frequency: serde_json::to_string(&fields.frequency)?,
        retention: fields
            .retention
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
    })
}

fn select_task(conn: &rusqlite::Connection, id: &str) -> Result<Option<Task>> {
    let row = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            rusqlite::params![id],
            TaskRow::from_row,
        )
        .optional()?;
    row.map(TaskRow::into_task).transpose()
}

/// Escape LIKE wildcards in a user-supplied search term.
fn like_pattern(search: &str) -> String {
    let mut pattern = String::with_capacity(search.len() + 2);
    pattern.push('%');
    for ch in search.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

#[async_trait]
impl TaskStore for TotemStorage {
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1");
            let mut params: Vec<Value> = Vec::new();
            if let Some(enabled) = filter.enabled {
                sql.push_str(" AND enabled = ?");
                params.push(Value::Integer(enabled as i64));
            }
            if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
                // SQLite LIKE is case-insensitive for ASCII.
                sql.push_str(" AND description LIKE ? ESCAPE '\\'");
                params.push(Value::Text(like_pattern(search)));
            }
            sql.push_str(" ORDER BY description COLLATE NOCASE ASC, id ASC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params), TaskRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        let id = id.to_string();
        self.with_conn(move |conn| select_task(conn, &id)).await
    }

    async fn store(&self, fields: TaskFields) -> Result<Task> {
        self.with_conn(move |conn| {
            let now = Utc::now();
            let id = uuid::Uuid::new_v4().to_string();
            let encoded = encode(&fields)?;
            conn.execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                rusqlite::params![
                    id,
                    fields.description,
                    encoded.command,
                    encoded.frequency,
                    fields.timezone.name(),
                    fields.enabled as i64,
                    fields.timeout_secs.map(|s| s as i64),
                    encoded.retention,
                    to_millis(now),
                    to_millis(now),
                ],
            )?;
            select_task(conn, &id)?
                .ok_or_else(|| StorageError::Corrupt(format!("task {id} vanished after insert")))
        })
        .await
    }

    async fn update(&self, id: &str, fields: TaskFields) -> Result<Option<Task>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let encoded = encode(&fields)?;
            let changed = conn.execute(
                "UPDATE tasks SET
                    description = ?1,
                    command = ?2,
                    frequency = ?3,
                    timezone = ?4,
                    enabled = ?5,
                    timeout_secs = ?6,
                    retention = ?7,
                    updated_at = ?8
                 WHERE id = ?9",
                rusqlite::params![
                    fields.description,
                    encoded.command,
                    encoded.frequency,
                    fields.timezone.name(),
                    fields.enabled as i64,
                    fields.timeout_secs.map(|s| s as i64),
                    encoded.retention,
                    to_millis(Utc::now()),
                    id,
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            select_task(conn, &id)
        })
        .await
    }

    async fn destroy(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let count = conn.execute("DELETE FROM tasks WHERE id = ?1", rusqlite::params![id])?;
            Ok(count > 0)
        })
        .await
    }
}
