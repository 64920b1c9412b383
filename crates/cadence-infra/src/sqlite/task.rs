//! SQLite task repository implementation.
//!
//! Implements `TaskRepository` from `cadence-core`. Variable overrides are
//! stored as a JSON object; timestamps as millisecond RFC 3339 text.

use cadence_core::repository::TaskRepository;
use cadence_types::error::RepositoryError;
use cadence_types::task::Task;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, query_error};

const TASK_COLUMNS: &str = "id, name, preset_ref, interval_spec, var_overrides_json, enabled, next_run_at, created_at, last_run_at";

/// SQLite-backed implementation of `TaskRepository`.
#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: DatabasePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct TaskRow {
    id: String,
    name: String,
    preset_ref: String,
    interval_spec: String,
    var_overrides_json: String,
    enabled: bool,
    next_run_at: String,
    created_at: String,
    last_run_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            preset_ref: row.try_get("preset_ref")?,
            interval_spec: row.try_get("interval_spec")?,
            var_overrides_json: row.try_get("var_overrides_json")?,
            enabled: row.try_get("enabled")?,
            next_run_at: row.try_get("next_run_at")?,
            created_at: row.try_get("created_at")?,
            last_run_at: row.try_get("last_run_at")?,
        })
    }

    fn into_task(self) -> Result<Task, RepositoryError> {
        let var_overrides: Map<String, Value> = serde_json::from_str(&self.var_overrides_json)
            .map_err(|e| RepositoryError::Query(format!("invalid var overrides JSON: {e}")))?;

        Ok(Task {
            id: parse_uuid(&self.id)?,
            name: self.name,
            preset_ref: self.preset_ref,
            interval_spec: self.interval_spec,
            var_overrides,
            enabled: self.enabled,
            next_run_at: parse_datetime(&self.next_run_at)?,
            created_at: parse_datetime(&self.created_at)?,
            last_run_at: self.last_run_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

fn rows_to_tasks(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Task>, RepositoryError> {
    rows.iter()
        .map(|row| TaskRow::from_row(row).map_err(query_error)?.into_task())
        .collect()
}

impl TaskRepository for SqliteTaskRepository {
    async fn create_task(&self, task: &Task) -> Result<(), RepositoryError> {
        let overrides = serde_json::to_string(&task.var_overrides)
            .map_err(|e| RepositoryError::Query(format!("serialize var overrides: {e}")))?;

        sqlx::query(
            r#"INSERT INTO tasks
               (id, name, preset_ref, interval_spec, var_overrides_json, enabled,
                next_run_at, created_at, last_run_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(&task.name)
        .bind(&task.preset_ref)
        .bind(&task.interval_spec)
        .bind(&overrides)
        .bind(task.enabled)
        .bind(format_datetime(&task.next_run_at))
        .bind(format_datetime(&task.created_at))
        .bind(task.last_run_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("task '{}' already exists", task.name))
            }
            other => query_error(other),
        })?;

        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|r| TaskRow::from_row(&r).map_err(query_error)?.into_task())
            .transpose()
    }

    async fn get_task_by_name(&self, name: &str) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE name = ?"))
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|r| TaskRow::from_row(&r).map_err(query_error)?.into_task())
            .transpose()
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY name ASC"))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        rows_to_tasks(&rows)
    }

    async fn set_enabled(
        &self,
        id: &Uuid,
        enabled: bool,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE tasks SET enabled = ?, next_run_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(format_datetime(&next_run_at))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_task(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE enabled = 1 AND next_run_at <= ? ORDER BY next_run_at ASC"
        ))
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        rows_to_tasks(&rows)
    }

    async fn claim(
        &self,
        id: &Uuid,
        observed: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE tasks SET next_run_at = ? WHERE id = ? AND enabled = 1 AND next_run_at = ?",
        )
        .bind(format_datetime(&next))
        .bind(id.to_string())
        .bind(format_datetime(&observed))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn reschedule(
        &self,
        id: &Uuid,
        observed: DateTime<Utc>,
        next: DateTime<Utc>,
        last_run_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let observed = format_datetime(&observed);
        let result = sqlx::query(
            r#"UPDATE tasks
               SET next_run_at = CASE WHEN next_run_at = ? THEN ? ELSE next_run_at END,
                   last_run_at = ?
               WHERE id = ?
               RETURNING next_run_at = ? AS moved"#,
        )
        .bind(&observed)
        .bind(format_datetime(&next))
        .bind(format_datetime(&last_run_at))
        .bind(id.to_string())
        .bind(format_datetime(&next))
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(row_flag(result)?.unwrap_or(false))
    }
}

fn row_flag(row: Option<sqlx::sqlite::SqliteRow>) -> Result<Option<bool>, RepositoryError> {
    row.map(|r| r.try_get::<i64, _>("moved").map(|v| v != 0).map_err(query_error))
        .transpose()
}
