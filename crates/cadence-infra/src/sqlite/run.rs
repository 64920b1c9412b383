//! SQLite run repository implementation.
//!
//! Runs are written in three phases: the row is inserted as `running`, step
//! results are appended with a sequence number as they finish, and the row
//! is finalized once with status, error and finish time.

use cadence_core::repository::RunRepository;
use cadence_types::error::RepositoryError;
use cadence_types::run::{Run, RunStatus, RunTrigger, StepResult, StepStatus};
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, query_error};

const RUN_COLUMNS: &str = "id, task_id, preset_name, trigger, started_at, finished_at, status, error";

/// SQLite-backed implementation of `RunRepository`.
#[derive(Clone)]
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    task_id: Option<String>,
    preset_name: String,
    trigger: String,
    started_at: String,
    finished_at: Option<String>,
    status: String,
    error: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            preset_name: row.try_get("preset_name")?,
            trigger: row.try_get("trigger")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
        })
    }

    fn into_run(self) -> Result<Run, RepositoryError> {
        let status: RunStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let trigger: RunTrigger = self.trigger.parse().map_err(RepositoryError::Query)?;

        Ok(Run {
            id: parse_uuid(&self.id)?,
            task_id: self.task_id.as_deref().map(parse_uuid).transpose()?,
            preset_name: self.preset_name,
            trigger,
            started_at: parse_datetime(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
            status,
            error: self.error,
            step_results: Vec::new(),
        })
    }
}

struct StepResultRow {
    step_id: String,
    status: String,
    duration_ms: i64,
    output_json: Option<String>,
    error: Option<String>,
    exit_code: Option<i32>,
}

impl StepResultRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_id: row.try_get("step_id")?,
            status: row.try_get("status")?,
            duration_ms: row.try_get("duration_ms")?,
            output_json: row.try_get("output_json")?,
            error: row.try_get("error")?,
            exit_code: row.try_get("exit_code")?,
        })
    }

    fn into_result(self) -> Result<StepResult, RepositoryError> {
        let status: StepStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let output = self
            .output_json
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid step output: {e}")))
            })
            .transpose()?;

        Ok(StepResult {
            step_id: self.step_id,
            status,
            duration_ms: u64::try_from(self.duration_ms).unwrap_or(0),
            output,
            error: self.error,
            exit_code: self.exit_code,
        })
    }
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO runs
               (id, task_id, preset_name, trigger, started_at, finished_at, status, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.task_id.map(|id| id.to_string()))
        .bind(&run.preset_name)
        .bind(run.trigger.to_string())
        .bind(format_datetime(&run.started_at))
        .bind(run.finished_at.as_ref().map(format_datetime))
        .bind(run.status.to_string())
        .bind(&run.error)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn append_step_result(
        &self,
        run_id: &Uuid,
        seq: u32,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        let output_json = result
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("serialize step output: {e}")))?;

        sqlx::query(
            r#"INSERT INTO step_results
               (run_id, seq, step_id, status, duration_ms, output_json, error, exit_code)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run_id.to_string())
        .bind(i64::from(seq))
        .bind(&result.step_id)
        .bind(result.status.to_string())
        .bind(i64::try_from(result.duration_ms).unwrap_or(i64::MAX))
        .bind(&output_json)
        .bind(&result.error)
        .bind(result.exit_code)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn finish_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let finished_at = run.finished_at.unwrap_or_else(Utc::now);
        let result = sqlx::query("UPDATE runs SET status = ?, error = ?, finished_at = ? WHERE id = ?")
            .bind(run.status.to_string())
            .bind(&run.error)
            .bind(format_datetime(&finished_at))
            .bind(run.id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_run(&self, id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut run = RunRow::from_row(&row).map_err(query_error)?.into_run()?;
        run.step_results = self.list_step_results(id).await?;
        Ok(Some(run))
    }

    async fn list_runs(
        &self,
        task_id: Option<&Uuid>,
        limit: u32,
    ) -> Result<Vec<Run>, RepositoryError> {
        let rows = match task_id {
            Some(task_id) => {
                sqlx::query(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE task_id = ? ORDER BY started_at DESC, id DESC LIMIT ?"
                ))
                .bind(task_id.to_string())
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC, id DESC LIMIT ?"
                ))
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_error)?;

        rows.iter()
            .map(|row| RunRow::from_row(row).map_err(query_error)?.into_run())
            .collect()
    }

    async fn list_step_results(&self, run_id: &Uuid) -> Result<Vec<StepResult>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT step_id, status, duration_ms, output_json, error, exit_code
               FROM step_results WHERE run_id = ? ORDER BY seq ASC"#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| StepResultRow::from_row(row).map_err(query_error)?.into_result())
            .collect()
    }

    async fn mark_orphaned_runs(&self, error: &str) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE runs SET status = 'error', error = ?, finished_at = ?
               WHERE status = 'running' AND trigger = 'schedule'"#,
        )
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteTaskRepository;
    use cadence_core::repository::TaskRepository;
    use cadence_types::task::Task;
    use serde_json::json;

    async fn repo() -> (SqliteRunRepository, DatabasePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(dir.path()).await.unwrap();
        (SqliteRunRepository::new(pool.clone()), pool, dir)
    }

    fn step(id: &str, status: StepStatus, output: Option<serde_json::Value>) -> StepResult {
        StepResult {
            step_id: id.to_string(),
            status,
            duration_ms: 12,
            output,
            error: (status == StepStatus::Error).then(|| "boom".to_string()),
            exit_code: None,
        }
    }

    #[tokio::test]
    async fn test_run_lifecycle_round_trip() {
        let (repo, _pool, _dir) = repo().await;
        let mut run = Run::start("digest", None, RunTrigger::Manual);
        repo.create_run(&run).await.unwrap();

        let results = [
            step("fetch", StepStatus::Success, Some(json!({"status": 200}))),
            step("check", StepStatus::Error, None),
            step("notify", StepStatus::Skipped, None),
        ];
        for (seq, r) in results.iter().enumerate() {
            repo.append_step_result(&run.id, seq as u32, r).await.unwrap();
        }

        let running = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(running.status, RunStatus::Running);
        assert!(running.finished_at.is_none());

        run.finish(RunStatus::Error, Some("step 'check' failed".into()));
        repo.finish_run(&run).await.unwrap();

        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Error);
        assert_eq!(stored.error.as_deref(), Some("step 'check' failed"));
        assert!(stored.finished_at.is_some());
        let ids: Vec<&str> = stored.step_results.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(ids, ["fetch", "check", "notify"]);
        assert_eq!(stored.step_results[0].output, Some(json!({"status": 200})));
        assert_eq!(stored.step_results[1].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_list_runs_by_task_newest_first() {
        let (repo, pool, _dir) = repo().await;
        let tasks = SqliteTaskRepository::new(pool);
        let now = Utc::now();
        let task = Task {
            id: Uuid::now_v7(),
            name: "nightly".into(),
            preset_ref: "digest".into(),
            interval_spec: "every hour".into(),
            var_overrides: Default::default(),
            enabled: true,
            next_run_at: now,
            created_at: now,
            last_run_at: None,
        };
        tasks.create_task(&task).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let run = Run::start("digest", Some(task.id), RunTrigger::Schedule);
            repo.create_run(&run).await.unwrap();
            ids.push(run.id);
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        }
        repo.create_run(&Run::start("other", None, RunTrigger::Manual))
            .await
            .unwrap();

        let listed = repo.list_runs(Some(&task.id), 2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[2]);
        assert_eq!(listed[1].id, ids[1]);
        assert_eq!(repo.list_runs(None, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_mark_orphaned_runs_only_touches_scheduled() {
        let (repo, _pool, _dir) = repo().await;
        let scheduled = Run::start("digest", None, RunTrigger::Schedule);
        let manual = Run::start("digest", None, RunTrigger::Manual);
        let mut done = Run::start("digest", None, RunTrigger::Schedule);
        repo.create_run(&scheduled).await.unwrap();
        repo.create_run(&manual).await.unwrap();
        repo.create_run(&done).await.unwrap();
        done.finish(RunStatus::Success, None);
        repo.finish_run(&done).await.unwrap();

        assert_eq!(repo.mark_orphaned_runs("interrupted").await.unwrap(), 1);
        let stored = repo.get_run(&scheduled.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Error);
        assert_eq!(stored.error.as_deref(), Some("interrupted"));
        assert_eq!(
            repo.get_run(&manual.id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
        assert_eq!(
            repo.get_run(&done.id).await.unwrap().unwrap().status,
            RunStatus::Success
        );
    }

    #[tokio::test]
    async fn test_finish_unknown_run_is_not_found() {
        let (repo, _pool, _dir) = repo().await;
        let mut run = Run::start("digest", None, RunTrigger::Manual);
        run.finish(RunStatus::Success, None);
        assert!(matches!(repo.finish_run(&run).await, Err(RepositoryError::NotFound)));
    }
}
