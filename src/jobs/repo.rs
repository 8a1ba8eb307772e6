//! Job repository over SQLite.
//!
//! Three operations, all atomic at the row level. The terminal-state rule
//! of the status DAG is enforced inside the UPDATE itself, so a row that
//! has reached `success` or `failed` can never change again no matter how
//! callers race.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::warn;

use super::{Job, JobError, JobStatus};

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    script_id TEXT,
    status TEXT,
    log_path TEXT,
    started_at TEXT,
    finished_at TEXT
)";

#[derive(Clone)]
pub struct JobRepo {
    pool: SqlitePool,
}

impl JobRepo {
    /// Open (creating if missing) the job database and ensure the schema.
    pub async fn connect(path: &Path) -> Result<Self, JobError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert a new job row. Must succeed before the run task is enqueued.
    pub async fn insert(&self, job: &Job) -> Result<(), JobError> {
        sqlx::query(
            "INSERT INTO jobs (id, script_id, status, log_path, started_at, finished_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.script_id)
        .bind(job.status)
        .bind(&job.log_path)
        .bind(&job.started_at)
        .bind(&job.finished_at)
        .execute(&self.pool)
        .await
        .map_err(JobError::DbInsert)?;
        Ok(())
    }

    /// Transition a job's status, setting `finished_at` (empty for
    /// non-terminal transitions). Terminal rows are left untouched.
    pub async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        finished_at: &str,
    ) -> Result<(), JobError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, finished_at = ? \
             WHERE id = ? AND status NOT IN ('success', 'failed')",
        )
        .bind(status)
        .bind(finished_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(JobError::DbUpdate)?;

        if result.rows_affected() == 0 {
            // Either the row is missing or it is already terminal.
            let existing = self.get(id).await?;
            warn!(
                job_id = %id,
                current = %existing.status,
                requested = %status,
                "status update skipped, job already terminal"
            );
        }
        Ok(())
    }

    /// Fetch a job by id.
    pub async fn get(&self, id: &str) -> Result<Job, JobError> {
        sqlx::query_as::<_, Job>(
            "SELECT id, script_id, status, log_path, started_at, finished_at \
             FROM jobs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| JobError::NotFound(id.to_string()))
    }
}
