use super::{JobMessage, JobRecord, JobState};
use crate::errors::{Error, Result};
use crate::model::Statistics;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Job results keyed by task id.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Records a new job as PENDING.
    async fn insert(&self, job: &JobMessage) -> Result<()>;

    /// Moves a PENDING job to STARTED. Returns false when the job is unknown
    /// or was already claimed, in which case it must not run.
    async fn claim(&self, task_id: Uuid) -> Result<bool>;

    async fn complete(&self, task_id: Uuid, result: &Statistics) -> Result<()>;

    async fn fail(&self, task_id: Uuid, error: &str, traceback: &str) -> Result<()>;

    async fn get(&self, task_id: Uuid) -> Result<Option<JobRecord>>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn finish(&self, task_id: Uuid, update: impl FnOnce(&mut JobRecord)) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let record = jobs
            .get_mut(&task_id)
            .ok_or_else(|| Error::not_found("Job", task_id))?;
        update(record);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &JobMessage) -> Result<()> {
        self.jobs
            .write()
            .await
            .insert(job.task_id, JobRecord::pending(job.task_id));
        Ok(())
    }

    async fn claim(&self, task_id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&task_id) {
            Some(record) if record.state == JobState::Pending => {
                record.state = JobState::Started;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, task_id: Uuid, result: &Statistics) -> Result<()> {
        self.finish(task_id, |record| {
            record.state = JobState::Success;
            record.result = Some(*result);
        })
        .await
    }

    async fn fail(&self, task_id: Uuid, error: &str, traceback: &str) -> Result<()> {
        self.finish(task_id, |record| {
            record.state = JobState::Failure;
            record.error = Some(error.to_string());
            record.traceback = Some(traceback.to_string());
        })
        .await
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<JobRecord>> {
        Ok(self.jobs.read().await.get(&task_id).cloned())
    }
}

/// Job store in the `analytics_jobs` table, shared by the server and any
/// number of worker processes.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    task_id: Uuid,
    state: String,
    result: Option<Json<Statistics>>,
    error: Option<String>,
    traceback: Option<String>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            task_id: row.task_id,
            state: row.state.parse()?,
            result: row.result.map(|Json(result)| result),
            error: row.error,
            traceback: row.traceback,
        })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &JobMessage) -> Result<()> {
        sqlx::query("INSERT INTO analytics_jobs (task_id, state, params) VALUES ($1, $2, $3)")
            .bind(job.task_id)
            .bind(JobState::Pending.as_str())
            .bind(Json(job))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn claim(&self, task_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE analytics_jobs SET state = $2, updated_at = now()
             WHERE task_id = $1 AND state = $3",
        )
        .bind(task_id)
        .bind(JobState::Started.as_str())
        .bind(JobState::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, task_id: Uuid, result: &Statistics) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE analytics_jobs SET state = $2, result = $3, updated_at = now()
             WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(JobState::Success.as_str())
        .bind(Json(result))
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::not_found("Job", task_id));
        }
        Ok(())
    }

    async fn fail(&self, task_id: Uuid, error: &str, traceback: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE analytics_jobs SET state = $2, error = $3, traceback = $4, updated_at = now()
             WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(JobState::Failure.as_str())
        .bind(error)
        .bind(traceback)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::not_found("Job", task_id));
        }
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT task_id, state, result, error, traceback FROM analytics_jobs WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRecord::try_from).transpose()
    }
}
