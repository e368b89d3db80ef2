use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::job::StepKind;
use crate::parser::StepResult;
use crate::reconstruction::ReconstructionId;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use uuid::Uuid;

/// Why a job ended without a step result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reconstruction_id: ReconstructionId,
    pub step: StepKind,
    pub error: String,
    pub category: ErrorCategory,
}

/// Terminal outcome of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Finished(StepResult),
    Failed(JobFailure),
}

impl JobOutcome {
    pub fn status_name(&self) -> &'static str {
        match self {
            JobOutcome::Finished(_) => "finished",
            JobOutcome::Failed(_) => "failed",
        }
    }

    pub fn reconstruction_id(&self) -> &ReconstructionId {
        match self {
            JobOutcome::Finished(result) => &result.reconstruction_id,
            JobOutcome::Failed(failure) => &failure.reconstruction_id,
        }
    }

    pub fn step(&self) -> StepKind {
        match self {
            JobOutcome::Finished(result) => result.step,
            JobOutcome::Failed(failure) => failure.step,
        }
    }
}

/// What a poller sees for a job id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    #[serde(rename = "does_not_exist")]
    NotFound,
    InProgress,
    Finished(StepResult),
    Failed(JobFailure),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished(_) | JobStatus::Failed(_))
    }
}

impl From<JobOutcome> for JobStatus {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Finished(result) => JobStatus::Finished(result),
            JobOutcome::Failed(failure) => JobStatus::Failed(failure),
        }
    }
}

/// Keyed storage of job outcomes. Each job is written exactly once, when it
/// reaches a terminal state.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put(&self, job_id: Uuid, outcome: &JobOutcome) -> Result<()>;

    async fn get(&self, job_id: Uuid) -> Result<Option<JobOutcome>>;
}

#[derive(Default)]
pub struct InMemoryResultStore {
    outcomes: DashMap<Uuid, JobOutcome>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, job_id: Uuid, outcome: &JobOutcome) -> Result<()> {
        match self.outcomes.entry(job_id) {
            Entry::Occupied(_) => Err(OrchestratorError::AlreadyExists(format!(
                "result for job {}",
                job_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(outcome.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobOutcome>> {
        Ok(self.outcomes.get(&job_id).map(|o| o.clone()))
    }
}

/// Durable store backed by the `job_results` table (outcome kept as JSON)
pub struct SqliteResultStore {
    pool: SqlitePool,
}

impl SqliteResultStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn put(&self, job_id: Uuid, outcome: &JobOutcome) -> Result<()> {
        let json = serde_json::to_string(outcome)?;
        let inserted = sqlx::query(
            "INSERT INTO job_results (job_id, reconstruction_id, step, status, outcome, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(job_id.to_string())
        .bind(outcome.reconstruction_id().as_str())
        .bind(outcome.step().as_str())
        .bind(outcome.status_name())
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                OrchestratorError::AlreadyExists(format!("result for job {}", job_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobOutcome>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT outcome FROM job_results WHERE job_id = ?1")
                .bind(job_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
