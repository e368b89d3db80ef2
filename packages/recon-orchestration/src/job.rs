use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::reconstruction::ReconstructionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One discrete pipeline operation run by the reconstruction engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Initialize,
    Extend,
    ReconstructMesh,
    NextBestView,
    Texture,
    GeneratePly,
    GeneratePtam,
    Refine,
}

impl StepKind {
    pub const ALL: [StepKind; 8] = [
        StepKind::Initialize,
        StepKind::Extend,
        StepKind::ReconstructMesh,
        StepKind::NextBestView,
        StepKind::Texture,
        StepKind::GeneratePly,
        StepKind::GeneratePtam,
        StepKind::Refine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Initialize => "initialize",
            StepKind::Extend => "extend",
            StepKind::ReconstructMesh => "reconstruct_mesh",
            StepKind::NextBestView => "next_best_view",
            StepKind::Texture => "texture",
            StepKind::GeneratePly => "generate_ply",
            StepKind::GeneratePtam => "generate_ptam",
            StepKind::Refine => "refine",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "initialize" => Ok(StepKind::Initialize),
            "extend" => Ok(StepKind::Extend),
            "reconstruct_mesh" => Ok(StepKind::ReconstructMesh),
            "next_best_view" => Ok(StepKind::NextBestView),
            "texture" => Ok(StepKind::Texture),
            "generate_ply" => Ok(StepKind::GeneratePly),
            "generate_ptam" => Ok(StepKind::GeneratePtam),
            "refine" => Ok(StepKind::Refine),
            _ => Err(OrchestratorError::invalid_step(format!(
                "Unknown step kind: {}",
                s
            ))),
        }
    }

    /// Leading command words understood by the engine CLI
    pub fn engine_command(&self) -> &'static [&'static str] {
        match self {
            StepKind::Initialize => &["init"],
            StepKind::Extend => &["extend"],
            StepKind::ReconstructMesh => &["reconstruct_mesh"],
            StepKind::NextBestView => &["nbv"],
            StepKind::Texture => &["texture"],
            StepKind::GeneratePly => &["download", "ply"],
            StepKind::GeneratePtam => &["ptam"],
            StepKind::Refine => &["refine"],
        }
    }

    /// Substring the engine prints when the step succeeded.
    ///
    /// Steps without a marker are considered successful whenever the engine
    /// process ran to completion.
    pub fn success_marker(&self) -> Option<&'static str> {
        match self {
            StepKind::Initialize => Some("Initialization successful"),
            StepKind::Extend => Some("Extend successful"),
            _ => None,
        }
    }

    /// Steps a caller may request directly (not driven by image ingestion)
    pub fn is_on_demand(&self) -> bool {
        !matches!(self, StepKind::Initialize | StepKind::Extend)
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Step emitted by an image ingestion, with its positional arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlan {
    pub step: StepKind,
    pub args: Vec<String>,
}

impl StepPlan {
    /// Decide which step the image that brought the count to `image_count` triggers.
    ///
    /// The first image only creates the reconstruction. The second initializes
    /// it. Every later image extends it, carrying `image_count - 1` as captured
    /// now (the count keeps moving while the job waits in its chain).
    pub fn for_image_count(image_count: u32) -> Option<Self> {
        match image_count {
            0 | 1 => None,
            2 => Some(Self {
                step: StepKind::Initialize,
                args: vec![],
            }),
            n => Some(Self {
                step: StepKind::Extend,
                args: vec![(n - 1).to_string()],
            }),
        }
    }
}

/// Handle returned to callers for every submitted job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub reconstruction_id: ReconstructionId,
    pub step: StepKind,
}

/// Job state enum
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobState {
    Queued {
        queued_at: DateTime<Utc>,
        depends_on: Option<Uuid>,
    },
    Running {
        started_at: DateTime<Utc>,
        worker_id: String,
    },
    Finished {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        duration_ms: u64,
        success: bool,
    },
    Failed {
        started_at: Option<DateTime<Utc>>,
        failed_at: DateTime<Utc>,
        error: String,
        error_category: ErrorCategory,
    },
}

impl JobState {
    pub fn state_name(&self) -> &'static str {
        match self {
            JobState::Queued { .. } => "queued",
            JobState::Running { .. } => "running",
            JobState::Finished { .. } => "finished",
            JobState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished { .. } | JobState::Failed { .. })
    }
}

/// Job model
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub reconstruction_id: ReconstructionId,
    pub step: StepKind,
    /// Step-specific positional arguments appended after the fixed engine paths
    pub args: Vec<String>,
    pub depends_on: Option<Uuid>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new queued job
    pub fn new_queued(
        reconstruction_id: ReconstructionId,
        step: StepKind,
        args: Vec<String>,
        depends_on: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            reconstruction_id,
            step,
            args,
            depends_on,
            state: JobState::Queued {
                queued_at: now,
                depends_on,
            },
            created_at: now,
            updated_at: now,
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            job_id: self.id,
            reconstruction_id: self.reconstruction_id.clone(),
            step: self.step,
        }
    }
}

/// Job state machine for transitions
pub struct JobStateMachine {
    job: Job,
}

impl JobStateMachine {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    /// Transition: QUEUED → RUNNING
    pub fn start(&mut self, worker_id: String) -> Result<()> {
        match &self.job.state {
            JobState::Queued { .. } => {
                let now = Utc::now();
                self.job.state = JobState::Running {
                    started_at: now,
                    worker_id,
                };
                self.job.updated_at = now;
                Ok(())
            }
            _ => Err(OrchestratorError::InvalidStateTransition {
                from: self.job.state.state_name().to_string(),
                to: "running".to_string(),
            }),
        }
    }

    /// Transition: RUNNING → FINISHED
    pub fn finish(&mut self, success: bool) -> Result<()> {
        match &self.job.state {
            JobState::Running { started_at, .. } => {
                let now = Utc::now();
                let duration_ms = (now - *started_at).num_milliseconds().max(0) as u64;

                self.job.state = JobState::Finished {
                    started_at: *started_at,
                    finished_at: now,
                    duration_ms,
                    success,
                };
                self.job.updated_at = now;
                Ok(())
            }
            _ => Err(OrchestratorError::InvalidStateTransition {
                from: self.job.state.state_name().to_string(),
                to: "finished".to_string(),
            }),
        }
    }

    /// Transition: QUEUED | RUNNING → FAILED
    pub fn fail(&mut self, error: String, error_category: ErrorCategory) -> Result<()> {
        let started_at = match &self.job.state {
            JobState::Queued { .. } => None,
            JobState::Running { started_at, .. } => Some(*started_at),
            _ => {
                return Err(OrchestratorError::InvalidStateTransition {
                    from: self.job.state.state_name().to_string(),
                    to: "failed".to_string(),
                })
            }
        };

        let now = Utc::now();
        self.job.state = JobState::Failed {
            started_at,
            failed_at: now,
            error,
            error_category,
        };
        self.job.updated_at = now;
        Ok(())
    }
}
