/*
 * Recon Orchestration - Reconstruction Job Orchestration
 *
 * Turns a stream of uploaded images into an ordered chain of engine steps
 * per reconstruction, runs them on a worker pool and keeps their results
 * available for polling.
 *
 * Architecture:
 * - Reconstruction State Store (image counter, in-memory or SQLite)
 * - Dependency Index (per-reconstruction chain tail)
 * - Job Scheduler (worker pool, timeouts, panic isolation)
 * - Step Executor (engine CLI invocation + output parsing)
 * - Result Store (terminal outcomes, in-memory or SQLite)
 */

// Public modules
pub mod config;
pub mod db;
pub mod dependency_index;
pub mod error;
pub mod executor;
pub mod job;
pub mod orchestrator;
pub mod parser;
pub mod reconstruction;
pub mod result_store;
pub mod scheduler;
pub mod state_store;
pub mod storage;

// Re-exports
pub use config::{ConfigError, OrchestratorConfig};
pub use dependency_index::DependencyIndex;
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use executor::{CliEngine, EngineOutput, ReconstructionEngine, StepExecutor, StepRunner};
pub use job::{Job, JobHandle, JobState, JobStateMachine, StepKind, StepPlan};
pub use orchestrator::{PlyAvailability, ReconstructionOrchestrator};
pub use parser::StepResult;
pub use reconstruction::{CameraSettings, ImageUpload, ReconstructionId};
pub use result_store::{InMemoryResultStore, JobFailure, JobOutcome, JobStatus, ResultStore};
pub use scheduler::{JobRequest, JobScheduler, SchedulerConfig};
pub use state_store::{InMemoryReconstructionStore, ReconstructionStore};
pub use storage::{ImageStorage, ReconstructionLayout, RetryPolicy};
