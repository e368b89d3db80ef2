//! Job scheduler with per-reconstruction chaining
//!
//! Jobs live in one table until they are terminal. Every job waits on the
//! previous job of its reconstruction and, optionally, on one more job given
//! by the caller. A job with dependencies still in the table is parked on
//! them; everything else goes straight to the ready queue. A fixed pool of
//! workers drains the queue. When a job ends (finished or failed) its outcome
//! is stored first, then it leaves the table and dependents with nothing
//! left to wait on become ready.

use crate::dependency_index::DependencyIndex;
use crate::error::{OrchestratorError, Result};
use crate::executor::StepRunner;
use crate::job::{Job, JobHandle, JobState, JobStateMachine, StepKind};
use crate::parser::StepResult;
use crate::reconstruction::ReconstructionId;
use crate::result_store::{JobFailure, JobOutcome, ResultStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub reconstruction_id: ReconstructionId,
    pub step: StepKind,
    pub args: Vec<String>,
}

impl JobRequest {
    pub fn new(reconstruction_id: ReconstructionId, step: StepKind, args: Vec<String>) -> Self {
        Self {
            reconstruction_id,
            step,
            args,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    /// Wall-clock cap for steps without their own entry
    pub default_timeout: Option<Duration>,
    pub step_timeouts: HashMap<StepKind, Duration>,
}

impl SchedulerConfig {
    pub fn timeout_for(&self, step: StepKind) -> Option<Duration> {
        self.step_timeouts
            .get(&step)
            .copied()
            .or(self.default_timeout)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            default_timeout: None,
            step_timeouts: HashMap::from([(StepKind::Refine, Duration::from_secs(3600))]),
        }
    }
}

struct JobRecord {
    job: Job,
    /// Dependencies still in the table
    pending: usize,
    /// Jobs parked until this one is terminal
    dependents: Vec<Uuid>,
}

#[derive(Default)]
struct LiveTable {
    jobs: HashMap<Uuid, JobRecord>,
    /// Set once by `shutdown`; admission checks it under the same lock
    closed: bool,
}

struct Shared {
    runner: Arc<dyn StepRunner>,
    results: Arc<dyn ResultStore>,
    config: SchedulerConfig,
    index: DependencyIndex,
    live: Mutex<LiveTable>,
    /// Outcomes the result store rejected, kept so they stay pollable
    unsaved: Mutex<HashMap<Uuid, JobOutcome>>,
    ready_tx: mpsc::UnboundedSender<Uuid>,
    ready_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Uuid>>,
}

pub struct JobScheduler {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn start(
        runner: Arc<dyn StepRunner>,
        results: Arc<dyn ResultStore>,
        config: SchedulerConfig,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let worker_count = config.workers.max(1);

        let shared = Arc::new(Shared {
            runner,
            results,
            config,
            index: DependencyIndex::new(),
            live: Mutex::new(LiveTable::default()),
            unsaved: Mutex::new(HashMap::new()),
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
        });
        let cancel = CancellationToken::new();

        let workers = (0..worker_count)
            .map(|n| {
                let shared = shared.clone();
                let cancel = cancel.clone();
                tokio::spawn(worker_loop(shared, format!("worker-{}", n), cancel))
            })
            .collect();

        info!("Job scheduler started with {} workers", worker_count);

        Self {
            shared,
            cancel,
            workers: Mutex::new(workers),
        }
    }

    /// Submit a job behind the newest job of its reconstruction and, when
    /// given, behind `depends_on` as well. The job becomes the newest job of
    /// its reconstruction.
    pub fn enqueue(&self, request: JobRequest, depends_on: Option<Uuid>) -> Result<JobHandle> {
        let id = request.reconstruction_id.clone();
        self.shared
            .index
            .chain(&id, |tail| self.shared.admit(request, tail, depends_on))
    }

    /// Submit a job behind whatever job is newest for its reconstruction
    pub fn enqueue_chained(&self, request: JobRequest) -> Result<JobHandle> {
        self.enqueue(request, None)
    }

    /// Newest non-terminal job of `id`
    pub fn find_active_job(&self, id: &ReconstructionId) -> Option<JobHandle> {
        self.shared.index.find_active_job(id)
    }

    /// Whether the job is queued or running
    pub fn is_live(&self, job_id: Uuid) -> bool {
        self.shared.live.lock().jobs.contains_key(&job_id)
    }

    pub fn job_state(&self, job_id: Uuid) -> Option<JobState> {
        self.shared
            .live
            .lock()
            .jobs
            .get(&job_id)
            .map(|record| record.job.state.clone())
    }

    pub fn live_jobs(&self) -> usize {
        self.shared.live.lock().jobs.len()
    }

    /// Terminal outcome of a job that has left the table
    pub async fn outcome(&self, job_id: Uuid) -> Result<Option<JobOutcome>> {
        let unsaved = self.shared.unsaved.lock().get(&job_id).cloned();
        if unsaved.is_some() {
            return Ok(unsaved);
        }
        self.shared.results.get(job_id).await
    }

    /// Stop accepting work, let running jobs finish, then fail whatever is
    /// still queued
    pub async fn shutdown(&self) {
        {
            let mut live = self.shared.live.lock();
            if live.closed {
                return;
            }
            live.closed = true;
        }
        self.cancel.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        for joined in futures::future::join_all(workers).await {
            if let Err(e) = joined {
                error!("Worker exited abnormally: {}", e);
            }
        }

        let stranded: Vec<Job> = self
            .shared
            .live
            .lock()
            .jobs
            .values()
            .map(|record| record.job.clone())
            .collect();
        if !stranded.is_empty() {
            warn!("Failing {} queued jobs at shutdown", stranded.len());
        }
        for job in stranded {
            self.shared
                .conclude(job, Err(OrchestratorError::SchedulerClosed))
                .await;
        }

        info!("Job scheduler stopped");
    }
}

impl Shared {
    /// Insert a queued job behind the chain tail and the extra dependency,
    /// then route it to the ready queue or park it
    fn admit(
        &self,
        request: JobRequest,
        tail: Option<Uuid>,
        depends_on: Option<Uuid>,
    ) -> Result<JobHandle> {
        let depends_on = depends_on.filter(|dep| Some(*dep) != tail);
        let job = Job::new_queued(
            request.reconstruction_id,
            request.step,
            request.args,
            depends_on.or(tail),
        );
        let handle = job.handle();
        let job_id = job.id;

        let pending = {
            let mut live = self.live.lock();
            if live.closed {
                return Err(OrchestratorError::SchedulerClosed);
            }

            let mut pending = 0;
            for dep in tail.into_iter().chain(depends_on) {
                // A dependency missing from the table is terminal or unknown
                if let Some(record) = live.jobs.get_mut(&dep) {
                    record.dependents.push(job_id);
                    pending += 1;
                }
            }
            live.jobs.insert(
                job_id,
                JobRecord {
                    job,
                    pending,
                    dependents: Vec::new(),
                },
            );
            pending
        };

        if pending == 0 {
            self.make_ready(job_id);
        } else {
            debug!(
                "Job {} ({} for {}) waits on {} job(s)",
                job_id, handle.step, handle.reconstruction_id, pending
            );
        }

        Ok(handle)
    }

    fn make_ready(&self, job_id: Uuid) {
        if self.ready_tx.send(job_id).is_err() {
            error!("Ready queue closed; job {} will not run", job_id);
        }
    }

    /// Queued -> running, returning a snapshot for the runner
    fn mark_running(&self, job_id: Uuid, worker_id: &str) -> Option<Job> {
        let mut live = self.live.lock();
        let record = live.jobs.get_mut(&job_id)?;

        let mut sm = JobStateMachine::new(record.job.clone());
        if let Err(e) = sm.start(worker_id.to_string()) {
            warn!("Job {} not started: {}", job_id, e);
            return None;
        }
        record.job = sm.into_job();
        Some(record.job.clone())
    }

    async fn execute(&self, job_id: Uuid, worker_id: &str) {
        let Some(job) = self.mark_running(job_id, worker_id) else {
            return;
        };

        info!(
            "Job {}: {} for {} started on {}",
            job_id, job.step, job.reconstruction_id, worker_id
        );

        let runner = self.runner.clone();
        let snapshot = job.clone();
        let mut task = tokio::spawn(async move { runner.run(&snapshot).await });

        let result = match self.config.timeout_for(job.step) {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => flatten(joined),
                Err(_) => {
                    // Dropping the runner future kills the engine process
                    task.abort();
                    Err(OrchestratorError::Timeout(format!(
                        "{} exceeded {}s",
                        job.step,
                        limit.as_secs_f64()
                    )))
                }
            },
            None => flatten(task.await),
        };

        self.conclude(job, result).await;
    }

    /// Record the terminal outcome, then retire the job and wake its dependents
    async fn conclude(&self, job: Job, result: Result<StepResult>) {
        let job_id = job.id;
        let reconstruction_id = job.reconstruction_id.clone();
        let step = job.step;
        let mut sm = JobStateMachine::new(job);

        let outcome = match result {
            Ok(step_result) => {
                if let Err(e) = sm.finish(step_result.success) {
                    warn!("Job {}: {}", job_id, e);
                }
                info!(
                    "Job {}: {} for {} finished (success: {})",
                    job_id, step, reconstruction_id, step_result.success
                );
                JobOutcome::Finished(step_result)
            }
            Err(e) => {
                let category = e.category();
                if let Err(transition) = sm.fail(e.to_string(), category) {
                    warn!("Job {}: {}", job_id, transition);
                }
                error!(
                    "Job {}: {} for {} failed ({}): {}",
                    job_id, step, reconstruction_id, category, e
                );
                JobOutcome::Failed(JobFailure {
                    reconstruction_id: reconstruction_id.clone(),
                    step,
                    error: e.to_string(),
                    category,
                })
            }
        };

        if let Err(e) = self.results.put(job_id, &outcome).await {
            error!(
                "Job {}: could not store outcome, keeping it in memory: {}",
                job_id, e
            );
            self.unsaved.lock().insert(job_id, outcome);
        }

        let mut ready = Vec::new();
        {
            let mut live = self.live.lock();
            let dependents = match live.jobs.remove(&job_id) {
                Some(record) => record.dependents,
                None => {
                    warn!("Job {} concluded twice", job_id);
                    Vec::new()
                }
            };
            for dependent in dependents {
                if let Some(record) = live.jobs.get_mut(&dependent) {
                    record.pending = record.pending.saturating_sub(1);
                    if record.pending == 0 {
                        ready.push(dependent);
                    }
                }
            }
        }
        for dependent in ready {
            self.make_ready(dependent);
        }

        self.index.release(&reconstruction_id, job_id);
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: String, cancel: CancellationToken) {
    loop {
        let next = {
            let mut ready = shared.ready_rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job_id = ready.recv() => job_id,
            }
        };

        match next {
            Some(job_id) => shared.execute(job_id, &worker_id).await,
            None => break,
        }
    }
    debug!("{} stopped", worker_id);
}

fn flatten(joined: std::result::Result<Result<StepResult>, JoinError>) -> Result<StepResult> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(OrchestratorError::WorkerFault(format!(
                "step panicked: {}",
                message
            )))
        }
        Err(e) => Err(OrchestratorError::WorkerFault(e.to_string())),
    }
}
