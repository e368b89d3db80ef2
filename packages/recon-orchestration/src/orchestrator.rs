use crate::config::OrchestratorConfig;
use crate::db;
use crate::error::{OrchestratorError, Result};
use crate::executor::{CliEngine, ReconstructionEngine, StepExecutor};
use crate::job::{JobHandle, StepKind, StepPlan};
use crate::reconstruction::{self, CameraSettings, ImageUpload, ReconstructionId};
use crate::result_store::{InMemoryResultStore, JobStatus, ResultStore, SqliteResultStore};
use crate::scheduler::{JobRequest, JobScheduler};
use crate::state_store::{
    InMemoryReconstructionStore, ReconstructionStore, SqliteReconstructionStore,
};
use crate::storage::{ImageStorage, ReconstructionLayout, PLY_FILE};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Answer to a PLY download request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlyAvailability {
    /// The mesh exists on disk
    Ready(PathBuf),
    /// The mesh is missing; a texture step was queued to produce it
    Generating(JobHandle),
}

/// Entry point for callers: reconstructions, image ingestion, on-demand
/// steps and result polling
pub struct ReconstructionOrchestrator {
    store: Arc<dyn ReconstructionStore>,
    storage: ImageStorage,
    scheduler: JobScheduler,
    /// Held from reading the count until the triggered step is chained
    ingest_locks: DashMap<ReconstructionId, Arc<tokio::sync::Mutex<()>>>,
    default_focal: f64,
}

impl ReconstructionOrchestrator {
    /// Build stores, engine and scheduler from configuration
    pub async fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        let (store, results): (Arc<dyn ReconstructionStore>, Arc<dyn ResultStore>) =
            match &config.database_url {
                Some(url) => {
                    let pool = db::connect(url).await?;
                    (
                        Arc::new(SqliteReconstructionStore::new(pool.clone())),
                        Arc::new(SqliteResultStore::new(pool)),
                    )
                }
                None => {
                    info!("No database configured; state is kept in memory");
                    (
                        Arc::new(InMemoryReconstructionStore::new()),
                        Arc::new(InMemoryResultStore::new()),
                    )
                }
            };

        let mut engine = CliEngine::new(resolve_binary(&config.engine.binary)?);
        if let Some(dir) = &config.engine.working_dir {
            engine = engine.with_working_dir(dir);
        }

        Self::with_components(config, store, results, Arc::new(engine))
    }

    /// Assemble from explicit stores and engine. Spawns the worker pool, so
    /// it must run inside a tokio runtime.
    pub fn with_components(
        config: &OrchestratorConfig,
        store: Arc<dyn ReconstructionStore>,
        results: Arc<dyn ResultStore>,
        engine: Arc<dyn ReconstructionEngine>,
    ) -> Result<Self> {
        let layout = ReconstructionLayout::new(&config.data_root)?;
        let executor = StepExecutor::new(layout.clone(), engine);
        let scheduler = JobScheduler::start(Arc::new(executor), results, config.scheduler_config());

        info!(
            "Reconstruction orchestrator ready (data root {})",
            layout.root().display()
        );

        Ok(Self {
            store,
            storage: ImageStorage::new(layout, config.image_write),
            scheduler,
            ingest_locks: DashMap::new(),
            default_focal: config.default_focal,
        })
    }

    pub fn layout(&self) -> &ReconstructionLayout {
        self.storage.layout()
    }

    /// Start a reconstruction from its first image. No job is emitted.
    pub async fn create_reconstruction(&self, upload: ImageUpload) -> Result<ReconstructionId> {
        let focal = upload
            .focal
            .or_else(|| reconstruction::exif_focal(&upload.bytes))
            .unwrap_or(self.default_focal);
        let settings = CameraSettings::from_image_bytes(&upload.bytes, focal)?;

        let id = ReconstructionId::generate();
        self.store.create(&id).await?;
        self.storage.prepare(&id).await?;
        self.storage.save_image(&id, 0, &upload.bytes).await?;
        self.storage.write_camera_settings(&id, &settings).await?;

        info!(
            "Created reconstruction {} ({}x{}, focal {})",
            id, settings.width, settings.height, settings.focal
        );
        Ok(id)
    }

    /// Add an image and chain the step it triggers.
    ///
    /// Ingestions of one reconstruction are serialized, so steps are chained
    /// in image order. The count only grows once the image is on disk.
    pub async fn ingest_image(
        &self,
        id: &ReconstructionId,
        bytes: &[u8],
    ) -> Result<Option<JobHandle>> {
        let lock = self.ingest_locks.entry(id.clone()).or_default().clone();
        let _ingesting = lock.lock().await;

        let index = self.store.image_count(id).await?;
        if let Err(e) = self.storage.save_image(id, index, bytes).await {
            warn!("Image {} for {} was not stored: {}", index, id, e);
            return Err(e);
        }

        let count = self.store.increment_and_get(id).await?;
        if count != index + 1 {
            warn!(
                "Image count for {} moved outside ingestion ({} -> {})",
                id, index, count
            );
        }

        let Some(plan) = StepPlan::for_image_count(count) else {
            debug!("Image {} for {} stored; nothing to run yet", index, id);
            return Ok(None);
        };

        let handle = self
            .scheduler
            .enqueue_chained(JobRequest::new(id.clone(), plan.step, plan.args))?;
        info!(
            "Image {} for {} queued {} as job {}",
            index, id, handle.step, handle.job_id
        );
        Ok(Some(handle))
    }

    /// Queue an on-demand step behind the reconstruction's pending work
    pub async fn request_step(&self, id: &ReconstructionId, step: StepKind) -> Result<JobHandle> {
        if !step.is_on_demand() {
            return Err(OrchestratorError::invalid_step(format!(
                "{} is driven by image ingestion",
                step
            )));
        }
        self.store.image_count(id).await?;

        let handle = self
            .scheduler
            .enqueue_chained(JobRequest::new(id.clone(), step, Vec::new()))?;
        info!("Queued {} for {} as job {}", step, id, handle.job_id);
        Ok(handle)
    }

    /// Current status of a job; never waits on it
    pub async fn poll_result(&self, job_id: Uuid) -> Result<JobStatus> {
        if self.scheduler.is_live(job_id) {
            return Ok(JobStatus::InProgress);
        }
        Ok(match self.scheduler.outcome(job_id).await? {
            Some(outcome) => outcome.into(),
            None => JobStatus::NotFound,
        })
    }

    /// Poll every `interval` until the job is terminal or unknown
    pub async fn await_result(&self, job_id: Uuid, interval: Duration) -> Result<JobStatus> {
        loop {
            match self.poll_result(job_id).await? {
                JobStatus::InProgress => tokio::time::sleep(interval).await,
                status => return Ok(status),
            }
        }
    }

    /// Whether the engine has produced `file_name` for `id`
    pub async fn file_available(&self, id: &ReconstructionId, file_name: &str) -> bool {
        self.storage.file_available(id, file_name).await
    }

    /// Path of the PLY mesh, or a texture job that will produce it
    pub async fn ply_or_generate(&self, id: &ReconstructionId) -> Result<PlyAvailability> {
        self.store.image_count(id).await?;

        if self.storage.file_available(id, PLY_FILE).await {
            return Ok(PlyAvailability::Ready(self.layout().ply_path(id)));
        }
        let handle = self.request_step(id, StepKind::Texture).await?;
        Ok(PlyAvailability::Generating(handle))
    }

    /// Newest unfinished job of `id`
    pub fn find_active_job(&self, id: &ReconstructionId) -> Option<JobHandle> {
        self.scheduler.find_active_job(id)
    }

    pub async fn image_count(&self, id: &ReconstructionId) -> Result<u32> {
        self.store.image_count(id).await
    }

    /// Finish running jobs and stop the workers
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

/// Anchor a relative engine path with directories to the current directory;
/// bare names are left for `PATH` lookup
fn resolve_binary(binary: &Path) -> Result<PathBuf> {
    if binary.is_absolute() || binary.components().count() < 2 {
        Ok(binary.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(binary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_binary() {
        assert_eq!(
            resolve_binary(Path::new("/opt/engine")).unwrap(),
            PathBuf::from("/opt/engine")
        );
        assert_eq!(
            resolve_binary(Path::new("reconstruction_cli")).unwrap(),
            PathBuf::from("reconstruction_cli")
        );

        let nested = resolve_binary(Path::new("build/reconstruction_cli")).unwrap();
        assert!(nested.is_absolute());
        assert!(nested.ends_with("build/reconstruction_cli"));
    }

    #[tokio::test]
    async fn test_from_config_with_in_memory_stores() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            data_root: dir.path().to_path_buf(),
            workers: 1,
            ..OrchestratorConfig::default()
        };

        let orchestrator = ReconstructionOrchestrator::from_config(&config).await.unwrap();
        assert_eq!(orchestrator.layout().root(), dir.path());
        assert!(matches!(
            orchestrator.poll_result(Uuid::new_v4()).await.unwrap(),
            JobStatus::NotFound
        ));
        orchestrator.shutdown().await;
    }
}
