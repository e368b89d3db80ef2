use crate::error::{OrchestratorError, Result};
use crate::job::Job;
use crate::parser::{self, StepResult};
use crate::storage::ReconstructionLayout;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// Everything the engine printed for one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    /// stdout followed by stderr
    pub text: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

/// The external reconstruction engine.
///
/// An `Err` means the engine could not be run at all. A run that completed
/// but did not succeed is reported through the output text.
#[async_trait]
pub trait ReconstructionEngine: Send + Sync {
    async fn invoke(&self, args: &[String]) -> Result<EngineOutput>;
}

/// Engine shipped as a command-line binary
#[derive(Debug, Clone)]
pub struct CliEngine {
    binary: PathBuf,
    working_dir: Option<PathBuf>,
}

impl CliEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl ReconstructionEngine for CliEngine {
    async fn invoke(&self, args: &[String]) -> Result<EngineOutput> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out job drops this future; the child must not outlive it
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let output = command.output().await.map_err(|e| {
            OrchestratorError::engine(format!("{}: {}", self.binary.display(), e))
        })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(EngineOutput {
            text,
            exit_code: output.status.code(),
        })
    }
}

/// Runs one job to a [`StepResult`]
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, job: &Job) -> Result<StepResult>;
}

/// [`StepRunner`] that drives a [`ReconstructionEngine`] over the on-disk layout
pub struct StepExecutor {
    layout: ReconstructionLayout,
    engine: Arc<dyn ReconstructionEngine>,
}

impl StepExecutor {
    pub fn new(layout: ReconstructionLayout, engine: Arc<dyn ReconstructionEngine>) -> Self {
        Self { layout, engine }
    }

    /// Engine argument vector: command words, image dir, camera settings,
    /// output dir, then the job's own arguments
    pub fn build_args(&self, job: &Job) -> Vec<String> {
        let id = &job.reconstruction_id;
        let mut args: Vec<String> = job
            .step
            .engine_command()
            .iter()
            .map(|word| word.to_string())
            .collect();

        // The engine concatenates file names onto the image dir
        args.push(format!("{}/", self.layout.images_dir(id).display()));
        args.push(self.layout.camera_settings_path(id).display().to_string());
        args.push(self.layout.output_dir(id).display().to_string());
        args.extend(job.args.iter().cloned());
        args
    }
}

#[async_trait]
impl StepRunner for StepExecutor {
    async fn run(&self, job: &Job) -> Result<StepResult> {
        let args = self.build_args(job);
        let output = self.engine.invoke(&args).await?;

        let result = parser::parse(job.step, &job.reconstruction_id, &output.text);
        info!(
            "Step {} for {} returned (exit code {:?}, success: {})",
            job.step, job.reconstruction_id, output.exit_code, result.success
        );
        Ok(result)
    }
}
