//! Reconstruction orchestrator CLI
//!
//! # Usage
//!
//! ```bash
//! # Reconstruct a directory of images, then mesh and texture the result
//! recon-orchestrator run --config recon.yaml --images dataset/opeka/images \
//!     --step reconstruct_mesh --step texture
//!
//! # Validate a configuration file and print the effective settings
//! recon-orchestrator check-config --config recon.yaml
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use recon_orchestration::{
    ImageUpload, JobHandle, OrchestratorConfig, ReconstructionOrchestrator, StepKind,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "recon-orchestrator")]
#[command(about = "Drive reconstruction engine steps over a set of images", long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a reconstruction from a directory of images and run it
    Run {
        /// Configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory of images, ingested in file name order
        #[arg(short, long)]
        images: PathBuf,

        /// Extra on-demand steps to run after ingestion (repeatable)
        #[arg(short, long)]
        step: Vec<String>,

        /// Focal length of the camera in pixels
        #[arg(long)]
        focal: Option<f64>,

        /// Result polling interval in milliseconds
        #[arg(long, default_value = "500")]
        poll_ms: u64,
    },

    /// Validate a configuration file and print the effective configuration
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run {
            config,
            images,
            step,
            focal,
            poll_ms,
        } => run(config, images, step, focal, Duration::from_millis(poll_ms)).await,
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn init_logging(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // stdout carries the JSON report
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = OrchestratorConfig::default();
            config.apply_env()?;
            config.validate()?;
            config
        }
    };
    Ok(config)
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;
    print!("{}", config.to_yaml()?);
    Ok(())
}

async fn run(
    config: Option<PathBuf>,
    images: PathBuf,
    steps: Vec<String>,
    focal: Option<f64>,
    poll_interval: Duration,
) -> anyhow::Result<()> {
    let config = load_config(config.as_deref())?;
    let steps = steps
        .iter()
        .map(|s| StepKind::from_str(s))
        .collect::<Result<Vec<_>, _>>()?;

    let files = image_files(&images)?;
    let Some((first, rest)) = files.split_first() else {
        bail!("No images found in {}", images.display());
    };

    let orchestrator = ReconstructionOrchestrator::from_config(&config).await?;

    let mut upload = ImageUpload::new(
        std::fs::read(first).with_context(|| format!("reading {}", first.display()))?,
    );
    if let Some(focal) = focal {
        upload = upload.with_focal(focal);
    }
    let id = orchestrator.create_reconstruction(upload).await?;
    info!("Reconstruction {} created from {}", id, first.display());

    let mut handles: Vec<JobHandle> = Vec::new();
    for path in rest {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        if let Some(handle) = orchestrator.ingest_image(&id, &bytes).await? {
            handles.push(handle);
        }
    }
    for step in steps {
        handles.push(orchestrator.request_step(&id, step).await?);
    }

    let mut jobs = Vec::with_capacity(handles.len());
    for handle in &handles {
        let status = orchestrator
            .await_result(handle.job_id, poll_interval)
            .await?;
        jobs.push(serde_json::json!({
            "job_id": handle.job_id,
            "step": handle.step,
            "result": status,
        }));
    }
    orchestrator.shutdown().await;

    let report = serde_json::json!({
        "reconstruction_id": id,
        "image_count": orchestrator.image_count(&id).await?,
        "jobs": jobs,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Image files in `dir`, sorted by name
fn image_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
            .unwrap_or(false);
        if path.is_file() && is_image {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
