//! Orchestrator configuration (versioned YAML + environment overrides)
//!
//! ```yaml
//! version: 1
//! data_root: data
//! database_url: sqlite://recon.db
//! engine:
//!   binary: build/reconstruction_cli
//!   working_dir: build
//! workers: 4
//! image_write:
//!   max_attempts: 5
//!   backoff_ms: 250
//! timeouts:
//!   default_secs: null
//!   per_step:
//!     refine: 3600
//! default_focal: 6000.0
//! ```

use crate::job::StepKind;
use crate::scheduler::SchedulerConfig;
use crate::storage::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

pub const ENV_DATA_ROOT: &str = "RECON_DATA_ROOT";
pub const ENV_DATABASE_URL: &str = "RECON_DATABASE_URL";
pub const ENV_WORKERS: &str = "RECON_WORKERS";

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    #[error("Environment variable {var} has invalid value '{value}'")]
    InvalidEnv { var: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Engine executable
    pub binary: PathBuf,
    /// Directory the engine is started in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("build/reconstruction_cli"),
            working_dir: Some(PathBuf::from("build")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimeoutConfig {
    /// Cap for every step without its own entry; `None` = unbounded
    pub default_secs: Option<u64>,
    pub per_step: HashMap<StepKind, u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: None,
            per_step: HashMap::from([(StepKind::Refine, 3600)]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OrchestratorConfig {
    pub data_root: PathBuf,
    /// SQLite URL for durable stores; in-memory stores when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    pub engine: EngineConfig,
    pub workers: usize,
    pub image_write: RetryPolicy,
    pub timeouts: TimeoutConfig,
    /// Focal length used when an upload does not carry one
    pub default_focal: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            database_url: None,
            engine: EngineConfig::default(),
            workers: num_cpus::get(),
            image_write: RetryPolicy::default(),
            timeouts: TimeoutConfig::default(),
            default_focal: 6000.0,
        }
    }
}

/// On-disk shape: the config plus its schema version
#[derive(Serialize)]
struct ConfigFileV1<'a> {
    version: u32,
    #[serde(flatten)]
    config: &'a OrchestratorConfig,
}

impl OrchestratorConfig {
    /// Load from YAML, apply environment overrides, validate
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let mut config = Self::from_yaml(path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let mut document: serde_yaml::Value = serde_yaml::from_str(content)?;

        let version = match document
            .as_mapping_mut()
            .and_then(|map| map.remove("version"))
        {
            Some(value) => serde_yaml::from_value::<u32>(value)?,
            None => return Err(ConfigError::MissingVersion),
        };
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        Ok(serde_yaml::from_value(document)?)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        let file = ConfigFileV1 {
            version: 1,
            config: self,
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    /// Override fields from `RECON_*` environment variables
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Override fields from `lookup`, stopping at the first malformed value
    pub fn apply_env_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_DATA_ROOT) {
            self.data_root = PathBuf::from(root);
        }
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(workers) = lookup(ENV_WORKERS) {
            self.workers = workers.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_WORKERS.to_string(),
                value: workers.clone(),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        check_range("workers", self.workers as u64, 1, 1024, "Use at least one worker")?;
        check_range(
            "image_write.max_attempts",
            u64::from(self.image_write.max_attempts),
            1,
            100,
            "A write is attempted at least once",
        )?;
        check_range(
            "image_write.backoff_ms",
            self.image_write.backoff.as_millis() as u64,
            0,
            60_000,
            "Backoff is a fixed pause between attempts",
        )?;
        if let Some(secs) = self.timeouts.default_secs {
            check_range("timeouts.default_secs", secs, 1, u64::MAX, "Omit to disable the cap")?;
        }
        for (step, secs) in &self.timeouts.per_step {
            check_range(
                &format!("timeouts.per_step.{}", step),
                *secs,
                1,
                u64::MAX,
                "Remove the entry to disable the cap",
            )?;
        }
        if !(self.default_focal.is_finite() && self.default_focal > 0.0) {
            return Err(ConfigError::Range {
                field: "default_focal".to_string(),
                value: self.default_focal.to_string(),
                min: "0 (exclusive)".to_string(),
                max: "inf (exclusive)".to_string(),
                hint: "Focal length is in pixels".to_string(),
            });
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            default_timeout: self.timeouts.default_secs.map(Duration::from_secs),
            step_timeouts: self
                .timeouts
                .per_step
                .iter()
                .map(|(step, secs)| (*step, Duration::from_secs(*secs)))
                .collect(),
        }
    }
}

fn check_range(field: &str, value: u64, min: u64, max: u64, hint: &str) -> ConfigResult<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Range {
            field: field.to_string(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_focal, 6000.0);
        assert_eq!(config.data_root, PathBuf::from("data"));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_yaml_loading() {
        let yaml_content = r#"
version: 1
data_root: /srv/recon
database_url: sqlite://recon.db
engine:
  binary: /opt/engine/reconstruction_cli
workers: 3
image_write:
  max_attempts: 7
  backoff_ms: 100
timeouts:
  default_secs: 600
  per_step:
    refine: 7200
    texture: 900
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = OrchestratorConfig::from_yaml(temp_file.path()).unwrap();
        assert_eq!(config.data_root, PathBuf::from("/srv/recon"));
        assert_eq!(config.database_url.as_deref(), Some("sqlite://recon.db"));
        assert_eq!(config.engine.binary, PathBuf::from("/opt/engine/reconstruction_cli"));
        assert_eq!(config.engine.working_dir, None);
        assert_eq!(config.workers, 3);
        assert_eq!(config.image_write.max_attempts, 7);
        assert_eq!(config.image_write.backoff, Duration::from_millis(100));
        assert_eq!(config.default_focal, 6000.0);

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.timeout_for(StepKind::Refine), Some(Duration::from_secs(7200)));
        assert_eq!(scheduler.timeout_for(StepKind::Texture), Some(Duration::from_secs(900)));
        assert_eq!(scheduler.timeout_for(StepKind::Extend), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = OrchestratorConfig::default();
        config.workers = 2;
        config.database_url = Some("sqlite::memory:".to_string());

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));
        assert!(yaml.contains("workers: 2"));
        assert!(yaml.contains("backoff_ms: 250"));

        let parsed = OrchestratorConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_yaml_missing_version() {
        let result = OrchestratorConfig::from_yaml_str("workers: 2\n");
        assert!(matches!(result, Err(ConfigError::MissingVersion)));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let result = OrchestratorConfig::from_yaml_str("version: 2\n");
        assert!(matches!(
            result,
            Err(ConfigError::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        let result = OrchestratorConfig::from_yaml_str("version: 1\nworkerz: 2\n");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_range_validation() {
        let mut config = OrchestratorConfig::default();
        config.workers = 0;
        match config.validate() {
            Err(ConfigError::Range { field, .. }) => assert_eq!(field, "workers"),
            other => panic!("Expected range error, got {:?}", other),
        }

        let mut config = OrchestratorConfig::default();
        config.default_focal = -1.0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.timeouts.per_step.insert(StepKind::Texture, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = OrchestratorConfig::default();
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_DATA_ROOT, "/mnt/scans"),
            (ENV_DATABASE_URL, "sqlite:///var/lib/recon.db"),
            (ENV_WORKERS, " 12 "),
        ]);

        config
            .apply_env_from(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.data_root, PathBuf::from("/mnt/scans"));
        assert_eq!(config.database_url.as_deref(), Some("sqlite:///var/lib/recon.db"));
        assert_eq!(config.workers, 12);
    }

    #[test]
    fn test_env_bad_worker_count() {
        let mut config = OrchestratorConfig::default();
        let result = config.apply_env_from(|var| (var == ENV_WORKERS).then(|| "many".to_string()));
        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }
}
