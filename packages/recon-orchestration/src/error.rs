use crate::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Reconstruction not found: {0}")]
    ReconstructionNotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid step: {0}")]
    InvalidStep(String),

    #[error("Transient IO failure writing {} after {attempts} attempts: {source}", path.display())]
    TransientIo {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine invocation failed: {0}")]
    Engine(String),

    #[error("Worker fault: {0}")]
    WorkerFault(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Scheduler is shut down")]
    SchedulerClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn engine<E: std::fmt::Display>(e: E) -> Self {
        Self::Engine(e.to_string())
    }

    pub fn invalid_step<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidStep(e.to_string())
    }

    /// Classify a job failure for reporting.
    ///
    /// Nothing is retried automatically; the category tells the caller whether
    /// resubmitting the step is worthwhile.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout(_) | Self::TransientIo { .. } | Self::Database(_) => {
                ErrorCategory::Transient
            }
            Self::WorkerFault(_) | Self::Engine(_) | Self::Io(_) | Self::SchedulerClosed => {
                ErrorCategory::Infrastructure
            }
            _ => ErrorCategory::Permanent,
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

/// Error category for failed jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient error - resubmitting may succeed (e.g., timeout, storage hiccup)
    Transient,
    /// Permanent error - resubmitting won't help (e.g., invalid input)
    Permanent,
    /// Infrastructure error - alert ops (e.g., engine binary missing, worker crash)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::serialization(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_roundtrip() {
        for category in &[
            ErrorCategory::Transient,
            ErrorCategory::Permanent,
            ErrorCategory::Infrastructure,
        ] {
            let s = category.as_str();
            let parsed = ErrorCategory::from_str(s).unwrap();
            assert_eq!(*category, parsed);
        }
    }

    #[test]
    fn test_error_category_invalid() {
        assert!(ErrorCategory::from_str("invalid").is_err());
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            OrchestratorError::Timeout("refine".to_string()).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            OrchestratorError::WorkerFault("panicked".to_string()).category(),
            ErrorCategory::Infrastructure
        );
        assert_eq!(
            OrchestratorError::invalid_step("extend").category(),
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn test_transient_io_display_names_path() {
        let err = OrchestratorError::TransientIo {
            path: PathBuf::from("data/abc/images/3.jpg"),
            attempts: 5,
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk busy"),
        };
        let msg = err.to_string();
        assert!(msg.contains("data/abc/images/3.jpg"));
        assert!(msg.contains("5 attempts"));
    }
}
