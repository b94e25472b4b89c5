use std::path::PathBuf;

use thiserror::Error;

pub type CoverageResult<T> = Result<T, CoverageError>;

/// Failure taxonomy shared by every stage of the coverage lifecycle.
///
/// Only [`CoverageError::Configuration`] and fallback-root creation
/// failures are critical; everything else is recovered by the caller's
/// guard so the instrumented handler never observes it.
#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("invalid coverage configuration: {0}")]
    Configuration(String),

    #[error("cannot derive a storage key: {0}")]
    Identity(String),

    #[error("coverage session error: {0}")]
    Session(String),

    #[error("upload failed after {attempts} attempt(s): {message}")]
    Upload { message: String, attempts: u32 },

    #[error("operation '{operation}' exceeded timeout of {timeout_seconds:.1}s")]
    Timeout {
        operation: String,
        timeout_seconds: f64,
    },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
        critical: bool,
    },

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoverageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
            critical: false,
        }
    }

    /// An i/o failure with nowhere left to persist data.
    pub fn critical_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
            critical: true,
        }
    }

    pub fn is_critical(&self) -> bool {
        match self {
            Self::Configuration(_) => true,
            Self::Io { critical, .. } => *critical,
            _ => false,
        }
    }

    /// Short, stable label used in structured logs and failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Identity(_) => "identity_error",
            Self::Session(_) => "session_error",
            Self::Upload { .. } => "upload_error",
            Self::Timeout { .. } => "timeout_error",
            Self::Validation(_) => "validation_error",
            Self::Io { .. } => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }
}
