//! # Centralized Error Handling
//!
//! Unified error types for the entire crate using `thiserror`.
//!
//! Every fatal condition belongs to one failure class (see [`FailureKind`]):
//! startup failures abort the whole multi-worker run, inference and write
//! failures are fatal to the worker that raised them. Nothing is retried.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Failure class of a fatal error
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Device unavailable, checkpoint unreadable, group join timeout
    Startup,
    /// Malformed input or model error during a window step
    Inference,
    /// Output sink could not persist a result
    Write,
    /// Anything outside the taxonomy (bad arguments, unexpected I/O)
    Other,
}

impl FailureKind {
    /// Process exit code used by worker processes
    pub fn exit_code(self) -> i32 {
        match self {
            FailureKind::Other => 1,
            FailureKind::Startup => 2,
            FailureKind::Inference => 3,
            FailureKind::Write => 4,
        }
    }

    /// Inverse of [`FailureKind::exit_code`] for a non-zero status
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            2 => FailureKind::Startup,
            3 => FailureKind::Inference,
            4 => FailureKind::Write,
            _ => FailureKind::Other,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Startup => "startup failure",
            FailureKind::Inference => "inference failure",
            FailureKind::Write => "write failure",
            FailureKind::Other => "failure",
        };
        f.write_str(s)
    }
}

/// A worker that did not reach the finished state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerFailure {
    pub rank: usize,
    pub kind: FailureKind,
}

/// Main error type for polisher operations
#[derive(Error, Debug)]
pub enum PolishError {
    /// I/O errors (file missing, permission denied, read/write failures)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (invalid CLI arguments, inconsistent run plan)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Device unavailable, checkpoint unreadable, process group join failure
    #[error("Startup failure: {message}")]
    Startup { message: String },

    /// Malformed window shape or model evaluation error
    #[error("Inference failure: {message}")]
    Inference { message: String },

    /// Output sink could not persist a prediction
    #[error("Write failure: {message}")]
    Write { message: String },

    /// Invalid data errors (corrupt image container, metadata mismatch)
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// File not found errors
    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    /// One or more workers did not finish
    #[error("{} worker(s) failed: {}", failures.len(), describe_failures(failures))]
    WorkerFailed { failures: Vec<WorkerFailure> },
}

fn describe_failures(failures: &[WorkerFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("rank {} ({})", f.rank, f.kind))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Type alias for Results using PolishError
pub type Result<T> = std::result::Result<T, PolishError>;

impl PolishError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a startup error
    pub fn startup(message: impl Into<String>) -> Self {
        Self::Startup {
            message: message.into(),
        }
    }

    /// Create an inference error
    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference {
            message: message.into(),
        }
    }

    /// Create a write error
    pub fn write(message: impl Into<String>) -> Self {
        Self::Write {
            message: message.into(),
        }
    }

    /// Create an invalid data error
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Failure class of this error
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Startup { .. } => FailureKind::Startup,
            // Undecodable input is a malformed-input failure of the owning worker
            Self::Inference { .. } | Self::InvalidData { .. } => FailureKind::Inference,
            Self::Write { .. } => FailureKind::Write,
            Self::WorkerFailed { failures } => {
                if failures.iter().any(|f| f.kind == FailureKind::Startup) {
                    FailureKind::Startup
                } else {
                    FailureKind::Other
                }
            }
            Self::Io(_) | Self::Config { .. } | Self::FileNotFound { .. } => FailureKind::Other,
        }
    }

    /// Exit status a process should terminate with for this error
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}
