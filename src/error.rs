//! Error types shared by the expander, the job builder and the engine
//!
//! Job-level failures are not errors here: they live in
//! [`FailureReason`](crate::conversion::FailureReason) and never escalate
//! past the job that produced them.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::{BatchId, JobId};

/// Problems with the user's selection or destination, raised before any job starts
#[derive(Debug, Error)]
pub enum InputError {
    /// A selected path does not exist or cannot be read
    #[error("cannot read selection {path}: {source}")]
    UnreadableSelection {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The destination directory could not be created or written to
    #[error("destination {path} is not writable: {source}")]
    DestinationNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An input has no parent directory to write next to
    #[error("no destination directory for {0}")]
    NoDestination(PathBuf),
}

/// Invalid engine operations and engine-level failures
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is busy with batch {0}")]
    Busy(BatchId),

    #[error("unknown batch {0}")]
    UnknownBatch(BatchId),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// A result log append kept failing after the bounded retries
    #[error("result log write failed for job {job}: {message}")]
    ResultLog { job: JobId, message: String },

    #[error("cannot open result log: {0}")]
    LogUnavailable(#[source] LogError),

    #[error("failed to start worker runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("engine has been shut down")]
    ShutDown,
}

/// The external transcoding tool could not be located or used
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0} not found on PATH")]
    NotFound(String),

    #[error("{path} is not executable")]
    NotExecutable { path: PathBuf },

    #[error("cannot inspect {path}: {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Settings file problems
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not determine configuration directory")]
    NoConfigDir,

    #[error("settings I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings file is malformed: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result log storage failures
#[derive(Debug, Error)]
pub enum LogError {
    #[error("result log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("result log entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}
