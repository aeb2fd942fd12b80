//! Audio conversion module
//!
//! Turns expanded inputs into jobs, runs them through ffmpeg on a worker
//! pool and reports results as events and result log entries.

mod engine;
mod events;
mod ffmpeg;
mod job;
mod result_log;
mod state;

pub use engine::{ConversionEngine, EngineConfig};
pub use events::{EngineEvent, EventBus, Subscription};
pub use ffmpeg::{ProgressParser, ProgressUpdate, parse_timestamp, transcode_args};
pub use job::{BuildOutcome, DestinationPolicy, JobSpec, OutputSettings, OverwritePolicy, build_jobs};
pub use result_log::{LogEntry, ResultLog};
pub use state::{BatchCounts, BatchStatus, BatchSummary, FailureReason, JobState};

use std::path::{Path, PathBuf};

use crate::error::ToolError;

/// Name looked up on PATH when no tool is configured
pub const DEFAULT_TOOL: &str = "ffmpeg";

/// Resolve the transcoding tool
///
/// A configured path containing a separator is used as-is; anything else is
/// looked up on PATH.
pub fn locate_tool(configured: Option<&Path>) -> Result<PathBuf, ToolError> {
    let name = configured.unwrap_or(Path::new(DEFAULT_TOOL));
    if name.components().count() > 1 {
        return Ok(name.to_path_buf());
    }
    which::which(name).map_err(|_| ToolError::NotFound(name.display().to_string()))
}

/// Verify that the tool exists and is executable
pub fn verify_tool(path: &Path) -> Result<PathBuf, ToolError> {
    let metadata = std::fs::metadata(path).map_err(|e| ToolError::Inspect {
        path: path.to_path_buf(),
        source: e,
    })?;
    if !metadata.is_file() {
        return Err(ToolError::NotExecutable {
            path: path.to_path_buf(),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(ToolError::NotExecutable {
                path: path.to_path_buf(),
            });
        }
    }

    log::debug!("Tool verified at {}", path.display());
    Ok(path.to_path_buf())
}
