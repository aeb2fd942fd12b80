//! Append-only record of finished jobs
//!
//! One JSON object per line. Every append is flushed and synced before it
//! returns, so an entry that was acknowledged survives a crash.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{BatchId, JobId};
use crate::error::LogError;

use super::state::JobState;

/// One finished job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub batch: BatchId,
    pub job: JobId,
    pub input: PathBuf,
    pub output: PathBuf,
    pub state: JobState,
    /// Time spent running; zero for jobs cancelled while queued
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// JSON-lines result log
pub struct ResultLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl ResultLog {
    /// Open (or create) the log, creating parent directories as needed
    pub fn open(path: &Path) -> Result<Self, LogError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        log::debug!("Result log at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one entry and make it durable
    pub fn append(&self, entry: &LogEntry) -> Result<(), LogError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    /// Entries for one batch, in the order they were written
    pub fn query(&self, batch: BatchId) -> Result<Vec<LogEntry>, LogError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|entry| entry.batch == batch)
            .collect())
    }

    /// Every readable entry; corrupt lines are skipped
    pub fn read_all(&self) -> Result<Vec<LogEntry>, LogError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => log::warn!(
                    "Skipping corrupt line {} in {}: {}",
                    index + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(entries)
    }
}
