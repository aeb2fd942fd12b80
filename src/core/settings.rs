//! Persistent application settings
//!
//! Persisted to `<config dir>/SonifyLab/settings.json`. Every field has a
//! default, so a missing or partial file still loads.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{DEFAULT_BITRATE, OutputFormat};
use crate::conversion::EngineConfig;
use crate::error::SettingsError;

const APP_DIR: &str = "SonifyLab";

/// Application-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Worker pool size; 0 means one per available processing unit
    pub workers: usize,
    /// Per-job timeout before the tool is killed
    pub job_timeout_secs: u64,
    /// Grace period between a cancel request and a forced kill
    pub cancel_grace_secs: u64,
    /// Transcoding tool; None looks up `ffmpeg` on PATH
    pub tool_path: Option<PathBuf>,
    /// Accept a new batch while another is still running
    pub allow_concurrent_batches: bool,
    /// Result log location; None uses the data directory
    pub log_path: Option<PathBuf>,
    /// Per-subscriber event buffer length
    pub event_buffer: usize,
    pub default_format: OutputFormat,
    pub default_bitrate: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 0,
            job_timeout_secs: 600,
            cancel_grace_secs: 5,
            tool_path: None,
            allow_concurrent_batches: false,
            log_path: None,
            event_buffer: 256,
            default_format: OutputFormat::Mp3,
            default_bitrate: DEFAULT_BITRATE,
        }
    }
}

impl Settings {
    const SETTINGS_FILE: &'static str = "settings.json";

    /// Default settings file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join(Self::SETTINGS_FILE))
    }

    /// Load settings from the default location, or return defaults
    pub fn load() -> Self {
        let loaded = Self::default_path()
            .ok_or(SettingsError::NoConfigDir)
            .and_then(|path| Self::load_from(&path));
        match loaded {
            Ok(settings) => {
                log::debug!("Loaded settings from disk");
                settings
            }
            Err(e) => {
                log::debug!("Using default settings: {}", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<(), SettingsError> {
        let path = Self::default_path().ok_or(SettingsError::NoConfigDir)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        log::debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Engine configuration derived from these settings
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            workers: if self.workers == 0 {
                defaults.workers
            } else {
                self.workers
            },
            job_timeout: Duration::from_secs(self.job_timeout_secs.max(1)),
            cancel_grace: Duration::from_secs(self.cancel_grace_secs),
            tool_path: self.tool_path.clone().unwrap_or(defaults.tool_path),
            allow_concurrent_batches: self.allow_concurrent_batches,
            log_path: self
                .log_path
                .clone()
                .unwrap_or_else(default_result_log_path),
            event_buffer: self.event_buffer.max(1),
            retained_batches: defaults.retained_batches,
        }
    }
}

/// Default result log location: `<data dir>/SonifyLab/conversion_log.jsonl`
pub fn default_result_log_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
        .join("conversion_log.jsonl")
}
