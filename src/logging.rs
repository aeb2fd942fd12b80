//! Logging configuration for SonifyLab
//!
//! Logs go to the terminal and to a file at
//! `<data local dir>/SonifyLab/logs/sonifylab.log`, which users can attach
//! to bug reports. The conversion result log is separate; see
//! [`ResultLog`](crate::conversion::ResultLog).

use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "sonifylab.log";
/// Rotate the log to `.old` past this size
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

pub fn get_log_directory() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("SonifyLab").join("logs"))
}

pub fn get_log_file_path() -> Option<PathBuf> {
    get_log_directory().map(|d| d.join(LOG_FILE))
}

/// Initialize terminal + file logging
///
/// `terminal_level` applies to the terminal only; the file always captures
/// debug output. Returns the log file path, or None when only terminal
/// logging could be set up.
pub fn init_logging(terminal_level: LevelFilter) -> Option<PathBuf> {
    let Some(log_dir) = get_log_directory() else {
        eprintln!("Warning: Could not determine log directory");
        init_terminal_only(terminal_level);
        return None;
    };
    init_logging_in(&log_dir, terminal_level)
}

fn init_logging_in(log_dir: &Path, terminal_level: LevelFilter) -> Option<PathBuf> {
    if let Err(e) = fs::create_dir_all(log_dir) {
        eprintln!("Warning: Could not create log directory: {}", e);
        init_terminal_only(terminal_level);
        return None;
    }

    let log_path = log_dir.join(LOG_FILE);
    rotate_if_large(&log_path);

    let log_file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file: {}", e);
            init_terminal_only(terminal_level);
            return None;
        }
    };

    let loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(
            terminal_level,
            terminal_config(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Debug, file_config(), log_file),
    ];

    if CombinedLogger::init(loggers).is_err() {
        eprintln!("Warning: Logger already initialized");
    }

    log::info!("=== SonifyLab session started ===");
    log::debug!("Log file: {}", log_path.display());

    Some(log_path)
}

fn file_config() -> Config {
    ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_thread_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .build()
}

/// Like the file config, minus decoder chatter about odd inputs
fn terminal_config() -> Config {
    ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_thread_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .add_filter_ignore_str("symphonia")
        .build()
}

fn rotate_if_large(log_path: &Path) {
    if let Ok(metadata) = fs::metadata(log_path) {
        if metadata.len() > MAX_LOG_BYTES {
            let _ = fs::rename(log_path, log_path.with_extension("log.old"));
        }
    }
}

/// Fallback when the log file cannot be used
fn init_terminal_only(level: LevelFilter) {
    let term_logger = TermLogger::new(
        level,
        terminal_config(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );
    let _ = CombinedLogger::init(vec![term_logger]);
}
