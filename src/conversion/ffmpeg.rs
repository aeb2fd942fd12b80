//! FFmpeg subprocess handling for audio conversion
//!
//! Any tool that accepts ffmpeg's arguments, writes the output file, reports
//! `-progress` lines on stdout and exits 0 on success can stand in for ffmpeg.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

use super::job::{JobSpec, OverwritePolicy};
use super::state::{FailureReason, JobState};

/// Lines of stderr kept for failure diagnostics
const DIAGNOSTIC_LINES: usize = 10;

/// How long to wait for the output pipes to drain after the tool exits
const PIPE_DRAIN: Duration = Duration::from_secs(1);

/// Build the tool arguments for a job writing to `output`
///
/// `-i <input> -vn -codec:a <codec> [-b:a <N>k] -progress pipe:1 <output>`.
/// The tool always writes a fresh staging file, so it is told to overwrite.
pub fn transcode_args(spec: &JobSpec, output: &Path) -> Vec<OsString> {
    let settings = &spec.settings;
    let mut args: Vec<OsString> = vec![
        "-hide_banner".into(),
        "-nostdin".into(),
        "-nostats".into(),
        "-y".into(),
        "-i".into(),
        spec.input.path.clone().into(),
        "-vn".into(),
        "-codec:a".into(),
        settings.format.codec().into(),
    ];

    if let Some(bitrate) = settings.effective_bitrate() {
        args.push("-b:a".into());
        args.push(format!("{}k", bitrate).into());
    }

    args.push("-progress".into());
    args.push("pipe:1".into());
    args.push(output.into());
    args
}

/// Hidden sibling of `output` the tool writes to
///
/// `.<stem>.part-<tag>.<ext>`; the extension is kept so the tool still picks
/// the container from it.
fn staging_path(output: &Path) -> PathBuf {
    let tag = uuid::Uuid::new_v4().simple().to_string();
    let mut name = OsString::from(".");
    name.push(output.file_stem().unwrap_or_default());
    name.push(format!(".part-{}", &tag[..8]));
    if let Some(ext) = output.extension() {
        name.push(".");
        name.push(ext);
    }
    output.with_file_name(name)
}

/// One block of the tool's `-progress` output
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// 0.0 when the input duration is unknown
    pub fraction: f32,
    pub speed: Option<f64>,
    pub eta: Option<Duration>,
}

/// Incremental parser for `key=value` progress lines
#[derive(Debug)]
pub struct ProgressParser {
    duration: Option<f64>,
    out_time: Option<f64>,
    speed: Option<f64>,
}

impl ProgressParser {
    pub fn new(duration: Option<f64>) -> Self {
        Self {
            duration: duration.filter(|d| *d > 0.0),
            out_time: None,
            speed: None,
        }
    }

    /// Feed one line; a `progress=` line closes a block and yields an update
    pub fn feed(&mut self, line: &str) -> Option<ProgressUpdate> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            "out_time_us" | "out_time_ms" => {
                // Both keys carry microseconds
                if let Ok(us) = value.parse::<i64>() {
                    if us >= 0 {
                        self.out_time = Some(us as f64 / 1_000_000.0);
                    }
                }
                None
            }
            "out_time" => {
                if let Some(secs) = parse_timestamp(value) {
                    self.out_time = Some(secs);
                }
                None
            }
            "speed" => {
                self.speed = value
                    .trim()
                    .trim_end_matches('x')
                    .parse::<f64>()
                    .ok()
                    .filter(|s| *s > 0.0);
                None
            }
            "progress" => Some(self.update(value.trim() == "end")),
            _ => None,
        }
    }

    fn update(&self, finished: bool) -> ProgressUpdate {
        let Some(duration) = self.duration else {
            return ProgressUpdate {
                fraction: 0.0,
                speed: self.speed,
                eta: None,
            };
        };
        let done = self.out_time.unwrap_or(0.0);
        let fraction = if finished {
            1.0
        } else {
            (done / duration).clamp(0.0, 1.0) as f32
        };
        let eta = self.speed.map(|speed| {
            let remaining = (duration - done).max(0.0) / speed;
            Duration::from_secs_f64(remaining)
        });
        ProgressUpdate {
            fraction,
            speed: self.speed,
            eta,
        }
    }
}

/// Parse `HH:MM:SS(.fraction)` into seconds
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts = value.trim().splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Limits applied to one tool run
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub timeout: Duration,
    pub cancel_grace: Duration,
}

enum Exit {
    Finished(std::io::Result<ExitStatus>),
    TimedOut,
    CancelRequested,
}

/// Run the tool for one job and classify the result
///
/// Returns the job's terminal state. Cancellation is cooperative: the tool's
/// process group gets SIGTERM, and only after `cancel_grace` is it killed.
///
/// The tool writes to a staging file that replaces the output only once the
/// run succeeded. A failed run never touches an existing output.
pub async fn run_job<F>(
    tool: &Path,
    spec: &JobSpec,
    limits: RunLimits,
    mut cancel: watch::Receiver<bool>,
    mut on_progress: F,
) -> JobState
where
    F: FnMut(ProgressUpdate),
{
    let output = spec.output_path.as_path();
    let staging = staging_path(output);

    let mut cmd = Command::new(tool);
    cmd.args(transcode_args(spec, &staging))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return JobState::Failed(FailureReason::Launch {
                message: format!("failed to spawn {}: {}", tool.display(), e),
            });
        }
    };
    let pid = child.id();

    let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(collect_tail(stderr)));
    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());

    let mut parser = ProgressParser::new(spec.input.duration);
    let deadline = tokio::time::sleep(limits.timeout);
    tokio::pin!(deadline);

    let exit = loop {
        tokio::select! {
            status = child.wait() => break Exit::Finished(status),
            line = next_line(&mut stdout) => match line {
                Some(line) => {
                    if let Some(update) = parser.feed(&line) {
                        on_progress(update);
                    }
                }
                None => stdout = None,
            },
            _ = &mut deadline => break Exit::TimedOut,
            _ = cancel_requested(&mut cancel) => break Exit::CancelRequested,
        }
    };

    let state = match exit {
        Exit::Finished(Ok(status)) => {
            // The exit can win the race against the last progress lines
            if let Some(lines) = stdout.as_mut() {
                let drain = async {
                    while let Ok(Some(line)) = lines.next_line().await {
                        if let Some(update) = parser.feed(&line) {
                            on_progress(update);
                        }
                    }
                };
                let _ = tokio::time::timeout(PIPE_DRAIN, drain).await;
            }
            let diagnostics = drain_diagnostics(stderr_task).await;
            classify(status, &staging, diagnostics)
        }
        Exit::Finished(Err(e)) => JobState::Failed(FailureReason::Launch {
            message: format!("failed to wait for tool: {}", e),
        }),
        Exit::TimedOut => {
            log::warn!(
                "{} timed out after {:?}, killing",
                spec.input.path.display(),
                limits.timeout
            );
            force_kill(&mut child, pid).await;
            JobState::Failed(FailureReason::Timeout)
        }
        Exit::CancelRequested => {
            signal_terminate(pid);
            match tokio::time::timeout(limits.cancel_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    // A job that finished on its own before the signal landed keeps its result
                    let diagnostics = drain_diagnostics(stderr_task).await;
                    match classify(status, &staging, diagnostics) {
                        JobState::Succeeded => JobState::Succeeded,
                        _ => JobState::Cancelled,
                    }
                }
                Ok(Err(_)) => JobState::Cancelled,
                Err(_) => {
                    log::warn!(
                        "{} ignored cancellation for {:?}, killing",
                        spec.input.path.display(),
                        limits.cancel_grace
                    );
                    force_kill(&mut child, pid).await;
                    JobState::Failed(FailureReason::CancelledForcibly)
                }
            }
        }
    };

    let state = match state {
        JobState::Succeeded => commit_output(&staging, output, spec.settings.overwrite),
        other => other,
    };
    if state != JobState::Succeeded {
        discard_staging(&staging);
    }
    state
}

/// Exit 0 and a non-empty output file is the only success
fn classify(status: ExitStatus, output: &Path, diagnostics: String) -> JobState {
    if !status.success() {
        return JobState::Failed(FailureReason::ExitStatus {
            code: status.code(),
            diagnostics,
        });
    }
    match std::fs::metadata(output) {
        Err(_) => JobState::Failed(FailureReason::MissingOutput),
        Ok(meta) if meta.len() == 0 => JobState::Failed(FailureReason::EmptyOutput),
        Ok(_) => JobState::Succeeded,
    }
}

/// Move a finished staging file onto the output path
///
/// Only `Overwrite` may replace a file that appeared since the batch was built.
fn commit_output(staging: &Path, output: &Path, overwrite: OverwritePolicy) -> JobState {
    if overwrite != OverwritePolicy::Overwrite && output.exists() {
        return JobState::Failed(FailureReason::Output {
            message: format!("{} already exists", output.display()),
        });
    }
    match std::fs::rename(staging, output) {
        Ok(()) => JobState::Succeeded,
        Err(e) => JobState::Failed(FailureReason::Output {
            message: format!("could not move output into {}: {}", output.display(), e),
        }),
    }
}

fn discard_staging(staging: &Path) {
    if staging.exists() {
        if let Err(e) = std::fs::remove_file(staging) {
            log::warn!("Could not remove partial output {}: {}", staging.display(), e);
        }
    }
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<BufReader<R>>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone: nobody can cancel any more
            std::future::pending::<()>().await;
        }
    }
}

async fn collect_tail<R>(reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if tail.len() == DIAGNOSTIC_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

async fn drain_diagnostics(task: Option<tokio::task::JoinHandle<String>>) -> String {
    let Some(task) = task else {
        return String::new();
    };
    let abort = task.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN, task).await {
        Ok(Ok(text)) => text,
        _ => {
            abort.abort();
            String::new()
        }
    }
}

/// Ask the tool (and anything it spawned) to stop
fn signal_terminate(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // The child leads its own process group
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

async fn force_kill(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    let _ = child.start_kill();
    let _ = child.wait().await;
}
