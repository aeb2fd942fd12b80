//! Batch conversion engine
//!
//! Jobs are queued as tickets on a shared channel and picked up in FIFO order
//! by a fixed pool of workers running on a dedicated tokio runtime. All job
//! and batch bookkeeping lives in one [`StateTable`] behind a single mutex:
//! a transition, its result log entry and its event are produced under that
//! lock, so observers never see one without the others.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::{BatchId, JobId, default_result_log_path};
use crate::error::{EngineError, LogError};

use super::events::{EngineEvent, EventBus, Subscription};
use super::ffmpeg::{self, ProgressUpdate, RunLimits};
use super::job::JobSpec;
use super::result_log::{LogEntry, ResultLog};
use super::state::{BatchStatus, BatchSummary, JobState, StateTable};

/// Attempts per result log append before the batch records a log failure
///
/// Appends run under the state lock, so retries go straight back to the file.
const LOG_ATTEMPTS: u32 = 4;

/// Engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Worker pool size, at least 1
    pub workers: usize,
    pub job_timeout: Duration,
    /// How long a cancelled tool gets to exit before it is killed
    pub cancel_grace: Duration,
    pub tool_path: PathBuf,
    /// Accept new batches while another is still running
    pub allow_concurrent_batches: bool,
    pub log_path: PathBuf,
    /// Per-subscriber event buffer length
    pub event_buffer: usize,
    /// Done batches kept for status queries; older ones are forgotten
    pub retained_batches: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            job_timeout: Duration::from_secs(600),
            cancel_grace: Duration::from_secs(5),
            tool_path: PathBuf::from("ffmpeg"),
            allow_concurrent_batches: false,
            log_path: default_result_log_path(),
            event_buffer: 256,
            retained_batches: 64,
        }
    }
}

/// State shared between the engine handle and its workers
struct Shared {
    table: Mutex<StateTable>,
    /// Signalled whenever a batch becomes done
    batch_done: Condvar,
    events: EventBus,
    log: ResultLog,
    tool: PathBuf,
    limits: RunLimits,
    retained_batches: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StateTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move a queued job to Running and hand the worker what it needs to run it
    ///
    /// Returns None when the job was cancelled while it sat in the queue.
    fn start(&self, job: JobId) -> Option<(JobSpec, watch::Receiver<bool>)> {
        let mut table = self.lock();
        let record = table.jobs.get(&job)?;
        if record.state != JobState::Queued {
            return None;
        }
        let batch = record.batch;
        let cancel = table.batches.get(&batch)?.cancel_tx.subscribe();
        if *cancel.borrow() {
            return None;
        }

        let old = table.transition(job, JobState::Running).ok()?;
        let spec = table.jobs.get(&job)?.spec.clone()?;
        self.events.publish(EngineEvent::JobStateChanged {
            batch,
            job,
            old,
            new: JobState::Running,
        });
        Some((spec, cancel))
    }

    fn report_progress(&self, job: JobId, update: ProgressUpdate) {
        let mut table = self.lock();
        let Some(record) = table.jobs.get_mut(&job) else {
            return;
        };
        if record.state != JobState::Running {
            return;
        }
        record.progress = update.fraction;
        self.events.publish(EngineEvent::JobProgress {
            batch: record.batch,
            job,
            fraction: update.fraction,
            speed: update.speed,
            eta: update.eta,
        });
    }

    fn finish(&self, job: JobId, state: JobState) {
        let mut table = self.lock();
        let batch = match table.jobs.get(&job) {
            Some(record) => record.batch,
            None => return,
        };
        self.settle(&mut table, job, state);
        self.complete_if_done(&mut table, batch);
    }

    /// Apply a terminal transition, record it and announce it
    fn settle(&self, table: &mut StateTable, job: JobId, next: JobState) {
        let old = match table.transition(job, next.clone()) {
            Ok(old) => old,
            Err(illegal) => {
                log::warn!(
                    "Ignoring transition {} -> {} for job {}",
                    illegal.from,
                    illegal.to,
                    job
                );
                return;
            }
        };
        let Some(record) = table.jobs.get(&job) else {
            return;
        };
        let batch = record.batch;
        let duration = record.started.map(|s| s.elapsed()).unwrap_or_default();
        // The single terminal transition is the only place a spec is released
        let Some(spec) = table.release_spec(job) else {
            return;
        };

        let entry = LogEntry {
            batch,
            job,
            input: spec.input.path,
            output: spec.output_path,
            error: match &next {
                JobState::Failed(reason) => Some(reason.to_string()),
                _ => None,
            },
            state: next.clone(),
            duration,
            finished_at: Utc::now(),
        };
        match &next {
            JobState::Failed(reason) => log::warn!("{} failed: {}", entry.input.display(), reason),
            _ => log::info!(
                "{} -> {}: {}",
                entry.input.display(),
                entry.output.display(),
                next
            ),
        }

        if let Err(e) = self.append_with_retry(&entry) {
            log::error!("Result log append failed for job {}: {}", job, e);
            if let Some(session) = table.batches.get_mut(&batch) {
                session.log_failure.get_or_insert((job, e.to_string()));
            }
        }

        self.events.publish(EngineEvent::JobStateChanged {
            batch,
            job,
            old,
            new: next,
        });
    }

    fn append_with_retry(&self, entry: &LogEntry) -> Result<(), LogError> {
        let mut attempt = 1;
        loop {
            match self.log.append(entry) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= LOG_ATTEMPTS => return Err(e),
                Err(e) => {
                    log::debug!("Result log append attempt {} failed: {}", attempt, e);
                    attempt += 1;
                }
            }
        }
    }

    fn complete_if_done(&self, table: &mut StateTable, batch: BatchId) {
        if let Some(summary) = table.complete_if_done(batch) {
            log::info!(
                "Batch {} done: {} succeeded, {} failed, {} cancelled in {:.1}s",
                batch,
                summary.succeeded,
                summary.failed,
                summary.cancelled,
                summary.elapsed.as_secs_f64()
            );
            self.events.publish(EngineEvent::BatchDone { batch, summary });
            table.retire_done(batch, self.retained_batches);
            self.batch_done.notify_all();
        }
    }

    fn cancel(&self, batch: BatchId) -> Result<(), EngineError> {
        let mut table = self.lock();
        let session = table
            .batches
            .get_mut(&batch)
            .ok_or(EngineError::UnknownBatch(batch))?;
        if session.is_done() || session.cancel_requested {
            return Ok(());
        }
        session.cancel_requested = true;
        session.cancel_tx.send_replace(true);
        let jobs = session.jobs.clone();
        log::info!("Cancelling batch {}", batch);

        for job in jobs {
            let queued = table
                .jobs
                .get(&job)
                .is_some_and(|record| record.state == JobState::Queued);
            if queued {
                self.settle(&mut table, job, JobState::Cancelled);
            }
        }
        self.complete_if_done(&mut table, batch);
        Ok(())
    }
}

/// Runs batches of conversion jobs on a bounded worker pool
pub struct ConversionEngine {
    shared: Arc<Shared>,
    config: EngineConfig,
    tickets: Option<mpsc::UnboundedSender<JobId>>,
    workers: Vec<JoinHandle<()>>,
    runtime: Option<Runtime>,
}

impl ConversionEngine {
    /// Open the result log and start the worker pool
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let workers = config.workers.max(1);
        let log = ResultLog::open(&config.log_path).map_err(EngineError::LogUnavailable)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("sonifylab-worker")
            .enable_all()
            .build()
            .map_err(EngineError::Runtime)?;

        let shared = Arc::new(Shared {
            table: Mutex::new(StateTable::default()),
            batch_done: Condvar::new(),
            events: EventBus::new(config.event_buffer),
            log,
            tool: config.tool_path.clone(),
            limits: RunLimits {
                timeout: config.job_timeout,
                cancel_grace: config.cancel_grace,
            },
            retained_batches: config.retained_batches.max(1),
        });

        let (ticket_tx, ticket_rx) = mpsc::unbounded_channel::<JobId>();
        let ticket_rx = Arc::new(tokio::sync::Mutex::new(ticket_rx));

        let handles = (0..workers)
            .map(|worker_id| {
                let shared = shared.clone();
                let ticket_rx = ticket_rx.clone();
                runtime.spawn(async move {
                    loop {
                        // Hold the receiver only while waiting for the next ticket
                        let ticket = ticket_rx.lock().await.recv().await;
                        let Some(job) = ticket else {
                            break;
                        };
                        run_ticket(&shared, job).await;
                    }
                    log::debug!("Worker {} stopped", worker_id);
                })
            })
            .collect();

        log::info!(
            "Conversion engine started: {} worker(s), tool {}",
            workers,
            config.tool_path.display()
        );

        Ok(Self {
            shared,
            config: EngineConfig { workers, ..config },
            tickets: Some(ticket_tx),
            workers: handles,
            runtime: Some(runtime),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Queue a batch; all its jobs become Queued together
    pub fn submit(&self, jobs: Vec<JobSpec>) -> Result<BatchId, EngineError> {
        let tickets = self.tickets.as_ref().ok_or(EngineError::ShutDown)?;

        let mut table = self.shared.lock();
        if !self.config.allow_concurrent_batches {
            if let Some(open) = table.open_batch() {
                return Err(EngineError::Busy(open));
            }
        }
        validate_batch(&table, &jobs)?;

        let batch = BatchId::new();
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        table.insert_batch(batch, jobs);
        log::info!("Batch {} submitted with {} job(s)", batch, ids.len());
        self.shared.events.publish(EngineEvent::BatchStarted {
            batch,
            jobs: ids.len(),
        });

        for id in ids {
            if tickets.send(id).is_err() {
                // Workers are gone; nothing will ever run this job
                self.shared.settle(&mut table, id, JobState::Cancelled);
            }
        }
        self.shared.complete_if_done(&mut table, batch);
        Ok(batch)
    }

    /// Cancel every unfinished job in a batch
    ///
    /// Queued jobs are cancelled at once; running tools are asked to stop and
    /// killed after the grace period. Cancelling a finished batch does nothing.
    pub fn cancel(&self, batch: BatchId) -> Result<(), EngineError> {
        self.shared.cancel(batch)
    }

    /// Cancel `batch` once `trigger` completes
    ///
    /// The trigger runs on the engine's runtime, so it can wait on tokio
    /// sources such as `tokio::signal::ctrl_c()`. A trigger still pending at
    /// shutdown is dropped.
    pub fn cancel_when<F>(&self, batch: BatchId, trigger: F) -> Result<(), EngineError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = self.runtime.as_ref().ok_or(EngineError::ShutDown)?;
        if !self.shared.lock().batches.contains_key(&batch) {
            return Err(EngineError::UnknownBatch(batch));
        }
        let shared = self.shared.clone();
        runtime.spawn(async move {
            trigger.await;
            if let Err(e) = shared.cancel(batch) {
                log::debug!("Triggered cancel of batch {} skipped: {}", batch, e);
            }
        });
        Ok(())
    }

    /// Completion fraction of a job in [0, 1]
    pub fn progress(&self, job: JobId) -> Result<f32, EngineError> {
        let table = self.shared.lock();
        let record = table.jobs.get(&job).ok_or(EngineError::UnknownJob(job))?;
        Ok(match record.state {
            JobState::Queued => 0.0,
            JobState::Succeeded => 1.0,
            _ => record.progress.clamp(0.0, 1.0),
        })
    }

    pub fn job_state(&self, job: JobId) -> Result<JobState, EngineError> {
        let table = self.shared.lock();
        table
            .jobs
            .get(&job)
            .map(|record| record.state.clone())
            .ok_or(EngineError::UnknownJob(job))
    }

    pub fn batch_status(&self, batch: BatchId) -> Result<BatchStatus, EngineError> {
        let table = self.shared.lock();
        table
            .batches
            .get(&batch)
            .map(|session| session.status(batch))
            .ok_or(EngineError::UnknownBatch(batch))
    }

    /// Block until the batch is done
    pub fn wait(&self, batch: BatchId) -> Result<BatchSummary, EngineError> {
        let table = self.shared.lock();
        if !table.batches.contains_key(&batch) {
            return Err(EngineError::UnknownBatch(batch));
        }
        let table = self
            .shared
            .batch_done
            .wait_while(table, |t| {
                t.batches.get(&batch).is_some_and(|s| !s.is_done())
            })
            .unwrap_or_else(PoisonError::into_inner);
        finished_summary(&table, batch)
    }

    /// Like [`wait`](Self::wait), giving up after `timeout` with `Ok(None)`
    pub fn wait_timeout(
        &self,
        batch: BatchId,
        timeout: Duration,
    ) -> Result<Option<BatchSummary>, EngineError> {
        let table = self.shared.lock();
        if !table.batches.contains_key(&batch) {
            return Err(EngineError::UnknownBatch(batch));
        }
        let (table, result) = self
            .shared
            .batch_done
            .wait_timeout_while(table, timeout, |t| {
                t.batches.get(&batch).is_some_and(|s| !s.is_done())
            })
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() {
            return Ok(None);
        }
        finished_summary(&table, batch).map(Some)
    }

    /// Receive engine events published from now on
    pub fn subscribe(&self) -> Subscription {
        self.shared.events.subscribe()
    }

    /// Result log entries written for a batch
    pub fn query_log(&self, batch: BatchId) -> Result<Vec<LogEntry>, LogError> {
        self.shared.log.query(batch)
    }

    /// Cancel open batches, stop accepting work and join the workers
    ///
    /// Must not be called from inside an async context.
    pub fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        let open: Vec<BatchId> = {
            let table = self.shared.lock();
            table
                .batches
                .iter()
                .filter(|(_, session)| !session.is_done())
                .map(|(id, _)| *id)
                .collect()
        };
        for batch in open {
            let _ = self.shared.cancel(batch);
        }

        // Closing the channel lets each worker exit once the queue is drained
        self.tickets = None;
        let workers = std::mem::take(&mut self.workers);
        for result in runtime.block_on(futures::future::join_all(workers)) {
            if let Err(e) = result {
                log::error!("Worker task failed: {}", e);
            }
        }
        runtime.shutdown_timeout(self.config.cancel_grace);
        log::info!("Conversion engine shut down");
    }
}

impl Drop for ConversionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_ticket(shared: &Arc<Shared>, job: JobId) {
    let Some((spec, cancel)) = shared.start(job) else {
        return;
    };
    log::debug!(
        "Converting {} -> {}",
        spec.input.path.display(),
        spec.output_path.display()
    );
    let state = ffmpeg::run_job(&shared.tool, &spec, shared.limits, cancel, |update| {
        shared.report_progress(job, update)
    })
    .await;
    shared.finish(job, state);
}

fn validate_batch(table: &StateTable, jobs: &[JobSpec]) -> Result<(), EngineError> {
    let mut ids = HashSet::with_capacity(jobs.len());
    let mut outputs = HashSet::with_capacity(jobs.len());
    for job in jobs {
        if !ids.insert(job.id) || table.jobs.contains_key(&job.id) {
            return Err(EngineError::InvalidBatch(format!(
                "job id {} is not unique",
                job.id
            )));
        }
        if !outputs.insert(job.output_path.as_path()) {
            return Err(EngineError::InvalidBatch(format!(
                "output path {} is used by more than one job",
                job.output_path.display()
            )));
        }
        if job.output_path == job.input.path {
            return Err(EngineError::InvalidBatch(format!(
                "output path {} equals its input",
                job.output_path.display()
            )));
        }
    }
    Ok(())
}

fn finished_summary(table: &StateTable, batch: BatchId) -> Result<BatchSummary, EngineError> {
    let session = table
        .batches
        .get(&batch)
        .ok_or(EngineError::UnknownBatch(batch))?;
    if let Some((job, message)) = &session.log_failure {
        return Err(EngineError::ResultLog {
            job: *job,
            message: message.clone(),
        });
    }
    session
        .summary
        .clone()
        .ok_or(EngineError::UnknownBatch(batch))
}
