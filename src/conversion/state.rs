//! Job states, batch sessions and the state table the engine guards
//!
//! The table itself knows nothing about locking: the engine holds it behind a
//! single mutex, so every method here runs with that lock held.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::core::{BatchId, JobId};

use super::job::JobSpec;

/// Why a job ended in [`JobState::Failed`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The tool exited non-zero (or was killed by a signal)
    ExitStatus {
        code: Option<i32>,
        diagnostics: String,
    },
    /// The tool exited zero but wrote nothing
    MissingOutput,
    EmptyOutput,
    /// The job ran past the configured timeout and was killed
    Timeout,
    /// The tool ignored a cancel request for the whole grace period
    CancelledForcibly,
    /// The tool could not be started or supervised
    Launch { message: String },
    /// The finished output could not be put in place
    Output { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExitStatus { code, diagnostics } => {
                match code {
                    Some(code) => write!(f, "tool exited with status {}", code)?,
                    None => write!(f, "tool was terminated by a signal")?,
                }
                if !diagnostics.is_empty() {
                    write!(f, ": {}", diagnostics)?;
                }
                Ok(())
            }
            FailureReason::MissingOutput => write!(f, "tool reported success but no output was written"),
            FailureReason::EmptyOutput => write!(f, "tool reported success but the output is empty"),
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::CancelledForcibly => write!(f, "cancelled forcibly"),
            FailureReason::Launch { message } => write!(f, "could not run tool: {}", message),
            FailureReason::Output { message } => write!(f, "could not write output: {}", message),
        }
    }
}

/// Lifecycle of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed(FailureReason),
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed(_) | JobState::Cancelled
        )
    }

    /// The only legal moves: Queued → Running, Queued → Cancelled, and
    /// Running → any terminal state
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        match (self, next) {
            (JobState::Queued, JobState::Running) => true,
            (JobState::Queued, JobState::Cancelled) => true,
            (JobState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed(_) => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// Live per-state counts for a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchCounts {
    pub fn terminal(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }

    fn slot(&mut self, state: &JobState) -> &mut usize {
        match state {
            JobState::Queued => &mut self.queued,
            JobState::Running => &mut self.running,
            JobState::Succeeded => &mut self.succeeded,
            JobState::Failed(_) => &mut self.failed,
            JobState::Cancelled => &mut self.cancelled,
        }
    }

    fn apply(&mut self, old: &JobState, new: &JobState) {
        *self.slot(old) -= 1;
        *self.slot(new) += 1;
    }
}

/// Final tally of a batch, reported once when it is done
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch: BatchId,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub elapsed: Duration,
}

/// Point-in-time view of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatus {
    pub batch: BatchId,
    pub submitted: usize,
    pub counts: BatchCounts,
    pub done: bool,
    pub cancel_requested: bool,
}

pub(crate) struct JobRecord {
    /// Released once the job is terminal
    pub spec: Option<JobSpec>,
    pub batch: BatchId,
    pub state: JobState,
    pub progress: f32,
    pub started: Option<Instant>,
}

pub(crate) struct BatchSession {
    pub jobs: Vec<JobId>,
    pub counts: BatchCounts,
    pub started: Instant,
    pub summary: Option<BatchSummary>,
    pub cancel_requested: bool,
    /// Flipped to true on cancel; running workers watch it
    pub cancel_tx: watch::Sender<bool>,
    /// First result log failure for this batch, reported from `wait`
    pub log_failure: Option<(JobId, String)>,
}

impl BatchSession {
    pub fn is_done(&self) -> bool {
        self.summary.is_some()
    }

    pub fn status(&self, batch: BatchId) -> BatchStatus {
        BatchStatus {
            batch,
            submitted: self.jobs.len(),
            counts: self.counts,
            done: self.is_done(),
            cancel_requested: self.cancel_requested,
        }
    }
}

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IllegalTransition {
    pub from: JobState,
    pub to: JobState,
}

#[derive(Default)]
pub(crate) struct StateTable {
    pub jobs: HashMap<JobId, JobRecord>,
    pub batches: HashMap<BatchId, BatchSession>,
    /// Done batches, oldest first
    done: VecDeque<BatchId>,
}

impl StateTable {
    /// Insert a whole batch as Queued
    pub fn insert_batch(&mut self, batch: BatchId, specs: Vec<JobSpec>) {
        let jobs: Vec<JobId> = specs.iter().map(|s| s.id).collect();
        let (cancel_tx, _) = watch::channel(false);
        self.batches.insert(
            batch,
            BatchSession {
                counts: BatchCounts {
                    queued: jobs.len(),
                    ..BatchCounts::default()
                },
                jobs,
                started: Instant::now(),
                summary: None,
                cancel_requested: false,
                cancel_tx,
                log_failure: None,
            },
        );
        for spec in specs {
            self.jobs.insert(
                spec.id,
                JobRecord {
                    spec: Some(spec),
                    batch,
                    state: JobState::Queued,
                    progress: 0.0,
                    started: None,
                },
            );
        }
    }

    /// Apply a transition, keeping the batch counters in step
    ///
    /// Returns the previous state.
    pub fn transition(&mut self, job: JobId, next: JobState) -> Result<JobState, IllegalTransition> {
        let record = self.jobs.get_mut(&job).ok_or(IllegalTransition {
            from: JobState::Queued,
            to: next.clone(),
        })?;
        if !record.state.can_transition_to(&next) {
            return Err(IllegalTransition {
                from: record.state.clone(),
                to: next,
            });
        }

        match &next {
            JobState::Running => record.started = Some(Instant::now()),
            JobState::Succeeded => record.progress = 1.0,
            _ => {}
        }
        let old = std::mem::replace(&mut record.state, next.clone());

        if let Some(session) = self.batches.get_mut(&record.batch) {
            session.counts.apply(&old, &next);
        }
        Ok(old)
    }

    /// Mark the batch done if every job is terminal; returns the summary the first time
    pub fn complete_if_done(&mut self, batch: BatchId) -> Option<BatchSummary> {
        let session = self.batches.get_mut(&batch)?;
        if session.is_done() || session.counts.terminal() != session.jobs.len() {
            return None;
        }
        let summary = BatchSummary {
            batch,
            submitted: session.jobs.len(),
            succeeded: session.counts.succeeded,
            failed: session.counts.failed,
            cancelled: session.counts.cancelled,
            elapsed: session.started.elapsed(),
        };
        session.summary = Some(summary.clone());
        Some(summary)
    }

    /// Take the spec of a terminal job, leaving only its state and progress
    pub fn release_spec(&mut self, job: JobId) -> Option<JobSpec> {
        let record = self.jobs.get_mut(&job)?;
        if !record.state.is_terminal() {
            return None;
        }
        record.spec.take()
    }

    /// Record `batch` as done and forget the oldest done batches beyond `keep`
    pub fn retire_done(&mut self, batch: BatchId, keep: usize) {
        self.done.push_back(batch);
        while self.done.len() > keep.max(1) {
            let Some(oldest) = self.done.pop_front() else {
                break;
            };
            if let Some(session) = self.batches.remove(&oldest) {
                for job in &session.jobs {
                    self.jobs.remove(job);
                }
            }
            log::debug!("Forgot done batch {}", oldest);
        }
    }

    /// Any batch that has not finished yet
    pub fn open_batch(&self) -> Option<BatchId> {
        self.batches
            .iter()
            .find(|(_, session)| !session.is_done())
            .map(|(id, _)| *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::dummy_specs;
    use rand::Rng;

    fn all_states() -> Vec<JobState> {
        vec![
            JobState::Queued,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed(FailureReason::Timeout),
            JobState::Cancelled,
        ]
    }

    #[test]
    fn test_transition_table() {
        let allowed = [
            ("queued", "running"),
            ("queued", "cancelled"),
            ("running", "succeeded"),
            ("running", "failed"),
            ("running", "cancelled"),
        ];
        for from in all_states() {
            for to in all_states() {
                let expected = allowed.contains(&(from.label(), to.label()));
                assert_eq!(
                    from.can_transition_to(&to),
                    expected,
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_counts_follow_transitions() {
        let mut table = StateTable::default();
        let batch = BatchId::new();
        let specs = dummy_specs(3);
        let ids: Vec<JobId> = specs.iter().map(|s| s.id).collect();
        table.insert_batch(batch, specs);

        table.transition(ids[0], JobState::Running).unwrap();
        table.transition(ids[0], JobState::Succeeded).unwrap();
        table.transition(ids[1], JobState::Cancelled).unwrap();
        table.transition(ids[2], JobState::Running).unwrap();

        let counts = table.batches[&batch].counts;
        assert_eq!(
            counts,
            BatchCounts {
                queued: 0,
                running: 1,
                succeeded: 1,
                failed: 0,
                cancelled: 1
            }
        );
        assert!(table.complete_if_done(batch).is_none());

        table
            .transition(ids[2], JobState::Failed(FailureReason::MissingOutput))
            .unwrap();
        let summary = table.complete_if_done(batch).unwrap();
        assert_eq!((summary.succeeded, summary.failed, summary.cancelled), (1, 1, 1));
        // Only reported once
        assert!(table.complete_if_done(batch).is_none());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut table = StateTable::default();
        let batch = BatchId::new();
        let specs = dummy_specs(1);
        let id = specs[0].id;
        table.insert_batch(batch, specs);

        table.transition(id, JobState::Cancelled).unwrap();
        for next in all_states() {
            assert!(table.transition(id, next).is_err());
        }
        assert_eq!(table.jobs[&id].state, JobState::Cancelled);
    }

    #[test]
    fn test_spec_is_released_only_when_terminal() {
        let mut table = StateTable::default();
        let batch = BatchId::new();
        let specs = dummy_specs(1);
        let id = specs[0].id;
        table.insert_batch(batch, specs);

        assert!(table.release_spec(id).is_none());
        table.transition(id, JobState::Running).unwrap();
        assert!(table.release_spec(id).is_none());
        assert!(table.jobs[&id].spec.is_some());

        table.transition(id, JobState::Succeeded).unwrap();
        assert_eq!(table.release_spec(id).map(|s| s.id), Some(id));
        assert!(table.jobs[&id].spec.is_none());
        assert!(table.release_spec(id).is_none());
        assert_eq!(table.jobs[&id].state, JobState::Succeeded);
    }

    #[test]
    fn test_oldest_done_batches_are_forgotten() {
        let mut table = StateTable::default();
        let mut batches = Vec::new();
        for _ in 0..3 {
            let batch = BatchId::new();
            let specs = dummy_specs(2);
            let ids: Vec<JobId> = specs.iter().map(|s| s.id).collect();
            table.insert_batch(batch, specs);
            for id in &ids {
                table.transition(*id, JobState::Cancelled).unwrap();
            }
            table.complete_if_done(batch).unwrap();
            table.retire_done(batch, 2);
            batches.push((batch, ids));
        }

        let (first, first_jobs) = &batches[0];
        assert!(!table.batches.contains_key(first));
        assert!(first_jobs.iter().all(|id| !table.jobs.contains_key(id)));
        for (batch, ids) in &batches[1..] {
            assert!(table.batches.contains_key(batch));
            assert!(ids.iter().all(|id| table.jobs.contains_key(id)));
        }
        assert_eq!(table.jobs.len(), 4);
    }

    #[test]
    fn test_random_interleavings_respect_table() {
        let mut rng = rand::thread_rng();
        let states = all_states();
        for _ in 0..200 {
            let mut table = StateTable::default();
            let batch = BatchId::new();
            let specs = dummy_specs(rng.gen_range(1..6));
            let ids: Vec<JobId> = specs.iter().map(|s| s.id).collect();
            table.insert_batch(batch, specs);

            let mut done_reports = 0;
            for _ in 0..40 {
                let id = ids[rng.gen_range(0..ids.len())];
                let next = states[rng.gen_range(0..states.len())].clone();
                let before = table.jobs[&id].state.clone();
                match table.transition(id, next.clone()) {
                    Ok(old) => {
                        assert_eq!(old, before);
                        assert!(before.can_transition_to(&next));
                    }
                    Err(_) => assert_eq!(table.jobs[&id].state, before),
                }
                let counts = table.batches[&batch].counts;
                assert!(counts.terminal() <= ids.len());
                assert_eq!(
                    counts.queued + counts.running + counts.terminal(),
                    ids.len()
                );
                if table.complete_if_done(batch).is_some() {
                    done_reports += 1;
                    assert_eq!(counts.terminal(), ids.len());
                }
            }
            assert!(done_reports <= 1);
        }
    }

    #[test]
    fn test_failure_reason_display_carries_diagnostics() {
        let reason = FailureReason::ExitStatus {
            code: Some(1),
            diagnostics: "Invalid data found when processing input".to_string(),
        };
        let text = reason.to_string();
        assert!(text.contains("status 1"));
        assert!(text.contains("Invalid data found"));
        assert_eq!(FailureReason::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_job_state_serializes_with_reason() {
        let state = JobState::Failed(FailureReason::Timeout);
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"state":"failed","reason":{"kind":"timeout"}}"#);
        let back: JobState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
