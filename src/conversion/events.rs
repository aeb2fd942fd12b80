//! Engine events and their delivery to observers
//!
//! Every subscriber owns a bounded buffer. Publishing never waits on a
//! subscriber: when a buffer is full the oldest non-terminal event in it is
//! dropped. Terminal job transitions and batch completion are always kept.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::core::{BatchId, JobId};

use super::state::{BatchSummary, JobState};

/// Events emitted by the conversion engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A batch was accepted and all its jobs are queued
    BatchStarted { batch: BatchId, jobs: usize },
    JobStateChanged {
        batch: BatchId,
        job: JobId,
        old: JobState,
        new: JobState,
    },
    /// Fractional progress parsed from the tool's progress stream
    JobProgress {
        batch: BatchId,
        job: JobId,
        fraction: f32,
        /// Encoding speed relative to real time
        speed: Option<f64>,
        eta: Option<Duration>,
    },
    /// Every job in the batch reached a terminal state
    BatchDone { batch: BatchId, summary: BatchSummary },
}

impl EngineEvent {
    /// Events that must survive buffer overflow
    pub fn is_terminal(&self) -> bool {
        match self {
            EngineEvent::BatchDone { .. } => true,
            EngineEvent::JobStateChanged { new, .. } => new.is_terminal(),
            _ => false,
        }
    }

    pub fn batch(&self) -> BatchId {
        match self {
            EngineEvent::BatchStarted { batch, .. }
            | EngineEvent::JobStateChanged { batch, .. }
            | EngineEvent::JobProgress { batch, .. }
            | EngineEvent::BatchDone { batch, .. } => *batch,
        }
    }
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<EngineEvent>,
    dropped: u64,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
}

impl SubscriberQueue {
    fn push(&self, event: EngineEvent) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.events.len() >= self.capacity {
            // Make room by dropping the oldest droppable event; terminal
            // events are allowed to grow the buffer past its bound
            if let Some(pos) = state.events.iter().position(|e| !e.is_terminal()) {
                state.events.remove(pos);
                state.dropped += 1;
            } else if !event.is_terminal() {
                state.dropped += 1;
                return;
            }
        }
        state.events.push_back(event);
        drop(state);
        self.ready.notify_one();
    }
}

/// Fan-out of engine events to any number of subscribers
pub struct EventBus {
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscriber; it sees events published from now on
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            capacity: self.capacity,
        });
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    /// Deliver an event to every live subscriber without blocking on any of them
    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(event.clone());
                true
            }
            None => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.len()
    }
}

/// Receiving end of an [`EventBus`] subscription; dropping it unsubscribes
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Block until an event is available
    pub fn recv(&self) -> EngineEvent {
        let mut state = self.queue.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(event) = state.events.pop_front() {
                return event;
            }
            state = self
                .queue
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Option<EngineEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = self.queue.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (next, _) = self
                .queue
                .ready
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
    }

    pub fn try_recv(&self) -> Option<EngineEvent> {
        self.queue
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .pop_front()
    }

    /// Take everything currently buffered
    pub fn drain(&self) -> Vec<EngineEvent> {
        self.queue
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .drain(..)
            .collect()
    }

    /// Number of events discarded because this subscriber fell behind
    pub fn dropped(&self) -> u64 {
        self.queue
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dropped
    }
}
