//! Two-lane command queue
//!
//! Reads share a parallel lane bounded by a ceiling; writes go through a
//! serial lane and act as barriers. Admission is first-in first-out by the
//! moment `enqueue` was called, so a write never overlaps an earlier task and
//! no later task starts before that write has finished.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{QueueError, Result};

/// Lower bound for the default parallel ceiling
pub const MIN_PARALLELISM: usize = 3;

/// Default parallel ceiling: `max(3, logical CPU count)`
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(MIN_PARALLELISM)
}

/// Which lane a task is admitted through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Runs alongside other parallel tasks, up to the ceiling
    Parallel,
    /// Runs alone, after everything submitted before it
    Serial,
}

impl Lane {
    /// Lane for a command given whether it mutates the repository
    pub fn for_write(is_write: bool) -> Self {
        if is_write { Lane::Serial } else { Lane::Parallel }
    }
}

struct Ticket {
    seq: u64,
    lane: Lane,
    start: oneshot::Sender<Slot>,
}

struct QueueState {
    ceiling: usize,
    running_parallel: usize,
    serial_running: bool,
    pending: VecDeque<Ticket>,
    next_seq: u64,
    disposed: bool,
}

impl QueueState {
    fn can_start(&self, lane: Lane) -> bool {
        match lane {
            Lane::Parallel => !self.serial_running && self.running_parallel < self.ceiling,
            Lane::Serial => !self.serial_running && self.running_parallel == 0,
        }
    }

    /// Start as many tasks from the head of the line as currently fit.
    fn pump(&mut self, shared: &Arc<Mutex<QueueState>>) {
        loop {
            // Callers that gave up before being admitted leave closed tickets
            while self.pending.front().is_some_and(|t| t.start.is_closed()) {
                self.pending.pop_front();
            }

            let Some(front) = self.pending.front() else {
                break;
            };
            if !self.can_start(front.lane) {
                break;
            }
            let Some(ticket) = self.pending.pop_front() else {
                break;
            };

            let slot = Slot {
                state: Arc::clone(shared),
                lane: ticket.lane,
                armed: true,
            };
            match ticket.start.send(slot) {
                Ok(()) => {
                    trace!(seq = ticket.seq, lane = ?ticket.lane, "admitted");
                    match ticket.lane {
                        Lane::Parallel => self.running_parallel += 1,
                        Lane::Serial => self.serial_running = true,
                    }
                }
                // Receiver vanished between the closed check and the send
                Err(mut slot) => slot.armed = false,
            }
        }
    }

    fn release(&mut self, lane: Lane) {
        match lane {
            Lane::Parallel => self.running_parallel = self.running_parallel.saturating_sub(1),
            Lane::Serial => self.serial_running = false,
        }
    }
}

/// Permission to run; returns the lane capacity when dropped
struct Slot {
    state: Arc<Mutex<QueueState>>,
    lane: Lane,
    armed: bool,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let shared = Arc::clone(&self.state);
        let mut state = lock(&shared);
        state.release(self.lane);
        state.pump(&shared);
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded-concurrency executor with a parallel and a serial lane
#[derive(Clone)]
pub struct CommandQueue {
    state: Arc<Mutex<QueueState>>,
}

impl CommandQueue {
    /// Create a queue with the default parallel ceiling
    pub fn new() -> Self {
        Self::with_parallelism(default_parallelism())
    }

    /// Create a queue with a custom parallel ceiling (at least one)
    pub fn with_parallelism(ceiling: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                ceiling: ceiling.max(1),
                running_parallel: 0,
                serial_running: false,
                pending: VecDeque::new(),
                next_seq: 0,
                disposed: false,
            })),
        }
    }

    /// Parallel ceiling
    pub fn parallelism(&self) -> usize {
        lock(&self.state).ceiling
    }

    /// Number of tasks waiting for admission
    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Number of tasks currently admitted
    pub fn running_count(&self) -> usize {
        let state = lock(&self.state);
        state.running_parallel + usize::from(state.serial_running)
    }

    /// Whether the queue has been disposed
    pub fn is_disposed(&self) -> bool {
        lock(&self.state).disposed
    }

    /// Queue a task.
    ///
    /// The task's place in line is taken immediately, before the returned
    /// future is polled. The task itself is only called once admitted.
    pub fn enqueue<F, Fut, T>(&self, lane: Lane, task: F) -> impl Future<Output = Result<T>> + use<F, Fut, T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit(lane);

        async move {
            let start = admission?;
            let slot = start.await.map_err(|_| QueueError::Disposed)?;
            let result = task().await;
            drop(slot);
            result
        }
    }

    fn admit(&self, lane: Lane) -> Result<oneshot::Receiver<Slot>> {
        let mut state = lock(&self.state);
        if state.disposed {
            return Err(QueueError::Disposed.into());
        }

        let (tx, rx) = oneshot::channel();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push_back(Ticket {
            seq,
            lane,
            start: tx,
        });
        debug!(seq, ?lane, pending = state.pending.len(), "enqueued");

        state.pump(&self.state);
        Ok(rx)
    }

    /// Stop accepting work and reject everything still waiting.
    ///
    /// Tasks that were already admitted run to completion.
    pub fn dispose(&self) {
        let rejected = {
            let mut state = lock(&self.state);
            state.disposed = true;
            std::mem::take(&mut state.pending)
        };
        debug!(rejected = rejected.len(), "command queue disposed");
        // Dropping the senders fails every waiting receiver
        drop(rejected);
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
