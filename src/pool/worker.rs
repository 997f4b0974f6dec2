//! Pooled worker bookkeeping
//!
//! A `Worker` is the pool's view of one worker host: its live operations,
//! its budget and its health. Only the pool actor touches it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::host::HostRequest;
use super::operation::{Operation, OperationId};

/// Starting operation budget, and the reset value after an early failure
pub const BASE_OPERATION_LIMIT: usize = 10;

/// Upper bound of the operation budget
pub const MAX_OPERATION_LIMIT: usize = 100;

/// Budget for a replacement worker.
///
/// A worker that got sick within its budget (`completed <= old`) gets a
/// replacement with double the budget, capped at `MAX_OPERATION_LIMIT`. A worker that completed more than its budget
/// before getting sick resets the replacement to `BASE_OPERATION_LIMIT`.
pub fn adapt_limit(old: usize, completed: usize) -> usize {
    if old >= completed {
        (old * 2).min(MAX_OPERATION_LIMIT)
    } else {
        BASE_OPERATION_LIMIT
    }
}

/// Unique identifier for a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(Uuid);

impl WorkerId {
    /// Create a new random worker ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Use first 8 chars for display
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Health of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Healthy,
    /// Replaced as active; drains its live operations
    Sick,
    /// Shut down or killed; accepts nothing
    Destroyed,
}

impl fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerHealth::Healthy => write!(f, "healthy"),
            WorkerHealth::Sick => write!(f, "sick"),
            WorkerHealth::Destroyed => write!(f, "destroyed"),
        }
    }
}

pub(crate) struct Worker {
    pub id: WorkerId,
    pub limit: usize,
    pub completed: usize,
    pub health: WorkerHealth,
    pub ready: bool,
    /// No longer receives work; destroyed once `live` is empty
    pub retiring: bool,
    pub live: BTreeMap<OperationId, Operation>,
    requests: mpsc::UnboundedSender<HostRequest>,
    kill: CancellationToken,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        limit: usize,
        requests: mpsc::UnboundedSender<HostRequest>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            id,
            limit,
            completed: 0,
            health: WorkerHealth::Healthy,
            ready: false,
            retiring: false,
            live: BTreeMap::new(),
            requests,
            kill,
        }
    }

    /// Take ownership of an operation and ask the host to run it
    pub fn submit(&mut self, operation: Operation) {
        let id = operation.id();
        self.send(HostRequest::Run {
            id,
            invocation: operation.invocation().clone(),
        });
        self.live.insert(id, operation);
    }

    /// Ask the host to kill a running operation
    pub fn request_cancel(&self, id: OperationId) {
        self.send(HostRequest::Cancel { id });
    }

    /// Remove a settled operation and count it
    pub fn finish(&mut self, id: OperationId) -> Option<Operation> {
        let operation = self.live.remove(&id)?;
        self.completed += 1;
        Some(operation)
    }

    /// Whether a retiring worker has drained
    pub fn is_drained(&self) -> bool {
        self.retiring && self.live.is_empty() && self.health != WorkerHealth::Destroyed
    }

    /// Ask the host to exit once idle
    pub fn shut_down(&mut self) {
        self.health = WorkerHealth::Destroyed;
        self.send(HostRequest::Shutdown);
    }

    /// Kill the host without waiting; live operations are handed back
    pub fn kill(&mut self) -> BTreeMap<OperationId, Operation> {
        self.health = WorkerHealth::Destroyed;
        self.kill.cancel();
        std::mem::take(&mut self.live)
    }

    fn send(&self, request: HostRequest) {
        // A closed channel means the host is gone; its exit event follows
        if self.requests.send(request).is_err() {
            debug!(worker = %self.id, "worker host channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapt_limit() {
        // Sick within the budget: double it
        assert_eq!(adapt_limit(10, 9), 20);
        assert_eq!(adapt_limit(10, 10), 20);
        assert_eq!(adapt_limit(50, 50), 100);

        // Capped
        assert_eq!(adapt_limit(100, 100), 100);
        assert_eq!(adapt_limit(80, 3), 100);

        // Completed more than the budget before getting sick: back to base
        assert_eq!(adapt_limit(100, 150), 10);
        assert_eq!(adapt_limit(20, 21), BASE_OPERATION_LIMIT);
    }

    #[test]
    fn test_worker_id_display() {
        let id = WorkerId::new();
        assert_eq!(id.to_string().len(), 8);
        assert_ne!(id, WorkerId::new());
    }

    #[test]
    fn test_submit_sends_run_request() {
        use crate::git::Invocation;
        use std::collections::BTreeMap as Map;
        use tokio::sync::oneshot;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = Worker::new(WorkerId::new(), BASE_OPERATION_LIMIT, tx, CancellationToken::new());

        let (responder, _result) = oneshot::channel();
        let invocation = Invocation {
            program: "git".into(),
            args: vec!["status".to_string()],
            cwd: "/repo".into(),
            env: Map::new(),
            stdin: None,
        };
        worker.submit(Operation::new(OperationId::new(3), invocation.clone(), responder));

        assert_eq!(
            rx.try_recv().unwrap(),
            HostRequest::Run {
                id: OperationId::new(3),
                invocation,
            }
        );
        assert_eq!(worker.live.len(), 1);

        assert!(worker.finish(OperationId::new(3)).is_some());
        assert!(worker.finish(OperationId::new(3)).is_none());
        assert_eq!(worker.completed, 1);
    }
}
