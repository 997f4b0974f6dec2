//! Operation state machine
//!
//! One unit of work dispatched to a pooled worker. The caller holds the
//! receiving half of a one-shot channel; the operation holds the sender and
//! gives it up on the first terminal transition, so the caller is resolved
//! exactly once.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::git::{Invocation, RawOutput};

/// Monotonic operation identifier; also the resubmission ordering key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(u64);

impl OperationId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Handed to a worker, process not yet running
    Pending,
    /// The process is running
    InProgress,
    /// Cancel sent, waiting for the worker to acknowledge
    Cancelling,
    /// Terminal: the caller got `Error::Cancelled`
    Cancelled,
    /// Terminal: the caller got a result or a failure
    Complete,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Cancelled | OperationStatus::Complete)
    }
}

/// What a cancel request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The operation had not started; nothing was done
    NotStarted,
    /// The operation moved to `Cancelling`; the worker must be told
    Requested,
    AlreadyCancelling,
    AlreadySettled,
}

pub(crate) type Responder = oneshot::Sender<Result<RawOutput>>;

/// A unit of pooled work
#[derive(Debug)]
pub struct Operation {
    id: OperationId,
    invocation: Invocation,
    status: OperationStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    responder: Option<Responder>,
}

impl Operation {
    pub(crate) fn new(id: OperationId, invocation: Invocation, responder: Responder) -> Self {
        Self {
            id,
            invocation,
            status: OperationStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            responder: Some(responder),
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Pending → InProgress, once the process actually exists
    pub fn mark_started(&mut self) -> bool {
        if self.status != OperationStatus::Pending {
            return false;
        }
        self.status = OperationStatus::InProgress;
        self.started_at = Some(Utc::now());
        true
    }

    /// Settle with the process output. Returns false if already settled.
    ///
    /// Also wins over a cancel that has not been acknowledged yet.
    pub fn complete(&mut self, output: RawOutput) -> bool {
        self.settle(OperationStatus::Complete, Ok(output))
    }

    /// Settle as a failure. Returns false if already settled.
    pub fn error(&mut self, err: Error) -> bool {
        self.settle(OperationStatus::Complete, Err(err))
    }

    /// Request cancellation
    pub fn cancel(&mut self) -> CancelOutcome {
        match self.status {
            OperationStatus::Pending => CancelOutcome::NotStarted,
            OperationStatus::InProgress => {
                self.status = OperationStatus::Cancelling;
                CancelOutcome::Requested
            }
            OperationStatus::Cancelling => CancelOutcome::AlreadyCancelling,
            OperationStatus::Cancelled | OperationStatus::Complete => CancelOutcome::AlreadySettled,
        }
    }

    /// The worker confirmed the process was killed.
    ///
    /// Never resurrects a settled operation.
    pub fn acknowledge_cancel(&mut self) -> bool {
        if self.status != OperationStatus::Cancelling {
            debug!(id = %self.id, status = ?self.status, "cancel acknowledged outside of Cancelling");
        }
        self.settle(OperationStatus::Cancelled, Err(Error::Cancelled))
    }

    /// Prepare to move to a replacement worker.
    ///
    /// Returns true if the operation should be resubmitted. An operation
    /// that was being cancelled is settled as cancelled instead.
    pub fn reset_for_resubmission(&mut self) -> bool {
        match self.status {
            OperationStatus::Pending | OperationStatus::InProgress => {
                self.status = OperationStatus::Pending;
                self.started_at = None;
                true
            }
            OperationStatus::Cancelling => {
                self.acknowledge_cancel();
                false
            }
            OperationStatus::Cancelled | OperationStatus::Complete => false,
        }
    }

    fn settle(&mut self, status: OperationStatus, result: Result<RawOutput>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());

        if let Some(responder) = self.responder.take() {
            // The caller may have stopped waiting
            let _ = responder.send(result);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn operation() -> (Operation, oneshot::Receiver<Result<RawOutput>>) {
        let (tx, rx) = oneshot::channel();
        let invocation = Invocation {
            program: PathBuf::from("git"),
            args: vec!["status".to_string()],
            cwd: PathBuf::from("/repo"),
            env: BTreeMap::new(),
            stdin: None,
        };
        (Operation::new(OperationId::new(1), invocation, tx), rx)
    }

    fn output(stdout: &str) -> RawOutput {
        RawOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[tokio::test]
    async fn test_happy_path() {
        let (mut op, rx) = operation();
        assert_eq!(op.status(), OperationStatus::Pending);

        assert!(op.mark_started());
        assert!(!op.mark_started());
        assert_eq!(op.status(), OperationStatus::InProgress);
        assert!(op.started_at().is_some());

        assert!(op.complete(output("ok")));
        assert_eq!(op.status(), OperationStatus::Complete);
        assert!(op.finished_at().is_some());
        assert_eq!(rx.await.unwrap().unwrap().stdout, "ok");
    }

    #[test]
    fn test_cancel_pending_is_noop() {
        let (mut op, _rx) = operation();
        assert_eq!(op.cancel(), CancelOutcome::NotStarted);
        assert_eq!(op.status(), OperationStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_then_acknowledge() {
        let (mut op, rx) = operation();
        op.mark_started();

        assert_eq!(op.cancel(), CancelOutcome::Requested);
        assert_eq!(op.cancel(), CancelOutcome::AlreadyCancelling);
        assert!(op.acknowledge_cancel());
        assert_eq!(op.status(), OperationStatus::Cancelled);
        assert_eq!(op.cancel(), CancelOutcome::AlreadySettled);

        assert!(rx.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_completion_before_ack_is_success() {
        let (mut op, rx) = operation();
        op.mark_started();
        op.cancel();

        assert!(op.complete(output("done anyway")));
        assert!(!op.acknowledge_cancel());
        assert_eq!(op.status(), OperationStatus::Complete);
        assert_eq!(rx.await.unwrap().unwrap().stdout, "done anyway");
    }

    #[tokio::test]
    async fn test_error_settles_once() {
        let (mut op, rx) = operation();
        assert!(op.error(Error::Operation(crate::error::OperationError::Failed(
            "boom".to_string()
        ))));
        assert!(!op.complete(output("late")));
        assert!(!op.error(Error::Cancelled));

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Operation(_)));
    }

    #[tokio::test]
    async fn test_reset_for_resubmission() {
        let (mut op, _rx) = operation();
        op.mark_started();
        assert!(op.reset_for_resubmission());
        assert_eq!(op.status(), OperationStatus::Pending);
        assert!(op.started_at().is_none());

        let (mut cancelling, rx) = operation();
        cancelling.mark_started();
        cancelling.cancel();
        assert!(!cancelling.reset_for_resubmission());
        assert_eq!(cancelling.status(), OperationStatus::Cancelled);
        assert!(rx.await.unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_operation_id_orders_and_displays() {
        assert!(OperationId::new(1) < OperationId::new(2));
        assert_eq!(OperationId::new(7).to_string(), "#7");
    }
}
