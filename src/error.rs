//! Error types for git-dispatch
//!
//! Uses `thiserror` for ergonomic error definitions with automatic `Display` and `Error` impls.

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::ActionKind;
use crate::pool::WorkerId;

/// Top-level error type for git-dispatch
#[derive(Error, Debug)]
pub enum Error {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled before it produced a result.
    ///
    /// Kept apart from every failure variant so callers never mistake a
    /// user-initiated cancel for a broken command.
    #[error("Operation was cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error is the cancellation outcome
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// The structured failure of a git process, if that is what this is
    pub fn as_command_failure(&self) -> Option<&GitError> {
        match self {
            Error::Git(err @ GitError::CommandFailed { .. }) => Some(err),
            _ => None,
        }
    }
}

/// Command queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Command queue has been disposed")]
    Disposed,
}

/// Pooled operation errors
#[derive(Error, Debug)]
pub enum OperationError {
    /// The worker host could not run the command
    #[error("Worker failed to run the command: {0}")]
    Failed(String),

    /// The operation was dropped without a result
    #[error("Operation was lost before it settled")]
    Lost,
}

/// Worker pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker pool has been shut down")]
    ShutDown,

    #[error("Worker {0} was destroyed before the operation settled")]
    WorkerDestroyed(WorkerId),

    #[error("Failed to launch worker host: {0}")]
    HostLaunch(String),

    #[error("Worker host protocol error: {0}")]
    Protocol(String),
}

/// Git execution errors
#[derive(Error, Debug)]
pub enum GitError {
    #[error("Git executable not found: {0}")]
    NotInstalled(PathBuf),

    #[error("Failed to spawn `{command}`: {reason}")]
    SpawnFailed { command: String, reason: String },

    /// A git process ran and exited unsuccessfully.
    ///
    /// Carries the raw output so callers can classify the cause.
    #[error("`{command}` exited with {}: {}", exit_label(.code), .stderr.trim())]
    CommandFailed {
        code: Option<i32>,
        stdout: String,
        stderr: String,
        command: String,
    },

    #[error("Credential bridge failure: {0}")]
    Bridge(String),

    #[error("Failed to resolve git exec path: {0}")]
    ExecPath(String),
}

impl GitError {
    /// Exit code of a failed command, `None` when killed by a signal
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            GitError::CommandFailed { code, .. } => *code,
            _ => None,
        }
    }

    /// Raw standard error of a failed command
    pub fn stderr(&self) -> Option<&str> {
        match self {
            GitError::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Raw standard output of a failed command
    pub fn stdout(&self) -> Option<&str> {
        match self {
            GitError::CommandFailed { stdout, .. } => Some(stdout),
            _ => None,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

/// Action pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Middleware name must not be empty")]
    EmptyName,

    #[error("Middleware '{name}' is already registered on the {action} pipeline")]
    DuplicateName { action: ActionKind, name: String },

    #[error("The {0} pipeline is disabled and accepts no middleware")]
    Disabled(ActionKind),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),

    #[error("Invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Failed to create config directory: {0}")]
    DirectoryCreationFailed(PathBuf),
}

/// Result type alias using our error type
pub type Result<T> = std::result::Result<T, Error>;
