//! git-dispatch - pooled, queued and cancelable git execution
//!
//! This crate runs `git` on behalf of a long-lived host application. Every
//! command passes through a bounded queue, runs either in-process or on a
//! rotating pool of isolated worker hosts, and can be cancelled at any point.
//!
//! # Architecture
//!
//! - **CommandQueue** - parallel lane for reads, serial lane for writes
//! - **WorkerPool actor** - owns worker hosts, routes operations, replaces
//!   sick or crashed workers and resubmits their work
//! - **GitExecutor** - builds invocations, wires the credential bridge and
//!   the signing retry, interprets exit codes
//! - **Action pipelines** - middleware around push, pull, fetch, commit,
//!   checkout and add-remote
//!
//! # Modules
//!
//! - [`queue`] - Bounded command admission
//! - [`pool`] - Worker hosts, operations and the pool actor
//! - [`git`] - Executor, credential bridge, failure classification
//! - [`pipeline`] - Middleware chains and the named actions
//! - [`context`] - Process-wide wiring from configuration
//! - [`config`] - Configuration and usage statistics
//! - [`terminal`] - Terminal credential prompts
//! - [`error`] - Error types

pub mod config;
pub mod context;
pub mod error;
pub mod git;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod terminal;

pub use config::{Config, UsageStats};
pub use context::{GitContext, GitContextBuilder};
pub use error::{Error, Result};
pub use git::{CommandRequest, ExecOptions, GitErrorKind, GitExecutor};
pub use pipeline::{ActionKind, ActionOutput, GitActions, PipelineManager};
pub use pool::{WorkerPool, SharedPool};
pub use queue::CommandQueue;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
