//! Action pipelines
//!
//! Each named action runs through an ordered chain of middleware before its
//! git command is executed:
//! - `ActionPipeline` / `PipelineManager` - registration and the chain itself
//! - built-in middleware for confirmation, progress and error notices
//! - `GitActions` - push, pull, fetch, commit, checkout, add-remote

mod actions;
mod builtin;
mod chain;

pub use actions::{CommitOptions, GitActions, PushOptions};
pub use builtin::{Confirm, ConfirmMiddleware, ErrorNotice, ErrorObserver, NotifyOnError, ProgressMiddleware};
pub use chain::{ActionArgs, ActionContext, ActionKind, ActionOutput, ActionPipeline, BaseAction, Middleware, Next, PipelineManager};
