//! Worker pool
//!
//! Runs git invocations in a rotating set of isolated worker hosts:
//! - `operation` - per-invocation state machine with cancellation
//! - `worker` - worker bookkeeping and the adaptive operation budget
//! - `host` - host protocol plus child-process and in-process launchers
//! - `serve` - the worker loop a host runs
//! - `manager` - the pool actor and its handles

mod host;
mod manager;
mod operation;
mod serve;
mod worker;

pub use host::*;
pub use manager::*;
pub use operation::*;
pub use serve::*;
pub use worker::*;
