//! Git process orchestration
//!
//! Everything between a caller's request and a finished `git` process:
//! - `GitExecutor` - queueing, mode choice, result interpretation
//! - `CredentialBridge` - askpass and credential-helper plumbing
//! - `classify` - well-known failure texts
//! - `runner` - the subprocess runner shared with pooled workers

mod askpass;
mod classify;
mod executor;
pub mod helper;
mod request;
pub mod runner;
mod signing;

pub use askpass::{
    BridgeEnvelope, BridgeQuery, BridgeReply, CredentialBridge, CredentialPrompter, Credentials,
    HelperScripts, PromptCancelled, PromptRequest, BRIDGE_PORT_ENV, BRIDGE_TOKEN_ENV,
    ORIGINAL_PREFIX,
};
pub use classify::*;
pub use executor::*;
pub use request::*;
pub use signing::is_signing_failure;
