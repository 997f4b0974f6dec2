//! Built-in middleware: confirmation, progress flags and error notices

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{info, warn};

use super::chain::{ActionContext, ActionKind, ActionOutput, Middleware, Next};
use crate::error::Result;
use crate::git::GitErrorKind;

/// Asks the user whether an action may proceed
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, ctx: &ActionContext) -> bool;
}

/// Runs the action only if the `Confirm` collaborator agrees
pub struct ConfirmMiddleware {
    confirm: Arc<dyn Confirm>,
}

impl ConfirmMiddleware {
    pub fn new(confirm: Arc<dyn Confirm>) -> Self {
        Self { confirm }
    }
}

impl Middleware for ConfirmMiddleware {
    fn handle<'a>(&'a self, next: Next<'a>, ctx: ActionContext) -> BoxFuture<'a, Result<ActionOutput>> {
        Box::pin(async move {
            if self.confirm.confirm(&ctx).await {
                next.run(ctx).await
            } else {
                info!(action = %ctx.kind, "declined by user");
                Ok(ActionOutput::Declined)
            }
        })
    }
}

/// Publishes whether an action is running
///
/// The flag stays set while at least one run is inside the middleware and
/// is cleared by a drop guard, so errors and cancelled futures clear it too.
pub struct ProgressMiddleware {
    running: AtomicUsize,
    flag: watch::Sender<bool>,
}

impl ProgressMiddleware {
    pub fn new() -> Self {
        Self {
            running: AtomicUsize::new(0),
            flag: watch::Sender::new(false),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }

    pub fn is_in_progress(&self) -> bool {
        *self.flag.borrow()
    }

    fn enter(&self) -> ProgressGuard<'_> {
        if self.running.fetch_add(1, Ordering::SeqCst) == 0 {
            self.flag.send_replace(true);
        }
        ProgressGuard { owner: self }
    }
}

impl Default for ProgressMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

struct ProgressGuard<'a> {
    owner: &'a ProgressMiddleware,
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        if self.owner.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.owner.flag.send_replace(false);
        }
    }
}

impl Middleware for ProgressMiddleware {
    fn handle<'a>(&'a self, next: Next<'a>, ctx: ActionContext) -> BoxFuture<'a, Result<ActionOutput>> {
        Box::pin(async move {
            let _guard = self.enter();
            next.run(ctx).await
        })
    }
}

/// What observers of failed actions receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotice {
    pub action: ActionKind,
    pub message: String,
    /// Recognised git failure, if any
    pub kind: Option<GitErrorKind>,
}

pub type ErrorObserver = Arc<dyn Fn(&ErrorNotice) + Send + Sync>;

/// Forwards action failures to observers, then returns the error unchanged.
///
/// Observers run synchronously in registration order. Cancellation is not a
/// failure and is not reported.
#[derive(Default)]
pub struct NotifyOnError {
    observers: Mutex<Vec<ErrorObserver>>,
}

impl NotifyOnError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: ErrorObserver) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn notify(&self, notice: &ErrorNotice) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if observers.is_empty() {
            warn!(action = %notice.action, "{}", notice.message);
        }
        for observer in observers {
            observer(notice);
        }
    }
}

impl Middleware for NotifyOnError {
    fn handle<'a>(&'a self, next: Next<'a>, ctx: ActionContext) -> BoxFuture<'a, Result<ActionOutput>> {
        Box::pin(async move {
            let action = ctx.kind;
            let result = next.run(ctx).await;
            if let Err(e) = &result {
                if !e.is_cancelled() {
                    let kind = e.git_kind();
                    let message = match kind {
                        Some(kind) => format!("{}: {}", kind, e),
                        None => e.to_string(),
                    };
                    self.notify(&ErrorNotice {
                        action,
                        message,
                        kind,
                    });
                }
            }
            result
        })
    }
}
