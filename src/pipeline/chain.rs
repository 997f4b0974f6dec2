//! Middleware chain around named actions

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{PipelineError, Result};

/// The named high-level actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Push,
    Pull,
    Fetch,
    Commit,
    Checkout,
    AddRemote,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::Push,
        ActionKind::Pull,
        ActionKind::Fetch,
        ActionKind::Commit,
        ActionKind::Checkout,
        ActionKind::AddRemote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Push => "push",
            ActionKind::Pull => "pull",
            ActionKind::Fetch => "fetch",
            ActionKind::Commit => "commit",
            ActionKind::Checkout => "checkout",
            ActionKind::AddRemote => "add-remote",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of one action invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ActionArgs {
    Push {
        remote: Option<String>,
        branch: Option<String>,
        set_upstream: bool,
        force_with_lease: bool,
    },
    Pull {
        remote: Option<String>,
        branch: Option<String>,
        rebase: bool,
    },
    Fetch {
        remote: Option<String>,
        prune: bool,
    },
    Commit {
        message: String,
        amend: bool,
        /// Stage tracked changes first (`--all`)
        all: bool,
        /// Force a signature (`-S`)
        sign: bool,
    },
    Checkout {
        target: String,
        create: bool,
    },
    AddRemote {
        name: String,
        url: String,
    },
}

impl ActionArgs {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionArgs::Push { .. } => ActionKind::Push,
            ActionArgs::Pull { .. } => ActionKind::Pull,
            ActionArgs::Fetch { .. } => ActionKind::Fetch,
            ActionArgs::Commit { .. } => ActionKind::Commit,
            ActionArgs::Checkout { .. } => ActionKind::Checkout,
            ActionArgs::AddRemote { .. } => ActionKind::AddRemote,
        }
    }
}

/// What middleware and the base action see
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub kind: ActionKind,
    pub repo: PathBuf,
    pub args: ActionArgs,
    /// Cancels the git commands the action runs
    pub cancel: CancellationToken,
}

impl ActionContext {
    pub fn new(repo: impl Into<PathBuf>, args: ActionArgs) -> Self {
        Self {
            kind: args.kind(),
            repo: repo.into(),
            args,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutput {
    Completed { stdout: String },
    /// A middleware stopped the action before it ran
    Declined,
}

/// The innermost step of a pipeline
pub type BaseAction = dyn Fn(ActionContext) -> BoxFuture<'static, Result<ActionOutput>> + Send + Sync;

/// A step wrapped around an action.
///
/// Call `next.run(ctx)` to continue, or return without calling it to
/// short-circuit. An error coming back from `next` must be returned as is.
pub trait Middleware: Send + Sync {
    fn handle<'a>(&'a self, next: Next<'a>, ctx: ActionContext) -> BoxFuture<'a, Result<ActionOutput>>;
}

/// The rest of the chain
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    base: &'a BaseAction,
}

impl<'a> Next<'a> {
    pub fn run(self, ctx: ActionContext) -> BoxFuture<'a, Result<ActionOutput>> {
        match self.chain.split_first() {
            Some((first, rest)) => first.handle(
                Next {
                    chain: rest,
                    base: self.base,
                },
                ctx,
            ),
            None => (self.base)(ctx),
        }
    }
}

#[derive(Default)]
struct Registry {
    names: HashSet<String>,
    entries: Vec<(String, Arc<dyn Middleware>)>,
}

/// Ordered middleware for one action kind
pub struct ActionPipeline {
    kind: ActionKind,
    enabled: bool,
    registry: Mutex<Registry>,
}

impl ActionPipeline {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            enabled: true,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// A pipeline that runs the base action directly and refuses middleware
    pub fn disabled(kind: ActionKind) -> Self {
        Self {
            enabled: false,
            ..Self::new(kind)
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Register a middleware; it becomes the innermost one
    pub fn add_middleware(&self, name: impl Into<String>, middleware: Arc<dyn Middleware>) -> Result<()> {
        if !self.enabled {
            return Err(PipelineError::Disabled(self.kind).into());
        }
        let name = name.into();
        if name.is_empty() {
            return Err(PipelineError::EmptyName.into());
        }

        let mut registry = self.lock();
        if !registry.names.insert(name.clone()) {
            return Err(PipelineError::DuplicateName {
                action: self.kind,
                name,
            }
            .into());
        }
        debug!(action = %self.kind, %name, "middleware registered");
        registry.entries.push((name, middleware));
        Ok(())
    }

    /// Unregister a middleware by name
    pub fn remove_middleware(&self, name: &str) -> bool {
        let mut registry = self.lock();
        if !registry.names.remove(name) {
            return false;
        }
        registry.entries.retain(|(entry, _)| entry != name);
        true
    }

    /// Names in registration (outermost first) order
    pub fn middleware_names(&self) -> Vec<String> {
        self.lock().entries.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Run `base` wrapped in the registered middleware
    #[instrument(skip_all, fields(action = %self.kind))]
    pub async fn run(&self, base: &BaseAction, ctx: ActionContext) -> Result<ActionOutput> {
        if !self.enabled {
            return base(ctx).await;
        }

        // Registration during a run affects later runs only
        let chain: Vec<Arc<dyn Middleware>> = self
            .lock()
            .entries
            .iter()
            .map(|(_, middleware)| Arc::clone(middleware))
            .collect();

        Next { chain: &chain, base }.run(ctx).await
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One pipeline per action kind
pub struct PipelineManager {
    pipelines: HashMap<ActionKind, Arc<ActionPipeline>>,
}

impl PipelineManager {
    pub fn new() -> Self {
        Self::build(ActionPipeline::new)
    }

    /// Every pipeline disabled
    pub fn disabled() -> Self {
        Self::build(ActionPipeline::disabled)
    }

    fn build(make: fn(ActionKind) -> ActionPipeline) -> Self {
        Self {
            pipelines: ActionKind::ALL
                .into_iter()
                .map(|kind| (kind, Arc::new(make(kind))))
                .collect(),
        }
    }

    pub fn get_pipeline(&self, kind: ActionKind) -> Arc<ActionPipeline> {
        self.pipelines
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::new(ActionPipeline::new(kind)))
    }
}

impl Default for PipelineManager {
    fn default() -> Self {
        Self::new()
    }
}
