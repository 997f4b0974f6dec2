//! The named git actions, run through their pipelines

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::chain::{ActionArgs, ActionContext, ActionOutput, PipelineManager};
use crate::error::Result;
use crate::git::{CommandRequest, Dispatch, GitExecutor};

/// Options for [`GitActions::push`]
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub remote: Option<String>,
    pub branch: Option<String>,
    pub set_upstream: bool,
    pub force_with_lease: bool,
}

/// Options for [`GitActions::commit`]
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub amend: bool,
    pub all: bool,
    pub sign: bool,
}

/// High-level git actions on top of the executor
#[derive(Clone)]
pub struct GitActions {
    executor: GitExecutor,
    pipelines: Arc<PipelineManager>,
}

impl GitActions {
    pub fn new(executor: GitExecutor, pipelines: Arc<PipelineManager>) -> Self {
        Self { executor, pipelines }
    }

    pub fn pipelines(&self) -> &Arc<PipelineManager> {
        &self.pipelines
    }

    /// Run one action through the pipeline registered for its kind
    #[instrument(skip_all, fields(action = %args.kind()))]
    pub async fn run(&self, repo: impl Into<PathBuf>, args: ActionArgs, cancel: CancellationToken) -> Result<ActionOutput> {
        let ctx = ActionContext::new(repo, args).with_cancel(cancel);
        let pipeline = self.pipelines.get_pipeline(ctx.kind);

        let executor = self.executor.clone();
        let base = move |ctx: ActionContext| -> BoxFuture<'static, Result<ActionOutput>> {
            let executor = executor.clone();
            Box::pin(async move {
                let request = command_for(&ctx.repo, &ctx.args);
                let stdout = executor.execute(request, Dispatch::with_cancel(ctx.cancel)).await?;
                Ok(ActionOutput::Completed { stdout })
            })
        };

        pipeline.run(&base, ctx).await
    }

    pub async fn push(&self, repo: impl Into<PathBuf>, options: PushOptions) -> Result<ActionOutput> {
        let args = ActionArgs::Push {
            remote: options.remote,
            branch: options.branch,
            set_upstream: options.set_upstream,
            force_with_lease: options.force_with_lease,
        };
        self.run(repo, args, CancellationToken::new()).await
    }

    pub async fn pull(&self, repo: impl Into<PathBuf>, remote: Option<String>, branch: Option<String>, rebase: bool) -> Result<ActionOutput> {
        let args = ActionArgs::Pull { remote, branch, rebase };
        self.run(repo, args, CancellationToken::new()).await
    }

    pub async fn fetch(&self, repo: impl Into<PathBuf>, remote: Option<String>, prune: bool) -> Result<ActionOutput> {
        let args = ActionArgs::Fetch { remote, prune };
        self.run(repo, args, CancellationToken::new()).await
    }

    pub async fn commit(&self, repo: impl Into<PathBuf>, message: impl Into<String>, options: CommitOptions) -> Result<ActionOutput> {
        let args = ActionArgs::Commit {
            message: message.into(),
            amend: options.amend,
            all: options.all,
            sign: options.sign,
        };
        self.run(repo, args, CancellationToken::new()).await
    }

    pub async fn checkout(&self, repo: impl Into<PathBuf>, target: impl Into<String>, create: bool) -> Result<ActionOutput> {
        let args = ActionArgs::Checkout {
            target: target.into(),
            create,
        };
        self.run(repo, args, CancellationToken::new()).await
    }

    pub async fn add_remote(&self, repo: impl Into<PathBuf>, name: impl Into<String>, url: impl Into<String>) -> Result<ActionOutput> {
        let args = ActionArgs::AddRemote {
            name: name.into(),
            url: url.into(),
        };
        self.run(repo, args, CancellationToken::new()).await
    }
}

/// The git command an action runs
pub(crate) fn command_for(repo: &Path, args: &ActionArgs) -> CommandRequest {
    let mut argv: Vec<String> = Vec::new();
    let mut stdin = None;

    match args {
        ActionArgs::Push {
            remote,
            branch,
            set_upstream,
            force_with_lease,
        } => {
            argv.push("push".into());
            if *set_upstream {
                argv.push("--set-upstream".into());
            }
            if *force_with_lease {
                argv.push("--force-with-lease".into());
            }
            argv.extend(remote.iter().cloned());
            argv.extend(branch.iter().cloned());
        }
        ActionArgs::Pull { remote, branch, rebase } => {
            argv.push("pull".into());
            if *rebase {
                argv.push("--rebase".into());
            }
            argv.extend(remote.iter().cloned());
            argv.extend(branch.iter().cloned());
        }
        ActionArgs::Fetch { remote, prune } => {
            argv.push("fetch".into());
            if *prune {
                argv.push("--prune".into());
            }
            argv.extend(remote.iter().cloned());
        }
        ActionArgs::Commit {
            message,
            amend,
            all,
            sign,
        } => {
            argv.extend(["commit".into(), "-F".into(), "-".into()]);
            if *amend {
                argv.push("--amend".into());
            }
            if *all {
                argv.push("--all".into());
            }
            if *sign {
                argv.push("-S".into());
            }
            stdin = Some(message.clone());
        }
        ActionArgs::Checkout { target, create } => {
            argv.push("checkout".into());
            if *create {
                argv.push("-b".into());
            }
            argv.push(target.clone());
        }
        ActionArgs::AddRemote { name, url } => {
            argv.extend(["remote".into(), "add".into(), name.clone(), url.clone()]);
        }
    }

    let mut request = CommandRequest::new(argv, repo).write();
    if let Some(stdin) = stdin {
        request = request.with_stdin(stdin);
    }
    match args {
        ActionArgs::Push { .. } | ActionArgs::Pull { .. } | ActionArgs::Fetch { .. } => request.with_credentials(),
        // A configured `commit.gpgSign` can need a passphrase even without `-S`
        ActionArgs::Commit { .. } => request.with_signing(),
        ActionArgs::Checkout { .. } | ActionArgs::AddRemote { .. } => request,
    }
}
