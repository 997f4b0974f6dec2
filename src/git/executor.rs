//! Git command executor
//!
//! Turns a `CommandRequest` into a fully specified invocation, queues it on
//! the read or write lane, runs it in-process or on the worker pool and
//! interprets the result.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::askpass::{CredentialBridge, CredentialPrompter};
use super::runner::{self, RunOutcome};
use super::signing::is_signing_failure;
use super::{CommandRequest, Invocation, RawOutput};
use crate::error::{Error, GitError, Result};
use crate::pool::SharedPool;
use crate::queue::{CommandQueue, Lane};

/// Fire-and-forget hook called with the subcommand of every notable command
pub type UsageCounter = Arc<dyn Fn(&str) + Send + Sync>;

/// Subcommands too frequent to be worth counting
const LOW_SIGNAL_SUBCOMMANDS: &[&str] = &[
    "status",
    "diff",
    "log",
    "rev-parse",
    "config",
    "for-each-ref",
    "cat-file",
];

/// Per-call options for [`GitExecutor::exec`]
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory; the current directory when unset
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    pub env: BTreeMap<String, String>,
    pub is_write: bool,
    pub use_credential_bridge: bool,
    pub use_signing_wrapper: bool,
    /// Skip the worker pool for this call
    pub in_process: bool,
    pub cancel: Option<CancellationToken>,
}

impl ExecOptions {
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Default::default()
        }
    }

    fn into_request(self, args: Vec<String>) -> Result<(CommandRequest, Dispatch)> {
        let cwd = match self.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir()?,
        };
        let request = CommandRequest {
            args,
            cwd,
            stdin: self.stdin,
            env: self.env,
            use_credential_bridge: self.use_credential_bridge,
            use_signing_wrapper: self.use_signing_wrapper,
            is_write: self.is_write,
        };
        let dispatch = Dispatch {
            in_process: self.in_process,
            cancel: self.cancel.unwrap_or_default(),
        };
        Ok((request, dispatch))
    }
}

/// How one call is executed
#[derive(Debug, Clone, Default)]
pub struct Dispatch {
    pub in_process: bool,
    pub cancel: CancellationToken,
}

impl Dispatch {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            in_process: false,
            cancel,
        }
    }
}

struct ExecutorInner {
    git: PathBuf,
    queue: CommandQueue,
    pool: Option<SharedPool>,
    force_in_process: bool,
    prompter: Option<Arc<dyn CredentialPrompter>>,
    /// Executable the bridge scripts call back into
    helper: PathBuf,
    search_path: OnceCell<String>,
    usage: Option<UsageCounter>,
}

/// Queued, pooled git execution; cheap to clone
#[derive(Clone)]
pub struct GitExecutor {
    inner: Arc<ExecutorInner>,
}

/// Builder for [`GitExecutor`]
pub struct GitExecutorBuilder {
    git: PathBuf,
    queue: CommandQueue,
    pool: Option<SharedPool>,
    force_in_process: bool,
    prompter: Option<Arc<dyn CredentialPrompter>>,
    helper: Option<PathBuf>,
    usage: Option<UsageCounter>,
}

impl GitExecutorBuilder {
    pub fn pool(mut self, pool: SharedPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn force_in_process(mut self, force: bool) -> Self {
        self.force_in_process = force;
        self
    }

    pub fn prompter(mut self, prompter: Arc<dyn CredentialPrompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// Executable providing the `askpass` and `credential` subcommands
    pub fn helper(mut self, helper: impl Into<PathBuf>) -> Self {
        self.helper = Some(helper.into());
        self
    }

    pub fn usage_counter(mut self, counter: UsageCounter) -> Self {
        self.usage = Some(counter);
        self
    }

    pub fn build(self) -> GitExecutor {
        let helper = self
            .helper
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from(crate::APP_NAME));

        GitExecutor {
            inner: Arc::new(ExecutorInner {
                git: self.git,
                queue: self.queue,
                pool: self.pool,
                force_in_process: self.force_in_process,
                prompter: self.prompter,
                helper,
                search_path: OnceCell::new(),
                usage: self.usage,
            }),
        }
    }
}

impl GitExecutor {
    pub fn builder(git: impl Into<PathBuf>, queue: CommandQueue) -> GitExecutorBuilder {
        GitExecutorBuilder {
            git: git.into(),
            queue,
            pool: None,
            force_in_process: false,
            prompter: None,
            helper: None,
            usage: None,
        }
    }

    pub fn git_path(&self) -> &Path {
        &self.inner.git
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.inner.queue
    }

    /// Run `git <args>` and return its standard output
    pub async fn exec<I, S>(&self, args: I, options: ExecOptions) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args = args.into_iter().map(Into::into).collect();
        let (request, dispatch) = options.into_request(args)?;
        self.execute(request, dispatch).await
    }

    /// Run a prepared request and return its standard output
    #[instrument(skip_all, fields(command = request.subcommand().unwrap_or("-"), write = request.is_write))]
    pub async fn execute(&self, request: CommandRequest, dispatch: Dispatch) -> Result<String> {
        self.record_usage(&request);

        let lane = Lane::for_write(request.is_write);
        let this = self.clone();
        self.inner
            .queue
            .enqueue(lane, move || async move { this.run_request(request, dispatch).await })
            .await
    }

    async fn run_request(&self, request: CommandRequest, dispatch: Dispatch) -> Result<String> {
        if !request.use_signing_wrapper {
            return self.attempt(&request, false, &dispatch).await;
        }

        // Signing is tried non-interactively first
        let mut quiet = request.clone();
        quiet.use_credential_bridge = false;
        match self.attempt(&quiet, false, &dispatch).await {
            Err(Error::Git(GitError::CommandFailed { ref stderr, .. }))
                if is_signing_failure(stderr) && self.inner.prompter.is_some() =>
            {
                debug!("signing needs a passphrase, retrying with prompts");
                self.attempt(&request, true, &dispatch).await
            }
            other => other,
        }
    }

    async fn attempt(&self, request: &CommandRequest, signing: bool, dispatch: &Dispatch) -> Result<String> {
        let cancel = dispatch.cancel.child_token();

        let mut env = request.env.clone();
        env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
        env.insert("PATH".to_string(), self.search_path().await.to_string());

        let bridge = match &self.inner.prompter {
            Some(prompter) if request.use_credential_bridge || signing => Some(
                CredentialBridge::start(Arc::clone(prompter), &self.inner.helper, signing, cancel.clone())
                    .await?,
            ),
            _ => None,
        };
        if let Some(bridge) = &bridge {
            bridge.apply(&mut env);
        }

        let mut args = vec!["-c".to_string(), "color.ui=false".to_string()];
        args.extend(request.args.iter().cloned());
        let invocation = Invocation {
            program: self.inner.git.clone(),
            args,
            cwd: request.cwd.clone(),
            env,
            stdin: request.stdin.clone(),
        };
        let command = invocation.command_line();

        let result = self.dispatch(invocation, dispatch.in_process, &cancel).await;

        // Helpers only die after git is gone
        if cfg!(windows) {
            if let Some(bridge) = &bridge {
                bridge.kill_helpers();
            }
        }
        drop(bridge);

        interpret(command, result?)
    }

    async fn dispatch(&self, invocation: Invocation, in_process: bool, cancel: &CancellationToken) -> Result<RawOutput> {
        let Some(pool) = self.pick_pool(in_process) else {
            debug!("running in-process");
            return match runner::run(&invocation, cancel, |_| {}).await? {
                RunOutcome::Exited(output) => Ok(output),
                RunOutcome::Cancelled => Err(Error::Cancelled),
            };
        };

        let mut handle = pool.request(invocation);
        debug!(id = %handle.id(), "running on worker pool");
        tokio::select! {
            result = &mut handle => return result,
            _ = cancel.cancelled() => {}
        }
        handle.cancel();
        handle.await
    }

    fn pick_pool(&self, in_process: bool) -> Option<crate::pool::WorkerPool> {
        if in_process || self.inner.force_in_process {
            return None;
        }
        let pool = match self.inner.pool.as_ref()?.get_or_create() {
            Ok(pool) => pool,
            Err(e) => {
                warn!("worker pool unavailable: {}", e);
                return None;
            }
        };
        if pool.is_ready() {
            Some(pool)
        } else {
            pool.warm_up();
            None
        }
    }

    /// `git --exec-path` in front of the inherited `PATH`, resolved once
    async fn search_path(&self) -> &str {
        self.inner
            .search_path
            .get_or_init(|| resolve_search_path(&self.inner.git))
            .await
            .as_str()
    }

    fn record_usage(&self, request: &CommandRequest) {
        let (Some(counter), Some(subcommand)) = (&self.inner.usage, request.subcommand()) else {
            return;
        };
        if LOW_SIGNAL_SUBCOMMANDS.contains(&subcommand) {
            return;
        }
        if std::panic::catch_unwind(AssertUnwindSafe(|| counter(subcommand))).is_err() {
            warn!(subcommand, "usage counter panicked");
        }
    }
}

/// Falls back to the inherited `PATH` when git cannot report its exec path
async fn resolve_search_path(git: &Path) -> String {
    let inherited = std::env::var_os("PATH").unwrap_or_default();
    let exec_path = match git_exec_path(git).await {
        Ok(exec_path) => exec_path,
        Err(e) => {
            warn!("using inherited PATH: {}", e);
            return inherited.to_string_lossy().into_owned();
        }
    };

    match std::env::join_paths(std::iter::once(exec_path).chain(std::env::split_paths(&inherited))) {
        Ok(joined) => {
            let joined = joined.to_string_lossy().into_owned();
            debug!(path = %joined, "resolved git search path");
            joined
        }
        Err(e) => {
            warn!("using inherited PATH: {}", GitError::ExecPath(e.to_string()));
            inherited.to_string_lossy().into_owned()
        }
    }
}

async fn git_exec_path(git: &Path) -> Result<PathBuf> {
    let invocation = Invocation {
        program: git.to_path_buf(),
        args: vec!["--exec-path".to_string()],
        cwd: std::env::temp_dir(),
        env: BTreeMap::new(),
        stdin: None,
    };
    match runner::run(&invocation, &CancellationToken::new(), |_| {}).await? {
        RunOutcome::Exited(output) if output.success() => Ok(PathBuf::from(output.stdout.trim())),
        RunOutcome::Exited(output) => Err(GitError::ExecPath(output.stderr.trim().to_string()).into()),
        RunOutcome::Cancelled => Err(Error::Cancelled),
    }
}

fn interpret(command: String, output: RawOutput) -> Result<String> {
    if output.success() {
        return Ok(output.stdout);
    }
    Err(GitError::CommandFailed {
        code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        command,
    }
    .into())
}
