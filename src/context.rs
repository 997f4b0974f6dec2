//! Process-wide wiring of queue, pool, executor and pipelines
//!
//! One `GitContext` owns everything a host application needs to run git.
//! It replaces a global pool singleton: tests build their own context and
//! reset it between cases.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{Config, UsageStats};
use crate::error::Result;
use crate::git::{CredentialPrompter, GitExecutor, UsageCounter};
use crate::pipeline::{GitActions, PipelineManager};
use crate::pool::{ChildProcessHost, ProcessHost, ServeOptions, SharedPool};
use crate::queue::CommandQueue;

/// Builder for [`GitContext`]
pub struct GitContextBuilder {
    config: Config,
    prompter: Option<Arc<dyn CredentialPrompter>>,
    usage: Option<UsageCounter>,
    host: Option<Arc<dyn ProcessHost>>,
    pipelines: Option<Arc<PipelineManager>>,
}

impl GitContextBuilder {
    /// Host-side credential prompts; without one, prompts are refused
    pub fn prompter(mut self, prompter: Arc<dyn CredentialPrompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// Override the usage callback (the default persists `UsageStats`)
    pub fn usage_counter(mut self, counter: UsageCounter) -> Self {
        self.usage = Some(counter);
        self
    }

    /// Launch workers through `host` instead of the configured command
    pub fn host(mut self, host: Arc<dyn ProcessHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn pipelines(mut self, pipelines: Arc<PipelineManager>) -> Self {
        self.pipelines = Some(pipelines);
        self
    }

    pub fn build(self) -> Result<GitContext> {
        let config = self.config;
        let queue = CommandQueue::with_parallelism(config.parallelism());

        let pool = config.use_worker_pool.then(|| {
            let host = self.host;
            let options = ServeOptions::new(config.sick_spawn_threshold_ms);
            let command = config.worker_command.clone();
            SharedPool::new(move || -> Result<Arc<dyn ProcessHost>> {
                if let Some(host) = &host {
                    return Ok(Arc::clone(host));
                }
                let host = match command.split_first() {
                    Some((program, args)) => ChildProcessHost::new(program, args.to_vec()),
                    None => ChildProcessHost::current_exe(&options)?,
                };
                Ok(Arc::new(host))
            })
        });

        let usage = match self.usage {
            Some(usage) => Some(usage),
            None if config.record_usage => match Config::usage_file_path() {
                Ok(path) => Some(UsageStats::load_or_reset(&path).into_counter()),
                Err(e) => {
                    warn!("usage stats disabled: {}", e);
                    None
                }
            },
            None => None,
        };

        let mut builder = GitExecutor::builder(config.git_path.clone(), queue.clone())
            .force_in_process(config.force_in_process);
        if let Some(pool) = &pool {
            builder = builder.pool(pool.clone());
        }
        if let Some(prompter) = self.prompter {
            builder = builder.prompter(prompter);
        }
        if let Some(usage) = usage {
            builder = builder.usage_counter(usage);
        }
        let executor = builder.build();

        debug!(
            parallelism = queue.parallelism(),
            pooled = pool.is_some(),
            "git context ready"
        );

        Ok(GitContext {
            config,
            queue,
            pool,
            executor,
            pipelines: self.pipelines.unwrap_or_default(),
        })
    }
}

/// Everything needed to run git commands and actions
pub struct GitContext {
    config: Config,
    queue: CommandQueue,
    pool: Option<SharedPool>,
    executor: GitExecutor,
    pipelines: Arc<PipelineManager>,
}

impl GitContext {
    pub fn builder(config: Config) -> GitContextBuilder {
        GitContextBuilder {
            config,
            prompter: None,
            usage: None,
            host: None,
            pipelines: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> &GitExecutor {
        &self.executor
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn pool(&self) -> Option<&SharedPool> {
        self.pool.as_ref()
    }

    pub fn pipelines(&self) -> &Arc<PipelineManager> {
        &self.pipelines
    }

    /// The named actions, sharing this context's executor and pipelines
    pub fn actions(&self) -> GitActions {
        GitActions::new(self.executor.clone(), Arc::clone(&self.pipelines))
    }

    /// Start the first worker ahead of use
    pub fn warm_up(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool.get_or_create()?.warm_up();
        }
        Ok(())
    }

    /// Close the pool slot and drain the pool, then stop admitting commands.
    ///
    /// Commands admitted during the drain run in-process.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(pool) = self.pool.as_ref().and_then(SharedPool::close) {
            info!("shutting down worker pool");
            pool.shutdown().await?;
        }
        self.queue.dispose();
        Ok(())
    }

    /// Kill the pool immediately; the next pooled call starts a fresh one
    pub async fn reset_for_testing(&self) -> Result<()> {
        if let Some(pool) = self.pool.as_ref().and_then(SharedPool::take) {
            pool.shutdown_now().await?;
        }
        Ok(())
    }
}
