//! git-dispatch - run git through the queue, pool and action pipelines
//!
//! Run with `git-dispatch --help` for usage.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use git_dispatch::{
    config::{Config, UsageStats},
    git::{helper, ExecOptions},
    pipeline::{ActionOutput, CommitOptions, PushOptions},
    pool::{serve, ServeOptions},
    terminal::TerminalPrompter,
    GitContext, APP_NAME, VERSION,
};

#[derive(Parser)]
#[command(name = APP_NAME)]
#[command(version = VERSION)]
#[command(about = "Pooled, queued and cancelable git execution")]
#[command(long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Repository to run in (default: current directory)
    #[arg(short = 'C', long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an arbitrary git command
    Exec {
        /// Run on the serial write lane
        #[arg(short, long)]
        write: bool,

        /// Route credential prompts to this terminal
        #[arg(long)]
        credentials: bool,

        /// Skip the worker pool
        #[arg(long)]
        in_process: bool,

        /// Arguments passed to git
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },

    /// Push the current branch
    Push {
        remote: Option<String>,
        branch: Option<String>,

        #[arg(short = 'u', long)]
        set_upstream: bool,

        #[arg(long)]
        force_with_lease: bool,
    },

    /// Pull from a remote
    Pull {
        remote: Option<String>,
        branch: Option<String>,

        #[arg(short, long)]
        rebase: bool,
    },

    /// Fetch from a remote
    Fetch {
        remote: Option<String>,

        #[arg(short, long)]
        prune: bool,
    },

    /// Record a commit
    Commit {
        #[arg(short, long)]
        message: String,

        #[arg(long)]
        amend: bool,

        /// Stage tracked changes first
        #[arg(short, long)]
        all: bool,

        /// Sign the commit
        #[arg(short = 'S', long)]
        sign: bool,
    },

    /// Switch branches
    Checkout {
        target: String,

        /// Create the branch
        #[arg(short = 'b', long)]
        create: bool,
    },

    /// Add a remote
    AddRemote { name: String, url: String },

    /// Show recorded subcommand usage
    Stats,

    /// Show configuration
    Config {
        /// Initialize config file with defaults
        #[arg(long)]
        init: bool,
    },

    /// Run a worker host on stdin/stdout
    #[command(hide = true)]
    Worker {
        #[arg(long, default_value_t = 0)]
        sick_threshold_ms: u64,
    },

    /// Askpass helper called by git and ssh
    #[command(hide = true)]
    Askpass { prompt: Option<String> },

    /// Credential helper called by git
    #[command(hide = true)]
    Credential { operation: String },
}

fn setup_logging(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        // Use info level for our crate, warn for dependencies
        EnvFilter::new("warn")
            .add_directive("git_dispatch=info".parse()?)
            .add_directive("tokio=warn".parse()?)
    };

    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;

        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(file).with_target(false))
            .with(filter)
            .init();
    } else {
        // stdout carries command output and the worker protocol
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .with(filter)
            .init();
    }

    Ok(())
}

fn print_output(output: ActionOutput) {
    match output {
        ActionOutput::Completed { stdout } => print!("{}", stdout),
        ActionOutput::Declined => eprintln!("Declined"),
    }
}

/// Helper subcommands answer on stdout and must not fail loudly
async fn run_helper(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Askpass { prompt } => {
            let answer = helper::askpass(prompt.as_deref().unwrap_or_default()).await?;
            println!("{}", answer);
        }
        Commands::Credential { operation } => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("failed to read credential input")?;
            if let Some(answer) = helper::credential(&operation, &input).await? {
                print!("{}", answer);
            }
        }
        _ => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install color-eyre error hooks
    color_eyre::install()?;

    let cli = Cli::parse();

    // Load configuration
    let loaded = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let config = loaded.unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config, using defaults: {}", e);
        Config::default()
    });
    let debug = cli.debug || config.debug;

    match cli.command {
        Commands::Worker { sick_threshold_ms } => {
            setup_logging(debug, None)?;
            info!("worker host v{} starting", VERSION);
            serve(tokio::io::stdin(), tokio::io::stdout(), ServeOptions::new(sick_threshold_ms)).await?;
            return Ok(());
        }
        command @ (Commands::Askpass { .. } | Commands::Credential { .. }) => {
            setup_logging(debug, None)?;
            if let Err(e) = run_helper(command).await {
                eprintln!("{}: {:#}", APP_NAME, e);
                std::process::exit(1);
            }
            return Ok(());
        }
        Commands::Config { init } => {
            setup_logging(debug, None)?;

            if init {
                config.ensure_directories()?;
                config.save()?;
                println!("Configuration initialized at {:?}", Config::config_file_path()?);
            } else {
                println!("Configuration:");
                println!("{}", toml::to_string_pretty(&config)?);
                println!("\nConfig file: {:?}", Config::config_file_path()?);
                println!("Data dir: {:?}", Config::data_dir()?);
                println!("Usage file: {:?}", Config::usage_file_path()?);
            }
            return Ok(());
        }
        Commands::Stats => {
            setup_logging(debug, None)?;

            let stats = UsageStats::load()?;
            if stats.counts.is_empty() {
                println!("No recorded usage.");
            } else {
                for (subcommand, count) in stats.ranked() {
                    println!("{:>8}  {}", count, subcommand);
                }
                println!("{:>8}  total", stats.total());
            }
            return Ok(());
        }
        _ => {}
    }

    setup_logging(debug, config.log_file.as_deref())?;

    // Ensure required directories exist
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Failed to create directories: {}", e);
    }

    let repo = match cli.repo {
        Some(repo) => repo,
        None => std::env::current_dir()?,
    };

    let context = GitContext::builder(config)
        .prompter(Arc::new(TerminalPrompter))
        .build()?;
    let actions = context.actions();

    let outcome = match cli.command {
        Commands::Exec {
            write,
            credentials,
            in_process,
            args,
        } => {
            let options = ExecOptions {
                is_write: write,
                use_credential_bridge: credentials,
                in_process,
                ..ExecOptions::in_dir(&repo)
            };
            context
                .executor()
                .exec(args, options)
                .await
                .map(|stdout| ActionOutput::Completed { stdout })
        }
        Commands::Push {
            remote,
            branch,
            set_upstream,
            force_with_lease,
        } => {
            let options = PushOptions {
                remote,
                branch,
                set_upstream,
                force_with_lease,
            };
            actions.push(&repo, options).await
        }
        Commands::Pull { remote, branch, rebase } => actions.pull(&repo, remote, branch, rebase).await,
        Commands::Fetch { remote, prune } => actions.fetch(&repo, remote, prune).await,
        Commands::Commit {
            message,
            amend,
            all,
            sign,
        } => actions.commit(&repo, message, CommitOptions { amend, all, sign }).await,
        Commands::Checkout { target, create } => actions.checkout(&repo, target, create).await,
        Commands::AddRemote { name, url } => actions.add_remote(&repo, name, url).await,
        _ => unreachable!("handled before the context is built"),
    };

    context.shutdown().await?;

    match outcome {
        Ok(output) => print_output(output),
        Err(e) => {
            if let Some(kind) = e.git_kind() {
                eprintln!("{}", kind);
            }
            return Err(e.into());
        }
    }

    Ok(())
}
