//! Worker loop
//!
//! Reads `HostRequest`s, runs each invocation concurrently under its own
//! cancellation token and reports progress as `HostEvent`s. Used by the
//! `git-dispatch worker` subcommand over stdio and by `InProcessHost` over a
//! duplex pipe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::host::{write_line, HostEvent, HostRequest};
use super::operation::OperationId;
use crate::error::Result;
use crate::git::runner::{self, RunOutcome};
use crate::git::Invocation;

/// Worker loop settings
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Report `Sick` once a git spawn takes longer than this
    pub sick_spawn_threshold: Option<Duration>,
}

impl ServeOptions {
    pub fn new(sick_spawn_threshold_ms: u64) -> Self {
        Self {
            sick_spawn_threshold: (sick_spawn_threshold_ms > 0)
                .then(|| Duration::from_millis(sick_spawn_threshold_ms)),
        }
    }

    /// Command-line arguments that reproduce these options in a child host
    pub fn worker_args(&self) -> Vec<String> {
        let threshold = self
            .sick_spawn_threshold
            .map(|d| d.as_millis().to_string())
            .unwrap_or_else(|| "0".to_string());
        vec![
            "worker".to_string(),
            "--sick-threshold-ms".to_string(),
            threshold,
        ]
    }
}

type Running = Arc<Mutex<HashMap<OperationId, CancellationToken>>>;

/// Run the worker loop until `Shutdown` or end of input
#[instrument(skip_all)]
pub async fn serve<R, W>(reader: R, mut writer: W, options: ServeOptions) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (events, mut outbox) = mpsc::unbounded_channel::<HostEvent>();

    // Single writer keeps lines from concurrent runs intact
    let writer_task = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            if let Err(e) = write_line(&mut writer, &event).await {
                debug!("worker output closed: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let _ = events.send(HostEvent::Ready);

    let running: Running = Arc::new(Mutex::new(HashMap::new()));
    let reported_sick = Arc::new(AtomicBool::new(false));
    let mut tasks = JoinSet::new();
    let mut lines = BufReader::new(reader).lines();
    let mut graceful = false;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<HostRequest>(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed request: {}", e);
                continue;
            }
        };

        match request {
            HostRequest::Run { id, invocation } => {
                let token = CancellationToken::new();
                lock(&running).insert(id, token.clone());
                tasks.spawn(run_one(
                    id,
                    invocation,
                    token,
                    events.clone(),
                    Arc::clone(&running),
                    options.sick_spawn_threshold,
                    Arc::clone(&reported_sick),
                ));
            }
            HostRequest::Cancel { id } => {
                if let Some(token) = lock(&running).get(&id) {
                    debug!(%id, "cancelling");
                    token.cancel();
                }
            }
            HostRequest::Shutdown => {
                graceful = true;
                break;
            }
        }
    }

    if graceful {
        info!(running = tasks.len(), "shutdown requested, finishing running commands");
    } else {
        // Nobody is listening for results any more
        for token in lock(&running).values() {
            token.cancel();
        }
    }
    while tasks.join_next().await.is_some() {}

    drop(events);
    let _ = writer_task.await;
    Ok(())
}

async fn run_one(
    id: OperationId,
    invocation: Invocation,
    token: CancellationToken,
    events: mpsc::UnboundedSender<HostEvent>,
    running: Running,
    threshold: Option<Duration>,
    reported_sick: Arc<AtomicBool>,
) {
    let started = events.clone();
    let outcome = runner::run(&invocation, &token, move |elapsed| {
        let _ = started.send(HostEvent::Started { id });
        if let Some(threshold) = threshold {
            if elapsed > threshold && !reported_sick.swap(true, Ordering::SeqCst) {
                warn!(?elapsed, ?threshold, "slow git spawn, reporting sick");
                let _ = started.send(HostEvent::Sick {
                    reason: format!("spawning git took {:?}", elapsed),
                });
            }
        }
    })
    .await;

    lock(&running).remove(&id);
    let event = match outcome {
        Ok(RunOutcome::Exited(output)) => HostEvent::Completed { id, output },
        Ok(RunOutcome::Cancelled) => HostEvent::Cancelled { id },
        Err(e) => HostEvent::Failed {
            id,
            message: e.to_string(),
        },
    };
    let _ = events.send(event);
}

fn lock(running: &Running) -> std::sync::MutexGuard<'_, HashMap<OperationId, CancellationToken>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}
