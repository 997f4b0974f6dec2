//! Worker host protocol and launchers
//!
//! A worker host is a process (or an in-process task) running the worker
//! loop in `serve`. The pool talks to it through a `HostLink`: a
//! request channel, an event channel and a kill switch. Over a process
//! boundary the messages travel as newline-delimited JSON.

use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::operation::OperationId;
use super::serve::{serve, ServeOptions};
use super::worker::WorkerId;
use crate::error::{PoolError, Result};
use crate::git::{Invocation, RawOutput};

/// Pool → host message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostRequest {
    Run { id: OperationId, invocation: Invocation },
    Cancel { id: OperationId },
    /// Finish running operations, then exit
    Shutdown,
}

/// Host → pool message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    Ready,
    Started { id: OperationId },
    Completed { id: OperationId, output: RawOutput },
    Failed { id: OperationId, message: String },
    Cancelled { id: OperationId },
    Sick { reason: String },
    /// Emitted by the launcher, never by the worker loop itself
    Exited { code: Option<i32> },
}

/// Channels to one running worker host
pub struct HostLink {
    pub requests: mpsc::UnboundedSender<HostRequest>,
    pub events: mpsc::UnboundedReceiver<HostEvent>,
    /// Cancelling this kills the host without waiting
    pub kill: CancellationToken,
}

/// Something that can start worker hosts.
///
/// `launch` is called from inside the runtime and must not block; any
/// long-running work belongs on spawned tasks.
pub trait ProcessHost: Send + Sync + 'static {
    fn launch(&self, worker: WorkerId) -> Result<HostLink>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayEnd {
    Killed,
    Eof,
}

/// Shuttle requests and events between the pool and a JSON-lines stream
async fn relay<R, W>(
    requests: &mut mpsc::UnboundedReceiver<HostRequest>,
    events: &mpsc::UnboundedSender<HostEvent>,
    reader: R,
    mut writer: W,
    kill: &CancellationToken,
) -> RelayEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut requests_open = true;

    loop {
        tokio::select! {
            _ = kill.cancelled() => return RelayEnd::Killed,

            request = requests.recv(), if requests_open => match request {
                Some(request) => {
                    if let Err(e) = write_line(&mut writer, &request).await {
                        debug!("failed to write to worker host: {}", e);
                    }
                }
                None => {
                    requests_open = false;
                    let _ = writer.shutdown().await;
                }
            },

            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match decode_event(&line) {
                    Ok(event) => {
                        let _ = events.send(event);
                    }
                    Err(e) => warn!("{}", e),
                },
                Ok(None) => return RelayEnd::Eof,
                Err(e) => {
                    warn!("failed to read from worker host: {}", e);
                    return RelayEnd::Eof;
                }
            },
        }
    }
}

/// One JSON line from a worker host
fn decode_event(line: &str) -> std::result::Result<HostEvent, PoolError> {
    serde_json::from_str(line).map_err(|e| PoolError::Protocol(format!("{}: {}", e, line.trim())))
}

pub(crate) async fn write_line<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(message).map_err(std::io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Runs each worker as a child process speaking JSON lines on stdio
#[derive(Debug, Clone)]
pub struct ChildProcessHost {
    program: PathBuf,
    args: Vec<String>,
}

impl ChildProcessHost {
    /// Run `program args...` as the worker host
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-enter the current executable as `git-dispatch worker`
    pub fn current_exe(options: &ServeOptions) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| PoolError::HostLaunch(format!("cannot locate current executable: {}", e)))?;
        Ok(Self::new(program, options.worker_args()))
    }
}

impl ProcessHost for ChildProcessHost {
    fn launch(&self, worker: WorkerId) -> Result<HostLink> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::HostLaunch(format!("{}: {}", self.program.display(), e)))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(PoolError::HostLaunch("worker stdio was not captured".to_string()).into());
        };
        info!(%worker, pid = ?child.id(), "worker process started");

        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let token = kill.clone();

        tokio::spawn(async move {
            let end = relay(&mut requests_rx, &events_tx, stdout, stdin, &token).await;
            if end == RelayEnd::Killed {
                let _ = child.start_kill();
            }

            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|status| status.code());
            debug!(%worker, ?code, "worker process exited");
            let _ = events_tx.send(HostEvent::Exited { code });
        });

        Ok(HostLink {
            requests: requests_tx,
            events: events_rx,
            kill,
        })
    }
}

/// Runs each worker loop on a task of the current runtime
#[derive(Debug, Clone, Default)]
pub struct InProcessHost {
    options: ServeOptions,
}

impl InProcessHost {
    pub fn new(options: ServeOptions) -> Self {
        Self { options }
    }
}

impl ProcessHost for InProcessHost {
    fn launch(&self, worker: WorkerId) -> Result<HostLink> {
        let (host_side, worker_side) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let (host_read, host_write) = tokio::io::split(host_side);

        let serve_task = tokio::spawn(serve(worker_read, worker_write, self.options.clone()));
        info!(%worker, "in-process worker started");

        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let token = kill.clone();

        tokio::spawn(async move {
            let code = match relay(&mut requests_rx, &events_tx, host_read, host_write, &token).await {
                RelayEnd::Killed => {
                    // Dropping the loop drops its children, which kills them
                    serve_task.abort();
                    None
                }
                RelayEnd::Eof => match serve_task.await {
                    Ok(Ok(())) => Some(0),
                    Ok(Err(e)) => {
                        warn!(%worker, "worker loop failed: {}", e);
                        Some(1)
                    }
                    Err(_) => None,
                },
            };
            let _ = events_tx.send(HostEvent::Exited { code });
        });

        Ok(HostLink {
            requests: requests_tx,
            events: events_rx,
            kill,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn next(link: &mut HostLink) -> HostEvent {
        tokio::time::timeout(Duration::from_secs(10), link.events.recv())
            .await
            .expect("timed out waiting for host event")
            .expect("host event channel closed")
    }

    #[test]
    fn test_wire_format() {
        let line = serde_json::to_string(&HostRequest::Cancel {
            id: OperationId::new(4),
        })
        .unwrap();
        assert_eq!(line, r#"{"type":"cancel","id":4}"#);

        let event: HostEvent = serde_json::from_str(r#"{"type":"sick","reason":"slow spawn"}"#).unwrap();
        assert_eq!(
            event,
            HostEvent::Sick {
                reason: "slow spawn".to_string()
            }
        );
    }

    #[test]
    fn test_undecodable_event_is_a_protocol_error() {
        let err = decode_event("{\"type\":\"exploded\"}").unwrap_err();
        assert!(matches!(err, PoolError::Protocol(ref m) if m.contains("exploded")));
        assert_eq!(decode_event(r#"{"type":"ready"}"#).unwrap(), HostEvent::Ready);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_in_process_host_runs_and_shuts_down() {
        let host = InProcessHost::default();
        let mut link = host.launch(WorkerId::new()).unwrap();
        assert_eq!(next(&mut link).await, HostEvent::Ready);

        let invocation = Invocation {
            program: "sh".into(),
            args: vec!["-c".to_string(), "printf hi".to_string()],
            cwd: std::env::temp_dir(),
            env: BTreeMap::new(),
            stdin: None,
        };
        let id = OperationId::new(1);
        link.requests.send(HostRequest::Run { id, invocation }).unwrap();

        assert_eq!(next(&mut link).await, HostEvent::Started { id });
        match next(&mut link).await {
            HostEvent::Completed { id: done, output } => {
                assert_eq!(done, id);
                assert_eq!(output.stdout, "hi");
            }
            other => panic!("unexpected event {:?}", other),
        }

        link.requests.send(HostRequest::Shutdown).unwrap();
        assert_eq!(next(&mut link).await, HostEvent::Exited { code: Some(0) });
    }

    #[tokio::test]
    async fn test_kill_switch_reports_exit() {
        let host = InProcessHost::default();
        let mut link = host.launch(WorkerId::new()).unwrap();
        assert_eq!(next(&mut link).await, HostEvent::Ready);

        link.kill.cancel();
        assert_eq!(next(&mut link).await, HostEvent::Exited { code: None });
    }

    #[tokio::test]
    async fn test_child_host_missing_program() {
        let host = ChildProcessHost::new("/definitely/not/a/worker", Vec::new());
        let err = host.launch(WorkerId::new()).err().unwrap();
        assert!(matches!(err, crate::Error::Pool(PoolError::HostLaunch(_))));
    }
}
