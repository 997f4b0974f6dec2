//! Subprocess runner shared by in-process execution and the worker host
//!
//! Spawns one fully resolved invocation, feeds stdin, collects output and
//! honors a cancellation token by killing the child.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{Invocation, RawOutput};
use crate::error::{GitError, Result};

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited on its own
    Exited(RawOutput),
    /// The process was killed because the token was cancelled
    Cancelled,
}

/// Run an invocation to completion or cancellation.
///
/// `on_spawn` is called once the OS process exists, with the time the spawn
/// took; the worker host uses it for the started notification and the
/// slow-spawn heuristic.
#[instrument(skip_all, fields(command = %invocation.command_line()))]
pub async fn run(
    invocation: &Invocation,
    cancel: &CancellationToken,
    on_spawn: impl FnOnce(Duration),
) -> Result<RunOutcome> {
    if cancel.is_cancelled() {
        return Ok(RunOutcome::Cancelled);
    }

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .current_dir(&invocation.cwd)
        .envs(&invocation.env)
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            GitError::NotInstalled(invocation.program.clone())
        } else {
            GitError::SpawnFailed {
                command: invocation.command_line(),
                reason: e.to_string(),
            }
        }
    })?;
    on_spawn(started.elapsed());
    debug!(pid = ?child.id(), "spawned");

    if let (Some(input), Some(mut stdin)) = (invocation.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!("stdin closed early: {}", e);
            }
        });
    }

    let stdout = child.stdout.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).await.map(|_| buf)
        })
    });
    let stderr = child.stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf).await.map(|_| buf)
        })
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            debug!("cancellation requested, killing child");
            if let Err(e) = child.start_kill() {
                warn!("failed to kill child: {}", e);
            }
            child.wait().await?;
            return Ok(RunOutcome::Cancelled);
        }
    };

    let stdout = collect(stdout).await;
    let stderr = collect(stderr).await;

    Ok(RunOutcome::Exited(RawOutput {
        exit_code: status.code(),
        stdout,
        stderr,
    }))
}

async fn collect(
    handle: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
) -> String {
    match handle {
        Some(handle) => match handle.await {
            Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Err(e)) => {
                warn!("failed to read child output: {}", e);
                String::new()
            }
            Err(e) => {
                warn!("output reader task failed: {}", e);
                String::new()
            }
        },
        None => String::new(),
    }
}

/// Ask a process that is not our child to terminate
#[cfg(unix)]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(std::io::Error::other)?;
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

/// Ask a process that is not our child to terminate
#[cfg(windows)]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if !status.success() {
        debug!(pid, "taskkill reported {}", status);
    }
    Ok(())
}
