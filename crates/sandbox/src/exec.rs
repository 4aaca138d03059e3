//! Execution engine: spawns one command, merges its output channels and
//! enforces its timeout.
//!
//! Data path, every hop bounded:
//!
//! ```text
//! child stdout ─▶ reader ─▶ [PIPE_DEPTH] ─┐
//!                                          ├─ FanIn ─▶ pump ─▶ [EVENT_DEPTH] ─▶ ExecStream
//! child stderr ─▶ reader ─▶ [PIPE_DEPTH] ─┘
//! ```
//!
//! When the consumer stops reading, the pump blocks on delivery, the readers
//! block on their channels, the OS pipes fill up and the child blocks on
//! write. The timeout keeps running while delivery is blocked.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio::time::{Instant, sleep, sleep_until, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::merge::FanIn;
use crate::process::kill_process_group;
use crate::runtime::Runtime;
use crate::stream::ExecStream;
use crate::types::{
    ExecStreamEvent, KILLED_EXIT_CODE, OutputChannel, SandboxId, TIMEOUT_EXIT_CODE,
};

const READ_CHUNK: usize = 8 * 1024;
/// Chunks buffered per output channel between reader and pump.
const PIPE_DEPTH: usize = 4;
/// Events buffered between pump and consumer.
const EVENT_DEPTH: usize = 16;
/// How long output is still collected after the command exited while
/// background processes keep its pipes open.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(200);
/// How long output is still delivered after a forced kill.
const KILL_DRAIN_GRACE: Duration = Duration::from_millis(100);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the engine needs besides the command itself.
pub(crate) struct Launch<R: Runtime> {
    pub runtime: Arc<R>,
    pub handle: Arc<R::Handle>,
    pub id: SandboxId,
    pub marker: String,
    /// User the command runs as; cleanup runs as the same user.
    pub user: Option<String>,
    pub timeout: Duration,
    /// Fired by `stop()`; ends the command with exit code 137.
    pub cancel: CancellationToken,
    /// Slot in the instance's execution queue, released when the command ends.
    pub permit: OwnedMutexGuard<()>,
}

enum Outcome {
    Completed,
    TimedOut,
    Cancelled,
    /// Consumer dropped the stream.
    Detached,
    Failed(String),
}

/// Spawn `command` and return its live output.
pub(crate) fn launch<R: Runtime>(launch: Launch<R>, mut command: Command) -> Result<ExecStream> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| SandboxError::ExecFailed(format!("failed to spawn command: {e}")))?;
    let pid = child.id();
    if let Some(pid) = pid {
        launch.runtime.track(&launch.handle, pid);
    }

    let (stdout_tx, stdout_rx) = mpsc::channel(PIPE_DEPTH);
    let (stderr_tx, stderr_rx) = mpsc::channel(PIPE_DEPTH);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_pipe(stdout, stdout_tx));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_pipe(stderr, stderr_tx));
    }
    let fan_in = FanIn::new(vec![
        (OutputChannel::Stdout, stdout_rx),
        (OutputChannel::Stderr, stderr_rx),
    ]);

    let (tx, rx) = mpsc::channel(EVENT_DEPTH);
    let id = launch.id;
    tokio::spawn(pump(launch, child, pid, fan_in, tx));
    Ok(ExecStream::new(id, rx))
}

async fn read_pipe<P: AsyncRead + Unpin>(mut pipe: P, tx: mpsc::Sender<Bytes>) {
    loop {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        match pipe.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(buf.freeze()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}

async fn pump<R: Runtime>(
    launch: Launch<R>,
    mut child: Child,
    pid: Option<u32>,
    mut fan_in: FanIn<OutputChannel, Bytes>,
    tx: mpsc::Sender<ExecStreamEvent>,
) {
    let Launch {
        runtime,
        handle,
        id,
        marker,
        user,
        timeout: limit,
        cancel,
        permit,
    } = launch;

    let started = Instant::now();
    let deadline = sleep_until(started + limit);
    tokio::pin!(deadline);
    let drain = sleep(Duration::ZERO);
    tokio::pin!(drain);

    let mut status: Option<ExitStatus> = None;
    let mut pipes_open = true;

    let outcome = loop {
        if !pipes_open && status.is_some() {
            break Outcome::Completed;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break Outcome::Cancelled,
            _ = &mut deadline => break Outcome::TimedOut,
            item = fan_in.next(), if pipes_open => match item {
                Some((channel, data)) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Outcome::Cancelled,
                        _ = &mut deadline => break Outcome::TimedOut,
                        sent = tx.send(ExecStreamEvent::chunk(channel, data)) => {
                            if sent.is_err() {
                                break Outcome::Detached;
                            }
                        }
                    }
                }
                None => pipes_open = false,
            },
            waited = child.wait(), if status.is_none() => match waited {
                Ok(exit) => {
                    status = Some(exit);
                    drain.as_mut().reset(Instant::now() + EXIT_DRAIN_GRACE);
                }
                Err(e) => break Outcome::Failed(e.to_string()),
            },
            _ = &mut drain, if status.is_some() && pipes_open => {
                // background processes still hold the pipes
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                break Outcome::Completed;
            }
        }
    };
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let exit = match outcome {
        Outcome::Completed => {
            let exit_code = status.map(exit_code).unwrap_or(-1);
            debug!(id = %id, exit_code, duration_ms, "command finished");
            Some(exit_event(exit_code, duration_ms, false))
        }
        Outcome::TimedOut => {
            warn!(id = %id, timeout = ?limit, "command timed out, killing");
            terminate(&*runtime, &handle, &marker, user.as_deref(), &mut child, pid).await;
            drain_after_kill(&mut fan_in, &tx).await;
            Some(exit_event(TIMEOUT_EXIT_CODE, duration_ms, true))
        }
        Outcome::Cancelled => {
            debug!(id = %id, "command cancelled by stop");
            terminate(&*runtime, &handle, &marker, user.as_deref(), &mut child, pid).await;
            drain_after_kill(&mut fan_in, &tx).await;
            Some(exit_event(KILLED_EXIT_CODE, duration_ms, false))
        }
        Outcome::Detached => {
            debug!(id = %id, "output stream dropped, killing command");
            terminate(&*runtime, &handle, &marker, user.as_deref(), &mut child, pid).await;
            None
        }
        Outcome::Failed(error) => {
            warn!(id = %id, error = %error, "failed to wait for command");
            terminate(&*runtime, &handle, &marker, user.as_deref(), &mut child, pid).await;
            Some(exit_event(-1, duration_ms, false))
        }
    };

    if let Some(pid) = pid {
        runtime.untrack(&handle, pid);
    }
    if let Some(exit) = exit {
        let _ = tx.send(exit).await;
    }
    drop(permit);
}

/// Kill the host-side process group, let the runtime clean up what the
/// host cannot reach, then reap.
async fn terminate<R: Runtime>(
    runtime: &R,
    handle: &R::Handle,
    marker: &str,
    user: Option<&str>,
    child: &mut Child,
    pid: Option<u32>,
) {
    if let Some(pid) = pid {
        kill_process_group(pid);
    }
    runtime.abort(handle, marker, user).await;
    if timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
        warn!(pid = ?pid, "command did not exit after SIGKILL");
    }
}

async fn drain_after_kill(
    fan_in: &mut FanIn<OutputChannel, Bytes>,
    tx: &mpsc::Sender<ExecStreamEvent>,
) {
    let deadline = Instant::now() + KILL_DRAIN_GRACE;
    while let Ok(Some((channel, data))) = timeout_at(deadline, fan_in.next()).await {
        let sent = timeout_at(deadline, tx.send(ExecStreamEvent::chunk(channel, data))).await;
        if !matches!(sent, Ok(Ok(()))) {
            break;
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

fn exit_event(exit_code: i32, duration_ms: u64, timed_out: bool) -> ExecStreamEvent {
    ExecStreamEvent::Exit {
        exit_code,
        duration_ms,
        timed_out,
    }
}
