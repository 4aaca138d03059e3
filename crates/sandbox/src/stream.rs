use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::error::{Result, SandboxError};
use crate::types::{ExecResult, ExecStreamEvent, SandboxId};

/// Live output of one command.
///
/// Finite and not restartable: it yields output chunks, then exactly one
/// [`ExecStreamEvent::Exit`], then `None`. Dropping the stream before the
/// exit event kills the command.
///
/// The producer side is bounded. A consumer that stops reading eventually
/// stalls the command on its own stdout/stderr writes instead of growing
/// memory.
#[derive(Debug)]
pub struct ExecStream {
    id: SandboxId,
    rx: mpsc::Receiver<ExecStreamEvent>,
}

impl ExecStream {
    pub(crate) fn new(id: SandboxId, rx: mpsc::Receiver<ExecStreamEvent>) -> Self {
        Self { id, rx }
    }

    /// Sandbox the command runs in.
    pub fn id(&self) -> SandboxId {
        self.id
    }

    pub async fn next_event(&mut self) -> Option<ExecStreamEvent> {
        self.rx.recv().await
    }

    /// Drain the stream into an [`ExecResult`].
    ///
    /// With `max_output_bytes`, each of stdout and stderr keeps at most that
    /// many bytes; the rest is read and discarded so the command is not
    /// stalled, and `truncated` is set.
    pub async fn collect(mut self, max_output_bytes: Option<usize>) -> Result<ExecResult> {
        let mut stdout = Capture::new(max_output_bytes);
        let mut stderr = Capture::new(max_output_bytes);

        while let Some(event) = self.rx.recv().await {
            match event {
                ExecStreamEvent::Stdout(data) => stdout.push(&data),
                ExecStreamEvent::Stderr(data) => stderr.push(&data),
                ExecStreamEvent::Exit {
                    exit_code,
                    duration_ms,
                    timed_out,
                } => {
                    let truncated = stdout.truncated || stderr.truncated;
                    return Ok(ExecResult {
                        exit_code,
                        stdout: stdout.into_string(),
                        stderr: stderr.into_string(),
                        duration_ms,
                        timed_out,
                        truncated,
                    });
                }
            }
        }

        Err(SandboxError::ExecFailed(format!(
            "output stream of sandbox {} ended without an exit status",
            self.id
        )))
    }
}

impl Stream for ExecStream {
    type Item = ExecStreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

struct Capture {
    buf: BytesMut,
    limit: Option<usize>,
    truncated: bool,
}

impl Capture {
    fn new(limit: Option<usize>) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, data: &[u8]) {
        let Some(limit) = self.limit else {
            self.buf.extend_from_slice(data);
            return;
        };
        let room = limit.saturating_sub(self.buf.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.buf
            .extend_from_slice(data.get(..room.min(data.len())).unwrap_or_default());
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}
