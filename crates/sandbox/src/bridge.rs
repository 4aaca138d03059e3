//! Stream bridge: forwards execution output to an external durable stream.
//!
//! Push-only. The bridge hands every normalized event to a [`StreamSink`]
//! and moves on; it never waits for the sink, so a slow or dead sink cannot
//! stall a command. Buffering and retry are the sink's business.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::stream::ExecStream;
use crate::types::{ExecStreamEvent, OutputChannel, SandboxId};

const FORWARD_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalEventKind {
    Stdout,
    Stderr,
    Exit,
}

/// Normalized terminal-output event as pushed to the durable stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutputEvent {
    pub sandbox_id: SandboxId,
    /// One id per forwarded command.
    pub stream_id: Uuid,
    /// Gapless per `stream_id`, starting at 0.
    pub sequence: u64,
    pub kind: TerminalEventKind,
    /// UTF-8 text for output events. Multi-byte characters split across
    /// chunks are reassembled; invalid bytes become U+FFFD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

/// Destination of terminal-output events. Must not block.
pub trait StreamSink: Send + Sync {
    fn push(&self, event: TerminalOutputEvent);
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Turns raw [`ExecStreamEvent`]s of one command into [`TerminalOutputEvent`]s.
#[derive(Debug)]
pub struct TerminalNormalizer {
    sandbox_id: SandboxId,
    stream_id: Uuid,
    sequence: u64,
    stdout_carry: Vec<u8>,
    stderr_carry: Vec<u8>,
}

impl TerminalNormalizer {
    pub fn new(sandbox_id: SandboxId) -> Self {
        Self {
            sandbox_id,
            stream_id: Uuid::new_v4(),
            sequence: 0,
            stdout_carry: Vec::new(),
            stderr_carry: Vec::new(),
        }
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    /// Zero or more normalized events for one raw event. An exit event first
    /// flushes any partial character still held back.
    pub fn normalize(&mut self, event: &ExecStreamEvent) -> Vec<TerminalOutputEvent> {
        match event {
            ExecStreamEvent::Stdout(data) => self.chunk(OutputChannel::Stdout, data),
            ExecStreamEvent::Stderr(data) => self.chunk(OutputChannel::Stderr, data),
            ExecStreamEvent::Exit {
                exit_code,
                duration_ms,
                timed_out,
            } => {
                let mut events = Vec::with_capacity(3);
                for channel in [OutputChannel::Stdout, OutputChannel::Stderr] {
                    let carry = std::mem::take(self.carry(channel));
                    if !carry.is_empty() {
                        let text = String::from_utf8_lossy(&carry).into_owned();
                        events.push(self.output(channel, text));
                    }
                }
                let mut exit = self.event(TerminalEventKind::Exit);
                exit.exit_code = Some(*exit_code);
                exit.duration_ms = Some(*duration_ms);
                exit.timed_out = Some(*timed_out);
                events.push(exit);
                events
            }
        }
    }

    fn chunk(&mut self, channel: OutputChannel, data: &[u8]) -> Vec<TerminalOutputEvent> {
        let text = decode_utf8(self.carry(channel), data);
        if text.is_empty() {
            return Vec::new();
        }
        vec![self.output(channel, text)]
    }

    fn carry(&mut self, channel: OutputChannel) -> &mut Vec<u8> {
        match channel {
            OutputChannel::Stdout => &mut self.stdout_carry,
            OutputChannel::Stderr => &mut self.stderr_carry,
        }
    }

    fn output(&mut self, channel: OutputChannel, text: String) -> TerminalOutputEvent {
        let kind = match channel {
            OutputChannel::Stdout => TerminalEventKind::Stdout,
            OutputChannel::Stderr => TerminalEventKind::Stderr,
        };
        let mut event = self.event(kind);
        event.data = Some(text);
        event
    }

    fn event(&mut self, kind: TerminalEventKind) -> TerminalOutputEvent {
        let sequence = self.sequence;
        self.sequence += 1;
        TerminalOutputEvent {
            sandbox_id: self.sandbox_id,
            stream_id: self.stream_id,
            sequence,
            kind,
            data: None,
            exit_code: None,
            duration_ms: None,
            timed_out: None,
            timestamp: Utc::now(),
        }
    }
}

/// Append `data` to `carry` and return the decodable prefix. An incomplete
/// trailing character stays in `carry` for the next chunk.
fn decode_utf8(carry: &mut Vec<u8>, data: &[u8]) -> String {
    carry.extend_from_slice(data);
    let mut out = String::new();
    loop {
        let (valid, invalid) = match std::str::from_utf8(carry) {
            Ok(_) => (carry.len(), None),
            Err(e) => (e.valid_up_to(), Some(e.error_len())),
        };
        out.push_str(&String::from_utf8_lossy(carry.get(..valid).unwrap_or_default()));
        match invalid {
            None => {
                carry.clear();
                break;
            }
            Some(Some(len)) => {
                out.push(char::REPLACEMENT_CHARACTER);
                let end = (valid + len).min(carry.len());
                carry.drain(..end);
            }
            Some(None) => {
                carry.drain(..valid);
                break;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StreamBridge {
    sink: Arc<dyn StreamSink>,
}

impl StreamBridge {
    pub fn new(sink: Arc<dyn StreamSink>) -> Self {
        Self { sink }
    }

    /// Tee `stream` into the sink. The returned stream yields the same
    /// events in the same order; dropping it kills the command as usual.
    pub fn forward(&self, mut stream: ExecStream) -> ExecStream {
        let id = stream.id();
        let (tx, rx) = mpsc::channel(FORWARD_DEPTH);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            let mut normalizer = TerminalNormalizer::new(id);
            while let Some(event) = stream.next_event().await {
                for normalized in normalizer.normalize(&event) {
                    sink.push(normalized);
                }
                let last = event.is_exit();
                if tx.send(event).await.is_err() || last {
                    break;
                }
            }
        });
        ExecStream::new(id, rx)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Bounded in-process sink. Events that do not fit are dropped and counted.
pub struct ChannelSink {
    tx: mpsc::Sender<TerminalOutputEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TerminalOutputEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl StreamSink for ChannelSink {
    fn push(&self, event: TerminalOutputEvent) {
        if self.tx.try_send(event).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, "stream sink full, dropping terminal output");
            }
        }
    }
}
