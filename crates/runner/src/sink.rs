use std::time::Duration;

use sandbox::{ChannelSink, StreamSink, TerminalOutputEvent};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::BridgeSection;
use crate::error::RunnerResult;
use crate::http::WebhookClient;

const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Serialize)]
struct Batch<'a> {
    events: &'a [TerminalOutputEvent],
}

/// Pushes terminal output to an HTTP endpoint.
///
/// `push` only enqueues; a background task drains the queue in batches.
/// When the queue is full, events are dropped and counted rather than
/// slowing the command down.
pub struct WebhookSink {
    queue: ChannelSink,
}

impl WebhookSink {
    /// Start the delivery task. It ends once the sink is dropped and the
    /// queue is drained.
    pub fn spawn(section: &BridgeSection) -> RunnerResult<(Self, JoinHandle<()>)> {
        let client = WebhookClient::new(section.url.clone(), section.token.clone())?
            .with_retries(section.max_attempts, RETRY_DELAY);
        Ok(Self::with_client(client, section.queue_depth, section.batch_size))
    }

    pub fn with_client(
        client: WebhookClient,
        queue_depth: usize,
        batch_size: usize,
    ) -> (Self, JoinHandle<()>) {
        let (queue, rx) = ChannelSink::new(queue_depth);
        let task = tokio::spawn(deliver(client, rx, batch_size.max(1)));
        (Self { queue }, task)
    }

}

impl StreamSink for WebhookSink {
    fn push(&self, event: TerminalOutputEvent) {
        self.queue.push(event);
    }
}

async fn deliver(
    client: WebhookClient,
    mut rx: mpsc::Receiver<TerminalOutputEvent>,
    batch_size: usize,
) {
    let mut batch = Vec::with_capacity(batch_size);
    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        match client.post_json(&Batch { events: &batch }).await {
            Ok(()) => debug!(events = batch.len(), "batch delivered"),
            Err(e) => warn!(events = batch.len(), error = %e, "dropping undeliverable batch"),
        }
        batch.clear();
    }
}

/// Writes each event as one JSON line.
///
/// Like [`WebhookSink`], `push` only enqueues; a slow reader on the other
/// end of the pipe costs dropped events, not a stalled command.
pub struct StdoutSink {
    queue: ChannelSink,
}

impl StdoutSink {
    pub fn spawn(queue_depth: usize) -> (Self, JoinHandle<()>) {
        Self::with_writer(tokio::io::stdout(), queue_depth)
    }

    pub fn with_writer<W>(writer: W, queue_depth: usize) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (queue, rx) = ChannelSink::new(queue_depth);
        let task = tokio::spawn(write_lines(writer, rx));
        (Self { queue }, task)
    }
}

impl StreamSink for StdoutSink {
    fn push(&self, event: TerminalOutputEvent) {
        self.queue.push(event);
    }
}

async fn write_lines<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<TerminalOutputEvent>,
) {
    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize terminal event");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).await {
            debug!(error = %e, "event output closed");
            return;
        }
    }
    if let Err(e) = writer.flush().await {
        debug!(error = %e, "event output closed");
    }
}

/// A sink fed through a bounded queue.
pub trait QueuedSink: Send + Sync {
    /// Events discarded because the queue was full.
    fn dropped(&self) -> u64;
}

impl QueuedSink for WebhookSink {
    fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

impl QueuedSink for StdoutSink {
    fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use sandbox::SandboxId;
    use sandbox::bridge::{TerminalEventKind, TerminalNormalizer};
    use sandbox::ExecStreamEvent;

    use super::*;

    fn events(n: usize) -> Vec<TerminalOutputEvent> {
        let mut normalizer = TerminalNormalizer::new(SandboxId::generate());
        let mut out = Vec::new();
        for i in 0..n {
            let chunk = ExecStreamEvent::Stdout(format!("line {i}\n").into());
            out.extend(normalizer.normalize(&chunk));
        }
        out
    }

    fn client(server: &MockServer) -> WebhookClient {
        WebhookClient::new(server.url("/events"), Some("t0ken".to_string()))
            .unwrap()
            .with_retries(2, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn delivers_batches_with_bearer_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/events")
                    .header("authorization", "Bearer t0ken")
                    .body_contains("\"kind\":\"stdout\"");
                then.status(204);
            })
            .await;

        let (sink, task) = WebhookSink::with_client(client(&server), 64, 4);
        for event in events(10) {
            sink.push(event);
        }
        drop(sink);
        task.await.unwrap();

        // 10 events in batches of at most 4.
        let calls = mock.hits_async().await;
        assert!((3..=10).contains(&calls), "calls: {calls}");
    }

    #[tokio::test]
    async fn failed_batches_are_retried_then_dropped() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/events");
                then.status(503);
            })
            .await;

        let (sink, task) = WebhookSink::with_client(client(&server), 8, 8);
        for event in events(3) {
            sink.push(event);
        }
        drop(sink);
        task.await.unwrap();

        // One batch, two attempts.
        assert_eq!(mock.hits_async().await, 2);
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/events");
                then.status(200).delay(Duration::from_millis(200));
            })
            .await;

        let (sink, task) = WebhookSink::with_client(client(&server), 2, 1);
        for event in events(50) {
            sink.push(event);
        }
        assert!(QueuedSink::dropped(&sink) > 0);
        drop(sink);
        task.abort();
    }

    #[tokio::test]
    async fn stdout_sink_writes_one_line_per_event() {
        let (reader, writer) = tokio::io::duplex(64 * 1024);
        let (sink, task) = StdoutSink::with_writer(writer, 16);
        for event in events(3) {
            sink.push(event);
        }
        drop(sink);
        task.await.unwrap();

        let mut out = String::new();
        let mut reader = reader;
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut out)
            .await
            .unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "stdout");
    }

    #[tokio::test]
    async fn stalled_stdout_reader_does_not_block_push() {
        // Nobody reads the other end, so the writer stalls after 16 bytes.
        let (_reader, writer) = tokio::io::duplex(16);
        let (sink, task) = StdoutSink::with_writer(writer, 2);
        for event in events(50) {
            sink.push(event);
        }
        assert!(QueuedSink::dropped(&sink) > 0);
        drop(sink);
        task.abort();
    }

    #[test]
    fn exit_event_serializes_without_data() {
        let mut normalizer = TerminalNormalizer::new(SandboxId::generate());
        let exit = normalizer.normalize(&ExecStreamEvent::Exit {
            exit_code: 3,
            duration_ms: 12,
            timed_out: false,
        });
        assert_eq!(exit.len(), 1);
        assert_eq!(exit[0].kind, TerminalEventKind::Exit);
        let json = serde_json::to_value(&exit[0]).unwrap();
        assert_eq!(json["exitCode"], 3);
        assert!(json.get("data").is_none());
    }
}
