use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use sandbox::{ExecOptions, ExecStream, ExecStreamEvent, SandboxId, SandboxService, StreamBridge};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{BridgeSection, DEFAULT_QUEUE_DEPTH};
use crate::error::{RunnerError, RunnerResult};
use crate::sink::{QueuedSink, StdoutSink, WebhookSink};

#[derive(Args)]
pub struct RunArgs {
    /// Per-call override (JSON or YAML)
    #[arg(long = "override", value_name = "FILE")]
    pub override_file: Option<PathBuf>,

    #[arg(long, default_value = "sandboxctl")]
    pub agent: String,

    #[arg(long, default_value = "default")]
    pub project: String,

    /// Copy a host path in before running, as HOST:SANDBOX_PATH (repeatable)
    #[arg(long = "copy-in", value_name = "HOST:PATH", value_parser = parse_copy)]
    pub copy_in: Vec<(String, String)>,

    /// Copy a sandbox path out after running, as SANDBOX_PATH:HOST (repeatable)
    #[arg(long = "copy-out", value_name = "PATH:HOST", value_parser = parse_copy)]
    pub copy_out: Vec<(String, String)>,

    /// Working directory inside the sandbox
    #[arg(long)]
    pub cwd: Option<String>,

    /// Extra variable for the command, as NAME=VALUE (repeatable)
    #[arg(long = "env", value_name = "NAME=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[arg(long)]
    pub user: Option<String>,

    /// Print normalized terminal events as JSON lines instead of raw output
    #[arg(long)]
    pub events: bool,

    /// Command line, run by `sh -c` inside the sandbox
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

fn parse_copy(value: &str) -> Result<(String, String), String> {
    match value.split_once(':') {
        Some((from, to)) if !from.is_empty() && !to.is_empty() => {
            Ok((from.to_string(), to.to_string()))
        }
        _ => Err(format!("expected FROM:TO, got {value:?}")),
    }
}

fn parse_env(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, val)) if !name.is_empty() => Ok((name.to_string(), val.to_string())),
        _ => Err(format!("expected NAME=VALUE, got {value:?}")),
    }
}

/// Exit status of the process mirrors the command's.
fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map(ExitCode::from).unwrap_or(ExitCode::FAILURE)
}

/// Create a sandbox, run one command in it and remove it again.
pub async fn run_run(
    service: &SandboxService,
    bridge: Option<&BridgeSection>,
    args: RunArgs,
) -> RunnerResult<ExitCode> {
    let layer = super::load_override(args.override_file.as_deref()).await?;
    let instance = service.create(&args.agent, &args.project, &layer).await?;
    info!(id = %instance.id, provider = %instance.provider, "sandbox ready");

    let outcome = tokio::select! {
        outcome = run_in(service, instance.id, bridge, &args) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!(id = %instance.id, "interrupted");
            Err(RunnerError::Internal("interrupted".to_string()))
        }
    };

    if let Err(e) = service.remove(instance.id).await {
        warn!(id = %instance.id, error = %e, "failed to remove sandbox");
    }
    outcome
}

async fn run_in(
    service: &SandboxService,
    id: SandboxId,
    bridge: Option<&BridgeSection>,
    args: &RunArgs,
) -> RunnerResult<ExitCode> {
    service.start(id).await?;
    for (host, path) in &args.copy_in {
        service.copy_in(id, Path::new(host), path).await?;
    }

    let mut options = ExecOptions {
        cwd: args.cwd.clone(),
        timeout_ms: args.timeout_ms,
        user: args.user.clone(),
        ..Default::default()
    };
    options.env.extend(args.env.iter().cloned());

    let command = args.command.join(" ");
    let stream = service.exec_stream(id, &command, &options).await?;

    let (stream, deliveries) = attach_sinks(stream, bridge, args.events)?;
    let exit = print_stream(stream, !args.events).await?;
    for delivery in deliveries {
        delivery.finish().await;
    }

    for (path, host) in &args.copy_out {
        service.copy_out(id, path, Path::new(host)).await?;
    }
    Ok(exit_code(exit))
}

/// A queued sink plus the task draining it.
struct Delivery {
    name: &'static str,
    sink: Arc<dyn QueuedSink>,
    task: JoinHandle<()>,
}

impl Delivery {
    fn new<S: QueuedSink + 'static>(name: &'static str, sink: Arc<S>, task: JoinHandle<()>) -> Self {
        Self { name, sink, task }
    }

    /// Wait until every queued event has been handed off or given up on.
    async fn finish(self) {
        let dropped = self.sink.dropped();
        // The task drains the queue once the last sink handle is gone.
        drop(self.sink);
        if let Err(e) = self.task.await {
            warn!(sink = self.name, error = %e, "event delivery task failed");
        }
        if dropped > 0 {
            warn!(sink = self.name, dropped, "terminal events dropped because the queue was full");
        }
    }
}

/// Tee the stream into the webhook (if configured) and the JSON-lines printer
/// (if asked for).
fn attach_sinks(
    mut stream: ExecStream,
    bridge: Option<&BridgeSection>,
    events: bool,
) -> RunnerResult<(ExecStream, Vec<Delivery>)> {
    let mut deliveries = Vec::new();
    if let Some(section) = bridge {
        let (sink, task) = WebhookSink::spawn(section)?;
        let sink = Arc::new(sink);
        stream = StreamBridge::new(sink.clone()).forward(stream);
        deliveries.push(Delivery::new("webhook", sink, task));
    }
    if events {
        let (sink, task) = StdoutSink::spawn(DEFAULT_QUEUE_DEPTH);
        let sink = Arc::new(sink);
        stream = StreamBridge::new(sink.clone()).forward(stream);
        deliveries.push(Delivery::new("stdout", sink, task));
    }
    Ok((stream, deliveries))
}

async fn print_stream(mut stream: ExecStream, raw: bool) -> RunnerResult<i32> {
    while let Some(event) = stream.next_event().await {
        match event {
            ExecStreamEvent::Stdout(data) if raw => {
                let mut out = std::io::stdout().lock();
                out.write_all(&data)?;
                out.flush()?;
            }
            ExecStreamEvent::Stderr(data) if raw => {
                std::io::stderr().lock().write_all(&data)?;
            }
            ExecStreamEvent::Exit {
                exit_code,
                duration_ms,
                timed_out,
            } => {
                info!(exit_code, duration_ms, timed_out, "command finished");
                return Ok(exit_code);
            }
            _ => {}
        }
    }
    Err(RunnerError::Internal(
        "stream ended without an exit event".to_string(),
    ))
}
