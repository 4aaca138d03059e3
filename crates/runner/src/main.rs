mod cmd;
mod config;
mod error;
mod http;
mod providers;
mod sink;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

use crate::error::RunnerResult;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "sandboxctl", version)]
struct Cli {
    /// Runner config file [default: sandbox.yaml, if present]
    #[arg(long, global = true, env = "SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that every configured provider's backend is reachable
    Health,
    /// Print the effective sandbox policy for an override
    Resolve(cmd::ResolveArgs),
    /// Create a sandbox, run one command in it, then remove it
    Run(Box<cmd::RunArgs>),
}

async fn dispatch(cli: Cli) -> RunnerResult<ExitCode> {
    let explicit = cli.config.is_some();
    let path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_FILE));
    let runner_config = config::load_or_default(&path, explicit).await?;
    let service = providers::build_service(&runner_config)?;

    match cli.command {
        Command::Health => cmd::run_health(&service).await,
        Command::Resolve(args) => cmd::run_resolve(&service, args)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Run(args) => {
            let result = cmd::run_run(&service, runner_config.bridge.as_ref(), *args).await;
            service.shutdown().await;
            result
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so command output on stdout stays clean.
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
