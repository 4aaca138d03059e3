use std::path::PathBuf;

use clap::Args;
use sandbox::SandboxService;

use crate::error::{RunnerError, RunnerResult};

#[derive(Args)]
pub struct ResolveArgs {
    /// Per-call override (JSON or YAML)
    #[arg(long = "override", value_name = "FILE")]
    pub override_file: Option<PathBuf>,
}

/// Print the effective policy for an override as JSON.
pub async fn run_resolve(service: &SandboxService, args: ResolveArgs) -> RunnerResult<()> {
    let layer = super::load_override(args.override_file.as_deref()).await?;
    let config = service.resolve(&layer).await?;
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| RunnerError::Internal(format!("serialize config: {e}")))?;
    println!("{json}");
    Ok(())
}
