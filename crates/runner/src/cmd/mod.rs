mod health;
mod resolve;
mod run;

use std::path::Path;

use sandbox::SandboxConfigOverride;

use crate::error::{RunnerError, RunnerResult};

pub use health::run_health;
pub use resolve::{ResolveArgs, run_resolve};
pub use run::{RunArgs, run_run};

/// Read a per-call override from a JSON or YAML file.
async fn load_override(path: Option<&Path>) -> RunnerResult<SandboxConfigOverride> {
    let Some(path) = path else {
        return Ok(SandboxConfigOverride::default());
    };
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))
}
