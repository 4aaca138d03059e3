use std::process::ExitCode;

use sandbox::SandboxService;

use crate::error::RunnerResult;

/// Probe every configured provider. Fails if any is unavailable.
pub async fn run_health(service: &SandboxService) -> RunnerResult<ExitCode> {
    let report = service.health().await;
    let mut healthy = true;
    for entry in &report {
        match &entry.result {
            Ok(()) => println!("{}: ok", entry.kind),
            Err(e) => {
                healthy = false;
                println!("{}: unavailable ({e})", entry.kind);
            }
        }
    }
    Ok(if healthy && !report.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
