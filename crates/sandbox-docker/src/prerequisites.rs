use sandbox::SandboxError;

use crate::args;
use crate::cli::DockerCli;
use crate::config::DockerConfig;

/// Verify that the engine CLI is installed and its daemon answers.
///
/// Collects all failures and returns them in a single `BackendNotAvailable` error.
pub async fn check_prerequisites(config: &DockerConfig) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    check_binary(config, &mut errors);
    if errors.is_empty() {
        check_daemon(config, &mut errors).await;
    }
    if errors.is_empty() {
        check_required_commands(&mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(errors.join("; ")))
    }
}

fn check_binary(config: &DockerConfig, errors: &mut Vec<String>) {
    if which::which(&config.binary).is_err() {
        errors.push(format!(
            "container engine CLI not found: {}",
            config.binary.display()
        ));
    }
}

async fn check_daemon(config: &DockerConfig, errors: &mut Vec<String>) {
    let cli = DockerCli::new(&config.binary);
    let version_args = args!["version", "--format", "{{.Server.Version}}"];
    let query = cli.run(&version_args);
    match tokio::time::timeout(config.query_timeout, query).await {
        Ok(Ok(version)) if !version.is_empty() => {}
        Ok(Ok(_)) => errors.push("container engine daemon reported no server version".to_string()),
        Ok(Err(e)) => errors.push(format!("container engine daemon unreachable: {}", e.detail)),
        Err(_) => errors.push(format!(
            "container engine daemon did not answer within {:?}",
            config.query_timeout
        )),
    }
}

/// Host tools the provider shells out to besides the engine itself.
fn check_required_commands(errors: &mut Vec<String>) {
    for cmd in ["sh"] {
        if which::which(cmd).is_err() {
            errors.push(format!("required command not found: {cmd}"));
        }
    }
}
