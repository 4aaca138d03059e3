use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::trace;

/// Error from a failed engine command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

impl CommandError {
    /// The engine reported that the object does not exist.
    pub fn is_missing(&self) -> bool {
        let detail = self.detail.to_ascii_lowercase();
        detail.contains("no such container")
            || detail.contains("no such volume")
            || detail.contains("no such object")
    }
}

/// Format a human-readable display string for a command invocation.
fn format_command_display(program: &Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.display().to_string());
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

/// Thin async wrapper around the engine CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Unspawned command for `args`, for callers that manage stdio themselves.
    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd
    }

    /// Run and return trimmed stdout.
    pub async fn run(&self, args: &[String]) -> Result<String, CommandError> {
        self.run_with_env(args, &BTreeMap::new()).await
    }

    /// Run with extra variables in the CLI's own environment. Used to hand
    /// `-e NAME` values to the engine without putting them on the command line.
    pub async fn run_with_env(
        &self,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<String, CommandError> {
        let stdout = self.output(args, env, None).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    /// Run with `input` on stdin and return raw stdout.
    pub async fn run_with_stdin(&self, args: &[String], input: &[u8]) -> Result<Vec<u8>, CommandError> {
        self.output(args, &BTreeMap::new(), Some(input)).await
    }

    /// Run and return raw stdout.
    pub async fn run_raw(&self, args: &[String]) -> Result<Vec<u8>, CommandError> {
        self.output(args, &BTreeMap::new(), None).await
    }

    async fn output(
        &self,
        args: &[String],
        env: &BTreeMap<String, String>,
        input: Option<&[u8]>,
    ) -> Result<Vec<u8>, CommandError> {
        let cmd_display = format_command_display(&self.binary, args);
        trace!(command = %cmd_display, "exec");

        let failed = |detail: String| CommandError {
            command: cmd_display.clone(),
            detail,
        };

        let mut cmd = self.command(args);
        cmd.envs(env)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| failed(e.to_string()))?;
        if let Some(input) = input
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin
                .write_all(input)
                .await
                .map_err(|e| failed(format!("writing stdin: {e}")))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = match output.status.code() {
                Some(code) if stderr.is_empty() => format!("exit code {code}"),
                _ => stderr,
            };
            Err(failed(detail))
        }
    }
}

/// `[String; N]` from string literals and owned values.
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        [$(::std::string::ToString::to_string(&$arg)),*]
    };
}
