use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ProviderKind;

/// Exit code reported for a command killed by its timeout (POSIX `timeout(1)`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported for a command killed because its sandbox was stopped.
pub const KILLED_EXIT_CODE: i32 = 137;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identifier of one sandbox instance. Generated per `create()` call and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(Uuid);

impl SandboxId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First 12 hex characters, used in backend object names.
    pub fn short(&self) -> String {
        self.0.simple().to_string().chars().take(12).collect()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for SandboxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a sandbox instance.
///
/// ```text
/// creating ──▶ running ⇄ paused
///                 │        │
///                 ▼        ▼
///   error ───▶ stopped ──▶ removed
/// ```
///
/// `error` is reachable from any state on an unrecoverable backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Creating,
    Running,
    Paused,
    Stopped,
    Error,
    Removed,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One isolated execution context, as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInstance {
    pub id: SandboxId,
    pub agent_id: String,
    pub project_id: String,
    pub status: SandboxStatus,
    pub provider: ProviderKind,
    /// Opaque backend handle (container id, host directory, ...).
    pub handle: String,
    /// Root directory commands run in, inside the isolated environment.
    pub workspace_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Per-command options for `exec` / `exec_stream`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecOptions {
    /// Working directory. Relative paths resolve against the allowed root.
    pub cwd: Option<String>,
    /// Extra variables for this command only. Blocked names are dropped.
    pub env: BTreeMap<String, String>,
    /// Overrides `resources.timeout_ms` of the sandbox.
    pub timeout_ms: Option<u64>,
    pub user: Option<String>,
    /// Caps the buffered stdout and stderr of `exec` (not `exec_stream`).
    pub max_output_bytes: Option<usize>,
}

impl ExecOptions {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }
}

/// Outcome of a command run to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// `true` when the command was killed by its timeout; `exit_code` is then 124.
    pub timed_out: bool,
    /// `true` when stdout or stderr was cut at `max_output_bytes`.
    #[serde(default)]
    pub truncated: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Output channel of a running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

/// One event of a streamed command.
///
/// A stream yields any number of chunk events followed by exactly one `Exit`.
/// Chunks of one channel arrive in the order the process wrote them. Chunks
/// of different channels are ordered only by arrival: output written to
/// stdout and stderr at nearly the same moment may appear in either order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStreamEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit {
        exit_code: i32,
        duration_ms: u64,
        timed_out: bool,
    },
}

impl ExecStreamEvent {
    pub fn chunk(channel: OutputChannel, data: Bytes) -> Self {
        match channel {
            OutputChannel::Stdout => Self::Stdout(data),
            OutputChannel::Stderr => Self::Stderr(data),
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit { .. })
    }
}

/// Point-in-time resource snapshot, queried on demand and never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub pids: u32,
    pub disk_mb: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        let a = SandboxId::generate();
        let b = SandboxId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn id_round_trips_through_display() {
        let id = SandboxId::generate();
        let parsed: SandboxId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn short_id_is_twelve_hex_chars() {
        let short = SandboxId::generate().short();
        assert_eq!(short.len(), 12);
        assert!(short.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&SandboxStatus::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
    }

    #[test]
    fn exec_options_deserialize_camel_case() {
        let options: ExecOptions =
            serde_json::from_str(r#"{"timeoutMs": 2000, "cwd": "src", "env": {"A": "1"}}"#)
                .unwrap();
        assert_eq!(options.timeout_ms, Some(2000));
        assert_eq!(options.cwd.as_deref(), Some("src"));
        assert_eq!(options.env.get("A").map(String::as_str), Some("1"));
        assert!(options.user.is_none());
    }

    #[test]
    fn timed_out_result_is_not_success() {
        let result = ExecResult {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 2000,
            timed_out: true,
            truncated: false,
        };
        assert!(!result.success());
    }
}
