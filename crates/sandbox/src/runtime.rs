use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{ProviderKind, SandboxConfig};
use crate::error::Result;
use crate::types::{ResourceUsage, SandboxId};

/// Variable set on every command so a runtime can find the processes that
/// belong to one execution (e.g. inside a container, where the host cannot
/// signal them directly).
pub const EXEC_MARKER_VAR: &str = "SANDBOX_EXEC_ID";

/// Inputs for materializing one instance.
#[derive(Debug)]
pub struct CreateSpec<'a> {
    pub id: SandboxId,
    pub agent_id: &'a str,
    pub project_id: &'a str,
    pub config: &'a SandboxConfig,
    /// Sanitized environment; no blocked name is present.
    pub env: &'a BTreeMap<String, String>,
}

/// What a runtime hands back from `create`.
#[derive(Debug)]
pub struct Materialized<H> {
    pub handle: H,
    /// Opaque handle string shown to callers (container id, host directory).
    pub label: String,
    /// Root directory commands run in, inside the isolated environment.
    pub workspace_path: PathBuf,
}

/// One command to launch.
#[derive(Debug)]
pub struct ExecSpec<'a> {
    /// Unique per execution; exported as [`EXEC_MARKER_VAR`].
    pub marker: &'a str,
    pub command: &'a str,
    /// Already confined to the allowed root.
    pub cwd: &'a Path,
    /// Per-command variables, already filtered through the blocked list.
    pub env: &'a BTreeMap<String, String>,
    pub user: Option<&'a str>,
}

/// Backend primitives driven by [`ManagedProvider`](crate::ManagedProvider).
///
/// A runtime knows how to talk to one kind of backend and nothing about
/// lifecycle state, queueing or timeouts: the managed provider validates
/// every transition before calling in. Errors must already be mapped to the
/// taxonomy kind of the operation (`CreationFailed` from `create`, ...).
#[async_trait]
pub trait Runtime: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    fn kind(&self) -> ProviderKind;

    /// Instance ceiling for this runtime, if any.
    fn max_instances(&self) -> Option<usize> {
        None
    }

    // -- lifecycle --

    async fn create(&self, spec: &CreateSpec<'_>) -> Result<Materialized<Self::Handle>>;
    async fn start(&self, handle: &Self::Handle) -> Result<()>;
    /// Graceful stop bounded by the runtime's grace period, then force.
    async fn stop(&self, handle: &Self::Handle) -> Result<()>;
    async fn pause(&self, handle: &Self::Handle) -> Result<()>;
    async fn resume(&self, handle: &Self::Handle) -> Result<()>;
    /// Delete the backend object. Failures propagate as `RemovalFailed`.
    async fn destroy(&self, handle: &Self::Handle) -> Result<()>;
    /// Release backing storage. Failures are logged by the caller, not propagated.
    async fn release_storage(&self, handle: &Self::Handle) -> Result<()>;

    // -- execution --

    /// Build the host-side command. The execution engine owns stdio,
    /// process group and timeout.
    fn command(&self, handle: &Self::Handle, spec: &ExecSpec<'_>) -> Command;

    /// Called with the host pid of every spawned command.
    fn track(&self, _handle: &Self::Handle, _pid: u32) {}

    /// Called once the command has been reaped.
    fn untrack(&self, _handle: &Self::Handle, _pid: u32) {}

    /// Kill whatever is left of an execution that the host-side kill did not reach.
    /// `user` is the identity the command was started as.
    async fn abort(&self, _handle: &Self::Handle, _marker: &str, _user: Option<&str>) {}

    // -- files --

    async fn read_file(&self, handle: &Self::Handle, path: &Path) -> Result<Vec<u8>>;
    async fn write_file(&self, handle: &Self::Handle, path: &Path, content: &[u8]) -> Result<()>;
    async fn copy_in(&self, handle: &Self::Handle, host_path: &Path, path: &Path) -> Result<()>;
    async fn copy_out(&self, handle: &Self::Handle, path: &Path, host_path: &Path) -> Result<()>;

    // -- observation --

    async fn resource_usage(&self, handle: &Self::Handle) -> Result<ResourceUsage>;
    async fn health_check(&self) -> Result<()>;
}
