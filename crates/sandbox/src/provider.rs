use std::path::Path;

use async_trait::async_trait;

use crate::config::{ProviderKind, SandboxConfig};
use crate::error::Result;
use crate::stream::ExecStream;
use crate::types::{
    ExecOptions, ExecResult, ResourceUsage, SandboxId, SandboxInstance, SandboxStatus,
};

/// Capability set every sandbox backend exposes.
///
/// Each provider owns a private registry of the instances it created; ids
/// from another provider are unknown to it (`NotFound`).
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    // -- lifecycle --

    /// Materialize an instance from a resolved config. The instance is
    /// registered as `creating` only when materialization succeeds.
    async fn create(
        &self,
        agent_id: &str,
        project_id: &str,
        config: SandboxConfig,
    ) -> Result<SandboxInstance>;
    async fn start(&self, id: SandboxId) -> Result<()>;
    /// Idempotent: stopping a stopped instance succeeds.
    async fn stop(&self, id: SandboxId) -> Result<()>;
    async fn pause(&self, id: SandboxId) -> Result<()>;
    async fn resume(&self, id: SandboxId) -> Result<()>;
    /// A second call for the same id returns `NotFound`.
    async fn remove(&self, id: SandboxId) -> Result<()>;

    // -- execution --

    async fn exec(&self, id: SandboxId, command: &str, options: &ExecOptions) -> Result<ExecResult>;
    async fn exec_stream(
        &self,
        id: SandboxId,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecStream>;

    // -- files --

    async fn read_file(&self, id: SandboxId, path: &str) -> Result<Vec<u8>>;
    async fn write_file(&self, id: SandboxId, path: &str, content: &[u8]) -> Result<()>;
    /// Copy a host file or directory into the sandbox.
    async fn copy_in(&self, id: SandboxId, host_path: &Path, path: &str) -> Result<()>;
    /// Copy a sandbox file or directory out to the host.
    async fn copy_out(&self, id: SandboxId, path: &str, host_path: &Path) -> Result<()>;

    // -- observation --

    async fn get_status(&self, id: SandboxId) -> Result<SandboxStatus>;
    async fn instance(&self, id: SandboxId) -> Result<SandboxInstance>;
    async fn get_resource_usage(&self, id: SandboxId) -> Result<ResourceUsage>;
    async fn list(&self, project_id: Option<&str>) -> Result<Vec<SandboxInstance>>;
    async fn health_check(&self) -> Result<()>;

    /// Remove every instance this provider still owns.
    async fn shutdown(&self);
}
