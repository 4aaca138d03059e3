use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sandbox::runtime::EXEC_MARKER_VAR;
use sandbox::{
    CreateSpec, ExecSpec, Materialized, ProviderKind, ResourceUsage, Runtime, SandboxError,
};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::args;
use crate::cli::{CommandError, DockerCli};
use crate::config::DockerConfig;
use crate::enforce::{runtime_args, vet_runtime_args};
use crate::prerequisites::check_prerequisites;
use crate::stats::{parse_du_mb, parse_stats};

/// Keeps the container alive between commands and exits cleanly on stop.
const KEEPALIVE: &str = "trap 'exit 0' TERM INT; while :; do sleep 3600 & wait $!; done";

/// Kill every process whose environment carries the execution marker `$1`.
const ABORT_SCRIPT: &str = r#"for p in /proc/[0-9]*; do
  if tr '\0' '\n' < "$p/environ" 2>/dev/null | grep -qx "$0=$1"; then
    kill -9 "${p#/proc/}" 2>/dev/null
  fi
done; exit 0"#;

const WRITE_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;

/// One materialized container and its workspace volume.
#[derive(Debug)]
pub struct ContainerHandle {
    name: String,
    volume: String,
    root: PathBuf,
    post_create: Option<String>,
    post_create_done: AtomicBool,
}

impl ContainerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }
}

/// Container-engine backend. Serves both the plain `container-engine`
/// provider and the `dev-container` provider, which differ only in where
/// their configuration came from and in running `postCreateCommand`.
pub struct DockerRuntime {
    cli: DockerCli,
    config: DockerConfig,
    kind: ProviderKind,
}

impl DockerRuntime {
    pub fn new(config: DockerConfig) -> Self {
        Self::with_kind(config, ProviderKind::ContainerEngine)
    }

    pub fn dev_container(config: DockerConfig) -> Self {
        Self::with_kind(config, ProviderKind::DevContainer)
    }

    fn with_kind(config: DockerConfig, kind: ProviderKind) -> Self {
        Self {
            cli: DockerCli::new(&config.binary),
            config,
            kind,
        }
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    fn names(&self, spec: &CreateSpec<'_>) -> (String, String) {
        let name = format!("{}-{}", self.config.name_prefix, spec.id.short());
        let volume = format!("{name}-data");
        (name, volume)
    }

    /// Arguments for `docker create`. Environment values are not on the
    /// command line: `-e NAME` makes the engine read them from the CLI's env.
    fn create_args(&self, spec: &CreateSpec<'_>, name: &str, volume: &str) -> Vec<String> {
        let config = spec.config;
        let root = config.allowed_root_directory.display().to_string();
        let mut args = Vec::from(args![
            "create",
            "--name",
            name,
            "--label",
            format!("sandbox.id={}", spec.id),
            "--label",
            format!("sandbox.agent={}", spec.agent_id),
            "--label",
            format!("sandbox.project={}", spec.project_id),
            "--label",
            format!("sandbox.provider={}", self.kind),
            "--init",
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
        ]);
        args.extend(runtime_args(config, &self.config));
        args.extend(args![
            "--mount",
            format!("type=volume,source={volume},target={root}"),
            "-w",
            root,
        ]);
        for name in spec.env.keys() {
            args.push("-e".to_string());
            args.push(name.clone());
        }
        args.extend(config.container.runtime_args.iter().cloned());
        args.extend(args![
            "--entrypoint",
            "/bin/sh",
            config.container.image,
            "-c",
            KEEPALIVE,
        ]);
        args
    }

    fn exec_args(handle: &ContainerHandle, spec: &ExecSpec<'_>) -> Vec<String> {
        let mut args = Vec::from(args!["exec", "-w", spec.cwd.display()]);
        if let Some(user) = spec.user {
            args.extend(args!["-u", user]);
        }
        args.extend(args!["-e", EXEC_MARKER_VAR]);
        for name in spec.env.keys() {
            args.push("-e".to_string());
            args.push(name.clone());
        }
        args.extend(args![handle.name, "/bin/sh", "-c", spec.command]);
        args
    }

    async fn run_post_create(&self, handle: &ContainerHandle) -> sandbox::Result<()> {
        let Some(command) = &handle.post_create else {
            return Ok(());
        };
        if handle.post_create_done.load(Ordering::Acquire) {
            return Ok(());
        }
        info!(container = %handle.name, "running postCreateCommand");
        let args = args!["exec", "-w", handle.root.display(), handle.name, "/bin/sh", "-c", command];
        match tokio::time::timeout(self.config.post_create_timeout, self.cli.run(&args)).await {
            Ok(Ok(_)) => {
                handle.post_create_done.store(true, Ordering::Release);
                Ok(())
            }
            Ok(Err(e)) => Err(SandboxError::StartFailed(format!(
                "postCreateCommand failed: {}",
                e.detail
            ))),
            Err(_) => Err(SandboxError::StartFailed(format!(
                "postCreateCommand did not finish within {:?}",
                self.config.post_create_timeout
            ))),
        }
    }

    async fn remove_volume(&self, volume: &str) -> Result<(), CommandError> {
        match self.cli.run(&args!["volume", "rm", "-f", volume]).await {
            Err(e) if !e.is_missing() => Err(e),
            _ => Ok(()),
        }
    }

    async fn disk_usage_mb(&self, handle: &ContainerHandle) -> f64 {
        let args = args!["exec", handle.name, "du", "-sm", handle.root.display()];
        match tokio::time::timeout(self.config.query_timeout, self.cli.run(&args)).await {
            Ok(Ok(output)) => parse_du_mb(&output).unwrap_or(0.0),
            Ok(Err(e)) => {
                debug!(container = %handle.name, error = %e, "du failed");
                0.0
            }
            Err(_) => 0.0,
        }
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    type Handle = ContainerHandle;

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn max_instances(&self) -> Option<usize> {
        self.config.max_instances
    }

    async fn create(&self, spec: &CreateSpec<'_>) -> sandbox::Result<Materialized<ContainerHandle>> {
        vet_runtime_args(&spec.config.container.runtime_args)?;
        let (name, volume) = self.names(spec);

        self.cli
            .run(&args![
                "volume",
                "create",
                "--label",
                format!("sandbox.id={}", spec.id),
                volume
            ])
            .await
            .map_err(|e| SandboxError::CreationFailed(e.to_string()))?;

        let args = self.create_args(spec, &name, &volume);
        let container_id = match self.cli.run_with_env(&args, spec.env).await {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = self.remove_volume(&volume).await {
                    warn!(volume = %volume, error = %cleanup, "failed to roll back volume");
                }
                return Err(SandboxError::CreationFailed(e.to_string()));
            }
        };

        info!(container = %name, image = %spec.config.container.image, "container created");
        Ok(Materialized {
            label: container_id,
            workspace_path: spec.config.allowed_root_directory.clone(),
            handle: ContainerHandle {
                name,
                volume,
                root: spec.config.allowed_root_directory.clone(),
                post_create: spec.config.dev_container.post_create_command.clone(),
                post_create_done: AtomicBool::new(false),
            },
        })
    }

    async fn start(&self, handle: &ContainerHandle) -> sandbox::Result<()> {
        self.cli
            .run(&args!["start", handle.name])
            .await
            .map_err(|e| SandboxError::StartFailed(e.to_string()))?;
        self.run_post_create(handle).await
    }

    async fn stop(&self, handle: &ContainerHandle) -> sandbox::Result<()> {
        let grace = self.config.stop_grace.as_secs().max(1);
        self.cli
            .run(&args!["stop", "-t", grace, handle.name])
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::StopFailed(e.to_string()))
    }

    async fn pause(&self, handle: &ContainerHandle) -> sandbox::Result<()> {
        self.cli
            .run(&args!["pause", handle.name])
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::StopFailed(e.to_string()))
    }

    async fn resume(&self, handle: &ContainerHandle) -> sandbox::Result<()> {
        self.cli
            .run(&args!["unpause", handle.name])
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::StartFailed(e.to_string()))
    }

    async fn destroy(&self, handle: &ContainerHandle) -> sandbox::Result<()> {
        match self.cli.run(&args!["rm", "-f", handle.name]).await {
            Err(e) if !e.is_missing() => Err(SandboxError::RemovalFailed(e.to_string())),
            _ => Ok(()),
        }
    }

    async fn release_storage(&self, handle: &ContainerHandle) -> sandbox::Result<()> {
        self.remove_volume(&handle.volume)
            .await
            .map_err(|e| SandboxError::RemovalFailed(e.to_string()))
    }

    fn command(&self, handle: &ContainerHandle, spec: &ExecSpec<'_>) -> Command {
        let mut cmd = self.cli.command(Self::exec_args(handle, spec));
        cmd.env(EXEC_MARKER_VAR, spec.marker).envs(spec.env);
        cmd
    }

    async fn abort(&self, handle: &ContainerHandle, marker: &str, user: Option<&str>) {
        // All capabilities are dropped, so only the command's own user can
        // read its environ and signal it.
        let args = args![
            "exec",
            "-u",
            user.unwrap_or("0"),
            handle.name,
            "/bin/sh",
            "-c",
            ABORT_SCRIPT,
            EXEC_MARKER_VAR,
            marker
        ];
        match tokio::time::timeout(self.config.query_timeout, self.cli.run(&args)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(container = %handle.name, marker, error = %e, "abort failed"),
            Err(_) => warn!(container = %handle.name, marker, "abort timed out"),
        }
    }

    async fn read_file(&self, handle: &ContainerHandle, path: &Path) -> sandbox::Result<Vec<u8>> {
        self.cli
            .run_raw(&args!["exec", handle.name, "cat", "--", path.display()])
            .await
            .map_err(|e| SandboxError::FileNotFound(format!("{}: {}", path.display(), e.detail)))
    }

    async fn write_file(
        &self,
        handle: &ContainerHandle,
        path: &Path,
        content: &[u8],
    ) -> sandbox::Result<()> {
        let args = args![
            "exec",
            "-i",
            handle.name,
            "/bin/sh",
            "-c",
            WRITE_SCRIPT,
            "sh",
            path.display()
        ];
        self.cli
            .run_with_stdin(&args, content)
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::WriteFailed(format!("{}: {}", path.display(), e.detail)))
    }

    async fn copy_in(
        &self,
        handle: &ContainerHandle,
        host_path: &Path,
        path: &Path,
    ) -> sandbox::Result<()> {
        let target = format!("{}:{}", handle.name, path.display());
        self.cli
            .run(&args!["cp", host_path.display(), target])
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::CopyFailed(e.to_string()))
    }

    async fn copy_out(
        &self,
        handle: &ContainerHandle,
        path: &Path,
        host_path: &Path,
    ) -> sandbox::Result<()> {
        let source = format!("{}:{}", handle.name, path.display());
        self.cli
            .run(&args!["cp", source, host_path.display()])
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::CopyFailed(e.to_string()))
    }

    async fn resource_usage(&self, handle: &ContainerHandle) -> sandbox::Result<ResourceUsage> {
        let args = args!["stats", "--no-stream", "--format", "{{json .}}", handle.name];
        let output = tokio::time::timeout(self.config.query_timeout, self.cli.run(&args))
            .await
            .map_err(|_| SandboxError::StatsFailed("stats query timed out".to_string()))?
            .map_err(|e| SandboxError::StatsFailed(e.to_string()))?;
        let stats = parse_stats(&output).ok_or_else(|| {
            SandboxError::StatsFailed(format!("unrecognized stats output: {output}"))
        })?;
        Ok(ResourceUsage {
            memory_mb: stats.memory_mb,
            cpu_percent: stats.cpu_percent,
            pids: stats.pids,
            disk_mb: self.disk_usage_mb(handle).await,
        })
    }

    async fn health_check(&self) -> sandbox::Result<()> {
        check_prerequisites(&self.config).await
    }
}
