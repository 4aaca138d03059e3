use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use sandbox::process::signal_process_group;
use sandbox::runtime::EXEC_MARKER_VAR;
use sandbox::{
    CreateSpec, ExecSpec, Materialized, ProviderKind, ResourceUsage, Runtime, SandboxError,
};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::LocalConfig;
use crate::files::{copy_recursive, tree_size};

const STOP_POLL: Duration = Duration::from_millis(50);

/// Workspace directory plus the process groups currently running in it.
#[derive(Debug)]
pub struct LocalHandle {
    dir: PathBuf,
    /// Logical root callers address; maps onto `dir`.
    root: PathBuf,
    env: BTreeMap<String, String>,
    groups: Mutex<HashSet<u32>>,
}

impl LocalHandle {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Host path for a path already confined to the logical root.
    fn host_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.root) {
            Ok(rel) => self.dir.join(rel),
            Err(_) => self.dir.join(path.to_string_lossy().trim_start_matches('/')),
        }
    }

    fn groups(&self) -> Vec<u32> {
        self.groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    fn signal_all(&self, signal: Signal) {
        for pgid in self.groups() {
            if !signal_process_group(pgid, signal) {
                debug!(pgid, ?signal, "process group already gone");
            }
        }
    }

    fn any_alive(&self) -> bool {
        self.groups().into_iter().any(|pgid| {
            i32::try_from(pgid)
                .map(|raw| killpg(Pid::from_raw(raw), None).is_ok())
                .unwrap_or(false)
        })
    }
}

/// Runs commands as plain host processes in a per-sandbox directory.
///
/// There is no isolation: resource limits and network policy are not
/// enforced, and a command can read anything the host user can. Meant for
/// development on machines without a container engine.
pub struct LocalRuntime {
    config: LocalConfig,
}

impl LocalRuntime {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    type Handle = LocalHandle;

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn max_instances(&self) -> Option<usize> {
        self.config.max_instances
    }

    async fn create(&self, spec: &CreateSpec<'_>) -> sandbox::Result<Materialized<LocalHandle>> {
        let dir = self.config.base_dir.join(spec.id.short());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::CreationFailed(format!("{}: {e}", dir.display())))?;

        warn!(
            id = %spec.id,
            dir = %dir.display(),
            "local sandbox runs on the host without isolation; limits and network policy are not enforced"
        );
        Ok(Materialized {
            label: dir.display().to_string(),
            workspace_path: spec.config.allowed_root_directory.clone(),
            handle: LocalHandle {
                dir,
                root: spec.config.allowed_root_directory.clone(),
                env: spec.env.clone(),
                groups: Mutex::new(HashSet::new()),
            },
        })
    }

    async fn start(&self, handle: &LocalHandle) -> sandbox::Result<()> {
        match tokio::fs::metadata(&handle.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(SandboxError::StartFailed(format!(
                "{} is not a directory",
                handle.dir.display()
            ))),
            Err(e) => Err(SandboxError::StartFailed(format!(
                "{}: {e}",
                handle.dir.display()
            ))),
        }
    }

    async fn stop(&self, handle: &LocalHandle) -> sandbox::Result<()> {
        handle.signal_all(Signal::SIGCONT);
        handle.signal_all(Signal::SIGTERM);
        let deadline = tokio::time::Instant::now() + self.config.stop_grace;
        while handle.any_alive() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL).await;
        }
        if handle.any_alive() {
            warn!(dir = %handle.dir.display(), "graceful stop timed out, killing");
            handle.signal_all(Signal::SIGKILL);
        }
        Ok(())
    }

    async fn pause(&self, handle: &LocalHandle) -> sandbox::Result<()> {
        handle.signal_all(Signal::SIGSTOP);
        Ok(())
    }

    async fn resume(&self, handle: &LocalHandle) -> sandbox::Result<()> {
        handle.signal_all(Signal::SIGCONT);
        Ok(())
    }

    async fn destroy(&self, handle: &LocalHandle) -> sandbox::Result<()> {
        handle.signal_all(Signal::SIGKILL);
        Ok(())
    }

    async fn release_storage(&self, handle: &LocalHandle) -> sandbox::Result<()> {
        match tokio::fs::remove_dir_all(&handle.dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(
                SandboxError::RemovalFailed(format!("{}: {e}", handle.dir.display())),
            ),
            _ => Ok(()),
        }
    }

    fn command(&self, handle: &LocalHandle, spec: &ExecSpec<'_>) -> Command {
        if let Some(user) = spec.user {
            debug!(user, "local sandbox ignores the user option");
        }
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(spec.command)
            .current_dir(handle.host_path(spec.cwd))
            .env_clear()
            .env("PATH", &self.config.default_path)
            .env("HOME", &handle.dir)
            .envs(&handle.env)
            .envs(spec.env)
            .env(EXEC_MARKER_VAR, spec.marker);
        cmd
    }

    fn track(&self, handle: &LocalHandle, pid: u32) {
        handle
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid);
    }

    fn untrack(&self, handle: &LocalHandle, pid: u32) {
        handle
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);
    }

    async fn read_file(&self, handle: &LocalHandle, path: &Path) -> sandbox::Result<Vec<u8>> {
        tokio::fs::read(handle.host_path(path))
            .await
            .map_err(|e| SandboxError::FileNotFound(format!("{}: {e}", path.display())))
    }

    async fn write_file(
        &self,
        handle: &LocalHandle,
        path: &Path,
        content: &[u8],
    ) -> sandbox::Result<()> {
        let target = handle.host_path(path);
        let failed = |e: std::io::Error| SandboxError::WriteFailed(format!("{}: {e}", path.display()));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(failed)?;
        }
        tokio::fs::write(&target, content).await.map_err(failed)
    }

    async fn copy_in(
        &self,
        handle: &LocalHandle,
        host_path: &Path,
        path: &Path,
    ) -> sandbox::Result<()> {
        copy_recursive(host_path, &handle.host_path(path))
            .await
            .map_err(|e| SandboxError::CopyFailed(format!("{}: {e}", host_path.display())))
    }

    async fn copy_out(
        &self,
        handle: &LocalHandle,
        path: &Path,
        host_path: &Path,
    ) -> sandbox::Result<()> {
        copy_recursive(&handle.host_path(path), host_path)
            .await
            .map_err(|e| SandboxError::CopyFailed(format!("{}: {e}", path.display())))
    }

    async fn resource_usage(&self, handle: &LocalHandle) -> sandbox::Result<ResourceUsage> {
        let groups: HashSet<u32> = handle.groups().into_iter().collect();
        let mut usage = ResourceUsage {
            memory_mb: 0.0,
            cpu_percent: 0.0,
            pids: 0,
            disk_mb: tree_size(&handle.dir).await as f64 / (1024.0 * 1024.0),
        };
        if groups.is_empty() {
            return Ok(usage);
        }

        let output = Command::new("ps")
            .args(["-eo", "pgid=,rss=,pcpu="])
            .output()
            .await
            .map_err(|e| SandboxError::StatsFailed(format!("ps: {e}")))?;
        if !output.status.success() {
            return Err(SandboxError::StatsFailed(format!(
                "ps exited with {}",
                output.status
            )));
        }
        for sample in parse_ps(&String::from_utf8_lossy(&output.stdout)) {
            if groups.contains(&sample.pgid) {
                usage.pids += 1;
                usage.memory_mb += sample.rss_kb as f64 / 1024.0;
                usage.cpu_percent += sample.cpu_percent;
            }
        }
        Ok(usage)
    }

    async fn health_check(&self) -> sandbox::Result<()> {
        tokio::fs::create_dir_all(&self.config.base_dir)
            .await
            .map_err(|e| {
                SandboxError::BackendNotAvailable(format!(
                    "{}: {e}",
                    self.config.base_dir.display()
                ))
            })?;
        let status = Command::new("sh")
            .args(["-c", "true"])
            .status()
            .await
            .map_err(|e| SandboxError::BackendNotAvailable(format!("sh: {e}")))?;
        if !status.success() {
            return Err(SandboxError::BackendNotAvailable(format!(
                "sh exited with {status}"
            )));
        }
        info!(base_dir = %self.config.base_dir.display(), "local provider healthy");
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
struct PsSample {
    pgid: u32,
    rss_kb: u64,
    cpu_percent: f64,
}

fn parse_ps(output: &str) -> Vec<PsSample> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(PsSample {
                pgid: fields.next()?.parse().ok()?,
                rss_kb: fields.next()?.parse().ok()?,
                cpu_percent: fields.next()?.parse().ok()?,
            })
        })
        .collect()
}
