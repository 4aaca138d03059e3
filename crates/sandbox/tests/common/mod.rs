//! Fake runtime for provider tests.
//!
//! Runs commands through the host `sh` inside a scratch directory that stands
//! in for the sandbox root. Records the runtime arguments it would pass to a
//! real engine, and simulates `network.mode = none` by making `curl` and
//! `wget` fail as if no route existed.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sandbox::runtime::EXEC_MARKER_VAR;
use sandbox::{
    CreateSpec, ExecSpec, ManagedProvider, Materialized, NetworkMode, ProviderKind,
    ResourceUsage, Result, Runtime, SandboxConfig, SandboxError,
};
use tempfile::TempDir;
use tokio::process::Command;

const NO_NETWORK_PRELUDE: &str = r#"
curl() { echo "curl: (6) Could not resolve host: $*" >&2; return 6; }
wget() { echo "wget: unable to resolve host address" >&2; return 4; }
"#;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub agent_id: String,
    pub project_id: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

pub struct FakeHandle {
    dir: PathBuf,
    root: PathBuf,
    network: NetworkMode,
    env: BTreeMap<String, String>,
}

impl FakeHandle {
    fn host_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.root) {
            Ok(rel) => self.dir.join(rel),
            Err(_) => self.dir.join(path.to_string_lossy().trim_start_matches('/')),
        }
    }
}

pub struct FakeRuntime {
    scratch: TempDir,
    pub recorded: Mutex<Vec<Recorded>>,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_destroy: AtomicBool,
    pub fail_storage: AtomicBool,
    pub fail_pause: AtomicBool,
    pub fail_resume: AtomicBool,
    max_instances: Option<usize>,
    kind: ProviderKind,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            scratch: TempDir::new().unwrap(),
            recorded: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            fail_storage: AtomicBool::new(false),
            fail_pause: AtomicBool::new(false),
            fail_resume: AtomicBool::new(false),
            max_instances: None,
            kind: ProviderKind::ContainerEngine,
        }
    }

    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = Some(max);
        self
    }

    pub fn last_recorded(&self) -> Recorded {
        self.recorded.lock().unwrap().last().cloned().unwrap()
    }

    /// Runtime arguments a container engine would receive.
    pub fn runtime_args(config: &SandboxConfig) -> Vec<String> {
        let r = &config.resources;
        vec![
            format!("--memory={}m", r.memory_mb),
            format!("--cpus={}", r.cpus),
            format!("--pids-limit={}", r.pids_limit),
            format!("--storage-opt=size={}m", r.disk_mb),
            format!("--network={}", config.network.mode),
        ]
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    type Handle = FakeHandle;

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn max_instances(&self) -> Option<usize> {
        self.max_instances
    }

    async fn create(&self, spec: &CreateSpec<'_>) -> Result<Materialized<FakeHandle>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::CreationFailed("image pull failed".into()));
        }
        let dir = self.scratch.path().join(spec.id.short());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::CreationFailed(e.to_string()))?;

        self.recorded.lock().unwrap().push(Recorded {
            agent_id: spec.agent_id.to_string(),
            project_id: spec.project_id.to_string(),
            args: Self::runtime_args(spec.config),
            env: spec.env.clone(),
        });

        Ok(Materialized {
            label: format!("fake-{}", spec.id.short()),
            workspace_path: spec.config.allowed_root_directory.clone(),
            handle: FakeHandle {
                dir,
                root: spec.config.allowed_root_directory.clone(),
                network: spec.config.network.mode,
                env: spec.env.clone(),
            },
        })
    }

    async fn start(&self, _handle: &FakeHandle) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SandboxError::StartFailed("engine refused".into()));
        }
        Ok(())
    }

    async fn stop(&self, _handle: &FakeHandle) -> Result<()> {
        Ok(())
    }

    async fn pause(&self, _handle: &FakeHandle) -> Result<()> {
        if self.fail_pause.load(Ordering::SeqCst) {
            return Err(SandboxError::ExecFailed("engine refused pause".into()));
        }
        Ok(())
    }

    async fn resume(&self, _handle: &FakeHandle) -> Result<()> {
        if self.fail_resume.load(Ordering::SeqCst) {
            return Err(SandboxError::StartFailed("engine refused resume".into()));
        }
        Ok(())
    }

    async fn destroy(&self, _handle: &FakeHandle) -> Result<()> {
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(SandboxError::RemovalFailed("container still running".into()));
        }
        Ok(())
    }

    async fn release_storage(&self, handle: &FakeHandle) -> Result<()> {
        if self.fail_storage.load(Ordering::SeqCst) {
            return Err(SandboxError::RemovalFailed("volume busy".into()));
        }
        let _ = tokio::fs::remove_dir_all(&handle.dir).await;
        Ok(())
    }

    fn command(&self, handle: &FakeHandle, spec: &ExecSpec<'_>) -> Command {
        let script = match handle.network {
            NetworkMode::None => format!("{NO_NETWORK_PRELUDE}\n{}", spec.command),
            _ => spec.command.to_string(),
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .current_dir(handle.host_path(spec.cwd))
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .envs(&handle.env)
            .envs(spec.env)
            .env(EXEC_MARKER_VAR, spec.marker);
        cmd
    }

    async fn read_file(&self, handle: &FakeHandle, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(handle.host_path(path))
            .await
            .map_err(|e| SandboxError::FileNotFound(format!("{}: {e}", path.display())))
    }

    async fn write_file(&self, handle: &FakeHandle, path: &Path, content: &[u8]) -> Result<()> {
        let target = handle.host_path(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::WriteFailed(e.to_string()))?;
        }
        tokio::fs::write(target, content)
            .await
            .map_err(|e| SandboxError::WriteFailed(e.to_string()))
    }

    async fn copy_in(&self, handle: &FakeHandle, host_path: &Path, path: &Path) -> Result<()> {
        tokio::fs::copy(host_path, handle.host_path(path))
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::CopyFailed(e.to_string()))
    }

    async fn copy_out(&self, handle: &FakeHandle, path: &Path, host_path: &Path) -> Result<()> {
        tokio::fs::copy(handle.host_path(path), host_path)
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::CopyFailed(e.to_string()))
    }

    async fn resource_usage(&self, _handle: &FakeHandle) -> Result<ResourceUsage> {
        Ok(ResourceUsage {
            memory_mb: 12.5,
            cpu_percent: 0.5,
            pids: 1,
            disk_mb: 0.0,
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

pub fn host_env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn provider() -> ManagedProvider<FakeRuntime> {
    ManagedProvider::new(FakeRuntime::new()).with_host_env(host_env(&[("LANG", "C.UTF-8")]))
}

/// Create and start one sandbox with default policy.
pub async fn running(provider: &ManagedProvider<FakeRuntime>) -> sandbox::SandboxId {
    use sandbox::SandboxProvider;

    let instance = provider
        .create("agent-1", "project-1", SandboxConfig::default())
        .await
        .unwrap();
    provider.start(instance.id).await.unwrap();
    instance.id
}
