//! Instance lifecycle manager.
//!
//! [`ManagedProvider`] turns a [`Runtime`] into a full [`SandboxProvider`]:
//! it owns the instance registry, validates every state transition, resolves
//! paths against the allowed root and queues executions per instance.
//!
//! # Synchronization
//!
//! The registry is a sharded map from id to an `Arc<Slot>`. A registry
//! reference is never held across an await: callers clone the slot out and
//! release the shard. Each slot carries two locks:
//!
//! - `state`: lifecycle record, held for the whole of a transition so that
//!   transitions on one instance are serialized.
//! - `exec_queue`: fair mutex held from spawn to exit of a command, so that
//!   commands on one instance run one at a time in arrival order.
//!
//! Nothing is shared between slots; operations on different instances never
//! contend beyond the registry shard lookup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ProviderKind, SandboxConfig};
use crate::env::{self, SanitizedEnv};
use crate::error::{Result, SandboxError};
use crate::exec::{self, Launch};
use crate::paths::confine;
use crate::policy;
use crate::provider::SandboxProvider;
use crate::runtime::{CreateSpec, ExecSpec, Runtime};
use crate::stream::ExecStream;
use crate::types::{
    ExecOptions, ExecResult, ResourceUsage, SandboxId, SandboxInstance, SandboxStatus,
};

struct Record {
    instance: SandboxInstance,
    /// Replaced on every start; cancelled on stop.
    cancel: CancellationToken,
}

struct Slot<H> {
    state: Mutex<Record>,
    handle: Arc<H>,
    config: Arc<SandboxConfig>,
    exec_queue: Arc<Mutex<()>>,
}

/// Generic provider over a backend [`Runtime`].
pub struct ManagedProvider<R: Runtime> {
    runtime: Arc<R>,
    registry: DashMap<SandboxId, Arc<Slot<R::Handle>>>,
    /// Registered plus in-flight creations, checked against `max_instances`.
    reserved: AtomicUsize,
    exec_seq: AtomicU64,
    host_env: Option<BTreeMap<String, String>>,
}

impl<R: Runtime> ManagedProvider<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime: Arc::new(runtime),
            registry: DashMap::new(),
            reserved: AtomicUsize::new(0),
            exec_seq: AtomicU64::new(0),
            host_env: None,
        }
    }

    /// Use a fixed host environment instead of the process environment.
    pub fn with_host_env(mut self, host_env: BTreeMap<String, String>) -> Self {
        self.host_env = Some(host_env);
        self
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    fn slot(&self, id: SandboxId) -> Result<Arc<Slot<R::Handle>>> {
        self.registry
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SandboxError::NotFound(id))
    }

    fn reserve(&self) -> Result<()> {
        let Some(max) = self.runtime.max_instances() else {
            self.reserved.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        };
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|n| {
                SandboxError::ResourceLimitExceeded(format!(
                    "{} provider is at its limit of {max} instances ({n} in use)",
                    self.runtime.kind()
                ))
            })
    }

    fn release(&self) {
        let _ = self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn sanitize(&self, config: &SandboxConfig) -> SanitizedEnv {
        match &self.host_env {
            Some(host) => env::sanitize(&config.environment, host),
            None => env::sanitize(&config.environment, &env::host_env()),
        }
    }

    async fn create_registered(
        &self,
        agent_id: &str,
        project_id: &str,
        config: SandboxConfig,
    ) -> Result<SandboxInstance> {
        if config.provider != self.runtime.kind() {
            return Err(SandboxError::InvalidConfig(format!(
                "config selects the {} provider, this is {}",
                config.provider,
                self.runtime.kind()
            )));
        }
        policy::validate(&config)?;

        let id = SandboxId::generate();
        let env = self.sanitize(&config);
        if !env.skipped.is_empty() {
            info!(id = %id, skipped = ?env.skipped, "blocked variables excluded from sandbox environment");
        }

        let spec = CreateSpec {
            id,
            agent_id,
            project_id,
            config: &config,
            env: &env.vars,
        };
        let materialized = self.runtime.create(&spec).await.map_err(|e| match e {
            SandboxError::InvalidConfig(_)
            | SandboxError::ResourceLimitExceeded(_)
            | SandboxError::BackendNotAvailable(_)
            | SandboxError::CreationFailed(_) => e,
            other => SandboxError::CreationFailed(other.to_string()),
        })?;

        let instance = SandboxInstance {
            id,
            agent_id: agent_id.to_string(),
            project_id: project_id.to_string(),
            status: SandboxStatus::Creating,
            provider: self.runtime.kind(),
            handle: materialized.label,
            workspace_path: materialized.workspace_path,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        };
        let slot = Slot {
            state: Mutex::new(Record {
                instance: instance.clone(),
                cancel: CancellationToken::new(),
            }),
            handle: Arc::new(materialized.handle),
            config: Arc::new(config),
            exec_queue: Arc::new(Mutex::new(())),
        };
        self.registry.insert(id, Arc::new(slot));
        info!(id = %id, provider = %instance.provider, agent = agent_id, project = project_id, "sandbox created");
        Ok(instance)
    }

    /// Resolve a sandbox path against the instance root.
    fn resolve_path(
        slot: &Slot<R::Handle>,
        path: &str,
        err: fn(String) -> SandboxError,
    ) -> Result<PathBuf> {
        let root = &slot.config.allowed_root_directory;
        confine(root, path).ok_or_else(|| {
            err(format!("{path} is outside the allowed root {}", root.display()))
        })
    }

    /// Lock the slot and require one of `allowed`.
    async fn require(
        slot: &Slot<R::Handle>,
        allowed: &[SandboxStatus],
        operation: &'static str,
    ) -> Result<()> {
        let record = slot.state.lock().await;
        check(&record.instance, allowed, operation)
    }

    async fn launch(
        &self,
        id: SandboxId,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecStream> {
        let slot = self.slot(id)?;
        // fail fast before queueing
        Self::require(&slot, &[SandboxStatus::Running], "exec").await?;

        let permit = Arc::clone(&slot.exec_queue).lock_owned().await;

        let cancel = {
            let record = slot.state.lock().await;
            check(&record.instance, &[SandboxStatus::Running], "exec")?;
            record.cancel.clone()
        };

        let cwd = match &options.cwd {
            Some(cwd) => Self::resolve_path(&slot, cwd, SandboxError::ExecFailed)?,
            None => slot.config.allowed_root_directory.clone(),
        };
        let env = env::filter_blocked(&options.env, &slot.config.environment.blocked);
        let timeout_ms = options
            .timeout_ms
            .unwrap_or(slot.config.resources.timeout_ms)
            .max(1);

        let seq = self.exec_seq.fetch_add(1, Ordering::Relaxed);
        let marker = format!("{}-{seq}", id.short());
        let spec = ExecSpec {
            marker: &marker,
            command,
            cwd: &cwd,
            env: &env,
            user: options.user.as_deref(),
        };
        let process = self.runtime.command(&slot.handle, &spec);
        debug!(id = %id, marker = %marker, timeout_ms, "exec");

        exec::launch(
            Launch {
                runtime: Arc::clone(&self.runtime),
                handle: Arc::clone(&slot.handle),
                id,
                marker,
                user: options.user.clone(),
                timeout: Duration::from_millis(timeout_ms),
                cancel,
                permit,
            },
            process,
        )
    }

    /// Move to `error` after a failed transition.
    fn fail(record: &mut Record) {
        record.instance.status = SandboxStatus::Error;
        record.cancel.cancel();
    }

    async fn stop_locked(&self, slot: &Slot<R::Handle>, record: &mut Record) -> Result<()> {
        let id = record.instance.id;
        record.cancel.cancel();
        if let Err(e) = self.runtime.stop(&slot.handle).await {
            Self::fail(record);
            warn!(id = %id, error = %e, "sandbox stop failed");
            return Err(match e {
                SandboxError::StopFailed(_) => e,
                other => SandboxError::StopFailed(other.to_string()),
            });
        }
        record.instance.status = SandboxStatus::Stopped;
        record.instance.stopped_at = Some(Utc::now());
        info!(id = %id, "sandbox stopped");
        Ok(())
    }
}

fn check(instance: &SandboxInstance, allowed: &[SandboxStatus], operation: &'static str) -> Result<()> {
    if instance.status == SandboxStatus::Removed {
        return Err(SandboxError::NotFound(instance.id));
    }
    if allowed.contains(&instance.status) {
        Ok(())
    } else {
        Err(SandboxError::InvalidState {
            id: instance.id,
            status: instance.status,
            operation,
        })
    }
}

const FILE_STATES: &[SandboxStatus] = &[
    SandboxStatus::Creating,
    SandboxStatus::Running,
    SandboxStatus::Paused,
    SandboxStatus::Stopped,
];

#[async_trait]
impl<R: Runtime> SandboxProvider for ManagedProvider<R> {
    fn kind(&self) -> ProviderKind {
        self.runtime.kind()
    }

    async fn create(
        &self,
        agent_id: &str,
        project_id: &str,
        config: SandboxConfig,
    ) -> Result<SandboxInstance> {
        self.reserve()?;
        let created = self.create_registered(agent_id, project_id, config).await;
        if created.is_err() {
            self.release();
        }
        created
    }

    async fn start(&self, id: SandboxId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut record = slot.state.lock().await;
        check(
            &record.instance,
            &[SandboxStatus::Creating, SandboxStatus::Stopped],
            "start",
        )?;

        if let Err(e) = self.runtime.start(&slot.handle).await {
            Self::fail(&mut record);
            warn!(id = %id, error = %e, "sandbox start failed");
            return Err(match e {
                SandboxError::StartFailed(_) => e,
                other => SandboxError::StartFailed(other.to_string()),
            });
        }

        record.cancel = CancellationToken::new();
        record.instance.status = SandboxStatus::Running;
        record.instance.started_at = Some(Utc::now());
        record.instance.stopped_at = None;
        info!(id = %id, "sandbox started");
        Ok(())
    }

    async fn stop(&self, id: SandboxId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut record = slot.state.lock().await;
        if record.instance.status == SandboxStatus::Stopped {
            debug!(id = %id, "sandbox already stopped");
            return Ok(());
        }
        check(
            &record.instance,
            &[SandboxStatus::Running, SandboxStatus::Paused, SandboxStatus::Error],
            "stop",
        )?;
        self.stop_locked(&slot, &mut record).await
    }

    async fn pause(&self, id: SandboxId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut record = slot.state.lock().await;
        check(&record.instance, &[SandboxStatus::Running], "pause")?;
        if let Err(e) = self.runtime.pause(&slot.handle).await {
            Self::fail(&mut record);
            warn!(id = %id, error = %e, "sandbox pause failed");
            return Err(match e {
                SandboxError::StopFailed(_) => e,
                other => SandboxError::StopFailed(other.to_string()),
            });
        }
        record.instance.status = SandboxStatus::Paused;
        info!(id = %id, "sandbox paused");
        Ok(())
    }

    async fn resume(&self, id: SandboxId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut record = slot.state.lock().await;
        check(&record.instance, &[SandboxStatus::Paused], "resume")?;
        if let Err(e) = self.runtime.resume(&slot.handle).await {
            Self::fail(&mut record);
            warn!(id = %id, error = %e, "sandbox resume failed");
            return Err(match e {
                SandboxError::StartFailed(_) => e,
                other => SandboxError::StartFailed(other.to_string()),
            });
        }
        record.instance.status = SandboxStatus::Running;
        info!(id = %id, "sandbox resumed");
        Ok(())
    }

    async fn remove(&self, id: SandboxId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut record = slot.state.lock().await;
        check(
            &record.instance,
            &[
                SandboxStatus::Creating,
                SandboxStatus::Running,
                SandboxStatus::Paused,
                SandboxStatus::Stopped,
                SandboxStatus::Error,
            ],
            "remove",
        )?;

        if matches!(
            record.instance.status,
            SandboxStatus::Running | SandboxStatus::Paused
        ) && let Err(e) = self.stop_locked(&slot, &mut record).await
        {
            warn!(id = %id, error = %e, "stop before removal failed, forcing removal");
        }
        record.cancel.cancel();

        if let Err(e) = self.runtime.destroy(&slot.handle).await {
            Self::fail(&mut record);
            warn!(id = %id, error = %e, "sandbox removal failed");
            return Err(match e {
                SandboxError::RemovalFailed(_) => e,
                other => SandboxError::RemovalFailed(other.to_string()),
            });
        }
        if let Err(e) = self.runtime.release_storage(&slot.handle).await {
            warn!(id = %id, error = %e, "failed to release sandbox storage");
        }

        record.instance.status = SandboxStatus::Removed;
        self.registry.remove(&id);
        self.release();
        info!(id = %id, "sandbox removed");
        Ok(())
    }

    async fn exec(&self, id: SandboxId, command: &str, options: &ExecOptions) -> Result<ExecResult> {
        let stream = self.launch(id, command, options).await?;
        stream.collect(options.max_output_bytes).await
    }

    async fn exec_stream(
        &self,
        id: SandboxId,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecStream> {
        self.launch(id, command, options).await
    }

    async fn read_file(&self, id: SandboxId, path: &str) -> Result<Vec<u8>> {
        let slot = self.slot(id)?;
        Self::require(&slot, &[SandboxStatus::Running], "read a file in").await?;
        let path = Self::resolve_path(&slot, path, SandboxError::FileNotFound)?;
        self.runtime.read_file(&slot.handle, &path).await
    }

    async fn write_file(&self, id: SandboxId, path: &str, content: &[u8]) -> Result<()> {
        let slot = self.slot(id)?;
        Self::require(&slot, &[SandboxStatus::Running], "write a file in").await?;
        let path = Self::resolve_path(&slot, path, SandboxError::WriteFailed)?;
        let limit = slot.config.resources.disk_mb.saturating_mul(1024 * 1024);
        if u64::try_from(content.len()).unwrap_or(u64::MAX) > limit {
            return Err(SandboxError::ResourceLimitExceeded(format!(
                "{} bytes exceeds the {} MB disk limit",
                content.len(),
                slot.config.resources.disk_mb
            )));
        }
        self.runtime.write_file(&slot.handle, &path, content).await
    }

    async fn copy_in(&self, id: SandboxId, host_path: &Path, path: &str) -> Result<()> {
        let slot = self.slot(id)?;
        Self::require(&slot, FILE_STATES, "copy into").await?;
        let path = Self::resolve_path(&slot, path, SandboxError::CopyFailed)?;
        if !tokio::fs::try_exists(host_path).await.unwrap_or(false) {
            return Err(SandboxError::CopyFailed(format!(
                "host path {} does not exist",
                host_path.display()
            )));
        }
        self.runtime.copy_in(&slot.handle, host_path, &path).await
    }

    async fn copy_out(&self, id: SandboxId, path: &str, host_path: &Path) -> Result<()> {
        let slot = self.slot(id)?;
        Self::require(&slot, FILE_STATES, "copy out of").await?;
        let path = Self::resolve_path(&slot, path, SandboxError::CopyFailed)?;
        self.runtime.copy_out(&slot.handle, &path, host_path).await
    }

    async fn get_status(&self, id: SandboxId) -> Result<SandboxStatus> {
        Ok(self.instance(id).await?.status)
    }

    async fn instance(&self, id: SandboxId) -> Result<SandboxInstance> {
        let slot = self.slot(id)?;
        let record = slot.state.lock().await;
        if record.instance.status == SandboxStatus::Removed {
            return Err(SandboxError::NotFound(id));
        }
        Ok(record.instance.clone())
    }

    async fn get_resource_usage(&self, id: SandboxId) -> Result<ResourceUsage> {
        let slot = self.slot(id)?;
        Self::require(&slot, &[SandboxStatus::Running], "read resource usage of").await?;
        self.runtime
            .resource_usage(&slot.handle)
            .await
            .map_err(|e| match e {
                SandboxError::StatsFailed(_) => e,
                other => SandboxError::StatsFailed(other.to_string()),
            })
    }

    async fn list(&self, project_id: Option<&str>) -> Result<Vec<SandboxInstance>> {
        let slots: Vec<_> = self
            .registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut instances = Vec::with_capacity(slots.len());
        for slot in slots {
            let record = slot.state.lock().await;
            let instance = &record.instance;
            if instance.status == SandboxStatus::Removed {
                continue;
            }
            if project_id.is_some_and(|p| p != instance.project_id) {
                continue;
            }
            instances.push(instance.clone());
        }
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn health_check(&self) -> Result<()> {
        self.runtime.health_check().await.map_err(|e| match e {
            SandboxError::BackendNotAvailable(_) => e,
            other => SandboxError::BackendNotAvailable(other.to_string()),
        })
    }

    async fn shutdown(&self) {
        let ids: Vec<SandboxId> = self.registry.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            match self.remove(id).await {
                Ok(()) | Err(SandboxError::NotFound(_)) => {}
                Err(e) => warn!(id = %id, error = %e, "failed to remove sandbox during shutdown"),
            }
        }
        info!(provider = %self.runtime.kind(), "provider shutdown complete");
    }
}
