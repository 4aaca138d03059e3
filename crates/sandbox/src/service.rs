use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::{ProviderKind, SandboxConfig, SandboxConfigOverride};
use crate::devcontainer::DevContainerDescriptor;
use crate::error::{Result, SandboxError};
use crate::policy;
use crate::provider::SandboxProvider;
use crate::stream::ExecStream;
use crate::types::{
    ExecOptions, ExecResult, ResourceUsage, SandboxId, SandboxInstance, SandboxStatus,
};

/// One provider per [`ProviderKind`]. Selection is a pure lookup.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: BTreeMap<ProviderKind, Arc<dyn SandboxProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under its own kind, replacing any previous one.
    pub fn with(mut self, provider: Arc<dyn SandboxProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn select(&self, kind: ProviderKind) -> Result<&Arc<dyn SandboxProvider>> {
        self.providers
            .get(&kind)
            .ok_or_else(|| SandboxError::BackendNotAvailable(format!("no {kind} provider configured")))
    }

    pub fn kinds(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.providers.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SandboxProvider>> {
        self.providers.values()
    }
}

/// Health of one provider as reported by [`SandboxService::health`].
#[derive(Debug)]
pub struct ProviderHealth {
    pub kind: ProviderKind,
    pub result: Result<()>,
}

/// Front door for callers: resolves policy, picks the provider and routes
/// id-based calls back to the provider that created the id.
pub struct SandboxService {
    providers: ProviderSet,
    defaults: SandboxConfig,
    routes: DashMap<SandboxId, ProviderKind>,
}

impl SandboxService {
    pub fn new(providers: ProviderSet, defaults: SandboxConfig) -> Self {
        Self {
            providers,
            defaults,
            routes: DashMap::new(),
        }
    }

    pub fn defaults(&self) -> &SandboxConfig {
        &self.defaults
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    /// Effective config for `layer`. A dev-container descriptor named by the
    /// layer is loaded and applied beneath it.
    pub async fn resolve(&self, layer: &SandboxConfigOverride) -> Result<SandboxConfig> {
        let Some(path) = &layer.dev_container.descriptor_path else {
            return policy::resolve_override(&self.defaults, layer);
        };
        let descriptor = DevContainerDescriptor::load(path).await?;
        let descriptor_layer = descriptor.to_override(path)?;
        policy::resolve(&self.defaults, &[&descriptor_layer, layer])
    }

    pub async fn create(
        &self,
        agent_id: &str,
        project_id: &str,
        layer: &SandboxConfigOverride,
    ) -> Result<SandboxInstance> {
        let config = self.resolve(layer).await?;
        self.create_resolved(agent_id, project_id, config).await
    }

    pub async fn create_resolved(
        &self,
        agent_id: &str,
        project_id: &str,
        config: SandboxConfig,
    ) -> Result<SandboxInstance> {
        let kind = config.provider;
        let provider = self.providers.select(kind)?;
        let instance = provider.create(agent_id, project_id, config).await?;
        self.routes.insert(instance.id, kind);
        debug!(id = %instance.id, provider = %kind, "route registered");
        Ok(instance)
    }

    fn route(&self, id: SandboxId) -> Result<&Arc<dyn SandboxProvider>> {
        let kind = self
            .routes
            .get(&id)
            .map(|entry| *entry.value())
            .ok_or(SandboxError::NotFound(id))?;
        self.providers.select(kind)
    }

    pub async fn start(&self, id: SandboxId) -> Result<()> {
        self.route(id)?.start(id).await
    }

    pub async fn stop(&self, id: SandboxId) -> Result<()> {
        self.route(id)?.stop(id).await
    }

    pub async fn pause(&self, id: SandboxId) -> Result<()> {
        self.route(id)?.pause(id).await
    }

    pub async fn resume(&self, id: SandboxId) -> Result<()> {
        self.route(id)?.resume(id).await
    }

    pub async fn remove(&self, id: SandboxId) -> Result<()> {
        let result = self.route(id)?.remove(id).await;
        if matches!(result, Ok(()) | Err(SandboxError::NotFound(_))) {
            self.routes.remove(&id);
        }
        result
    }

    pub async fn exec(&self, id: SandboxId, command: &str, options: &ExecOptions) -> Result<ExecResult> {
        self.route(id)?.exec(id, command, options).await
    }

    pub async fn exec_stream(
        &self,
        id: SandboxId,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecStream> {
        self.route(id)?.exec_stream(id, command, options).await
    }

    pub async fn read_file(&self, id: SandboxId, path: &str) -> Result<Vec<u8>> {
        self.route(id)?.read_file(id, path).await
    }

    pub async fn write_file(&self, id: SandboxId, path: &str, content: &[u8]) -> Result<()> {
        self.route(id)?.write_file(id, path, content).await
    }

    pub async fn copy_in(&self, id: SandboxId, host_path: &Path, path: &str) -> Result<()> {
        self.route(id)?.copy_in(id, host_path, path).await
    }

    pub async fn copy_out(&self, id: SandboxId, path: &str, host_path: &Path) -> Result<()> {
        self.route(id)?.copy_out(id, path, host_path).await
    }

    pub async fn get_status(&self, id: SandboxId) -> Result<SandboxStatus> {
        self.route(id)?.get_status(id).await
    }

    pub async fn instance(&self, id: SandboxId) -> Result<SandboxInstance> {
        self.route(id)?.instance(id).await
    }

    pub async fn get_resource_usage(&self, id: SandboxId) -> Result<ResourceUsage> {
        self.route(id)?.get_resource_usage(id).await
    }

    /// Instances across every provider, oldest first.
    pub async fn list(&self, project_id: Option<&str>) -> Result<Vec<SandboxInstance>> {
        let mut all = Vec::new();
        for provider in self.providers.iter() {
            all.extend(provider.list(project_id).await?);
        }
        all.sort_by_key(|i| i.created_at);
        Ok(all)
    }

    pub async fn health(&self) -> Vec<ProviderHealth> {
        let mut report = Vec::new();
        for provider in self.providers.iter() {
            let result = provider.health_check().await;
            if let Err(e) = &result {
                warn!(provider = %provider.kind(), error = %e, "provider unhealthy");
            }
            report.push(ProviderHealth {
                kind: provider.kind(),
                result,
            });
        }
        report
    }

    pub async fn shutdown(&self) {
        for provider in self.providers.iter() {
            provider.shutdown().await;
        }
        self.routes.clear();
        info!("sandbox service shutdown complete");
    }
}
