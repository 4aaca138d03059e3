use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox::{SandboxConfig, SandboxConfigOverride, policy};
use sandbox_docker::DockerConfig;
use sandbox_local::LocalConfig;
use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_CONFIG_FILE: &str = "sandbox.yaml";
pub(crate) const DEFAULT_STOP_GRACE_SECS: u64 = 10;
pub(crate) const DEFAULT_QUEUE_DEPTH: usize = 1024;
pub(crate) const DEFAULT_BATCH_SIZE: usize = 64;
pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Deployment-wide policy defaults, same shape as a per-call override.
    pub defaults: SandboxConfigOverride,
    pub docker: DockerSection,
    pub local: LocalSection,
    pub bridge: Option<BridgeSection>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSection {
    /// Serves both `container-engine` and `dev-container`.
    pub enabled: bool,
    pub binary: PathBuf,
    pub name_prefix: String,
    pub restricted_network: String,
    pub enforce_disk_quota: bool,
    pub stop_grace_secs: u64,
    pub max_instances: Option<usize>,
}

impl Default for DockerSection {
    fn default() -> Self {
        let docker = DockerConfig::default();
        Self {
            enabled: true,
            binary: docker.binary,
            name_prefix: docker.name_prefix,
            restricted_network: docker.restricted_network,
            enforce_disk_quota: docker.enforce_disk_quota,
            stop_grace_secs: DEFAULT_STOP_GRACE_SECS,
            max_instances: None,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSection {
    /// Off unless asked for: local sandboxes are not isolated.
    pub enabled: bool,
    pub base_dir: PathBuf,
    pub max_instances: Option<usize>,
    pub stop_grace_secs: u64,
}

impl Default for LocalSection {
    fn default() -> Self {
        let local = LocalConfig::default();
        Self {
            enabled: false,
            base_dir: local.base_dir,
            max_instances: None,
            stop_grace_secs: local.stop_grace.as_secs(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct BridgeSection {
    /// Endpoint that receives batches of terminal-output events.
    pub url: String,
    pub token: Option<String>,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempts per batch before it is dropped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Load a runner config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

/// Load `path` if it exists. A missing file is an error only when the
/// caller named it explicitly.
pub async fn load_or_default(path: &Path, explicit: bool) -> RunnerResult<RunnerConfig> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| RunnerError::Config(format!("check {}: {e}", path.display())))?;
    if exists || explicit {
        load(path).await
    } else {
        Ok(RunnerConfig::default())
    }
}

impl RunnerConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        // A bare program name is looked up in PATH.
        if self.docker.binary.components().count() > 1 {
            resolve(&mut self.docker.binary);
        }
        resolve(&mut self.local.base_dir);
        if let Some(descriptor) = &mut self.defaults.dev_container.descriptor_path {
            resolve(descriptor);
        }
    }

    fn validate(&self) -> RunnerResult<()> {
        self.sandbox_defaults()?;
        if let Some(bridge) = &self.bridge {
            if !(bridge.url.starts_with("http://") || bridge.url.starts_with("https://")) {
                return Err(RunnerError::Config(format!(
                    "bridge.url must be http(s): {}",
                    bridge.url
                )));
            }
            if bridge.queue_depth == 0 || bridge.batch_size == 0 {
                return Err(RunnerError::Config(
                    "bridge.queue_depth and bridge.batch_size must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Compiled-in defaults with the `defaults` section applied.
    pub fn sandbox_defaults(&self) -> RunnerResult<SandboxConfig> {
        policy::resolve_override(&SandboxConfig::default(), &self.defaults)
            .map_err(|e| RunnerError::Config(format!("defaults: {e}")))
    }

    pub fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            binary: self.docker.binary.clone(),
            name_prefix: self.docker.name_prefix.clone(),
            restricted_network: self.docker.restricted_network.clone(),
            enforce_disk_quota: self.docker.enforce_disk_quota,
            stop_grace: Duration::from_secs(self.docker.stop_grace_secs),
            max_instances: self.docker.max_instances,
            ..Default::default()
        }
    }

    pub fn local_config(&self) -> LocalConfig {
        LocalConfig {
            base_dir: self.local.base_dir.clone(),
            max_instances: self.local.max_instances,
            stop_grace: Duration::from_secs(self.local.stop_grace_secs),
            ..Default::default()
        }
    }
}
