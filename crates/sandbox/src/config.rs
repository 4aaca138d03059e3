use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Compiled-in defaults. Deployments override them through the `defaults`
/// section of the runner config file; callers override them per sandbox.
pub mod defaults {
    pub const MEMORY_MB: u64 = 2048;
    pub const CPUS: f64 = 2.0;
    pub const PIDS_LIMIT: u32 = 512;
    pub const DISK_MB: u64 = 10 * 1024;
    pub const TIMEOUT_MS: u64 = 5 * 60 * 1000;

    /// Smallest memory ceiling accepted by the resolver.
    pub const MIN_MEMORY_MB: u64 = 64;

    pub const IMAGE: &str = "debian:bookworm-slim";
    pub const ROOT_DIRECTORY: &str = "/workspace";

    /// Host variables copied into every sandbox unless blocked.
    pub const PASSTHROUGH: &[&str] = &["LANG", "LC_ALL", "TERM", "TZ"];

    /// Host credentials that never reach a sandbox, whatever a caller asks for.
    pub const BLOCKED: &[&str] = &[
        "ANTHROPIC_API_KEY",
        "AWS_ACCESS_KEY_ID",
        "AWS_SECRET_ACCESS_KEY",
        "AWS_SESSION_TOKEN",
        "AZURE_CLIENT_SECRET",
        "DATABASE_URL",
        "DOCKER_HOST",
        "GH_TOKEN",
        "GITHUB_TOKEN",
        "GITLAB_TOKEN",
        "GOOGLE_APPLICATION_CREDENTIALS",
        "KUBECONFIG",
        "NPM_TOKEN",
        "OPENAI_API_KEY",
        "SSH_AUTH_SOCK",
    ];
}

// ---------------------------------------------------------------------------
// Effective configuration
// ---------------------------------------------------------------------------

/// Backend that materializes a sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    #[default]
    ContainerEngine,
    DevContainer,
    /// Host processes without isolation. Development only.
    Local,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::ContainerEngine, Self::DevContainer, Self::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContainerEngine => "container-engine",
            Self::DevContainer => "dev-container",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: u32,
    /// Ephemeral storage ceiling.
    pub disk_mb: u64,
    /// Default per-command timeout.
    pub timeout_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: defaults::MEMORY_MB,
            cpus: defaults::CPUS,
            pids_limit: defaults::PIDS_LIMIT,
            disk_mb: defaults::DISK_MB,
            timeout_ms: defaults::TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network access at all.
    #[default]
    None,
    /// Attached to the pre-provisioned egress-filtered network.
    Restricted,
    Full,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Restricted => "restricted",
            Self::Full => "full",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    pub mode: NetworkMode,
    /// Egress allow-list for `restricted` mode.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub allowed_ports: Vec<u16>,
}

/// Which variables reach the sandbox environment.
///
/// `blocked` always wins over `passthrough`, `set` and `inherit_all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentPolicy {
    /// Host variable names copied in, in order, without duplicates.
    pub passthrough: Vec<String>,
    pub set: BTreeMap<String, String>,
    pub blocked: BTreeSet<String>,
    /// Copy every host variable that is not blocked.
    #[serde(default)]
    pub inherit_all: bool,
}

impl Default for EnvironmentPolicy {
    fn default() -> Self {
        Self {
            passthrough: defaults::PASSTHROUGH.iter().map(|s| s.to_string()).collect(),
            set: BTreeMap::new(),
            blocked: defaults::BLOCKED.iter().map(|s| s.to_string()).collect(),
            inherit_all: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSettings {
    pub image: String,
    /// Extra engine arguments, appended after the generated ones.
    #[serde(default)]
    pub runtime_args: Vec<String>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: defaults::IMAGE.to_string(),
            runtime_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevContainerSettings {
    /// Path of the `devcontainer.json` the config was layered from.
    pub descriptor_path: Option<PathBuf>,
    /// Runs once after the first successful start.
    pub post_create_command: Option<String>,
}

/// Fully resolved, immutable policy of one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    pub provider: ProviderKind,
    pub resources: ResourceLimits,
    pub network: NetworkPolicy,
    pub environment: EnvironmentPolicy,
    /// Absolute path inside the isolated environment. Commands and file
    /// operations are confined to it.
    pub allowed_root_directory: PathBuf,
    pub container: ContainerSettings,
    pub dev_container: DevContainerSettings,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            resources: ResourceLimits::default(),
            network: NetworkPolicy::default(),
            environment: EnvironmentPolicy::default(),
            allowed_root_directory: PathBuf::from(defaults::ROOT_DIRECTORY),
            container: ContainerSettings::default(),
            dev_container: DevContainerSettings::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Partial configuration
// ---------------------------------------------------------------------------

/// Caller-supplied partial configuration. Every field is optional; see
/// [`crate::policy::resolve`] for how layers combine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfigOverride {
    pub provider: Option<ProviderKind>,
    pub resources: ResourceOverride,
    pub network: NetworkOverride,
    pub environment: EnvironmentOverride,
    pub allowed_root_directory: Option<PathBuf>,
    pub container: ContainerOverride,
    pub dev_container: DevContainerOverride,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceOverride {
    pub memory_mb: Option<u64>,
    pub cpus: Option<f64>,
    pub pids_limit: Option<u32>,
    pub disk_mb: Option<u64>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkOverride {
    pub mode: Option<NetworkMode>,
    pub allowed_hosts: Option<Vec<String>>,
    pub allowed_ports: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentOverride {
    pub passthrough: Vec<String>,
    pub set: BTreeMap<String, String>,
    pub blocked: Vec<String>,
    pub inherit_all: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerOverride {
    pub image: Option<String>,
    pub runtime_args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DevContainerOverride {
    pub descriptor_path: Option<PathBuf>,
    pub post_create_command: Option<String>,
}
