//! `devcontainer.json` support.
//!
//! Only the declarative subset that maps onto [`SandboxConfigOverride`] is
//! read; features, build instructions and lifecycle hooks other than
//! `postCreateCommand` are ignored. The descriptor becomes one policy layer
//! between the deployment defaults and the call-time override.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::config::{
    ContainerOverride, DevContainerOverride, EnvironmentOverride, ProviderKind, ResourceOverride,
    SandboxConfigOverride,
};
use crate::error::{Result, SandboxError};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DevContainerDescriptor {
    pub name: Option<String>,
    pub image: Option<String>,
    pub container_env: BTreeMap<String, String>,
    /// `null` values unset a variable in the reference tooling; here they are skipped.
    pub remote_env: BTreeMap<String, Option<String>>,
    pub workspace_folder: Option<String>,
    pub run_args: Vec<String>,
    pub post_create_command: Option<LifecycleCommand>,
    pub host_requirements: Option<HostRequirements>,
}

/// The three shapes a lifecycle command may take.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LifecycleCommand {
    Shell(String),
    Argv(Vec<String>),
    /// Named commands; run one after another in name order.
    Parallel(BTreeMap<String, LifecycleStep>),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LifecycleStep {
    Shell(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostRequirements {
    pub cpus: Option<f64>,
    /// Size string such as `"4gb"`.
    pub memory: Option<String>,
    pub storage: Option<String>,
}

impl LifecycleCommand {
    /// Render as a single `sh -c` script.
    pub fn to_shell(&self) -> String {
        match self {
            Self::Shell(script) => script.clone(),
            Self::Argv(argv) => shell_words::join(argv),
            Self::Parallel(steps) => steps
                .values()
                .map(|step| match step {
                    LifecycleStep::Shell(script) => format!("( {script} )"),
                    LifecycleStep::Argv(argv) => shell_words::join(argv),
                })
                .collect::<Vec<_>>()
                .join(" && "),
        }
    }
}

impl DevContainerDescriptor {
    /// Parse descriptor text. Comments and trailing commas are accepted.
    pub fn parse(text: &str) -> Result<Self> {
        json5::from_str(text)
            .map_err(|e| SandboxError::InvalidConfig(format!("devcontainer.json: {e}")))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            SandboxError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "loaded devcontainer descriptor");
        Self::parse(&text)
    }

    /// Convert into a policy layer. `descriptor_path` is recorded on the
    /// resulting config for diagnostics.
    pub fn to_override(&self, descriptor_path: &Path) -> Result<SandboxConfigOverride> {
        let image = match &self.image {
            Some(image) if !image.trim().is_empty() => image.clone(),
            _ => {
                return Err(SandboxError::InvalidConfig(
                    "devcontainer.json must name an image; build-based descriptors are not supported"
                        .into(),
                ));
            }
        };

        let allowed_root_directory = match &self.workspace_folder {
            Some(folder) => {
                let folder = PathBuf::from(folder);
                if !folder.is_absolute() {
                    return Err(SandboxError::InvalidConfig(format!(
                        "devcontainer.json workspaceFolder must be absolute (got {})",
                        folder.display()
                    )));
                }
                Some(folder)
            }
            None => None,
        };

        let mut set = self.container_env.clone();
        set.extend(
            self.remote_env
                .iter()
                .filter_map(|(name, value)| Some((name.clone(), value.clone()?))),
        );

        let mut resources = ResourceOverride::default();
        if let Some(req) = &self.host_requirements {
            resources.cpus = req.cpus;
            if let Some(memory) = &req.memory {
                resources.memory_mb = Some(parse_size_mb(memory)?);
            }
            if let Some(storage) = &req.storage {
                resources.disk_mb = Some(parse_size_mb(storage)?);
            }
        }

        Ok(SandboxConfigOverride {
            provider: Some(ProviderKind::DevContainer),
            resources,
            environment: EnvironmentOverride {
                set,
                ..Default::default()
            },
            allowed_root_directory,
            container: ContainerOverride {
                image: Some(image),
                runtime_args: self.run_args.clone(),
            },
            dev_container: DevContainerOverride {
                descriptor_path: Some(descriptor_path.to_path_buf()),
                post_create_command: self.post_create_command.as_ref().map(LifecycleCommand::to_shell),
            },
            ..Default::default()
        })
    }
}

/// Parse a size such as `"4gb"`, `"512mb"` or `"1.5 GB"` into MiB. A bare
/// number is taken as bytes.
pub fn parse_size_mb(value: &str) -> Result<u64> {
    let trimmed = value.trim().to_ascii_lowercase();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| SandboxError::InvalidConfig(format!("invalid size: {value:?}")))?;
    let factor_mb = match unit.trim() {
        "" | "b" => 1.0 / (1024.0 * 1024.0),
        "k" | "kb" => 1.0 / 1024.0,
        "m" | "mb" => 1.0,
        "g" | "gb" => 1024.0,
        "t" | "tb" => 1024.0 * 1024.0,
        other => {
            return Err(SandboxError::InvalidConfig(format!(
                "invalid size unit {other:?} in {value:?}"
            )));
        }
    };
    let mb = (number * factor_mb).ceil();
    if !mb.is_finite() || !(0.0..=u64::MAX as f64).contains(&mb) {
        return Err(SandboxError::InvalidConfig(format!("invalid size: {value:?}")));
    }
    Ok(mb as u64)
}
