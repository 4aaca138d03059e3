//! Policy resolution: compiled defaults + partial layers → one effective
//! [`SandboxConfig`].
//!
//! Layers are folded left to right over the defaults:
//!
//! | field | rule |
//! |-------|------|
//! | resources, network mode, provider, image, root | last layer that sets it wins, field by field |
//! | `network.allowed_hosts` / `allowed_ports` | last layer that sets the list wins |
//! | `environment.passthrough` | ordered union, duplicates dropped |
//! | `environment.set` | map merge, later layers win per key |
//! | `environment.blocked` | union; no layer can unblock a name |
//! | `container.runtime_args` | concatenated |
//!
//! Resolution fails only on schema validation, never on policy conflicts.

use std::path::Path;

use crate::config::{ProviderKind, SandboxConfig, SandboxConfigOverride, defaults};
use crate::error::{Result, SandboxError};

/// Resolve a single caller override against `defaults`.
pub fn resolve_override(
    defaults: &SandboxConfig,
    layer: &SandboxConfigOverride,
) -> Result<SandboxConfig> {
    resolve(defaults, &[layer])
}

/// Fold `layers` over `defaults` and validate the result.
pub fn resolve(defaults: &SandboxConfig, layers: &[&SandboxConfigOverride]) -> Result<SandboxConfig> {
    let mut config = defaults.clone();
    for layer in layers {
        apply(&mut config, layer);
    }
    validate(&config)?;
    Ok(config)
}

fn apply(config: &mut SandboxConfig, layer: &SandboxConfigOverride) {
    if let Some(provider) = layer.provider {
        config.provider = provider;
    }

    let resources = &layer.resources;
    if let Some(memory_mb) = resources.memory_mb {
        config.resources.memory_mb = memory_mb;
    }
    if let Some(cpus) = resources.cpus {
        config.resources.cpus = cpus;
    }
    if let Some(pids_limit) = resources.pids_limit {
        config.resources.pids_limit = pids_limit;
    }
    if let Some(disk_mb) = resources.disk_mb {
        config.resources.disk_mb = disk_mb;
    }
    if let Some(timeout_ms) = resources.timeout_ms {
        config.resources.timeout_ms = timeout_ms;
    }

    if let Some(mode) = layer.network.mode {
        config.network.mode = mode;
    }
    if let Some(hosts) = &layer.network.allowed_hosts {
        config.network.allowed_hosts = hosts.clone();
    }
    if let Some(ports) = &layer.network.allowed_ports {
        config.network.allowed_ports = ports.clone();
    }

    let env = &mut config.environment;
    for name in &layer.environment.passthrough {
        if !env.passthrough.contains(name) {
            env.passthrough.push(name.clone());
        }
    }
    env.set.extend(
        layer
            .environment
            .set
            .iter()
            .map(|(name, value)| (name.clone(), value.clone())),
    );
    env.blocked.extend(layer.environment.blocked.iter().cloned());
    if let Some(inherit_all) = layer.environment.inherit_all {
        env.inherit_all = inherit_all;
    }

    if let Some(root) = &layer.allowed_root_directory {
        config.allowed_root_directory = root.clone();
    }

    if let Some(image) = &layer.container.image {
        config.container.image = image.clone();
    }
    config
        .container
        .runtime_args
        .extend(layer.container.runtime_args.iter().cloned());

    if let Some(path) = &layer.dev_container.descriptor_path {
        config.dev_container.descriptor_path = Some(path.clone());
    }
    if let Some(command) = &layer.dev_container.post_create_command {
        config.dev_container.post_create_command = Some(command.clone());
    }
}

/// Schema validation of an effective configuration.
pub fn validate(config: &SandboxConfig) -> Result<()> {
    let resources = &config.resources;
    if resources.memory_mb < defaults::MIN_MEMORY_MB {
        return Err(invalid(format!(
            "resources.memoryMb must be at least {} (got {})",
            defaults::MIN_MEMORY_MB,
            resources.memory_mb
        )));
    }
    if !resources.cpus.is_finite() || resources.cpus <= 0.0 {
        return Err(invalid(format!(
            "resources.cpus must be a positive number (got {})",
            resources.cpus
        )));
    }
    if resources.pids_limit == 0 {
        return Err(invalid("resources.pidsLimit must be at least 1".into()));
    }
    if resources.disk_mb == 0 {
        return Err(invalid("resources.diskMb must be at least 1".into()));
    }
    if resources.timeout_ms == 0 {
        return Err(invalid("resources.timeoutMs must be at least 1".into()));
    }

    if let Some(host) = config
        .network
        .allowed_hosts
        .iter()
        .find(|h| h.trim().is_empty() || h.contains(char::is_whitespace))
    {
        return Err(invalid(format!("network.allowedHosts has an invalid entry: {host:?}")));
    }
    if config.network.allowed_ports.contains(&0) {
        return Err(invalid("network.allowedPorts must not contain 0".into()));
    }

    let env = &config.environment;
    let names = env
        .passthrough
        .iter()
        .chain(env.set.keys())
        .chain(env.blocked.iter());
    for name in names {
        if !is_valid_env_name(name) {
            return Err(invalid(format!("invalid environment variable name: {name:?}")));
        }
    }

    if !config.allowed_root_directory.is_absolute() {
        return Err(invalid(format!(
            "allowedRootDirectory must be absolute (got {})",
            config.allowed_root_directory.display()
        )));
    }
    if config.allowed_root_directory == Path::new("/") {
        return Err(invalid("allowedRootDirectory must not be /".into()));
    }

    if config.provider != ProviderKind::Local && config.container.image.trim().is_empty() {
        return Err(invalid("container.image must not be empty".into()));
    }

    Ok(())
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn invalid(message: String) -> SandboxError {
    SandboxError::InvalidConfig(message)
}
