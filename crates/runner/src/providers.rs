use std::sync::Arc;

use sandbox::{ProviderSet, SandboxService};
use tracing::info;

use crate::config::RunnerConfig;
use crate::error::RunnerResult;

/// One provider per enabled backend, behind a routing service.
pub fn build_service(config: &RunnerConfig) -> RunnerResult<SandboxService> {
    let mut providers = ProviderSet::new();
    if config.docker.enabled {
        let docker = config.docker_config();
        providers = providers
            .with(Arc::new(sandbox_docker::container_engine_provider(docker.clone())))
            .with(Arc::new(sandbox_docker::dev_container_provider(docker)));
    }
    if config.local.enabled {
        providers = providers.with(Arc::new(sandbox_local::local_provider(config.local_config())));
    }

    let kinds: Vec<String> = providers.kinds().map(|k| k.to_string()).collect();
    info!(providers = %kinds.join(","), "providers configured");
    Ok(SandboxService::new(providers, config.sandbox_defaults()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::ProviderKind;

    #[test]
    fn docker_is_on_and_local_off_by_default() {
        let service = build_service(&RunnerConfig::default()).unwrap();
        let kinds: Vec<ProviderKind> = service.providers().kinds().collect();
        assert!(kinds.contains(&ProviderKind::ContainerEngine));
        assert!(kinds.contains(&ProviderKind::DevContainer));
        assert!(!kinds.contains(&ProviderKind::Local));
    }

    #[test]
    fn local_only() {
        let mut config = RunnerConfig::default();
        config.docker.enabled = false;
        config.local.enabled = true;
        let service = build_service(&config).unwrap();
        let kinds: Vec<ProviderKind> = service.providers().kinds().collect();
        assert_eq!(kinds, vec![ProviderKind::Local]);
    }
}
