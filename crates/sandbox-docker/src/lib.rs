mod cli;
mod config;
mod enforce;
mod prerequisites;
mod runtime;
mod stats;

pub use config::DockerConfig;
pub use enforce::{EGRESS_HOSTS_LABEL, EGRESS_PORTS_LABEL, runtime_args, vet_runtime_args};
pub use prerequisites::check_prerequisites;
pub use runtime::{ContainerHandle, DockerRuntime};

use sandbox::ManagedProvider;

/// Sandboxes backed by the container engine.
pub type DockerProvider = ManagedProvider<DockerRuntime>;

/// Provider for plain `container-engine` sandboxes.
pub fn container_engine_provider(config: DockerConfig) -> DockerProvider {
    ManagedProvider::new(DockerRuntime::new(config))
}

/// Provider for sandboxes described by a `devcontainer.json`.
pub fn dev_container_provider(config: DockerConfig) -> DockerProvider {
    ManagedProvider::new(DockerRuntime::dev_container(config))
}
