mod config;
mod files;
mod runtime;

pub use config::LocalConfig;
pub use runtime::{LocalHandle, LocalRuntime};

use sandbox::ManagedProvider;

/// Unisolated host-process sandboxes.
pub type LocalProvider = ManagedProvider<LocalRuntime>;

pub fn local_provider(config: LocalConfig) -> LocalProvider {
    ManagedProvider::new(LocalRuntime::new(config))
}
