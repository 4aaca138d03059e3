pub mod bridge;
pub mod config;
pub mod devcontainer;
pub mod env;
mod error;
mod exec;
mod lifecycle;
mod merge;
pub mod paths;
pub mod policy;
pub mod process;
mod provider;
pub mod runtime;
mod service;
mod stream;
mod types;

pub use bridge::{ChannelSink, StreamBridge, StreamSink, TerminalOutputEvent};
pub use config::{
    NetworkMode, NetworkPolicy, ProviderKind, ResourceLimits, SandboxConfig, SandboxConfigOverride,
};
pub use error::{Result, SandboxError};
pub use lifecycle::ManagedProvider;
pub use merge::FanIn;
pub use provider::SandboxProvider;
pub use runtime::{CreateSpec, ExecSpec, Materialized, Runtime};
pub use service::{ProviderHealth, ProviderSet, SandboxService};
pub use stream::ExecStream;
pub use types::{
    ExecOptions, ExecResult, ExecStreamEvent, KILLED_EXIT_CODE, OutputChannel, ResourceUsage,
    SandboxId, SandboxInstance, SandboxStatus, TIMEOUT_EXIT_CODE,
};
