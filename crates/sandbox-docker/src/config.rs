use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// `docker` CLI binary, or any CLI that speaks the same commands.
    pub binary: PathBuf,
    /// Container and volume names are `<prefix>-<short id>`.
    pub name_prefix: String,
    /// Pre-provisioned network for `restricted` mode. Its egress filter reads
    /// the allow-list from container labels.
    pub restricted_network: String,
    /// Pass `--storage-opt size=` from `resources.diskMb`. Needs overlay2 on
    /// xfs with pquota; engines without quota support reject the container.
    pub enforce_disk_quota: bool,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
    pub max_instances: Option<usize>,
    /// Upper bound for a dev-container `postCreateCommand`.
    pub post_create_timeout: Duration,
    /// Upper bound for engine queries (health, stats).
    pub query_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("docker"),
            name_prefix: "sandbox".to_string(),
            restricted_network: "sandbox-restricted".to_string(),
            enforce_disk_quota: true,
            stop_grace: Duration::from_secs(10),
            max_instances: None,
            post_create_timeout: Duration::from_secs(600),
            query_timeout: Duration::from_secs(10),
        }
    }
}
