use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Each sandbox gets `<base_dir>/<short id>` as its workspace.
    pub base_dir: PathBuf,
    pub max_instances: Option<usize>,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
    /// `PATH` for commands whose environment does not set one.
    pub default_path: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("sandbox-local"),
            max_instances: None,
            stop_grace: Duration::from_secs(5),
            default_path: "/usr/local/bin:/usr/bin:/bin".to_string(),
        }
    }
}
