#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::unreachable
)]

//! Drives the docker provider against a shell script that speaks the subset
//! of the engine CLI the runtime uses. `exec` runs the command on the host,
//! so the sandbox root is a scratch directory.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use sandbox::config::ResourceOverride;
use sandbox::{
    ExecOptions, ManagedProvider, SandboxConfig, SandboxConfigOverride, SandboxProvider,
    SandboxStatus, TIMEOUT_EXIT_CODE, policy,
};
use sandbox_docker::{DockerConfig, DockerProvider, DockerRuntime};
use tempfile::TempDir;

const FAKE_ENGINE: &str = r#"#!/bin/sh
echo "$@" >> "$(dirname "$0")/calls.log"
cmd=$1; shift
case "$cmd" in
  version) echo 27.0.0 ;;
  volume) ;;
  create) echo 0123456789abcdef0123456789abcdef ;;
  start|stop|pause|unpause|rm) ;;
  stats) echo '{"CPUPerc":"1.50%","MemUsage":"10MiB / 2GiB","PIDs":"2"}' ;;
  cp) cp "${1#*:}" "${2#*:}" ;;
  exec)
    while [ $# -gt 0 ]; do
      case "$1" in
        -w) cd "$2" || exit 1; shift 2 ;;
        -u|-e) shift 2 ;;
        -i) shift ;;
        *) break ;;
      esac
    done
    shift
    exec "$@" ;;
  *) echo "unknown command: $cmd" >&2; exit 1 ;;
esac
"#;

/// Written once per test binary so no test forks while the script is open for writing.
static ENGINE: LazyLock<TempDir> = LazyLock::new(|| {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("docker");
    std::fs::write(&path, FAKE_ENGINE).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    dir
});

fn engine_binary() -> PathBuf {
    ENGINE.path().join("docker")
}

/// Engine calls that mention `prefix`.
fn calls(prefix: &str) -> Vec<String> {
    std::fs::read_to_string(ENGINE.path().join("calls.log"))
        .unwrap_or_default()
        .lines()
        .filter(|line| line.contains(prefix))
        .map(str::to_string)
        .collect()
}

struct Harness {
    provider: DockerProvider,
    root: TempDir,
    prefix: String,
}

fn harness(prefix: &str, runtime: fn(DockerConfig) -> DockerRuntime) -> Harness {
    let config = DockerConfig {
        binary: engine_binary(),
        name_prefix: prefix.to_string(),
        stop_grace: Duration::from_secs(1),
        ..Default::default()
    };
    let host_env = BTreeMap::from([
        ("LANG".to_string(), "C.UTF-8".to_string()),
        ("GITHUB_TOKEN".to_string(), "ghp_host".to_string()),
    ]);
    Harness {
        provider: ManagedProvider::new(runtime(config)).with_host_env(host_env),
        root: TempDir::new().unwrap(),
        prefix: prefix.to_string(),
    }
}

impl Harness {
    fn config(&self) -> SandboxConfig {
        let layer = SandboxConfigOverride {
            allowed_root_directory: Some(self.root.path().to_path_buf()),
            resources: ResourceOverride {
                memory_mb: Some(512),
                ..Default::default()
            },
            ..Default::default()
        };
        policy::resolve_override(&SandboxConfig::default(), &layer).unwrap()
    }

    fn root(&self) -> &Path {
        self.root.path()
    }
}

#[tokio::test]
async fn lifecycle_issues_the_expected_engine_calls() {
    let h = harness("lifecycle", DockerRuntime::new);
    let instance = h.provider.create("a", "p", h.config()).await.unwrap();
    assert_eq!(instance.handle, "0123456789abcdef0123456789abcdef");
    assert_eq!(instance.workspace_path, h.root());

    h.provider.start(instance.id).await.unwrap();
    h.provider.stop(instance.id).await.unwrap();
    h.provider.remove(instance.id).await.unwrap();

    let calls = calls(&h.prefix);
    assert!(calls[0].starts_with("volume create"), "{calls:?}");
    assert!(calls[1].starts_with("create --name lifecycle-"), "{calls:?}");
    assert!(calls[1].contains("--memory 512m"));
    assert!(calls[1].contains("--network none"));
    assert!(calls[1].contains("--cap-drop ALL"));
    assert!(calls[1].contains("-e LANG"));
    assert!(!calls[1].contains("GITHUB_TOKEN"), "blocked names are not forwarded");
    assert!(calls.iter().any(|c| c.starts_with("start lifecycle-")));
    assert!(calls.iter().any(|c| c.starts_with("stop -t 1 lifecycle-")));
    assert!(calls.iter().any(|c| c.starts_with("rm -f lifecycle-")));
    assert!(calls.last().unwrap().starts_with("volume rm -f lifecycle-"), "{calls:?}");
}

#[tokio::test]
async fn exec_forwards_env_values_through_the_cli_environment() {
    let h = harness("envfwd", DockerRuntime::new);
    let instance = h.provider.create("a", "p", h.config()).await.unwrap();
    h.provider.start(instance.id).await.unwrap();

    let options = ExecOptions::default().with_env("GREETING", "hello");
    let result = h
        .provider
        .exec(instance.id, "echo \"$GREETING:$PWD\"", &options)
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(
        result.stdout.trim(),
        format!("hello:{}", h.root().display())
    );

    let exec = calls(&h.prefix)
        .into_iter()
        .find(|c| c.starts_with("exec -w"))
        .unwrap();
    assert!(exec.contains("-e GREETING"));
    assert!(!exec.contains("hello"), "values stay off the command line");
}

#[tokio::test]
async fn exec_timeout_reports_124() {
    let h = harness("timeout", DockerRuntime::new);
    let instance = h.provider.create("a", "p", h.config()).await.unwrap();
    h.provider.start(instance.id).await.unwrap();

    let result = h
        .provider
        .exec(instance.id, "sleep 30", &ExecOptions::default().with_timeout_ms(300))
        .await
        .unwrap();
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(result.timed_out);
    assert!(calls(&h.prefix).iter().any(|c| c.starts_with("exec -u 0")), "abort ran in the container");
}

#[tokio::test]
async fn timeout_cleanup_runs_as_the_command_user() {
    let h = harness("abortuser", DockerRuntime::new);
    let instance = h.provider.create("a", "p", h.config()).await.unwrap();
    h.provider.start(instance.id).await.unwrap();

    let options = ExecOptions {
        user: Some("1000".to_string()),
        timeout_ms: Some(300),
        ..Default::default()
    };
    let result = h.provider.exec(instance.id, "sleep 30", &options).await.unwrap();
    assert!(result.timed_out);

    let calls = calls(&h.prefix);
    assert!(calls.iter().any(|c| c.starts_with("exec -u 1000 abortuser-")), "{calls:?}");
    assert!(!calls.iter().any(|c| c.starts_with("exec -u 0")), "{calls:?}");
}

#[tokio::test]
async fn create_args_carry_resource_fields_unchanged() {
    let h = harness("resources", DockerRuntime::new);
    let layer = SandboxConfigOverride {
        allowed_root_directory: Some(h.root().to_path_buf()),
        resources: ResourceOverride {
            memory_mb: Some(768),
            cpus: Some(1.5),
            pids_limit: Some(96),
            disk_mb: Some(2048),
            ..Default::default()
        },
        ..Default::default()
    };
    let config = policy::resolve_override(&SandboxConfig::default(), &layer).unwrap();
    h.provider.create("a", "p", config).await.unwrap();

    let create = calls(&h.prefix)
        .into_iter()
        .find(|c| c.starts_with("create "))
        .unwrap();
    assert!(create.contains("--memory 768m"), "{create}");
    assert!(create.contains("--cpus 1.5"), "{create}");
    assert!(create.contains("--pids-limit 96"), "{create}");
    assert!(create.contains("--storage-opt size=2048m"), "{create}");
}

#[tokio::test]
async fn file_operations_go_through_exec_and_cp() {
    let h = harness("files", DockerRuntime::new);
    let instance = h.provider.create("a", "p", h.config()).await.unwrap();
    h.provider.start(instance.id).await.unwrap();

    h.provider
        .write_file(instance.id, "notes/today.txt", b"written")
        .await
        .unwrap();
    assert_eq!(
        std::fs::read(h.root().join("notes/today.txt")).unwrap(),
        b"written"
    );
    let content = h
        .provider
        .read_file(instance.id, "notes/today.txt")
        .await
        .unwrap();
    assert_eq!(content, b"written");

    let err = h
        .provider
        .read_file(instance.id, "missing.txt")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FILE_NOT_FOUND");

    let host = TempDir::new().unwrap();
    let exported = host.path().join("out.txt");
    h.provider
        .copy_out(instance.id, "notes/today.txt", &exported)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&exported).unwrap(), b"written");

    let imported = host.path().join("in.txt");
    std::fs::write(&imported, b"imported").unwrap();
    h.provider
        .copy_in(instance.id, &imported, "in.txt")
        .await
        .unwrap();
    assert_eq!(std::fs::read(h.root().join("in.txt")).unwrap(), b"imported");
}

#[tokio::test]
async fn resource_usage_combines_stats_and_du() {
    let h = harness("usage", DockerRuntime::new);
    let instance = h.provider.create("a", "p", h.config()).await.unwrap();
    h.provider.start(instance.id).await.unwrap();

    let usage = h.provider.get_resource_usage(instance.id).await.unwrap();
    assert_eq!(usage.memory_mb, 10.0);
    assert_eq!(usage.cpu_percent, 1.5);
    assert_eq!(usage.pids, 2);
    assert!(usage.disk_mb >= 0.0);
}

#[tokio::test]
async fn post_create_command_runs_once() {
    let h = harness("postcreate", DockerRuntime::dev_container);
    let mut config = h.config();
    config.provider = sandbox::ProviderKind::DevContainer;
    config.dev_container.post_create_command = Some("echo created >> .post-create".to_string());

    let instance = h.provider.create("a", "p", config).await.unwrap();
    h.provider.start(instance.id).await.unwrap();
    h.provider.stop(instance.id).await.unwrap();
    h.provider.start(instance.id).await.unwrap();

    let marker = std::fs::read_to_string(h.root().join(".post-create")).unwrap();
    assert_eq!(marker.lines().count(), 1);
    assert_eq!(
        h.provider.get_status(instance.id).await.unwrap(),
        SandboxStatus::Running
    );
}

#[tokio::test]
async fn health_check_queries_the_daemon() {
    let h = harness("health", DockerRuntime::new);
    h.provider.health_check().await.unwrap();
}
