#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::unreachable
)]

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use sandbox::{
    ExecOptions, ExecStreamEvent, KILLED_EXIT_CODE, ProviderKind, SandboxConfig, SandboxId,
    SandboxProvider, SandboxStatus,
};
use sandbox_local::{LocalConfig, LocalProvider, local_provider};
use tempfile::TempDir;

fn local_config() -> SandboxConfig {
    SandboxConfig {
        provider: ProviderKind::Local,
        ..Default::default()
    }
}

fn provider(base: &TempDir) -> LocalProvider {
    local_provider(LocalConfig {
        base_dir: base.path().to_path_buf(),
        stop_grace: Duration::from_millis(500),
        ..Default::default()
    })
    .with_host_env(BTreeMap::from([
        ("LANG".to_string(), "C.UTF-8".to_string()),
        ("OPENAI_API_KEY".to_string(), "sk-host".to_string()),
        ("HOST_ONLY".to_string(), "visible-on-host".to_string()),
    ]))
}

async fn running(provider: &LocalProvider) -> SandboxId {
    let instance = provider.create("a", "p", local_config()).await.unwrap();
    provider.start(instance.id).await.unwrap();
    instance.id
}

#[tokio::test]
async fn commands_run_in_the_workspace_directory() {
    let base = TempDir::new().unwrap();
    let provider = provider(&base);
    let instance = provider.create("a", "p", local_config()).await.unwrap();
    assert_eq!(instance.provider, ProviderKind::Local);
    assert!(instance.handle.starts_with(base.path().to_str().unwrap()));
    provider.start(instance.id).await.unwrap();

    let result = provider
        .exec(instance.id, "pwd", &ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stdout.trim(), instance.handle);
}

#[tokio::test]
async fn host_environment_does_not_leak() {
    let base = TempDir::new().unwrap();
    let provider = provider(&base);
    let id = running(&provider).await;

    let result = provider.exec(id, "env", &ExecOptions::default()).await.unwrap();
    assert!(result.stdout.contains("LANG=C.UTF-8"));
    assert!(!result.stdout.contains("sk-host"));
    assert!(!result.stdout.contains("visible-on-host"));
}

#[tokio::test]
async fn wrong_provider_kind_is_rejected() {
    let base = TempDir::new().unwrap();
    let err = provider(&base)
        .create("a", "p", SandboxConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_CONFIG");
}

#[tokio::test]
async fn stop_kills_in_flight_command() {
    let base = TempDir::new().unwrap();
    let provider = provider(&base);
    let id = running(&provider).await;

    let mut stream = provider
        .exec_stream(id, "echo started; sleep 30", &ExecOptions::default())
        .await
        .unwrap();
    let first = stream.next().await.unwrap();
    assert!(matches!(first, ExecStreamEvent::Stdout(_)));

    provider.stop(id).await.unwrap();
    let mut exit = None;
    while let Some(event) = stream.next().await {
        if let ExecStreamEvent::Exit { exit_code, .. } = event {
            exit = Some(exit_code);
        }
    }
    assert_eq!(exit, Some(KILLED_EXIT_CODE));
    assert_eq!(provider.get_status(id).await.unwrap(), SandboxStatus::Stopped);
}

#[tokio::test]
async fn pause_blocks_exec_until_resume() {
    let base = TempDir::new().unwrap();
    let provider = provider(&base);
    let id = running(&provider).await;

    provider.pause(id).await.unwrap();
    let err = provider
        .exec(id, "true", &ExecOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");

    provider.resume(id).await.unwrap();
    let result = provider.exec(id, "echo back", &ExecOptions::default()).await.unwrap();
    assert_eq!(result.stdout.trim(), "back");
}

#[tokio::test]
async fn files_round_trip_through_the_workspace() {
    let base = TempDir::new().unwrap();
    let provider = provider(&base);
    let id = running(&provider).await;

    provider
        .write_file(id, "/workspace/src/lib.rs", b"pub fn f() {}")
        .await
        .unwrap();
    let result = provider
        .exec(id, "cat src/lib.rs", &ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stdout, "pub fn f() {}");
    assert_eq!(
        provider.read_file(id, "src/lib.rs").await.unwrap(),
        b"pub fn f() {}"
    );
    assert_eq!(
        provider.read_file(id, "nope").await.unwrap_err().code(),
        "FILE_NOT_FOUND"
    );
}

#[tokio::test]
async fn copy_handles_directories() {
    let base = TempDir::new().unwrap();
    let provider = provider(&base);
    let id = running(&provider).await;

    let host = TempDir::new().unwrap();
    std::fs::create_dir_all(host.path().join("project/docs")).unwrap();
    std::fs::write(host.path().join("project/docs/readme.md"), "# hi").unwrap();

    provider
        .copy_in(id, &host.path().join("project"), "project")
        .await
        .unwrap();
    let result = provider
        .exec(id, "cat project/docs/readme.md", &ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stdout, "# hi");

    let out = host.path().join("exported");
    provider.copy_out(id, "project", &out).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(out.join("docs/readme.md")).unwrap(),
        "# hi"
    );
}

#[tokio::test]
async fn copy_out_does_not_follow_links_created_in_the_sandbox() {
    let base = TempDir::new().unwrap();
    let provider = provider(&base);
    let id = running(&provider).await;

    let result = provider
        .exec(
            id,
            "mkdir out && echo data > out/a.txt && ln -s / out/host && ln -s . out/loop && ln -s / root",
            &ExecOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0, "{}", result.stderr);

    let host = TempDir::new().unwrap();
    let out = host.path().join("exported");
    provider.copy_out(id, "out", &out).await.unwrap();
    assert_eq!(std::fs::read_to_string(out.join("a.txt")).unwrap(), "data\n");
    assert!(!out.join("host").exists());
    assert!(!out.join("loop").exists());

    let err = provider
        .copy_out(id, "root", &host.path().join("root"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "COPY_FAILED");
}

#[tokio::test]
async fn remove_deletes_the_workspace() {
    let base = TempDir::new().unwrap();
    let provider = provider(&base);
    let id = running(&provider).await;
    let dir = provider.instance(id).await.unwrap().handle;
    assert!(std::path::Path::new(&dir).is_dir());

    provider.remove(id).await.unwrap();
    assert!(!std::path::Path::new(&dir).exists());
    assert!(provider.get_status(id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn resource_usage_counts_running_processes() {
    let base = TempDir::new().unwrap();
    let provider = provider(&base);
    let id = running(&provider).await;
    provider.write_file(id, "blob", &[0u8; 4096]).await.unwrap();

    let idle = provider.get_resource_usage(id).await.unwrap();
    assert_eq!(idle.pids, 0);
    assert!(idle.disk_mb > 0.0);

    let mut stream = provider
        .exec_stream(id, "echo up; sleep 5", &ExecOptions::default())
        .await
        .unwrap();
    stream.next().await.unwrap();
    let busy = provider.get_resource_usage(id).await.unwrap();
    assert!(busy.pids >= 1, "{busy:?}");
    provider.stop(id).await.unwrap();
}

#[tokio::test]
async fn health_check_creates_base_dir() {
    let base = TempDir::new().unwrap();
    let provider = local_provider(LocalConfig {
        base_dir: base.path().join("nested/base"),
        ..Default::default()
    });
    provider.health_check().await.unwrap();
    assert!(base.path().join("nested/base").is_dir());
}
