//! Integration tests for the Docker sandbox.
//!
//! These tests need a running Docker daemon and pull a small public image.
//! Run with: cargo test --test docker_integration -- --ignored

use std::path::PathBuf;

use swe_trials::config::SandboxSettings;
use swe_trials::sandbox::DockerSandboxProvider;
use swe_trials::{Instance, Sandbox, SandboxProvider};
use tempfile::TempDir;

const IMAGE: &str = "python:3.12-slim";

fn instance() -> Instance {
    let mut instance = Instance::new("docker__smoke-1", "docker/smoke", "1.0");
    instance.instance_image_key = IMAGE.to_string();
    instance
}

fn settings() -> SandboxSettings {
    SandboxSettings {
        workdir: "/tmp".to_string(),
        ..Default::default()
    }
}

fn run_dir(temp: &TempDir) -> PathBuf {
    let dir = temp.path().join("bench/docker__smoke-1/1");
    std::fs::create_dir_all(&dir).expect("create run dir");
    dir
}

#[tokio::test]
#[ignore] // Run with: cargo test --test docker_integration -- --ignored
async fn test_exec_and_write_file() {
    let temp = TempDir::new().expect("tempdir");
    let provider = DockerSandboxProvider::new(settings()).expect("docker daemon");

    let sandbox = provider
        .create_and_start(&instance(), "docker__smoke-1-1", &run_dir(&temp))
        .await
        .expect("sandbox should start");

    let result = sandbox
        .exec("echo out; echo err >&2; exit 3", &[])
        .await
        .expect("exec");
    assert_eq!(result.exit_code, 3);
    assert!(result.output.contains("out"));
    assert!(result.output.contains("err"));

    let env = vec![("GREETING".to_string(), "hello".to_string())];
    let result = sandbox.exec("echo $GREETING; pwd", &env).await.expect("exec");
    assert_eq!(result.output, "hello\n/tmp\n");

    sandbox
        .write_file("payload", "/opt/agent/config/file.txt")
        .await
        .expect("write_file");
    let result = sandbox
        .exec("cat /opt/agent/config/file.txt", &[])
        .await
        .expect("exec");
    assert_eq!(result.output, "payload");

    sandbox.teardown().await;
    sandbox.teardown().await;
}

#[tokio::test]
#[ignore]
async fn test_mounts_are_created_on_host() {
    let temp = TempDir::new().expect("tempdir");
    let provider = DockerSandboxProvider::new(settings()).expect("docker daemon");
    let dir = run_dir(&temp);

    let sandbox = provider
        .create_and_start(&instance(), "docker__smoke-1-1", &dir)
        .await
        .expect("sandbox should start");

    sandbox
        .exec("echo cached > /root/.cache/kwaak/marker", &[])
        .await
        .expect("exec");
    sandbox.teardown().await;

    assert!(dir.join("container").is_dir());
    assert!(dir.join("logs").is_dir());
    let marker = temp.path().join("bench/cache/docker_smoke/1.0/marker");
    assert_eq!(
        std::fs::read_to_string(marker).expect("marker written through mount"),
        "cached\n"
    );
}
