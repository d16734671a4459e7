//! Integration tests for the `fie` binary's offline subcommands.

use assert_cmd::Command;
use predicates::prelude::*;

fn fie() -> Command {
    let mut cmd = Command::cargo_bin("fie").expect("binary built");
    cmd.env_remove("RUST_LOG").env_remove("FIE_TOPOLOGY");
    cmd
}

#[test]
fn test_init_topology_prints_sample() {
    fie()
        .arg("init-topology")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"hosts\""))
        .stdout(predicate::str::contains("\"cloud\""))
        .stdout(predicate::str::contains("\"driver\""));
}

#[test]
fn test_init_then_validate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("topology.json");

    fie()
        .arg("init-topology")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote sample topology"));

    fie()
        .arg("validate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"))
        .stdout(predicate::str::contains("192.168.13.0/24"));
}

#[test]
fn test_init_refuses_existing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("topology.json");
    std::fs::write(&path, "{}").expect("seed");

    fie()
        .arg("init-topology")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
}

#[test]
fn test_validate_reports_bad_topology() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("topology.json");
    std::fs::write(
        &path,
        r#"{"hosts": [{"name": "fog", "tier": "fog", "pid": 1}, {"name": "fog", "tier": "cloud", "pid": 2}]}"#,
    )
    .expect("write");

    fie()
        .arg("validate")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate host name"));
}

#[test]
fn test_validate_json_format() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("topology.json");
    fie().arg("init-topology").arg(&path).assert().success();

    let output = fie()
        .args(["--format", "json", "validate"])
        .arg(&path)
        .output()
        .expect("runs");

    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(parsed["hosts"][1], "fog");
}

#[test]
fn test_up_without_topology_file_fails() {
    fie()
        .args(["up", "--topology", "/nonexistent/fie.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("loading /nonexistent/fie.json"));
}
