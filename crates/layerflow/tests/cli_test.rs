#![allow(deprecated)] // TODO: cargo_bin → cargo_bin_cmd! へ移行

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn layerflow() -> Command {
    let mut cmd = Command::cargo_bin("layerflow").unwrap();
    cmd.env_remove("LAYERFLOW_CONFIG_PATH");
    cmd
}

/// CLIヘルプが正しく表示されることを確認
#[test]
fn test_cli_help() {
    layerflow()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("export"))
        .stdout(predicate::str::contains("import-stages"))
        .stdout(predicate::str::contains("gc"));
}

#[test]
fn test_cli_version() {
    layerflow()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("layerflow"));
}

#[test]
fn test_invalid_command() {
    layerflow().arg("launch").assert().failure();
}

#[test]
fn test_build_help() {
    layerflow()
        .args(["build", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[TARGETS]"))
        .stdout(predicate::str::contains("--introspect-error"));
}

#[test]
fn test_export_help() {
    layerflow()
        .args(["export", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<REPO>"))
        .stdout(predicate::str::contains("--tag"))
        .stdout(predicate::str::contains("--with-stages"));
}

#[test]
fn test_import_stages_help() {
    layerflow()
        .args(["import-stages", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--all"));
}

#[test]
fn test_gc_help() {
    layerflow()
        .args(["gc", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dangling"))
        .stdout(predicate::str::contains("--cache-version"))
        .stdout(predicate::str::contains("--orphans"))
        .stdout(predicate::str::contains("--git-commits"))
        .stdout(predicate::str::contains("--dry-run"));
}

/// validate はDockerなしで動く
#[test]
fn test_validate_manifest() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("layerflow.kdl"),
        r#"
project "shop"
image "backend" {
    from "alpine:3.20"
    shell { install "echo hi" }
}
"#,
    )
    .unwrap();

    layerflow()
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("shop"))
        .stdout(predicate::str::contains("backend"));
}

#[test]
fn test_validate_with_config_flag() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.kdl");
    fs::write(
        &path,
        r#"
project "shop"
image "worker" {
    from "alpine:3.20"
}
"#,
    )
    .unwrap();

    layerflow()
        .arg("--config")
        .arg(&path)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("worker"));
}

#[test]
fn test_validate_missing_artifact() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("layerflow.kdl"),
        r#"
project "shop"
image "web" {
    from "alpine"
    import "missing" after="install" { add "/out" }
}
"#,
    )
    .unwrap();

    layerflow()
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing"));
}
