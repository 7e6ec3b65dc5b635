#![cfg(unix)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("tasks.yml");
    let content = format!(
        "config:\n  shell: sh\n  update-interval: 20\n  log-path: {}\n{}",
        dir.path().join("logs").display(),
        body
    );
    fs::write(&path, content).unwrap();
    path
}

fn taskline(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("taskline").unwrap();
    cmd.arg("--cache-path").arg(dir.path().join("cache.json"));
    cmd
}

#[test]
fn test_successful_run_exits_zero_and_saves_cache() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        "tasks:\n  - name: hello\n    cmd: echo hello\n  - name: pair\n    parallel-tasks:\n      - cmd: echo a\n      - cmd: echo b\n",
    );

    taskline(&dir).arg(&config).assert().success();

    let cache = fs::read_to_string(dir.path().join("cache.json")).unwrap();
    assert!(cache.contains("echo hello"));
    assert!(cache.contains("updated_at"));
    assert!(dir.path().join("logs").is_dir());
}

#[test]
fn test_failure_exits_one_with_report() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        "tasks:\n  - name: broken\n    cmd: echo boom >&2; exit 4\n",
    );

    taskline(&dir)
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("broken"))
        .stderr(predicate::str::contains("return code: 4"))
        .stderr(predicate::str::contains("boom"));
}

#[test]
fn test_no_cache_leaves_no_file() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "tasks:\n  - cmd: echo quick\n");

    taskline(&dir).arg(&config).arg("--no-cache").assert().success();
    assert!(!dir.path().join("cache.json").exists());
}

#[test]
fn test_invalid_config_exits_two() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "tasks:\n  - name: nothing\n");

    taskline(&dir)
        .arg(&config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("nothing"));
}

#[test]
fn test_missing_config_exits_two() {
    let dir = TempDir::new().unwrap();
    taskline(&dir)
        .arg(dir.path().join("absent.yml"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cannot read"));
}
