use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const SCRUBBED_ENV: [&str; 8] = [
    "NACWATCH_HOME",
    "NACWATCH_CONFIG_PASSWORD",
    "NACWATCH_API_TOKEN",
    "NACWATCH_ORG_ID",
    "NACWATCH_BASE_URL",
    "NACWATCH_REPORTS_DIR",
    "NACWATCH_DATABASE",
    "NACWATCH_LOOKBACK_DAYS",
];

fn nacwatch(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("nacwatch").unwrap();
    for var in SCRUBBED_ENV {
        cmd.env_remove(var);
    }
    cmd.env("RUST_LOG", "warn").arg("--config-dir").arg(dir);
    cmd
}

#[test]
fn create_key_writes_key_once() {
    let dir = tempdir().unwrap();
    nacwatch(dir.path())
        .arg("create-key")
        .assert()
        .success()
        .stdout(predicate::str::contains("fingerprint"));
    let key = dir.path().join("encryption.key");
    assert_eq!(fs::read(&key).unwrap().len(), 64);

    nacwatch(dir.path()).arg("create-key").assert().failure().code(1);
    assert_eq!(fs::read(&key).unwrap().len(), 64);
}

#[test]
fn init_writes_samples_without_overwriting() {
    let dir = tempdir().unwrap();
    nacwatch(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("vendor.toml"));
    assert!(dir.path().join("vendor.toml").exists());
    assert!(dir.path().join("automation.toml").exists());

    nacwatch(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("already present"));
}

#[test]
fn encrypt_then_decrypt_restores_documents() {
    let dir = tempdir().unwrap();
    nacwatch(dir.path()).arg("init").assert().success();
    nacwatch(dir.path()).arg("create-key").assert().success();
    let vendor = dir.path().join("vendor.toml");
    let original = fs::read_to_string(&vendor).unwrap();

    nacwatch(dir.path())
        .args(["encrypt-config", "--delete-plaintext"])
        .assert()
        .success()
        .stdout(predicate::str::contains("encryption.key"));
    assert!(!vendor.exists());
    let sealed = fs::read(dir.path().join("vendor.toml.enc")).unwrap();
    assert!(sealed.starts_with(b"NWVAULT\0"));
    assert!(!String::from_utf8_lossy(&sealed).contains("org_id"));

    nacwatch(dir.path()).arg("decrypt-config").assert().success();
    assert_eq!(fs::read_to_string(&vendor).unwrap(), original);
}

#[test]
fn wrong_key_exits_with_integrity_code() {
    let dir = tempdir().unwrap();
    nacwatch(dir.path()).arg("init").assert().success();
    nacwatch(dir.path()).arg("create-key").assert().success();
    nacwatch(dir.path())
        .args(["encrypt-config", "--delete-plaintext"])
        .assert()
        .success();

    let other = dir.path().join("other.key");
    nacwatch(dir.path())
        .arg("create-key")
        .arg(&other)
        .assert()
        .success();
    nacwatch(dir.path())
        .arg("--key-file")
        .arg(&other)
        .arg("decrypt-config")
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("integrity"));
    assert!(!dir.path().join("vendor.toml").exists());
}

#[test]
fn sealing_without_a_key_is_a_config_error() {
    let dir = tempdir().unwrap();
    nacwatch(dir.path()).arg("init").assert().success();
    nacwatch(dir.path())
        .arg("encrypt-config")
        .assert()
        .failure()
        .code(2);
    assert!(!dir.path().join("vendor.toml.enc").exists());
}

#[test]
fn health_on_empty_history_reports_no_data() {
    let dir = tempdir().unwrap();
    nacwatch(dir.path()).arg("init").assert().success();
    nacwatch(dir.path())
        .arg("health")
        .assert()
        .success()
        .stdout(predicate::str::contains("no data"));
    nacwatch(dir.path())
        .args(["health", "--json", "--hours", "6"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"no_data\""));
}

#[test]
fn run_once_with_sample_config_fails_validation() {
    let dir = tempdir().unwrap();
    nacwatch(dir.path()).arg("init").assert().success();
    nacwatch(dir.path())
        .arg("run-once")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("api.token"));
    assert!(!dir.path().join("reports").exists());
}

#[test]
fn schedule_hint_prints_cron_lines() {
    let dir = tempdir().unwrap();
    nacwatch(dir.path()).arg("init").assert().success();
    nacwatch(dir.path())
        .arg("schedule-hint")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 8 * * *"))
        .stdout(predicate::str::contains("0 2 * * *"));
}

#[test]
fn history_starts_empty() {
    let dir = tempdir().unwrap();
    nacwatch(dir.path()).arg("init").assert().success();
    nacwatch(dir.path())
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("no runs recorded"));
}

#[test]
fn oversized_windows_are_rejected_before_running() {
    let dir = tempdir().unwrap();
    nacwatch(dir.path()).arg("init").assert().success();
    nacwatch(dir.path())
        .args(["health", "--hours", "4294967295"])
        .assert()
        .failure()
        .code(2);
    nacwatch(dir.path())
        .args(["cleanup", "--history-days", "100000000"])
        .assert()
        .failure()
        .code(2);
    nacwatch(dir.path())
        .args(["health", "--hours", "0"])
        .assert()
        .failure()
        .code(2);
    nacwatch(dir.path())
        .args(["cleanup", "--history-days", "36500"])
        .assert()
        .success()
        .stdout(predicate::str::contains("older than 36500 days"));
}
