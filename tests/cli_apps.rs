use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

fn harbor(db_dir: &Path, args: &[&str]) -> Output {
    let db = db_dir.join("state").join("harbor.db");
    Command::new(env!("CARGO_BIN_EXE_harbor-updater"))
        .args(args)
        .env("HARBOR_DB_URL", format!("sqlite://{}", db.display()))
        .env("HARBOR_ENDPOINT", "test-node")
        .env("HARBOR_SELF_CONTAINER_ID", "none")
        .env("HARBOR_BACKUP_DIR", db_dir.join("backups"))
        .env("HARBOR_CREDENTIALS_FILE", db_dir.join("credentials.json"))
        .env("RUST_LOG", "warn")
        .env_remove("HARBOR_APP_TEMPLATES")
        .output()
        .expect("failed to run harbor-updater")
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be json")
}

#[test]
fn apps_add_then_list_round_trips_through_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("svc.jar");
    std::fs::write(&artifact, b"hello").unwrap();

    let body = serde_json::json!({
        "name": "svc",
        "local_path": artifact.to_string_lossy(),
        "download_url": "http://127.0.0.1:9/svc.jar",
        "auto_restart": true,
    })
    .to_string();
    let created = stdout_json(&harbor(dir.path(), &["apps", "add", &body]));
    assert_eq!(created["name"], "svc");
    assert_eq!(created["checksum"], "5d41402abc4b2a76b9719d911017c592");
    let id = created["id"].as_i64().unwrap();
    assert!(id > 0);

    let listed = stdout_json(&harbor(dir.path(), &["apps", "list"]));
    let apps = listed.as_array().unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0]["id"].as_i64(), Some(id));

    let history = stdout_json(&harbor(dir.path(), &["history", &id.to_string()]));
    assert_eq!(history.as_array().map(Vec::len), Some(0));

    let removed = stdout_json(&harbor(dir.path(), &["apps", "remove", &id.to_string()]));
    assert_eq!(removed["deleted"].as_i64(), Some(id));
    let listed = stdout_json(&harbor(dir.path(), &["apps", "list"]));
    assert_eq!(listed.as_array().map(Vec::len), Some(0));
}

#[test]
fn missing_app_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let output = harbor(dir.path(), &["history", "404"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[not-found]"));
}

#[test]
fn malformed_arguments_exit_with_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = harbor(dir.path(), &["rollback", "1"]);
    assert_eq!(output.status.code(), Some(2));
}
