//! Runs the `modweave` binary against a temporary data directory.

use modweave_core::config::{ActiveSource, ContentRoot, Settings};
use modweave_worker::{InProcessExecutor, Worker};
use std::path::Path;
use std::process::{Command, Output};
use std::sync::Arc;
use std::time::Duration;

fn modweave(data_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_modweave"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn test_malformed_settings_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("settings.json"), "{ \"roots\": [").unwrap();

    let out = modweave(dir.path(), &["scan", "--local"]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("is not a valid settings file"), "{stderr}");
    assert!(!stderr.contains("No configuration found"), "{stderr}");

    let out = modweave(dir.path(), &["status"]);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Configuration: Invalid"), "{stdout}");
}

#[test]
fn test_missing_settings_ask_for_init() {
    let dir = tempfile::tempdir().unwrap();
    let out = modweave(dir.path(), &["scan", "--local"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Run 'modweave init' first"));
}

#[tokio::test]
async fn test_local_scan_covers_enabled_roots_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    for (id, enabled) in [("game", true), ("off", false)] {
        let path = dir.path().join(id);
        std::fs::create_dir_all(path.join("events")).unwrap();
        std::fs::write(path.join("events/a.txt"), "a = yes").unwrap();
        settings.roots.push(ContentRoot {
            id: id.to_string(),
            path,
            base: id == "game",
        });
        settings.load_order.push(ActiveSource {
            id: id.to_string(),
            enabled,
        });
    }
    settings.save(&dir.path().join("settings.json")).unwrap();

    // A running worker owns the store; the local scan only reads it.
    let executor = Arc::new(InProcessExecutor::new(Duration::from_secs(5)));
    let _worker = Worker::start(&settings, dir.path(), executor).await.unwrap();

    let out = modweave(dir.path(), &["scan", "--local"]);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(stdout.contains("game: "), "{stdout}");
    assert!(!stdout.contains("off:"), "{stdout}");
}
