//! End-to-end tests for the maestro binary
//!
//! These spawn the built binary and are gated behind the `integration`
//! feature flag. Run with:
//!
//! ```sh
//! cargo test -p maestro-cli --features integration
//! ```

#![cfg(feature = "integration")]

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

/// Run maestro with an isolated user and project configuration
fn maestro(config_home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_maestro"))
        .args(args)
        .env("XDG_CONFIG_HOME", config_home.join("user"))
        .env("MAESTRO_PROJECT_CONFIG_DIR", config_home.join("project"))
        .output()
        .expect("Failed to run maestro")
}

fn write_project_config(config_home: &Path, contents: &str) {
    let dir = config_home.join("project");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.toml"), contents).unwrap();
}

#[test]
fn maestro_help_lists_commands() {
    let home = TempDir::new().unwrap();
    let output = maestro(home.path(), &["--help"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Agent orchestration control plane"));
    assert!(stdout.contains("run"));
    assert!(stdout.contains("dispatch"));
    assert!(stdout.contains("config"));
}

#[test]
fn config_show_merges_project_file() {
    let home = TempDir::new().unwrap();
    write_project_config(home.path(), "[spawner]\nmax_instances = 3\n");

    let output = maestro(home.path(), &["config", "show"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("max_instances = 3"));
    assert!(stdout.contains("max_queue_size = 1000"));
}

#[test]
fn dispatch_prints_aggregated_output() {
    let home = TempDir::new().unwrap();
    write_project_config(home.path(), "[spawner]\nspawn_delay_ms = 0\n");

    let output = maestro(
        home.path(),
        &[
            "dispatch",
            "--task-type",
            "code_review",
            "--description",
            "Review the parser",
            "--input",
            "let x = y.unwrap();",
            "--require",
            "code_review",
            "--fan-out",
            "2",
        ],
    );

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["metadata"]["strategy"], "consolidate_reviews");
    assert_eq!(value["results"].as_array().unwrap().len(), 2);
}

#[test]
fn run_with_duration_saves_snapshot() {
    let home = TempDir::new().unwrap();
    let snapshot = home.path().join("state.json");
    write_project_config(
        home.path(),
        &format!(
            "[spawner]\nspawn_delay_ms = 0\n\n[state]\nsnapshot_path = {:?}\n",
            snapshot.display().to_string()
        ),
    );

    let output = maestro(home.path(), &["run", "--duration-secs", "1"]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("coordinator-main"));
    assert!(snapshot.exists());
}
