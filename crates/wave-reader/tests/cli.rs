//! End-to-end tests for the wave-reader binary.
//!
//! Every command runs against a temp config file so a real user config is
//! never read.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let config = dir.path().join("config.toml");
        std::fs::write(
            &config,
            "[general]\nlog_level = \"warn\"\n\n[transport]\ninjection_delay_ms = 5\n",
        )
        .expect("write config");
        Self { dir, config }
    }

    fn input(&self, name: &str, lines: &[&str]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, lines.join("\n")).expect("write input");
        path
    }

    #[allow(deprecated)]
    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("wave-reader").expect("wave-reader binary should be built");
        cmd.env_remove("RUST_LOG");
        cmd.env("WAVE_READER_CONFIG", &self.config);
        cmd
    }
}

fn json_lines(stdout: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("stdout line is JSON"))
        .collect()
}

fn arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

#[test]
fn dispatch_start_injects_and_reports_going() {
    let ws = Workspace::new();
    let input = ws.input("in.jsonl", &[r#"{"name":"start","from":"popup","options":{"selector":"p"}}"#]);

    let output = ws
        .cmd()
        .args(["dispatch", "--tab", "1=https://example.com", "--input", arg(&input)])
        .output()
        .expect("run");
    assert!(output.status.success());

    let lines = json_lines(&output.stdout);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["success"], true);
    assert_eq!(lines[0]["going"], true);
    assert_eq!(lines[0]["tabId"], 1);
}

#[test]
fn dispatch_stop_on_restricted_tab_is_already_stopped() {
    let ws = Workspace::new();
    let input = ws.input("in.jsonl", &[r#"{"name":"stop","from":"popup"}"#]);

    ws.cmd()
        .args(["dispatch", "--tab", "1=chrome://settings", "--input", arg(&input)])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""alreadyStopped":true"#))
        .stdout(predicate::str::contains(r#""going":false"#));
}

#[test]
fn dispatch_reports_unknown_and_malformed_lines() {
    let ws = Workspace::new();
    let input = ws.input(
        "in.jsonl",
        &[r#"{"name":"no-such-thing"}"#, "not json", r#"{"type":"HEALTH-CHECK"}"#],
    );

    let output = ws
        .cmd()
        .args(["dispatch", "--input", arg(&input)])
        .output()
        .expect("run");
    assert!(output.status.success());

    let lines = json_lines(&output.stdout);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["error"], "Unknown message type");
    assert!(lines[1]["error"].as_str().unwrap().starts_with("Invalid JSON"));
    assert_eq!(lines[2]["success"], true);
    assert!(lines[2]["sessionId"].as_str().unwrap().starts_with("session_"));
}

#[test]
fn dispatch_reads_stdin() {
    let ws = Workspace::new();
    ws.cmd()
        .arg("dispatch")
        .write_stdin("{\"name\":\"initialize\",\"from\":\"popup\"}\n")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""connectionEvents":1"#));
}

#[test]
fn dispatch_rejects_unknown_sender_tab() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["dispatch", "--from-tab", "9"])
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--from-tab 9"));
}

#[test]
fn route_queued_drains_critical_first() {
    let ws = Workspace::new();
    let input = ws.input(
        "route.jsonl",
        &[
            r#"{"type":"TAB_SWITCHED","source":"test","priority":"low"}"#,
            r#"{"type":"SETTINGS_CHANGED","source":"test","priority":"critical"}"#,
        ],
    );

    let output = ws
        .cmd()
        .args(["route", "--queued", "--stats", "--input", arg(&input)])
        .output()
        .expect("run");
    assert!(output.status.success());

    let lines = json_lines(&output.stdout);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["targetComponent"], "settings");
    assert_eq!(lines[1]["targetComponent"], "wave-tabs");
    assert_eq!(lines[2]["stats"]["totalMessages"], 2);
}

#[test]
fn route_direct_send_falls_back_to_main_app() {
    let ws = Workspace::new();
    ws.cmd()
        .arg("route")
        .write_stdin("{\"type\":\"SOMETHING_ELSE\",\"source\":\"test\"}\n")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""targetComponent":"main-app""#));
}

#[test]
fn config_prints_effective_toml() {
    let ws = Workspace::new();
    ws.cmd()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[router]"))
        .stdout(predicate::str::contains("injection_delay_ms = 5"));
}

#[test]
fn config_path_prints_explicit_file() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["config", "--path", "--config", arg(&ws.config)])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn missing_explicit_config_fails() {
    let ws = Workspace::new();
    let missing = ws.dir.path().join("nope.toml");
    ws.cmd()
        .args(["config", "--config", arg(&missing)])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}
