//! Integration tests for the `dplink` CLI binary.
//!
//! Every test runs against a temporary home directory and profile catalog,
//! so nothing touches the user's real configuration or keyring.
#![allow(clippy::unwrap_used)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

const SWITCH: &str = "
name: Simple switch
primary_entity:
  entity: switch
  dps:
    - {id: 1, name: switch, type: boolean}
";

const DIMMER: &str = "
name: Dimmer
legacy_type: dimmer
primary_entity:
  entity: light
  dps:
    - {id: 1, name: switch, type: boolean}
    - {id: 2, name: brightness, type: integer, range: {min: 10, max: 1000}}
";

const BROKEN: &str = "
name: ''
primary_entity:
  entity: switch
  dps:
    - {id: 1, name: switch, type: boolean}
";

const CONFIG: &str = r#"
[devices.lamp]
device_id = "bf0123456789abcdef"
address = "192.168.1.20"
protocol = "3.3"
"#;

// ── Helpers ─────────────────────────────────────────────────────────

/// A scratch home with a profile catalog under `profiles/`.
struct Sandbox {
    home: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let home = tempfile::tempdir().unwrap();
        let profiles = home.path().join("profiles");
        std::fs::create_dir_all(&profiles).unwrap();
        std::fs::write(profiles.join("switch.yaml"), SWITCH).unwrap();
        std::fs::write(profiles.join("dimmer.yaml"), DIMMER).unwrap();
        Self { home }
    }

    fn path(&self) -> &Path {
        self.home.path()
    }

    fn config_file(&self) -> std::path::PathBuf {
        self.path().join("config").join("dplink").join("config.toml")
    }

    fn write_config(&self, text: &str) {
        let path = self.config_file();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    /// Build a command for the `dplink` binary with env isolation.
    fn cmd(&self) -> assert_cmd::Command {
        let mut cmd = cargo_bin_cmd!("dplink");
        cmd.env("HOME", self.path())
            .env("XDG_CONFIG_HOME", self.path().join("config"))
            .env("XDG_DATA_HOME", self.path().join("data"))
            .env("DPLINK_PROFILES_DIR", self.path().join("profiles"))
            .env_remove("DPLINK_OUTPUT")
            .env_remove("RUST_LOG");
        cmd
    }
}

/// Concatenate stdout + stderr from a command output for flexible matching.
fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}")
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let sandbox = Sandbox::new();
    let output = sandbox.cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2), "Expected exit code 2");
    let text = combined_output(&output);
    assert!(text.contains("Usage"), "Expected 'Usage' in output:\n{text}");
}

#[test]
fn test_help_lists_commands() {
    Sandbox::new()
        .cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("profiles")
                .and(predicate::str::contains("detect"))
                .and(predicate::str::contains("config")),
        );
}

#[test]
fn test_completions_bash() {
    Sandbox::new()
        .cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dplink"));
}

// ── Profiles ────────────────────────────────────────────────────────

#[test]
fn test_profiles_list_plain_is_sorted() {
    Sandbox::new()
        .cmd()
        .args(["profiles", "list", "-o", "plain"])
        .assert()
        .success()
        .stdout("dimmer\nswitch\n");
}

#[test]
fn test_profiles_list_json() {
    let output = Sandbox::new()
        .cmd()
        .args(["profiles", "list", "--output", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let list = value.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["config_id"], "dimmer");
    assert_eq!(list[0]["datapoints"], 2);
    assert_eq!(list[0]["legacy_type"], "dimmer");
}

#[test]
fn test_profiles_show_table() {
    Sandbox::new()
        .cmd()
        .args(["profiles", "show", "dimmer", "--color", "never"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Dimmer (dimmer)")
                .and(predicate::str::contains("brightness"))
                .and(predicate::str::contains("10..1000")),
        );
}

#[test]
fn test_profiles_show_unknown() {
    Sandbox::new()
        .cmd()
        .args(["profiles", "show", "toaster"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("toaster"));
}

#[test]
fn test_profiles_validate_reports_bad_file() {
    let sandbox = Sandbox::new();
    let broken = sandbox.path().join("broken.yaml");
    std::fs::write(&broken, BROKEN).unwrap();

    sandbox
        .cmd()
        .args(["profiles", "validate"])
        .arg(&broken)
        .assert()
        .code(9)
        .stderr(predicate::str::contains("profile name is empty"));
}

#[test]
fn test_profiles_validate_directory() {
    Sandbox::new()
        .cmd()
        .args(["profiles", "validate", "-o", "plain"])
        .assert()
        .success()
        .stderr(predicate::str::contains("2 profile(s) OK"));
}

// ── Detect ──────────────────────────────────────────────────────────

#[test]
fn test_detect_ranks_best_first() {
    let sandbox = Sandbox::new();
    let input = sandbox.path().join("reply.json");
    std::fs::write(&input, r#"{"devId": "bf01", "dps": {"1": true, "2": 500}}"#).unwrap();

    sandbox
        .cmd()
        .args(["detect", "-o", "plain"])
        .arg(&input)
        .assert()
        .success()
        .stdout("dimmer\nswitch\n");
}

#[test]
fn test_detect_from_stdin_best_only() {
    let output = Sandbox::new()
        .cmd()
        .args(["detect", "-", "--best", "-o", "json-compact"])
        .write_stdin(r#"{"1": true, "2": 500}"#)
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value[0]["config_id"], "dimmer");
    assert_eq!(value[0]["score"], 100);
    assert_eq!(value.as_array().unwrap().len(), 1);
}

#[test]
fn test_detect_no_match() {
    Sandbox::new()
        .cmd()
        .args(["detect", "-"])
        .write_stdin(r#"{"7": "on"}"#)
        .assert()
        .code(4)
        .stderr(predicate::str::contains("7=\"on\""));
}

#[test]
fn test_detect_rejects_non_object() {
    Sandbox::new()
        .cmd()
        .args(["detect", "-"])
        .write_stdin("42")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("a number"));
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn test_config_path_uses_xdg() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dplink").and(predicate::str::contains("config.toml")));
}

#[test]
fn test_set_key_plaintext_then_show_redacts() {
    let sandbox = Sandbox::new();
    sandbox.write_config(CONFIG);

    sandbox
        .cmd()
        .args(["config", "set-key", "lamp", "--stdin", "--plaintext", "-y"])
        .write_stdin("0123456789abcdef\n")
        .assert()
        .success();

    let saved = std::fs::read_to_string(sandbox.config_file()).unwrap();
    assert!(saved.contains("0123456789abcdef"), "{saved}");

    sandbox
        .cmd()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("[devices.lamp]")
                .and(predicate::str::contains("****"))
                .and(predicate::str::contains("0123456789abcdef").not()),
        );
}

#[test]
fn test_set_key_unknown_device() {
    let sandbox = Sandbox::new();
    sandbox.write_config(CONFIG);

    sandbox
        .cmd()
        .args(["config", "set-key", "heater", "--stdin", "--plaintext"])
        .write_stdin("0123456789abcdef\n")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("heater"));
}
