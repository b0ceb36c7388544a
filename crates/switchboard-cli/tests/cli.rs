use assert_cmd::Command;
use predicates::str::contains;
use std::path::Path;
use tempfile::TempDir;

const SCENARIO: &str = r#"
connection = "jabber/alice"

[[contacts]]
id = "bob@example.org"
handle = 2
name = "Bob"

[[channels]]
path = "/text/bob"
kind = "text"
handle = 2
messages = ["hi"]

[[requests]]
kind = "streamed_media"
handle = 2
"#;

fn switchboard(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("switchboard"));
    cmd.env("SWITCHBOARD_CONFIG", home.join("config.toml"));
    cmd
}

fn write_scenario(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("scenario.toml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_cli_help() {
    let dir = TempDir::new().unwrap();
    switchboard(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Switchboard"));
}

#[test]
fn test_cli_version() {
    let dir = TempDir::new().unwrap();
    switchboard(dir.path()).arg("--version").assert().success();
}

#[test]
fn test_config_prints_defaults() {
    let dir = TempDir::new().unwrap();
    switchboard(dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(contains("[dispatcher]"))
        .stdout(contains("outgoing_text = \"immediate\""));
}

#[test]
fn test_config_reads_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        "[dispatcher]\noutgoing_text = \"await_first_message\"\n",
    )
    .unwrap();
    switchboard(dir.path())
        .args(["--format", "json", "config"])
        .assert()
        .success()
        .stdout(contains("\"await_first_message\""));
}

#[test]
fn test_simulate_text() {
    let dir = TempDir::new().unwrap();
    let scenario = write_scenario(&dir, SCENARIO);
    switchboard(dir.path())
        .arg("simulate")
        .arg(&scenario)
        .assert()
        .success()
        .stdout(contains("filter-channel"))
        .stdout(contains("/text/bob"))
        .stdout(contains("2 channel(s) claimed"));
}

#[test]
fn test_simulate_json() {
    let dir = TempDir::new().unwrap();
    let scenario = write_scenario(&dir, SCENARIO);
    switchboard(dir.path())
        .args(["--format", "json", "simulate"])
        .arg(&scenario)
        .assert()
        .success()
        .stdout(contains("\"event\":\"claimed\""))
        .stdout(contains("\"kind\":\"streamed_media\""));
}

#[test]
fn test_simulate_without_claiming() {
    let dir = TempDir::new().unwrap();
    let scenario = write_scenario(&dir, SCENARIO);
    switchboard(dir.path())
        .arg("simulate")
        .arg(&scenario)
        .arg("--no-claim")
        .assert()
        .success()
        .stdout(contains("dispatch-channel"))
        .stdout(contains("0 channel(s) claimed"));
}

#[test]
fn test_simulate_missing_scenario() {
    let dir = TempDir::new().unwrap();
    switchboard(dir.path())
        .arg("simulate")
        .arg(dir.path().join("missing.toml"))
        .assert()
        .failure()
        .stderr(contains("Failed to read scenario"));
}

#[test]
fn test_simulate_rejects_invalid_scenario() {
    let dir = TempDir::new().unwrap();
    let scenario = write_scenario(&dir, "[[channels]]\npath = \"/a\"\nkind = \"fax\"\n");
    switchboard(dir.path())
        .arg("simulate")
        .arg(&scenario)
        .assert()
        .failure();
}
