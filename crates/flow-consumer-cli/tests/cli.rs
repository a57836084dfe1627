//! End-to-end tests for the flow-consumer binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::time::Duration;

fn flow_consumer() -> Command {
    let mut cmd = Command::cargo_bin("flow-consumer").unwrap();
    cmd.env_remove("FLOW_CONSUMER_CONFIG")
        .env_remove("RUST_LOG")
        .timeout(Duration::from_secs(30));
    cmd
}

#[test]
fn test_help_lists_commands() {
    flow_consumer()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("guaranteed"))
        .stdout(predicate::str::contains("direct"));
}

#[test]
fn test_unprovisioned_queue_prints_remediation() {
    flow_consumer()
        .args([
            "guaranteed",
            "localhost",
            "default",
            "user",
            "--skip-provision",
            "--grace-ms",
            "0",
        ])
        .write_stdin("")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("q_pers_sub"))
        .stdout(predicate::str::contains("Provision the queue"));
}

#[test]
fn test_guaranteed_exits_cleanly_when_input_closes() {
    flow_consumer()
        .args([
            "guaranteed",
            "localhost",
            "default",
            "user",
            "--grace-ms",
            "0",
        ])
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::contains("Press [ENTER] to quit."))
        .stdout(predicate::str::contains("operator input"));
}

#[test]
fn test_direct_exits_cleanly_on_enter() {
    flow_consumer()
        .args(["direct", "localhost", "default", "user", "--grace-ms", "0"])
        .write_stdin("\n")
        .assert()
        .success();
}

#[test]
fn test_invalid_subscription_is_a_configuration_error() {
    flow_consumer()
        .args([
            "direct",
            "localhost",
            "default",
            "user",
            "--subscription",
            "",
        ])
        .write_stdin("")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_missing_config_file_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");

    flow_consumer()
        .arg("--config")
        .arg(&missing)
        .args(["direct", "localhost", "default", "user"])
        .write_stdin("")
        .assert()
        .code(1);
}

#[test]
fn test_config_file_supplies_queue_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow-consumer.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "[queue]\nname = \"q_from_file\"").unwrap();

    flow_consumer()
        .arg("--config")
        .arg(&path)
        .args([
            "guaranteed",
            "localhost",
            "default",
            "user",
            "--skip-provision",
        ])
        .write_stdin("")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("q_from_file"));
}
