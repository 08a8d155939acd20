use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("tidepool").unwrap();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_version() {
    let mut cmd = Command::cargo_bin("tidepool").unwrap();
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("tidepool"));
}

#[test]
fn test_run_help_shows_session_flags() {
    let mut cmd = Command::cargo_bin("tidepool").unwrap();
    cmd.args(["run", "--help"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("--session"))
        .stdout(predicate::str::contains("--region"));
}

#[test]
fn test_end_session_requires_session() {
    let mut cmd = Command::cargo_bin("tidepool").unwrap();
    cmd.args(["run", "--end-session", "true"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--session"));
}

#[test]
fn test_unknown_subcommand_fails() {
    let mut cmd = Command::cargo_bin("tidepool").unwrap();
    cmd.arg("definitely-not-a-subcommand");
    cmd.assert().failure();
}
