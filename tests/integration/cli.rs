use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_describes_the_supervisor() {
    let mut cmd = Command::cargo_bin("rinit").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("process-1 init"))
        .stdout(predicate::str::contains("--sys"))
        .stdout(predicate::str::contains("--autoreload"));
}

#[test]
fn version_prints_package_version() {
    let mut cmd = Command::cargo_bin("rinit").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn unknown_flag_fails_with_usage() {
    let mut cmd = Command::cargo_bin("rinit").unwrap();
    cmd.arg("--definitely-not-a-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--definitely-not-a-flag"));
}
