use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn prints_version() {
    Command::cargo_bin("lurker")
        .expect("lurker binary")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_help() {
    Command::cargo_bin("lurker")
        .expect("lurker binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("lurker").and(predicate::str::contains("--version")));
}
