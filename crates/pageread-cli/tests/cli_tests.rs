//! Integration tests for the `pageread` binary's argument handling and
//! error surfacing. These avoid any path that needs real model
//! weights (`parse`/`ensure-ready` against a live model id), since no
//! snapshot is available in a test environment; they instead exercise
//! help text, input validation, and failure modes that don't require
//! network or model access.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pageread"))
}

#[test]
fn top_level_help_lists_all_subcommands() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("parse"))
        .stdout(predicate::str::contains("ensure-ready"))
        .stdout(predicate::str::contains("verify-offline"));
}

#[test]
fn parse_help_lists_dump_diagnostics_flag() {
    cli()
        .arg("parse")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--dump-diagnostics"));
}

#[test]
fn parse_rejects_a_nonexistent_input_file() {
    cli()
        .arg("parse")
        .arg("/nonexistent/path/does-not-exist.png")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read input file"));
}

#[test]
fn parse_rejects_an_unparseable_config_file() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.json");
    fs::write(&config_path, "not valid json").unwrap();
    let input_path = dir.path().join("input.png");
    fs::write(&input_path, [0u8; 4]).unwrap();

    cli()
        .arg("--config")
        .arg(&config_path)
        .arg("parse")
        .arg(&input_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse config file"));
}

#[test]
fn verify_offline_reports_missing_state_rather_than_hanging() {
    let dir = TempDir::new().unwrap();
    cli()
        .env("HOME", dir.path())
        .arg("verify-offline")
        .assert()
        .failure();
}
