//! End-to-end CLI tests for the doifetch binary.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use doifetch_core::{Database, Doi, SqliteSink};
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

/// Command isolated from the user's config file and working directory.
fn doifetch(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("doifetch").unwrap();
    cmd.current_dir(home.path())
        .env("XDG_CONFIG_HOME", home.path().join("config"))
        .env_remove("RUST_LOG");
    cmd
}

fn write_config(home: &TempDir, contents: &str) {
    let dir = home.path().join("config").join("doifetch");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("config.toml"), contents).unwrap();
}

fn mock_config(server: &MockServer, db: &Path) -> String {
    format!(
        "doi_org_base_url = \"{uri}\"\n\
         unpaywall_base_url = \"{uri}\"\n\
         email = \"team@example.org\"\n\
         min_interval_ms = 0\n\
         check_robots = false\n\
         database = \"{db}\"\n",
        uri = server.uri(),
        db = db.display()
    )
}

#[test]
fn test_binary_help_displays_usage() {
    let home = TempDir::new().unwrap();
    doifetch(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Resolve DOIs to full-text documents"))
        .stdout(predicate::str::contains("--min-interval-ms"));
}

#[test]
fn test_binary_version_displays_version() {
    let home = TempDir::new().unwrap();
    doifetch(&home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("doifetch"));
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    let home = TempDir::new().unwrap();
    doifetch(&home)
        .arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_binary_concurrency_out_of_range_rejected() {
    let home = TempDir::new().unwrap();
    doifetch(&home)
        .args(["-c", "0", "10.1234/x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("concurrency"));
}

#[test]
fn test_binary_empty_stdin_runs_nothing() {
    let home = TempDir::new().unwrap();
    doifetch(&home)
        .args(["--email", "team@example.org"])
        .write_stdin("")
        .assert()
        .success()
        .stderr(predicate::str::contains("run complete"));
}

#[test]
fn test_binary_invalid_doi_is_skipped_not_fatal() {
    let home = TempDir::new().unwrap();
    doifetch(&home)
        .args([
            "--email",
            "team@example.org",
            "--database",
            "out.db",
            "definitely-not-a-doi",
        ])
        .assert()
        .success()
        .stderr(predicate::str::contains("skipping invalid DOI"));
    assert!(home.path().join("out.db").exists());
}

#[test]
fn test_binary_without_contact_email_fails() {
    let home = TempDir::new().unwrap();
    doifetch(&home)
        .args(["--database", "out.db", "10.1234/x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--email"))
        .stderr(predicate::str::contains("open-access fallback"));
    assert!(!home.path().join("out.db").exists());
}

#[test]
fn test_binary_missing_input_file_fails() {
    let home = TempDir::new().unwrap();
    doifetch(&home)
        .args(["--input", "nope.txt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to open input file"));
}

#[test]
fn test_binary_bad_config_file_fails() {
    let home = TempDir::new().unwrap();
    write_config(&home, "colour = \"blue\"\n");
    doifetch(&home)
        .arg("10.1234/x")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_binary_resolves_dois_from_input_file() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/api/handles/10.1234/cli"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "responseCode": 1,
            "values": [{"type": "URL", "data": {"value": format!("{}/paper/cli.pdf", server.uri())}}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/paper/cli.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"%PDF-1.7 cli".to_vec(), "application/pdf"))
        .mount(&server)
        .await;

    let home = TempDir::new().unwrap();
    let db_path = home.path().join("results.db");
    write_config(&home, &mock_config(&server, &db_path));
    fs::write(
        home.path().join("dois.txt"),
        "# to read\n10.1234/cli\nhttps://doi.org/10.1234/CLI\n",
    )
    .unwrap();

    let mut cmd = doifetch(&home);
    cmd.args(["--input", "dois.txt"]);
    tokio::task::spawn_blocking(move || {
        cmd.assert()
            .success()
            .stderr(predicate::str::contains("run complete"));
    })
    .await
    .unwrap();

    let sink = SqliteSink::new(Database::new(&db_path).await.unwrap());
    let doi = Doi::parse("10.1234/cli").unwrap();
    assert_eq!(sink.status_of(&doi).await.unwrap().as_deref(), Some("resolved"));
    assert_eq!(sink.resolved_dois().await.unwrap(), vec![doi]);
}
