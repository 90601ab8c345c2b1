//! CLI tests for `rules init`, `rules check` and `rules run`.
//!
//! Spawns the rules binary and verifies exit codes and JSON output.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use rules::exit_codes;
use rules::io::config::write_config;
use rules::test_support::RuleDir;
use serde_json::{Value, json};

fn rules_cmd(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rules"))
        .current_dir(root)
        .args(args)
        .output()
        .expect("spawn rules")
}

fn prepare(dir: &RuleDir) {
    write_config(&dir.root().join("rules.toml"), &dir.config()).expect("write config");
    fs::write(
        dir.root().join("user.json"),
        r#"{"user_id": "auth0|1", "email": "a@example.com"}"#,
    )
    .expect("write user");
    fs::write(
        dir.root().join("context.json"),
        r#"{"clientID": "client-1", "scope": "openid"}"#,
    )
    .expect("write context");
}

fn run_args() -> [&'static str; 5] {
    ["run", "--user", "user.json", "--context", "context.json"]
}

#[test]
fn init_then_check_lists_example_rule() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = rules_cmd(temp.path(), &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));
    assert!(temp.path().join("rules.toml").is_file());

    let again = rules_cmd(temp.path(), &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));

    let check = rules_cmd(temp.path(), &["check"]);
    assert_eq!(check.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&check.stdout);
    assert_eq!(stdout.trim(), "00-passthrough.lua");
}

#[test]
fn check_reports_compile_errors() {
    let dir = RuleDir::new();
    prepare(&dir);
    dir.rule("bad.lua", "function(u, c, cb");

    let output = rules_cmd(dir.root(), &["check"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("bad.lua"));
}

#[test]
fn run_prints_outcome_json() {
    let dir = RuleDir::new();
    prepare(&dir);
    dir.rule(
        "a.lua",
        "function(u, c, cb) c.scope = c.scope .. ':a'; u.app_metadata = { plan = 'pro' }; cb(nil, u, c) end",
    );

    let output = rules_cmd(dir.root(), &run_args());
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let outcome: Value = serde_json::from_slice(&output.stdout).expect("json output");
    assert_eq!(outcome["context"]["scope"], json!("openid:a"));
    assert_eq!(outcome["context"]["clientID"], json!("client-1"));
    assert_eq!(outcome["user"]["app_metadata"]["plan"], json!("pro"));
    assert!(outcome.get("signal").is_none());
}

#[test]
fn run_exits_denied_when_a_rule_denies() {
    let dir = RuleDir::new();
    prepare(&dir);
    dir.rule("a.lua", "function(u, c, cb) cb('nope') end");

    let output = rules_cmd(dir.root(), &run_args());
    assert_eq!(output.status.code(), Some(exit_codes::DENIED));
    let outcome: Value = serde_json::from_slice(&output.stdout).expect("json output");
    assert_eq!(outcome["signal"]["kind"], json!("denied"));
    assert_eq!(outcome["signal"]["message"], json!("nope"));
}

#[test]
fn run_exits_redirected_when_a_rule_redirects() {
    let dir = RuleDir::new();
    prepare(&dir);
    dir.rule(
        "a.lua",
        "function(u, c, cb) c.redirect = { url = 'https://example.com/consent' }; cb(nil, u, c) end",
    );

    let output = rules_cmd(dir.root(), &run_args());
    assert_eq!(output.status.code(), Some(exit_codes::REDIRECTED));
}

#[test]
fn run_rejects_invalid_documents() {
    let dir = RuleDir::new();
    prepare(&dir);
    fs::write(dir.root().join("user.json"), r#"{"email_verified": "yes"}"#).expect("write");

    let output = rules_cmd(dir.root(), &run_args());
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("schema validation"));
}
