//! User/context documents fed to the runner from disk.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::types::{RuleContext, RuleUser};

pub const USER_SCHEMA: &str = include_str!("../../schemas/rule_input/user.v1.schema.json");
pub const CONTEXT_SCHEMA: &str = include_str!("../../schemas/rule_input/context.v1.schema.json");

/// Validate JSON instance against a JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema_raw: &str, what: &str) -> Result<()> {
    let schema: Value = serde_json::from_str(schema_raw).context("parse bundled schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("{what} failed schema validation:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

pub fn parse_user(raw: &str) -> Result<RuleUser> {
    parse_document(raw, USER_SCHEMA, "user")
}

pub fn parse_context(raw: &str) -> Result<RuleContext> {
    parse_document(raw, CONTEXT_SCHEMA, "context")
}

fn parse_document<T: DeserializeOwned>(raw: &str, schema: &str, what: &str) -> Result<T> {
    let value: Value = serde_json::from_str(raw).with_context(|| format!("parse {what} json"))?;
    validate_schema(&value, schema, what)?;
    serde_json::from_value(value).with_context(|| format!("parse {what} document"))
}

pub fn load_user(path: &Path) -> Result<RuleUser> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_user(&raw).with_context(|| format!("load {}", path.display()))
}

pub fn load_context(path: &Path) -> Result<RuleContext> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_context(&raw).with_context(|| format!("load {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_minimal_documents() {
        let user = parse_user(r#"{"email": "a@example.com", "tenant": "acme"}"#).expect("user");
        assert_eq!(user.email.as_deref(), Some("a@example.com"));
        let context = parse_context(r#"{"scope": "openid"}"#).expect("context");
        assert_eq!(context.scope, "openid");
    }

    #[test]
    fn rejects_wrong_claim_types() {
        let err = parse_user(r#"{"email_verified": "yes"}"#).expect_err("should fail");
        assert!(format!("{err:#}").contains("schema validation"));
    }

    #[test]
    fn rejects_non_object_context() {
        assert!(parse_context("[]").is_err());
        assert!(parse_context(r#"{"redirect": {}}"#).is_err());
    }

    #[test]
    fn load_reports_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("user.json");
        let err = load_user(&missing).expect_err("should fail");
        assert!(format!("{err:#}").contains("user.json"));
    }
}
