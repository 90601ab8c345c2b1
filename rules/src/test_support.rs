//! Test-only helpers for building rule directories and inputs.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::core::types::{Claims, RuleContext, RuleUser};
use crate::io::config::RulesConfig;

/// Temporary workspace with a `rules/` directory.
pub struct RuleDir {
    temp: TempDir,
}

impl RuleDir {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("rules")).expect("create rules dir");
        Self { temp }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.root().join("rules")
    }

    /// Write a rule at `rules/<identifier>`, creating parent directories.
    pub fn rule(&self, identifier: &str, source: &str) -> &Self {
        self.write(&self.rules_dir().join(identifier), source);
        self
    }

    /// Write a module at `rule_modules/<identifier>`.
    pub fn module(&self, identifier: &str, source: &str) -> &Self {
        self.write(&self.root().join("rule_modules").join(identifier), source);
        self
    }

    /// Config pointing at this workspace's `rules/`.
    pub fn config(&self) -> RulesConfig {
        RulesConfig::for_rules_path("rules")
    }

    fn write(&self, path: &Path, source: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, source).expect("write rule");
    }
}

impl Default for RuleDir {
    fn default() -> Self {
        Self::new()
    }
}

pub fn user(email: &str) -> RuleUser {
    RuleUser {
        user_id: Some(format!("auth0|{email}")),
        email: Some(email.to_string()),
        ..RuleUser::default()
    }
}

pub fn context(scope: &str) -> RuleContext {
    RuleContext::<Claims, Claims> {
        client_id: "test-client".to_string(),
        ..RuleContext::with_scope(scope)
    }
}
