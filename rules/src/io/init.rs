//! Scaffolding for a new rules workspace.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{DEFAULT_CONFIG_FILE, RulesConfig, write_config};

/// Canonical paths of a rules workspace rooted at `root`.
#[derive(Debug, Clone)]
pub struct RulesPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub rules_dir: PathBuf,
    pub example_rule_path: PathBuf,
}

impl RulesPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let rules_dir = root.join(DEFAULT_RULES_DIR);
        Self {
            config_path: root.join(DEFAULT_CONFIG_FILE),
            example_rule_path: rules_dir.join(EXAMPLE_RULE_FILE),
            rules_dir,
            root,
        }
    }
}

/// Options for `init_rules`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite the config file and the example rule.
    pub force: bool,
}

/// Write `rules.toml` and an example rule under `root`.
///
/// Fails if `rules.toml` already exists unless `options.force` is set.
pub fn init_rules(root: &Path, options: &InitOptions) -> Result<RulesPaths> {
    let paths = RulesPaths::new(root);
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "rules init: {DEFAULT_CONFIG_FILE} already exists (use --force to overwrite)"
        ));
    }
    if paths.rules_dir.exists() && !paths.rules_dir.is_dir() {
        return Err(anyhow!(
            "rules init: {DEFAULT_RULES_DIR} exists but is not a directory"
        ));
    }

    fs::create_dir_all(&paths.rules_dir)
        .with_context(|| format!("create directory {}", paths.rules_dir.display()))?;
    write_config(
        &paths.config_path,
        &RulesConfig::for_rules_path(DEFAULT_RULES_DIR),
    )?;
    if options.force || !paths.example_rule_path.exists() {
        fs::write(&paths.example_rule_path, EXAMPLE_RULE)
            .with_context(|| format!("write file {}", paths.example_rule_path.display()))?;
    }
    Ok(paths)
}

const DEFAULT_RULES_DIR: &str = "rules";
const EXAMPLE_RULE_FILE: &str = "00-passthrough.lua";
const EXAMPLE_RULE: &str = "\
-- Rules run in file order. Call back exactly once to hand user and
-- context to the next rule, or with an error to deny the login.
function(user, context, callback)
  callback(nil, user, context)
end
";
