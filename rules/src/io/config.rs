//! Rules configuration stored in `rules.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::ErrorPolicy;
use crate::error::RulesError;
use crate::sandbox::SandboxSettings;

pub const DEFAULT_CONFIG_FILE: &str = "rules.toml";

/// Rules configuration (TOML).
///
/// Every field is optional. Without `rules_path` the runner is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RulesConfig {
    /// Directory of rule sources, relative to the working directory.
    pub rules_path: Option<PathBuf>,

    /// Regex matched against file names to pick rule sources.
    pub file_pattern: String,

    /// Wall-clock budget for one rule to call back, in milliseconds.
    pub rule_timeout_ms: u64,

    /// Interpreter memory ceiling per invocation.
    pub memory_limit_bytes: usize,

    pub on_rule_error: ErrorPolicy,

    pub modules: ModulesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModulesConfig {
    /// Expose `require` to rules. Off unless explicitly enabled.
    pub enabled: bool,

    /// Directory of shareable modules, relative to the working directory.
    pub path: Option<PathBuf>,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: Some(PathBuf::from("rule_modules")),
        }
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            file_pattern: r"\.lua$".to_string(),
            rule_timeout_ms: 5_000,
            memory_limit_bytes: 32 * 1024 * 1024,
            on_rule_error: ErrorPolicy::Continue,
            modules: ModulesConfig::default(),
        }
    }
}

impl RulesConfig {
    /// Config pointing at `rules_path` with every other field defaulted.
    pub fn for_rules_path(rules_path: impl Into<PathBuf>) -> Self {
        Self {
            rules_path: Some(rules_path.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rule_timeout_ms == 0 {
            return Err(anyhow!("rule_timeout_ms must be > 0"));
        }
        if self.memory_limit_bytes == 0 {
            return Err(anyhow!("memory_limit_bytes must be > 0"));
        }
        if self.file_pattern.trim().is_empty() {
            return Err(anyhow!("file_pattern must not be empty"));
        }
        Regex::new(&self.file_pattern)
            .with_context(|| format!("file_pattern '{}' is not a valid regex", self.file_pattern))?;
        if self.modules.enabled && self.modules.path.is_none() {
            return Err(anyhow!("modules.path is required when modules.enabled = true"));
        }
        Ok(())
    }

    /// Compiled file pattern.
    pub fn file_regex(&self) -> std::result::Result<Regex, RulesError> {
        Regex::new(&self.file_pattern).map_err(|err| {
            RulesError::configuration(format!(
                "file_pattern '{}' is not a valid regex: {err}",
                self.file_pattern
            ))
        })
    }

    /// Absolute rules directory, or `None` when no rules are configured.
    pub fn rules_dir(&self, cwd: &Path) -> Option<PathBuf> {
        self.rules_path.as_ref().map(|path| cwd.join(path))
    }

    /// Absolute module directory, or `None` when `require` is disabled.
    pub fn modules_dir(&self, cwd: &Path) -> Option<PathBuf> {
        if !self.modules.enabled {
            return None;
        }
        self.modules.path.as_ref().map(|path| cwd.join(path))
    }

    pub fn sandbox_settings(&self) -> SandboxSettings {
        SandboxSettings {
            rule_timeout: Duration::from_millis(self.rule_timeout_ms),
            memory_limit_bytes: self.memory_limit_bytes,
            error_policy: self.on_rule_error,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RulesConfig::default()`.
pub fn load_config(path: &Path) -> Result<RulesConfig> {
    if !path.exists() {
        let cfg = RulesConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RulesConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RulesConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
