//! Compiled, ordered rule set shared by every invocation.

use mlua::Value;
use tracing::{debug, instrument};

use crate::core::types::RuleSource;
use crate::error::{Result, RulesError};
use crate::sandbox::SandboxHost;

/// A rule source that parsed and evaluated to a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    identifier: String,
    chunk: String,
}

impl CompiledRule {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Chunk text that evaluates to the rule function.
    pub(crate) fn chunk(&self) -> &str {
        &self.chunk
    }

    pub(crate) fn chunk_name(&self) -> String {
        format!("@{}", self.identifier)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    rules: Vec<CompiledRule>,
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile `sources` in order. The first failure aborts the whole build.
    ///
    /// Top-level code runs with the capabilities of `host`, so chunks may
    /// `require` preloaded modules. Each source gets its own time budget.
    #[instrument(skip_all, fields(count = sources.len()))]
    pub fn build(sources: Vec<RuleSource>, host: &SandboxHost) -> Result<Self> {
        let sandbox = host.compile_sandbox()?;

        let mut rules = Vec::with_capacity(sources.len());
        for source in sources {
            let chunk = normalize(sandbox.lua(), &source)?;
            let value = sandbox
                .evaluate(&source.identifier, &chunk)
                .map_err(|err| RulesError::Compile {
                    identifier: source.identifier.clone(),
                    message: err.to_string(),
                })?;
            if !matches!(value, Value::Function(_)) {
                return Err(RulesError::Compile {
                    identifier: source.identifier,
                    message: format!("expected a function, got {}", value.type_name()),
                });
            }
            debug!(rule = %source.identifier, "compiled rule");
            rules.push(CompiledRule {
                identifier: source.identifier,
                chunk,
            });
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Identifiers in execution order.
    pub fn identifiers(&self) -> Vec<&str> {
        self.rules.iter().map(CompiledRule::identifier).collect()
    }
}

/// A bare `function(...) end` expression is wrapped in `return`; anything
/// else must already be a chunk that returns the function.
fn normalize(lua: &mlua::Lua, source: &RuleSource) -> Result<String> {
    let name = format!("@{}", source.identifier);
    let expression = format!("return {}", source.source_text);
    let as_expression = lua
        .load(expression.as_str())
        .set_name(name.as_str())
        .into_function();
    if as_expression.is_ok() {
        return Ok(expression);
    }
    match lua
        .load(source.source_text.as_str())
        .set_name(name.as_str())
        .into_function()
    {
        Ok(_) => Ok(source.source_text.clone()),
        Err(chunk_err) => {
            let looks_like_expression = source.source_text.trim_start().starts_with("function");
            let message = match (looks_like_expression, as_expression) {
                (true, Err(expression_err)) => expression_err.to_string(),
                _ => chunk_err.to_string(),
            };
            Err(RulesError::Compile {
                identifier: source.identifier.clone(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sandbox::{ModuleTable, SandboxSettings};

    fn build(sources: Vec<RuleSource>) -> Result<Registry> {
        Registry::build(sources, &SandboxHost::default())
    }

    #[test]
    fn accepts_expression_and_chunk_forms() {
        let registry = build(vec![
            RuleSource::new("a.lua", "function(user, context, callback) callback(nil) end"),
            RuleSource::new(
                "b.lua",
                "local suffix = ':b'\nreturn function(user, context, callback) callback(nil) end",
            ),
        ])
        .expect("build");
        assert_eq!(registry.identifiers(), vec!["a.lua", "b.lua"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.rules()[0].chunk().starts_with("return function"));
    }

    #[test]
    fn syntax_error_names_the_rule() {
        let err = build(vec![
            RuleSource::new("ok.lua", "function(u, c, cb) cb(nil) end"),
            RuleSource::new("broken.lua", "function(u, c, cb) cb(nil"),
        ])
        .expect_err("build should fail");
        assert!(
            matches!(err, RulesError::Compile { ref identifier, .. } if identifier == "broken.lua")
        );
    }

    #[test]
    fn non_function_value_is_rejected() {
        let err = build(vec![RuleSource::new("number.lua", "42")]).expect_err("build should fail");
        let RulesError::Compile { message, .. } = err else {
            panic!("expected compile error, got {err:?}");
        };
        assert!(message.contains("number"), "{message}");
    }

    #[test]
    fn top_level_code_cannot_reach_host() {
        let err = build(vec![RuleSource::new(
            "escape.lua",
            "os.exit(1)\nreturn function(u, c, cb) cb(nil) end",
        )])
        .expect_err("build should fail");
        assert!(matches!(err, RulesError::Compile { .. }));
    }

    #[test]
    fn empty_registry() {
        let registry = Registry::empty();
        assert!(registry.is_empty());
        assert!(registry.identifiers().is_empty());
    }

    #[test]
    fn chunk_can_require_modules_at_top_level() {
        let modules = ModuleTable::from_sources(vec![RuleSource::new(
            "util.lua",
            "return { suffix = ':util' }",
        )])
        .expect("modules");
        let host = SandboxHost::new(SandboxSettings::default(), Some(Arc::new(modules)));
        let registry = Registry::build(
            vec![RuleSource::new(
                "a.lua",
                "local util = require('util')\nreturn function(u, c, cb) c.scope = c.scope .. util.suffix; cb(nil, u, c) end",
            )],
            &host,
        )
        .expect("build");
        assert_eq!(registry.identifiers(), vec!["a.lua"]);

        let err = build(vec![RuleSource::new(
            "a.lua",
            "local util = require('util')\nreturn function(u, c, cb) cb(nil) end",
        )])
        .expect_err("require is absent without modules");
        assert!(matches!(err, RulesError::Compile { .. }));
    }
}
