//! Shared Lua modules reachable through a restricted `require`.
//!
//! Modules are read and syntax checked once at startup. Each invocation
//! evaluates a module at most once, on first `require`, and caches the
//! result for the rest of that invocation only.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use mlua::{Lua, Table, Value};
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::types::RuleSource;
use crate::error::{Result, RulesError};
use crate::io::locator::locate_rules;
use crate::sandbox::capabilities::CapabilityScope;

#[derive(Debug, Clone)]
struct Module {
    identifier: String,
    source_text: String,
}

/// Preloaded module sources keyed by dotted module name.
#[derive(Debug, Clone, Default)]
pub struct ModuleTable {
    modules: BTreeMap<String, Module>,
}

impl ModuleTable {
    /// Load every file under `dir` matching `pattern`.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn load(dir: &Path, pattern: &Regex) -> Result<Self> {
        let sources = locate_rules(dir, pattern)?;
        let table = Self::from_sources(sources)?;
        debug!(count = table.modules.len(), "loaded rule modules");
        Ok(table)
    }

    pub fn from_sources(sources: Vec<RuleSource>) -> Result<Self> {
        let lua = Lua::new();
        let mut modules = BTreeMap::new();
        for source in sources {
            lua.load(source.source_text.as_str())
                .set_name(format!("@{}", source.identifier))
                .into_function()
                .map_err(|err| RulesError::Compile {
                    identifier: source.identifier.clone(),
                    message: err.to_string(),
                })?;
            modules.insert(
                module_name(&source.identifier),
                Module {
                    identifier: source.identifier,
                    source_text: source.source_text,
                },
            );
        }
        Ok(Self { modules })
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// `util/strings.lua` is required as `util.strings`.
fn module_name(identifier: &str) -> String {
    let (dir, file) = match identifier.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, identifier),
    };
    let stem = match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    };
    match dir {
        Some(dir) => format!("{}.{stem}", dir.replace('/', ".")),
        None => stem.to_string(),
    }
}

/// Per-invocation module state: the shared sources plus this invocation's
/// cache and in-progress set.
#[derive(Clone)]
pub(crate) struct ModuleScope {
    table: Arc<ModuleTable>,
    cache: Table,
    loading: Arc<Mutex<BTreeSet<String>>>,
}

impl ModuleScope {
    pub(crate) fn new(lua: &Lua, table: Arc<ModuleTable>) -> mlua::Result<Self> {
        Ok(Self {
            table,
            cache: lua.create_table()?,
            loading: Arc::default(),
        })
    }

    fn require(&self, lua: &Lua, scope: &CapabilityScope, name: &str) -> mlua::Result<Value> {
        let cached = self.cache.raw_get::<Value>(name)?;
        if !matches!(cached, Value::Nil) {
            return Ok(cached);
        }
        let module = self.table.modules.get(name).ok_or_else(|| {
            mlua::Error::RuntimeError(format!("module '{name}' is not available to rules"))
        })?;
        if !self
            .loading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string())
        {
            return Err(mlua::Error::RuntimeError(format!(
                "circular require of module '{name}'"
            )));
        }

        let result = scope
            .environment(lua, &module.identifier)
            .and_then(|env| {
                lua.load(module.source_text.as_str())
                    .set_name(format!("@{}", module.identifier))
                    .set_environment(env)
                    .call::<Value>(())
            });
        self.loading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);

        let value = match result? {
            Value::Nil => Value::Boolean(true),
            value => value,
        };
        self.cache.raw_set(name, value.clone())?;
        Ok(value)
    }
}

/// Bind `require` into `env`. Only names in the preloaded table resolve.
pub(crate) fn install(lua: &Lua, env: &Table, scope: &CapabilityScope) -> mlua::Result<()> {
    let scope = scope.clone();
    env.raw_set(
        "require",
        lua.create_function(move |lua, name: String| match scope.modules() {
            Some(modules) => modules.require(lua, &scope, &name),
            None => Err(mlua::Error::RuntimeError(
                "require is not available to rules".to_string(),
            )),
        })?,
    )
}
