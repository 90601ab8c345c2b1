//! The fixed capability set visible to rule code.

use mlua::{Lua, Table, Value};

use crate::sandbox::modules::{self, ModuleScope};
use crate::sandbox::timers::{self, SharedTimers};
use crate::sandbox::{buffer, console};

const SAFE_BUILTINS: &[&str] = &[
    "assert",
    "error",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "rawequal",
    "rawget",
    "rawlen",
    "rawset",
    "select",
    "setmetatable",
    "tonumber",
    "tostring",
    "type",
    "xpcall",
];

const LIBRARIES: &[&str] = &["string", "table", "math", "utf8", "coroutine"];

/// Builtins plus private copies of the standard libraries.
fn library_environment(lua: &Lua) -> mlua::Result<Table> {
    let globals = lua.globals();
    let env = lua.create_table()?;
    for name in SAFE_BUILTINS {
        env.raw_set(*name, globals.raw_get::<Value>(*name)?)?;
    }
    for name in LIBRARIES {
        let Value::Table(library) = globals.raw_get::<Value>(*name)? else {
            continue;
        };
        let copy = lua.create_table()?;
        library.for_each(|key: Value, value: Value| copy.raw_set(key, value))?;
        env.raw_set(*name, copy)?;
    }
    Ok(env)
}

/// Everything a rule (or a module it requires) may reach for, bound to one
/// invocation.
#[derive(Clone)]
pub(crate) struct CapabilityScope {
    timers: SharedTimers,
    modules: Option<ModuleScope>,
}

impl CapabilityScope {
    pub(crate) fn new(timers: SharedTimers, modules: Option<ModuleScope>) -> Self {
        Self { timers, modules }
    }

    pub(crate) fn modules(&self) -> Option<&ModuleScope> {
        self.modules.as_ref()
    }

    /// Fresh environment table for code identified by `origin`.
    pub(crate) fn environment(&self, lua: &Lua, origin: &str) -> mlua::Result<Table> {
        let env = library_environment(lua)?;
        timers::install(lua, &env, &self.timers)?;
        buffer::install(lua, &env)?;
        console::install(lua, &env, origin)?;
        if self.modules.is_some() {
            modules::install(lua, &env, self)?;
        }
        Ok(env)
    }
}
