//! `console` and `print` for rule code, routed to `tracing`.

use std::sync::Arc;

use mlua::{Lua, LuaSerdeExt, Table, Value, Variadic};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

pub(crate) fn render(lua: &Lua, value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::LightUserData(ud) if ud.0.is_null() => "null".to_string(),
        Value::Boolean(flag) => flag.to_string(),
        Value::Integer(number) => number.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.to_string_lossy(),
        Value::Table(_) => lua
            .from_value::<serde_json::Value>(value.clone())
            .map(|json| json.to_string())
            .unwrap_or_else(|_| "table".to_string()),
        other => other.type_name().to_string(),
    }
}

fn emit(origin: &str, level: Level, message: &str) {
    match level {
        Level::Debug => debug!(target: "rules::sandbox", rule = %origin, "{message}"),
        Level::Info => info!(target: "rules::sandbox", rule = %origin, "{message}"),
        Level::Warn => warn!(target: "rules::sandbox", rule = %origin, "{message}"),
        Level::Error => error!(target: "rules::sandbox", rule = %origin, "{message}"),
    }
}

/// Bind `console.{log,debug,info,warn,error}` and `print` into `env`,
/// tagging every line with `origin`.
pub(crate) fn install(lua: &Lua, env: &Table, origin: &str) -> mlua::Result<()> {
    let origin: Arc<str> = Arc::from(origin);
    let console = lua.create_table()?;
    let levels = [
        ("log", Level::Info),
        ("info", Level::Info),
        ("debug", Level::Debug),
        ("warn", Level::Warn),
        ("error", Level::Error),
    ];
    for (name, level) in levels {
        let origin = Arc::clone(&origin);
        console.raw_set(
            name,
            lua.create_function(move |lua, args: Variadic<Value>| {
                let line = args
                    .iter()
                    .map(|value| render(lua, value))
                    .collect::<Vec<_>>()
                    .join(" ");
                emit(&origin, level, &line);
                Ok(())
            })?,
        )?;
    }
    let print = console.raw_get::<Value>("log")?;
    env.raw_set("console", console)?;
    env.raw_set("print", print)?;
    Ok(())
}
