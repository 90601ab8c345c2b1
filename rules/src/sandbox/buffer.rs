//! `Buffer` byte utilities. Lua strings are the byte arrays.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mlua::{Lua, String as LuaString, Table, Variadic};

fn runtime_error(context: &str, err: impl std::fmt::Display) -> mlua::Error {
    mlua::Error::RuntimeError(format!("{context}: {err}"))
}

pub(crate) fn install(lua: &Lua, env: &Table) -> mlua::Result<()> {
    let buffer = lua.create_table()?;

    buffer.raw_set(
        "byteLength",
        lua.create_function(|_, data: LuaString| Ok(data.as_bytes().len()))?,
    )?;
    buffer.raw_set(
        "toHex",
        lua.create_function(|_, data: LuaString| Ok(hex::encode(&*data.as_bytes())))?,
    )?;
    buffer.raw_set(
        "fromHex",
        lua.create_function(|lua, text: String| {
            let bytes =
                hex::decode(text.trim()).map_err(|err| runtime_error("Buffer.fromHex", err))?;
            lua.create_string(&bytes)
        })?,
    )?;
    buffer.raw_set(
        "toBase64",
        lua.create_function(|_, data: LuaString| Ok(STANDARD.encode(&*data.as_bytes())))?,
    )?;
    buffer.raw_set(
        "fromBase64",
        lua.create_function(|lua, text: String| {
            let bytes = STANDARD
                .decode(text.trim())
                .map_err(|err| runtime_error("Buffer.fromBase64", err))?;
            lua.create_string(&bytes)
        })?,
    )?;
    buffer.raw_set(
        "bytes",
        lua.create_function(|lua, data: LuaString| {
            let bytes = data.as_bytes().to_vec();
            lua.create_sequence_from(bytes)
        })?,
    )?;
    buffer.raw_set(
        "fromBytes",
        lua.create_function(|lua, bytes: Vec<u8>| lua.create_string(&bytes))?,
    )?;
    buffer.raw_set(
        "concat",
        lua.create_function(|lua, parts: Variadic<LuaString>| {
            let mut joined = Vec::new();
            for part in parts {
                joined.extend_from_slice(&part.as_bytes());
            }
            lua.create_string(&joined)
        })?,
    )?;

    env.raw_set("Buffer", buffer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str) -> mlua::Result<String> {
        let lua = Lua::new();
        let env = lua.create_table()?;
        install(&lua, &env)?;
        lua.load(source).set_environment(env).eval::<String>()
    }

    #[test]
    fn hex_and_base64_round_trip_through_lua() {
        assert_eq!(eval("return Buffer.toHex('hi')").expect("eval"), "6869");
        assert_eq!(eval("return Buffer.fromHex('6869')").expect("eval"), "hi");
        assert_eq!(eval("return Buffer.toBase64('hi')").expect("eval"), "aGk=");
        assert_eq!(
            eval("return Buffer.fromBase64(Buffer.toBase64('rules'))").expect("eval"),
            "rules"
        );
    }

    #[test]
    fn bytes_and_concat() {
        assert_eq!(
            eval("return Buffer.fromBytes(Buffer.bytes('ab'))").expect("eval"),
            "ab"
        );
        assert_eq!(eval("return Buffer.concat('a', 'b', 'c')").expect("eval"), "abc");
        assert_eq!(
            eval("return tostring(Buffer.byteLength('héllo'))").expect("eval"),
            "6"
        );
    }

    #[test]
    fn invalid_hex_raises() {
        let err = eval("return Buffer.fromHex('zz')").expect_err("should fail");
        assert!(err.to_string().contains("Buffer.fromHex"));
    }
}
