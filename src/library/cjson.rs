//! Guest-visible cjson module
//!
//! Only the decode half survives the gate: encoding is owned by the
//! sandbox's `output()` surface. JSON null decodes to the engine's null
//! sentinel, exposed as `cjson.null`, so array holes are never created.

use mlua::{Lua, LuaSerdeExt, Table};

/// Build the cjson library table.
pub fn loader(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    let decode = lua.create_function(|lua, text: mlua::String| {
        let parsed: serde_json::Value = serde_json::from_slice(&text.as_bytes())
            .map_err(|e| mlua::Error::RuntimeError(format!("invalid JSON: {}", e)))?;
        lua.to_value(&parsed)
    })?;
    table.set("decode", decode)?;
    table.set("null", lua.null())?;

    Ok(table)
}
