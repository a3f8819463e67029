//! Require resolver
//!
//! Replaces the engine's module machinery entirely: a fabricated
//! `package.loaded` cache, a boolean sentinel to break dependency cycles,
//! gated loaders for the built-in set, and validated on-disk resolution
//! under the configured module root for everything else.

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use mlua::{Lua, Table, Value};
use tracing::debug;

use crate::library;
use crate::sandbox::Shared;

/// Longest permitted on-disk module path, including the `.lua` suffix.
const MAX_REQUIRE_PATH: usize = 255;

/// Install `require` as a global closure over the sandbox state.
pub(crate) fn install(lua: &Lua, shared: &Rc<RefCell<Shared>>) -> mlua::Result<()> {
    let state = shared.clone();
    let require = lua.create_function(move |lua, name: String| resolve(lua, &state, &name))?;
    lua.globals().set("require", require)
}

fn resolve(lua: &Lua, shared: &Rc<RefCell<Shared>>, name: &str) -> mlua::Result<Value> {
    let loaded = loaded_table(lua)?;

    let cached: Value = loaded.raw_get(name)?;
    if !matches!(cached, Value::Nil) {
        return Ok(cached);
    }
    // Sentinel breaks dependency cycles; a cyclic require observes `true`.
    loaded.raw_set(name, true)?;

    // Built-in or host-registered library: load through the gate. The entry
    // is cloned out so no borrow is held while the loader runs.
    let entry = shared
        .borrow()
        .registry
        .get(name)
        .map(|e| (e.loader.clone(), e.denylist.clone(), e.bind_global));
    if let Some((loader, denylist, bind_global)) = entry {
        let table = loader(lua)?;
        library::gate_table(lua, &table, &denylist)?;
        if bind_global {
            lua.globals().raw_set(name, &table)?;
        }
        loaded.raw_set(name, &table)?;
        return Ok(Value::Table(table));
    }

    // External module from the configured root.
    let root = shared.borrow().module_path.clone();
    let root = root.ok_or_else(|| {
        mlua::Error::RuntimeError("external modules are disabled".to_string())
    })?;
    if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(mlua::Error::RuntimeError(format!(
            "invalid module name '{}'",
            name
        )));
    }
    let path = root.join(format!("{}.lua", name));
    let path_str = path.to_string_lossy().into_owned();
    if path_str.len() >= MAX_REQUIRE_PATH {
        return Err(mlua::Error::RuntimeError(format!(
            "require_path exceeded {}",
            MAX_REQUIRE_PATH
        )));
    }

    let source = fs::read(&path).map_err(|e| {
        mlua::Error::RuntimeError(format!("cannot open {}: {}", path_str, e))
    })?;
    debug!(module = name, path = %path_str, "loading external module");

    // The module chunk may itself call require; no sandbox borrow is held
    // across the evaluation.
    let value: Value = lua
        .load(source.as_slice())
        .set_name(format!("@{}", path_str))
        .eval()?;
    if let Value::Table(table) = &value {
        let marker = lua.create_table()?;
        table.set_metatable(Some(marker));
    }
    loaded.raw_set(name, value.clone())?;
    Ok(value)
}

fn loaded_table(lua: &Lua) -> mlua::Result<Table> {
    let package: Value = lua.globals().raw_get("package")?;
    let package = match package {
        Value::Table(t) => t,
        _ => {
            return Err(mlua::Error::RuntimeError(
                "package table is missing".to_string(),
            ))
        }
    };
    let loaded: Value = package.raw_get("loaded")?;
    match loaded {
        Value::Table(t) => Ok(t),
        _ => Err(mlua::Error::RuntimeError(
            "package.loaded table is missing".to_string(),
        )),
    }
}
