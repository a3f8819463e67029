//! Library gating
//!
//! Decides which library surface guest code can see. Each library is loaded
//! through a registered loader, denied symbols are blanked out of its table,
//! and every gated table except the root globals is tagged with an empty
//! marker metatable so a preservation layer can tell built-ins from user
//! data.

pub mod circular_buffer;
pub mod cjson;

use std::collections::HashMap;
use std::rc::Rc;

use mlua::{Lua, StdLib, Table, Value};

/// Loader invoked by the require resolver; produces the library's table.
pub type LibraryLoader = Rc<dyn Fn(&Lua) -> mlua::Result<Table>>;

/// Globals stripped from the base table at sandbox creation. The host
/// supplies structured output via `output()`, so `print` goes too.
pub const DENIED_BASE_GLOBALS: &[&str] = &[
    "collectgarbage",
    "coroutine",
    "dofile",
    "load",
    "loadfile",
    "loadstring",
    "newproxy",
    "print",
];

const DENIED_OS_FUNCTIONS: &[&str] = &[
    "execute",
    "exit",
    "remove",
    "rename",
    "setlocale",
    "tmpname",
];

/// The safe cjson variant: encoding is owned by `output()`, so the encode
/// surface is denied wholesale.
const DENIED_CJSON_FUNCTIONS: &[&str] = &[
    "encode",
    "encode_sparse_array",
    "encode_max_depth",
    "encode_number_precision",
    "encode_keep_buffer",
    "encode_invalid_numbers",
];

/// One gated library
pub struct LibraryEntry {
    pub loader: LibraryLoader,
    pub denylist: Vec<String>,
    /// Bind the table as a bare global in addition to caching it
    pub bind_global: bool,
}

/// All libraries the require resolver may load
#[derive(Default)]
pub struct LibraryRegistry {
    entries: HashMap<String, LibraryEntry>,
}

impl LibraryRegistry {
    /// Registry pre-populated with the built-in set.
    pub fn with_builtins() -> Self {
        let mut registry = LibraryRegistry::default();
        registry.add("string", std_lib_loader(StdLib::STRING, "string"), &[], false);
        registry.add("math", std_lib_loader(StdLib::MATH, "math"), &[], false);
        registry.add("table", std_lib_loader(StdLib::TABLE, "table"), &[], false);
        registry.add("os", std_lib_loader(StdLib::OS, "os"), DENIED_OS_FUNCTIONS, false);
        registry.add("cjson", Rc::new(cjson::loader), DENIED_CJSON_FUNCTIONS, true);
        registry.add("circular_buffer", Rc::new(circular_buffer::loader), &[], false);
        registry
    }

    fn add(&mut self, name: &str, loader: LibraryLoader, denylist: &[&str], bind_global: bool) {
        self.entries.insert(
            name.to_string(),
            LibraryEntry {
                loader,
                denylist: denylist.iter().map(|s| s.to_string()).collect(),
                bind_global,
            },
        );
    }

    /// Register an extension library under the gate. Used by hosts to plug
    /// in surfaces such as lpeg, pb, bloom_filter, or hyperloglog.
    pub fn register(&mut self, name: &str, denylist: &[&str], loader: LibraryLoader) {
        self.add(name, loader, denylist, false);
    }

    pub fn get(&self, name: &str) -> Option<&LibraryEntry> {
        self.entries.get(name)
    }
}

fn std_lib_loader(lib: StdLib, name: &'static str) -> LibraryLoader {
    Rc::new(move |lua: &Lua| {
        lua.load_std_libs(lib)?;
        lua.globals().get::<Table>(name)
    })
}

/// Strip denied entries from a freshly loaded library table and attach the
/// empty marker metatable.
pub fn gate_table(lua: &Lua, table: &Table, denylist: &[String]) -> mlua::Result<()> {
    for name in denylist {
        table.raw_set(name.as_str(), Value::Nil)?;
    }
    let marker = lua.create_table()?;
    table.set_metatable(Some(marker));
    Ok(())
}

/// Clear denied names from the globals namespace. The root table gets no
/// marker metatable.
pub fn strip_globals(globals: &Table, denied: &[&str]) -> mlua::Result<()> {
    for name in denied {
        globals.raw_set(*name, Value::Nil)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_strips_and_tags() {
        let lua = Lua::new();
        let table: Table = lua
            .load("return {keep = 1, drop = 2}")
            .eval()
            .unwrap();
        gate_table(&lua, &table, &["drop".to_string()]).unwrap();

        assert_eq!(table.get::<i64>("keep").unwrap(), 1);
        assert!(matches!(table.get::<Value>("drop").unwrap(), Value::Nil));

        let marker = table.metatable().expect("marker metatable attached");
        assert_eq!(marker.len().unwrap(), 0);
    }

    #[test]
    fn test_strip_globals() {
        let lua = Lua::new();
        strip_globals(&lua.globals(), &["print"]).unwrap();
        assert!(matches!(
            lua.globals().get::<Value>("print").unwrap(),
            Value::Nil
        ));
    }

    #[test]
    fn test_builtin_registry_contents() {
        let registry = LibraryRegistry::with_builtins();
        for name in ["string", "math", "table", "os", "cjson", "circular_buffer"] {
            assert!(registry.get(name).is_some(), "missing builtin {}", name);
        }
        assert!(registry.get("lpeg").is_none());
        assert!(registry.get("cjson").unwrap().bind_global);
        assert!(registry
            .get("os")
            .unwrap()
            .denylist
            .contains(&"execute".to_string()));
    }
}
