//! Table-to-JSON encoder
//!
//! Streams a guest table into the output buffer as JSON. A table encodes as
//! an array when its raw length covers every entry, as an object otherwise.
//! Revisiting a table anywhere in the traversal is an error, detected with a
//! table-identity set.

use std::collections::HashSet;

use mlua::{Table, Value};

use super::SerializeError;
use crate::output::{append_fmt, OutputBuffer};

/// Initial capacity of the visited-table scratch set; the set grows by
/// doubling beyond this.
const INITIAL_VISITED_CAPACITY: usize = 64;

/// Nesting ceiling protecting the encoder's own stack.
const MAX_ENCODE_DEPTH: usize = 100;

/// Encode a table, writing the JSON text into the buffer.
pub fn encode(buf: &mut OutputBuffer, table: &Table) -> Result<(), SerializeError> {
    let mut visited: HashSet<usize> = HashSet::with_capacity(INITIAL_VISITED_CAPACITY);
    encode_table(buf, table, &mut visited, 0)
}

fn encode_table(
    buf: &mut OutputBuffer,
    table: &Table,
    visited: &mut HashSet<usize>,
    depth: usize,
) -> Result<(), SerializeError> {
    if depth > MAX_ENCODE_DEPTH {
        return Err(SerializeError::Message(
            "Cannot serialize, excessive nesting".to_string(),
        ));
    }
    if !visited.insert(table.to_pointer() as usize) {
        return Err(SerializeError::Message(
            "table contains an internal or circular reference".to_string(),
        ));
    }

    let len = table.raw_len() as usize;
    let mut pairs: Vec<(Value, Value)> = Vec::new();
    for pair in table.clone().pairs::<Value, Value>() {
        pairs.push(pair.map_err(|e| SerializeError::Message(e.to_string()))?);
    }

    if len > 0 && pairs.len() == len {
        buf.append_char('[')?;
        for i in 1..=len {
            if i > 1 {
                buf.append_char(',')?;
            }
            let value: Value = table
                .raw_get(i)
                .map_err(|e| SerializeError::Message(e.to_string()))?;
            encode_value(buf, &value, visited, depth)?;
        }
        buf.append_char(']')?;
    } else {
        buf.append_char('{')?;
        for (i, (key, value)) in pairs.iter().enumerate() {
            if i > 0 {
                buf.append_char(',')?;
            }
            encode_key(buf, key)?;
            buf.append_char(':')?;
            encode_value(buf, value, visited, depth)?;
        }
        buf.append_char('}')?;
    }
    Ok(())
}

fn encode_value(
    buf: &mut OutputBuffer,
    value: &Value,
    visited: &mut HashSet<usize>,
    depth: usize,
) -> Result<(), SerializeError> {
    match value {
        Value::Nil => buf.append_str("null")?,
        Value::Boolean(b) => buf.append_str(if *b { "true" } else { "false" })?,
        Value::Integer(i) => append_fmt!(buf, "{}", i)?,
        Value::Number(n) => {
            if n.is_nan() || n.is_infinite() {
                return Err(SerializeError::Message(
                    "Cannot serialize number: must not be NaN or Infinity".to_string(),
                ));
            }
            append_fmt!(buf, "{}", n)?;
        }
        Value::String(s) => buf.append_str(&escape_json_string(&s.to_string_lossy()))?,
        Value::Table(t) => encode_table(buf, t, visited, depth + 1)?,
        other => {
            return Err(SerializeError::Message(format!(
                "Cannot serialize value of type '{}'",
                other.type_name()
            )));
        }
    }
    Ok(())
}

fn encode_key(buf: &mut OutputBuffer, key: &Value) -> Result<(), SerializeError> {
    match key {
        Value::String(s) => buf.append_str(&escape_json_string(&s.to_string_lossy()))?,
        Value::Integer(i) => append_fmt!(buf, "\"{}\"", i)?,
        Value::Number(n) => append_fmt!(buf, "\"{}\"", n)?,
        other => {
            return Err(SerializeError::Message(format!(
                "Cannot serialize key of type '{}'",
                other.type_name()
            )));
        }
    }
    Ok(())
}

/// Quote and escape a string for JSON.
fn escape_json_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('"');
    for ch in s.chars() {
        match ch {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            '\u{0008}' => result.push_str("\\b"),
            '\u{000C}' => result.push_str("\\f"),
            c if c.is_control() => {
                result.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => result.push(c),
        }
    }
    result.push('"');
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Lua;

    fn encode_lua(lua: &Lua, source: &str) -> Result<String, SerializeError> {
        let table: Table = lua.load(source).eval().expect("table literal");
        let mut buf = OutputBuffer::new(0);
        encode(&mut buf, &table)?;
        Ok(String::from_utf8(buf.take()).unwrap())
    }

    #[test]
    fn test_array_encoding() {
        let lua = Lua::new();
        assert_eq!(encode_lua(&lua, "return {1, 2, 3}").unwrap(), "[1,2,3]");
        assert_eq!(
            encode_lua(&lua, "return {'a', true, 1.5}").unwrap(),
            r#"["a",true,1.5]"#
        );
    }

    #[test]
    fn test_object_encoding() {
        let lua = Lua::new();
        assert_eq!(
            encode_lua(&lua, "return {value = 23}").unwrap(),
            r#"{"value":23}"#
        );
        assert_eq!(
            encode_lua(&lua, "return {nested = {1, 2}}").unwrap(),
            r#"{"nested":[1,2]}"#
        );
    }

    #[test]
    fn test_empty_table_is_object() {
        let lua = Lua::new();
        assert_eq!(encode_lua(&lua, "return {}").unwrap(), "{}");
    }

    #[test]
    fn test_string_escaping() {
        let lua = Lua::new();
        assert_eq!(
            encode_lua(&lua, r#"return {'line\nbreak "quoted"'}"#).unwrap(),
            r#"["line\nbreak \"quoted\""]"#
        );
    }

    #[test]
    fn test_cycle_detected() {
        let lua = Lua::new();
        let err = encode_lua(&lua, "local t = {} t.me = t return t").unwrap_err();
        match err {
            SerializeError::Message(msg) => {
                assert_eq!(msg, "table contains an internal or circular reference");
            }
            other => panic!("expected encoder message, got {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_value_rejected() {
        let lua = Lua::new();
        let err = encode_lua(&lua, "return {f = function() end}").unwrap_err();
        match err {
            SerializeError::Message(msg) => {
                assert_eq!(msg, "Cannot serialize value of type 'function'");
            }
            other => panic!("expected encoder message, got {:?}", other),
        }
    }

    #[test]
    fn test_overflow_surfaces_as_full() {
        let lua = Lua::new();
        let table: Table = lua.load("return {1, 2, 3, 4, 5}").eval().unwrap();
        let mut buf = OutputBuffer::new(4);
        match encode(&mut buf, &table) {
            Err(SerializeError::Full) => {}
            other => panic!("expected Full, got {:?}", other),
        }
    }
}
