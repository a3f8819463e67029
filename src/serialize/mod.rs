//! Serializer dispatch for the guest `output()` surface
//!
//! Each positional argument is rendered by dynamic type: scalars as text,
//! tables as JSON, recognized extension userdata through its own dump.
//! Unrecognized values are silently ignored.

pub mod json;

use mlua::Value;

use crate::library::circular_buffer::CircularBuffer;
use crate::output::{append_fmt, OutputBuffer, OutputFull};

/// Failure modes of a single serialized value
#[derive(Debug)]
pub enum SerializeError {
    /// The output buffer ceiling was hit
    Full,
    /// The encoder rejected the value; the message is preserved verbatim
    Message(String),
}

impl From<OutputFull> for SerializeError {
    fn from(_: OutputFull) -> Self {
        SerializeError::Full
    }
}

/// Render one guest value into the output buffer.
pub fn serialize_value(buf: &mut OutputBuffer, value: &Value) -> Result<(), SerializeError> {
    match value {
        Value::Integer(i) => append_fmt!(buf, "{}", i)?,
        Value::Number(n) => serialize_double(buf, *n)?,
        Value::String(s) => buf.append_bytes(&s.as_bytes())?,
        Value::Nil => buf.append_str("nil")?,
        Value::Boolean(b) => buf.append_str(if *b { "true" } else { "false" })?,
        Value::Table(t) => {
            json::encode(buf, t)?;
            buf.append_char('\n')?;
        }
        Value::UserData(ud) => {
            if let Ok(cb) = ud.borrow::<CircularBuffer>() {
                cb.write_dump(buf)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Render a double so that any compliant reader parses it back to the same
/// value. Rust's `Display` for f64 emits the shortest round-trippable form,
/// with integral values printed without a fractional part.
pub fn serialize_double(buf: &mut OutputBuffer, n: f64) -> Result<(), OutputFull> {
    append_fmt!(buf, "{}", n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_rendering_round_trips() {
        for n in [0.0, 23.0, -1.5, 0.1, 1391794831.755, f64::MAX, 1e-300] {
            let mut buf = OutputBuffer::new(0);
            serialize_double(&mut buf, n).unwrap();
            let text = String::from_utf8(buf.take()).unwrap();
            assert_eq!(text.parse::<f64>().unwrap(), n, "rendering {}", text);
        }
    }

    #[test]
    fn test_integral_double_has_no_fraction() {
        let mut buf = OutputBuffer::new(0);
        serialize_double(&mut buf, 23.0).unwrap();
        assert_eq!(buf.as_bytes(), b"23");
    }

    #[test]
    fn test_scalar_dispatch() {
        let lua = mlua::Lua::new();
        let mut buf = OutputBuffer::new(0);
        serialize_value(&mut buf, &Value::Nil).unwrap();
        serialize_value(&mut buf, &Value::Boolean(true)).unwrap();
        serialize_value(&mut buf, &Value::Integer(7)).unwrap();
        serialize_value(&mut buf, &Value::String(lua.create_string("abc").unwrap())).unwrap();
        assert_eq!(buf.as_bytes(), b"niltrue7abc");
    }

    #[test]
    fn test_unsupported_values_ignored() {
        let lua = mlua::Lua::new();
        let f: mlua::Function = lua.load("return function() end").eval().unwrap();
        let mut buf = OutputBuffer::new(0);
        serialize_value(&mut buf, &Value::Function(f)).unwrap();
        assert_eq!(buf.pos(), 0);
    }
}
