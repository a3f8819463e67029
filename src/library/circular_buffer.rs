//! Circular buffer extension
//!
//! A time-windowed matrix of doubles for aggregating metrics inside guest
//! code. Rows cover fixed time intervals; writing past the newest row
//! advances the window and clears the rows that were skipped. The serializer
//! recognizes this type and emits a JSON header line followed by one
//! tab-separated line per row, oldest first.

use mlua::{Lua, Table, UserData, UserDataMethods};

use crate::output::{append_fmt, OutputBuffer, OutputFull};
use crate::serialize::serialize_double;

const NS_PER_SEC: i64 = 1_000_000_000;

const AGGREGATION_METHODS: &[&str] = &["sum", "min", "max", "none"];

#[derive(Debug, Clone)]
struct ColumnHeader {
    name: String,
    unit: String,
    aggregation: String,
}

/// Time-series matrix with a sliding row window
#[derive(Debug)]
pub struct CircularBuffer {
    rows: usize,
    columns: usize,
    seconds_per_row: u64,
    /// Window start (ns) of the newest row
    newest_ns: i64,
    values: Vec<f64>,
    headers: Vec<ColumnHeader>,
}

impl CircularBuffer {
    pub fn new(rows: usize, columns: usize, seconds_per_row: u64) -> Self {
        let headers = (1..=columns)
            .map(|i| ColumnHeader {
                name: format!("Column_{}", i),
                unit: "count".to_string(),
                aggregation: "sum".to_string(),
            })
            .collect();
        CircularBuffer {
            rows,
            columns,
            seconds_per_row,
            newest_ns: 0,
            values: vec![f64::NAN; rows * columns],
            headers,
        }
    }

    fn period(&self) -> i64 {
        self.seconds_per_row as i64 * NS_PER_SEC
    }

    fn row_index(&self, window_start: i64) -> usize {
        (window_start / self.period()).rem_euclid(self.rows as i64) as usize
    }

    fn window_start(&self, time_ns: i64) -> i64 {
        time_ns - time_ns.rem_euclid(self.period())
    }

    fn advance(&mut self, window_start: i64) {
        let steps = ((window_start - self.newest_ns) / self.period()) as usize;
        if steps >= self.rows {
            self.values.fill(f64::NAN);
        } else {
            for step in 1..=steps {
                let idx = self.row_index(self.newest_ns + step as i64 * self.period());
                let row = &mut self.values[idx * self.columns..(idx + 1) * self.columns];
                row.fill(f64::NAN);
            }
        }
        self.newest_ns = window_start;
    }

    /// Cell index for a write; advances the window when the time is newer
    /// than anything seen. None when the time has already slid out.
    fn write_index(&mut self, time_ns: i64, column: usize) -> Option<usize> {
        let start = self.window_start(time_ns);
        if start > self.newest_ns {
            self.advance(start);
        }
        let oldest = self.newest_ns - (self.rows as i64 - 1) * self.period();
        if start < oldest {
            return None;
        }
        Some(self.row_index(start) * self.columns + column)
    }

    /// Cell index for a read; never advances the window.
    fn read_index(&self, time_ns: i64, column: usize) -> Option<usize> {
        let start = self.window_start(time_ns);
        let oldest = self.newest_ns - (self.rows as i64 - 1) * self.period();
        if start < oldest || start > self.newest_ns {
            return None;
        }
        Some(self.row_index(start) * self.columns + column)
    }

    pub fn set(&mut self, time_ns: i64, column: usize, value: f64) -> Option<f64> {
        let idx = self.write_index(time_ns, column)?;
        self.values[idx] = value;
        Some(value)
    }

    pub fn add(&mut self, time_ns: i64, column: usize, value: f64) -> Option<f64> {
        let idx = self.write_index(time_ns, column)?;
        let current = self.values[idx];
        let total = if current.is_nan() { value } else { current + value };
        self.values[idx] = total;
        Some(total)
    }

    pub fn get(&self, time_ns: i64, column: usize) -> Option<f64> {
        self.read_index(time_ns, column).map(|idx| self.values[idx])
    }

    pub fn current_time(&self) -> i64 {
        self.newest_ns
    }

    fn set_header(
        &mut self,
        column: usize,
        name: String,
        unit: String,
        aggregation: String,
    ) -> mlua::Result<()> {
        if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') || name.is_empty() {
            return Err(mlua::Error::RuntimeError(format!(
                "invalid header name '{}'",
                name
            )));
        }
        if !unit
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'/' | b'%' | b'*'))
        {
            return Err(mlua::Error::RuntimeError(format!(
                "invalid header unit '{}'",
                unit
            )));
        }
        if !AGGREGATION_METHODS.contains(&aggregation.as_str()) {
            return Err(mlua::Error::RuntimeError(format!(
                "invalid aggregation method '{}'",
                aggregation
            )));
        }
        self.headers[column] = ColumnHeader { name, unit, aggregation };
        Ok(())
    }

    /// Dump the buffer into the output stream: a JSON header line, then one
    /// tab-separated line per row, oldest row first, empty cells as `nan`.
    pub fn write_dump(&self, buf: &mut OutputBuffer) -> Result<(), OutputFull> {
        let oldest_secs =
            self.newest_ns / NS_PER_SEC - self.seconds_per_row as i64 * (self.rows as i64 - 1);
        append_fmt!(
            buf,
            "{{\"time\":{},\"rows\":{},\"columns\":{},\"seconds_per_row\":{},\"column_info\":[",
            oldest_secs,
            self.rows,
            self.columns,
            self.seconds_per_row
        )?;
        for (i, header) in self.headers.iter().enumerate() {
            if i > 0 {
                buf.append_char(',')?;
            }
            append_fmt!(
                buf,
                "{{\"name\":\"{}\",\"unit\":\"{}\",\"aggregation\":\"{}\"}}",
                header.name,
                header.unit,
                header.aggregation
            )?;
        }
        buf.append_str("]}\n")?;

        for row in 0..self.rows {
            let start = self.newest_ns - (self.rows as i64 - 1 - row as i64) * self.period();
            let idx = self.row_index(start);
            for col in 0..self.columns {
                if col > 0 {
                    buf.append_char('\t')?;
                }
                let value = self.values[idx * self.columns + col];
                if value.is_nan() {
                    buf.append_str("nan")?;
                } else {
                    serialize_double(buf, value)?;
                }
            }
            buf.append_char('\n')?;
        }
        Ok(())
    }
}

fn check_column(columns: usize, column: i64) -> mlua::Result<usize> {
    if column < 1 || column as usize > columns {
        return Err(mlua::Error::RuntimeError(format!(
            "column out of range: {}",
            column
        )));
    }
    Ok(column as usize - 1)
}

impl UserData for CircularBuffer {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method_mut("set", |_, this, (ns, col, value): (i64, i64, f64)| {
            let col = check_column(this.columns, col)?;
            Ok(this.set(ns, col, value))
        });
        methods.add_method_mut("add", |_, this, (ns, col, value): (i64, i64, f64)| {
            let col = check_column(this.columns, col)?;
            Ok(this.add(ns, col, value))
        });
        methods.add_method("get", |_, this, (ns, col): (i64, i64)| {
            let col = check_column(this.columns, col)?;
            Ok(this.get(ns, col))
        });
        methods.add_method_mut(
            "set_header",
            |_, this, (col, name, unit, aggregation): (i64, String, Option<String>, Option<String>)| {
                let col = check_column(this.columns, col)?;
                this.set_header(
                    col,
                    name,
                    unit.unwrap_or_else(|| "count".to_string()),
                    aggregation.unwrap_or_else(|| "sum".to_string()),
                )?;
                Ok(col as i64 + 1)
            },
        );
        methods.add_method("current_time", |_, this, ()| Ok(this.current_time()));
    }
}

/// Build the circular_buffer library table.
pub fn loader(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    let new = lua.create_function(|_, (rows, columns, seconds_per_row): (i64, i64, i64)| {
        if rows < 2 {
            return Err(mlua::Error::RuntimeError(
                "rows must be greater than 1".to_string(),
            ));
        }
        if columns < 1 {
            return Err(mlua::Error::RuntimeError(
                "columns must be greater than zero".to_string(),
            ));
        }
        if seconds_per_row < 1 {
            return Err(mlua::Error::RuntimeError(
                "seconds_per_row must be greater than zero".to_string(),
            ));
        }
        Ok(CircularBuffer::new(
            rows as usize,
            columns as usize,
            seconds_per_row as u64,
        ))
    })?;
    table.set("new", new)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_add_get() {
        let mut cb = CircularBuffer::new(3, 2, 1);
        assert_eq!(cb.set(NS_PER_SEC, 0, 1.0), Some(1.0));
        assert_eq!(cb.add(NS_PER_SEC, 0, 2.0), Some(3.0));
        assert_eq!(cb.get(NS_PER_SEC, 0), Some(3.0));
        // Untouched cell reads as NaN
        assert!(cb.get(NS_PER_SEC, 1).unwrap().is_nan());
    }

    #[test]
    fn test_advancing_clears_skipped_rows() {
        let mut cb = CircularBuffer::new(3, 1, 1);
        cb.set(0, 0, 1.0);
        cb.set(NS_PER_SEC, 0, 2.0);
        // Jump two rows forward; the oldest row slides out
        cb.set(3 * NS_PER_SEC, 0, 4.0);
        assert_eq!(cb.get(0, 0), None);
        assert_eq!(cb.get(NS_PER_SEC, 0), Some(2.0));
        assert_eq!(cb.get(3 * NS_PER_SEC, 0), Some(4.0));
        // The skipped interval was cleared, not recycled
        assert!(cb.get(2 * NS_PER_SEC, 0).unwrap().is_nan());
    }

    #[test]
    fn test_write_too_old_is_rejected() {
        let mut cb = CircularBuffer::new(2, 1, 1);
        cb.set(10 * NS_PER_SEC, 0, 1.0);
        assert_eq!(cb.set(0, 0, 9.0), None);
    }

    #[test]
    fn test_large_jump_clears_everything() {
        let mut cb = CircularBuffer::new(3, 1, 1);
        cb.set(0, 0, 1.0);
        cb.set(100 * NS_PER_SEC, 0, 2.0);
        assert!(cb.get(99 * NS_PER_SEC, 0).unwrap().is_nan());
        assert_eq!(cb.get(100 * NS_PER_SEC, 0), Some(2.0));
    }

    #[test]
    fn test_dump_shape() {
        let mut cb = CircularBuffer::new(2, 2, 1);
        cb.set(NS_PER_SEC, 0, 1.0);
        cb.set(NS_PER_SEC, 1, 2.5);

        let mut buf = OutputBuffer::new(0);
        cb.write_dump(&mut buf).unwrap();
        let text = String::from_utf8(buf.take()).unwrap();

        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("{\"time\":0,\"rows\":2,\"columns\":2,\"seconds_per_row\":1,"));
        assert!(header.contains("\"name\":\"Column_1\""));
        // Oldest row first, newest (populated) last
        assert_eq!(lines.next().unwrap(), "nan\tnan");
        assert_eq!(lines.next().unwrap(), "1\t2.5");
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_header_validation() {
        let mut cb = CircularBuffer::new(2, 1, 1);
        assert!(cb
            .set_header(0, "bytes_sent".into(), "B".into(), "sum".into())
            .is_ok());
        assert!(cb
            .set_header(0, "bad name".into(), "B".into(), "sum".into())
            .is_err());
        assert!(cb
            .set_header(0, "ok".into(), "B".into(), "median".into())
            .is_err());
    }
}
