//! Field values and their encodings

use std::fmt::{self, Write as _};

use bytes::BufMut;

/// The value carried by a [`Field`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    /// Written as `T` or `F`
    Bool(bool),
    /// Written in base 10 with an `i` suffix
    Int(i64),
    /// Written in shortest plain decimal form, never in exponent form.
    /// Non-finite values are written as `NaN`, `+Inf` and `-Inf`.
    Float(f64),
    /// Written verbatim, unquoted
    Str(&'a [u8]),
}

/// A named value in a line. Fields are written in the order supplied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field<'a> {
    /// Field name, written verbatim
    pub name: &'a [u8],
    /// Field value
    pub value: Value<'a>,
}

impl<'a> Field<'a> {
    /// A field with an arbitrary byte name and value.
    #[must_use]
    pub fn new(name: &'a [u8], value: Value<'a>) -> Self {
        Self { name, value }
    }

    /// A boolean field.
    #[must_use]
    pub fn bool(name: &'a str, value: bool) -> Self {
        Self::new(name.as_bytes(), Value::Bool(value))
    }

    /// A signed integer field.
    #[must_use]
    pub fn int(name: &'a str, value: i64) -> Self {
        Self::new(name.as_bytes(), Value::Int(value))
    }

    /// A float field.
    #[must_use]
    pub fn float(name: &'a str, value: f64) -> Self {
        Self::new(name.as_bytes(), Value::Float(value))
    }

    /// A string field.
    #[must_use]
    pub fn string(name: &'a str, value: &'a str) -> Self {
        Self::new(name.as_bytes(), Value::Str(value.as_bytes()))
    }

    pub(crate) fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.name);
        buf.put_u8(b'=');
        match self.value {
            Value::Bool(true) => buf.put_u8(b'T'),
            Value::Bool(false) => buf.put_u8(b'F'),
            Value::Int(v) => {
                crate::put_i64(buf, v);
                buf.put_u8(b'i');
            }
            Value::Float(v) if v.is_nan() => buf.put_slice(b"NaN"),
            Value::Float(v) if v.is_infinite() => {
                buf.put_slice(if v > 0.0 { b"+Inf" } else { b"-Inf" });
            }
            Value::Float(v) => {
                // Display for f64 is the shortest round-tripping decimal and
                // never switches to exponent notation.
                let _ = write!(BufWriter(buf), "{v}");
            }
            Value::Str(v) => buf.put_slice(v),
        }
    }
}

/// `fmt::Write` over a `BufMut`. Never fails.
struct BufWriter<'b, B>(&'b mut B);

impl<B: BufMut> fmt::Write for BufWriter<'_, B> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.put_slice(s.as_bytes());
        Ok(())
    }
}
