//! The flurry line protocol encoder
//!
//! This library turns a series key, an ordered list of fields and a timestamp
//! into exactly one newline terminated line:
//!
//! ```text
//! <series key> <field>[,<field>...] <timestamp>\n
//! ```
//!
//! No quoting or escaping is done here. Measurement names, tag pairs, field
//! names and string values are written byte-for-byte and callers are
//! responsible for handing over values that need no escaping. This is a
//! deliberate limitation of the encoder, not something to quietly fix up.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::{
    fmt,
    io::{self, Write},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, Bytes};

pub mod field;

pub use field::{Field, Value};

/// Errors produced by [`write_line`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The destination refused the encoded line.
    #[error("Failed to write line: {0}")]
    Io(#[from] io::Error),
}

/// The identity of a time series: a measurement name and its tag set.
///
/// Keys built through [`SeriesKey::new`] have their tags sorted by name. Keys
/// built through [`SeriesKey::from_raw`] are taken as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey(Bytes);

impl SeriesKey {
    /// Build a key of the form `measurement,tag1=v1,tag2=v2`.
    ///
    /// Tags are sorted ascending by name, byte-wise. The sort is stable and
    /// duplicate names are kept in the order given; a key with duplicate tag
    /// names is not meaningful to a line protocol server.
    #[must_use]
    pub fn new(measurement: &str, tags: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<&(&str, &str)> = tags.iter().collect();
        sorted.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        let capacity = measurement.len()
            + sorted
                .iter()
                .map(|(k, v)| k.len() + v.len() + 2)
                .sum::<usize>();
        let mut key = Vec::with_capacity(capacity);
        key.extend_from_slice(measurement.as_bytes());
        for (name, value) in sorted {
            key.push(b',');
            key.extend_from_slice(name.as_bytes());
            key.push(b'=');
            key.extend_from_slice(value.as_bytes());
        }

        Self(Bytes::from(key))
    }

    /// Wrap an already encoded key without inspecting it.
    #[must_use]
    pub fn from_raw(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    /// The encoded key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for SeriesKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// A single measurement point, borrowed from its parts.
#[derive(Debug, Clone, Copy)]
pub struct Point<'a> {
    /// Series the point belongs to
    pub key: &'a SeriesKey,
    /// Fields in the order they will be written
    pub fields: &'a [Field<'a>],
    /// Nanoseconds since the Unix epoch
    pub timestamp: i64,
}

impl Point<'_> {
    /// Append this point's line to `buf`. See [`encode`].
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        encode(buf, self.key.as_bytes(), self.fields, self.timestamp);
    }
}

/// Append one encoded line to an in-memory, growable destination.
///
/// Appending to a growing buffer cannot fail and so this function returns
/// nothing. Fixed-size destinations such as `&mut [u8]` will panic when full,
/// use [`write_line`] for anything that is not a growable buffer.
pub fn encode<B: BufMut>(buf: &mut B, series_key: &[u8], fields: &[Field<'_>], timestamp: i64) {
    buf.put_slice(series_key);
    buf.put_u8(b' ');
    for (idx, field) in fields.iter().enumerate() {
        if idx != 0 {
            buf.put_u8(b',');
        }
        field.encode(buf);
    }
    buf.put_u8(b' ');
    put_i64(buf, timestamp);
    buf.put_u8(b'\n');
}

/// Write one encoded line to `writer`.
///
/// The line is assembled in memory and handed to `writer` in one
/// `write_all` call.
///
/// # Errors
///
/// Function will return an error if `writer` fails to accept the line.
pub fn write_line<W: Write + ?Sized>(
    writer: &mut W,
    series_key: &[u8],
    fields: &[Field<'_>],
    timestamp: i64,
) -> Result<(), Error> {
    let mut line = Vec::with_capacity(series_key.len() + 16 * fields.len() + 24);
    encode(&mut line, series_key, fields, timestamp);
    writer.write_all(&line)?;
    Ok(())
}

/// Nanoseconds since the Unix epoch, according to the system clock.
///
/// Clocks set before the epoch report zero.
#[must_use]
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Base-10 encoding of `value` without going through `fmt`.
pub(crate) fn put_i64<B: BufMut>(buf: &mut B, value: i64) {
    // i64::MIN has 19 digits plus a sign.
    let mut scratch = [0_u8; 20];
    let mut pos = scratch.len();
    let mut remaining = value.unsigned_abs();
    loop {
        pos -= 1;
        #[allow(clippy::cast_possible_truncation)]
        let digit = (remaining % 10) as u8;
        scratch[pos] = b'0' + digit;
        remaining /= 10;
        if remaining == 0 {
            break;
        }
    }
    if value < 0 {
        buf.put_u8(b'-');
    }
    buf.put_slice(&scratch[pos..]);
}

#[cfg(test)]
mod tests {
    use std::io;

    use proptest::prelude::*;

    use super::*;

    fn line(key: &[u8], fields: &[Field<'_>], timestamp: i64) -> String {
        let mut buf = Vec::new();
        encode(&mut buf, key, fields, timestamp);
        String::from_utf8(buf).expect("encoder produced invalid utf-8")
    }

    #[test]
    fn rooms_point_encodes_exactly() {
        let key = SeriesKey::new("rooms", &[("room", "r1"), ("building", "b1")]);
        let fields = [
            Field::bool("lights", true),
            Field::int("occupants", 3),
            Field::float("temp_f", 72.5),
            Field::string("meeting_name", "bikeshed"),
        ];
        let point = Point {
            key: &key,
            fields: &fields,
            timestamp: 1_435_362_189_575_692_182,
        };

        let mut buf = bytes::BytesMut::new();
        point.encode(&mut buf);

        assert_eq!(
            &buf[..],
            b"rooms,building=b1,room=r1 lights=T,occupants=3i,temp_f=72.5,meeting_name=bikeshed 1435362189575692182\n"
        );
    }

    #[test]
    fn single_int_field() {
        assert_eq!(
            line(b"cpu,host=h1", &[Field::int("usage", 99)], 123),
            "cpu,host=h1 usage=99i 123\n"
        );
    }

    #[test]
    fn extreme_integers() {
        assert_eq!(
            line(b"m", &[Field::int("lo", i64::MIN), Field::int("hi", i64::MAX)], -1),
            "m lo=-9223372036854775808i,hi=9223372036854775807i -1\n"
        );
        assert_eq!(line(b"m", &[Field::int("z", 0)], 0), "m z=0i 0\n");
    }

    #[test]
    fn floats_use_plain_decimal() {
        assert_eq!(line(b"m", &[Field::float("f", 3.0)], 1), "m f=3 1\n");
        assert_eq!(line(b"m", &[Field::float("f", -0.25)], 1), "m f=-0.25 1\n");
        assert_eq!(
            line(b"m", &[Field::float("f", 1e21)], 1),
            "m f=1000000000000000000000 1\n"
        );
    }

    #[test]
    fn non_finite_floats() {
        let fields = [
            Field::float("a", f64::NAN),
            Field::float("b", f64::INFINITY),
            Field::float("c", f64::NEG_INFINITY),
        ];
        assert_eq!(line(b"m", &fields, 1), "m a=NaN,b=+Inf,c=-Inf 1\n");
    }

    #[test]
    fn false_renders_as_f() {
        assert_eq!(line(b"m", &[Field::bool("b", false)], 7), "m b=F 7\n");
    }

    #[test]
    fn strings_are_not_escaped() {
        assert_eq!(
            line(b"m", &[Field::string("s", "a b,c=d")], 7),
            "m s=a b,c=d 7\n"
        );
    }

    #[test]
    fn series_key_without_tags() {
        assert_eq!(SeriesKey::new("cpu", &[]).as_bytes(), b"cpu");
    }

    #[test]
    fn series_key_keeps_duplicate_tags() {
        let key = SeriesKey::new("m", &[("b", "2"), ("a", "1"), ("b", "1")]);
        assert_eq!(key.as_bytes(), b"m,a=1,b=2,b=1");
    }

    #[test]
    fn series_key_sorts_bytewise() {
        let key = SeriesKey::new("m", &[("a", "1"), ("B", "2"), ("_", "3")]);
        assert_eq!(key.to_string(), "m,B=2,_=3,a=1");
    }

    struct Refusing;

    impl Write for Refusing {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_line_propagates_destination_errors() {
        let res = write_line(&mut Refusing, b"m", &[Field::int("a", 1)], 1);
        match res {
            Err(Error::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::BrokenPipe),
            Ok(()) => panic!("expected an error"),
        }
    }

    #[test]
    fn write_line_matches_encode() {
        let fields = [Field::int("a", 1), Field::bool("b", true)];
        let mut out = Vec::new();
        write_line(&mut out, b"m,t=v", &fields, 42).expect("vec writes cannot fail");
        assert_eq!(String::from_utf8(out).expect("valid utf-8"), line(b"m,t=v", &fields, 42));
    }

    #[derive(Debug, Clone)]
    enum Generated {
        Bool(bool),
        Int(i64),
        Float(f64),
        Str(String),
    }

    fn generated() -> impl Strategy<Value = Generated> {
        prop_oneof![
            any::<bool>().prop_map(Generated::Bool),
            any::<i64>().prop_map(Generated::Int),
            (-1.0e12_f64..1.0e12_f64).prop_map(Generated::Float),
            "[a-zA-Z0-9_.]{0,12}".prop_map(Generated::Str),
        ]
    }

    proptest! {
        // Splitting an encoded line on its delimiters gives back what went in.
        #[test]
        fn encoded_lines_split_back_into_parts(
            measurement in "[a-z][a-z0-9_]{0,8}",
            tags in proptest::collection::vec(("[a-z]{1,6}", "[a-z0-9]{1,6}"), 0..4),
            values in proptest::collection::vec(("[a-z][a-z_]{0,8}", generated()), 1..6),
            timestamp in any::<i64>(),
        ) {
            let tag_refs: Vec<(&str, &str)> = tags.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let key = SeriesKey::new(&measurement, &tag_refs);
            let fields: Vec<Field<'_>> = values.iter().map(|(name, value)| match value {
                Generated::Bool(b) => Field::bool(name, *b),
                Generated::Int(i) => Field::int(name, *i),
                Generated::Float(f) => Field::float(name, *f),
                Generated::Str(s) => Field::string(name, s),
            }).collect();

            let encoded = line(key.as_bytes(), &fields, timestamp);
            prop_assert!(encoded.ends_with('\n'));
            let parts: Vec<&str> = encoded.trim_end_matches('\n').split(' ').collect();
            prop_assert_eq!(parts.len(), 3);
            prop_assert_eq!(parts[0].as_bytes(), key.as_bytes());
            prop_assert_eq!(parts[2].parse::<i64>().expect("timestamp"), timestamp);

            let pairs: Vec<&str> = parts[1].split(',').collect();
            prop_assert_eq!(pairs.len(), values.len());
            for (pair, (name, value)) in pairs.iter().zip(values.iter()) {
                let (got_name, got_value) = pair.split_once('=').expect("name=value");
                prop_assert_eq!(got_name, name.as_str());
                match value {
                    Generated::Bool(b) => prop_assert_eq!(got_value, if *b { "T" } else { "F" }),
                    Generated::Int(i) => prop_assert_eq!(got_value, format!("{i}i")),
                    Generated::Float(f) => prop_assert_eq!(got_value.parse::<f64>().expect("float"), *f),
                    Generated::Str(s) => prop_assert_eq!(got_value, s.as_str()),
                }
            }
        }
    }

    proptest! {
        #[test]
        fn put_i64_agrees_with_display(value: i64) {
            let mut buf = Vec::new();
            put_i64(&mut buf, value);
            prop_assert_eq!(String::from_utf8(buf).expect("digits"), value.to_string());
        }
    }
}
