//! Bencode codec for the nREPL wire protocol.
//!
//! nREPL messages are bencode dictionaries exchanged over a TCP stream.
//! This module provides the value model, a canonical encoder, and a
//! resumable single-pass decoder that reports how many bytes it consumed
//! so callers can slice successive values out of one accumulating buffer.
//!
//! # Wire Format
//!
//! ```text
//! string  5:hello            (length prefix is the UTF-8 *byte* count)
//! integer i42e  i-7e
//! list    l5:helloi42ee
//! dict    d2:id2:a12:op5:clonee   (keys in ascending byte order)
//! ```
//!
//! Dictionary encoding is canonical: entries are emitted in ascending
//! lexicographic key order regardless of insertion order, so two maps
//! with the same pairs always encode to identical bytes.
//!
//! # Incomplete input
//!
//! The decoder cannot tell a truncated value apart from a malformed one;
//! the format has no framing. Callers reading from a stream must treat
//! any decode failure as "wait for more bytes" and retain the unconsumed
//! tail (see [`crate::nrepl::NreplClient`]'s read loop).

use std::collections::BTreeMap;

use thiserror::Error;

/// Codec error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BencodeError {
    /// Integer missing its `e` terminator or containing invalid digits.
    #[error("malformed integer")]
    MalformedInteger,

    /// List reached end of buffer before its `e` terminator.
    #[error("unterminated list")]
    UnterminatedList,

    /// Dictionary reached end of buffer before its `e` terminator.
    #[error("unterminated dictionary")]
    UnterminatedMap,

    /// Dictionary key decoded to something other than a string.
    #[error("dictionary key is not a string")]
    NonStringKey,

    /// String buffer ended before the declared byte length was satisfied.
    #[error("string shorter than declared length")]
    TruncatedString,

    /// Leading byte does not start any bencode value.
    #[error("byte {0:#04x} does not start a bencode value")]
    InvalidPrefix(u8),

    /// Value has no bencode representation (JSON null, bool, float).
    #[error("unsupported value type: {0}")]
    UnsupportedType(&'static str),
}

/// A bencode value.
///
/// Dictionary keys are strings; `BTreeMap` keeps them sorted, which is
/// what makes [`encode`] canonical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Int(i64),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// View this value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// View this value as a list, if it is one.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// View this value as a dictionary, if it is one.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = BencodeError;

    /// Convert a JSON value into a bencode value.
    ///
    /// JSON null, booleans, and non-integral numbers have no bencode
    /// form and fail with [`BencodeError::UnsupportedType`].
    fn try_from(json: serde_json::Value) -> Result<Self, BencodeError> {
        match json {
            serde_json::Value::Null => Err(BencodeError::UnsupportedType("null")),
            serde_json::Value::Bool(_) => Err(BencodeError::UnsupportedType("boolean")),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .ok_or(BencodeError::UnsupportedType("non-integer number")),
            serde_json::Value::String(s) => Ok(Value::Str(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Value::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            serde_json::Value::Object(entries) => entries
                .into_iter()
                .map(|(k, v)| Ok((k, Value::try_from(v)?)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Map),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Str(s) => serde_json::Value::String(s),
            Value::Int(n) => serde_json::Value::Number(n.into()),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

/// Encode a value to its canonical bencode byte form.
///
/// String length prefixes count UTF-8 bytes, not characters.
/// Dictionary entries are written in ascending key order.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Str(s) => {
            out.extend_from_slice(s.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(s.as_bytes());
        }
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Map(map) => {
            out.push(b'd');
            // BTreeMap iteration is already in ascending key order.
            for (key, val) in map {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key.as_bytes());
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

/// Decode one value from the start of `buf`.
///
/// Returns the value and the number of bytes it occupied, so the caller
/// can decode the next value from `&buf[consumed..]` or retain an
/// incomplete tail for the next read.
///
/// # Errors
///
/// Any of the `Unterminated*`/`TruncatedString`/`MalformedInteger`
/// failures may mean either malformed input or input that is simply not
/// all here yet; the decoder does not distinguish the two.
pub fn decode(buf: &[u8]) -> Result<(Value, usize), BencodeError> {
    let (value, end) = decode_at(buf, 0)?;
    Ok((value, end))
}

/// Decode one value starting at `pos`; returns the value and the
/// position just past it.
fn decode_at(buf: &[u8], pos: usize) -> Result<(Value, usize), BencodeError> {
    match buf.get(pos).copied() {
        Some(b'i') => decode_integer(buf, pos),
        Some(b'l') => decode_list(buf, pos),
        Some(b'd') => decode_map(buf, pos),
        Some(b'0'..=b'9') => decode_string(buf, pos),
        Some(other) => Err(BencodeError::InvalidPrefix(other)),
        None => Err(BencodeError::TruncatedString),
    }
}

fn decode_integer(buf: &[u8], pos: usize) -> Result<(Value, usize), BencodeError> {
    let digits_start = pos + 1;
    let end = buf[digits_start..]
        .iter()
        .position(|&b| b == b'e')
        .map(|i| digits_start + i)
        .ok_or(BencodeError::MalformedInteger)?;

    let digits =
        std::str::from_utf8(&buf[digits_start..end]).map_err(|_| BencodeError::MalformedInteger)?;
    let n: i64 = digits.parse().map_err(|_| BencodeError::MalformedInteger)?;
    Ok((Value::Int(n), end + 1))
}

fn decode_string(buf: &[u8], pos: usize) -> Result<(Value, usize), BencodeError> {
    let mut cursor = pos;
    while cursor < buf.len() && buf[cursor].is_ascii_digit() {
        cursor += 1;
    }
    match buf.get(cursor).copied() {
        // Length prefix cut off at end of buffer: more bytes may arrive.
        None => return Err(BencodeError::TruncatedString),
        Some(b':') => {}
        Some(other) => return Err(BencodeError::InvalidPrefix(other)),
    }

    let len: usize = std::str::from_utf8(&buf[pos..cursor])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::TruncatedString)?;

    let body_start = cursor + 1;
    // checked_add: a hostile length prefix near usize::MAX must not
    // overflow into a bogus (or panicking) slice bound.
    let body_end = match body_start.checked_add(len) {
        Some(end) if end <= buf.len() => end,
        _ => return Err(BencodeError::TruncatedString),
    };

    // The declared length is a byte count; multi-byte characters must
    // not be re-counted. Invalid UTF-8 is replaced rather than rejected.
    let text = String::from_utf8_lossy(&buf[body_start..body_end]).into_owned();
    Ok((Value::Str(text), body_end))
}

fn decode_list(buf: &[u8], pos: usize) -> Result<(Value, usize), BencodeError> {
    let mut items = Vec::new();
    let mut cursor = pos + 1;
    loop {
        match buf.get(cursor).copied() {
            None => return Err(BencodeError::UnterminatedList),
            Some(b'e') => return Ok((Value::List(items), cursor + 1)),
            Some(_) => {
                let (item, next) = decode_at(buf, cursor)?;
                items.push(item);
                cursor = next;
            }
        }
    }
}

fn decode_map(buf: &[u8], pos: usize) -> Result<(Value, usize), BencodeError> {
    let mut map = BTreeMap::new();
    let mut cursor = pos + 1;
    loop {
        match buf.get(cursor).copied() {
            None => return Err(BencodeError::UnterminatedMap),
            Some(b'e') => return Ok((Value::Map(map), cursor + 1)),
            Some(_) => {
                let (key, after_key) = decode_at(buf, cursor)?;
                let key = match key {
                    Value::Str(s) => s,
                    _ => return Err(BencodeError::NonStringKey),
                };
                if after_key >= buf.len() {
                    return Err(BencodeError::UnterminatedMap);
                }
                let (val, after_val) = decode_at(buf, after_key)?;
                map.insert(key, val);
                cursor = after_val;
            }
        }
    }
}
