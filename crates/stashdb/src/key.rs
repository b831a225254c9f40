//! Typed keys and values
//!
//! Keys are stored natively in SQLite (INTEGER, TEXT or BLOB in a column
//! without type affinity) so `Int(1)`, `Text("1")` and `Bytes(b"1")` are
//! three distinct keys. Values are a closed set of storage modes.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::de::DeserializeOwned;
use serde::Serialize;
use xxhash_rust::xxh3::Xxh3;

use crate::error::{Error, Result};

/// Lookup key of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    /// Integer key
    Int(i64),
    /// UTF-8 key
    Text(String),
    /// Raw byte key
    Bytes(Vec<u8>),
}

impl Key {
    /// Build a key from any serializable value (stored as bytes).
    pub fn from_serde<T: Serialize + ?Sized>(key: &T) -> Result<Self> {
        Ok(Key::Bytes(bincode::serialize(key)?))
    }

    /// Hash of the canonical encoding, identical across processes and restarts.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        match self {
            Key::Int(i) => {
                hasher.update(&[0]);
                hasher.update(&i.to_le_bytes());
            }
            Key::Text(s) => {
                hasher.update(&[1]);
                hasher.update(s.as_bytes());
            }
            Key::Bytes(b) => {
                hasher.update(&[2]);
                hasher.update(b);
            }
        }
        hasher.digest()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Text(s) => write!(f, "{:?}", s),
            Key::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::Int(v.into())
    }
}

impl From<u32> for Key {
    fn from(v: u32) -> Self {
        Key::Int(v.into())
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Text(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Text(v)
    }
}

impl From<&[u8]> for Key {
    fn from(v: &[u8]) -> Self {
        Key::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(v: Vec<u8>) -> Self {
        Key::Bytes(v)
    }
}

impl From<&Key> for Key {
    fn from(v: &Key) -> Self {
        v.clone()
    }
}

impl ToSql for Key {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Key::Int(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Key::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Key::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl FromSql for Key {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(i) => Ok(Key::Int(i)),
            ValueRef::Text(t) => std::str::from_utf8(t)
                .map(|s| Key::Text(s.to_string()))
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            ValueRef::Blob(b) => Ok(Key::Bytes(b.to_vec())),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// Storage mode persisted next to every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    /// Raw bytes, stored as-is
    Raw = 1,
    /// UTF-8 text, stored as-is
    Text = 2,
    /// bincode output of a serde value
    Serialized = 3,
}

impl Mode {
    /// Parse the persisted discriminant.
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Mode::Raw),
            2 => Ok(Mode::Text),
            3 => Ok(Mode::Serialized),
            other => Err(Error::Corrupt(format!("unknown value mode {}", other))),
        }
    }
}

/// A cached value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Text
    Text(String),
    /// Serialized structured data
    Data(Vec<u8>),
}

impl Value {
    /// Serialize a structured value with the default strategy.
    pub fn from_serde<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Value::Data(bincode::serialize(value)?))
    }

    /// Decode a structured value.
    ///
    /// Text and byte values decode into `String` and `Vec<u8>` targets.
    pub fn to_serde<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Value::Data(bytes) => Ok(bincode::deserialize(bytes)?),
            Value::Text(s) => Ok(bincode::deserialize(&bincode::serialize(s)?)?),
            Value::Bytes(b) => Ok(bincode::deserialize(&bincode::serialize(b)?)?),
        }
    }

    /// Storage mode for this value.
    pub fn mode(&self) -> Mode {
        match self {
            Value::Bytes(_) => Mode::Raw,
            Value::Text(_) => Mode::Text,
            Value::Data(_) => Mode::Serialized,
        }
    }

    /// Encoded payload.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Value::Bytes(b) | Value::Data(b) => b,
            Value::Text(s) => s.as_bytes(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// True for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild a value from its mode and payload.
    pub fn from_parts(mode: Mode, payload: Vec<u8>) -> Result<Self> {
        Ok(match mode {
            Mode::Raw => Value::Bytes(payload),
            Mode::Serialized => Value::Data(payload),
            Mode::Text => Value::Text(
                String::from_utf8(payload).map_err(|e| Error::Serialization(e.to_string()))?,
            ),
        })
    }

    /// Text payload, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}
