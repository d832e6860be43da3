//! Disk Module
//!
//! The store/fetch contract between a cache shard and the code that turns
//! values into bytes on disk, plus its two implementations.

mod file;
mod gzip;

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::DiskOptions;
use crate::error::Result;

pub use file::FileDisk;
pub use gzip::{compress, decompress, GzipDisk, CHUNK_SIZE};

// == Store Mode ==
/// How a stored payload is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Small scalar or text kept inline in the index
    Raw,
    /// Opaque byte blob
    Binary,
    /// UTF-8 text in its own file
    Text,
    /// JSON-encoded structured value
    Structured,
}

impl StoreMode {
    /// Integer stored in the shard index.
    pub fn code(self) -> i64 {
        match self {
            StoreMode::Raw => 1,
            StoreMode::Binary => 2,
            StoreMode::Text => 3,
            StoreMode::Structured => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(StoreMode::Raw),
            2 => Some(StoreMode::Binary),
            3 => Some(StoreMode::Text),
            4 => Some(StoreMode::Structured),
            _ => None,
        }
    }
}

// == Value ==
/// A value as callers put it into and get it out of the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Structured(serde_json::Value),
}

impl Value {
    /// Returns the byte payload when this is a `Bytes` value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Consumes the value, returning the byte payload of a `Bytes` value.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Structured(value)
    }
}

// == Source ==
/// What a store call receives: an in-memory value or a byte stream.
pub enum Source<'a> {
    Value(Value),
    Reader(&'a mut (dyn Read + 'a)),
}

impl fmt::Debug for Source<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Source::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

// == Stored ==
/// Result of a store: where and how the payload ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    /// Number of payload bytes written
    pub size: u64,
    pub mode: StoreMode,
    /// Payload file relative to the shard directory
    pub filename: Option<String>,
    /// Payload kept in the index
    pub inline: Option<Vec<u8>>,
}

// == Fetched ==
/// Result of a fetch.
pub enum Fetched {
    Value(Value),
    /// Returned when the caller asked for a reader
    Reader(Box<dyn Read + Send>),
}

impl Fetched {
    /// Returns the value, reading a `Reader` fully into `Value::Bytes`.
    pub fn into_value(self) -> Result<Value> {
        match self {
            Fetched::Value(value) => Ok(value),
            Fetched::Reader(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(Value::Bytes(buf))
            }
        }
    }
}

impl fmt::Debug for Fetched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fetched::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Fetched::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

// == Disk Trait ==
/// Serializes values to a shard directory and reads them back.
///
/// A shard calls `store` before it records an entry in its index and
/// `fetch` with the mode, file name and inline bytes it recorded.
pub trait Disk: Send + Sync {
    /// Opens the disk for a shard directory.
    fn open(directory: &Path, options: &DiskOptions) -> Self
    where
        Self: Sized;

    /// Writes a value, returning how it was stored.
    fn store(&self, source: Source<'_>, key: &str) -> Result<Stored>;

    /// Reads a payload back. With `read` set, file payloads come back as a reader.
    fn fetch(
        &self,
        mode: StoreMode,
        filename: Option<&str>,
        inline: Option<&[u8]>,
        read: bool,
    ) -> Result<Fetched>;

    /// Deletes a payload file. Missing files are not an error.
    fn remove(&self, filename: &str) -> Result<()>;

    /// Lists every payload file under the directory, as names `fetch` accepts.
    fn files(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(vec![1u8, 2]), Value::Bytes(vec![1, 2]));
        assert_eq!(Value::from("hi"), Value::Text("hi".to_string()));
        assert_eq!(Value::from(7i64), Value::Integer(7));
        assert_eq!(
            Value::from(serde_json::json!({"a": 1})),
            Value::Structured(serde_json::json!({"a": 1}))
        );
    }

    #[test]
    fn test_value_bytes_accessors() {
        let value = Value::Bytes(b"abc".to_vec());
        assert_eq!(value.as_bytes(), Some(&b"abc"[..]));
        assert_eq!(value.into_bytes(), Some(b"abc".to_vec()));
        assert_eq!(Value::Integer(1).as_bytes(), None);
    }

    #[test]
    fn test_fetched_reader_into_value() {
        let fetched = Fetched::Reader(Box::new(Cursor::new(b"stream".to_vec())));
        assert_eq!(fetched.into_value().unwrap(), Value::Bytes(b"stream".to_vec()));
    }

    #[test]
    fn test_store_mode_serde() {
        assert_eq!(serde_json::to_string(&StoreMode::Binary).unwrap(), "\"binary\"");
    }

    #[test]
    fn test_store_mode_codes() {
        for mode in [StoreMode::Raw, StoreMode::Binary, StoreMode::Text, StoreMode::Structured] {
            assert_eq!(StoreMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(StoreMode::from_code(0), None);
    }
}
