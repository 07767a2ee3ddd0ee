// # Key and Value Model
//
// Shared types for the cache: the key and value enums, the on-disk storage
// mode, and the streaming read handle for file-backed values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;

/// SQLite-compatible scalar used for key and value columns.
pub type SqlValue = rusqlite::types::Value;

// ============================================================================
// Keys
// ============================================================================

/// A cache key.
///
/// Integers and floats are always stored raw in the index. Text and byte
/// keys are stored raw while short, and opaque-encoded beyond
/// [`MAX_RAW_KEY_BYTES`](crate::disk::MAX_RAW_KEY_BYTES).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Key {
    /// 64-bit signed integer
    Int(i64),

    /// 64-bit floating point
    Float(f64),

    /// UTF-8 text
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Key::Int(a), Key::Int(b)) => a == b,
            (Key::Float(a), Key::Float(b)) => a.to_bits() == b.to_bits(),
            (Key::Text(a), Key::Text(b)) => a == b,
            (Key::Bytes(a), Key::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Key {}

impl std::hash::Hash for Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Key::Int(i) => i.hash(state),
            Key::Float(f) => f.to_bits().hash(state),
            Key::Text(s) => s.hash(state),
            Key::Bytes(b) => b.hash(state),
        }
    }
}

impl Key {
    /// Stable byte rendering used for shard routing. Identical across
    /// processes and runs.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Key::Int(i) => {
                let mut out = vec![0u8];
                out.extend_from_slice(&i.to_le_bytes());
                out
            }
            Key::Float(f) => {
                let mut out = vec![1u8];
                out.extend_from_slice(&f.to_bits().to_le_bytes());
                out
            }
            Key::Text(s) => {
                let mut out = vec![2u8];
                out.extend_from_slice(s.as_bytes());
                out
            }
            Key::Bytes(b) => {
                let mut out = vec![3u8];
                out.extend_from_slice(b);
                out
            }
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Float(x) => write!(f, "{}", x),
            Key::Text(s) => write!(f, "{}", s),
            Key::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Int(i as i64)
    }
}

impl From<f64> for Key {
    fn from(f: f64) -> Self {
        Key::Float(f)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

impl From<Vec<u8>> for Key {
    fn from(b: Vec<u8>) -> Self {
        Key::Bytes(b)
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Self {
        Key::Bytes(b.to_vec())
    }
}

// ============================================================================
// Values
// ============================================================================

/// A cache value.
///
/// Scalars live inline in the index row. Text and byte values are stored
/// inline while smaller than the `disk_min_file_size` setting and spill to
/// a heap file otherwise. `Json` carries structured data and always rides
/// the opaque codec of the configured [`Disk`](crate::disk::Disk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// 64-bit signed integer
    Int(i64),

    /// 64-bit floating point
    Float(f64),

    /// UTF-8 text
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Structured data, opaque-encoded on disk
    Json(serde_json::Value),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Integer payload, if this value is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Byte payload, if this value is binary.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Text payload, if this value is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        Value::Json(j)
    }
}

// ============================================================================
// Storage mode
// ============================================================================

/// How an entry's value is represented on disk.
///
/// Inline versus heap-file placement is carried separately by the row's
/// `filename` column: a null filename means the value lives in the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No value (legacy rows only)
    None = 0,

    /// Native scalar or short bytes stored directly
    Raw = 1,

    /// Binary payload
    Binary = 2,

    /// UTF-8 text payload
    Text = 3,

    /// Opaque-encoded structured payload
    Opaque = 4,
}

impl Mode {
    pub(crate) fn from_i64(mode: i64) -> Option<Mode> {
        match mode {
            0 => Some(Mode::None),
            1 => Some(Mode::Raw),
            2 => Some(Mode::Binary),
            3 => Some(Mode::Text),
            4 => Some(Mode::Opaque),
            _ => None,
        }
    }
}

// ============================================================================
// Queue side
// ============================================================================

/// Which end of the queue an operation works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Side {
    /// Lowest synthetic key
    #[default]
    Front,

    /// Highest synthetic key
    Back,
}

// ============================================================================
// Retrieval forms
// ============================================================================

/// A retrieved value together with its expiration and tag metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// The decoded value
    pub value: Value,

    /// Absolute expiration time in epoch seconds, if any
    pub expire_time: Option<f64>,

    /// Tag label, if any
    pub tag: Option<String>,
}

/// Streaming handle over a stored value.
///
/// File-backed values hold an open file whose lifetime is bound to the
/// handle; inline values are served from memory.
#[derive(Debug)]
pub enum ValueReader {
    /// Out-of-line value, read straight from the heap file
    File { file: File, path: PathBuf },

    /// Inline value, served from a memory buffer
    Memory(Cursor<Vec<u8>>),
}

impl ValueReader {
    /// Path of the backing heap file, when out-of-line.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            ValueReader::File { path, .. } => Some(path),
            ValueReader::Memory(_) => None,
        }
    }

    /// Read the remaining content to a byte vector.
    pub fn read_all(&mut self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for ValueReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ValueReader::File { file, .. } => file.read(buf),
            ValueReader::Memory(cursor) => cursor.read(buf),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equality() {
        assert_eq!(Key::from(42), Key::Int(42));
        assert_eq!(Key::from("hello"), Key::Text("hello".to_string()));
        assert_ne!(Key::Int(1), Key::Float(1.0));
        assert_eq!(Key::Float(f64::NAN), Key::Float(f64::NAN));
    }

    #[test]
    fn test_canonical_bytes_distinct() {
        let keys = [
            Key::Int(0),
            Key::Float(0.0),
            Key::Text(String::new()),
            Key::Bytes(Vec::new()),
        ];
        for (i, a) in keys.iter().enumerate() {
            for (j, b) in keys.iter().enumerate() {
                if i != j {
                    assert_ne!(a.canonical_bytes(), b.canonical_bytes());
                }
            }
        }
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Int(7).as_int(), Some(7));
        assert_eq!(Value::Text("x".into()).as_int(), None);
        assert_eq!(Value::Bytes(vec![1, 2]).as_bytes(), Some(&[1u8, 2][..]));
    }

    #[test]
    fn test_mode_roundtrip() {
        for mode in [Mode::None, Mode::Raw, Mode::Binary, Mode::Text, Mode::Opaque] {
            assert_eq!(Mode::from_i64(mode as i64), Some(mode));
        }
        assert_eq!(Mode::from_i64(99), None);
    }
}
