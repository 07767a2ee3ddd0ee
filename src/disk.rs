// # Serializer
//
// Translates application keys and values to the form the index store and
// file heap hold, and back. The cache engine talks to a `Disk` trait
// object; the provided methods implement the placement rules and the two
// required methods form the opaque-codec override point.

use crate::error::{CacheError, Result};
use crate::heap::FileHeap;
use crate::types::{Key, Mode, SqlValue, Value, ValueReader};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{Cursor, Read, Write};

/// Text and byte keys longer than this are opaque-encoded rather than
/// stored raw in the index.
pub const MAX_RAW_KEY_BYTES: usize = 1024;

/// Copy granularity for streamed values.
const STREAM_CHUNK: usize = 4 * 1024 * 1024;

/// Placement decision for a value about to be written.
///
/// When `filename` is set, the heap file has already been written and the
/// caller owns cleaning it up if its transaction fails.
#[derive(Debug, Clone)]
pub struct StoredValue {
    /// Logical byte size charged against the size counter
    pub size: i64,

    /// Storage mode recorded in the row
    pub mode: Mode,

    /// Heap file, relative to the cache root
    pub filename: Option<String>,

    /// Inline column value
    pub value: Option<SqlValue>,
}

/// Serialization capability set over which the cache engine is generic.
///
/// `put`/`get` translate keys, `store`/`fetch` translate values. The
/// default methods implement the placement rules; implementations override
/// only the opaque codec. Heap file naming and removal live on
/// [`FileHeap`].
pub trait Disk: Send + Sync {
    /// Encode a structured value for storage.
    fn encode_opaque(&self, value: &serde_json::Value) -> Result<Vec<u8>>;

    /// Decode a structured value from storage.
    fn decode_opaque(&self, data: &[u8]) -> Result<serde_json::Value>;

    /// Convert a key to its column form plus the raw flag.
    fn put(&self, key: &Key) -> Result<(SqlValue, bool)> {
        match key {
            Key::Int(i) => Ok((SqlValue::Integer(*i), true)),
            Key::Float(f) => Ok((SqlValue::Real(*f), true)),
            Key::Text(s) if s.len() <= MAX_RAW_KEY_BYTES => {
                Ok((SqlValue::Text(s.clone()), true))
            }
            Key::Bytes(b) if b.len() <= MAX_RAW_KEY_BYTES => {
                Ok((SqlValue::Blob(b.clone()), true))
            }
            other => {
                let data = bincode::serde::encode_to_vec(other, bincode::config::standard())?;
                Ok((SqlValue::Blob(data), false))
            }
        }
    }

    /// Convert a column form back to the key.
    fn get(&self, stored: &SqlValue, raw: bool) -> Result<Key> {
        if raw {
            match stored {
                SqlValue::Integer(i) => Ok(Key::Int(*i)),
                SqlValue::Real(f) => Ok(Key::Float(*f)),
                SqlValue::Text(s) => Ok(Key::Text(s.clone())),
                SqlValue::Blob(b) => Ok(Key::Bytes(b.clone())),
                SqlValue::Null => Err(CacheError::Codec("null key column".to_string())),
            }
        } else {
            let SqlValue::Blob(data) = stored else {
                return Err(CacheError::Codec("opaque key is not a blob".to_string()));
            };
            let (key, _) =
                bincode::serde::decode_from_slice(data, bincode::config::standard())?;
            Ok(key)
        }
    }

    /// Decide placement for a value, writing a heap file when it is large.
    fn store(&self, value: &Value, heap: &FileHeap, min_file_size: u64) -> Result<StoredValue> {
        match value {
            Value::Int(i) => Ok(StoredValue {
                size: 0,
                mode: Mode::Raw,
                filename: None,
                value: Some(SqlValue::Integer(*i)),
            }),
            Value::Float(f) => Ok(StoredValue {
                size: 0,
                mode: Mode::Raw,
                filename: None,
                value: Some(SqlValue::Real(*f)),
            }),
            Value::Bytes(b) => {
                if (b.len() as u64) < min_file_size {
                    Ok(StoredValue {
                        size: b.len() as i64,
                        mode: Mode::Raw,
                        filename: None,
                        value: Some(SqlValue::Blob(b.clone())),
                    })
                } else {
                    let filename = write_heap_file(heap, b)?;
                    Ok(StoredValue {
                        size: b.len() as i64,
                        mode: Mode::Binary,
                        filename: Some(filename),
                        value: None,
                    })
                }
            }
            Value::Text(s) => {
                let data = s.as_bytes();
                if (data.len() as u64) < min_file_size {
                    Ok(StoredValue {
                        size: data.len() as i64,
                        mode: Mode::Text,
                        filename: None,
                        value: Some(SqlValue::Text(s.clone())),
                    })
                } else {
                    let filename = write_heap_file(heap, data)?;
                    Ok(StoredValue {
                        size: data.len() as i64,
                        mode: Mode::Text,
                        filename: Some(filename),
                        value: None,
                    })
                }
            }
            Value::Json(j) => {
                let data = self.encode_opaque(j)?;
                if (data.len() as u64) < min_file_size {
                    Ok(StoredValue {
                        size: data.len() as i64,
                        mode: Mode::Opaque,
                        filename: None,
                        value: Some(SqlValue::Blob(data)),
                    })
                } else {
                    let size = data.len() as i64;
                    let filename = write_heap_file(heap, &data)?;
                    Ok(StoredValue {
                        size,
                        mode: Mode::Opaque,
                        filename: Some(filename),
                        value: None,
                    })
                }
            }
        }
    }

    /// Copy a caller-supplied reader into a fresh heap file.
    fn store_read(&self, reader: &mut dyn Read, heap: &FileHeap) -> Result<StoredValue> {
        let (relative, full_path) = heap.create()?;
        let result = copy_stream(reader, &full_path);
        match result {
            Ok(size) => Ok(StoredValue {
                size,
                mode: Mode::Binary,
                filename: Some(relative),
                value: None,
            }),
            Err(e) => {
                let _ = heap.remove(&relative);
                Err(e)
            }
        }
    }

    /// Reconstruct a value from its row columns, driven by mode.
    fn fetch(
        &self,
        mode: Mode,
        filename: Option<&str>,
        stored: Option<&SqlValue>,
        heap: &FileHeap,
    ) -> Result<Value> {
        match mode {
            Mode::Raw => match stored {
                Some(SqlValue::Integer(i)) => Ok(Value::Int(*i)),
                Some(SqlValue::Real(f)) => Ok(Value::Float(*f)),
                Some(SqlValue::Text(s)) => Ok(Value::Text(s.clone())),
                Some(SqlValue::Blob(b)) => Ok(Value::Bytes(b.clone())),
                _ => Err(CacheError::Codec("raw entry has no inline value".to_string())),
            },
            Mode::Binary => match filename {
                Some(name) => Ok(Value::Bytes(heap.read_bytes(name)?)),
                None => match stored {
                    Some(SqlValue::Blob(b)) => Ok(Value::Bytes(b.clone())),
                    _ => Err(CacheError::Codec("binary entry has no value".to_string())),
                },
            },
            Mode::Text => match filename {
                Some(name) => Ok(Value::Text(String::from_utf8(heap.read_bytes(name)?)?)),
                None => match stored {
                    Some(SqlValue::Text(s)) => Ok(Value::Text(s.clone())),
                    _ => Err(CacheError::Codec("text entry has no value".to_string())),
                },
            },
            Mode::Opaque => {
                let data = match filename {
                    Some(name) => heap.read_bytes(name)?,
                    None => match stored {
                        Some(SqlValue::Blob(b)) => b.clone(),
                        _ => {
                            return Err(CacheError::Codec(
                                "opaque entry has no value".to_string(),
                            ))
                        }
                    },
                };
                Ok(Value::Json(self.decode_opaque(&data)?))
            }
            Mode::None => Err(CacheError::Codec("entry has no value".to_string())),
        }
    }

    /// Open a streaming handle over a stored value.
    ///
    /// Scalars have no byte stream and are rejected.
    fn fetch_reader(
        &self,
        mode: Mode,
        filename: Option<&str>,
        stored: Option<&SqlValue>,
        heap: &FileHeap,
    ) -> Result<ValueReader> {
        if let Some(name) = filename {
            let file = heap.open(name)?;
            return Ok(ValueReader::File {
                file,
                path: heap.path(name),
            });
        }
        let bytes = match (mode, stored) {
            (Mode::Raw, Some(SqlValue::Blob(b))) => b.clone(),
            (Mode::Binary, Some(SqlValue::Blob(b))) => b.clone(),
            (Mode::Opaque, Some(SqlValue::Blob(b))) => b.clone(),
            (Mode::Text, Some(SqlValue::Text(s))) => s.clone().into_bytes(),
            _ => {
                return Err(CacheError::Codec(
                    "value has no byte stream".to_string(),
                ))
            }
        };
        Ok(ValueReader::Memory(Cursor::new(bytes)))
    }
}

fn write_heap_file(heap: &FileHeap, data: &[u8]) -> Result<String> {
    let (relative, full_path) = heap.create()?;
    match File::create(&full_path).and_then(|mut f| f.write_all(data)) {
        Ok(()) => Ok(relative),
        Err(e) => {
            let _ = heap.remove(&relative);
            Err(e.into())
        }
    }
}

fn copy_stream(reader: &mut dyn Read, full_path: &std::path::Path) -> Result<i64> {
    let mut writer = File::create(full_path)?;
    let mut buffer = vec![0u8; STREAM_CHUNK];
    let mut size: i64 = 0;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
        size += n as i64;
    }
    Ok(size)
}

// ============================================================================
// Implementations
// ============================================================================

/// Default serializer: structured values as plain JSON bytes.
#[derive(Debug, Default, Clone)]
pub struct DefaultDisk;

impl Disk for DefaultDisk {
    fn encode_opaque(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode_opaque(&self, data: &[u8]) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Alternative serializer: JSON compressed with zlib.
///
/// Validates the codec plug point; the compression level comes from the
/// `disk_pickle_protocol` setting at construction.
#[derive(Debug, Clone)]
pub struct JsonDisk {
    level: u32,
}

impl JsonDisk {
    pub fn new(level: u32) -> Self {
        Self { level }
    }
}

impl Default for JsonDisk {
    fn default() -> Self {
        Self { level: 1 }
    }
}

impl Disk for JsonDisk {
    fn encode_opaque(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(value)?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    fn decode_opaque(&self, data: &[u8]) -> Result<serde_json::Value> {
        let mut decoder = ZlibDecoder::new(data);
        let mut json = Vec::new();
        decoder.read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn heap() -> (tempfile::TempDir, FileHeap) {
        let dir = tempfile::tempdir().unwrap();
        let heap = FileHeap::new(dir.path());
        (dir, heap)
    }

    #[test]
    fn test_put_get_raw_keys() {
        let disk = DefaultDisk;
        for key in [
            Key::Int(-3),
            Key::Float(2.5),
            Key::Text("short".into()),
            Key::Bytes(vec![0, 1, 2]),
        ] {
            let (stored, raw) = disk.put(&key).unwrap();
            assert!(raw);
            assert_eq!(disk.get(&stored, raw).unwrap(), key);
        }
    }

    #[test]
    fn test_put_get_opaque_key() {
        let disk = DefaultDisk;
        let key = Key::Text("k".repeat(MAX_RAW_KEY_BYTES + 1));
        let (stored, raw) = disk.put(&key).unwrap();
        assert!(!raw);
        assert!(matches!(stored, SqlValue::Blob(_)));
        assert_eq!(disk.get(&stored, raw).unwrap(), key);
    }

    #[test]
    fn test_store_inline_below_threshold() {
        let (_dir, heap) = heap();
        let disk = DefaultDisk;

        let stored = disk
            .store(&Value::Bytes(vec![7u8; 100]), &heap, 1024)
            .unwrap();
        assert_eq!(stored.mode, Mode::Raw);
        assert_eq!(stored.size, 100);
        assert!(stored.filename.is_none());
    }

    #[test]
    fn test_store_spills_to_file() {
        let (_dir, heap) = heap();
        let disk = DefaultDisk;

        let payload = vec![7u8; 2048];
        let stored = disk.store(&Value::Bytes(payload.clone()), &heap, 1024).unwrap();
        assert_eq!(stored.mode, Mode::Binary);
        assert_eq!(stored.size, 2048);

        let name = stored.filename.unwrap();
        assert_eq!(heap.read_bytes(&name).unwrap(), payload);

        let value = disk
            .fetch(Mode::Binary, Some(&name), None, &heap)
            .unwrap();
        assert_eq!(value, Value::Bytes(payload));
    }

    #[test]
    fn test_store_read_streams() {
        let (_dir, heap) = heap();
        let disk = DefaultDisk;

        let payload = vec![42u8; 10_000];
        let mut reader = Cursor::new(payload.clone());
        let stored = disk.store_read(&mut reader, &heap).unwrap();
        assert_eq!(stored.size, 10_000);
        assert_eq!(stored.mode, Mode::Binary);

        let name = stored.filename.unwrap();
        assert_eq!(heap.read_bytes(&name).unwrap(), payload);
    }

    #[test]
    fn test_scalar_roundtrip() {
        let (_dir, heap) = heap();
        let disk = DefaultDisk;

        let stored = disk.store(&Value::Int(99), &heap, 1024).unwrap();
        assert_eq!(stored.size, 0);
        let value = disk
            .fetch(stored.mode, None, stored.value.as_ref(), &heap)
            .unwrap();
        assert_eq!(value, Value::Int(99));
    }

    #[test]
    fn test_json_roundtrip_both_disks() {
        let (_dir, heap) = heap();
        let doc = json!({"kind": "test", "values": [1, 2, 3]});

        for disk in [&DefaultDisk as &dyn Disk, &JsonDisk::new(6) as &dyn Disk] {
            let stored = disk.store(&Value::Json(doc.clone()), &heap, 4096).unwrap();
            assert_eq!(stored.mode, Mode::Opaque);
            let value = disk
                .fetch(Mode::Opaque, stored.filename.as_deref(), stored.value.as_ref(), &heap)
                .unwrap();
            assert_eq!(value, Value::Json(doc.clone()));
        }
    }

    #[test]
    fn test_json_disk_compresses() {
        let disk = JsonDisk::new(9);
        let doc = json!({"text": "a".repeat(4096)});
        let plain = serde_json::to_vec(&doc).unwrap();
        let packed = disk.encode_opaque(&doc).unwrap();
        assert!(packed.len() < plain.len());
        assert_eq!(disk.decode_opaque(&packed).unwrap(), doc);
    }
}
