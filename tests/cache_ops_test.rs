// Core cache operations against a fresh directory.

use riverdisk::{Cache, CacheOptions, GetOptions, SetOptions, SqlValue, Value};
use std::io::Cursor;

fn open_cache() -> (tempfile::TempDir, Cache) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path()).unwrap();
    (dir, cache)
}

#[test]
fn test_set_get_roundtrip() {
    let (_dir, cache) = open_cache();

    assert!(cache.set("answer", 42).unwrap());
    assert_eq!(cache.get("answer").unwrap(), Some(Value::Int(42)));
    assert_eq!(cache.len().unwrap(), 1);
    assert!(cache.check(false).unwrap().is_empty());
}

#[test]
fn test_supported_value_shapes() {
    let (_dir, cache) = open_cache();

    cache.set("int", -5).unwrap();
    cache.set("float", 2.75).unwrap();
    cache.set("text", "hello").unwrap();
    cache.set("bytes", vec![1u8, 2, 3]).unwrap();
    cache
        .set("json", serde_json::json!({"nested": [1, 2]}))
        .unwrap();

    assert_eq!(cache.get("int").unwrap(), Some(Value::Int(-5)));
    assert_eq!(cache.get("float").unwrap(), Some(Value::Float(2.75)));
    assert_eq!(cache.get("text").unwrap(), Some(Value::Text("hello".into())));
    assert_eq!(
        cache.get("bytes").unwrap(),
        Some(Value::Bytes(vec![1, 2, 3]))
    );
    assert_eq!(
        cache.get("json").unwrap(),
        Some(Value::Json(serde_json::json!({"nested": [1, 2]})))
    );
}

#[test]
fn test_key_shapes() {
    let (_dir, cache) = open_cache();

    cache.set(7i64, "int key").unwrap();
    cache.set(1.5f64, "float key").unwrap();
    cache.set(vec![9u8, 9], "bytes key").unwrap();
    cache.set("long".repeat(1000), "opaque key").unwrap();

    assert_eq!(cache.get(7i64).unwrap(), Some(Value::Text("int key".into())));
    assert_eq!(
        cache.get(1.5f64).unwrap(),
        Some(Value::Text("float key".into()))
    );
    assert_eq!(
        cache.get(vec![9u8, 9]).unwrap(),
        Some(Value::Text("bytes key".into()))
    );
    assert_eq!(
        cache.get("long".repeat(1000)).unwrap(),
        Some(Value::Text("opaque key".into()))
    );
    assert_eq!(cache.len().unwrap(), 4);
}

#[test]
fn test_set_replaces_existing() {
    let (_dir, cache) = open_cache();

    cache.set("k", "first").unwrap();
    cache.set("k", "second").unwrap();
    assert_eq!(cache.get("k").unwrap(), Some(Value::Text("second".into())));
    assert_eq!(cache.len().unwrap(), 1);
}

#[test]
fn test_large_value_uses_heap_file() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path()).unwrap();
    let threshold = 1 << 15;
    let payload = vec![b'x'; threshold + 1];

    assert!(cache.set("big", payload.clone()).unwrap());

    // Exactly one file appears under the two-level tree.
    let mut value_files = Vec::new();
    for top in std::fs::read_dir(dir.path()).unwrap() {
        let top = top.unwrap();
        if !top.file_type().unwrap().is_dir() {
            continue;
        }
        for sub in std::fs::read_dir(top.path()).unwrap() {
            for file in std::fs::read_dir(sub.unwrap().path()).unwrap() {
                value_files.push(file.unwrap().path());
            }
        }
    }
    assert_eq!(value_files.len(), 1);

    // The streaming handle yields the written bytes.
    let mut reader = cache.read("big").unwrap().unwrap();
    assert_eq!(reader.read_all().unwrap(), payload);
    assert!(cache.path("big").unwrap().is_some());

    // Delete removes both row and file.
    assert!(cache.delete("big", false).unwrap());
    assert!(!value_files[0].exists());
    assert_eq!(cache.len().unwrap(), 0);
}

#[test]
fn test_set_read_streams_value() {
    let (_dir, cache) = open_cache();
    let payload = vec![7u8; 100_000];

    let mut source = Cursor::new(payload.clone());
    cache
        .set_read("streamed", &mut source, &SetOptions::default())
        .unwrap();

    assert_eq!(
        cache.get("streamed").unwrap(),
        Some(Value::Bytes(payload.clone()))
    );
    let mut reader = cache.read("streamed").unwrap().unwrap();
    assert_eq!(reader.read_all().unwrap(), payload);
}

#[test]
fn test_delete_idempotent() {
    let (_dir, cache) = open_cache();

    cache.set("k", 1).unwrap();
    assert!(cache.delete("k", false).unwrap());
    assert!(!cache.delete("k", false).unwrap());
    assert_eq!(cache.len().unwrap(), 0);
}

#[test]
fn test_add_only_inserts_once() {
    let (_dir, cache) = open_cache();

    assert!(cache.add("k", 1).unwrap());
    assert!(!cache.add("k", 2).unwrap());
    assert_eq!(cache.get("k").unwrap(), Some(Value::Int(1)));
}

#[test]
fn test_get_entry_returns_metadata() {
    let (_dir, cache) = open_cache();

    let options = SetOptions {
        expire: Some(3600.0),
        tag: Some("blue".to_string()),
        retry: false,
    };
    cache
        .set_with(&"k".into(), Value::Int(5), &options)
        .unwrap();

    let entry = cache
        .get_entry(&"k".into(), &GetOptions::default())
        .unwrap()
        .unwrap();
    assert_eq!(entry.value, Value::Int(5));
    assert_eq!(entry.tag.as_deref(), Some("blue"));
    let expire_time = entry.expire_time.unwrap();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64();
    assert!(expire_time > now + 3500.0 && expire_time < now + 3700.0);
}

#[test]
fn test_pop_removes_entry() {
    let (_dir, cache) = open_cache();

    cache.set("k", "v").unwrap();
    assert_eq!(cache.pop("k").unwrap(), Some(Value::Text("v".into())));
    assert_eq!(cache.pop("k").unwrap(), None);
    assert_eq!(cache.len().unwrap(), 0);
}

#[test]
fn test_incr_decr() {
    let (_dir, cache) = open_cache();

    assert_eq!(cache.incr("n", 1, Some(0), false).unwrap(), 1);
    assert_eq!(cache.incr("n", 5, Some(0), false).unwrap(), 6);
    assert_eq!(cache.decr("n", 2, Some(0), false).unwrap(), 4);
    assert_eq!(cache.get("n").unwrap(), Some(Value::Int(4)));

    // No default: missing key is an error.
    let err = cache.incr("absent", 1, None, false).unwrap_err();
    assert!(matches!(err, riverdisk::CacheError::KeyNotFound));
}

#[test]
fn test_incr_rejects_non_integer() {
    let (_dir, cache) = open_cache();
    cache.set("text", "not a number").unwrap();
    let err = cache.incr("text", 1, Some(0), false).unwrap_err();
    assert!(matches!(err, riverdisk::CacheError::Codec(_)));
}

#[test]
fn test_touch_updates_expiration() {
    let (_dir, cache) = open_cache();

    let options = SetOptions {
        expire: Some(0.2),
        ..Default::default()
    };
    cache.set_with(&"k".into(), Value::Int(1), &options).unwrap();
    assert!(cache.touch("k", Some(3600.0), false).unwrap());

    std::thread::sleep(std::time::Duration::from_millis(400));
    assert_eq!(cache.get("k").unwrap(), Some(Value::Int(1)));

    assert!(!cache.touch("missing", Some(10.0), false).unwrap());
}

#[test]
fn test_contains() {
    let (_dir, cache) = open_cache();
    cache.set("k", 1).unwrap();
    assert!(cache.contains("k").unwrap());
    assert!(!cache.contains("other").unwrap());
}

#[test]
fn test_iteration_insertion_order() {
    let (_dir, cache) = open_cache();

    for i in 0..250i64 {
        cache.set(format!("key-{:03}", i), i).unwrap();
    }

    let keys: Vec<String> = cache
        .iter()
        .map(|key| match key.unwrap() {
            riverdisk::Key::Text(s) => s,
            other => panic!("unexpected key {:?}", other),
        })
        .collect();
    assert_eq!(keys.len(), 250);
    assert_eq!(keys[0], "key-000");
    assert_eq!(keys[249], "key-249");

    let reversed: Vec<String> = cache
        .iter_rev()
        .map(|key| match key.unwrap() {
            riverdisk::Key::Text(s) => s,
            other => panic!("unexpected key {:?}", other),
        })
        .collect();
    assert_eq!(reversed[0], "key-249");
    assert_eq!(reversed[249], "key-000");
}

#[test]
fn test_peekitem_first_and_last() {
    let (_dir, cache) = open_cache();
    cache.set("first", 1).unwrap();
    cache.set("last", 2).unwrap();

    let (key, value) = cache.peekitem(false).unwrap().unwrap();
    assert_eq!(key, "first".into());
    assert_eq!(value, Value::Int(1));

    let (key, value) = cache.peekitem(true).unwrap().unwrap();
    assert_eq!(key, "last".into());
    assert_eq!(value, Value::Int(2));
}

#[test]
fn test_stats_counting() {
    let (_dir, cache) = open_cache();
    cache.stats(true, true).unwrap();

    cache.set("k", 1).unwrap();
    cache.get("k").unwrap();
    cache.get("k").unwrap();
    cache.get("missing").unwrap();

    let (hits, misses) = cache.stats(true, true).unwrap();
    assert_eq!((hits, misses), (2, 1));

    // Reset took effect.
    let (hits, misses) = cache.stats(false, false).unwrap();
    assert_eq!((hits, misses), (0, 0));
}

#[test]
fn test_volume_reflects_values() {
    let (_dir, cache) = open_cache();
    let baseline = cache.volume().unwrap();
    assert!(baseline > 0);

    cache.set("big", vec![1u8; 1 << 16]).unwrap();
    assert!(cache.volume().unwrap() >= baseline + (1 << 16));
}

#[test]
fn test_transact_groups_operations() {
    let (_dir, cache) = open_cache();

    cache
        .transact(false, || {
            cache.set("a", 1)?;
            cache.set("b", 2)?;
            cache.incr("a", 10, None, false)?;
            Ok(())
        })
        .unwrap();

    assert_eq!(cache.get("a").unwrap(), Some(Value::Int(11)));
    assert_eq!(cache.get("b").unwrap(), Some(Value::Int(2)));
}

#[test]
fn test_transact_rolls_back_group() {
    let (_dir, cache) = open_cache();

    let result: riverdisk::Result<()> = cache.transact(false, || {
        cache.set("a", 1)?;
        Err(riverdisk::CacheError::KeyNotFound)
    });
    assert!(result.is_err());
    assert_eq!(cache.get("a").unwrap(), None);
}

#[test]
fn test_reset_setting_durable() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = Cache::open(dir.path()).unwrap();
        cache
            .reset("cull_limit", Some(SqlValue::Integer(25)))
            .unwrap();
        cache.close();
    }
    let cache = Cache::open(dir.path()).unwrap();
    assert_eq!(
        cache.reset("cull_limit", None).unwrap(),
        SqlValue::Integer(25)
    );
}

#[test]
fn test_open_with_setting_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open_with(
        dir.path(),
        CacheOptions::default().setting("eviction_policy", SqlValue::Text("none".into())),
    )
    .unwrap();
    assert_eq!(
        cache.reset("eviction_policy", None).unwrap(),
        SqlValue::Text("none".into())
    );
}

#[test]
fn test_unknown_setting_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path()).unwrap();
    assert!(cache
        .reset("no_such_setting", Some(SqlValue::Integer(1)))
        .is_err());
}

#[test]
fn test_close_then_reuse() {
    let (_dir, cache) = open_cache();
    cache.set("k", 1).unwrap();
    cache.close();
    // The connection reopens lazily.
    assert_eq!(cache.get("k").unwrap(), Some(Value::Int(1)));
}

#[test]
fn test_persistence_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = Cache::open(dir.path()).unwrap();
        cache.set("durable", "yes").unwrap();
        cache.close();
    }
    let cache = Cache::open(dir.path()).unwrap();
    assert_eq!(
        cache.get("durable").unwrap(),
        Some(Value::Text("yes".into()))
    );
}
