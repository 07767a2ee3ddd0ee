// Expiration, size-bounded culling, tag eviction, and clearing.

use riverdisk::{Cache, CacheOptions, SetOptions, SqlValue, Value};
use std::time::Duration;

#[test]
fn test_expired_entry_invisible() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path()).unwrap();

    let options = SetOptions {
        expire: Some(0.1),
        ..Default::default()
    };
    cache.set_with(&"k".into(), Value::Int(1), &options).unwrap();
    assert_eq!(cache.get("k").unwrap(), Some(Value::Int(1)));

    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(cache.get("k").unwrap(), None);
    assert!(!cache.contains("k").unwrap());
    assert_eq!(cache.pop("k").unwrap(), None);
}

#[test]
fn test_expire_sweep_counts() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path()).unwrap();

    // Long enough that nothing expires while the entries are written.
    let short = SetOptions {
        expire: Some(0.5),
        ..Default::default()
    };
    for i in 0..30i64 {
        cache
            .set_with(&format!("gone-{}", i).into(), Value::Int(i), &short)
            .unwrap();
    }
    for i in 0..5i64 {
        cache.set(format!("kept-{}", i), i).unwrap();
    }

    std::thread::sleep(Duration::from_millis(800));
    let removed = cache.expire().unwrap();
    assert_eq!(removed, 30);
    assert_eq!(cache.len().unwrap(), 5);
}

#[test]
fn test_lru_cull_keeps_recently_used() {
    let dir = tempfile::tempdir().unwrap();
    let megabyte = 1024 * 1024;
    let cache = Cache::open_with(
        dir.path(),
        CacheOptions::default()
            .setting("size_limit", SqlValue::Integer(11 * megabyte))
            .setting("cull_limit", SqlValue::Integer(5))
            .setting(
                "eviction_policy",
                SqlValue::Text("least-recently-used".into()),
            ),
    )
    .unwrap();

    for i in 0..10i64 {
        cache.set(i, vec![b'v'; megabyte as usize]).unwrap();
    }
    assert_eq!(cache.len().unwrap(), 10);

    // Refresh access times for the keys that should survive.
    for i in [0i64, 1, 7, 8, 9] {
        assert!(cache.get(i).unwrap().is_some());
    }

    cache.set(10i64, vec![b'v'; megabyte as usize]).unwrap();

    assert_eq!(cache.len().unwrap(), 6);
    for i in [0i64, 1, 7, 8, 9, 10] {
        assert!(cache.contains(i).unwrap(), "expected key {} to survive", i);
    }
    for i in [2i64, 3, 4, 5, 6] {
        assert!(!cache.contains(i).unwrap(), "expected key {} culled", i);
    }
}

#[test]
fn test_cull_respects_size_limit() {
    let dir = tempfile::tempdir().unwrap();
    let limit = 500 * 1024;
    let cache = Cache::open_with(
        dir.path(),
        CacheOptions::default()
            .setting("size_limit", SqlValue::Integer(limit))
            .setting("cull_limit", SqlValue::Integer(0)),
    )
    .unwrap();

    // cull_limit 0 disables culling on set, so the cache overfills.
    for i in 0..20i64 {
        cache.set(i, vec![b'v'; 100 * 1024]).unwrap();
    }
    assert!(cache.volume().unwrap() > limit);

    let removed = cache.cull().unwrap();
    assert!(removed > 0);
    assert!(cache.volume().unwrap() <= limit);
}

#[test]
fn test_none_policy_ignores_size_limit() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open_with(
        dir.path(),
        CacheOptions::default()
            .setting("size_limit", SqlValue::Integer(64 * 1024))
            .setting("eviction_policy", SqlValue::Text("none".into())),
    )
    .unwrap();

    for i in 0..5i64 {
        cache.set(i, vec![b'v'; 64 * 1024]).unwrap();
    }
    cache.cull().unwrap();
    assert_eq!(cache.len().unwrap(), 5);
}

#[test]
fn test_least_recently_stored_culls_oldest() {
    let dir = tempfile::tempdir().unwrap();
    let limit = 400 * 1024;
    let cache = Cache::open_with(
        dir.path(),
        CacheOptions::default()
            .setting("size_limit", SqlValue::Integer(limit))
            .setting("cull_limit", SqlValue::Integer(2)),
    )
    .unwrap();

    for i in 0..8i64 {
        cache.set(i, vec![b'v'; 100 * 1024]).unwrap();
    }
    cache.cull().unwrap();

    // Oldest stores go first under the default policy.
    assert!(cache.volume().unwrap() <= limit);
    assert!(!cache.contains(0i64).unwrap());
    assert!(cache.contains(7i64).unwrap());
}

#[test]
fn test_tag_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path()).unwrap();

    let tags = ["red", "blue", "yellow"];
    for i in 0..90i64 {
        let options = SetOptions {
            tag: Some(tags[(i % 3) as usize].to_string()),
            ..Default::default()
        };
        cache
            .set_with(&i.into(), Value::Int(i), &options)
            .unwrap();
    }

    assert_eq!(cache.evict("red").unwrap(), 30);
    assert_eq!(cache.len().unwrap(), 60);

    for i in 0..90i64 {
        let entry = cache.get_entry(&i.into(), &Default::default()).unwrap();
        if let Some(entry) = entry {
            assert_ne!(entry.tag.as_deref(), Some("red"));
        }
    }
}

#[test]
fn test_tag_eviction_with_index() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open_with(
        dir.path(),
        CacheOptions::default().setting("tag_index", SqlValue::Integer(1)),
    )
    .unwrap();

    for i in 0..20i64 {
        let options = SetOptions {
            tag: Some(if i % 2 == 0 { "even" } else { "odd" }.to_string()),
            ..Default::default()
        };
        cache.set_with(&i.into(), Value::Int(i), &options).unwrap();
    }
    assert_eq!(cache.evict("even").unwrap(), 10);
    assert_eq!(cache.len().unwrap(), 10);
}

#[test]
fn test_clear_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path()).unwrap();

    for i in 0..35i64 {
        cache.set(i, vec![b'v'; 64 * 1024]).unwrap();
    }
    assert_eq!(cache.clear().unwrap(), 35);
    assert_eq!(cache.len().unwrap(), 0);
    assert!(cache.is_empty().unwrap());
    assert!(cache.check(false).unwrap().is_empty());
}

#[test]
fn test_expired_rows_culled_on_set() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(dir.path()).unwrap();

    let short = SetOptions {
        expire: Some(0.05),
        ..Default::default()
    };
    for i in 0..5i64 {
        cache
            .set_with(&format!("old-{}", i).into(), Value::Int(i), &short)
            .unwrap();
    }
    std::thread::sleep(Duration::from_millis(150));

    // A plain set sweeps up to cull_limit expired rows.
    cache.set("fresh", 1).unwrap();
    assert_eq!(cache.len().unwrap(), 1);
}
