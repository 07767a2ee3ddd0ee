// # Eviction Policies
//
// Named policies, each supplying an initialization step (index creation),
// an on-get side effect (access metadata update), and a cull query (rows
// to drop when the cache is over its size limit).
//
// Parameter conventions: `get` statements receive (?1 = now, ?2 = rowid);
// `cull` statements receive (?1 = limit) and select `rowid, filename`.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;

/// The three-query contract a policy supplies.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// Secondary index the policy requires, created once
    pub init: Option<String>,

    /// UPDATE applied on a successful get
    pub get: Option<String>,

    /// SELECT returning `rowid, filename` of rows to drop
    pub cull: Option<String>,
}

static POLICIES: Lazy<RwLock<HashMap<String, EvictionPolicy>>> = Lazy::new(|| {
    let mut table = HashMap::new();

    table.insert(
        "least-recently-stored".to_string(),
        EvictionPolicy {
            init: Some(
                "CREATE INDEX IF NOT EXISTS Cache_store_time ON Cache (store_time)".to_string(),
            ),
            get: None,
            cull: Some(
                "SELECT rowid, filename FROM Cache ORDER BY store_time LIMIT ?1".to_string(),
            ),
        },
    );

    table.insert(
        "least-recently-used".to_string(),
        EvictionPolicy {
            init: Some(
                "CREATE INDEX IF NOT EXISTS Cache_access_time ON Cache (access_time)".to_string(),
            ),
            get: Some("UPDATE Cache SET access_time = ?1 WHERE rowid = ?2".to_string()),
            cull: Some(
                "SELECT rowid, filename FROM Cache ORDER BY access_time LIMIT ?1".to_string(),
            ),
        },
    );

    table.insert(
        "least-frequently-used".to_string(),
        EvictionPolicy {
            init: Some(
                "CREATE INDEX IF NOT EXISTS Cache_access_count ON Cache (access_count)"
                    .to_string(),
            ),
            get: Some(
                "UPDATE Cache SET access_count = access_count + 1 WHERE rowid = ?2".to_string(),
            ),
            cull: Some(
                "SELECT rowid, filename FROM Cache ORDER BY access_count LIMIT ?1".to_string(),
            ),
        },
    );

    table.insert(
        "none".to_string(),
        EvictionPolicy {
            init: None,
            get: None,
            cull: None,
        },
    );

    RwLock::new(table)
});

/// Look up a policy by name.
pub fn lookup(name: &str) -> Option<EvictionPolicy> {
    POLICIES.read().get(name).cloned()
}

/// Register a policy under a name, replacing any existing entry.
///
/// The three-query contract is the only requirement; caches pick the
/// policy up through the `eviction_policy` setting.
pub fn register(name: &str, policy: EvictionPolicy) {
    POLICIES.write().insert(name.to_string(), policy);
}

/// Names of all registered policies.
pub fn names() -> Vec<String> {
    POLICIES.read().keys().cloned().collect()
}
