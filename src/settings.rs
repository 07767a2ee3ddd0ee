// # Settings and Counters
//
// Typed, database-backed configuration. Every field persists as a row in
// the Settings table; the running counters (count, size, hits, misses)
// share the table and are maintained by triggers and the statistics path.

use crate::error::{CacheError, Result};
use crate::policy;
use crate::types::SqlValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Counter rows living beside the settings.
pub(crate) const METADATA_KEYS: [&str; 4] = ["count", "size", "hits", "misses"];

/// Durable cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Enable hit/miss counting
    pub statistics: bool,

    /// Name of the registered eviction policy
    pub eviction_policy: String,

    /// Soft upper bound on `volume()` triggering the policy cull
    pub size_limit: i64,

    /// Max rows removed per sweep step; 0 disables culling on `set`
    pub cull_limit: i64,

    /// Values at least this large go to the file heap
    pub disk_min_file_size: i64,

    /// Opaque-codec version selector, passed to the serializer
    pub disk_pickle_protocol: i64,

    /// Maintain the `(tag, rowid)` index for tag eviction
    pub tag_index: bool,

    /// Journal mode PRAGMA
    pub sqlite_journal_mode: String,

    /// Synchronous PRAGMA level (0=OFF, 1=NORMAL, 2=FULL, 3=EXTRA)
    pub sqlite_synchronous: i64,

    /// Page cache size PRAGMA, in pages
    pub sqlite_cache_size: i64,

    /// Memory-map size PRAGMA, in bytes
    pub sqlite_mmap_size: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            statistics: false,
            eviction_policy: "least-recently-stored".to_string(),
            size_limit: 1 << 30,
            cull_limit: 10,
            disk_min_file_size: 1 << 15,
            disk_pickle_protocol: 1,
            tag_index: false,
            sqlite_journal_mode: "wal".to_string(),
            sqlite_synchronous: 1,
            sqlite_cache_size: 1 << 13,
            sqlite_mmap_size: 1 << 26,
        }
    }
}

impl Settings {
    /// All recognized setting names.
    pub fn names() -> &'static [&'static str] {
        &[
            "statistics",
            "eviction_policy",
            "size_limit",
            "cull_limit",
            "disk_min_file_size",
            "disk_pickle_protocol",
            "tag_index",
            "sqlite_journal_mode",
            "sqlite_synchronous",
            "sqlite_cache_size",
            "sqlite_mmap_size",
        ]
    }

    pub fn is_setting(name: &str) -> bool {
        Self::names().contains(&name)
    }

    /// Render as (name, column value) pairs for persistence.
    pub fn pairs(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("statistics", SqlValue::Integer(self.statistics as i64)),
            (
                "eviction_policy",
                SqlValue::Text(self.eviction_policy.clone()),
            ),
            ("size_limit", SqlValue::Integer(self.size_limit)),
            ("cull_limit", SqlValue::Integer(self.cull_limit)),
            (
                "disk_min_file_size",
                SqlValue::Integer(self.disk_min_file_size),
            ),
            (
                "disk_pickle_protocol",
                SqlValue::Integer(self.disk_pickle_protocol),
            ),
            ("tag_index", SqlValue::Integer(self.tag_index as i64)),
            (
                "sqlite_journal_mode",
                SqlValue::Text(self.sqlite_journal_mode.clone()),
            ),
            (
                "sqlite_synchronous",
                SqlValue::Integer(self.sqlite_synchronous),
            ),
            ("sqlite_cache_size", SqlValue::Integer(self.sqlite_cache_size)),
            ("sqlite_mmap_size", SqlValue::Integer(self.sqlite_mmap_size)),
        ]
    }

    /// Build from persisted rows, falling back to defaults per key.
    pub fn from_map(rows: &HashMap<String, SqlValue>) -> Result<Settings> {
        let mut settings = Settings::default();
        for (name, value) in rows {
            if Self::is_setting(name) {
                settings.apply(name, value)?;
            }
        }
        Ok(settings)
    }

    /// Set one field from its column value.
    pub fn apply(&mut self, name: &str, value: &SqlValue) -> Result<()> {
        match name {
            "statistics" => self.statistics = as_bool(name, value)?,
            "eviction_policy" => self.eviction_policy = as_text(name, value)?,
            "size_limit" => self.size_limit = as_i64(name, value)?,
            "cull_limit" => self.cull_limit = as_i64(name, value)?,
            "disk_min_file_size" => self.disk_min_file_size = as_i64(name, value)?,
            "disk_pickle_protocol" => self.disk_pickle_protocol = as_i64(name, value)?,
            "tag_index" => self.tag_index = as_bool(name, value)?,
            "sqlite_journal_mode" => self.sqlite_journal_mode = as_text(name, value)?,
            "sqlite_synchronous" => self.sqlite_synchronous = as_i64(name, value)?,
            "sqlite_cache_size" => self.sqlite_cache_size = as_i64(name, value)?,
            "sqlite_mmap_size" => self.sqlite_mmap_size = as_i64(name, value)?,
            other => {
                return Err(CacheError::Configuration(format!(
                    "unknown setting: {}",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Current column value of one field.
    pub fn value_of(&self, name: &str) -> Result<SqlValue> {
        self.pairs()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| CacheError::Configuration(format!("unknown setting: {}", name)))
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.size_limit <= 0 {
            return Err(CacheError::Configuration(
                "size_limit must be greater than 0".to_string(),
            ));
        }
        if self.cull_limit < 0 {
            return Err(CacheError::Configuration(
                "cull_limit must not be negative".to_string(),
            ));
        }
        if self.disk_min_file_size < 8 {
            return Err(CacheError::Configuration(
                "disk_min_file_size must be at least 8".to_string(),
            ));
        }
        if !(0..=3).contains(&self.sqlite_synchronous) {
            return Err(CacheError::Configuration(
                "sqlite_synchronous must be in 0..=3".to_string(),
            ));
        }
        let journal = self.sqlite_journal_mode.to_ascii_lowercase();
        if !["delete", "truncate", "persist", "memory", "wal", "off"].contains(&journal.as_str()) {
            return Err(CacheError::Configuration(format!(
                "unknown journal mode: {}",
                self.sqlite_journal_mode
            )));
        }
        if policy::lookup(&self.eviction_policy).is_none() {
            return Err(CacheError::UnknownPolicy(self.eviction_policy.clone()));
        }
        Ok(())
    }
}

fn as_i64(name: &str, value: &SqlValue) -> Result<i64> {
    match value {
        SqlValue::Integer(i) => Ok(*i),
        other => Err(CacheError::Configuration(format!(
            "setting {} expects an integer, got {:?}",
            name, other
        ))),
    }
}

fn as_bool(name: &str, value: &SqlValue) -> Result<bool> {
    Ok(as_i64(name, value)? != 0)
}

fn as_text(name: &str, value: &SqlValue) -> Result<String> {
    match value {
        SqlValue::Text(s) => Ok(s.clone()),
        other => Err(CacheError::Configuration(format!(
            "setting {} expects text, got {:?}",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_pairs_cover_all_names() {
        let settings = Settings::default();
        let pairs = settings.pairs();
        assert_eq!(pairs.len(), Settings::names().len());
        for name in Settings::names() {
            assert!(pairs.iter().any(|(n, _)| n == name));
        }
    }

    #[test]
    fn test_from_map_roundtrip() {
        let mut settings = Settings::default();
        settings.cull_limit = 25;
        settings.eviction_policy = "least-recently-used".to_string();

        let map: HashMap<String, SqlValue> = settings
            .pairs()
            .into_iter()
            .map(|(n, v)| (n.to_string(), v))
            .collect();
        let loaded = Settings::from_map(&map).unwrap();
        assert_eq!(loaded.cull_limit, 25);
        assert_eq!(loaded.eviction_policy, "least-recently-used");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.size_limit = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.eviction_policy = "no-such-policy".to_string();
        assert!(matches!(
            settings.validate(),
            Err(CacheError::UnknownPolicy(_))
        ));

        let mut settings = Settings::default();
        settings.sqlite_journal_mode = "bogus".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_apply_type_mismatch() {
        let mut settings = Settings::default();
        let err = settings.apply("size_limit", &SqlValue::Text("big".into()));
        assert!(err.is_err());
    }
}
