// # Fanout Shard Router
//
// Partitions keys across N independent caches under numbered
// subdirectories to reduce write contention. Routing hashes the key with
// FNV-1a, so the same key lands on the same shard across runs, threads,
// and processes. Per-key operations absorb a shard's busy timeout into a
// benign false/None; collective operations fan out and aggregate.

use crate::cache::{Cache, CacheOptions, GetOptions, KeyIter, SetOptions};
use crate::disk::DefaultDisk;
use crate::error::{CacheError, Result};
use crate::types::{Entry, Key, SqlValue, Value, ValueReader};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Cache composed of independent shards.
pub struct FanoutCache {
    directory: PathBuf,
    shards: Vec<Cache>,
}

impl FanoutCache {
    /// Open a fanout cache with `shards` sub-caches under `directory`.
    pub fn open(directory: impl AsRef<Path>, shards: usize) -> Result<FanoutCache> {
        Self::open_with(directory, shards, CacheOptions::default())
    }

    /// Open with explicit options; every shard shares the settings and the
    /// serializer.
    pub fn open_with(
        directory: impl AsRef<Path>,
        shards: usize,
        options: CacheOptions,
    ) -> Result<FanoutCache> {
        let directory = directory.as_ref().to_path_buf();
        let count = shards.max(1);
        let disk = options
            .disk
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultDisk));

        let mut built = Vec::with_capacity(count);
        for index in 0..count {
            let shard_options = CacheOptions {
                timeout: options.timeout,
                disk: Some(disk.clone()),
                overrides: options.overrides.clone(),
            };
            built.push(Cache::open_with(
                directory.join(format!("{:03}", index)),
                shard_options,
            )?);
        }
        Ok(FanoutCache {
            directory,
            shards: built,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: &Key) -> &Cache {
        let hash = fnv1a(&key.canonical_bytes());
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    // ------------------------------------------------------------------
    // Per-key operations
    // ------------------------------------------------------------------

    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<bool> {
        self.set_with(&key.into(), value.into(), &SetOptions::default())
    }

    pub fn set_with(&self, key: &Key, value: Value, options: &SetOptions) -> Result<bool> {
        match self.shard(key).set_with(key, value, options) {
            Err(CacheError::Timeout) if !options.retry => Ok(false),
            other => other,
        }
    }

    pub fn set_read(
        &self,
        key: impl Into<Key>,
        reader: &mut dyn Read,
        options: &SetOptions,
    ) -> Result<bool> {
        let key = key.into();
        match self.shard(&key).set_read(key.clone(), reader, options) {
            Err(CacheError::Timeout) if !options.retry => Ok(false),
            other => other,
        }
    }

    pub fn add(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<bool> {
        self.add_with(&key.into(), value.into(), &SetOptions::default())
    }

    pub fn add_with(&self, key: &Key, value: Value, options: &SetOptions) -> Result<bool> {
        match self.shard(key).add_with(key, value, options) {
            Err(CacheError::Timeout) if !options.retry => Ok(false),
            other => other,
        }
    }

    pub fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        self.get_with(&key, &GetOptions::default())
    }

    pub fn get_with(&self, key: &Key, options: &GetOptions) -> Result<Option<Value>> {
        match self.shard(key).get_with(key, options) {
            Err(CacheError::Timeout) if !options.retry => Ok(None),
            other => other,
        }
    }

    pub fn get_entry(&self, key: &Key, options: &GetOptions) -> Result<Option<Entry>> {
        match self.shard(key).get_entry(key, options) {
            Err(CacheError::Timeout) if !options.retry => Ok(None),
            other => other,
        }
    }

    pub fn read(&self, key: impl Into<Key>) -> Result<Option<ValueReader>> {
        let key = key.into();
        match self.shard(&key).read(key.clone()) {
            Err(CacheError::Timeout) => Ok(None),
            other => other,
        }
    }

    pub fn pop(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        match self.shard(&key).pop_entry(&key, &GetOptions::default()) {
            Ok(found) => Ok(found.map(|entry| entry.value)),
            Err(CacheError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn delete(&self, key: impl Into<Key>, retry: bool) -> Result<bool> {
        let key = key.into();
        match self.shard(&key).delete(key.clone(), retry) {
            Err(CacheError::Timeout) if !retry => Ok(false),
            other => other,
        }
    }

    pub fn touch(&self, key: impl Into<Key>, expire: Option<f64>, retry: bool) -> Result<bool> {
        let key = key.into();
        match self.shard(&key).touch(key.clone(), expire, retry) {
            Err(CacheError::Timeout) if !retry => Ok(false),
            other => other,
        }
    }

    /// Increment, returning None when the shard is busy and retry is off.
    pub fn incr(
        &self,
        key: impl Into<Key>,
        delta: i64,
        default: Option<i64>,
        retry: bool,
    ) -> Result<Option<i64>> {
        let key = key.into();
        match self.shard(&key).incr(key.clone(), delta, default, retry) {
            Ok(next) => Ok(Some(next)),
            Err(CacheError::Timeout) if !retry => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn decr(
        &self,
        key: impl Into<Key>,
        delta: i64,
        default: Option<i64>,
        retry: bool,
    ) -> Result<Option<i64>> {
        self.incr(key, -delta, default, retry)
    }

    pub fn contains(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        match self.shard(&key).contains(key.clone()) {
            Err(CacheError::Timeout) => Ok(false),
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Collective operations
    // ------------------------------------------------------------------

    pub fn expire(&self) -> Result<usize> {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.expire()?;
        }
        Ok(count)
    }

    pub fn cull(&self) -> Result<usize> {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.cull()?;
        }
        Ok(count)
    }

    pub fn evict(&self, tag: &str) -> Result<usize> {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.evict(tag)?;
        }
        Ok(count)
    }

    pub fn clear(&self) -> Result<usize> {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.clear()?;
        }
        Ok(count)
    }

    pub fn stats(&self, enable: bool, reset: bool) -> Result<(i64, i64)> {
        let mut hits = 0;
        let mut misses = 0;
        for shard in &self.shards {
            let (h, m) = shard.stats(enable, reset)?;
            hits += h;
            misses += m;
        }
        Ok((hits, misses))
    }

    pub fn volume(&self) -> Result<i64> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.volume()?;
        }
        Ok(total)
    }

    pub fn check(&self, fix: bool) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        for shard in &self.shards {
            warnings.extend(shard.check(fix)?);
        }
        Ok(warnings)
    }

    pub fn len(&self) -> Result<u64> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.len()?;
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Apply a durable setting to every shard.
    pub fn reset(&self, name: &str, value: Option<SqlValue>) -> Result<SqlValue> {
        let mut result = None;
        for shard in &self.shards {
            result = Some(shard.reset(name, value.clone())?);
        }
        result.ok_or_else(|| CacheError::Configuration("no shards".to_string()))
    }

    /// Iterate keys shard by shard in ascending shard order, each shard in
    /// insertion order.
    pub fn iter(&self) -> FanoutIter<'_> {
        FanoutIter {
            iters: self.shards.iter().map(|shard| shard.iter()).collect(),
            index: 0,
        }
    }

    /// Reverse iteration: shards in descending index order, rows newest
    /// first within each shard.
    pub fn iter_rev(&self) -> FanoutIter<'_> {
        FanoutIter {
            iters: self.shards.iter().rev().map(|shard| shard.iter_rev()).collect(),
            index: 0,
        }
    }

    pub fn close(&self) {
        for shard in &self.shards {
            shard.close();
        }
    }
}

/// Key iterator chaining the shard iterators.
pub struct FanoutIter<'a> {
    iters: Vec<KeyIter<'a>>,
    index: usize,
}

impl Iterator for FanoutIter<'_> {
    type Item = Result<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.iters.len() {
            match self.iters[self.index].next() {
                Some(item) => return Some(item),
                None => self.index += 1,
            }
        }
        None
    }
}
