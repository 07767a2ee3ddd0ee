// # Cache Engine
//
// Public operations over one cache directory: keyed get/set/add/pop and
// friends, the FIFO queue discipline, expiration and size-bounded culling,
// tag eviction, iteration, and statistics. Every mutation runs under the
// index store's transaction scope; heap files are written before entering
// the transaction and superseded files are deleted only after COMMIT.

use crate::check;
use crate::disk::{DefaultDisk, Disk, StoredValue};
use crate::error::{CacheError, Result};
use crate::heap::FileHeap;
use crate::policy;
use crate::settings::Settings;
use crate::store::{map_busy, Store, TxnScope};
use crate::types::{Entry, Key, Mode, Side, SqlValue, Value, ValueReader};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// First synthetic queue key, leaving room to prepend.
const QUEUE_MIDPOINT: i64 = 500_000_000_000_000;

/// Inclusive bounds of the reserved queue key namespace.
const QUEUE_MIN: i64 = 0;
const QUEUE_MAX: i64 = 999_999_999_999_999;

/// Rows fetched per iteration chunk.
const ITER_CHUNK: i64 = 100;

const INSERT_ROW: &str = "INSERT INTO Cache (key, raw, store_time, expire_time, access_time, \
     access_count, tag, size, mode, filename, value) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

const UPDATE_ROW: &str = "UPDATE Cache SET store_time = ?1, expire_time = ?2, access_time = ?3, \
     access_count = ?4, tag = ?5, size = ?6, mode = ?7, filename = ?8, value = ?9 \
     WHERE rowid = ?10";

// ============================================================================
// Options
// ============================================================================

/// Open-time configuration for a cache.
///
/// Settings named here override both the defaults and any values persisted
/// by a previous open, and become durable.
#[derive(Clone)]
pub struct CacheOptions {
    /// Busy timeout for the index store
    pub timeout: Duration,

    /// Serializer; defaults to [`DefaultDisk`]
    pub disk: Option<Arc<dyn Disk>>,

    /// Durable setting overrides applied at open
    pub overrides: Vec<(String, SqlValue)>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            disk: None,
            overrides: Vec::new(),
        }
    }
}

impl CacheOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn disk(mut self, disk: Arc<dyn Disk>) -> Self {
        self.disk = Some(disk);
        self
    }

    /// Queue a durable setting override.
    pub fn setting(mut self, name: &str, value: SqlValue) -> Self {
        self.overrides.push((name.to_string(), value));
        self
    }
}

/// Options for `set`, `add`, and their streaming variants.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Seconds until the entry expires; None means never
    pub expire: Option<f64>,

    /// Tag label for bulk eviction
    pub tag: Option<String>,

    /// Retry internally on a busy store
    pub retry: bool,
}

/// Options for `get`, `pop`, and related reads.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Retry internally on a busy store
    pub retry: bool,
}

/// Options for `push`.
#[derive(Debug, Clone)]
pub struct PushOptions {
    /// Queue namespace within the cache
    pub prefix: Option<String>,

    /// Which end receives the new item
    pub side: Side,

    /// Seconds until the entry expires
    pub expire: Option<f64>,

    /// Tag label
    pub tag: Option<String>,

    /// Retry internally on a busy store
    pub retry: bool,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            prefix: None,
            side: Side::Back,
            expire: None,
            tag: None,
            retry: false,
        }
    }
}

/// Options for `pull` and `peek`.
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Queue namespace within the cache
    pub prefix: Option<String>,

    /// Which end to take from
    pub side: Side,

    /// Retry internally on a busy store
    pub retry: bool,
}

// ============================================================================
// Row plumbing
// ============================================================================

struct RowData {
    rowid: i64,
    key: SqlValue,
    raw: bool,
    expire_time: Option<f64>,
    tag: Option<String>,
    mode: Mode,
    filename: Option<String>,
    value: Option<SqlValue>,
}

impl RowData {
    fn expired(&self, now: f64) -> bool {
        self.expire_time.is_some_and(|t| t <= now)
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RowData> {
    let mode: i64 = row.get(5)?;
    let value: SqlValue = row.get(7)?;
    Ok(RowData {
        rowid: row.get(0)?,
        key: row.get(1)?,
        raw: row.get::<_, i64>(2)? != 0,
        expire_time: row.get(3)?,
        tag: row.get(4)?,
        mode: Mode::from_i64(mode).unwrap_or(Mode::None),
        filename: row.get(6)?,
        value: match value {
            SqlValue::Null => None,
            other => Some(other),
        },
    })
}

fn select_live(
    conn: &Connection,
    db_key: &SqlValue,
    raw: bool,
    now: f64,
) -> Result<Option<RowData>> {
    let row = conn
        .query_row(
            "SELECT rowid, key, raw, expire_time, tag, mode, filename, value FROM Cache \
             WHERE key = ?1 AND raw = ?2 AND (expire_time IS NULL OR expire_time > ?3)",
            params![db_key, raw, now],
            map_row,
        )
        .optional()?;
    Ok(row)
}

fn select_any(conn: &Connection, db_key: &SqlValue, raw: bool) -> Result<Option<RowData>> {
    let row = conn
        .query_row(
            "SELECT rowid, key, raw, expire_time, tag, mode, filename, value FROM Cache \
             WHERE key = ?1 AND raw = ?2",
            params![db_key, raw],
            map_row,
        )
        .optional()?;
    Ok(row)
}

fn rows_id_file(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<(i64, Option<String>)>> {
    let mut stmt = conn.prepare(sql)?;
    let mapped = stmt.query_map(params, |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut rows = Vec::new();
    for row in mapped {
        rows.push(row?);
    }
    Ok(rows)
}

fn is_enoent(err: &CacheError) -> bool {
    matches!(err, CacheError::Io(e) if e.kind() == ErrorKind::NotFound)
}

/// Wall-clock seconds since the epoch.
fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn sweep_chunk(cull_limit: i64) -> i64 {
    if cull_limit > 0 {
        cull_limit
    } else {
        100
    }
}

// ============================================================================
// Queue key namespace
// ============================================================================

fn queue_key_type(prefix: Option<&str>) -> &'static str {
    match prefix {
        None => "integer",
        Some(_) => "text",
    }
}

fn queue_bounds(prefix: Option<&str>) -> (SqlValue, SqlValue) {
    match prefix {
        None => (SqlValue::Integer(QUEUE_MIN), SqlValue::Integer(QUEUE_MAX)),
        Some(p) => (
            SqlValue::Text(format!("{}-{:015}", p, QUEUE_MIN)),
            SqlValue::Text(format!("{}-{:015}", p, QUEUE_MAX)),
        ),
    }
}

fn queue_db_key(prefix: Option<&str>, num: i64) -> SqlValue {
    match prefix {
        None => SqlValue::Integer(num),
        Some(p) => SqlValue::Text(format!("{}-{:015}", p, num)),
    }
}

fn queue_key(prefix: Option<&str>, num: i64) -> Key {
    match prefix {
        None => Key::Int(num),
        Some(p) => Key::Text(format!("{}-{:015}", p, num)),
    }
}

fn parse_queue_key(stored: &SqlValue, prefix: Option<&str>) -> Result<i64> {
    match (prefix, stored) {
        (None, SqlValue::Integer(i)) => Ok(*i),
        (Some(p), SqlValue::Text(s)) => s
            .get(p.len() + 1..)
            .and_then(|digits| digits.parse::<i64>().ok())
            .ok_or_else(|| CacheError::Codec(format!("malformed queue key: {}", s))),
        _ => Err(CacheError::Codec("malformed queue key".to_string())),
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Disk and file backed cache rooted at one directory.
///
/// Safe to share across threads; every thread lazily opens its own index
/// store connection. Multiple processes may open the same directory, with
/// conflicting writers serialized by the store's file locking.
pub struct Cache {
    pub(crate) store: Store,
    pub(crate) heap: FileHeap,
    pub(crate) disk: Arc<dyn Disk>,
    pub(crate) settings: RwLock<Settings>,
    pub(crate) page_size: i64,
}

impl Cache {
    /// Open (creating if needed) a cache at `directory` with defaults.
    pub fn open(directory: impl AsRef<Path>) -> Result<Cache> {
        Self::open_with(directory, CacheOptions::default())
    }

    /// Open a cache with explicit options.
    pub fn open_with(directory: impl AsRef<Path>, options: CacheOptions) -> Result<Cache> {
        let directory = directory.as_ref();
        let (store, settings, page_size) =
            Store::open(directory, options.timeout, &options.overrides)?;
        let disk = options.disk.unwrap_or_else(|| Arc::new(DefaultDisk));
        info!(directory = %directory.display(), "opened cache");
        Ok(Cache {
            store,
            heap: FileHeap::new(directory),
            disk,
            settings: RwLock::new(settings),
            page_size,
        })
    }

    /// Cache root directory.
    pub fn directory(&self) -> &Path {
        self.store.directory()
    }

    fn current_settings(&self) -> Settings {
        self.settings.read().clone()
    }

    fn policy(&self, settings: &Settings) -> Result<policy::EvictionPolicy> {
        policy::lookup(&settings.eviction_policy)
            .ok_or_else(|| CacheError::UnknownPolicy(settings.eviction_policy.clone()))
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Store a key/value pair, replacing any existing entry.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<bool> {
        self.set_with(&key.into(), value.into(), &SetOptions::default())
    }

    /// Store a key/value pair with expiration, tag, and retry control.
    pub fn set_with(&self, key: &Key, value: Value, options: &SetOptions) -> Result<bool> {
        let settings = self.current_settings();
        let stored = self
            .disk
            .store(&value, &self.heap, settings.disk_min_file_size as u64)?;
        self.upsert(key, stored, options, &settings, false)
    }

    /// Store a value streamed from a reader. The value always lands in the
    /// file heap.
    pub fn set_read(
        &self,
        key: impl Into<Key>,
        reader: &mut dyn Read,
        options: &SetOptions,
    ) -> Result<bool> {
        let settings = self.current_settings();
        let stored = self.disk.store_read(reader, &self.heap)?;
        self.upsert(&key.into(), stored, options, &settings, false)
    }

    /// Insert only if the key is absent (or expired). Returns whether the
    /// value was stored; at most one concurrent `add` per key succeeds
    /// across threads and processes.
    pub fn add(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<bool> {
        self.add_with(&key.into(), value.into(), &SetOptions::default())
    }

    /// `add` with expiration, tag, and retry control.
    pub fn add_with(&self, key: &Key, value: Value, options: &SetOptions) -> Result<bool> {
        let settings = self.current_settings();
        let stored = self
            .disk
            .store(&value, &self.heap, settings.disk_min_file_size as u64)?;
        self.upsert(key, stored, options, &settings, true)
    }

    /// Streaming variant of `add`.
    pub fn add_read(
        &self,
        key: impl Into<Key>,
        reader: &mut dyn Read,
        options: &SetOptions,
    ) -> Result<bool> {
        let settings = self.current_settings();
        let stored = self.disk.store_read(reader, &self.heap)?;
        self.upsert(&key.into(), stored, options, &settings, true)
    }

    fn upsert(
        &self,
        key: &Key,
        stored: StoredValue,
        options: &SetOptions,
        settings: &Settings,
        only_if_absent: bool,
    ) -> Result<bool> {
        let (db_key, raw) = self.disk.put(key)?;
        let now_t = now();
        let expire_time = options.expire.map(|e| now_t + e);
        let created = stored.filename.clone();
        let inline = stored.value.clone().unwrap_or(SqlValue::Null);

        let result = self.store.transact(options.retry, |scope| {
            let conn = scope.conn();
            let existing: Option<(i64, Option<String>, Option<f64>)> = conn
                .query_row(
                    "SELECT rowid, filename, expire_time FROM Cache \
                     WHERE key = ?1 AND raw = ?2",
                    params![&db_key, raw],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            match existing {
                Some((rowid, old_file, old_expire)) => {
                    let alive = old_expire.map_or(true, |t| t > now_t);
                    if only_if_absent && alive {
                        // Lost the race (or the key simply exists): drop the
                        // file we prepared once the transaction commits.
                        if let Some(name) = &stored.filename {
                            scope.defer_remove(name);
                        }
                        return Ok(false);
                    }
                    conn.execute(
                        UPDATE_ROW,
                        params![
                            now_t,
                            expire_time,
                            now_t,
                            0i64,
                            options.tag,
                            stored.size,
                            stored.mode as i64,
                            stored.filename,
                            inline,
                            rowid
                        ],
                    )?;
                    if let Some(name) = old_file {
                        scope.defer_remove(&name);
                    }
                }
                None => {
                    conn.execute(
                        INSERT_ROW,
                        params![
                            &db_key,
                            raw,
                            now_t,
                            expire_time,
                            now_t,
                            0i64,
                            options.tag,
                            stored.size,
                            stored.mode as i64,
                            stored.filename,
                            inline
                        ],
                    )?;
                }
            }

            self.cull_step(scope, now_t, settings)?;
            Ok(true)
        });

        if result.is_err() {
            if let Some(name) = &created {
                let _ = self.heap.remove(name);
            }
        }
        result
    }

    /// Bounded cull run from `set`/`add`: first expired rows, then policy
    /// victims when the cache exceeds its size limit.
    fn cull_step(&self, scope: &TxnScope<'_>, now_t: f64, settings: &Settings) -> Result<()> {
        let mut limit = settings.cull_limit;
        if limit <= 0 {
            return Ok(());
        }
        let conn = scope.conn();

        let expired = rows_id_file(
            conn,
            "SELECT rowid, filename FROM Cache \
             WHERE expire_time IS NOT NULL AND expire_time < ?1 \
             ORDER BY expire_time LIMIT ?2",
            params![now_t, limit],
        )?;
        for (rowid, filename) in &expired {
            conn.execute("DELETE FROM Cache WHERE rowid = ?1", params![rowid])?;
            if let Some(name) = filename {
                scope.defer_remove(name);
            }
        }
        limit -= expired.len() as i64;
        if limit <= 0 {
            return Ok(());
        }

        let policy = self.policy(settings)?;
        let Some(cull_sql) = &policy.cull else {
            return Ok(());
        };
        if self.volume_with(conn)? <= settings.size_limit {
            return Ok(());
        }

        let victims = rows_id_file(conn, cull_sql, params![limit])?;
        for (rowid, filename) in &victims {
            conn.execute("DELETE FROM Cache WHERE rowid = ?1", params![rowid])?;
            if let Some(name) = filename {
                scope.defer_remove(name);
            }
        }
        if !victims.is_empty() {
            debug!(count = victims.len(), policy = %settings.eviction_policy, "culled");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Look up a value. Absent and expired entries return None.
    pub fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.get_entry(&key.into(), &GetOptions::default())
            .map(|found| found.map(|entry| entry.value))
    }

    /// `get` with retry control.
    pub fn get_with(&self, key: &Key, options: &GetOptions) -> Result<Option<Value>> {
        self.get_entry(key, options)
            .map(|found| found.map(|entry| entry.value))
    }

    /// Look up a value together with its expiration time and tag.
    ///
    /// With statistics enabled, hit/miss counters and the eviction
    /// policy's access update share one write transaction. With
    /// statistics disabled the access update runs as its own best-effort
    /// write, trading strict accuracy for read throughput.
    pub fn get_entry(&self, key: &Key, options: &GetOptions) -> Result<Option<Entry>> {
        let settings = self.current_settings();
        let policy = self.policy(&settings)?;
        let (db_key, raw) = self.disk.put(key)?;
        let now_t = now();

        if settings.statistics {
            return self.store.transact(options.retry, |scope| {
                let conn = scope.conn();
                let Some(row) = select_live(conn, &db_key, raw, now_t)? else {
                    conn.execute(
                        "UPDATE Settings SET value = value + 1 WHERE key = 'misses'",
                        [],
                    )?;
                    return Ok(None);
                };
                match self.disk.fetch(
                    row.mode,
                    row.filename.as_deref(),
                    row.value.as_ref(),
                    &self.heap,
                ) {
                    Ok(value) => {
                        conn.execute(
                            "UPDATE Settings SET value = value + 1 WHERE key = 'hits'",
                            [],
                        )?;
                        if let Some(get_sql) = &policy.get {
                            conn.execute(get_sql, params![now_t, row.rowid])?;
                        }
                        Ok(Some(Entry {
                            value,
                            expire_time: row.expire_time,
                            tag: row.tag,
                        }))
                    }
                    Err(e) if is_enoent(&e) => {
                        // Value file vanished under us: a concurrent delete
                        // won. Treat as a miss and drop the dangling row.
                        conn.execute("DELETE FROM Cache WHERE rowid = ?1", params![row.rowid])?;
                        conn.execute(
                            "UPDATE Settings SET value = value + 1 WHERE key = 'misses'",
                            [],
                        )?;
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            });
        }

        let Some(row) = self
            .store
            .with_conn(|conn| select_live(conn, &db_key, raw, now_t))?
        else {
            return Ok(None);
        };
        let value = match self.disk.fetch(
            row.mode,
            row.filename.as_deref(),
            row.value.as_ref(),
            &self.heap,
        ) {
            Ok(value) => value,
            Err(e) if is_enoent(&e) => {
                let cleanup = self.store.transact(false, |scope| {
                    scope.conn().execute(
                        "DELETE FROM Cache WHERE rowid = ?1",
                        params![row.rowid],
                    )?;
                    Ok(())
                });
                if let Err(e) = cleanup {
                    if !e.is_timeout() {
                        return Err(e);
                    }
                }
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if let Some(get_sql) = &policy.get {
            let update = self.store.with_conn(|conn| {
                conn.execute(get_sql, params![now_t, row.rowid])
                    .map_err(map_busy)?;
                Ok(())
            });
            if let Err(e) = update {
                if !e.is_timeout() {
                    return Err(e);
                }
            }
        }

        Ok(Some(Entry {
            value,
            expire_time: row.expire_time,
            tag: row.tag,
        }))
    }

    /// Open a streaming handle over a stored value. Bypasses hit/miss
    /// accounting and policy updates.
    pub fn read(&self, key: impl Into<Key>) -> Result<Option<ValueReader>> {
        let (db_key, raw) = self.disk.put(&key.into())?;
        let now_t = now();
        let Some(row) = self
            .store
            .with_conn(|conn| select_live(conn, &db_key, raw, now_t))?
        else {
            return Ok(None);
        };
        match self.disk.fetch_reader(
            row.mode,
            row.filename.as_deref(),
            row.value.as_ref(),
            &self.heap,
        ) {
            Ok(reader) => Ok(Some(reader)),
            Err(e) if is_enoent(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Absolute heap path of a stored value; None when the entry is
    /// missing or inline.
    pub fn path(&self, key: impl Into<Key>) -> Result<Option<PathBuf>> {
        let (db_key, raw) = self.disk.put(&key.into())?;
        let now_t = now();
        let row = self
            .store
            .with_conn(|conn| select_live(conn, &db_key, raw, now_t))?;
        Ok(row.and_then(|r| r.filename).map(|name| self.heap.path(&name)))
    }

    /// True when the key is present and not expired.
    pub fn contains(&self, key: impl Into<Key>) -> Result<bool> {
        let (db_key, raw) = self.disk.put(&key.into())?;
        let now_t = now();
        let found: Option<i64> = self.store.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT rowid FROM Cache WHERE key = ?1 AND raw = ?2 \
                     AND (expire_time IS NULL OR expire_time > ?3)",
                    params![&db_key, raw, now_t],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        Ok(found.is_some())
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Atomically read and remove a value.
    pub fn pop(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.pop_entry(&key.into(), &GetOptions::default())
            .map(|found| found.map(|entry| entry.value))
    }

    /// `pop` returning expiration and tag metadata alongside the value.
    pub fn pop_entry(&self, key: &Key, options: &GetOptions) -> Result<Option<Entry>> {
        let (db_key, raw) = self.disk.put(key)?;
        let now_t = now();

        let row = self.store.transact(options.retry, |scope| {
            let conn = scope.conn();
            let Some(row) = select_any(conn, &db_key, raw)? else {
                return Ok(None);
            };
            conn.execute("DELETE FROM Cache WHERE rowid = ?1", params![row.rowid])?;
            if row.expired(now_t) {
                if let Some(name) = &row.filename {
                    scope.defer_remove(name);
                }
                return Ok(None);
            }
            Ok(Some(row))
        })?;

        let Some(row) = row else {
            return Ok(None);
        };
        // The row is gone; read the file before removing it ourselves.
        let value = match self.disk.fetch(
            row.mode,
            row.filename.as_deref(),
            row.value.as_ref(),
            &self.heap,
        ) {
            Ok(value) => value,
            Err(e) if is_enoent(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        if let Some(name) = &row.filename {
            let _ = self.heap.remove(name);
        }
        Ok(Some(Entry {
            value,
            expire_time: row.expire_time,
            tag: row.tag,
        }))
    }

    /// Remove an entry. Missing and expired entries return false.
    pub fn delete(&self, key: impl Into<Key>, retry: bool) -> Result<bool> {
        let (db_key, raw) = self.disk.put(&key.into())?;
        let now_t = now();
        self.store.transact(retry, |scope| {
            let conn = scope.conn();
            let Some(row) = select_live(conn, &db_key, raw, now_t)? else {
                return Ok(false);
            };
            conn.execute("DELETE FROM Cache WHERE rowid = ?1", params![row.rowid])?;
            if let Some(name) = &row.filename {
                scope.defer_remove(name);
            }
            Ok(true)
        })
    }

    // ------------------------------------------------------------------
    // In-place updates
    // ------------------------------------------------------------------

    /// Update only the expiration time of a live entry.
    pub fn touch(&self, key: impl Into<Key>, expire: Option<f64>, retry: bool) -> Result<bool> {
        let (db_key, raw) = self.disk.put(&key.into())?;
        let now_t = now();
        let expire_time = expire.map(|e| now_t + e);
        self.store.transact(retry, |scope| {
            let changed = scope.conn().execute(
                "UPDATE Cache SET expire_time = ?1 WHERE key = ?2 AND raw = ?3 \
                 AND (expire_time IS NULL OR expire_time > ?4)",
                params![expire_time, &db_key, raw, now_t],
            )?;
            Ok(changed > 0)
        })
    }

    /// Atomic integer increment.
    ///
    /// Absent or expired entries start from `default`; with no default the
    /// operation fails with [`CacheError::KeyNotFound`].
    pub fn incr(
        &self,
        key: impl Into<Key>,
        delta: i64,
        default: Option<i64>,
        retry: bool,
    ) -> Result<i64> {
        let (db_key, raw) = self.disk.put(&key.into())?;
        let now_t = now();
        self.store.transact(retry, |scope| {
            let conn = scope.conn();
            let row = select_any(conn, &db_key, raw)?;

            if let Some(row) = row.as_ref().filter(|r| !r.expired(now_t)) {
                let current = match (row.mode, &row.value) {
                    (Mode::Raw, Some(SqlValue::Integer(i))) => *i,
                    _ => {
                        return Err(CacheError::Codec(
                            "cannot increment non-integer value".to_string(),
                        ))
                    }
                };
                let next = current + delta;
                conn.execute(
                    "UPDATE Cache SET value = ?1 WHERE rowid = ?2",
                    params![next, row.rowid],
                )?;
                return Ok(next);
            }

            let Some(base) = default else {
                return Err(CacheError::KeyNotFound);
            };
            let next = base + delta;
            match row {
                Some(row) => {
                    // Expired row: overwrite it in place.
                    conn.execute(
                        UPDATE_ROW,
                        params![
                            now_t,
                            Option::<f64>::None,
                            now_t,
                            0i64,
                            Option::<String>::None,
                            0i64,
                            Mode::Raw as i64,
                            Option::<String>::None,
                            SqlValue::Integer(next),
                            row.rowid
                        ],
                    )?;
                    if let Some(name) = &row.filename {
                        scope.defer_remove(name);
                    }
                }
                None => {
                    conn.execute(
                        INSERT_ROW,
                        params![
                            &db_key,
                            raw,
                            now_t,
                            Option::<f64>::None,
                            now_t,
                            0i64,
                            Option::<String>::None,
                            0i64,
                            Mode::Raw as i64,
                            Option::<String>::None,
                            SqlValue::Integer(next)
                        ],
                    )?;
                }
            }
            Ok(next)
        })
    }

    /// Atomic integer decrement; `incr` with a negated delta.
    pub fn decr(
        &self,
        key: impl Into<Key>,
        delta: i64,
        default: Option<i64>,
        retry: bool,
    ) -> Result<i64> {
        self.incr(key, -delta, default, retry)
    }

    // ------------------------------------------------------------------
    // Queue discipline
    // ------------------------------------------------------------------

    /// Append (or prepend) a value under a generated key. Returns the key.
    pub fn push(&self, value: impl Into<Value>, options: &PushOptions) -> Result<Key> {
        let value = value.into();
        let settings = self.current_settings();
        let stored = self
            .disk
            .store(&value, &self.heap, settings.disk_min_file_size as u64)?;
        let now_t = now();
        let expire_time = options.expire.map(|e| now_t + e);
        let created = stored.filename.clone();
        let inline = stored.value.clone().unwrap_or(SqlValue::Null);
        let prefix = options.prefix.as_deref();

        let result = self.store.transact(options.retry, |scope| {
            let conn = scope.conn();
            let (min_bound, max_bound) = queue_bounds(prefix);
            let order = match options.side {
                Side::Back => "DESC",
                Side::Front => "ASC",
            };
            let sql = format!(
                "SELECT key FROM Cache WHERE raw = 1 AND typeof(key) = '{}' \
                 AND key >= ?1 AND key <= ?2 ORDER BY key {} LIMIT 1",
                queue_key_type(prefix),
                order
            );
            let extreme: Option<SqlValue> = conn
                .query_row(&sql, params![&min_bound, &max_bound], |row| row.get(0))
                .optional()?;
            let num = match extreme {
                None => QUEUE_MIDPOINT,
                Some(stored_key) => {
                    let edge = parse_queue_key(&stored_key, prefix)?;
                    match options.side {
                        Side::Back => edge + 1,
                        Side::Front => edge - 1,
                    }
                }
            };
            conn.execute(
                INSERT_ROW,
                params![
                    queue_db_key(prefix, num),
                    true,
                    now_t,
                    expire_time,
                    now_t,
                    0i64,
                    options.tag,
                    stored.size,
                    stored.mode as i64,
                    stored.filename,
                    inline
                ],
            )?;
            Ok(queue_key(prefix, num))
        });

        if result.is_err() {
            if let Some(name) = &created {
                let _ = self.heap.remove(name);
            }
        }
        result
    }

    /// Remove and return the item at the queue's front (or back).
    pub fn pull(&self, options: &PullOptions) -> Result<Option<(Key, Value)>> {
        self.queue_take(options, true)
    }

    /// Return the item at the queue's front (or back) without removing it.
    pub fn peek(&self, options: &PullOptions) -> Result<Option<(Key, Value)>> {
        self.queue_take(options, false)
    }

    fn queue_take(&self, options: &PullOptions, remove: bool) -> Result<Option<(Key, Value)>> {
        enum Step {
            Empty,
            Expired,
            Row(RowData),
        }
        let prefix = options.prefix.as_deref();
        let (min_bound, max_bound) = queue_bounds(prefix);
        let order = match options.side {
            Side::Front => "ASC",
            Side::Back => "DESC",
        };
        let sql = format!(
            "SELECT rowid, key, raw, expire_time, tag, mode, filename, value FROM Cache \
             WHERE raw = 1 AND typeof(key) = '{}' AND key >= ?1 AND key <= ?2 \
             ORDER BY key {} LIMIT 1",
            queue_key_type(prefix),
            order
        );

        loop {
            let now_t = now();
            let step = self.store.transact(options.retry, |scope| {
                let conn = scope.conn();
                let row = conn
                    .query_row(&sql, params![&min_bound, &max_bound], map_row)
                    .optional()?;
                let Some(row) = row else {
                    return Ok(Step::Empty);
                };
                if row.expired(now_t) {
                    conn.execute("DELETE FROM Cache WHERE rowid = ?1", params![row.rowid])?;
                    if let Some(name) = &row.filename {
                        scope.defer_remove(name);
                    }
                    return Ok(Step::Expired);
                }
                if remove {
                    conn.execute("DELETE FROM Cache WHERE rowid = ?1", params![row.rowid])?;
                }
                Ok(Step::Row(row))
            })?;

            let row = match step {
                Step::Empty => return Ok(None),
                Step::Expired => continue,
                Step::Row(row) => row,
            };

            let key = self.disk.get(&row.key, row.raw)?;
            match self.disk.fetch(
                row.mode,
                row.filename.as_deref(),
                row.value.as_ref(),
                &self.heap,
            ) {
                Ok(value) => {
                    if remove {
                        if let Some(name) = &row.filename {
                            let _ = self.heap.remove(name);
                        }
                    }
                    return Ok(Some((key, value)));
                }
                Err(e) if is_enoent(&e) => {
                    if !remove {
                        // Dangling row under peek: drop it and move on.
                        let _ = self.store.transact(false, |scope| {
                            scope
                                .conn()
                                .execute("DELETE FROM Cache WHERE rowid = ?1", params![row.rowid])?;
                            Ok(())
                        });
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// First or last entry by insertion order, without removing it.
    pub fn peekitem(&self, last: bool) -> Result<Option<(Key, Value)>> {
        enum Step {
            Empty,
            Expired,
            Row(RowData),
        }
        let sql = if last {
            "SELECT rowid, key, raw, expire_time, tag, mode, filename, value FROM Cache \
             ORDER BY rowid DESC LIMIT 1"
        } else {
            "SELECT rowid, key, raw, expire_time, tag, mode, filename, value FROM Cache \
             ORDER BY rowid ASC LIMIT 1"
        };

        loop {
            let now_t = now();
            let step = self.store.transact(false, |scope| {
                let conn = scope.conn();
                let row = conn.query_row(sql, [], map_row).optional()?;
                let Some(row) = row else {
                    return Ok(Step::Empty);
                };
                if row.expired(now_t) {
                    conn.execute("DELETE FROM Cache WHERE rowid = ?1", params![row.rowid])?;
                    if let Some(name) = &row.filename {
                        scope.defer_remove(name);
                    }
                    return Ok(Step::Expired);
                }
                Ok(Step::Row(row))
            })?;

            let row = match step {
                Step::Empty => return Ok(None),
                Step::Expired => continue,
                Step::Row(row) => row,
            };
            let key = self.disk.get(&row.key, row.raw)?;
            match self.disk.fetch(
                row.mode,
                row.filename.as_deref(),
                row.value.as_ref(),
                &self.heap,
            ) {
                Ok(value) => return Ok(Some((key, value))),
                Err(e) if is_enoent(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Sweeps
    // ------------------------------------------------------------------

    /// Remove expired entries. Returns the count removed; a busy store
    /// mid-sweep stops early and reports partial progress.
    pub fn expire(&self) -> Result<usize> {
        self.expire_at(now())
    }

    /// `expire` against an explicit clock, for deterministic sweeps.
    pub fn expire_at(&self, now_t: f64) -> Result<usize> {
        let settings = self.current_settings();
        let chunk = sweep_chunk(settings.cull_limit);
        let mut count = 0usize;
        loop {
            let step = self.store.transact(false, |scope| {
                let conn = scope.conn();
                let rows = rows_id_file(
                    conn,
                    "SELECT rowid, filename FROM Cache \
                     WHERE expire_time IS NOT NULL AND expire_time < ?1 \
                     ORDER BY expire_time LIMIT ?2",
                    params![now_t, chunk],
                )?;
                for (rowid, filename) in &rows {
                    conn.execute("DELETE FROM Cache WHERE rowid = ?1", params![rowid])?;
                    if let Some(name) = filename {
                        scope.defer_remove(name);
                    }
                }
                Ok(rows.len())
            });
            match step {
                Ok(removed) => {
                    count += removed;
                    if (removed as i64) < chunk {
                        break;
                    }
                }
                Err(CacheError::Timeout) => {
                    warn!(removed = count, "expiration sweep timed out");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(count)
    }

    /// Cull the cache down to its size limit: expired entries first, then
    /// policy victims in chunks until `volume() <= size_limit`.
    pub fn cull(&self) -> Result<usize> {
        let settings = self.current_settings();
        let now_t = now();
        let mut count = self.expire_at(now_t)?;

        let policy = self.policy(&settings)?;
        let Some(cull_sql) = &policy.cull else {
            return Ok(count);
        };
        let chunk = sweep_chunk(settings.cull_limit);

        loop {
            if self.volume()? <= settings.size_limit {
                break;
            }
            let step = self.store.transact(false, |scope| {
                let conn = scope.conn();
                let rows = rows_id_file(conn, cull_sql, params![chunk])?;
                for (rowid, filename) in &rows {
                    conn.execute("DELETE FROM Cache WHERE rowid = ?1", params![rowid])?;
                    if let Some(name) = filename {
                        scope.defer_remove(name);
                    }
                }
                Ok(rows.len())
            });
            match step {
                Ok(0) => break,
                Ok(removed) => count += removed,
                Err(CacheError::Timeout) => {
                    warn!(removed = count, "cull timed out");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(count)
    }

    /// Remove every entry carrying `tag`, in bounded chunks.
    pub fn evict(&self, tag: &str) -> Result<usize> {
        self.sweep(Some(tag))
    }

    /// Remove every entry, in bounded chunks.
    pub fn clear(&self) -> Result<usize> {
        self.sweep(None)
    }

    fn sweep(&self, tag: Option<&str>) -> Result<usize> {
        let settings = self.current_settings();
        let chunk = sweep_chunk(settings.cull_limit);
        let mut last_rowid = 0i64;
        let mut count = 0usize;

        loop {
            let step = self.store.transact(false, |scope| {
                let conn = scope.conn();
                let rows = match tag {
                    Some(t) => rows_id_file(
                        conn,
                        "SELECT rowid, filename FROM Cache \
                         WHERE tag = ?1 AND rowid > ?2 ORDER BY rowid LIMIT ?3",
                        params![t, last_rowid, chunk],
                    )?,
                    None => rows_id_file(
                        conn,
                        "SELECT rowid, filename FROM Cache \
                         WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
                        params![last_rowid, chunk],
                    )?,
                };
                for (rowid, filename) in &rows {
                    conn.execute("DELETE FROM Cache WHERE rowid = ?1", params![rowid])?;
                    if let Some(name) = filename {
                        scope.defer_remove(name);
                    }
                }
                Ok(rows)
            });
            match step {
                Ok(rows) => {
                    count += rows.len();
                    match rows.last() {
                        Some((rowid, _)) if rows.len() as i64 == chunk => last_rowid = *rowid,
                        _ => break,
                    }
                }
                Err(CacheError::Timeout) => {
                    warn!(removed = count, "sweep timed out");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if count > 0 {
            info!(count, tag = tag.unwrap_or("<all>"), "swept entries");
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Number of live rows, from the trigger-maintained counter.
    pub fn len(&self) -> Result<u64> {
        let count: i64 = self.store.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT value FROM Settings WHERE key = 'count'",
                [],
                |row| row.get(0),
            )?)
        })?;
        Ok(count.max(0) as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Estimated on-disk footprint: database pages plus out-of-line value
    /// bytes.
    pub fn volume(&self) -> Result<i64> {
        self.store.with_conn(|conn| self.volume_with(conn))
    }

    fn volume_with(&self, conn: &Connection) -> Result<i64> {
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let size: i64 = conn.query_row(
            "SELECT value FROM Settings WHERE key = 'size'",
            [],
            |row| row.get(0),
        )?;
        Ok(self.page_size * page_count + size)
    }

    /// Return (hits, misses), optionally resetting them, and set whether
    /// statistics are collected going forward.
    pub fn stats(&self, enable: bool, reset: bool) -> Result<(i64, i64)> {
        let result = self.store.transact(false, |scope| {
            let conn = scope.conn();
            let hits: i64 = conn.query_row(
                "SELECT value FROM Settings WHERE key = 'hits'",
                [],
                |row| row.get(0),
            )?;
            let misses: i64 = conn.query_row(
                "SELECT value FROM Settings WHERE key = 'misses'",
                [],
                |row| row.get(0),
            )?;
            if reset {
                conn.execute(
                    "UPDATE Settings SET value = 0 WHERE key IN ('hits', 'misses')",
                    [],
                )?;
            }
            conn.execute(
                "UPDATE Settings SET value = ?1 WHERE key = 'statistics'",
                params![enable as i64],
            )?;
            Ok((hits, misses))
        })?;
        self.settings.write().statistics = enable;
        Ok(result)
    }

    /// Iterate keys in insertion order.
    pub fn iter(&self) -> KeyIter<'_> {
        KeyIter::new(self, false)
    }

    /// Iterate keys in reverse insertion order.
    pub fn iter_rev(&self) -> KeyIter<'_> {
        KeyIter::new(self, true)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Check index/heap consistency, returning warnings. With `fix`,
    /// repair what can be repaired.
    pub fn check(&self, fix: bool) -> Result<Vec<String>> {
        check::run(self, fix)
    }

    /// Update a durable setting and return its new value; with `value` of
    /// None, re-read the persisted value into memory and return it.
    pub fn reset(&self, name: &str, value: Option<SqlValue>) -> Result<SqlValue> {
        if !Settings::is_setting(name) {
            return Err(CacheError::Configuration(format!(
                "unknown setting: {}",
                name
            )));
        }

        match value {
            Some(value) => {
                let mut candidate = self.current_settings();
                candidate.apply(name, &value)?;
                candidate.validate()?;

                self.store.transact(true, |scope| {
                    scope.conn().execute(
                        "INSERT OR REPLACE INTO Settings (key, value) VALUES (?1, ?2)",
                        params![name, &value],
                    )?;
                    Ok(())
                })?;

                if name.starts_with("sqlite_") {
                    self.store.update_pragmas(&candidate)?;
                }
                if name == "eviction_policy" {
                    let policy = self.policy(&candidate)?;
                    if let Some(init) = &policy.init {
                        self.store.with_conn(|conn| {
                            conn.execute_batch(init)?;
                            Ok(())
                        })?;
                    }
                }
                if name == "tag_index" {
                    let sql = if candidate.tag_index {
                        "CREATE INDEX IF NOT EXISTS Cache_tag_rowid ON Cache (tag, rowid)"
                    } else {
                        "DROP INDEX IF EXISTS Cache_tag_rowid"
                    };
                    self.store.with_conn(|conn| {
                        conn.execute_batch(sql)?;
                        Ok(())
                    })?;
                }

                *self.settings.write() = candidate;
                info!(setting = name, "setting updated");
                Ok(value)
            }
            None => {
                let stored: Option<SqlValue> = self.store.with_conn(|conn| {
                    Ok(conn
                        .query_row(
                            "SELECT value FROM Settings WHERE key = ?1",
                            params![name],
                            |row| row.get(0),
                        )
                        .optional()?)
                })?;
                let stored = stored.ok_or_else(|| {
                    CacheError::Configuration(format!("setting {} not persisted", name))
                })?;
                self.settings.write().apply(name, &stored)?;
                Ok(stored)
            }
        }
    }

    /// Run `body` inside one write transaction, making a group of cache
    /// operations on this thread atomic.
    pub fn transact<T>(&self, retry: bool, body: impl FnOnce() -> Result<T>) -> Result<T> {
        self.store.transact(retry, |_scope| body())
    }

    /// Drop the calling thread's store connection. The next operation on
    /// this thread reopens it lazily.
    pub fn close(&self) {
        self.store.close();
    }
}

// ============================================================================
// Iteration
// ============================================================================

/// Chunked key iterator in rowid order.
///
/// Rows are read a chunk at a time outside any transaction: entries
/// appended during iteration may or may not be observed, and rows removed
/// concurrently are skipped without error.
pub struct KeyIter<'a> {
    cache: &'a Cache,
    reverse: bool,
    bound: i64,
    buffer: VecDeque<(i64, SqlValue, bool)>,
    done: bool,
}

impl<'a> KeyIter<'a> {
    fn new(cache: &'a Cache, reverse: bool) -> Self {
        Self {
            cache,
            reverse,
            bound: if reverse { i64::MAX } else { 0 },
            buffer: VecDeque::new(),
            done: false,
        }
    }

    fn refill(&mut self) -> Result<()> {
        let sql = if self.reverse {
            "SELECT rowid, key, raw FROM Cache WHERE rowid < ?1 ORDER BY rowid DESC LIMIT ?2"
        } else {
            "SELECT rowid, key, raw FROM Cache WHERE rowid > ?1 ORDER BY rowid ASC LIMIT ?2"
        };
        let rows: Vec<(i64, SqlValue, bool)> = self.cache.store.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mapped = stmt.query_map(params![self.bound, ITER_CHUNK], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, SqlValue>(1)?,
                    row.get::<_, i64>(2)? != 0,
                ))
            })?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            Ok(rows)
        })?;
        if rows.is_empty() {
            self.done = true;
            return Ok(());
        }
        self.bound = rows.last().map(|(rowid, _, _)| *rowid).unwrap_or(self.bound);
        self.buffer.extend(rows);
        Ok(())
    }
}

impl Iterator for KeyIter<'_> {
    type Item = Result<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if self.done {
                return None;
            }
            if let Err(e) = self.refill() {
                self.done = true;
                return Some(Err(e));
            }
            if self.buffer.is_empty() {
                return None;
            }
        }
        let (_, stored, raw) = self.buffer.pop_front()?;
        Some(self.cache.disk.get(&stored, raw))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key_forms() {
        assert_eq!(queue_key(None, 500_000_000_000_000), Key::Int(500_000_000_000_000));
        assert_eq!(
            queue_key(Some("jobs"), 7),
            Key::Text("jobs-000000000000007".to_string())
        );
    }

    #[test]
    fn test_queue_key_parse_roundtrip() {
        for num in [QUEUE_MIN, QUEUE_MIDPOINT, QUEUE_MAX] {
            let plain = queue_db_key(None, num);
            assert_eq!(parse_queue_key(&plain, None).unwrap(), num);
            let prefixed = queue_db_key(Some("q"), num);
            assert_eq!(parse_queue_key(&prefixed, Some("q")).unwrap(), num);
        }
    }

    #[test]
    fn test_queue_text_bounds_order() {
        // Fixed-width rendering keeps lexicographic order numeric.
        let low = queue_db_key(Some("q"), 9);
        let high = queue_db_key(Some("q"), 10);
        let (SqlValue::Text(a), SqlValue::Text(b)) = (low, high) else {
            panic!("expected text keys");
        };
        assert!(a < b);
    }

    #[test]
    fn test_sweep_chunk_fallback() {
        assert_eq!(sweep_chunk(10), 10);
        assert_eq!(sweep_chunk(0), 100);
    }
}
