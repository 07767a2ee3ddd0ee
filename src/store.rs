// # Index Store and Transaction Scope
//
// Single-file SQLite database beside the file heap, opened with one
// connection per thread. Writes run under BEGIN IMMEDIATE; a scope guard
// carries a deferred file-deletion list that is executed after COMMIT and
// discarded on ROLLBACK, so a crash can leave orphan files (benign,
// reclaimed by `check`) but never dangling filenames.

use crate::error::{CacheError, Result};
use crate::policy;
use crate::settings::{Settings, METADATA_KEYS};
use crate::types::SqlValue;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Index store file name under the cache root.
pub const DBNAME: &str = "cache.db";

/// Upper bound on retrying transient PRAGMA failures.
const PRAGMA_RETRY_BUDGET: Duration = Duration::from_secs(60);

/// Upper bound on internal retry of a busy write transaction.
const TRANSACT_RETRY_BUDGET: Duration = Duration::from_secs(60);

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CONNECTIONS: RefCell<HashMap<u64, Rc<ThreadState>>> =
        RefCell::new(HashMap::new());
}

/// Connection-level PRAGMA values applied to every new connection.
#[derive(Debug, Clone)]
pub(crate) struct Pragmas {
    pub journal_mode: String,
    pub synchronous: i64,
    pub cache_size: i64,
    pub mmap_size: i64,
}

impl Pragmas {
    fn from_settings(settings: &Settings) -> Self {
        Self {
            journal_mode: settings.sqlite_journal_mode.clone(),
            synchronous: settings.sqlite_synchronous,
            cache_size: settings.sqlite_cache_size,
            mmap_size: settings.sqlite_mmap_size,
        }
    }
}

/// Per-thread connection plus transaction bookkeeping.
pub(crate) struct ThreadState {
    pub(crate) conn: Connection,
    depth: Cell<usize>,
    cleanup: RefCell<Vec<String>>,
}

/// The embedded relational store holding entry rows and settings.
pub(crate) struct Store {
    id: u64,
    directory: PathBuf,
    db_path: PathBuf,
    timeout: Duration,
    pragmas: Mutex<Pragmas>,
}

impl Store {
    /// Open (creating if needed) the store under `directory`.
    ///
    /// Merges default settings, previously persisted settings, and the
    /// caller's overrides, then builds the schema. Returns the effective
    /// settings and the database page size.
    pub(crate) fn open(
        directory: &Path,
        timeout: Duration,
        overrides: &[(String, SqlValue)],
    ) -> Result<(Store, Settings, i64)> {
        fs::create_dir_all(directory)?;

        let db_path = directory.join(DBNAME);
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(timeout)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS Settings (key TEXT NOT NULL PRIMARY KEY, value)",
        )?;

        for (name, value) in Settings::default().pairs() {
            conn.execute(
                "INSERT OR IGNORE INTO Settings (key, value) VALUES (?1, ?2)",
                rusqlite::params![name, value],
            )?;
        }
        for (name, value) in overrides {
            if !Settings::is_setting(name) {
                return Err(CacheError::Configuration(format!(
                    "unknown setting: {}",
                    name
                )));
            }
            conn.execute(
                "INSERT OR REPLACE INTO Settings (key, value) VALUES (?1, ?2)",
                rusqlite::params![name, value],
            )?;
        }
        for name in METADATA_KEYS {
            conn.execute(
                "INSERT OR IGNORE INTO Settings (key, value) VALUES (?1, 0)",
                rusqlite::params![name],
            )?;
        }

        let mut rows = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT key, value FROM Settings")?;
            let loaded = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, SqlValue>(1)?))
            })?;
            for pair in loaded {
                let (key, value) = pair?;
                rows.insert(key, value);
            }
        }
        let settings = Settings::from_map(&rows)?;
        settings.validate()?;

        let pragmas = Pragmas::from_settings(&settings);
        apply_pragmas(&conn, &pragmas)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS Cache (
                rowid INTEGER PRIMARY KEY AUTOINCREMENT,
                key BLOB,
                raw INTEGER,
                store_time REAL,
                expire_time REAL,
                access_time REAL,
                access_count INTEGER DEFAULT 0,
                tag BLOB,
                size INTEGER DEFAULT 0,
                mode INTEGER DEFAULT 0,
                filename TEXT,
                value BLOB
            );
            CREATE UNIQUE INDEX IF NOT EXISTS Cache_key_raw ON Cache (key, raw);
            CREATE INDEX IF NOT EXISTS Cache_expire_time ON Cache (expire_time);
            CREATE TRIGGER IF NOT EXISTS Settings_count_insert
                AFTER INSERT ON Cache FOR EACH ROW BEGIN
                UPDATE Settings SET value = value + 1 WHERE key = 'count'; END;
            CREATE TRIGGER IF NOT EXISTS Settings_count_delete
                AFTER DELETE ON Cache FOR EACH ROW BEGIN
                UPDATE Settings SET value = value - 1 WHERE key = 'count'; END;
            CREATE TRIGGER IF NOT EXISTS Settings_size_insert
                AFTER INSERT ON Cache FOR EACH ROW BEGIN
                UPDATE Settings SET value = value + NEW.size WHERE key = 'size'; END;
            CREATE TRIGGER IF NOT EXISTS Settings_size_update
                AFTER UPDATE ON Cache FOR EACH ROW BEGIN
                UPDATE Settings SET value = value + NEW.size - OLD.size
                WHERE key = 'size'; END;
            CREATE TRIGGER IF NOT EXISTS Settings_size_delete
                AFTER DELETE ON Cache FOR EACH ROW BEGIN
                UPDATE Settings SET value = value - OLD.size WHERE key = 'size'; END;",
        )?;

        // Policy and tag indexes are created lazily from settings.
        if let Some(p) = policy::lookup(&settings.eviction_policy) {
            if let Some(init) = &p.init {
                conn.execute_batch(init)?;
            }
        }
        if settings.tag_index {
            conn.execute_batch(
                "CREATE INDEX IF NOT EXISTS Cache_tag_rowid ON Cache (tag, rowid)",
            )?;
        }

        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        let store = Store {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            directory: directory.to_path_buf(),
            db_path,
            timeout,
            pragmas: Mutex::new(pragmas),
        };

        let state = Rc::new(ThreadState {
            conn,
            depth: Cell::new(0),
            cleanup: RefCell::new(Vec::new()),
        });
        CONNECTIONS.with(|map| map.borrow_mut().insert(store.id, state));

        Ok((store, settings, page_size))
    }

    pub(crate) fn directory(&self) -> &Path {
        &self.directory
    }

    /// The calling thread's connection state, opened lazily.
    pub(crate) fn state(&self) -> Result<Rc<ThreadState>> {
        let existing = CONNECTIONS.with(|map| map.borrow().get(&self.id).cloned());
        if let Some(state) = existing {
            return Ok(state);
        }

        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.timeout)?;
        let pragmas = self.pragmas.lock().clone();
        apply_pragmas(&conn, &pragmas)?;

        let state = Rc::new(ThreadState {
            conn,
            depth: Cell::new(0),
            cleanup: RefCell::new(Vec::new()),
        });
        CONNECTIONS.with(|map| map.borrow_mut().insert(self.id, state.clone()));
        Ok(state)
    }

    /// Run a read against the calling thread's connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let state = self.state()?;
        f(&state.conn)
    }

    /// Run `f` inside a write transaction.
    ///
    /// Begins IMMEDIATE (nested calls on the same thread join the open
    /// transaction), commits on success then deletes the deferred cleanup
    /// files, rolls back on error and discards the list. A busy store
    /// surfaces [`CacheError::Timeout`]; with `retry` the begin step is
    /// repeated internally for up to 60 seconds.
    pub(crate) fn transact<T>(
        &self,
        retry: bool,
        f: impl FnOnce(&TxnScope<'_>) -> Result<T>,
    ) -> Result<T> {
        let state = self.state()?;
        let outer = state.depth.get() == 0;

        if outer {
            self.begin(&state.conn, retry)?;
        }
        state.depth.set(state.depth.get() + 1);

        let mut finalizer = TxnFinalizer {
            state: &state,
            outer,
            armed: true,
        };
        let scope = TxnScope { state: &state };
        let result = f(&scope);
        finalizer.armed = false;
        drop(finalizer);
        state.depth.set(state.depth.get() - 1);

        match result {
            Ok(value) => {
                if outer {
                    state
                        .conn
                        .execute_batch("COMMIT")
                        .map_err(map_busy)?;
                    let files: Vec<String> = state.cleanup.borrow_mut().drain(..).collect();
                    for relative in files {
                        remove_tolerant(&self.directory.join(&relative))?;
                    }
                }
                Ok(value)
            }
            Err(e) => {
                if outer {
                    if let Err(rollback) = state.conn.execute_batch("ROLLBACK") {
                        warn!(error = %rollback, "rollback failed");
                    }
                    state.cleanup.borrow_mut().clear();
                }
                Err(e)
            }
        }
    }

    fn begin(&self, conn: &Connection, retry: bool) -> Result<()> {
        let start = Instant::now();
        loop {
            match conn.execute_batch("BEGIN IMMEDIATE") {
                Ok(()) => return Ok(()),
                Err(e) if is_busy(&e) => {
                    if !retry || start.elapsed() >= TRANSACT_RETRY_BUDGET {
                        return Err(CacheError::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Replace the pragma set used for new connections and reapply to the
    /// calling thread's connection. Connections already open on other
    /// threads keep their values until reopened.
    pub(crate) fn update_pragmas(&self, settings: &Settings) -> Result<()> {
        let pragmas = Pragmas::from_settings(settings);
        *self.pragmas.lock() = pragmas.clone();
        self.with_conn(|conn| apply_pragmas(conn, &pragmas))
    }

    /// Drop the calling thread's connection. The next operation on this
    /// thread reopens lazily.
    pub(crate) fn close(&self) {
        CONNECTIONS.with(|map| {
            if map.borrow_mut().remove(&self.id).is_some() {
                debug!(store = self.id, "closed thread connection");
            }
        });
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Connections opened by other threads are released when those
        // threads exit.
        self.close();
    }
}

/// Critical section handed to transaction bodies.
pub(crate) struct TxnScope<'a> {
    state: &'a ThreadState,
}

impl TxnScope<'_> {
    pub(crate) fn conn(&self) -> &Connection {
        &self.state.conn
    }

    /// Schedule a heap file for deletion after COMMIT.
    pub(crate) fn defer_remove(&self, relative: &str) {
        self.state.cleanup.borrow_mut().push(relative.to_string());
    }
}

/// Rolls the transaction back if the body unwinds.
struct TxnFinalizer<'a> {
    state: &'a ThreadState,
    outer: bool,
    armed: bool,
}

impl Drop for TxnFinalizer<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.depth.set(self.state.depth.get().saturating_sub(1));
            if self.outer {
                let _ = self.state.conn.execute_batch("ROLLBACK");
                self.state.cleanup.borrow_mut().clear();
            }
        }
    }
}

/// True for SQLITE_BUSY / SQLITE_LOCKED failures.
pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Convert a busy failure to Timeout, passing other errors through.
pub(crate) fn map_busy(err: rusqlite::Error) -> CacheError {
    if is_busy(&err) {
        CacheError::Timeout
    } else {
        CacheError::Sqlite(err)
    }
}

fn remove_tolerant(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn apply_pragmas(conn: &Connection, pragmas: &Pragmas) -> Result<()> {
    run_pragma(conn, &format!("PRAGMA journal_mode = {}", pragmas.journal_mode))?;
    run_pragma(conn, &format!("PRAGMA synchronous = {}", pragmas.synchronous))?;
    run_pragma(conn, &format!("PRAGMA cache_size = {}", pragmas.cache_size))?;
    run_pragma(conn, &format!("PRAGMA mmap_size = {}", pragmas.mmap_size))?;
    Ok(())
}

/// Execute a PRAGMA, draining any result rows. Transient busy failures
/// retry for up to the PRAGMA budget.
fn run_pragma(conn: &Connection, sql: &str) -> Result<()> {
    let start = Instant::now();
    loop {
        let attempt = (|| -> rusqlite::Result<()> {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query([])?;
            while rows.next()?.is_some() {}
            Ok(())
        })();
        match attempt {
            Ok(()) => return Ok(()),
            Err(e) if is_busy(&e) && start.elapsed() < PRAGMA_RETRY_BUDGET => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
