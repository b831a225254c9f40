//! Transactional metadata index
//!
//! One SQLite database per cache directory. Every structural change runs in
//! a `BEGIN IMMEDIATE` transaction retried with backoff while the store is
//! busy; reads run in deferred transactions so they observe one committed
//! version. Blob files scheduled for removal are moved into `tmp/` after all
//! SQL in the transaction succeeded and before it commits; a failed move rolls
//! the transaction back. They are unlinked only once the commit went through,
//! and put back if it did not.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{
    params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior,
};
use tracing::debug;

use crate::directory::Directory;
use crate::error::Result;
use crate::key::{Key, Mode};
use crate::retry::RetryPolicy;
use crate::settings::{Settings, SqliteSettings};

/// Idle connections kept per index handle
const MAX_IDLE_CONNECTIONS: usize = 8;

/// Rows fetched per page by [`Keys`]
const KEYS_PAGE_SIZE: usize = 100;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO metadata (key, value)
    VALUES ('count', 0), ('size', 0), ('hits', 0), ('misses', 0), ('settings_version', 0);
CREATE TABLE IF NOT EXISTS cache (
    rowid INTEGER PRIMARY KEY,
    key BLOB NOT NULL UNIQUE,
    store_time REAL NOT NULL,
    expire_time REAL,
    access_time REAL NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    tag TEXT,
    size INTEGER NOT NULL DEFAULT 0,
    mode INTEGER NOT NULL,
    filename TEXT,
    value BLOB
);
CREATE INDEX IF NOT EXISTS cache_store_time ON cache (store_time);
CREATE INDEX IF NOT EXISTS cache_access_time ON cache (access_time);
CREATE INDEX IF NOT EXISTS cache_access_count ON cache (access_count);
CREATE INDEX IF NOT EXISTS cache_expire_time ON cache (expire_time);
CREATE INDEX IF NOT EXISTS cache_tag ON cache (tag);
CREATE TRIGGER IF NOT EXISTS cache_insert AFTER INSERT ON cache BEGIN
    UPDATE metadata SET value = value + 1 WHERE key = 'count';
    UPDATE metadata SET value = value + NEW.size WHERE key = 'size';
END;
CREATE TRIGGER IF NOT EXISTS cache_delete AFTER DELETE ON cache BEGIN
    UPDATE metadata SET value = value - 1 WHERE key = 'count';
    UPDATE metadata SET value = value - OLD.size WHERE key = 'size';
END;
CREATE TRIGGER IF NOT EXISTS cache_update_size AFTER UPDATE OF size ON cache BEGIN
    UPDATE metadata SET value = value + NEW.size - OLD.size WHERE key = 'size';
END;
CREATE TABLE IF NOT EXISTS sync (
    name TEXT PRIMARY KEY,
    holder TEXT,
    count INTEGER NOT NULL,
    max_count INTEGER NOT NULL,
    token INTEGER NOT NULL DEFAULT 0,
    depth INTEGER NOT NULL DEFAULT 0,
    expire_time REAL
);
";

const ENTRY_COLUMNS: &str = "rowid, key, store_time, expire_time, access_time, access_count, \
                             tag, size, mode, filename, value";

/// Seconds since the Unix epoch as stored in the index
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Counters kept in the `metadata` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKey {
    /// Number of entry rows
    Count,
    /// Sum of entry sizes
    Size,
    /// Cache hits
    Hits,
    /// Cache misses
    Misses,
}

impl MetadataKey {
    fn as_str(self) -> &'static str {
        match self {
            MetadataKey::Count => "count",
            MetadataKey::Size => "size",
            MetadataKey::Hits => "hits",
            MetadataKey::Misses => "misses",
        }
    }
}

/// Column an eviction pass orders candidates by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrder {
    /// Oldest `store_time` first
    StoreTime,
    /// Oldest `access_time` first
    AccessTime,
    /// Lowest `access_count` first
    AccessCount,
}

impl EntryOrder {
    fn column(self) -> &'static str {
        match self {
            EntryOrder::StoreTime => "store_time",
            EntryOrder::AccessTime => "access_time",
            EntryOrder::AccessCount => "access_count",
        }
    }
}

/// One entry row
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRow {
    /// SQLite rowid
    pub rowid: i64,
    /// Lookup key
    pub key: Key,
    /// When the value was written
    pub store_time: f64,
    /// Absolute deadline, if any
    pub expire_time: Option<f64>,
    /// Last read or write
    pub access_time: f64,
    /// Number of reads
    pub access_count: i64,
    /// Grouping label
    pub tag: Option<String>,
    /// Payload size in bytes
    pub size: u64,
    /// Storage mode of the payload
    pub mode: Mode,
    /// Blob file, for file-backed values
    pub filename: Option<String>,
    /// Inline payload, for small values
    pub value: Option<Vec<u8>>,
}

impl EntryRow {
    /// True if the entry is logically absent at `now`.
    pub fn is_expired(&self, now: f64) -> bool {
        matches!(self.expire_time, Some(t) if t <= now)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let mode: u8 = row.get(8)?;
        let size: i64 = row.get(7)?;
        Ok(EntryRow {
            rowid: row.get(0)?,
            key: row.get(1)?,
            store_time: row.get(2)?,
            expire_time: row.get(3)?,
            access_time: row.get(4)?,
            access_count: row.get(5)?,
            tag: row.get(6)?,
            size: size.max(0) as u64,
            mode: Mode::from_u8(mode).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Integer, Box::new(e))
            })?,
            filename: row.get(9)?,
            value: row.get(10)?,
        })
    }
}

/// Values written by an insert or overwrite
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    /// Lookup key
    pub key: &'a Key,
    /// Write time
    pub now: f64,
    /// Absolute deadline
    pub expire_time: Option<f64>,
    /// Grouping label
    pub tag: Option<&'a str>,
    /// Payload size
    pub size: u64,
    /// Payload mode
    pub mode: Mode,
    /// Blob file, exclusive with `value`
    pub filename: Option<&'a str>,
    /// Inline payload, exclusive with `filename`
    pub value: Option<&'a [u8]>,
}

/// Row-level queries shared by read snapshots and write transactions
pub trait IndexQueries {
    /// Look up the row for a key, expired or not.
    fn entry(&self, key: &Key) -> Result<Option<EntryRow>>;
    /// Read a counter.
    fn metadata(&self, key: MetadataKey) -> Result<i64>;
    /// Up to `limit` rows in eviction order.
    fn ordered(&self, order: EntryOrder, limit: u32) -> Result<Vec<EntryRow>>;
    /// Up to `limit` rows expired at `now`.
    fn expired(&self, now: f64, limit: u32) -> Result<Vec<EntryRow>>;
    /// Up to `limit` rows carrying any of `tags`.
    fn tagged(&self, tags: &[String], limit: u32) -> Result<Vec<EntryRow>>;
    /// Up to `limit` rows of any kind.
    fn any_rows(&self, limit: u32) -> Result<Vec<EntryRow>>;
    /// Every blob filename referenced by a row, with its key.
    fn referenced_files(&self) -> Result<Vec<(Key, String)>>;
    /// True if some row refers to the blob file.
    fn references_file(&self, filename: &str) -> Result<bool>;
    /// Actual `(count, size)` computed from the rows.
    fn recount(&self) -> Result<(i64, i64)>;
    /// Bumped every time the persisted settings change.
    fn settings_version(&self) -> Result<i64>;
    /// Settings persisted in the index, if any.
    fn stored_settings(&self) -> Result<Option<Settings>>;
}

impl IndexQueries for Connection {
    fn entry(&self, key: &Key) -> Result<Option<EntryRow>> {
        let sql = format!("SELECT {} FROM cache WHERE key = ?1", ENTRY_COLUMNS);
        Ok(self
            .prepare_cached(&sql)?
            .query_row(params![key], EntryRow::from_row)
            .optional()?)
    }

    fn metadata(&self, key: MetadataKey) -> Result<i64> {
        Ok(self
            .prepare_cached("SELECT value FROM metadata WHERE key = ?1")?
            .query_row(params![key.as_str()], |row| row.get(0))
            .optional()?
            .unwrap_or(0))
    }

    fn ordered(&self, order: EntryOrder, limit: u32) -> Result<Vec<EntryRow>> {
        let sql = format!(
            "SELECT {} FROM cache ORDER BY {}, rowid LIMIT ?1",
            ENTRY_COLUMNS,
            order.column()
        );
        collect_rows(self, &sql, params![limit])
    }

    fn expired(&self, now: f64, limit: u32) -> Result<Vec<EntryRow>> {
        let sql = format!(
            "SELECT {} FROM cache WHERE expire_time IS NOT NULL AND expire_time <= ?1 \
             ORDER BY expire_time LIMIT ?2",
            ENTRY_COLUMNS
        );
        collect_rows(self, &sql, params![now, limit])
    }

    fn tagged(&self, tags: &[String], limit: u32) -> Result<Vec<EntryRow>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; tags.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM cache WHERE tag IN ({}) ORDER BY rowid LIMIT {}",
            ENTRY_COLUMNS, placeholders, limit
        );
        collect_rows(self, &sql, params_from_iter(tags))
    }

    fn any_rows(&self, limit: u32) -> Result<Vec<EntryRow>> {
        let sql = format!("SELECT {} FROM cache ORDER BY rowid LIMIT ?1", ENTRY_COLUMNS);
        collect_rows(self, &sql, params![limit])
    }

    fn referenced_files(&self) -> Result<Vec<(Key, String)>> {
        let mut stmt = self.prepare("SELECT key, filename FROM cache WHERE filename IS NOT NULL")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn references_file(&self, filename: &str) -> Result<bool> {
        Ok(self
            .prepare_cached("SELECT 1 FROM cache WHERE filename = ?1 LIMIT 1")?
            .exists(params![filename])?)
    }

    fn recount(&self) -> Result<(i64, i64)> {
        Ok(self.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM cache",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    }

    fn settings_version(&self) -> Result<i64> {
        Ok(self
            .prepare_cached("SELECT value FROM metadata WHERE key = 'settings_version'")?
            .query_row([], |row| row.get(0))
            .optional()?
            .unwrap_or(0))
    }

    fn stored_settings(&self) -> Result<Option<Settings>> {
        let stored: Option<String> = self
            .prepare_cached("SELECT value FROM settings WHERE key = 'settings'")?
            .query_row([], |row| row.get(0))
            .optional()?;
        stored.map(|json| Settings::from_json(&json)).transpose()
    }
}

fn persist_settings(conn: &Connection, settings: &Settings) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES ('settings', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![settings.to_json()?],
    )?;
    conn.execute(
        "UPDATE metadata SET value = value + 1 WHERE key = 'settings_version'",
        [],
    )?;
    Ok(())
}

fn collect_rows(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<EntryRow>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, EntryRow::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

struct Pool {
    path: PathBuf,
    sqlite: SqliteSettings,
    idle: Mutex<Vec<Connection>>,
}

impl Pool {
    fn get(self: &Arc<Self>) -> Result<PooledConnection> {
        let conn = match self.idle.lock().pop() {
            Some(conn) => conn,
            None => self.connect()?,
        };
        Ok(PooledConnection {
            pool: Arc::clone(self),
            conn: Some(conn),
        })
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.sqlite.busy_timeout())?;
        conn.execute_batch(&self.sqlite.pragmas())?;
        Ok(conn)
    }
}

/// Connection checked out of an index's pool; returned on drop
pub struct PooledConnection {
    pool: Arc<Pool>,
    conn: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only taken in drop.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !conn.is_autocommit() {
                // A panic or early return left a transaction open; do not reuse.
                return;
            }
            let mut idle = self.pool.idle.lock();
            if idle.len() < MAX_IDLE_CONNECTIONS {
                idle.push(conn);
            }
        }
    }
}

/// A write transaction in progress
pub struct Txn<'a> {
    tx: rusqlite::Transaction<'a>,
    removals: Vec<String>,
}

impl Txn<'_> {
    /// Insert a new entry row, returning its rowid.
    pub fn insert(&self, entry: &NewEntry<'_>) -> Result<i64> {
        self.tx
            .prepare_cached(
                "INSERT INTO cache (key, store_time, expire_time, access_time, access_count, \
                 tag, size, mode, filename, value) VALUES (?1, ?2, ?3, ?2, 0, ?4, ?5, ?6, ?7, ?8)",
            )?
            .execute(params![
                entry.key,
                entry.now,
                entry.expire_time,
                entry.tag,
                entry.size as i64,
                entry.mode as u8,
                entry.filename,
                entry.value,
            ])?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Overwrite an existing row in place, resetting its access metadata.
    ///
    /// The previous blob file, if any, is scheduled for removal.
    pub fn replace(&mut self, old: &EntryRow, entry: &NewEntry<'_>) -> Result<()> {
        self.tx
            .prepare_cached(
                "UPDATE cache SET store_time = ?2, expire_time = ?3, access_time = ?2, \
                 access_count = 0, tag = ?4, size = ?5, mode = ?6, filename = ?7, value = ?8 \
                 WHERE rowid = ?1",
            )?
            .execute(params![
                old.rowid,
                entry.now,
                entry.expire_time,
                entry.tag,
                entry.size as i64,
                entry.mode as u8,
                entry.filename,
                entry.value,
            ])?;
        if let Some(filename) = &old.filename {
            if entry.filename != Some(filename.as_str()) {
                self.removals.push(filename.clone());
            }
        }
        Ok(())
    }

    /// Delete a row and schedule its blob file for removal.
    pub fn remove(&mut self, row: &EntryRow) -> Result<()> {
        self.tx
            .prepare_cached("DELETE FROM cache WHERE rowid = ?1")?
            .execute(params![row.rowid])?;
        if let Some(filename) = &row.filename {
            self.removals.push(filename.clone());
        }
        Ok(())
    }

    /// Record a read of a row.
    pub fn record_access(&self, rowid: i64, now: f64) -> Result<bool> {
        let changed = self
            .tx
            .prepare_cached(
                "UPDATE cache SET access_time = ?2, access_count = access_count + 1 WHERE rowid = ?1",
            )?
            .execute(params![rowid, now])?;
        Ok(changed == 1)
    }

    /// Change a row's deadline.
    pub fn set_expire_time(&self, rowid: i64, expire_time: Option<f64>) -> Result<()> {
        self.tx
            .prepare_cached("UPDATE cache SET expire_time = ?2 WHERE rowid = ?1")?
            .execute(params![rowid, expire_time])?;
        Ok(())
    }

    /// Add to a counter.
    pub fn add_metadata(&self, key: MetadataKey, delta: i64) -> Result<()> {
        self.tx
            .prepare_cached("UPDATE metadata SET value = value + ?2 WHERE key = ?1")?
            .execute(params![key.as_str(), delta])?;
        Ok(())
    }

    /// Overwrite a counter.
    pub fn set_metadata(&self, key: MetadataKey, value: i64) -> Result<()> {
        self.tx
            .prepare_cached("UPDATE metadata SET value = ?2 WHERE key = ?1")?
            .execute(params![key.as_str(), value])?;
        Ok(())
    }

    /// Schedule a blob file for removal when this transaction commits.
    pub fn remove_file_on_commit(&mut self, filename: String) {
        self.removals.push(filename);
    }
}

impl Deref for Txn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

/// Handle to a cache directory's metadata index
#[derive(Clone)]
pub struct Index {
    directory: Directory,
    pool: Arc<Pool>,
    retry: RetryPolicy,
}

impl Index {
    /// Open or create the index in `directory`
    ///
    /// # Arguments
    /// * `directory` - Storage directory owning the index file
    /// * `settings` - Settings to persist; `None` reuses what the index already holds
    ///
    /// # Returns
    /// * `Result<(Index, Settings)>` - Index handle and the effective settings
    pub fn open(directory: &Directory, settings: Option<Settings>) -> Result<(Self, Settings)> {
        let bootstrap = settings.clone().unwrap_or_default();
        bootstrap.validate()?;

        let pool = Arc::new(Pool {
            path: directory.index_path(),
            sqlite: bootstrap.sqlite.clone(),
            idle: Mutex::new(Vec::new()),
        });
        let mut index = Index {
            directory: directory.clone(),
            pool,
            retry: bootstrap.retry.clone(),
        };

        let effective = index.write(|txn| {
            txn.execute_batch(SCHEMA)?;
            match (&settings, txn.stored_settings()?) {
                (None, Some(stored)) => Ok(stored),
                (given, _) => {
                    let effective = given.clone().unwrap_or_default();
                    persist_settings(txn, &effective)?;
                    Ok(effective)
                }
            }
        })?;

        effective.validate()?;
        index.retry = effective.retry.clone();
        debug!(path = %directory.index_path().display(), "index opened");
        Ok((index, effective))
    }

    /// Storage directory this index belongs to
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Retry policy this handle runs transactions with
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Change the persisted settings in place
    ///
    /// The stored settings are read, changed and written back in one write
    /// transaction, so concurrent updates from other handles are not lost.
    ///
    /// # Returns
    /// * `Result<Settings>` - The settings now persisted
    pub fn update_settings(&self, change: impl Fn(&mut Settings)) -> Result<Settings> {
        self.write(|txn| {
            let mut settings = txn.stored_settings()?.unwrap_or_default();
            change(&mut settings);
            settings.validate()?;
            persist_settings(txn, &settings)?;
            Ok(settings)
        })
    }

    /// Run `f` in an immediate write transaction, retrying while busy
    ///
    /// Blob files scheduled through the transaction are set aside before
    /// commit and unlinked after it; if setting one aside fails the
    /// transaction is rolled back.
    pub fn write<T>(&self, mut f: impl FnMut(&mut Txn<'_>) -> Result<T>) -> Result<T> {
        self.retry.run(|| {
            let mut conn = self.pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut txn = Txn {
                tx,
                removals: Vec::new(),
            };
            let out = f(&mut txn)?;
            let staged = self.directory.stage_removals(&txn.removals)?;
            if let Err(err) = txn.tx.commit() {
                self.directory.restore_removals(staged);
                return Err(err.into());
            }
            self.directory.purge_removals(staged);
            Ok(out)
        })
    }

    /// Run `f` against a consistent read snapshot, retrying while busy.
    pub fn read<T>(&self, mut f: impl FnMut(&Connection) -> Result<T>) -> Result<T> {
        self.retry.run(|| {
            let mut conn = self.pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let out = f(&*tx)?;
            tx.finish()?;
            Ok(out)
        })
    }

    /// Open a long-lived read snapshot for iteration.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.retry.run(|| {
            let conn = self.pool.get()?;
            conn.execute_batch("BEGIN DEFERRED")?;
            let mut snapshot = Snapshot {
                conn,
                max_rowid: 0,
                now: now(),
            };
            // The first read pins the snapshot.
            snapshot.max_rowid = snapshot
                .conn
                .query_row("SELECT COALESCE(MAX(rowid), 0) FROM cache", [], |row| row.get(0))?;
            Ok(snapshot)
        })
    }
}

/// A read transaction held open across calls
pub struct Snapshot {
    conn: PooledConnection,
    max_rowid: i64,
    now: f64,
}

impl Snapshot {
    /// Time the snapshot was taken
    pub fn taken_at(&self) -> f64 {
        self.now
    }

    fn page(&self, cursor: i64, tag: Option<&str>, reverse: bool) -> Result<Vec<(i64, Key)>> {
        let sql = if reverse {
            "SELECT rowid, key FROM cache WHERE rowid < ?1 AND rowid <= ?2 \
             AND (expire_time IS NULL OR expire_time > ?3) AND (?4 IS NULL OR tag = ?4) \
             ORDER BY rowid DESC LIMIT ?5"
        } else {
            "SELECT rowid, key FROM cache WHERE rowid > ?1 AND rowid <= ?2 \
             AND (expire_time IS NULL OR expire_time > ?3) AND (?4 IS NULL OR tag = ?4) \
             ORDER BY rowid LIMIT ?5"
        };
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(
            params![cursor, self.max_rowid, self.now, tag, KEYS_PAGE_SIZE as i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let _ = self.conn.execute_batch("COMMIT");
    }
}

/// Lazy, restartable iterator over the keys visible in a snapshot
pub struct Keys {
    snapshot: Snapshot,
    tag: Option<String>,
    reverse: bool,
    last_rowid: i64,
    buffer: VecDeque<Key>,
    done: bool,
}

impl Keys {
    /// Iterate every live key.
    pub fn new(snapshot: Snapshot) -> Self {
        Self::with_tag(snapshot, None)
    }

    /// Iterate live keys carrying `tag`, or every key for `None`.
    pub fn with_tag(snapshot: Snapshot, tag: Option<String>) -> Self {
        Keys {
            snapshot,
            tag,
            reverse: false,
            last_rowid: 0,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Yield keys newest first instead.
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self.restart();
        self
    }

    /// Start again from the first key of the same snapshot.
    pub fn restart(&mut self) {
        self.last_rowid = if self.reverse { i64::MAX } else { 0 };
        self.buffer.clear();
        self.done = false;
    }
}

impl Iterator for Keys {
    type Item = Result<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            match self
                .snapshot
                .page(self.last_rowid, self.tag.as_deref(), self.reverse)
            {
                Ok(page) => {
                    if page.len() < KEYS_PAGE_SIZE {
                        self.done = true;
                    }
                    if let Some((rowid, _)) = page.last() {
                        self.last_rowid = *rowid;
                    }
                    self.buffer.extend(page.into_iter().map(|(_, key)| key));
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, Placement};
    use crate::error::Error;
    use crate::key::Value;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Index {
        let directory = Directory::open(dir.path()).unwrap();
        Index::open(&directory, None).unwrap().0
    }

    fn put(index: &Index, key: Key, payload: &[u8]) -> i64 {
        index
            .write(|txn| {
                txn.insert(&NewEntry {
                    key: &key,
                    now: now(),
                    expire_time: None,
                    tag: None,
                    size: payload.len() as u64,
                    mode: Mode::Raw,
                    filename: None,
                    value: Some(payload),
                })
            })
            .unwrap()
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(dir.path()).unwrap();
        let custom = Settings::default().with_size_limit(1234);
        let (_, effective) = Index::open(&directory, Some(custom.clone())).unwrap();
        assert_eq!(effective, custom);

        // Reopening without settings reuses the persisted ones.
        let (_, reloaded) = Index::open(&directory, None).unwrap();
        assert_eq!(reloaded.size_limit, 1234);
    }

    #[test]
    fn test_insert_and_lookup() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        put(&index, Key::from("a"), b"alpha");

        let row = index.read(|conn| conn.entry(&Key::from("a"))).unwrap().unwrap();
        assert_eq!(row.value.as_deref(), Some(&b"alpha"[..]));
        assert_eq!(row.size, 5);
        assert_eq!(row.access_count, 0);
        assert!(index.read(|conn| conn.entry(&Key::from("b"))).unwrap().is_none());
    }

    #[test]
    fn test_keys_are_typed() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        put(&index, Key::Int(1), b"int");
        put(&index, Key::from("1"), b"text");
        put(&index, Key::from(&b"1"[..]), b"bytes");

        let count = index.read(|conn| conn.metadata(MetadataKey::Count)).unwrap();
        assert_eq!(count, 3);
        let row = index.read(|conn| conn.entry(&Key::from("1"))).unwrap().unwrap();
        assert_eq!(row.value.as_deref(), Some(&b"text"[..]));
    }

    #[test]
    fn test_triggers_track_count_and_size() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        put(&index, Key::from("a"), &[0; 10]);
        put(&index, Key::from("b"), &[0; 20]);

        let row = index.read(|conn| conn.entry(&Key::from("a"))).unwrap().unwrap();
        index.write(|txn| txn.remove(&row)).unwrap();

        let (count, size) = index
            .read(|conn| Ok((conn.metadata(MetadataKey::Count)?, conn.metadata(MetadataKey::Size)?)))
            .unwrap();
        assert_eq!((count, size), (1, 20));
        assert_eq!(index.read(|conn| conn.recount()).unwrap(), (1, 20));
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);

        let key = Key::from("a");
        let result: Result<()> = index.write(|txn| {
            txn.insert(&NewEntry {
                key: &key,
                now: now(),
                expire_time: None,
                tag: None,
                size: 1,
                mode: Mode::Raw,
                filename: None,
                value: Some(b"x"),
            })?;
            Err(Error::Serialization("boom".into()))
        });
        assert!(result.is_err());
        assert!(index.read(|conn| conn.entry(&key)).unwrap().is_none());
        assert_eq!(index.read(|conn| conn.metadata(MetadataKey::Count)).unwrap(), 0);
    }

    #[test]
    fn test_remove_unlinks_blob_on_commit() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        let encoded = encode(Value::Bytes(vec![9; 64]), 0);
        assert_eq!(encoded.placement, Placement::File);
        let filename = index.directory().write_blob(&encoded).unwrap();

        let key = Key::from("big");
        index
            .write(|txn| {
                txn.insert(&NewEntry {
                    key: &key,
                    now: now(),
                    expire_time: None,
                    tag: None,
                    size: encoded.size(),
                    mode: encoded.mode,
                    filename: Some(filename.as_str()),
                    value: None,
                })
            })
            .unwrap();

        let row = index.read(|conn| conn.entry(&key)).unwrap().unwrap();
        index.write(|txn| txn.remove(&row)).unwrap();
        assert_eq!(index.directory().read_blob(&filename).unwrap(), None);
    }

    #[test]
    fn test_ordered_candidates() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        let a = put(&index, Key::from("a"), b"1");
        let b = put(&index, Key::from("b"), b"2");
        index.write(|txn| txn.record_access(a, now() + 10.0)).unwrap();

        let by_access = index.read(|conn| conn.ordered(EntryOrder::AccessTime, 10)).unwrap();
        assert_eq!(by_access[0].rowid, b);
        let by_store = index.read(|conn| conn.ordered(EntryOrder::StoreTime, 10)).unwrap();
        assert_eq!(by_store[0].rowid, a);
        let by_count = index.read(|conn| conn.ordered(EntryOrder::AccessCount, 1)).unwrap();
        assert_eq!(by_count.len(), 1);
        assert_eq!(by_count[0].rowid, b);
    }

    #[test]
    fn test_keys_snapshot_excludes_later_writes() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        for i in 0..250 {
            put(&index, Key::Int(i), b"v");
        }

        let mut keys = Keys::new(index.snapshot().unwrap());
        let first = keys.next().unwrap().unwrap();
        assert_eq!(first, Key::Int(0));

        put(&index, Key::Int(1000), b"late");
        let rest: Vec<Key> = keys.by_ref().map(|k| k.unwrap()).collect();
        assert_eq!(rest.len(), 249);
        assert!(!rest.contains(&Key::Int(1000)));

        keys.restart();
        assert_eq!(keys.count(), 250);
    }

    #[test]
    fn test_keys_reversed() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        for i in 0..250 {
            put(&index, Key::Int(i), b"v");
        }

        let mut keys = Keys::new(index.snapshot().unwrap()).reversed();
        assert_eq!(keys.next().unwrap().unwrap(), Key::Int(249));
        put(&index, Key::Int(1000), b"late");
        let rest: Vec<Key> = keys.by_ref().map(|k| k.unwrap()).collect();
        assert_eq!(rest.len(), 249);
        assert_eq!(rest.last(), Some(&Key::Int(0)));
        assert!(rest.windows(2).all(|w| matches!((&w[0], &w[1]), (Key::Int(a), Key::Int(b)) if a > b)));

        keys.restart();
        assert_eq!(keys.count(), 250);
    }

    #[test]
    fn test_tagged_matches_any_tag() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        for (name, tag) in [("a", "red"), ("b", "blue"), ("c", "green")] {
            let key = Key::from(name);
            index
                .write(|txn| {
                    txn.insert(&NewEntry {
                        key: &key,
                        now: now(),
                        expire_time: None,
                        tag: Some(tag),
                        size: 1,
                        mode: Mode::Raw,
                        filename: None,
                        value: Some(b"x"),
                    })
                })
                .unwrap();
        }

        let tags = vec!["red".to_string(), "green".to_string()];
        let rows = index.read(|conn| conn.tagged(&tags, 10)).unwrap();
        let keys: Vec<Key> = rows.into_iter().map(|row| row.key).collect();
        assert_eq!(keys, vec![Key::from("a"), Key::from("c")]);
        assert!(index.read(|conn| conn.tagged(&[], 10)).unwrap().is_empty());
    }

    #[test]
    fn test_update_settings_bumps_version() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        let before = index.read(|conn| conn.settings_version()).unwrap();

        let updated = index.update_settings(|s| s.statistics = true).unwrap();
        assert!(updated.statistics);
        assert_eq!(index.read(|conn| conn.settings_version()).unwrap(), before + 1);
        let stored = index.read(|conn| conn.stored_settings()).unwrap().unwrap();
        assert!(stored.statistics);

        // Reopening without settings leaves both untouched.
        let directory = Directory::open(dir.path()).unwrap();
        let (_, reloaded) = Index::open(&directory, None).unwrap();
        assert!(reloaded.statistics);
        assert_eq!(index.read(|conn| conn.settings_version()).unwrap(), before + 1);

        let rejected = index.update_settings(|s| s.cull_limit = 0);
        assert!(rejected.is_err());
        assert_eq!(index.read(|conn| conn.settings_version()).unwrap(), before + 1);
    }

    #[test]
    fn test_remove_rolls_back_when_blob_cannot_be_set_aside() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        let encoded = encode(Value::Bytes(vec![7; 64]), 0);
        let filename = index.directory().write_blob(&encoded).unwrap();
        let key = Key::from("big");
        index
            .write(|txn| {
                txn.insert(&NewEntry {
                    key: &key,
                    now: now(),
                    expire_time: None,
                    tag: None,
                    size: encoded.size(),
                    mode: encoded.mode,
                    filename: Some(filename.as_str()),
                    value: None,
                })
            })
            .unwrap();

        let tmp = dir.path().join("tmp");
        std::fs::remove_dir_all(&tmp).unwrap();
        std::fs::write(&tmp, b"not a directory").unwrap();

        let row = index.read(|conn| conn.entry(&key)).unwrap().unwrap();
        assert!(index.write(|txn| txn.remove(&row)).is_err());
        assert!(index.read(|conn| conn.entry(&key)).unwrap().is_some());
        assert_eq!(index.read(|conn| conn.metadata(MetadataKey::Count)).unwrap(), 1);
        assert!(index.directory().read_blob(&filename).unwrap().is_some());
    }
}
