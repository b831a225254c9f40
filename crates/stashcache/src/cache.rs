//! Cache: persistent key-value store over one storage directory

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use stashdb::{
    decode_inline, encode, now, Directory, EntryRow, Error, Index, IndexQueries, Key, Keys,
    MetadataKey, NewEntry, Placement, Result, Settings, Txn, Value,
};
use tracing::{debug, info, warn};

use crate::eviction::EvictionManager;
use crate::stats::Stats;

/// Rows removed per transaction by bulk sweeps
pub const SWEEP_BATCH: u32 = 100;

/// Blob files younger than this are never reported as orphans
pub const ORPHAN_GRACE: Duration = Duration::from_secs(60);

/// Options for a write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    /// Time to live; `None` never expires
    pub expire: Option<Duration>,
    /// Grouping label for tag-scoped eviction
    pub tag: Option<String>,
}

impl SetOptions {
    /// Expire the entry after `ttl`.
    pub fn expire(mut self, ttl: Duration) -> Self {
        self.expire = Some(ttl);
        self
    }

    /// Label the entry with `tag`.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Which rows a bulk sweep removes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sweep {
    /// Every row
    All,
    /// Rows whose deadline has passed
    Expired,
    /// Rows carrying any of the tags
    Tagged(Vec<String>),
}

/// Problem found by [`Cache::check`]
#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    /// Blob file no row refers to
    OrphanBlob {
        /// Path relative to the cache root
        filename: String,
    },
    /// Row referring to a blob file that does not exist
    DanglingRow {
        /// Key of the row
        key: Key,
        /// Missing file
        filename: String,
    },
    /// Leftover temporary file from an interrupted write
    StaleTemp {
        /// Path relative to the cache root
        filename: String,
    },
    /// Counter that no longer matches the rows
    MetadataDrift {
        /// Which counter
        field: MetadataKey,
        /// Stored value
        recorded: i64,
        /// Value computed from the rows
        actual: i64,
    },
}

/// Settings as last read from the index, with the version they were read at
struct CachedSettings {
    version: i64,
    settings: Settings,
}

struct Inner {
    directory: Directory,
    index: Index,
    settings: RwLock<CachedSettings>,
}

/// Disk-backed cache bound to one directory
///
/// Handles are cheap to clone. Any number of handles, threads and processes
/// may use the same directory at once; they coordinate through the index.
/// Settings changed through another handle take effect at this handle's next
/// write, except `retry` and `sqlite`, which stay as they were at open.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

impl Cache {
    /// Open a cache, reusing the settings stored in its directory
    ///
    /// # Arguments
    /// * `path` - Cache directory, created if missing
    ///
    /// # Returns
    /// * `Result<Cache>` - Cache handle
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_inner(path.as_ref(), None)
    }

    /// Open a cache and persist `settings` for every future handle
    pub fn open_with<P: AsRef<Path>>(path: P, settings: Settings) -> Result<Self> {
        Self::open_inner(path.as_ref(), Some(settings))
    }

    fn open_inner(path: &Path, settings: Option<Settings>) -> Result<Self> {
        let directory = Directory::open(path)?;
        let (index, settings) = Index::open(&directory, settings)?;
        info!(
            path = %path.display(),
            policy = ?settings.eviction_policy,
            size_limit = settings.size_limit,
            "cache opened"
        );
        Ok(Cache {
            inner: Arc::new(Inner {
                directory,
                index,
                // Unknown version: the first transaction reloads.
                settings: RwLock::new(CachedSettings {
                    version: -1,
                    settings,
                }),
            }),
        })
    }

    /// Root directory of the cache
    pub fn directory(&self) -> &Path {
        self.inner.directory.root()
    }

    /// Settings currently persisted for the directory
    pub fn settings(&self) -> Result<Settings> {
        self.inner.index.read(|conn| self.refresh_settings(conn))
    }

    /// Settings as of the transaction `conn` is in, reloaded only if they changed.
    fn refresh_settings(&self, conn: &Connection) -> Result<Settings> {
        let version = conn.settings_version()?;
        {
            let cached = self.inner.settings.read();
            if cached.version == version {
                return Ok(cached.settings.clone());
            }
        }
        let settings = conn.stored_settings()?.unwrap_or_default();
        debug!(version, "reloaded settings");
        let mut cached = self.inner.settings.write();
        if cached.version < version {
            *cached = CachedSettings {
                version,
                settings: settings.clone(),
            };
        }
        Ok(settings)
    }

    pub(crate) fn index(&self) -> &Index {
        &self.inner.index
    }

    /// Turn hit/miss counting on or off and persist the choice.
    pub fn set_statistics(&self, on: bool) -> Result<()> {
        self.inner.index.update_settings(|settings| settings.statistics = on)?;
        Ok(())
    }

    /// Store a value, replacing any existing entry for the key
    ///
    /// # Arguments
    /// * `key` - Lookup key
    /// * `value` - Value to store
    ///
    /// # Returns
    /// * `Result<bool>` - `true` once stored
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<bool> {
        self.store(key.into(), value.into(), &SetOptions::default(), false)
    }

    /// Store a value with an expiry and/or tag.
    pub fn set_with(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        options: &SetOptions,
    ) -> Result<bool> {
        self.store(key.into(), value.into(), options, false)
    }

    /// Store a serde value with the default serialization strategy.
    pub fn set_serde<T: Serialize + ?Sized>(
        &self,
        key: impl Into<Key>,
        value: &T,
        options: &SetOptions,
    ) -> Result<bool> {
        self.store(key.into(), Value::from_serde(value)?, options, false)
    }

    /// Store a value only if the key is absent or expired
    ///
    /// # Returns
    /// * `Result<bool>` - `false` if a live entry already existed
    pub fn add(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        options: &SetOptions,
    ) -> Result<bool> {
        self.store(key.into(), value.into(), options, true)
    }

    fn store(
        &self,
        key: Key,
        value: Value,
        options: &SetOptions,
        only_if_absent: bool,
    ) -> Result<bool> {
        // Placement uses the cached threshold; the write itself sees current settings.
        let threshold = self.inner.settings.read().settings.size_threshold;
        let encoded = encode(value, threshold);
        let filename = match encoded.placement {
            Placement::File => Some(self.inner.directory.write_blob(&encoded)?),
            Placement::Inline => None,
        };
        let inline = match encoded.placement {
            Placement::Inline => Some(encoded.payload.as_slice()),
            Placement::File => None,
        };

        let result = self.inner.index.write(|txn| {
            let settings = self.refresh_settings(txn)?;
            let now = now();
            let entry = NewEntry {
                key: &key,
                now,
                expire_time: options.expire.map(|ttl| now + ttl.as_secs_f64()),
                tag: options.tag.as_deref(),
                size: encoded.size(),
                mode: encoded.mode,
                filename: filename.as_deref(),
                value: inline,
            };
            match txn.entry(&key)? {
                Some(old) if only_if_absent && !old.is_expired(now) => return Ok(false),
                Some(old) => txn.replace(&old, &entry)?,
                None => {
                    txn.insert(&entry)?;
                }
            }
            EvictionManager::new(&settings).cull(txn, now)?;
            Ok(true)
        });

        if !matches!(result, Ok(true)) {
            if let Some(filename) = &filename {
                self.inner.directory.discard_blob(filename);
            }
        }
        result
    }

    /// Look up a value
    ///
    /// Missing and expired keys read as `None`. A hit updates the entry's
    /// access time and count. A row whose blob is gone was overwritten or
    /// removed since it was read; the row is read again with backoff.
    ///
    /// # Arguments
    /// * `key` - Lookup key
    ///
    /// # Returns
    /// * `Result<Option<Value>>` - Stored value, if live
    pub fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        let retry = self.inner.index.retry();
        let mut backoff = retry.backoff();

        loop {
            let now = now();
            let (row, statistics) = self
                .inner
                .index
                .read(|conn| Ok((conn.entry(&key)?, self.refresh_settings(conn)?.statistics)))?;
            let row = match row {
                Some(row) if !row.is_expired(now) => row,
                Some(expired) => {
                    self.drop_expired(&expired, statistics)?;
                    return Ok(None);
                }
                None => {
                    self.record_read(None, statistics)?;
                    return Ok(None);
                }
            };

            let rowid = row.rowid;
            match self.load_value(row)? {
                Some(value) => {
                    self.record_read(Some(rowid), statistics)?;
                    return Ok(Some(value));
                }
                None => {
                    let attempts = backoff.attempts() + 1;
                    if attempts >= retry.max_attempts.max(1) {
                        return Err(Error::Consistency(format!(
                            "blob for key {} missing after {} reads",
                            key, attempts
                        )));
                    }
                    let delay = backoff.next_delay();
                    debug!(%key, attempts, ?delay, "blob vanished under a concurrent write, re-reading");
                    thread::sleep(delay);
                }
            }
        }
    }

    /// Look up and decode a serde value.
    pub fn get_serde<T: DeserializeOwned>(&self, key: impl Into<Key>) -> Result<Option<T>> {
        self.get(key)?.map(|value| value.to_serde()).transpose()
    }

    /// Decode a row's payload; `None` if its blob file is gone.
    fn load_value(&self, row: EntryRow) -> Result<Option<Value>> {
        let EntryRow {
            mode,
            filename,
            value,
            ..
        } = row;
        match filename {
            Some(filename) => self.inner.directory.read_blob(&filename),
            None => decode_inline(mode, value.unwrap_or_default()).map(Some),
        }
    }

    /// Record a read in its own small transaction; contention only skips the update.
    fn record_read(&self, rowid: Option<i64>, statistics: bool) -> Result<()> {
        if rowid.is_none() && !statistics {
            return Ok(());
        }
        let result = self.inner.index.write(|txn| {
            if let Some(rowid) = rowid {
                txn.record_access(rowid, now())?;
            }
            if statistics {
                let counter = if rowid.is_some() {
                    MetadataKey::Hits
                } else {
                    MetadataKey::Misses
                };
                txn.add_metadata(counter, 1)?;
            }
            Ok(())
        });
        match result {
            Err(err) if err.is_busy() => {
                debug!(error = %err, "skipped access update");
                Ok(())
            }
            other => other,
        }
    }

    /// Physically remove a row a read found expired, if it is still that row.
    fn drop_expired(&self, expired: &EntryRow, statistics: bool) -> Result<()> {
        let result = self.inner.index.write(|txn| {
            let now = now();
            if let Some(current) = txn.entry(&expired.key)? {
                if current.rowid == expired.rowid && current.is_expired(now) {
                    txn.remove(&current)?;
                }
            }
            if statistics {
                txn.add_metadata(MetadataKey::Misses, 1)?;
            }
            Ok(())
        });
        match result {
            Err(err) if err.is_busy() => {
                debug!(error = %err, "left expired entry for a later sweep");
                Ok(())
            }
            other => other,
        }
    }

    /// Get and delete a value in one transaction
    ///
    /// # Returns
    /// * `Result<Option<Value>>` - The removed value, if it was live
    pub fn pop(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        let directory = &self.inner.directory;
        self.inner.index.write(|txn| {
            let row = match txn.entry(&key)? {
                Some(row) => row,
                None => return Ok(None),
            };
            let live = !row.is_expired(now());
            let value = if !live {
                None
            } else if let Some(filename) = &row.filename {
                let value = directory.read_blob(filename)?;
                if value.is_none() {
                    warn!(%key, %filename, "popped entry had no blob file");
                }
                value
            } else {
                Some(decode_inline(row.mode, row.value.clone().unwrap_or_default())?)
            };
            txn.remove(&row)?;
            Ok(value)
        })
    }

    /// Remove an entry
    ///
    /// # Returns
    /// * `Result<bool>` - `true` if a live entry was removed
    pub fn delete(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        self.inner.index.write(|txn| match txn.entry(&key)? {
            Some(row) => {
                txn.remove(&row)?;
                Ok(!row.is_expired(now()))
            }
            None => Ok(false),
        })
    }

    /// Change the expiry of a live entry
    ///
    /// # Arguments
    /// * `key` - Lookup key
    /// * `expire` - New time to live from now; `None` never expires
    ///
    /// # Returns
    /// * `Result<bool>` - `false` if the key was missing or expired
    pub fn touch(&self, key: impl Into<Key>, expire: Option<Duration>) -> Result<bool> {
        let key = key.into();
        self.inner.index.write(|txn| {
            let now = now();
            match txn.entry(&key)? {
                Some(row) if !row.is_expired(now) => {
                    txn.set_expire_time(row.rowid, expire.map(|ttl| now + ttl.as_secs_f64()))?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    /// Add `delta` to an integer value
    ///
    /// The read, the addition and the write happen in one transaction, so
    /// concurrent increments are never lost. The entry keeps its expiry and
    /// tag. A missing or expired key starts from `default`.
    ///
    /// # Arguments
    /// * `key` - Lookup key
    /// * `delta` - Amount to add, may be negative
    /// * `default` - Starting value for a missing key; `None` leaves it missing
    ///
    /// # Returns
    /// * `Result<Option<i64>>` - The new value, or `None` if the key was missing and there was no default
    pub fn incr(
        &self,
        key: impl Into<Key>,
        delta: i64,
        default: Option<i64>,
    ) -> Result<Option<i64>> {
        let key = key.into();
        let directory = &self.inner.directory;
        self.inner.index.write(|txn| {
            let settings = self.refresh_settings(txn)?;
            let now = now();
            let existing = txn.entry(&key)?;
            let live = existing.as_ref().filter(|row| !row.is_expired(now));

            let current = match live {
                Some(row) => {
                    let value = match &row.filename {
                        Some(filename) => directory.read_blob(filename)?.ok_or_else(|| {
                            Error::Consistency(format!("blob for key {} is missing", key))
                        })?,
                        None => decode_inline(row.mode, row.value.clone().unwrap_or_default())?,
                    };
                    counter_value(&key, &value)?
                }
                None => match default {
                    Some(default) => default,
                    None => return Ok(None),
                },
            };
            let next = current
                .checked_add(delta)
                .ok_or_else(|| Error::Serialization(format!("counter {} overflows", key)))?;

            // Counters always stay inline.
            let encoded = encode(Value::from_serde(&next)?, u64::MAX);
            let entry = NewEntry {
                key: &key,
                now,
                expire_time: live.and_then(|row| row.expire_time),
                tag: live.and_then(|row| row.tag.as_deref()),
                size: encoded.size(),
                mode: encoded.mode,
                filename: None,
                value: Some(encoded.payload.as_slice()),
            };
            match &existing {
                Some(old) => txn.replace(old, &entry)?,
                None => {
                    txn.insert(&entry)?;
                }
            }
            EvictionManager::new(&settings).cull(txn, now)?;
            Ok(Some(next))
        })
    }

    /// Subtract `delta` from an integer value; see [`Cache::incr`].
    pub fn decr(
        &self,
        key: impl Into<Key>,
        delta: i64,
        default: Option<i64>,
    ) -> Result<Option<i64>> {
        self.incr(key, delta.saturating_neg(), default)
    }

    /// True if the key has a live entry. Does not count as an access.
    pub fn contains(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        let now = now();
        self.inner
            .index
            .read(|conn| Ok(conn.entry(&key)?.map_or(false, |row| !row.is_expired(now))))
    }

    /// Number of rows, including expired rows not yet swept.
    pub fn len(&self) -> Result<u64> {
        Ok(self.stats()?.count)
    }

    /// True if the cache holds no rows.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Bytes of payload tracked by the index.
    pub fn volume(&self) -> Result<u64> {
        Ok(self.stats()?.size)
    }

    /// Size, count, hits and misses
    pub fn stats(&self) -> Result<Stats> {
        self.inner.index.read(|conn| Stats::load(conn))
    }

    /// Zero the hit and miss counters, returning the values they had.
    pub fn reset_stats(&self) -> Result<Stats> {
        self.inner.index.write(|txn| {
            let stats = Stats::load(txn)?;
            txn.set_metadata(MetadataKey::Hits, 0)?;
            txn.set_metadata(MetadataKey::Misses, 0)?;
            Ok(stats)
        })
    }

    /// Iterate live keys as of now, in insertion order
    ///
    /// The iterator holds a read snapshot: later writes are not visible and
    /// `Keys::restart` replays the same keys.
    pub fn keys(&self) -> Result<Keys> {
        Ok(Keys::new(self.inner.index.snapshot()?))
    }

    /// Iterate live keys newest first.
    pub fn keys_reversed(&self) -> Result<Keys> {
        Ok(self.keys()?.reversed())
    }

    /// Iterate live keys carrying `tag`.
    pub fn filter(&self, tag: impl Into<String>) -> Result<Keys> {
        Ok(Keys::with_tag(self.inner.index.snapshot()?, Some(tag.into())))
    }

    /// Remove every entry
    ///
    /// # Returns
    /// * `Result<usize>` - Rows removed
    pub fn clear(&self) -> Result<usize> {
        self.sweep(&Sweep::All)
    }

    /// Physically remove every expired row.
    pub fn expire(&self) -> Result<usize> {
        self.sweep(&Sweep::Expired)
    }

    /// Remove every entry carrying `tag`.
    pub fn evict(&self, tag: impl Into<String>) -> Result<usize> {
        self.evict_tags([tag])
    }

    /// Remove every entry carrying any of `tags`.
    pub fn evict_tags<I, T>(&self, tags: I) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        if tags.is_empty() {
            return Ok(0);
        }
        self.sweep(&Sweep::Tagged(tags))
    }

    /// Remove expired rows, then evict down to the size limit.
    pub fn cull(&self) -> Result<usize> {
        let expired = self.expire()?;
        let evicted = self.inner.index.write(|txn| {
            let settings = self.refresh_settings(txn)?;
            EvictionManager::new(&settings).enforce(txn)
        })?;
        Ok(expired + evicted)
    }

    fn sweep(&self, sweep: &Sweep) -> Result<usize> {
        let mut total = 0;
        loop {
            let removed = self.sweep_batch(sweep)?;
            total += removed;
            if removed < SWEEP_BATCH as usize {
                break;
            }
        }
        debug!(?sweep, removed = total, "sweep finished");
        Ok(total)
    }

    /// Run one bounded transaction of a bulk sweep
    ///
    /// # Returns
    /// * `Result<usize>` - Rows removed; fewer than [`SWEEP_BATCH`] means the sweep is done
    pub fn sweep_batch(&self, sweep: &Sweep) -> Result<usize> {
        self.inner.index.write(|txn| {
            let rows = match sweep {
                Sweep::All => txn.any_rows(SWEEP_BATCH)?,
                Sweep::Expired => txn.expired(now(), SWEEP_BATCH)?,
                Sweep::Tagged(tags) => txn.tagged(tags, SWEEP_BATCH)?,
            };
            for row in &rows {
                txn.remove(row)?;
            }
            Ok(rows.len())
        })
    }

    /// Reconcile the index with the blob tree
    ///
    /// The index is the source of truth: orphan blobs and stale temp files are
    /// deleted, rows whose blob is missing are dropped and drifted counters
    /// are recomputed, but only when `fix` is set.
    ///
    /// # Returns
    /// * `Result<Vec<Anomaly>>` - Every problem found
    pub fn check(&self, fix: bool) -> Result<Vec<Anomaly>> {
        self.check_with(fix, ORPHAN_GRACE)
    }

    /// [`Cache::check`] with an explicit grace period for young files
    ///
    /// The blob tree is walked without holding the write lock. Every candidate
    /// is confirmed again inside the write transaction before it is reported,
    /// so concurrent writes are neither blocked by the walk nor misreported.
    pub fn check_with(&self, fix: bool, grace: Duration) -> Result<Vec<Anomaly>> {
        let candidates = self.scan_candidates(grace)?;
        let anomalies = self.confirm_anomalies(&candidates, fix)?;
        for anomaly in &anomalies {
            warn!(?anomaly, fixed = fix, path = %self.directory().display(), "consistency anomaly");
        }
        Ok(anomalies)
    }

    /// Walk the blob tree against a read snapshot of the referenced files.
    fn scan_candidates(&self, grace: Duration) -> Result<Candidates> {
        let directory = &self.inner.directory;
        let cutoff = SystemTime::now().checked_sub(grace);
        let is_old = |modified: SystemTime| cutoff.map_or(false, |c| modified <= c);

        let blobs = directory.scan_blobs()?;
        let temps = directory.scan_temp()?;
        let referenced = self.inner.index.read(|conn| conn.referenced_files())?;
        let known: HashSet<&str> = referenced.iter().map(|(_, f)| f.as_str()).collect();

        let orphans = blobs
            .into_iter()
            .filter(|blob| !known.contains(blob.filename.as_str()) && is_old(blob.modified))
            .map(|blob| blob.filename)
            .collect();
        let stale = temps
            .into_iter()
            .filter(|temp| is_old(temp.modified))
            .map(|temp| temp.filename)
            .collect();
        let mut dangling = Vec::new();
        for (key, filename) in &referenced {
            if !directory.blob_path(filename)?.exists() {
                dangling.push((key.clone(), filename.clone()));
            }
        }
        Ok(Candidates {
            orphans,
            stale,
            dangling,
        })
    }

    /// Keep the candidates that still hold under the write lock, then repair.
    fn confirm_anomalies(&self, candidates: &Candidates, fix: bool) -> Result<Vec<Anomaly>> {
        let directory = &self.inner.directory;
        self.inner.index.write(|txn| {
            let mut anomalies = Vec::new();
            for filename in &candidates.orphans {
                if !txn.references_file(filename)? && directory.blob_path(filename)?.exists() {
                    anomalies.push(Anomaly::OrphanBlob {
                        filename: filename.clone(),
                    });
                }
            }
            for filename in &candidates.stale {
                if directory.blob_path(filename)?.exists() {
                    anomalies.push(Anomaly::StaleTemp {
                        filename: filename.clone(),
                    });
                }
            }
            for (key, filename) in &candidates.dangling {
                let still_refers = txn
                    .entry(key)?
                    .map_or(false, |row| row.filename.as_deref() == Some(filename.as_str()));
                if still_refers && !directory.blob_path(filename)?.exists() {
                    anomalies.push(Anomaly::DanglingRow {
                        key: key.clone(),
                        filename: filename.clone(),
                    });
                }
            }

            if fix {
                repair(txn, &anomalies)?;
            }

            let (count, size) = txn.recount()?;
            for (field, actual) in [(MetadataKey::Count, count), (MetadataKey::Size, size)] {
                let recorded = txn.metadata(field)?;
                if recorded != actual {
                    anomalies.push(Anomaly::MetadataDrift {
                        field,
                        recorded,
                        actual,
                    });
                    if fix {
                        txn.set_metadata(field, actual)?;
                    }
                }
            }
            Ok(anomalies)
        })
    }
}

/// Files and rows that looked wrong when the blob tree was walked
#[derive(Debug, Default)]
struct Candidates {
    orphans: Vec<String>,
    stale: Vec<String>,
    dangling: Vec<(Key, String)>,
}

/// Integer held by a counter entry.
fn counter_value(key: &Key, value: &Value) -> Result<i64> {
    match value {
        Value::Data(_) => value.to_serde(),
        _ => Err(Error::Serialization(format!(
            "value for key {} is not a counter",
            key
        ))),
    }
}

fn repair(txn: &mut Txn<'_>, anomalies: &[Anomaly]) -> Result<()> {
    for anomaly in anomalies {
        match anomaly {
            Anomaly::OrphanBlob { filename } | Anomaly::StaleTemp { filename } => {
                txn.remove_file_on_commit(filename.clone());
            }
            Anomaly::DanglingRow { key, .. } => {
                if let Some(row) = txn.entry(key)? {
                    txn.remove(&row)?;
                }
            }
            Anomaly::MetadataDrift { .. } => {}
        }
    }
    Ok(())
}
