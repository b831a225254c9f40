//! FanoutCache: one logical cache sharded over N independent caches
//!
//! Each shard has its own directory and index, so writers to different
//! shards never contend. Keys route by `xxh3(key) mod N`, which is stable
//! across restarts for a fixed N. Capacity is enforced per shard with
//! `size_limit / N` each, so the global bound is approximate.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use stashdb::{Error, Key, Keys, Result, Settings, Value, INDEX_FILE};
use tracing::{info, warn};

use crate::cache::{Anomaly, Cache, SetOptions, Sweep};
use crate::stats::Stats;
use crate::sync::{Lock, LockOptions, Semaphore};

/// Shard count used by [`FanoutCache::open`]
pub const DEFAULT_SHARDS: usize = 8;

/// Cache sharded by key hash
#[derive(Clone)]
pub struct FanoutCache {
    root: PathBuf,
    shards: Arc<[Cache]>,
}

impl FanoutCache {
    /// Open a fanout cache, reusing each shard's stored settings
    ///
    /// Shards created by this call get the default settings with the size
    /// limit divided across `shard_count`.
    ///
    /// # Arguments
    /// * `path` - Root directory; shards live in `000`, `001`, ...
    /// * `shard_count` - Number of shards, at least 1
    ///
    /// # Returns
    /// * `Result<FanoutCache>` - Fanout handle
    pub fn open<P: AsRef<Path>>(path: P, shard_count: usize) -> Result<Self> {
        Self::open_inner(path.as_ref(), shard_count, None)
    }

    /// Open a fanout cache and persist `settings` on every shard
    ///
    /// `settings.size_limit` is the global limit; each shard gets an equal share.
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        shard_count: usize,
        settings: Settings,
    ) -> Result<Self> {
        Self::open_inner(path.as_ref(), shard_count, Some(settings))
    }

    fn open_inner(root: &Path, shard_count: usize, settings: Option<Settings>) -> Result<Self> {
        if shard_count == 0 {
            return Err(Error::Config("shard_count must be at least 1".to_string()));
        }
        fs::create_dir_all(root)?;

        let existing = existing_shards(root)?;
        if existing > 0 && existing != shard_count {
            warn!(
                path = %root.display(),
                existing,
                requested = shard_count,
                "shard count differs from the directory; keys will route to different shards"
            );
        }

        let per_shard = |settings: Settings| {
            let limit = settings.size_limit / shard_count as u64;
            settings.with_size_limit(limit)
        };

        let mut shards = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let dir = shard_dir(root, index);
            let shard = match &settings {
                Some(settings) => Cache::open_with(&dir, per_shard(settings.clone()))?,
                None if dir.join(INDEX_FILE).exists() => Cache::open(&dir)?,
                None => Cache::open_with(&dir, per_shard(Settings::default()))?,
            };
            shards.push(shard);
        }

        info!(path = %root.display(), shards = shard_count, "fanout cache opened");
        Ok(FanoutCache {
            root: root.to_path_buf(),
            shards: shards.into(),
        })
    }

    /// Root directory
    pub fn directory(&self) -> &Path {
        &self.root
    }

    /// The shards, in routing order
    pub fn shards(&self) -> &[Cache] {
        &self.shards
    }

    /// Index of the shard `key` routes to.
    pub fn shard_index(&self, key: &Key) -> usize {
        (key.stable_hash() % self.shards.len() as u64) as usize
    }

    fn shard(&self, key: &Key) -> &Cache {
        &self.shards[self.shard_index(key)]
    }

    /// Store a value in the key's shard.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<bool> {
        let key = key.into();
        self.shard(&key).set(key, value)
    }

    /// Store a value with an expiry and/or tag.
    pub fn set_with(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        options: &SetOptions,
    ) -> Result<bool> {
        let key = key.into();
        self.shard(&key).set_with(key, value, options)
    }

    /// Store a serde value.
    pub fn set_serde<T: Serialize + ?Sized>(
        &self,
        key: impl Into<Key>,
        value: &T,
        options: &SetOptions,
    ) -> Result<bool> {
        let key = key.into();
        self.shard(&key).set_serde(key, value, options)
    }

    /// Store only if absent or expired.
    pub fn add(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        options: &SetOptions,
    ) -> Result<bool> {
        let key = key.into();
        self.shard(&key).add(key, value, options)
    }

    /// Look up a value.
    pub fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        self.shard(&key).get(key)
    }

    /// Look up and decode a serde value.
    pub fn get_serde<T: DeserializeOwned>(&self, key: impl Into<Key>) -> Result<Option<T>> {
        let key = key.into();
        self.shard(&key).get_serde(key)
    }

    /// Get and delete a value.
    pub fn pop(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        self.shard(&key).pop(key)
    }

    /// Remove an entry.
    pub fn delete(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        self.shard(&key).delete(key)
    }

    /// Change an entry's expiry.
    pub fn touch(&self, key: impl Into<Key>, expire: Option<Duration>) -> Result<bool> {
        let key = key.into();
        self.shard(&key).touch(key, expire)
    }

    /// Add `delta` to an integer value in the key's shard.
    pub fn incr(
        &self,
        key: impl Into<Key>,
        delta: i64,
        default: Option<i64>,
    ) -> Result<Option<i64>> {
        let key = key.into();
        self.shard(&key).incr(key, delta, default)
    }

    /// Subtract `delta` from an integer value in the key's shard.
    pub fn decr(
        &self,
        key: impl Into<Key>,
        delta: i64,
        default: Option<i64>,
    ) -> Result<Option<i64>> {
        let key = key.into();
        self.shard(&key).decr(key, delta, default)
    }

    /// True if the key has a live entry.
    pub fn contains(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        self.shard(&key).contains(key)
    }

    /// Rows across all shards.
    pub fn len(&self) -> Result<u64> {
        Ok(self.stats()?.count)
    }

    /// True if no shard holds a row.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Payload bytes across all shards.
    pub fn volume(&self) -> Result<u64> {
        Ok(self.stats()?.size)
    }

    /// Counters summed over all shards
    pub fn stats(&self) -> Result<Stats> {
        self.shards.iter().map(Cache::stats).sum()
    }

    /// Zero hit and miss counters on every shard, returning the previous totals.
    pub fn reset_stats(&self) -> Result<Stats> {
        self.shards.iter().map(Cache::reset_stats).sum()
    }

    /// Turn hit/miss counting on or off on every shard.
    pub fn set_statistics(&self, on: bool) -> Result<()> {
        self.shards.iter().try_for_each(|shard| shard.set_statistics(on))
    }

    /// Remove every entry from every shard.
    pub fn clear(&self) -> Result<usize> {
        self.shards.iter().map(Cache::clear).sum()
    }

    /// Remove expired rows from every shard.
    pub fn expire(&self) -> Result<usize> {
        self.shards.iter().map(Cache::expire).sum()
    }

    /// Remove expired rows and evict every shard down to its limit.
    pub fn cull(&self) -> Result<usize> {
        self.shards.iter().map(Cache::cull).sum()
    }

    /// Remove entries carrying `tag` from every shard.
    pub fn evict(&self, tag: impl Into<String>) -> Result<usize> {
        self.evict_tags([tag])
    }

    /// Remove entries carrying any of `tags` from every shard.
    pub fn evict_tags<I, T>(&self, tags: I) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        self.shards
            .iter()
            .map(|shard| shard.evict_tags(tags.iter().cloned()))
            .sum()
    }

    /// One batch of a sweep on every shard.
    pub fn sweep_batch(&self, sweep: &Sweep) -> Result<usize> {
        self.shards.iter().map(|shard| shard.sweep_batch(sweep)).sum()
    }

    /// Consistency sweep of every shard.
    pub fn check(&self, fix: bool) -> Result<Vec<Anomaly>> {
        let mut anomalies = Vec::new();
        for shard in self.shards.iter() {
            anomalies.extend(shard.check(fix)?);
        }
        Ok(anomalies)
    }

    /// Keys of every shard, shard by shard
    ///
    /// All shard snapshots are taken up front.
    pub fn keys(&self) -> Result<FanoutKeys> {
        let parts = self.shards.iter().map(Cache::keys).collect::<Result<Vec<_>>>()?;
        Ok(FanoutKeys::new(parts))
    }

    /// Keys of every shard newest first, starting from the last shard.
    pub fn keys_reversed(&self) -> Result<FanoutKeys> {
        let parts = self
            .shards
            .iter()
            .rev()
            .map(Cache::keys_reversed)
            .collect::<Result<Vec<_>>>()?;
        Ok(FanoutKeys::new(parts))
    }

    /// Keys carrying `tag` across every shard.
    pub fn filter(&self, tag: impl Into<String>) -> Result<FanoutKeys> {
        let tag = tag.into();
        let parts = self
            .shards
            .iter()
            .map(|shard| shard.filter(tag.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(FanoutKeys::new(parts))
    }

    fn name_shard(&self, name: &str) -> &Cache {
        self.shard(&Key::from(name))
    }

    /// Lock stored in the shard its name routes to.
    pub fn lock(&self, name: impl Into<String>, options: LockOptions) -> Lock {
        let name = name.into();
        Lock::with_options(self.name_shard(&name), name, options)
    }

    /// Semaphore stored in the shard its name routes to.
    pub fn semaphore(&self, name: impl Into<String>, max: u32) -> Semaphore {
        let name = name.into();
        Semaphore::new(self.name_shard(&name), name, max)
    }
}

fn shard_dir(root: &Path, index: usize) -> PathBuf {
    root.join(format!("{:03}", index))
}

fn existing_shards(root: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let is_shard = name
            .to_str()
            .map_or(false, |n| n.len() == 3 && n.bytes().all(|b| b.is_ascii_digit()));
        if is_shard && entry.path().join(INDEX_FILE).exists() {
            count += 1;
        }
    }
    Ok(count)
}

/// Keys iterator chaining every shard's snapshot
pub struct FanoutKeys {
    parts: Vec<Keys>,
    current: usize,
}

impl FanoutKeys {
    fn new(parts: Vec<Keys>) -> Self {
        FanoutKeys { parts, current: 0 }
    }

    /// Start again from the first shard, within the same snapshots.
    pub fn restart(&mut self) {
        for part in &mut self.parts {
            part.restart();
        }
        self.current = 0;
    }
}

impl Iterator for FanoutKeys {
    type Item = Result<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let part = self.parts.get_mut(self.current)?;
            match part.next() {
                Some(item) => return Some(item),
                None => self.current += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use stashdb::EvictionPolicy;
    use tempfile::TempDir;

    #[test]
    fn test_fanout_basic() {
        let dir = TempDir::new().unwrap();
        let cache = FanoutCache::open(dir.path(), 4).unwrap();

        for i in 0..40 {
            cache.set(i, format!("value-{}", i)).unwrap();
        }
        for i in 0..40 {
            assert_eq!(cache.get(i).unwrap(), Some(Value::from(format!("value-{}", i))));
        }
        assert_eq!(cache.len().unwrap(), 40);

        // Every key lives in exactly the shard it routes to.
        for i in 0..40 {
            let key = Key::Int(i);
            let home = cache.shard_index(&key);
            for (index, shard) in cache.shards().iter().enumerate() {
                assert_eq!(shard.contains(key.clone()).unwrap(), index == home);
            }
        }
    }

    #[test]
    fn test_shard_layout_and_limits() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::default().with_size_limit(4000);
        let cache = FanoutCache::open_with(dir.path(), 4, settings).unwrap();

        for index in 0..4 {
            assert!(dir.path().join(format!("{:03}", index)).join(INDEX_FILE).exists());
        }
        for shard in cache.shards() {
            assert_eq!(shard.settings().unwrap().size_limit, 1000);
        }

        // Reopening without settings keeps the per-shard limits.
        let reopened = FanoutCache::open(dir.path(), 4).unwrap();
        assert_eq!(reopened.shards()[0].settings().unwrap().size_limit, 1000);
    }

    #[test]
    fn test_capacity_is_per_shard() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::default()
            .with_size_limit(2000)
            .with_size_threshold(100)
            .with_eviction_policy(EvictionPolicy::LeastRecentlyUsed);
        let cache = FanoutCache::open_with(dir.path(), 2, settings).unwrap();

        for i in 0..100 {
            cache.set(i, vec![0u8; 100]).unwrap();
        }
        for shard in cache.shards() {
            assert!(shard.volume().unwrap() <= 1000);
        }
        assert!(cache.volume().unwrap() <= 2000);
    }

    #[test]
    fn test_fanout_sweeps() {
        let dir = TempDir::new().unwrap();
        let cache = FanoutCache::open(dir.path(), 3).unwrap();
        let tagged = SetOptions::default().tag("t");

        for i in 0..30 {
            if i % 2 == 0 {
                cache.set_with(i, "v", &tagged).unwrap();
            } else {
                cache.set(i, "v").unwrap();
            }
        }

        assert_eq!(cache.filter("t").unwrap().count(), 15);
        assert_eq!(cache.evict("t").unwrap(), 15);

        let mut keys = cache.keys().unwrap();
        assert_eq!(keys.by_ref().count(), 15);
        keys.restart();
        assert_eq!(keys.count(), 15);

        assert_eq!(cache.clear().unwrap(), 15);
        assert!(cache.is_empty().unwrap());
        assert!(cache.check(false).unwrap().is_empty());
    }

    #[test]
    fn test_fanout_stats_sum() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::default().with_statistics(true);
        let cache = FanoutCache::open_with(dir.path(), 4, settings).unwrap();

        cache.set("a", "12345").unwrap();
        cache.set("b", "123").unwrap();
        cache.get("a").unwrap();
        cache.get("missing").unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.size, 8);
        assert_eq!(stats.count, 2);
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_fanout_lock_routing() {
        let dir = TempDir::new().unwrap();
        let cache = FanoutCache::open(dir.path(), 4).unwrap();

        let guard = cache.lock("job", LockOptions::default()).try_acquire().unwrap().unwrap();
        assert!(cache.lock("job", LockOptions::default()).locked().unwrap());
        guard.release().unwrap();

        let semaphore = cache.semaphore("pool", 3);
        assert_eq!(semaphore.available().unwrap(), 3);
    }

    #[test]
    fn test_fanout_counters() {
        let dir = TempDir::new().unwrap();
        let cache = FanoutCache::open(dir.path(), 4).unwrap();

        for i in 0..10 {
            assert_eq!(cache.incr(i, 1, Some(i)).unwrap(), Some(i + 1));
        }
        assert_eq!(cache.decr(3, 4, None).unwrap(), Some(0));
        assert_eq!(cache.incr("absent", 1, None).unwrap(), None);

        let key = Key::Int(3);
        let home = cache.shard_index(&key);
        assert_eq!(cache.shards()[home].get_serde::<i64>(key).unwrap(), Some(0));
    }

    #[test]
    fn test_fanout_keys_reversed() {
        let dir = TempDir::new().unwrap();
        let cache = FanoutCache::open(dir.path(), 3).unwrap();
        for i in 0..30 {
            cache.set(i, "v").unwrap();
        }

        let forward: Vec<Key> = cache.keys().unwrap().map(|k| k.unwrap()).collect();
        let mut backward: Vec<Key> = cache.keys_reversed().unwrap().map(|k| k.unwrap()).collect();
        backward.reverse();
        assert_eq!(forward, backward);

        // The last shard comes first.
        let last = cache.shards()[2].keys_reversed().unwrap().next().unwrap().unwrap();
        assert_eq!(cache.keys_reversed().unwrap().next().unwrap().unwrap(), last);
    }

    #[test]
    fn test_fanout_evict_tags() {
        let dir = TempDir::new().unwrap();
        let cache = FanoutCache::open(dir.path(), 3).unwrap();
        let tags = ["red", "green", "blue"];
        for i in 0..30 {
            cache
                .set_with(i, "v", &SetOptions::default().tag(tags[i as usize % 3]))
                .unwrap();
        }

        assert_eq!(cache.evict_tags(["red", "blue"]).unwrap(), 20);
        assert_eq!(cache.len().unwrap(), 10);
        assert_eq!(cache.filter("green").unwrap().count(), 10);
    }

    #[test]
    fn test_zero_shards_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(FanoutCache::open(dir.path(), 0), Err(Error::Config(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_routing_is_deterministic(keys in proptest::collection::vec(any::<i64>(), 1..20)) {
            let dir = TempDir::new().unwrap();
            let first = FanoutCache::open(dir.path(), 5).unwrap();
            let routes: Vec<usize> = keys.iter().map(|k| first.shard_index(&Key::Int(*k))).collect();
            drop(first);

            let again = FanoutCache::open(dir.path(), 5).unwrap();
            for (k, route) in keys.iter().zip(routes) {
                prop_assert_eq!(again.shard_index(&Key::Int(*k)), route);
                prop_assert!(route < 5);
            }
        }
    }
}
