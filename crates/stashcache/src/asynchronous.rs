//! Cooperative (tokio) call surface
//!
//! The cache core is blocking: every operation may wait on the index's
//! write lock. [`AsyncCache`] runs each call on tokio's blocking pool so the
//! event loop keeps running, and splits bulk sweeps into one task per batch
//! so they can be cancelled between batches.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use stashdb::{Error, Key, Result, Value};
use tokio::task::{self, JoinError};

use crate::cache::{Anomaly, Cache, SetOptions, Sweep};
use crate::fanout::{FanoutCache, FanoutKeys};
use crate::stats::Stats;

/// Keys fetched per blocking call by [`AsyncKeys`]
const ASYNC_PAGE_SIZE: usize = 100;

pub(crate) fn join_error(err: JoinError) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, err))
}

/// Operations shared by [`Cache`] and [`FanoutCache`]
pub trait CacheStore: Clone + Send + Sync + 'static {
    /// Iterator returned by [`CacheStore::keys`]
    type Keys: Iterator<Item = Result<Key>> + Send + 'static;

    /// Look up a value.
    fn get(&self, key: &Key) -> Result<Option<Value>>;
    /// Store a value.
    fn set(&self, key: Key, value: Value, options: &SetOptions) -> Result<bool>;
    /// Store only if absent or expired.
    fn add(&self, key: Key, value: Value, options: &SetOptions) -> Result<bool>;
    /// Remove an entry.
    fn delete(&self, key: &Key) -> Result<bool>;
    /// Change an entry's expiry.
    fn touch(&self, key: &Key, expire: Option<Duration>) -> Result<bool>;
    /// Get and delete a value.
    fn pop(&self, key: &Key) -> Result<Option<Value>>;
    /// True if the key has a live entry.
    fn contains(&self, key: &Key) -> Result<bool>;
    /// Add `delta` to an integer value, starting missing keys from `default`.
    fn incr(&self, key: Key, delta: i64, default: Option<i64>) -> Result<Option<i64>>;
    /// Snapshot iterator over live keys.
    fn keys(&self) -> Result<Self::Keys>;
    /// Snapshot iterator over live keys, newest first.
    fn keys_reversed(&self) -> Result<Self::Keys>;
    /// Snapshot iterator over live keys carrying `tag`.
    fn filter(&self, tag: &str) -> Result<Self::Keys>;
    /// One bounded batch of a bulk sweep; returns rows removed.
    fn sweep_batch(&self, sweep: &Sweep) -> Result<usize>;
    /// Remove expired rows and evict to the size limit.
    fn cull(&self) -> Result<usize>;
    /// Consistency sweep.
    fn check(&self, fix: bool) -> Result<Vec<Anomaly>>;
    /// Counters.
    fn stats(&self) -> Result<Stats>;
}

impl CacheStore for Cache {
    type Keys = stashdb::Keys;

    fn get(&self, key: &Key) -> Result<Option<Value>> {
        Cache::get(self, key)
    }

    fn set(&self, key: Key, value: Value, options: &SetOptions) -> Result<bool> {
        Cache::set_with(self, key, value, options)
    }

    fn add(&self, key: Key, value: Value, options: &SetOptions) -> Result<bool> {
        Cache::add(self, key, value, options)
    }

    fn delete(&self, key: &Key) -> Result<bool> {
        Cache::delete(self, key)
    }

    fn touch(&self, key: &Key, expire: Option<Duration>) -> Result<bool> {
        Cache::touch(self, key, expire)
    }

    fn pop(&self, key: &Key) -> Result<Option<Value>> {
        Cache::pop(self, key)
    }

    fn contains(&self, key: &Key) -> Result<bool> {
        Cache::contains(self, key)
    }

    fn incr(&self, key: Key, delta: i64, default: Option<i64>) -> Result<Option<i64>> {
        Cache::incr(self, key, delta, default)
    }

    fn keys(&self) -> Result<Self::Keys> {
        Cache::keys(self)
    }

    fn keys_reversed(&self) -> Result<Self::Keys> {
        Cache::keys_reversed(self)
    }

    fn filter(&self, tag: &str) -> Result<Self::Keys> {
        Cache::filter(self, tag)
    }

    fn sweep_batch(&self, sweep: &Sweep) -> Result<usize> {
        Cache::sweep_batch(self, sweep)
    }

    fn cull(&self) -> Result<usize> {
        Cache::cull(self)
    }

    fn check(&self, fix: bool) -> Result<Vec<Anomaly>> {
        Cache::check(self, fix)
    }

    fn stats(&self) -> Result<Stats> {
        Cache::stats(self)
    }
}

impl CacheStore for FanoutCache {
    type Keys = FanoutKeys;

    fn get(&self, key: &Key) -> Result<Option<Value>> {
        FanoutCache::get(self, key)
    }

    fn set(&self, key: Key, value: Value, options: &SetOptions) -> Result<bool> {
        FanoutCache::set_with(self, key, value, options)
    }

    fn add(&self, key: Key, value: Value, options: &SetOptions) -> Result<bool> {
        FanoutCache::add(self, key, value, options)
    }

    fn delete(&self, key: &Key) -> Result<bool> {
        FanoutCache::delete(self, key)
    }

    fn touch(&self, key: &Key, expire: Option<Duration>) -> Result<bool> {
        FanoutCache::touch(self, key, expire)
    }

    fn pop(&self, key: &Key) -> Result<Option<Value>> {
        FanoutCache::pop(self, key)
    }

    fn contains(&self, key: &Key) -> Result<bool> {
        FanoutCache::contains(self, key)
    }

    fn incr(&self, key: Key, delta: i64, default: Option<i64>) -> Result<Option<i64>> {
        FanoutCache::incr(self, key, delta, default)
    }

    fn keys(&self) -> Result<Self::Keys> {
        FanoutCache::keys(self)
    }

    fn keys_reversed(&self) -> Result<Self::Keys> {
        FanoutCache::keys_reversed(self)
    }

    fn filter(&self, tag: &str) -> Result<Self::Keys> {
        FanoutCache::filter(self, tag)
    }

    fn sweep_batch(&self, sweep: &Sweep) -> Result<usize> {
        FanoutCache::sweep_batch(self, sweep)
    }

    fn cull(&self) -> Result<usize> {
        FanoutCache::cull(self)
    }

    fn check(&self, fix: bool) -> Result<Vec<Anomaly>> {
        FanoutCache::check(self, fix)
    }

    fn stats(&self) -> Result<Stats> {
        FanoutCache::stats(self)
    }
}

/// Async adapter over any [`CacheStore`]
#[derive(Clone)]
pub struct AsyncCache<S> {
    store: S,
}

impl<S: CacheStore> AsyncCache<S> {
    /// Wrap a blocking store
    pub fn new(store: S) -> Self {
        AsyncCache { store }
    }

    /// The wrapped blocking store
    pub fn blocking(&self) -> &S {
        &self.store
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        task::spawn_blocking(move || f(&store))
            .await
            .map_err(join_error)?
    }

    /// Look up a value.
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        self.run(move |store| store.get(&key)).await
    }

    /// Store a value.
    pub async fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<bool> {
        self.set_with(key, value, SetOptions::default()).await
    }

    /// Store a value with an expiry and/or tag.
    pub async fn set_with(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        options: SetOptions,
    ) -> Result<bool> {
        let (key, value) = (key.into(), value.into());
        self.run(move |store| store.set(key, value, &options)).await
    }

    /// Store only if absent or expired.
    pub async fn add(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        options: SetOptions,
    ) -> Result<bool> {
        let (key, value) = (key.into(), value.into());
        self.run(move |store| store.add(key, value, &options)).await
    }

    /// Remove an entry.
    pub async fn delete(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        self.run(move |store| store.delete(&key)).await
    }

    /// Change an entry's expiry.
    pub async fn touch(&self, key: impl Into<Key>, expire: Option<Duration>) -> Result<bool> {
        let key = key.into();
        self.run(move |store| store.touch(&key, expire)).await
    }

    /// Get and delete a value.
    pub async fn pop(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        self.run(move |store| store.pop(&key)).await
    }

    /// True if the key has a live entry.
    pub async fn contains(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        self.run(move |store| store.contains(&key)).await
    }

    /// Add `delta` to an integer value.
    pub async fn incr(
        &self,
        key: impl Into<Key>,
        delta: i64,
        default: Option<i64>,
    ) -> Result<Option<i64>> {
        let key = key.into();
        self.run(move |store| store.incr(key, delta, default)).await
    }

    /// Subtract `delta` from an integer value.
    pub async fn decr(
        &self,
        key: impl Into<Key>,
        delta: i64,
        default: Option<i64>,
    ) -> Result<Option<i64>> {
        self.incr(key, delta.saturating_neg(), default).await
    }

    /// Counters.
    pub async fn stats(&self) -> Result<Stats> {
        self.run(|store| store.stats()).await
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Result<usize> {
        self.sweep(Sweep::All).await
    }

    /// Physically remove expired rows.
    pub async fn expire(&self) -> Result<usize> {
        self.sweep(Sweep::Expired).await
    }

    /// Remove entries carrying `tag`.
    pub async fn evict(&self, tag: impl Into<String>) -> Result<usize> {
        self.evict_tags([tag]).await
    }

    /// Remove entries carrying any of `tags`.
    pub async fn evict_tags<I, T>(&self, tags: I) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        if tags.is_empty() {
            return Ok(0);
        }
        self.sweep(Sweep::Tagged(tags)).await
    }

    /// Remove expired rows and evict to the size limit.
    pub async fn cull(&self) -> Result<usize> {
        self.run(|store| store.cull()).await
    }

    /// Consistency sweep.
    pub async fn check(&self, fix: bool) -> Result<Vec<Anomaly>> {
        self.run(move |store| store.check(fix)).await
    }

    /// Run a sweep one batch per blocking task until a batch removes nothing.
    async fn sweep(&self, sweep: Sweep) -> Result<usize> {
        let mut total = 0;
        loop {
            let batch = sweep.clone();
            let removed = self.run(move |store| store.sweep_batch(&batch)).await?;
            if removed == 0 {
                return Ok(total);
            }
            total += removed;
            task::yield_now().await;
        }
    }

    /// Snapshot iterator over live keys.
    pub async fn keys(&self) -> Result<AsyncKeys<S::Keys>> {
        let keys = self.run(|store| store.keys()).await?;
        Ok(AsyncKeys::new(keys))
    }

    /// Snapshot iterator over live keys, newest first.
    pub async fn keys_reversed(&self) -> Result<AsyncKeys<S::Keys>> {
        let keys = self.run(|store| store.keys_reversed()).await?;
        Ok(AsyncKeys::new(keys))
    }

    /// Snapshot iterator over live keys carrying `tag`.
    pub async fn filter(&self, tag: impl Into<String>) -> Result<AsyncKeys<S::Keys>> {
        let tag = tag.into();
        let keys = self.run(move |store| store.filter(&tag)).await?;
        Ok(AsyncKeys::new(keys))
    }
}

/// Async pager over a blocking keys iterator
pub struct AsyncKeys<I> {
    inner: Option<I>,
    buffer: VecDeque<Key>,
}

impl<I> AsyncKeys<I>
where
    I: Iterator<Item = Result<Key>> + Send + 'static,
{
    fn new(inner: I) -> Self {
        AsyncKeys {
            inner: Some(inner),
            buffer: VecDeque::new(),
        }
    }

    /// Next key, or `None` once exhausted.
    pub async fn next(&mut self) -> Option<Result<Key>> {
        if self.buffer.is_empty() {
            let mut inner = self.inner.take()?;
            let fetched = task::spawn_blocking(move || {
                let page = inner
                    .by_ref()
                    .take(ASYNC_PAGE_SIZE)
                    .collect::<Result<Vec<Key>>>();
                (inner, page)
            })
            .await;
            match fetched {
                Ok((inner, Ok(page))) => {
                    if page.len() == ASYNC_PAGE_SIZE {
                        self.inner = Some(inner);
                    }
                    self.buffer.extend(page);
                }
                Ok((_, Err(err))) => return Some(Err(err)),
                Err(err) => return Some(Err(join_error(err))),
            }
        }
        self.buffer.pop_front().map(Ok)
    }

    /// Drain the remaining keys.
    pub async fn collect(mut self) -> Result<Vec<Key>> {
        let mut keys = Vec::new();
        while let Some(key) = self.next().await {
            keys.push(key?);
        }
        Ok(keys)
    }
}
