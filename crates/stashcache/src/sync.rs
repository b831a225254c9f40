//! Named locks and semaphores shared through a cache directory
//!
//! Both live as rows of the index's `sync` table, so they coordinate threads,
//! processes and tasks alike. Every state change is one write transaction;
//! blocked callers poll with backoff until acquired or timed out.

use std::thread;
use std::time::{Duration, Instant};

use rusqlite::{params, OptionalExtension};
use stashdb::{now, Backoff, Error, Result, RetryPolicy};
use tracing::{debug, warn};

use crate::asynchronous::join_error;
use crate::cache::Cache;

fn default_holder() -> String {
    format!("{}-{:?}", std::process::id(), thread::current().id())
}

/// Behaviour of a [`Lock`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockOptions {
    /// Let the current holder acquire again; each acquire needs its own release
    pub reentrant: bool,
    /// Time after which an unreleased lock may be taken over
    pub lease: Option<Duration>,
    /// Holder identity; defaults to process id plus thread id
    pub holder: Option<String>,
}

impl LockOptions {
    /// Allow the holder to re-acquire.
    pub fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    /// Expire the hold after `lease`.
    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Use an explicit holder identity.
    pub fn holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = Some(holder.into());
        self
    }
}

/// Proof of acquisition, checked on release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    token: i64,
    holder: String,
}

impl LockToken {
    /// Version of the lock row this hold was granted at
    pub fn value(&self) -> i64 {
        self.token
    }

    /// Holder identity
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

/// Mutual exclusion keyed by name
#[derive(Clone)]
pub struct Lock {
    cache: Cache,
    name: String,
    options: LockOptions,
}

impl Lock {
    /// Non-reentrant lock without a lease.
    pub fn new(cache: &Cache, name: impl Into<String>) -> Self {
        Self::with_options(cache, name, LockOptions::default())
    }

    /// Lock with explicit options.
    pub fn with_options(cache: &Cache, name: impl Into<String>, options: LockOptions) -> Self {
        Lock {
            cache: cache.clone(),
            name: name.into(),
            options,
        }
    }

    /// Lock name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn holder(&self) -> String {
        self.options.holder.clone().unwrap_or_else(default_holder)
    }

    fn attempt(&self, holder: &str) -> Result<Option<LockToken>> {
        let name = self.name.as_str();
        let reentrant = self.options.reentrant;
        let lease = self.options.lease;

        self.cache.index().write(|txn| {
            let now = now();
            txn.execute(
                "INSERT OR IGNORE INTO sync (name, holder, count, max_count, token, depth, expire_time) \
                 VALUES (?1, NULL, 0, 1, 0, 0, NULL)",
                params![name],
            )?;
            let (current, count, token, expire_time): (Option<String>, i64, i64, Option<f64>) =
                txn.query_row(
                    "SELECT holder, count, token, expire_time FROM sync WHERE name = ?1",
                    params![name],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;
            let lapsed = matches!(expire_time, Some(t) if t <= now);
            let deadline = lease.map(|lease| now + lease.as_secs_f64());

            if count == 0 || lapsed {
                if count > 0 {
                    debug!(lock = name, previous = ?current, "lease lapsed, taking over");
                }
                let token = token + 1;
                txn.execute(
                    "UPDATE sync SET holder = ?2, count = 1, token = ?3, depth = 1, expire_time = ?4 \
                     WHERE name = ?1",
                    params![name, holder, token, deadline],
                )?;
                Ok(Some(LockToken {
                    token,
                    holder: holder.to_string(),
                }))
            } else if reentrant && current.as_deref() == Some(holder) {
                txn.execute(
                    "UPDATE sync SET depth = depth + 1, expire_time = ?2 WHERE name = ?1",
                    params![name, deadline],
                )?;
                Ok(Some(LockToken {
                    token,
                    holder: holder.to_string(),
                }))
            } else {
                Ok(None)
            }
        })
    }

    /// Acquire without waiting
    ///
    /// # Returns
    /// * `Result<Option<LockGuard>>` - `None` if someone else holds the lock
    pub fn try_acquire(&self) -> Result<Option<LockGuard>> {
        let token = self.attempt(&self.holder())?;
        Ok(token.map(|token| LockGuard::new(self.clone(), token)))
    }

    /// Acquire, waiting up to `timeout` (forever for `None`)
    ///
    /// # Returns
    /// * `Result<LockGuard>` - Fails with [`Error::SyncTimeout`] once the deadline passes
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<LockGuard> {
        let holder = self.holder();
        let token = poll(&self.name, timeout, || self.attempt(&holder))?;
        Ok(LockGuard::new(self.clone(), token))
    }

    /// Acquire from async code without blocking the runtime
    ///
    /// Dropping the returned future leaves the lock as if it had never been
    /// requested: an attempt still in flight releases what it acquired.
    pub async fn acquire_async(&self, timeout: Option<Duration>) -> Result<LockGuard> {
        let holder = self.holder();
        let lock = self.clone();
        poll_async(self.name.clone(), timeout, move || {
            let token = lock.attempt(&holder)?;
            Ok(token.map(|token| LockGuard::new(lock.clone(), token)))
        })
        .await
    }

    /// True if some holder currently owns the lock.
    pub fn locked(&self) -> Result<bool> {
        let name = self.name.as_str();
        self.cache.index().read(|conn| {
            let row: Option<(i64, Option<f64>)> = conn
                .query_row(
                    "SELECT count, expire_time FROM sync WHERE name = ?1",
                    params![name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let now = now();
            Ok(matches!(row, Some((count, expire)) if count > 0 && !matches!(expire, Some(t) if t <= now)))
        })
    }

    /// Release a hold
    ///
    /// Fails with [`Error::NotHeld`] if the lock was released already or
    /// taken over after its lease lapsed.
    pub fn release(&self, token: &LockToken) -> Result<()> {
        let name = self.name.as_str();
        self.cache.index().write(|txn| {
            let row: Option<(Option<String>, i64, i64, i64)> = txn
                .query_row(
                    "SELECT holder, count, token, depth FROM sync WHERE name = ?1",
                    params![name],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            match row {
                Some((Some(holder), count, current, depth))
                    if count > 0 && current == token.token && holder == token.holder =>
                {
                    if depth > 1 {
                        txn.execute(
                            "UPDATE sync SET depth = depth - 1 WHERE name = ?1",
                            params![name],
                        )?;
                    } else {
                        txn.execute(
                            "UPDATE sync SET holder = NULL, count = 0, depth = 0, expire_time = NULL \
                             WHERE name = ?1",
                            params![name],
                        )?;
                    }
                    Ok(())
                }
                _ => Err(Error::NotHeld {
                    name: name.to_string(),
                }),
            }
        })
    }
}

/// Held lock; released on drop
pub struct LockGuard {
    lock: Lock,
    token: LockToken,
    armed: bool,
}

impl LockGuard {
    fn new(lock: Lock, token: LockToken) -> Self {
        LockGuard {
            lock,
            token,
            armed: true,
        }
    }

    /// Token this hold was granted
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Release now, surfacing any error.
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        self.lock.release(&self.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.lock.release(&self.token) {
                warn!(lock = %self.lock.name, error = %err, "failed to release lock on drop");
            }
        }
    }
}

/// Counting semaphore keyed by name
///
/// The row stores the available permits; acquire only decrements while it
/// stays non-negative and release only increments up to the maximum.
#[derive(Clone)]
pub struct Semaphore {
    cache: Cache,
    name: String,
    max: u32,
}

impl Semaphore {
    /// Semaphore with `max` permits
    ///
    /// The maximum is fixed by whichever handle creates the row first.
    pub fn new(cache: &Cache, name: impl Into<String>, max: u32) -> Self {
        Semaphore {
            cache: cache.clone(),
            name: name.into(),
            max,
        }
    }

    /// Semaphore name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_row(&self, txn: &rusqlite::Connection) -> Result<()> {
        txn.execute(
            "INSERT OR IGNORE INTO sync (name, holder, count, max_count, token, depth, expire_time) \
             VALUES (?1, NULL, ?2, ?2, 0, 0, NULL)",
            params![self.name, self.max],
        )?;
        Ok(())
    }

    fn attempt(&self) -> Result<bool> {
        self.cache.index().write(|txn| {
            self.ensure_row(txn)?;
            let changed = txn.execute(
                "UPDATE sync SET count = count - 1, token = token + 1 WHERE name = ?1 AND count > 0",
                params![self.name],
            )?;
            Ok(changed == 1)
        })
    }

    /// Take a permit without waiting
    ///
    /// # Returns
    /// * `Result<Option<SemaphorePermit>>` - `None` if no permit is available
    pub fn try_acquire(&self) -> Result<Option<SemaphorePermit>> {
        Ok(self.attempt()?.then(|| SemaphorePermit::new(self.clone())))
    }

    /// Take a permit, waiting up to `timeout` (forever for `None`).
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<SemaphorePermit> {
        poll(&self.name, timeout, || {
            Ok(self.attempt()?.then(|| SemaphorePermit::new(self.clone())))
        })
    }

    /// Take a permit from async code; cancellation returns any permit taken.
    pub async fn acquire_async(&self, timeout: Option<Duration>) -> Result<SemaphorePermit> {
        let semaphore = self.clone();
        poll_async(self.name.clone(), timeout, move || {
            Ok(semaphore
                .attempt()?
                .then(|| SemaphorePermit::new(semaphore.clone())))
        })
        .await
    }

    /// Permits currently available.
    pub fn available(&self) -> Result<u32> {
        self.cache.index().read(|conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT count FROM sync WHERE name = ?1",
                    params![self.name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.map_or(self.max, |c| c.max(0) as u32))
        })
    }

    /// Return one permit on behalf of a [`SemaphorePermit`]
    ///
    /// Fails with [`Error::SemaphoreFull`] if every permit is already available.
    fn give_back(&self) -> Result<()> {
        self.cache.index().write(|txn| {
            self.ensure_row(txn)?;
            let changed = txn.execute(
                "UPDATE sync SET count = count + 1 WHERE name = ?1 AND count < max_count",
                params![self.name],
            )?;
            if changed == 1 {
                return Ok(());
            }
            let max: i64 = txn.query_row(
                "SELECT max_count FROM sync WHERE name = ?1",
                params![self.name],
                |row| row.get(0),
            )?;
            Err(Error::SemaphoreFull {
                name: self.name.clone(),
                max: max.max(0) as u32,
            })
        })
    }
}

/// Held semaphore permit; returned on drop
pub struct SemaphorePermit {
    semaphore: Semaphore,
    armed: bool,
}

impl SemaphorePermit {
    fn new(semaphore: Semaphore) -> Self {
        SemaphorePermit {
            semaphore,
            armed: true,
        }
    }

    /// Return the permit now, surfacing any error.
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        self.semaphore.give_back()
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.semaphore.give_back() {
                warn!(semaphore = %self.semaphore.name, error = %err, "failed to return permit on drop");
            }
        }
    }
}

/// Wait before the next poll, or fail once `timeout` has passed.
fn next_wait(
    name: &str,
    started: Instant,
    timeout: Option<Duration>,
    backoff: &mut Backoff<'_>,
) -> Result<Duration> {
    let waited = started.elapsed();
    let mut delay = backoff.next_delay();
    if let Some(limit) = timeout {
        if waited >= limit {
            debug!(name, ?waited, attempts = backoff.attempts(), "acquire timed out");
            return Err(Error::SyncTimeout {
                name: name.to_string(),
                waited,
            });
        }
        delay = delay.min(limit - waited);
    }
    if backoff.attempts() == 1 {
        debug!(name, "contended, polling");
    }
    Ok(delay)
}

fn poll<T>(
    name: &str,
    timeout: Option<Duration>,
    mut attempt: impl FnMut() -> Result<Option<T>>,
) -> Result<T> {
    let started = Instant::now();
    let policy = RetryPolicy::polling();
    let mut backoff = policy.backoff();
    loop {
        match attempt() {
            Ok(Some(held)) => return Ok(held),
            Ok(None) => {}
            Err(err) if err.is_busy() => {}
            Err(err) => return Err(err),
        }
        thread::sleep(next_wait(name, started, timeout, &mut backoff)?);
    }
}

/// Poll from async code, running each attempt on the blocking pool.
///
/// `T` must release what it holds on drop: if this future is dropped while
/// an attempt is running, the attempt's output is dropped with the task.
async fn poll_async<T, F>(name: String, timeout: Option<Duration>, attempt: F) -> Result<T>
where
    T: Send + 'static,
    F: Fn() -> Result<Option<T>> + Clone + Send + 'static,
{
    let started = Instant::now();
    let policy = RetryPolicy::polling();
    let mut backoff = policy.backoff();
    loop {
        let attempt = attempt.clone();
        let outcome = tokio::task::spawn_blocking(attempt)
            .await
            .map_err(join_error)?;
        match outcome {
            Ok(Some(held)) => return Ok(held),
            Ok(None) => {}
            Err(err) if err.is_busy() => {}
            Err(err) => return Err(err),
        }
        let delay = next_wait(&name, started, timeout, &mut backoff)?;
        tokio::time::sleep(delay).await;
    }
}
