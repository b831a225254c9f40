//! # stashcache
//!
//! Persistent disk-backed cache built on the stashdb storage engine.
//!
//! ## Architecture
//! - **Cache**: get/set/delete/touch over one directory, with expiry, tags
//!   and capacity-bounded eviction (lru, lfu, oldest, none)
//! - **Lock / Semaphore**: named sync rows in the same index, shared by
//!   threads, processes and async tasks
//! - **FanoutCache**: N independent shards routed by a stable key hash
//! - **AsyncCache**: tokio adapter over either cache type
//!
//! All coordination goes through the index's transactions, never through
//! in-process locks, so separate processes can share a directory.

#![warn(missing_docs)]

mod asynchronous;
mod cache;
mod eviction;
mod fanout;
mod stats;
mod sync;

pub use asynchronous::{AsyncCache, AsyncKeys, CacheStore};
pub use cache::{Anomaly, Cache, SetOptions, Sweep, ORPHAN_GRACE, SWEEP_BATCH};
pub use eviction::{EvictionManager, EvictionState};
pub use fanout::{FanoutCache, FanoutKeys, DEFAULT_SHARDS};
pub use stats::Stats;
pub use sync::{Lock, LockGuard, LockOptions, LockToken, Semaphore, SemaphorePermit};

pub use stashdb::{
    Error, ErrorKind, EvictionPolicy, Key, Keys, MetadataKey, Result, RetryPolicy, Settings,
    SqliteSettings, Value,
};
