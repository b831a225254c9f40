//! Capacity enforcement
//!
//! Runs inside the write transaction of every `set`, so the size bound holds
//! as soon as the write returns. Each pass first drops expired rows, then
//! removes rows in policy order until the cache is back under its limit.

use stashdb::{EntryOrder, EvictionPolicy, IndexQueries, MetadataKey, Result, Settings, Txn};
use tracing::debug;

/// Where a cache stands relative to its size limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionState {
    /// Below the limit
    UnderLimit,
    /// Exactly at the limit; the next growing write triggers eviction
    AtLimit,
    /// Above the limit, entries are being removed
    Evicting,
}

/// Enforces one cache's size limit
#[derive(Debug, Clone)]
pub struct EvictionManager {
    policy: EvictionPolicy,
    size_limit: u64,
    cull_limit: u32,
}

impl EvictionManager {
    /// Create a manager from cache settings
    pub fn new(settings: &Settings) -> Self {
        Self {
            policy: settings.eviction_policy,
            size_limit: settings.size_limit,
            cull_limit: settings.cull_limit.max(1),
        }
    }

    /// Classify a tracked size.
    pub fn state(&self, size: u64) -> EvictionState {
        if self.order().is_none() || size < self.size_limit {
            EvictionState::UnderLimit
        } else if size == self.size_limit {
            EvictionState::AtLimit
        } else {
            EvictionState::Evicting
        }
    }

    fn order(&self) -> Option<EntryOrder> {
        match self.policy {
            EvictionPolicy::None => None,
            EvictionPolicy::LeastRecentlyStored => Some(EntryOrder::StoreTime),
            EvictionPolicy::LeastRecentlyUsed => Some(EntryOrder::AccessTime),
            EvictionPolicy::LeastFrequentlyUsed => Some(EntryOrder::AccessCount),
        }
    }

    /// Drop up to one batch of expired rows, then evict down to the limit
    ///
    /// # Arguments
    /// * `txn` - Write transaction of the triggering operation
    /// * `now` - Time expiry is judged against
    ///
    /// # Returns
    /// * `Result<usize>` - Rows removed
    pub fn cull(&self, txn: &mut Txn<'_>, now: f64) -> Result<usize> {
        let mut removed = 0;
        for row in txn.expired(now, self.cull_limit)? {
            txn.remove(&row)?;
            removed += 1;
        }
        Ok(removed + self.enforce(txn)?)
    }

    /// Evict rows in policy order until size is at or under the limit.
    pub fn enforce(&self, txn: &mut Txn<'_>) -> Result<usize> {
        let order = match self.order() {
            Some(order) => order,
            None => return Ok(0),
        };

        let mut size = txn.metadata(MetadataKey::Size)?.max(0) as u64;
        let mut state = self.state(size);
        let mut removed = 0;

        while state == EvictionState::Evicting {
            let batch = txn.ordered(order, self.cull_limit)?;
            if batch.is_empty() {
                break;
            }
            for row in &batch {
                txn.remove(row)?;
                removed += 1;
                size = size.saturating_sub(row.size);
                state = self.state(size);
                if state != EvictionState::Evicting {
                    break;
                }
            }
        }

        if removed > 0 {
            debug!(removed, size, limit = self.size_limit, policy = ?self.policy, "evicted entries");
        }
        Ok(removed)
    }
}
