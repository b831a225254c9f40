//! Cache statistics

use std::iter::Sum;
use std::ops::Add;

use rusqlite::Connection;
use stashdb::{IndexQueries, MetadataKey, Result};

/// Counters reported by `stats()`
///
/// `size` and `count` are always maintained; `hits` and `misses` only move
/// while statistics are enabled in the cache settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Bytes of payload tracked by the index
    pub size: u64,
    /// Number of entry rows
    pub count: u64,
    /// Reads that found a live entry
    pub hits: u64,
    /// Reads that found nothing or an expired entry
    pub misses: u64,
}

impl Stats {
    /// Read the counters inside an index transaction.
    pub(crate) fn load(conn: &Connection) -> Result<Self> {
        let read = |key| conn.metadata(key).map(|v| v.max(0) as u64);
        Ok(Stats {
            size: read(MetadataKey::Size)?,
            count: read(MetadataKey::Count)?,
            hits: read(MetadataKey::Hits)?,
            misses: read(MetadataKey::Misses)?,
        })
    }

    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl Add for Stats {
    type Output = Stats;

    fn add(self, other: Stats) -> Stats {
        Stats {
            size: self.size + other.size,
            count: self.count + other.count,
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
        }
    }
}

impl Sum for Stats {
    fn sum<I: Iterator<Item = Stats>>(iter: I) -> Stats {
        iter.fold(Stats::default(), Add::add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let stats = Stats {
            hits: 2,
            misses: 1,
            ..Stats::default()
        };

        assert_eq!(stats.hit_ratio(), 2.0 / 3.0);
        assert_eq!(Stats::default().hit_ratio(), 0.0);
    }

    #[test]
    fn test_sum_across_shards() {
        let shards = vec![
            Stats { size: 10, count: 1, hits: 3, misses: 0 },
            Stats { size: 20, count: 2, hits: 0, misses: 4 },
        ];

        let total: Stats = shards.into_iter().sum();
        assert_eq!(total, Stats { size: 30, count: 3, hits: 3, misses: 4 });
    }
}
