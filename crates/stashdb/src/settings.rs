//! Cache settings, persisted in the index so every process agrees on them

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Default capacity bound (1 GiB)
pub const DEFAULT_SIZE_LIMIT: u64 = 1 << 30;

/// Default inline-vs-file boundary (32 KiB)
pub const DEFAULT_SIZE_THRESHOLD: u64 = 1 << 15;

/// Which entries are evicted first once the cache is over its limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Capacity is not enforced
    None,
    /// Oldest `store_time` first
    #[default]
    #[serde(alias = "oldest")]
    LeastRecentlyStored,
    /// Smallest `access_time` first
    #[serde(alias = "lru")]
    LeastRecentlyUsed,
    /// Smallest `access_count` first
    #[serde(alias = "lfu")]
    LeastFrequentlyUsed,
}

/// SQLite connection pragmas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteSettings {
    /// How long SQLite itself waits on a lock before reporting busy
    pub busy_timeout_ms: u64,
    /// `PRAGMA auto_vacuum`
    pub auto_vacuum: String,
    /// `PRAGMA cache_size` (pages)
    pub cache_size: i64,
    /// `PRAGMA journal_mode`
    pub journal_mode: String,
    /// `PRAGMA mmap_size` (bytes)
    pub mmap_size: i64,
    /// `PRAGMA synchronous`
    pub synchronous: String,
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 50,
            auto_vacuum: "FULL".to_string(),
            cache_size: 1 << 13,
            journal_mode: "WAL".to_string(),
            mmap_size: 1 << 26,
            synchronous: "NORMAL".to_string(),
        }
    }
}

impl SqliteSettings {
    /// Busy timeout as a duration.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Pragma statements applied to every new connection.
    pub fn pragmas(&self) -> String {
        format!(
            "PRAGMA auto_vacuum = {}; PRAGMA cache_size = {}; PRAGMA journal_mode = {}; \
             PRAGMA mmap_size = {}; PRAGMA synchronous = {};",
            self.auto_vacuum, self.cache_size, self.journal_mode, self.mmap_size, self.synchronous
        )
    }

    fn validate(&self) -> Result<()> {
        let checks: [(&str, &str, &[&str]); 3] = [
            ("auto_vacuum", self.auto_vacuum.as_str(), &["NONE", "FULL", "INCREMENTAL", "0", "1", "2"]),
            (
                "journal_mode",
                self.journal_mode.as_str(),
                &["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"],
            ),
            (
                "synchronous",
                self.synchronous.as_str(),
                &["OFF", "NORMAL", "FULL", "EXTRA", "0", "1", "2", "3"],
            ),
        ];
        for (name, value, allowed) in checks {
            if !allowed.contains(&value.to_ascii_uppercase().as_str()) {
                return Err(Error::Config(format!("invalid sqlite {}: {}", name, value)));
            }
        }
        Ok(())
    }
}

/// Settings for a cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Count hits and misses
    pub statistics: bool,
    /// Eviction policy
    pub eviction_policy: EvictionPolicy,
    /// Capacity bound in bytes
    pub size_limit: u64,
    /// Rows removed per eviction batch
    pub cull_limit: u32,
    /// Payloads larger than this go to blob files
    pub size_threshold: u64,
    /// Retry behaviour for busy transactions
    pub retry: RetryPolicy,
    /// SQLite pragmas
    pub sqlite: SqliteSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            statistics: false,
            eviction_policy: EvictionPolicy::default(),
            size_limit: DEFAULT_SIZE_LIMIT,
            cull_limit: 10,
            size_threshold: DEFAULT_SIZE_THRESHOLD,
            retry: RetryPolicy::default(),
            sqlite: SqliteSettings::default(),
        }
    }
}

impl Settings {
    /// Enable or disable hit/miss counting.
    pub fn with_statistics(mut self, on: bool) -> Self {
        self.statistics = on;
        self
    }

    /// Set the eviction policy.
    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    /// Set the capacity bound.
    pub fn with_size_limit(mut self, limit: u64) -> Self {
        self.size_limit = limit;
        self
    }

    /// Set the inline-vs-file boundary.
    pub fn with_size_threshold(mut self, threshold: u64) -> Self {
        self.size_threshold = threshold;
        self
    }

    /// Set the busy retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reject settings the cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cull_limit == 0 {
            return Err(Error::Config("cull_limit must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        self.sqlite.validate()
    }

    /// Serialize for the `settings` table.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the `settings` table value.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_aliases() {
        let lru: EvictionPolicy = serde_json::from_str("\"lru\"").unwrap();
        let lfu: EvictionPolicy = serde_json::from_str("\"lfu\"").unwrap();
        let old: EvictionPolicy = serde_json::from_str("\"oldest\"").unwrap();
        assert_eq!(lru, EvictionPolicy::LeastRecentlyUsed);
        assert_eq!(lfu, EvictionPolicy::LeastFrequentlyUsed);
        assert_eq!(old, EvictionPolicy::LeastRecentlyStored);
        assert_eq!(
            serde_json::to_string(&EvictionPolicy::LeastRecentlyUsed).unwrap(),
            "\"least-recently-used\""
        );
    }

    #[test]
    fn test_json_roundtrip_fills_defaults() {
        let settings = Settings::from_json(r#"{"size_limit": 1000, "statistics": true}"#).unwrap();
        assert_eq!(settings.size_limit, 1000);
        assert!(settings.statistics);
        assert_eq!(settings.cull_limit, 10);
        assert_eq!(settings.sqlite.journal_mode, "WAL");
    }

    #[test]
    fn test_validate() {
        assert!(Settings::default().validate().is_ok());

        let mut bad = Settings::default();
        bad.sqlite.journal_mode = "WAL; DROP TABLE cache".to_string();
        assert!(matches!(bad.validate(), Err(Error::Config(_))));

        let mut bad = Settings::default();
        bad.cull_limit = 0;
        assert!(bad.validate().is_err());
    }
}
