//! Bounded exponential backoff for contended transactions

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// How often and how patiently a busy transaction is retried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before surfacing [`Error::Busy`]; at least one is always made.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
}

/// Maps an attempt number to the delay that follows it.
pub trait BackoffPolicy {
    /// Delay after the given (1-based) failed attempt.
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 2,
            max_backoff_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Schedule used by lock and semaphore polling.
    pub fn polling() -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_backoff_ms: 1,
            max_backoff_ms: 50,
        }
    }

    /// Fresh delay sequence.
    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            attempt: 0,
        }
    }

    /// Run `op`, retrying while it reports a busy store.
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut backoff = self.backoff();
        loop {
            match op() {
                Err(err) if err.is_busy() => {
                    let attempts = backoff.attempt + 1;
                    if attempts >= self.max_attempts.max(1) {
                        debug!(attempts, "index still busy, giving up");
                        return Err(Error::Busy { attempts });
                    }
                    let delay = backoff.next_delay();
                    debug!(attempts, ?delay, "index busy, retrying");
                    thread::sleep(delay);
                }
                other => return other,
            }
        }
    }
}

impl BackoffPolicy for RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Iterator-like cursor over a policy's delays.
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    attempt: u32,
}

impl Backoff<'_> {
    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay_for_attempt(self.attempt)
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        }
    }

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        };
        let mut backoff = policy.backoff();
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
    }

    #[test]
    fn test_run_gives_up_with_busy() {
        let calls = Cell::new(0);
        let result: Result<()> = fast().run(|| {
            calls.set(calls.get() + 1);
            Err(Error::Busy { attempts: 1 })
        });
        assert!(matches!(result, Err(Error::Busy { attempts: 4 })));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_run_recovers() {
        let calls = Cell::new(0);
        let result = fast().run(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Error::Busy { attempts: 1 })
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_run_does_not_retry_other_errors() {
        let calls = Cell::new(0);
        let result: Result<()> = fast().run(|| {
            calls.set(calls.get() + 1);
            Err(Error::Corrupt("bad".into()))
        });
        assert!(matches!(result, Err(Error::Corrupt(_))));
        assert_eq!(calls.get(), 1);
    }
}
