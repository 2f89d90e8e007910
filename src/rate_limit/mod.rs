// Two-window admission control.
//
// Every admission bumps a short burst counter and a daily counter for the
// client in a single atomic store operation, then decides from the
// post-increment values. Denied attempts still count. A store failure is
// reported as `AdmitError::LimiterUnavailable`; it is never turned into
// an allow.

mod memory;
mod redis_store;
mod store;

pub use memory::{MemoryCounterStore, spawn_eviction_task};
pub use redis_store::RedisCounterStore;
pub use store::{CounterStore, StoreError, WindowCounts, WindowIncrement};

use crate::identity::ClientKey;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DAY_SECS: u64 = 86_400;
/// Extra lifetime of a daily counter past its window.
const DAILY_TTL_BUFFER_SECS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitScope {
    Burst,
    Daily,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitScope::Burst => f.write_str("burst"),
            LimitScope::Daily => f.write_str("daily"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error("{scope} rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded {
        scope: LimitScope,
        retry_after_secs: u64,
    },
    #[error("rate limiter unavailable: {0}")]
    LimiterUnavailable(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub burst_window_secs: u64,
    pub burst_limit: u64,
    pub daily_limit: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            burst_window_secs: 60,
            burst_limit: 5,
            daily_limit: 25,
        }
    }
}

impl RateLimitPolicy {
    fn burst_window(&self) -> u64 {
        self.burst_window_secs.max(1)
    }

    /// Store increments for the windows containing `now_secs`.
    pub fn windows_for(&self, key: &ClientKey, now_secs: u64) -> (WindowIncrement, WindowIncrement) {
        let burst_window = self.burst_window();
        let burst = WindowIncrement {
            key: format!("rl:{}:m:{}", key, now_secs / burst_window),
            ttl: Duration::from_secs(burst_window * 2),
        };
        let daily = WindowIncrement {
            key: format!("rl:{}:d:{}", key, now_secs / DAY_SECS),
            ttl: Duration::from_secs(DAY_SECS + DAILY_TTL_BUFFER_SECS),
        };
        (burst, daily)
    }

    /// Denies on the burst window before the daily one.
    pub fn decide(&self, counts: WindowCounts, now_secs: u64) -> Result<(), AdmitError> {
        if counts.burst > self.burst_limit {
            let window = self.burst_window();
            return Err(AdmitError::RateLimitExceeded {
                scope: LimitScope::Burst,
                retry_after_secs: window - (now_secs % window),
            });
        }
        if counts.daily > self.daily_limit {
            return Err(AdmitError::RateLimitExceeded {
                scope: LimitScope::Daily,
                retry_after_secs: DAY_SECS - (now_secs % DAY_SECS),
            });
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, policy: RateLimitPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Consumes `amount` units for `key` at the current time.
    pub async fn admit(&self, key: &ClientKey, amount: u64) -> Result<WindowCounts, AdmitError> {
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.admit_at(key, amount, now_secs).await
    }

    /// Same as [`admit`](Self::admit) with an explicit clock, in unix seconds.
    pub async fn admit_at(
        &self,
        key: &ClientKey,
        amount: u64,
        now_secs: u64,
    ) -> Result<WindowCounts, AdmitError> {
        let (burst, daily) = self.policy.windows_for(key, now_secs);

        let counts = self
            .store
            .increment_windows(&burst, &daily, amount)
            .await
            .map_err(|err| {
                tracing::error!(
                    backend = self.store.backend_name(),
                    "Rate limiter store failed, rejecting request: {}",
                    err
                );
                AdmitError::LimiterUnavailable(err)
            })?;

        self.policy.decide(counts, now_secs).inspect_err(|err| {
            tracing::info!(
                client = %key,
                burst = counts.burst,
                daily = counts.daily,
                "Admission denied: {}",
                err
            );
        })?;

        Ok(counts)
    }
}
