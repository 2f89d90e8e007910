// Shared counter store abstraction used by the rate limiter.

use async_trait::async_trait;
use std::time::Duration;

/// One counter to increment, with the expiry applied when the increment creates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowIncrement {
    pub key: String,
    pub ttl: Duration,
}

/// Post-increment values of the burst and daily counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounts {
    pub burst: u64,
    pub daily: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("counter store unreachable: {0}")]
    Unreachable(String),
    #[error("counter store round trip timed out after {0:?}")]
    Timeout(Duration),
    #[error("counter store returned an unexpected reply: {0}")]
    Protocol(String),
}

/// Key-value store able to bump both window counters in one indivisible step.
///
/// Implementations must never split the operation into separate reads and
/// writes: two concurrent calls for the same keys must observe distinct
/// post-increment values.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment_windows(
        &self,
        burst: &WindowIncrement,
        daily: &WindowIncrement,
        amount: u64,
    ) -> Result<WindowCounts, StoreError>;

    /// Short backend name for health reporting and logs.
    fn backend_name(&self) -> &'static str;
}
