// Process-local counter store.
// Same two-window semantics as the shared store, but the guarantees only hold
// inside a single process.

use super::store::{CounterStore, StoreError, WindowCounts, WindowIncrement};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Counter {
    value: u64,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct MemoryCounterStore {
    counters: Arc<Mutex<HashMap<String, Counter>>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Counter>> {
        self.counters.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Memory counter store lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Current value of a live counter.
    pub fn current(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|counter| counter.expires_at > now)
            .map(|counter| counter.value)
    }

    /// Drops expired counters. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut counters = self.lock();
        let before = counters.len();
        counters.retain(|_, counter| counter.expires_at > now);
        before - counters.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bump(
        counters: &mut HashMap<String, Counter>,
        window: &WindowIncrement,
        amount: u64,
        now: Instant,
    ) -> u64 {
        let counter = counters
            .entry(window.key.clone())
            .and_modify(|counter| {
                if counter.expires_at <= now {
                    // Expired window: behaves like a fresh key.
                    counter.value = 0;
                    counter.expires_at = now + window.ttl;
                }
            })
            .or_insert_with(|| Counter {
                value: 0,
                expires_at: now + window.ttl,
            });
        counter.value = counter.value.saturating_add(amount);
        counter.value
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_windows(
        &self,
        burst: &WindowIncrement,
        daily: &WindowIncrement,
        amount: u64,
    ) -> Result<WindowCounts, StoreError> {
        let now = Instant::now();
        // Both counters move under one lock acquisition.
        let mut counters = self.lock();
        let burst_count = Self::bump(&mut counters, burst, amount, now);
        let daily_count = Self::bump(&mut counters, daily, amount, now);
        Ok(WindowCounts {
            burst: burst_count,
            daily: daily_count,
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Periodically evicts expired counters so memory stays bounded by active clients.
pub fn spawn_eviction_task(
    store: MemoryCounterStore,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let evicted = store.evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted, remaining = store.len(), "Evicted expired rate-limit counters");
            }
        }
    })
}
