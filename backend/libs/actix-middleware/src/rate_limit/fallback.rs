use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::{RateLimitDecision, RateLimitError, RateLimiterBackend};

/// Map size above which a check also sweeps expired entries.
const SWEEP_THRESHOLD: usize = 10_000;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    expires_at: Instant,
}

/// Process-local fixed-window counters.
///
/// All operations run under one mutex; each is O(1) apart from sweeps.
#[derive(Default)]
pub struct InMemoryRateLimiter {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check(&self, key: &str, limit: u64, window: Duration) -> RateLimitDecision {
        let now = Instant::now();
        let mut entries = self.lock();

        if entries.len() > SWEEP_THRESHOLD {
            entries.retain(|_, e| e.expires_at > now);
        }

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at: now + window,
        });
        if entry.expires_at <= now {
            *entry = Entry {
                count: 0,
                expires_at: now + window,
            };
        }
        entry.count += 1;

        RateLimitDecision::from_count(entry.count, limit, entry.expires_at - now)
    }

    /// Decrement `key`, dropping it at zero.
    pub fn release_slot(&self, key: &str) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                entries.remove(key);
            }
        }
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep on a fixed interval until the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let removed = limiter.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired rate limit entries");
                }
            }
        })
    }
}

#[async_trait]
impl RateLimiterBackend for InMemoryRateLimiter {
    async fn check_limit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitError> {
        Ok(self.check(key, limit, window))
    }

    async fn release(&self, key: &str) -> Result<(), RateLimitError> {
        self.release_slot(key);
        Ok(())
    }
}
