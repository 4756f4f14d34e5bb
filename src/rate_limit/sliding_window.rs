use super::store::QuotaStore;
use super::types::{ceil_secs, RateLimitConfig, RateLimitResult, UsageRecord};
use crate::error::Result;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Exact rolling-window limiter.
///
/// Admits at most `max_requests` in any trailing `window_ms` interval. The
/// admission timestamps held by this instance are the authoritative state;
/// the quota store only receives a `{count, reset_time}` projection after
/// each admission and cannot be used to rebuild the log.
///
/// Logs are released only by [`prune_idle`](Self::prune_idle), so an owner
/// serving unbounded key sets must call it periodically.
pub struct SlidingWindowLimiter {
    store: Arc<dyn QuotaStore>,
    max_requests: u32,
    window_ms: u64,
    /// Admission timestamps per key, oldest first
    timestamps: DashMap<String, VecDeque<u64>>,
}

/// Outcome of the in-memory part of a check
enum Decision {
    Admitted { count: usize },
    Rejected { oldest: u64, newest: u64 },
}

impl SlidingWindowLimiter {
    /// Create a limiter. Fails if `config` cannot admit anything.
    pub fn new(config: &RateLimitConfig, store: Arc<dyn QuotaStore>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            store,
            max_requests: config.max_requests,
            window_ms: config.window_ms,
            timestamps: DashMap::new(),
        })
    }

    /// Check if a request for `key` at `now_ms` is admitted, recording it if so.
    ///
    /// The store projection is last-writer-wins: concurrent admissions for one
    /// key may leave an older `count` in the store than the log holds.
    pub async fn check_limit(&self, key: &str, now_ms: u64) -> RateLimitResult {
        // The entry guard is dropped before the store write below.
        let decision = {
            let mut log = self.timestamps.entry(key.to_string()).or_default();
            prune(&mut log, now_ms, self.window_ms);

            match (log.front().copied(), log.back().copied()) {
                (Some(oldest), Some(newest)) if log.len() >= self.max_requests as usize => {
                    Decision::Rejected { oldest, newest }
                }
                _ => {
                    log.push_back(now_ms);
                    Decision::Admitted { count: log.len() }
                }
            }
        };

        match decision {
            Decision::Admitted { count } => {
                let reset_time = now_ms + self.window_ms;
                self.store
                    .set(key, UsageRecord::counter(count as u64, reset_time))
                    .await;

                let remaining = self.max_requests.saturating_sub(count as u32);
                debug!(key, remaining, "Sliding window check passed");
                RateLimitResult::allowed(remaining, reset_time)
            }
            Decision::Rejected { oldest, newest } => {
                let retry_after = ceil_secs((oldest + self.window_ms).saturating_sub(now_ms));
                warn!(key, retry_after, "Rate limit exceeded (sliding window)");
                RateLimitResult::denied(newest + self.window_ms, retry_after)
            }
        }
    }

    /// Capacity left for `key` at `now_ms` without recording a request
    pub fn get_remaining(&self, key: &str, now_ms: u64) -> u32 {
        let live = self
            .timestamps
            .get(key)
            .map(|log| {
                log.iter()
                    .filter(|&&t| in_window(t, now_ms, self.window_ms))
                    .count()
            })
            .unwrap_or(0);

        self.max_requests.saturating_sub(live as u32)
    }

    /// Forget the admission log of one key
    pub fn reset_key(&self, key: &str) {
        self.timestamps.remove(key);
    }

    /// Drop every in-memory admission log. The quota store is left untouched.
    pub fn clear_memory(&self) {
        self.timestamps.clear();
    }

    /// Drop logs whose every entry has aged out at `now_ms`
    pub fn prune_idle(&self, now_ms: u64) -> usize {
        let before = self.timestamps.len();
        self.timestamps.retain(|_, log| {
            prune(log, now_ms, self.window_ms);
            !log.is_empty()
        });
        before.saturating_sub(self.timestamps.len())
    }

    /// Number of keys with an in-memory log
    pub fn tracked_keys(&self) -> usize {
        self.timestamps.len()
    }

    /// Window length this limiter was built with
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}

/// A timestamp counts while it is newer than `now - window`
fn in_window(timestamp: u64, now_ms: u64, window_ms: u64) -> bool {
    timestamp.saturating_add(window_ms) > now_ms
}

/// Drop aged-out timestamps and keep the log sorted.
///
/// Timestamps are appended in call order, which under clock skew may not be
/// sorted, so every entry is checked rather than stopping at the first live one.
fn prune(log: &mut VecDeque<u64>, now_ms: u64, window_ms: u64) {
    log.retain(|&t| in_window(t, now_ms, window_ms));
    if log.iter().zip(log.iter().skip(1)).any(|(a, b)| a > b) {
        log.make_contiguous().sort_unstable();
    }
}
