use super::lock::KeyLocks;
use super::store::QuotaStore;
use super::types::{RateLimitConfig, RateLimitResult, UsageRecord};
use crate::error::Result;
use std::sync::Arc;
use tracing::{debug, warn};

/// Continuous-refill token bucket over a [`QuotaStore`].
///
/// Capacity is `max_requests` and refills at `max_requests / window` tokens
/// per second, so a new key may burst up to full capacity and then settles
/// into a steady rate.
///
/// A stored record's `reset_time` is the instant the bucket would be full
/// again. It expires only once continuous refill would have restored full
/// capacity anyway, so reinitializing an expired key never hands out more
/// tokens than refill would have.
pub struct TokenBucketLimiter {
    store: Arc<dyn QuotaStore>,
    max_requests: u32,
    window_ms: u64,
    refill_rate: f64,
    locks: KeyLocks,
}

/// What the store knows about a key
enum BucketState {
    /// A live record with a usable token balance
    Fresh(UsageRecord),
    /// Nothing usable: never seen, expired, or corrupt
    Expired,
}

impl TokenBucketLimiter {
    /// Create a limiter. Fails if `config` cannot admit anything.
    pub fn new(config: &RateLimitConfig, store: Arc<dyn QuotaStore>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            store,
            max_requests: config.max_requests,
            window_ms: config.window_ms,
            refill_rate: config.refill_rate_per_sec(),
            locks: KeyLocks::new(),
        })
    }

    /// Check if a request for `key` at `now_ms` is admitted, consuming one token if so
    pub async fn check_limit(&self, key: &str, now_ms: u64) -> RateLimitResult {
        let _guard = self.locks.lock(key).await;
        let max = self.max_requests as f64;

        let mut record = match self.load(key, now_ms).await {
            BucketState::Fresh(record) => record,
            BucketState::Expired => {
                let tokens = max - 1.0;
                let record = UsageRecord {
                    count: 1,
                    reset_time: self.full_at(tokens, now_ms),
                    tokens,
                    last_refill_time: now_ms,
                };
                self.store.set(key, record).await;

                debug!(key, remaining = self.max_requests - 1, "Initialized token bucket");
                return RateLimitResult::allowed(self.max_requests - 1, record.reset_time);
            }
        };

        record.tokens = self.refill(&record, now_ms);
        record.last_refill_time = record.last_refill_time.max(now_ms);
        record.count += 1;

        if record.tokens >= 1.0 {
            record.tokens -= 1.0;
            record.reset_time = self.full_at(record.tokens, now_ms);
            self.store.set(key, record).await;

            let remaining = record.tokens.floor() as u32;
            debug!(key, remaining, "Token bucket check passed");
            RateLimitResult::allowed(remaining, record.reset_time)
        } else {
            record.reset_time = self.full_at(record.tokens, now_ms);
            self.store.set(key, record).await;

            let retry_after = self.secs_until_token(record.tokens);
            warn!(key, retry_after, "Rate limit exceeded (token bucket)");
            RateLimitResult::denied(record.reset_time, retry_after)
        }
    }

    /// Whole tokens available to `key` at `now_ms`, without consuming any
    pub async fn peek_remaining(&self, key: &str, now_ms: u64) -> u32 {
        let _guard = self.locks.lock(key).await;

        match self.load(key, now_ms).await {
            BucketState::Fresh(record) => self.refill(&record, now_ms).floor() as u32,
            BucketState::Expired => self.max_requests,
        }
    }

    /// Window length this limiter was built with
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    async fn load(&self, key: &str, now_ms: u64) -> BucketState {
        match self.store.get(key, now_ms).await {
            Some(record) if record.tokens.is_finite() && record.tokens >= 0.0 => {
                BucketState::Fresh(record)
            }
            Some(record) => {
                warn!(key, tokens = record.tokens, "Discarding corrupt token bucket record");
                BucketState::Expired
            }
            None => BucketState::Expired,
        }
    }

    /// Balance after refilling from `last_refill_time` to `now_ms`, capped at capacity
    fn refill(&self, record: &UsageRecord, now_ms: u64) -> f64 {
        // A refill time ahead of `now` (clock skew) adds nothing.
        let elapsed_secs = now_ms.saturating_sub(record.last_refill_time) as f64 / 1000.0;
        (record.tokens + elapsed_secs * self.refill_rate).min(self.max_requests as f64)
    }

    /// Epoch millisecond at which a balance of `tokens` is back to capacity
    fn full_at(&self, tokens: f64, now_ms: u64) -> u64 {
        let missing = (self.max_requests as f64 - tokens).max(0.0);
        now_ms + (missing / self.refill_rate * 1000.0).ceil() as u64
    }

    fn secs_until_token(&self, tokens: f64) -> u64 {
        let missing = (1.0 - tokens).max(0.0);
        ((missing / self.refill_rate).ceil() as u64).max(1)
    }
}
