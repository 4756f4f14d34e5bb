use super::sliding_window::SlidingWindowLimiter;
use super::store::{MemoryStore, QuotaStore};
use super::token_bucket::TokenBucketLimiter;
use super::types::{RateLimitConfig, RateLimitKey, RateLimitResult, RateLimitStrategy};
use crate::error::Result;
use crate::metrics::record_rate_limit_check;
use std::sync::Arc;
use tracing::info;

/// Limiter selected by the configured strategy
enum Limiter {
    TokenBucket(TokenBucketLimiter),
    SlidingWindow(SlidingWindowLimiter),
}

/// Rate limiter service: one configured algorithm over one quota store
pub struct RateLimiterService {
    config: RateLimitConfig,
    limiter: Limiter,
    store: Arc<dyn QuotaStore>,
}

impl RateLimiterService {
    /// Create a service backed by a fresh in-memory store
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Create a service over an existing store. Fails on invalid configuration.
    pub fn with_store(config: RateLimitConfig, store: Arc<dyn QuotaStore>) -> Result<Self> {
        config.validate()?;

        let limiter = match config.strategy {
            RateLimitStrategy::TokenBucket => {
                Limiter::TokenBucket(TokenBucketLimiter::new(&config, store.clone())?)
            }
            RateLimitStrategy::SlidingWindow => {
                Limiter::SlidingWindow(SlidingWindowLimiter::new(&config, store.clone())?)
            }
        };

        info!(
            strategy = %config.strategy,
            max_requests = config.max_requests,
            window_ms = config.window_ms,
            "Initializing rate limiter"
        );

        Ok(Self {
            config,
            limiter,
            store,
        })
    }

    /// Check if a request for `key` at `now_ms` is admitted
    pub async fn check_rate_limit(&self, key: &RateLimitKey, now_ms: u64) -> RateLimitResult {
        let result = match &self.limiter {
            Limiter::TokenBucket(limiter) => limiter.check_limit(key.as_str(), now_ms).await,
            Limiter::SlidingWindow(limiter) => limiter.check_limit(key.as_str(), now_ms).await,
        };

        record_rate_limit_check(self.config.strategy.as_str(), result.limited);
        result
    }

    /// Capacity left for `key` without consuming any
    pub async fn remaining(&self, key: &RateLimitKey, now_ms: u64) -> u32 {
        match &self.limiter {
            Limiter::TokenBucket(limiter) => limiter.peek_remaining(key.as_str(), now_ms).await,
            Limiter::SlidingWindow(limiter) => limiter.get_remaining(key.as_str(), now_ms),
        }
    }

    /// Forget all usage for `key`
    pub async fn reset(&self, key: &RateLimitKey) {
        if let Limiter::SlidingWindow(limiter) = &self.limiter {
            limiter.reset_key(key.as_str());
        }
        self.store.reset(key.as_str()).await;
    }

    /// Forget all usage for every key
    pub async fn clear(&self) {
        if let Limiter::SlidingWindow(limiter) = &self.limiter {
            limiter.clear_memory();
        }
        self.store.clear().await;
    }

    /// Release in-process state for keys idle at `now_ms`
    pub fn prune_idle(&self, now_ms: u64) -> usize {
        match &self.limiter {
            Limiter::TokenBucket(_) => 0,
            Limiter::SlidingWindow(limiter) => limiter.prune_idle(now_ms),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn strategy(&self) -> RateLimitStrategy {
        self.config.strategy
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RateLimitError;

    fn key(s: &str) -> RateLimitKey {
        RateLimitKey::from(s)
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let zero_requests = RateLimitConfig::new(RateLimitStrategy::TokenBucket, 0, 1_000);
        assert!(matches!(
            RateLimiterService::new(zero_requests),
            Err(RateLimitError::Config(_))
        ));

        let zero_window = RateLimitConfig::new(RateLimitStrategy::SlidingWindow, 10, 0);
        assert!(matches!(
            RateLimiterService::new(zero_window),
            Err(RateLimitError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_selects_strategy() {
        let service = RateLimiterService::new(RateLimitConfig::new(
            RateLimitStrategy::TokenBucket,
            5,
            1_000,
        ))
        .unwrap();
        assert_eq!(service.strategy(), RateLimitStrategy::TokenBucket);

        let service = RateLimiterService::new(RateLimitConfig::new(
            RateLimitStrategy::SlidingWindow,
            5,
            1_000,
        ))
        .unwrap();
        assert_eq!(service.strategy(), RateLimitStrategy::SlidingWindow);
    }

    #[tokio::test]
    async fn test_token_bucket_scenario() {
        let service = RateLimiterService::new(RateLimitConfig::new(
            RateLimitStrategy::TokenBucket,
            5,
            1_000,
        ))
        .unwrap();
        let client = key("10.0.0.1");

        let first = service.check_rate_limit(&client, 0).await;
        assert!(!first.limited);
        assert_eq!(first.remaining, 4);

        for _ in 0..4 {
            assert!(!service.check_rate_limit(&client, 0).await.limited);
        }

        let sixth = service.check_rate_limit(&client, 0).await;
        assert!(sixth.limited);
        assert!(sixth.retry_after.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_reset_behaves_as_never_seen() {
        for strategy in [RateLimitStrategy::TokenBucket, RateLimitStrategy::SlidingWindow] {
            let service =
                RateLimiterService::new(RateLimitConfig::new(strategy, 2, 1_000)).unwrap();
            let client = key("client");

            service.check_rate_limit(&client, 0).await;
            service.check_rate_limit(&client, 0).await;
            assert!(service.check_rate_limit(&client, 0).await.limited);

            service.reset(&client).await;

            let after_reset = service.check_rate_limit(&client, 0).await;
            let never_seen = service.check_rate_limit(&key("fresh"), 0).await;
            assert_eq!(after_reset, never_seen, "strategy {}", strategy);
        }
    }

    #[tokio::test]
    async fn test_clear_resets_every_key() {
        for strategy in [RateLimitStrategy::TokenBucket, RateLimitStrategy::SlidingWindow] {
            let service =
                RateLimiterService::new(RateLimitConfig::new(strategy, 1, 60_000)).unwrap();

            for name in ["a", "b", "c"] {
                service.check_rate_limit(&key(name), 0).await;
                assert!(service.check_rate_limit(&key(name), 0).await.limited);
            }

            service.clear().await;

            for name in ["a", "b", "c"] {
                let result = service.check_rate_limit(&key(name), 0).await;
                assert!(!result.limited, "strategy {} key {}", strategy, name);
                assert_eq!(result.remaining, 0);
            }
        }
    }

    #[tokio::test]
    async fn test_remaining_matches_checks() {
        for strategy in [RateLimitStrategy::TokenBucket, RateLimitStrategy::SlidingWindow] {
            let service =
                RateLimiterService::new(RateLimitConfig::new(strategy, 3, 60_000)).unwrap();
            let client = key("client");

            assert_eq!(service.remaining(&client, 0).await, 3);
            service.check_rate_limit(&client, 0).await;
            assert_eq!(service.remaining(&client, 0).await, 2);
        }
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        for strategy in [RateLimitStrategy::TokenBucket, RateLimitStrategy::SlidingWindow] {
            let service =
                RateLimiterService::new(RateLimitConfig::new(strategy, 3, 60_000)).unwrap();
            let a = key("a");
            let b = key("b");

            for _ in 0..3 {
                service.check_rate_limit(&a, 0).await;
            }
            assert!(service.check_rate_limit(&a, 0).await.limited);

            assert_eq!(service.remaining(&b, 0).await, 3);
            assert_eq!(service.check_rate_limit(&b, 0).await.remaining, 2);
        }
    }

    #[tokio::test]
    async fn test_shared_store() {
        let store: Arc<dyn QuotaStore> = Arc::new(MemoryStore::new());
        let service = RateLimiterService::with_store(
            RateLimitConfig::new(RateLimitStrategy::SlidingWindow, 3, 1_000),
            store.clone(),
        )
        .unwrap();

        service.check_rate_limit(&key("client"), 0).await;
        assert_eq!(store.get("client", 0).await.unwrap().count, 1);
        assert!(Arc::ptr_eq(service.store(), &store));
    }

    #[tokio::test]
    async fn test_prune_idle() {
        let service = RateLimiterService::new(RateLimitConfig::new(
            RateLimitStrategy::SlidingWindow,
            3,
            1_000,
        ))
        .unwrap();

        service.check_rate_limit(&key("client"), 0).await;
        assert_eq!(service.prune_idle(500), 0);
        assert_eq!(service.prune_idle(1_000), 1);
    }
}
