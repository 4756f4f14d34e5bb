use crate::error::{RateLimitError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Admission algorithm selector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitStrategy {
    /// Continuous refill up to a fixed capacity
    #[serde(alias = "token_bucket")]
    TokenBucket,
    /// Exact count of admissions in the trailing window
    #[serde(alias = "sliding_window")]
    SlidingWindow,
}

impl RateLimitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitStrategy::TokenBucket => "token-bucket",
            RateLimitStrategy::SlidingWindow => "sliding-window",
        }
    }
}

impl fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitStrategy {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "token-bucket" | "token_bucket" => Ok(RateLimitStrategy::TokenBucket),
            "sliding-window" | "sliding_window" => Ok(RateLimitStrategy::SlidingWindow),
            other => Err(RateLimitError::InvalidStrategy(other.to_string())),
        }
    }
}

fn default_strategy() -> RateLimitStrategy {
    RateLimitStrategy::SlidingWindow
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Algorithm used for admission checks
    #[serde(default = "default_strategy")]
    pub strategy: RateLimitStrategy,
    /// Capacity per window
    pub max_requests: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn new(strategy: RateLimitStrategy, max_requests: u32, window_ms: u64) -> Self {
        Self {
            strategy,
            max_requests,
            window_ms,
        }
    }

    /// Reject configurations that cannot admit anything
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(RateLimitError::Config(
                "max_requests must be > 0".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(RateLimitError::Config("window_ms must be > 0".to_string()));
        }
        Ok(())
    }

    /// Get the window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Tokens regenerated per second by the token bucket
    pub fn refill_rate_per_sec(&self) -> f64 {
        self.max_requests as f64 / (self.window_ms as f64 / 1000.0)
    }
}

/// Identity under which quota is tracked.
///
/// Keys are opaque and compared by exact, case-sensitive string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RateLimitKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RateLimitKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-key usage held by a quota store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    /// Checks counted since the record was initialized
    pub count: u64,
    /// Epoch milliseconds after which the record is stale
    pub reset_time: u64,
    /// Token balance (token bucket only)
    #[serde(default)]
    pub tokens: f64,
    /// Epoch milliseconds of the last token recomputation (token bucket only)
    #[serde(default)]
    pub last_refill_time: u64,
}

impl UsageRecord {
    /// Counting record with no token state, as written by the sliding window
    pub fn counter(count: u64, reset_time: u64) -> Self {
        Self {
            count,
            reset_time,
            tokens: 0.0,
            last_refill_time: 0,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.reset_time < now_ms
    }
}

/// Outcome of one admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request was rejected
    pub limited: bool,
    /// Capacity left in the current window
    pub remaining: u32,
    /// Epoch milliseconds at which capacity replenishes
    pub reset_time: u64,
    /// Seconds to wait before retrying, only set when limited
    pub retry_after: Option<u64>,
}

impl RateLimitResult {
    /// Create an allowed result
    pub fn allowed(remaining: u32, reset_time: u64) -> Self {
        Self {
            limited: false,
            remaining,
            reset_time,
            retry_after: None,
        }
    }

    /// Create a denied result. `retry_after` is floored at one second.
    pub fn denied(reset_time: u64, retry_after: u64) -> Self {
        Self {
            limited: true,
            remaining: 0,
            reset_time,
            retry_after: Some(retry_after.max(1)),
        }
    }

    /// Reset time as whole epoch seconds, rounded up
    pub fn reset_time_secs(&self) -> u64 {
        self.reset_time.div_ceil(1000)
    }
}

/// Milliseconds to whole seconds, rounded up and never below one
pub(crate) fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "token-bucket".parse::<RateLimitStrategy>().unwrap(),
            RateLimitStrategy::TokenBucket
        );
        assert_eq!(
            "sliding_window".parse::<RateLimitStrategy>().unwrap(),
            RateLimitStrategy::SlidingWindow
        );
        assert!(matches!(
            "leaky-bucket".parse::<RateLimitStrategy>(),
            Err(RateLimitError::InvalidStrategy(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        let config = RateLimitConfig::new(RateLimitStrategy::TokenBucket, 10, 1000);
        assert!(config.validate().is_ok());
        assert_eq!(config.window(), Duration::from_secs(1));
        assert_eq!(config.refill_rate_per_sec(), 10.0);

        assert!(RateLimitConfig::new(RateLimitStrategy::TokenBucket, 0, 1000)
            .validate()
            .is_err());
        assert!(RateLimitConfig::new(RateLimitStrategy::SlidingWindow, 10, 0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_deserialize() {
        let config: RateLimitConfig = serde_yaml::from_str(
            "strategy: token-bucket\nmax_requests: 5\nwindow_ms: 2000\n",
        )
        .unwrap();
        assert_eq!(config.strategy, RateLimitStrategy::TokenBucket);
        assert_eq!(config.max_requests, 5);
        assert_eq!(config.refill_rate_per_sec(), 2.5);

        let config: RateLimitConfig =
            serde_yaml::from_str("max_requests: 5\nwindow_ms: 2000\n").unwrap();
        assert_eq!(config.strategy, RateLimitStrategy::SlidingWindow);

        let err = serde_yaml::from_str::<RateLimitConfig>(
            "strategy: fixed-window\nmax_requests: 5\nwindow_ms: 2000\n",
        );
        assert!(err.is_err());

        let err = serde_yaml::from_str::<RateLimitConfig>("max_requests: -1\nwindow_ms: 2000\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        assert_ne!(RateLimitKey::from("Client"), RateLimitKey::from("client"));
        assert_eq!(RateLimitKey::from("client").to_string(), "client");
    }

    #[test]
    fn test_rate_limit_result() {
        let allowed = RateLimitResult::allowed(4, 1_500);
        assert!(!allowed.limited);
        assert_eq!(allowed.remaining, 4);
        assert_eq!(allowed.retry_after, None);
        assert_eq!(allowed.reset_time_secs(), 2);

        let denied = RateLimitResult::denied(2_000, 0);
        assert!(denied.limited);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Some(1));
        assert_eq!(denied.reset_time_secs(), 2);
    }

    #[test]
    fn test_usage_record_expiry() {
        let record = UsageRecord::counter(3, 1_000);
        assert!(!record.is_expired(1_000));
        assert!(record.is_expired(1_001));
    }

    #[test]
    fn test_usage_record_serializes_camel_case() {
        let json = serde_json::to_value(UsageRecord::counter(2, 10)).unwrap();
        assert_eq!(json["resetTime"], 10);
        assert_eq!(json["lastRefillTime"], 0);
    }
}
