//! Rate limiting module
//!
//! In-process admission control with two algorithms:
//!
//! - **Token Bucket**: continuous refill with an initial burst up to capacity
//! - **Sliding Window**: exact count of admissions in the trailing window
//!
//! # Features
//!
//! - Pluggable [`QuotaStore`] with lazy expiry and a cancelable background sweep
//! - Per-key serialization of read-modify-write checks
//! - Rate limit headers in responses (`X-RateLimit-*`, `Retry-After`)
//! - Custom key derivation and denial callbacks
//!
//! # Example
//!
//! ```rust,no_run
//! use quota_gate::rate_limit::{RateLimitConfig, RateLimitKey, RateLimitStrategy, RateLimiterService};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RateLimitConfig::new(RateLimitStrategy::TokenBucket, 100, 60_000);
//!     let service = RateLimiterService::new(config).unwrap();
//!
//!     let result = service
//!         .check_rate_limit(&RateLimitKey::from("203.0.113.7"), 0)
//!         .await;
//!     assert!(!result.limited);
//! }
//! ```

pub mod clock;
pub mod lock;
pub mod middleware;
pub mod service;
pub mod sliding_window;
pub mod store;
pub mod token_bucket;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use middleware::{
    add_rate_limit_headers, client_address_key, rate_limit_middleware, RateLimitMiddleware,
};
pub use service::RateLimiterService;
pub use sliding_window::SlidingWindowLimiter;
pub use store::{MemoryStore, MemoryStoreConfig, QuotaStore};
pub use token_bucket::TokenBucketLimiter;
pub use types::{RateLimitConfig, RateLimitKey, RateLimitResult, RateLimitStrategy, UsageRecord};
