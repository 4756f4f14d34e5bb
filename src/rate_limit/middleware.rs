use super::clock::{Clock, SystemClock};
use super::service::RateLimiterService;
use super::store::QuotaStore;
use super::types::{RateLimitConfig, RateLimitKey, RateLimitResult};
use crate::error::Result;
use crate::metrics::record_rate_limit_exceeded;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use http::header::RETRY_AFTER;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Key used when a request carries no client identity
pub const DEFAULT_KEY: &str = "default";

/// Derives the rate limit key from a request
pub type KeyGenerator = Arc<dyn Fn(&Request) -> RateLimitKey + Send + Sync>;

/// Side effect invoked for every rejected request
pub type LimitReachedHandler = Arc<dyn Fn(&RateLimitKey, &RateLimitResult) + Send + Sync>;

/// Rate limiting middleware state
#[derive(Clone)]
pub struct RateLimitMiddleware {
    /// The rate limiter service
    service: Arc<RateLimiterService>,
    key_generator: KeyGenerator,
    on_limit_reached: Option<LimitReachedHandler>,
    clock: Arc<dyn Clock>,
}

/// Builder for [`RateLimitMiddleware`]
pub struct RateLimitMiddlewareBuilder {
    config: RateLimitConfig,
    key_generator: Option<KeyGenerator>,
    on_limit_reached: Option<LimitReachedHandler>,
    store: Option<Arc<dyn QuotaStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl RateLimitMiddlewareBuilder {
    /// Derive keys with `f` instead of the client address headers
    pub fn key_generator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> RateLimitKey + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(f));
        self
    }

    /// Call `f` whenever a request is rejected
    pub fn on_limit_reached<F>(mut self, f: F) -> Self
    where
        F: Fn(&RateLimitKey, &RateLimitResult) + Send + Sync + 'static,
    {
        self.on_limit_reached = Some(Arc::new(f));
        self
    }

    /// Use `store` instead of a fresh in-memory store
    pub fn store(mut self, store: Arc<dyn QuotaStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and build the middleware
    pub fn build(self) -> Result<RateLimitMiddleware> {
        let service = match self.store {
            Some(store) => RateLimiterService::with_store(self.config, store)?,
            None => RateLimiterService::new(self.config)?,
        };

        Ok(RateLimitMiddleware {
            service: Arc::new(service),
            key_generator: self
                .key_generator
                .unwrap_or_else(|| Arc::new(client_address_key)),
            on_limit_reached: self.on_limit_reached,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        })
    }
}

impl RateLimitMiddleware {
    /// Start building a middleware for `config`.
    ///
    /// With the sliding window strategy the per-key admission logs live in
    /// memory until [`RateLimiterService::prune_idle`] releases them. Call it
    /// periodically through [`service`](Self::service) when keys are unbounded.
    pub fn builder(config: RateLimitConfig) -> RateLimitMiddlewareBuilder {
        RateLimitMiddlewareBuilder {
            config,
            key_generator: None,
            on_limit_reached: None,
            store: None,
            clock: None,
        }
    }

    /// Create a middleware with default key derivation and an in-memory store
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn service(&self) -> &Arc<RateLimiterService> {
        &self.service
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Key the request is tracked under
    pub fn key_for(&self, request: &Request) -> RateLimitKey {
        (self.key_generator)(request)
    }

    /// Run the admission check for `key`.
    ///
    /// Returns the result on success, or the complete 429 response on denial.
    pub async fn apply(&self, key: RateLimitKey) -> std::result::Result<RateLimitResult, Response> {
        let result = self
            .service
            .check_rate_limit(&key, self.clock.now_ms())
            .await;

        if result.limited {
            warn!(key = %key, retry_after = ?result.retry_after, "Request rejected by rate limiter");
            record_rate_limit_exceeded(self.service.strategy().as_str());

            if let Some(handler) = &self.on_limit_reached {
                handler(&key, &result);
            }

            return Err(create_rate_limit_response(
                self.service.config().max_requests,
                &result,
            ));
        }

        debug!(key = %key, remaining = result.remaining, "Rate limit check passed");
        Ok(result)
    }
}

/// Default key derivation: forwarding headers, then the peer address, then a constant
pub fn client_address_key(request: &Request) -> RateLimitKey {
    let headers = request.headers();

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(ip) = forwarded.or_else(real_ip) {
        return RateLimitKey::from(ip);
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| RateLimitKey::new(ci.0.ip().to_string()))
        .unwrap_or_else(|| RateLimitKey::from(DEFAULT_KEY))
}

/// Create a 429 Too Many Requests response with rate limit headers
fn create_rate_limit_response(limit: u32, result: &RateLimitResult) -> Response {
    let retry_after = result.retry_after.unwrap_or(1);

    let body = Json(json!({
        "error": "Too Many Requests",
        "message": format!("Rate limit exceeded. Try again in {} seconds.", retry_after),
        "retryAfter": retry_after,
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    add_rate_limit_headers(response.headers_mut(), limit, result);
    response
}

/// Attach limit, remaining, reset and (when denied) retry-after headers
pub fn add_rate_limit_headers(headers: &mut HeaderMap, limit: u32, result: &RateLimitResult) {
    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(result.remaining));
    headers.insert(
        RATE_LIMIT_RESET_HEADER,
        HeaderValue::from(result.reset_time_secs()),
    );

    if let Some(retry) = result.retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from(retry));
    }
}

/// Axum middleware function for rate limiting
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimitMiddleware>,
    request: Request,
    next: Next,
) -> Response {
    // Body is not `Sync`, so the request must not be borrowed across the check.
    let key = limiter.key_for(&request);

    match limiter.apply(key).await {
        Ok(result) => {
            let mut response = next.run(request).await;
            add_rate_limit_headers(
                response.headers_mut(),
                limiter.service.config().max_requests,
                &result,
            );
            response
        }
        Err(response) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::clock::ManualClock;
    use crate::rate_limit::types::RateLimitStrategy;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request_with_headers(headers: &[(&str, &str)]) -> Request {
        let mut builder = http::Request::builder().uri("/api/test");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn config(max_requests: u32) -> RateLimitConfig {
        RateLimitConfig::new(RateLimitStrategy::SlidingWindow, max_requests, 1_000)
    }

    #[test]
    fn test_client_address_key() {
        let request = request_with_headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1")]);
        assert_eq!(client_address_key(&request).as_str(), "203.0.113.7");

        let request = request_with_headers(&[("x-real-ip", "198.51.100.2")]);
        assert_eq!(client_address_key(&request).as_str(), "198.51.100.2");

        let mut request = request_with_headers(&[]);
        request
            .extensions_mut()
            .insert(ConnectInfo("192.168.1.1:4000".parse::<SocketAddr>().unwrap()));
        assert_eq!(client_address_key(&request).as_str(), "192.168.1.1");

        let request = request_with_headers(&[("x-forwarded-for", " ")]);
        assert_eq!(client_address_key(&request).as_str(), DEFAULT_KEY);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(RateLimitMiddleware::new(config(0)).is_err());
    }

    #[tokio::test]
    async fn test_apply_denies_after_limit() {
        let clock = Arc::new(ManualClock::new(10_000));
        let limiter = RateLimitMiddleware::builder(config(2))
            .clock(clock.clone())
            .build()
            .unwrap();

        let request = request_with_headers(&[("x-forwarded-for", "203.0.113.7")]);
        let key = limiter.key_for(&request);
        assert_eq!(limiter.apply(key.clone()).await.unwrap().remaining, 1);
        assert_eq!(limiter.apply(key.clone()).await.unwrap().remaining, 0);

        let response = limiter.apply(key.clone()).await.unwrap_err();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        clock.advance(1_000);
        assert!(limiter.apply(key).await.is_ok());
    }

    #[tokio::test]
    async fn test_idle_keys_are_released_through_service() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimitMiddleware::builder(config(2))
            .clock(clock.clone())
            .build()
            .unwrap();

        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            let key = limiter.key_for(&request_with_headers(&[("x-forwarded-for", ip)]));
            assert!(limiter.apply(key).await.is_ok());
        }

        assert_eq!(limiter.service().prune_idle(clock.now_ms()), 0);

        clock.advance(1_000);
        assert_eq!(limiter.service().prune_idle(clock.now_ms()), 3);
        assert_eq!(limiter.service().prune_idle(clock.now_ms()), 0);
    }

    #[tokio::test]
    async fn test_custom_key_generator_and_callback() {
        let rejected = Arc::new(AtomicUsize::new(0));
        let counter = rejected.clone();

        let limiter = RateLimitMiddleware::builder(config(1))
            .key_generator(|req: &Request| {
                RateLimitKey::from(
                    req.headers()
                        .get("x-api-key")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("anonymous"),
                )
            })
            .on_limit_reached(move |key, result| {
                assert_eq!(key.as_str(), "key-1");
                assert!(result.limited);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .clock(Arc::new(ManualClock::new(0)))
            .build()
            .unwrap();

        let first = limiter.key_for(&request_with_headers(&[("x-api-key", "key-1")]));
        let second = limiter.key_for(&request_with_headers(&[("x-api-key", "key-2")]));

        assert!(limiter.apply(first.clone()).await.is_ok());
        assert!(limiter.apply(second).await.is_ok());
        assert!(limiter.apply(first).await.is_err());
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_response() {
        let result = RateLimitResult::denied(61_500, 30);
        let response = create_rate_limit_response(100, &result);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let headers = response.headers();
        assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "100");
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "0");
        assert_eq!(headers.get("X-RateLimit-Reset").unwrap(), "62");
        assert_eq!(headers.get("Retry-After").unwrap(), "30");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Too Many Requests");
        assert_eq!(json["retryAfter"], 30);
        assert!(json["message"].as_str().unwrap().contains("30"));
    }

    #[test]
    fn test_allowed_headers_have_no_retry_after() {
        let mut headers = HeaderMap::new();
        add_rate_limit_headers(&mut headers, 10, &RateLimitResult::allowed(7, 2_000));

        assert_eq!(headers.get(RATE_LIMIT_LIMIT_HEADER).unwrap(), "10");
        assert_eq!(headers.get(RATE_LIMIT_REMAINING_HEADER).unwrap(), "7");
        assert_eq!(headers.get(RATE_LIMIT_RESET_HEADER).unwrap(), "2");
        assert!(headers.get(RETRY_AFTER).is_none());
    }
}
