use crate::error::{RateLimitError, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header::CONTENT_TYPE, Response, StatusCode},
    response::IntoResponse,
};
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the global Prometheus recorder. Fails if a recorder is already installed.
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            RateLimitError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Register all metrics with descriptions
    fn register_metrics() {
        describe_counter!(
            "quota_gate_checks_total",
            "Total number of admission checks, by strategy and outcome"
        );
        describe_counter!(
            "quota_gate_rate_limit_exceeded_total",
            "Total number of requests rejected with 429"
        );
        describe_counter!(
            "quota_gate_store_swept_total",
            "Total number of expired quota records removed by the sweep"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Get the Prometheus metrics handle
    pub fn handle(&self) -> Arc<PrometheusHandle> {
        self.handle.clone()
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    let mut response = Response::new(Body::from(service.render()));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        CONTENT_TYPE,
        axum::http::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

/// Record the outcome of an admission check
pub fn record_rate_limit_check(strategy: &str, limited: bool) {
    let labels = [
        ("strategy", strategy.to_string()),
        (
            "outcome",
            if limited { "limited" } else { "allowed" }.to_string(),
        ),
    ];
    counter!("quota_gate_checks_total", &labels).increment(1);
}

/// Record a request rejected by the middleware
pub fn record_rate_limit_exceeded(strategy: &str) {
    let labels = [("strategy", strategy.to_string())];
    counter!("quota_gate_rate_limit_exceeded_total", &labels).increment(1);
}

/// Record expired records removed by a store sweep
pub fn record_store_swept(removed: usize) {
    counter!("quota_gate_store_swept_total").increment(removed as u64);
}
