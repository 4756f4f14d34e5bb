pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod rate_limit;

use crate::config::AppConfig;
use crate::error::{RateLimitError, Result};
use crate::metrics::{metrics_handler, MetricsService};
use crate::rate_limit::{
    rate_limit_middleware, Clock, MemoryStore, RateLimitMiddleware, SystemClock,
};
use axum::{
    http::Uri,
    middleware,
    routing::get,
    Json, Router as AxumRouter,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Build the HTTP app: every path goes through the limiter, `/metrics` does not
pub fn build_router(limiter: RateLimitMiddleware, metrics: Option<MetricsService>) -> AxumRouter {
    let mut app = AxumRouter::new()
        .fallback(accepted_handler)
        .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));

    if let Some(metrics) = metrics {
        app = app.route("/metrics", get(metrics_handler).with_state(metrics));
    }

    app.layer(TraceLayer::new_for_http())
}

async fn accepted_handler(uri: Uri) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "path": uri.path(),
    }))
}

/// Initialize the rate limiting server
pub async fn init_server(config: AppConfig) -> Result<()> {
    // Validate configuration
    config.validate()?;

    info!("Starting quota gate");
    info!(
        "Server listening on {}:{}",
        config.server.host, config.server.port
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::with_config(config.store.clone(), clock.clone()));

    let limiter = RateLimitMiddleware::builder(config.rate_limit.clone())
        .store(store.clone())
        .clock(clock.clone())
        .on_limit_reached(|key, result| {
            info!(key = %key, reset_time = result.reset_time, "Client reached its quota");
        })
        .build()?;

    let metrics = if config.server.metrics {
        Some(MetricsService::new()?)
    } else {
        None
    };

    // Sliding window logs live outside the store and are pruned on the same cadence.
    let service = limiter.service().clone();
    let prune_every = Duration::from_millis(config.store.sweep_interval_ms.max(1_000));
    let maintenance = tokio::spawn(async move {
        let mut prune_interval = tokio::time::interval(prune_every);
        loop {
            prune_interval.tick().await;
            let pruned = service.prune_idle(clock.now_ms());
            if pruned > 0 {
                debug!(pruned, "Pruned idle sliding window logs");
            }
        }
    });

    let app = build_router(limiter, metrics);

    // Bind and serve
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(RateLimitError::Io)?;

    info!("Ready to accept connections");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    maintenance.abort();
    store.destroy();

    served.map_err(|e| RateLimitError::Internal(format!("Server error: {}", e)))?;

    info!("Quota gate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
