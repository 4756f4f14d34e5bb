use crate::config::{LogFormat, LoggingConfig};
use crate::error::{RateLimitError, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor the config provides one
pub const DEFAULT_FILTER: &str = "quota_gate=debug,tower_http=debug";

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        config
            .filter
            .as_deref()
            .unwrap_or(DEFAULT_FILTER)
            .into()
    })
}

/// Initialize tracing/logging.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(false);

    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    installed
        .map_err(|e| RateLimitError::Internal(format!("Failed to initialize tracing: {}", e)))?;

    info!(format = ?config.format, "Tracing initialized");
    Ok(())
}
