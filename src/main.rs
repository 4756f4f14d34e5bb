use quota_gate::{config::AppConfig, init_server, observability::init_tracing};
use std::env;
use std::process;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/quota-gate.yaml".to_string());

    // Load configuration
    let config = match AppConfig::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", config_path, e);
            eprintln!("Usage: quota-gate [config_file]");
            process::exit(1);
        }
    };

    init_tracing(&config.logging)?;

    init_server(config).await?;
    Ok(())
}
