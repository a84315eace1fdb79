pub mod check;
pub mod simulate;

use anyhow::{Context, Result};
use service_discovery::DiscoveryConfig;
use std::path::Path;
use tracing::Level;

/// Load the configuration and install the log subscriber it asks for
pub async fn load(config_path: &Path, verbose: bool) -> Result<DiscoveryConfig> {
    let config = DiscoveryConfig::from_file(config_path)
        .await
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    tracing_subscriber::fmt()
        .with_max_level(log_level(&config.log.level, verbose))
        .with_target(false)
        .init();
    Ok(config)
}

fn log_level(configured: &str, verbose: bool) -> Level {
    if verbose {
        return Level::DEBUG;
    }
    configured.parse().unwrap_or(Level::INFO)
}
