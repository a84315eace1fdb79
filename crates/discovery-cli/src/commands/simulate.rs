use anyhow::{Context, Result};
use service_discovery::{Discovery, ResolvedService, backend::memory::MemoryCoordinator};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub async fn run(config_path: &Path, verbose: bool, duration: u64, interval: u64) -> Result<()> {
    let config = super::load(config_path, verbose).await?;
    let app = config.app_name.clone();

    let cluster = MemoryCoordinator::new();
    let discovery = Discovery::new(Arc::new(cluster.connector()), config)?;

    let registrar = discovery
        .register_configured()
        .await
        .context("Failed to register configured instance")?;
    if registrar.is_none() {
        info!("[{}] No instance configured for registration", app);
    }

    let mut services: Vec<ResolvedService> = Vec::new();
    let domains: Vec<String> = discovery.config().domains.keys().cloned().collect();
    for domain in domains {
        let service = discovery
            .resolve(&domain)
            .await
            .with_context(|| format!("Failed to resolve domain '{}'", domain))?;
        services.push(service);
    }

    let deadline = Instant::now() + Duration::from_secs(duration);
    while Instant::now() < deadline {
        for service in &services {
            match service.pick() {
                Some(entry) => info!(
                    "[{}] {} -> {} (version {}, weight {}, {} live)",
                    app,
                    service.domain(),
                    entry.address,
                    entry.version,
                    entry.weight,
                    service.addresses().len()
                ),
                None => warn!("[{}] {} has no live addresses", app, service.domain()),
            }
        }
        smol::Timer::after(Duration::from_secs(interval.max(1))).await;
    }

    for service in &services {
        service.close().await;
    }
    if let Some(registrar) = registrar {
        registrar.close().await?;
    }
    info!("[{}] Simulation finished", app);
    Ok(())
}
