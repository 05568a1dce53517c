use clap::Parser;
use prometheus::Registry;
use std::path::PathBuf;
use std::sync::Arc;

use strata::config::{Config, init_tracing};
use strata::{AvmMetrics, AvmRepository, AvmService, OrphanReaper};

#[derive(Parser)]
#[command(name = "strata")]
#[command(version, about = "Versioned, layered virtual filesystem", long_about = None)]
struct Args {
    /// Configuration file. Defaults to ./strata.toml when present
    #[arg(short, long, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Store to create on startup if it does not exist yet
    #[arg(long, default_value = "main")]
    default_store: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    init_tracing(&config.logging)?;

    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(AvmMetrics::new(registry.clone())?);
    let repo = AvmRepository::builder(config.clone()).metrics(metrics).build();
    let service = AvmService::new(repo.clone());

    if service.get_store(&args.default_store).await.is_err() {
        service.create_store(&args.default_store).await?;
    }
    tracing::info!(
        stores = service.get_stores().await?.len(),
        principal = service.principal(),
        "Starting strata"
    );

    let reaper = OrphanReaper::new(repo, config.reaper.clone());
    if config.reaper.enabled {
        reaper.start();
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received interrupt, shutting down");
    reaper.stop().await;
    tracing::info!(metric_families = registry.gather().len(), "Stopped");
    Ok(())
}
