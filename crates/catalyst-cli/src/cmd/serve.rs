use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use catalyst_automation::{AutomationService, Stores};
use catalyst_core::{Bus, ServiceConfig};
use catalyst_sandbox::{CancellationToken, ContainerRuntime, DockerEngine};
use tracing::{info, warn};

/// Upper bound on waiting for cancelled jobs to clean up their containers.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub fn run(config: &ServiceConfig) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(config))
}

async fn serve(config: &ServiceConfig) -> anyhow::Result<()> {
    let bus = Arc::new(Bus::new(&config.bus));
    let db = super::open_db(config)?.with_bus(Arc::clone(&bus));
    let engine = DockerEngine::connect().context("connecting to docker")?;
    let runtime = ContainerRuntime::new(Arc::new(engine), config.network.clone(), config.timeouts.clone());

    let service = AutomationService::start(
        Arc::clone(&bus),
        Stores::shared(db.clone()),
        Arc::new(runtime),
        config,
        CancellationToken::new(),
    );
    info!(db = %config.db_path.display(), "serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    service.shutdown();

    if !service.drain(DRAIN_TIMEOUT).await {
        warn!(
            running = service.coordinator.in_flight(),
            "stopping with jobs still running"
        );
    }
    info!("stopped");
    Ok(())
}
