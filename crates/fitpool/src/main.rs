use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use fitpool::telemetry::{init_telemetry, TelemetryConfig};
use fitpool::{
    Backend, DistributedTransport, PoolConfig, PoolScheduler, ProcessPoolTransport, Transport,
    WorkerId,
};
use parking_lot::Mutex;

mod demo;

use demo::{GridCoordinator, LineEngine};

const MAP_WIDTH: usize = 24;
const MAP_HEIGHT: usize = 16;
const POINTS_PER_PIXEL: usize = 32;

#[tokio::main]
async fn main() -> Result<()> {
    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "fitpool=info")
    // - FITPOOL_*: Pool settings, see PoolConfig::from_env
    init_telemetry(TelemetryConfig::from_env().with_thread_names(true));

    let config = PoolConfig::from_env().context("Invalid pool configuration")?;
    tracing::info!(
        backend = %config.backend,
        workers = config.num_workers,
        timeout = ?config.timeout,
        "fitpool starting"
    );

    let coordinator = Arc::new(Mutex::new(GridCoordinator::new(
        MAP_WIDTH,
        MAP_HEIGHT,
        POINTS_PER_PIXEL,
        42,
    )));
    let engine = |_: WorkerId| LineEngine::default();

    match config.backend {
        Backend::ProcessPool => {
            let transport = ProcessPoolTransport::new(&config, engine);
            drive(PoolScheduler::new(transport, config), &coordinator).await?;
        }
        Backend::Distributed => {
            let transport = DistributedTransport::local(&config, engine);
            drive(PoolScheduler::new(transport, config), &coordinator).await?;
        }
    }

    let c = coordinator.lock();
    tracing::info!(
        fitted = c.fitted_count(),
        good = c.good_count(),
        audited = c.audit().len(),
        total = MAP_WIDTH * MAP_HEIGHT,
        "Map summary"
    );
    Ok(())
}

async fn drive<T: Transport>(
    mut pool: PoolScheduler<T>,
    coordinator: &Arc<Mutex<GridCoordinator>>,
) -> Result<()> {
    pool.prepare(coordinator.clone())
        .await
        .context("Failed to prepare workers")?;
    pool.ping_workers(None).await?;
    for worker in pool.transport().worker_ids() {
        tracing::info!(
            worker = %worker,
            pid = ?pool.pings().pid(worker),
            round_trip = ?pool.pings().round_trip(worker),
            "Worker health"
        );
    }

    let started = Instant::now();
    tokio::select! {
        _ = pool.run() => {
            tracing::info!(elapsed = ?started.elapsed(), "Dispatch loop finished");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    pool.stop().await.context("Failed to stop workers")?;
    Ok(())
}
