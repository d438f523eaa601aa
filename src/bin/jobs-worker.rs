//! Runs the job workers and retention sweepers until Ctrl-C.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use starter_jobs::config::{Config, load_dotenv};
use starter_jobs::retention::spawn_sweepers;
use starter_jobs::telemetry::init_tracing;
use starter_jobs::{JobClient, Services};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `RUST_LOG` may come from `.env`, and config parsing logs through the subscriber.
    load_dotenv();
    init_tracing();
    let config = Config::from_env();

    let services = Services::development(&config.exports.dir);
    let storage = services.storage.clone();

    let client = JobClient::initialize(&config.jobs, services)
        .await
        .context("failed to initialize background jobs")?;
    client.start().await;

    // The sweepers share the job pool, or get a small one of their own.
    let pool = match client.pool() {
        Some(pool) => pool,
        None => PgPoolOptions::new()
            .max_connections(2)
            .connect(&config.jobs.database_url)
            .await
            .context("failed to connect to the database")?,
    };

    let shutdown = CancellationToken::new();
    let sweepers = spawn_sweepers(&config, pool.clone(), storage, &shutdown);

    info!("Worker running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down…");

    shutdown.cancel();
    for sweeper in sweepers {
        if let Err(error) = sweeper.await {
            warn!(%error, "Sweeper task panicked");
        }
    }
    client.stop().await;
    pool.close().await;

    Ok(())
}
