//! Video library service.
//!
//! Connects to Postgres, migrates, seeds, and runs the view counter daemon
//! until Ctrl-C.

use anyhow::Context;
use eventline_core::environment::SystemClock;
use eventline_postgres::PostgresEventStore;
use eventline_projections::{PostgresProjectionStore, ProjectionDaemon};
use eventline_videos::{
    Config, GLOBAL_VIDEO_COUNTER, GlobalVideoCounterProjection, SeedData, VideoLibrary, seed,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eventline_videos=info,eventline_projections=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        max_connections = config.max_connections,
        batch_size = config.daemon.batch_size,
        seed_on_startup = config.seed_on_startup,
        "Configuration loaded"
    );

    let event_store = Arc::new(
        PostgresEventStore::connect(&config.database_url, config.max_connections)
            .await
            .context("Failed to connect to the event store")?,
    );
    event_store.migrate().await.context("Event store migrations failed")?;

    let projections = Arc::new(PostgresProjectionStore::from_pool(event_store.pool().clone()));
    projections.migrate().await.context("Projection migrations failed")?;
    info!("Database ready");

    let library = VideoLibrary::new(
        event_store.clone(),
        Arc::clone(&projections),
        Arc::new(SystemClock),
    );
    if config.seed_on_startup {
        seed(&library, &SeedData::default())
            .await
            .context("Failed to load seed data")?;
    }

    let lease = projections
        .acquire_lease(GLOBAL_VIDEO_COUNTER)
        .await
        .context("View counter is already running in another process")?;

    let daemon = ProjectionDaemon::new(
        GlobalVideoCounterProjection,
        event_store.clone(),
        Arc::clone(&projections),
        config.daemon,
    );
    info!(lag = daemon.lag().await?, "Starting view counter");
    let handle = daemon.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    handle.shutdown().await?;
    lease.release().await?;

    let counter = library.global_counter().await?;
    info!(total_video_views = counter.total_video_views, "Stopped");
    Ok(())
}
