use std::sync::Arc;
use std::time::Duration;

use cowork_core::SystemClock;
use cowork_db::PgStore;
use cowork_worker::{Sweeper, WorkerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cowork_worker=debug,cowork_collab=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env().expect("Invalid worker configuration");

    let pool = cowork_db::create_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    cowork_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    cowork_db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    tracing::info!("Database ready");

    let sweeper = Sweeper::new(
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(SystemClock),
        config.collab.presence_span(),
    );

    let cancel = CancellationToken::new();
    let sweeper_handle = tokio::spawn(sweeper.run(config.sweep_interval, cancel.clone()));

    cowork_collab::termination_signal().await;
    tracing::info!("Shutdown signal received");

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), sweeper_handle).await;
    pool.close().await;

    tracing::info!("Worker stopped");
}
