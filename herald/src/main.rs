use herald::broker::Broker;
use herald::config::EngineConfig;
use herald::services::ServiceContainer;
use herald::{database, logging};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load()?;

    // Hold the guard so the file appender flushes on exit.
    let (logging_config, _log_guard) = logging::init_logging(config.log_dir.as_deref())?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let broker = Broker::connect(config.broker.clone()).await?;
    let container = ServiceContainer::with_broker(&config, pool, broker);
    container.initialize().await?;
    logging_config.start_retention_cleanup(container.cancellation_token());

    info!(
        workers = config.dispatcher.workers,
        max_attempts = config.retry.max_attempts,
        "herald started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Err(e) = container.shutdown().await {
        error!(error = %e, "Shutdown failed");
    }
    Ok(())
}
