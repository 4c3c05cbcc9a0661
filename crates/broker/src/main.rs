mod config;

use std::sync::Arc;

use anyhow::Result;
use conductor_engine::operation::{InMemoryOperationStore, OperationExecutor};
use conductor_engine::timer::UnavailableExpressionEvaluator;
use conductor_engine::{CommandGateway, InMemoryRecordLog, Partition, SystemClock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::BrokerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor_broker=info,conductor_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("conductor-broker starting...");

    let config = BrokerConfig::from_env();
    tracing::info!(
        partition_id = config.partition.partition_id,
        max_batch_size = config.scheduler.max_batch_size,
        idle_backoff_ms = config.scheduler.idle_backoff.as_millis() as u64,
        batch_operation_max_size = config.operations.batch_operation_max_size,
        "Broker configured"
    );

    let clock = Arc::new(SystemClock);
    let partition = Arc::new(
        Partition::open(
            Arc::new(InMemoryRecordLog::new()),
            clock.clone(),
            Arc::new(UnavailableExpressionEvaluator),
            config.partition.clone(),
        )
        .await?,
    );

    let gateway = Arc::new(CommandGateway::new(
        partition.clone(),
        config.request_stream_id,
    ));
    let executor = Arc::new(
        OperationExecutor::new(
            Arc::new(InMemoryOperationStore::new()),
            partition.clone(),
            gateway,
            clock,
            config.operations.clone(),
        )
        .with_batch_size(config.scheduler.max_batch_size),
    );

    let partition_scheduler = partition.scheduler(config.scheduler.clone());
    let operation_scheduler = executor.scheduler(config.scheduler.clone());
    partition_scheduler.start()?;
    operation_scheduler.start()?;

    tracing::info!("Broker ready, waiting for shutdown signal...");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown signal received, stopping schedulers");
    operation_scheduler.stop().await;
    partition_scheduler.stop().await;

    tracing::info!("Broker shutdown complete");
    Ok(())
}
