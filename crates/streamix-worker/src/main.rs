//! Sync worker binary.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use streamix_models::Priority;
use streamix_queue::{ExecutionMode, JobStore, MessageBroker, PgJobStore, RedisBroker};
use streamix_worker::health::{self, HealthRegistry};
use streamix_worker::retry::retry_async;
use streamix_worker::{
    Backoff, Component, ConsumerPipeline, Dispatcher, FallbackSettings, FallbackWorker,
    HandlerTable, HttpSyncHandler, PipelineSettings, Supervisor, WorkerConfig, WorkerError,
    WorkerResult,
};

const CONNECT_RETRIES: u32 = 5;

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS to Redis and Postgres)
    let _ = rustls::crypto::ring::default_provider().install_default();

    dotenvy::dotenv().ok();

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("streamix=info,info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }

    info!("Starting streamix-worker");

    let config = WorkerConfig::from_env();
    info!(
        worker_id = %config.worker_id,
        mode = config.queue.mode.as_str(),
        "Worker config: {:?}",
        config
    );

    if let Err(e) = run(config).await {
        error!("Worker failed: {}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}

async fn run(config: WorkerConfig) -> WorkerResult<()> {
    let metrics_handle = streamix_worker::metrics::init_metrics()?;
    let registry = HealthRegistry::new();

    let dispatcher = Dispatcher::new(Arc::new(handler_table(&config)?), config.task_timeout);
    let components = build_components(&config, dispatcher).await?;

    let mut supervisor = Supervisor::new(registry.clone(), Backoff::default());
    for component in components {
        supervisor.spawn(component);
    }

    let router = health::create_router(registry, Some(metrics_handle));
    let health_server = tokio::spawn(health::serve(
        config.health_addr,
        router,
        supervisor.subscribe(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    supervisor.shutdown();
    supervisor.wait().await;

    match health_server.await {
        Ok(Err(e)) => error!("Health server error: {}", e),
        Err(e) => error!("Health server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}

fn handler_table(config: &WorkerConfig) -> WorkerResult<HandlerTable> {
    let base_url = config
        .sync_handler_url
        .as_deref()
        .ok_or_else(|| WorkerError::config_error("SYNC_HANDLER_URL is not set"))?;

    let handler = HttpSyncHandler::new(base_url, config.task_timeout)?;
    Ok(HandlerTable::uniform(Arc::new(handler)))
}

/// One pipeline per priority in broker mode, the job pool in direct mode.
async fn build_components(
    config: &WorkerConfig,
    dispatcher: Dispatcher,
) -> WorkerResult<Vec<Arc<dyn Component>>> {
    let startup = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));

    match config.queue.mode {
        ExecutionMode::Broker => {
            let broker = retry_async("Redis connect", &startup, CONNECT_RETRIES, || {
                RedisBroker::connect(&config.queue)
            })
            .await
            .map_err(|(e, _)| e)?;
            let broker: Arc<dyn MessageBroker> = Arc::new(broker);
            let topology = config.queue.topology();
            let settings = PipelineSettings::from_config(config);

            Ok(Priority::ALL
                .iter()
                .map(|&priority| {
                    Arc::new(ConsumerPipeline::new(
                        Arc::clone(&broker),
                        dispatcher.clone(),
                        &topology,
                        priority,
                        &config.worker_id,
                        settings.clone(),
                    )) as Arc<dyn Component>
                })
                .collect())
        }
        ExecutionMode::Direct => {
            let store = retry_async("Job store connect", &startup, CONNECT_RETRIES, || {
                PgJobStore::connect(&config.queue)
            })
            .await
            .map_err(|(e, _)| e)?;
            store.migrate().await?;
            let store: Arc<dyn JobStore> = Arc::new(store);

            let worker = FallbackWorker::new(
                store,
                dispatcher,
                config.worker_id.clone(),
                FallbackSettings::from_config(config),
            );
            Ok(vec![Arc::new(worker) as Arc<dyn Component>])
        }
    }
}
