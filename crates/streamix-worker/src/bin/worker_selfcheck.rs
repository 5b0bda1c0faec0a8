use std::sync::Arc;

use streamix_models::TaskType;
use streamix_queue::{
    redact_url, ExecutionMode, JobStore, MessageBroker, PgJobStore, RedisBroker,
};
use streamix_worker::{HandlerTable, HttpSyncHandler, SyncHandler, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env();

    println!(
        "worker-selfcheck: starting in {} mode as {}",
        config.queue.mode.as_str(),
        config.worker_id
    );

    ensure_env_present(&["SYNC_HANDLER_URL"])?;
    ensure_handler_table(&config)?;

    match config.queue.mode {
        ExecutionMode::Broker => {
            ensure_env_present(&["REDIS_URL"])?;
            let broker = RedisBroker::connect(&config.queue)
                .await
                .map_err(|e| anyhow::anyhow!("broker unreachable: {}", e))?;
            broker.health_check().await?;
            println!("worker-selfcheck: broker ok ({})", broker.provider_name());
        }
        ExecutionMode::Direct => {
            ensure_env_present(&["DATABASE_URL"])?;
            let store = PgJobStore::connect(&config.queue)
                .await
                .map_err(|e| anyhow::anyhow!("job store unreachable: {}", e))?;
            store.health_check().await?;
            println!("worker-selfcheck: job store ok");
        }
    }

    println!("worker-selfcheck: ok");
    Ok(())
}

fn ensure_handler_table(config: &WorkerConfig) -> anyhow::Result<()> {
    let base_url = config
        .sync_handler_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("SYNC_HANDLER_URL is empty"))?;

    let handler: Arc<dyn SyncHandler> =
        Arc::new(HttpSyncHandler::new(base_url, config.task_timeout)?);
    TaskType::ALL
        .iter()
        .fold(HandlerTable::builder(), |builder, &task_type| {
            builder.register(task_type, Arc::clone(&handler))
        })
        .build()?;

    println!(
        "worker-selfcheck: {} task types routed to {}",
        TaskType::ALL.len(),
        redact_url(base_url)
    );
    Ok(())
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        if std::env::var(var).is_err() {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}
