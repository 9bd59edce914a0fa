use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use txflow_durable::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, WorkflowEngine, WorkflowEventStore,
};
use txflow_worker::telemetry::{init_telemetry, TelemetryConfig};
use txflow_worker::{register_pipeline, CommandHandler, SimulatedBackends, WorkerConfig};

async fn open_store(config: &WorkerConfig) -> Result<Arc<dyn WorkflowEventStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresWorkflowEventStore::connect(url)
                .await
                .context("Failed to connect to event store")?;
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Using PostgreSQL event store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, executions will not survive a restart");
            Ok(Arc::new(InMemoryWorkflowEventStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "txflow_worker=debug,txflow_durable=info")
    // - LOG_FORMAT: "json" for JSON lines
    init_telemetry(&TelemetryConfig::from_env());

    tracing::info!("txflow-worker starting...");

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    tracing::info!(
        worker_id = %config.worker_id,
        max_concurrent = config.max_concurrent_activities,
        confidence_threshold = config.pipeline.confidence_threshold_approve,
        auto_approval_limit = config.pipeline.auto_approval_limit,
        "Starting worker"
    );

    let store = open_store(&config).await?;
    let engine = WorkflowEngine::new(store, config.engine_config());
    let backends = SimulatedBackends::new(config.embedding_dimensions);
    register_pipeline(&engine, &backends.collaborators());

    let report = engine.recover().await.context("Recovery failed")?;
    tracing::info!(
        resumed = report.resumed.len(),
        finalized = report.finalized.len(),
        failed = report.failed.len(),
        "Recovery complete"
    );
    for (id, reason) in &report.failed {
        tracing::error!(execution_id = %id, reason = %reason, "Execution could not be recovered");
    }

    let handler = CommandHandler::new(engine.clone(), config.pipeline.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read command")? else {
                    tracing::info!("Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handler.handle_line(&line).await;
                stdout.write_all(format!("{response}\n").as_bytes()).await?;
                stdout.flush().await?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    engine.shutdown();
    tracing::info!("Worker shutdown complete");
    Ok(())
}
