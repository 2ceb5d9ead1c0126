use std::time::Duration;

use anyhow::{Context, Result};
use spindle_executor::{current_worker, PoolConfig, WorkerPool};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TASKS: usize = 15;
const TASK_DURATION: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins; otherwise LOG_LEVEL scopes the pool and demo crates
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("spindle_executor={log_level},spindle_demo={log_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("spindle-demo starting...");

    let mut config = PoolConfig::from_env();
    if std::env::var("POOL_NAME").is_err() {
        config = config.with_name("MyPool");
    }

    let pool = WorkerPool::new(config).context("Failed to create worker pool")?;

    let mut events = pool.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log lagged behind the pool");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!(event = %json, "Pool event"),
                Err(e) => tracing::warn!(error = %e, "Failed to serialize pool event"),
            }
        }
    });

    tokio::select! {
        result = run(&pool) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            pool.shutdown_now();
        }
    }

    let stats = pool.stats();
    tracing::info!(
        workers = stats.workers,
        accepted = stats.tasks.accepted,
        rejected = stats.tasks.rejected,
        refused = stats.tasks.refused,
        completed = stats.tasks.completed,
        failed = stats.tasks.failed,
        "Final pool stats"
    );

    drop(pool);
    event_log.abort();

    tracing::info!("Demo shutdown complete");
    Ok(())
}

async fn run(pool: &WorkerPool) -> Result<()> {
    for i in 0..TASKS {
        pool.execute(async move {
            let worker = current_worker().unwrap_or_else(|| "caller".to_string());
            println!("Task {i} started on {worker}");
            tokio::time::sleep(TASK_DURATION).await;
            println!("Task {i} finished on {worker}");
        })
        .await
        .with_context(|| format!("Failed to submit task {i}"))?;
    }

    tracing::info!(
        workers = pool.worker_count(),
        busy = pool.busy_workers(),
        "All tasks submitted"
    );

    tokio::time::sleep(Duration::from_secs(10)).await;

    pool.shutdown();
    if let Err(e) = pool.await_termination(Duration::from_secs(6)).await {
        tracing::warn!(error = %e, "Pool did not drain in time, forcing shutdown");
        pool.shutdown_now();
    }

    Ok(())
}
