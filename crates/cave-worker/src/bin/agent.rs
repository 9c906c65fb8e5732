//! `cave-worker-agent`: the dispatch loop binary. Wires the collaborators
//! (task source, result sink, blob store, cache, metrics sink), builds a
//! `WarmPool` and `Executor`, and drives `Executor::run` for every task the
//! `TaskSource` yields until told to stop.
//!
//! The `TaskSource`/`ResultSink`/`BlobStore` here are the local-filesystem
//! reference adapters from `cave_worker::collaborators` — good enough to run
//! the worker end-to-end in a dev environment, not the production SQS/S3
//! transport (spec §1 non-goals; that wiring is external).

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use cave_worker::collaborators::{
    Collaborators, LocalBlobStore, LocalBus, LocalCache, LocalQueue, LoggingMetricsSink, ResultSink,
    TaskSource,
};
use cave_worker::task::Task;
use cave_worker::{Executor, GlobalLimiter, ProcessSandboxDriver, WarmPool, WorkerConfig, WorkspaceManager};

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::from_env().context("loading worker configuration")?;
    let _telemetry = cave_worker::telemetry::init("cave-worker", config.otel_sampling_rate)?;

    for dir in [
        &config.workspace_root,
        &config.queue_dir,
        &config.blob_origin_dir,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating directory {}", dir.display()))?;
    }

    let driver: Arc<dyn cave_worker::SandboxDriver> =
        Arc::new(ProcessSandboxDriver::new(config.isolation.clone()));

    let collaborators = Arc::new(Collaborators {
        blob_store: Arc::new(LocalBlobStore::new(config.blob_origin_dir.clone())),
        cache: Arc::new(LocalCache::new()),
        metrics: Arc::new(LoggingMetricsSink),
    });

    let workspace_manager = Arc::new(WorkspaceManager::new(
        config.workspace_root.clone(),
        config.sdk_dir.clone(),
        collaborators.clone(),
    ));

    let pool = Arc::new(
        WarmPool::start(driver.clone(), config.warm_pool_targets.clone(), config.default_limits).await,
    );

    let limiter = Arc::new(GlobalLimiter::from_host_memory());
    info!(permits = limiter.capacity(), "worker admission capacity sized");

    let executor = Arc::new(Executor::new(
        driver,
        pool,
        workspace_manager,
        collaborators,
        limiter,
        config.worker_id_override.clone(),
    ));

    let queue = LocalQueue::new(config.queue_dir.clone());
    let results = LocalBus::new(config.results_path.clone());

    info!(
        queue_dir = %config.queue_dir.display(),
        results_path = %config.results_path.display(),
        "cave-worker-agent polling for tasks"
    );

    run_dispatch_loop(&queue, &results, &executor).await
}

/// Polls `queue` for the next task, runs it through `executor`, publishes
/// the result on `results`, and acks the message — looping forever. Errors
/// polling or publishing are logged and retried after a short backoff rather
/// than crashing the process (spec §7: the dispatcher keeps running).
async fn run_dispatch_loop(
    queue: &LocalQueue,
    results: &LocalBus,
    executor: &Arc<cave_worker::Executor>,
) -> Result<()> {
    loop {
        match queue.receive().await {
            Ok(Some((task, ack))) => {
                let executor = executor.clone();
                let request_id = task.request_id.clone();
                let result = dispatch_one(task, executor).await;

                if let Err(err) = results.publish(&result).await {
                    error!(request_id, error = %err, "failed to publish result");
                }
                if let Err(err) = queue.ack(ack).await {
                    warn!(request_id, error = %err, "failed to ack task message");
                }
            }
            Ok(None) => {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            Err(err) => {
                warn!(error = %err, "task source poll failed, retrying shortly");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

async fn dispatch_one(task: Task, executor: Arc<cave_worker::Executor>) -> cave_worker::TaskResult {
    executor.run(task).await
}
