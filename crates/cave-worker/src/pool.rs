//! [WarmPool] — keeps a target number of pre-initialized, paused sandboxes
//! per runtime, checks out on demand and replenishes asynchronously (spec
//! §4.4). The bucket is a FIFO to keep sandbox age bounded; replenishment is
//! dispatched from `checkout` rather than `checkin` because sandboxes are
//! never returned to the pool once they've executed anything (invariant
//! 3.2) — there is no checkin.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::sandbox::{Handle, ResourceLimits, SandboxDriver, SandboxError};
use crate::task::Runtime;

const MAX_CHECKOUT_RETRIES: u32 = 5;
const MAX_REPLENISH_RETRIES: u32 = 2;

struct Bucket {
    entries: Mutex<VecDeque<(Handle, Instant)>>,
    target: usize,
}

/// A request to create-and-pause one fresh sandbox for `runtime`, processed
/// by a background replenishment worker.
struct ReplenishRequest {
    runtime: Runtime,
}

pub struct WarmPool {
    driver: Arc<dyn SandboxDriver>,
    buckets: HashMap<Runtime, Arc<Bucket>>,
    default_limits: ResourceLimits,
    replenish_tx: mpsc::Sender<ReplenishRequest>,
}

impl WarmPool {
    /// Builds the pool and fills every bucket to its target concurrently
    /// (spec §4.4 "On startup, concurrently fills each bucket").
    pub async fn start(
        driver: Arc<dyn SandboxDriver>,
        targets: HashMap<Runtime, usize>,
        default_limits: ResourceLimits,
    ) -> Self {
        let mut buckets = HashMap::new();
        for runtime in Runtime::ALL {
            let target = targets.get(&runtime).copied().unwrap_or(0);
            buckets.insert(
                runtime,
                Arc::new(Bucket {
                    entries: Mutex::new(VecDeque::new()),
                    target,
                }),
            );
        }

        let (replenish_tx, replenish_rx) = mpsc::channel(256);

        let pool = Self {
            driver: driver.clone(),
            buckets,
            default_limits,
            replenish_tx,
        };

        // One worker per runtime bucket is enough (spec §9 design note).
        spawn_replenish_workers(driver.clone(), pool.buckets.clone(), default_limits, replenish_rx);

        let fills = pool.buckets.iter().map(|(runtime, bucket)| {
            let driver = driver.clone();
            let runtime = *runtime;
            let bucket = bucket.clone();
            async move {
                for _ in 0..bucket.target {
                    match create_paused(&driver, runtime, default_limits).await {
                        Ok(handle) => bucket.entries.lock().push_back((handle, Instant::now())),
                        Err(err) => warn!(%runtime, error = %err, "initial warm pool fill failed"),
                    }
                }
            }
        });
        futures::future::join_all(fills).await;

        pool
    }

    fn bucket_for(&self, runtime: Runtime) -> Arc<Bucket> {
        self.buckets
            .get(&runtime)
            .cloned()
            .unwrap_or_else(|| self.buckets.get(&Runtime::Python).unwrap().clone())
    }

    /// Pops the oldest paused sandbox for `runtime` (or `python` if the
    /// runtime has no bucket), unpauses it, and dispatches a non-blocking
    /// replenishment request (spec §4.4 `checkout`).
    #[instrument(skip(self))]
    pub async fn checkout(&self, runtime: Runtime) -> Result<Handle, SandboxError> {
        let bucket = self.bucket_for(runtime);

        for attempt in 0..MAX_CHECKOUT_RETRIES {
            let popped = bucket.entries.lock().pop_front();
            let handle = match popped {
                Some((handle, _created_at)) => handle,
                None => match create_paused(&self.driver, runtime, self.default_limits).await {
                    Ok(handle) => handle,
                    Err(err) if attempt < MAX_CHECKOUT_RETRIES - 1 => {
                        warn!(%runtime, attempt, error = %err, "synchronous sandbox creation failed on checkout, retrying");
                        continue;
                    }
                    Err(err) => return Err(err),
                },
            };

            // Bucket-resident handles are create-and-paused only; nothing
            // ever checks a sandbox back in after it has run a command
            // (invariant 3.2, spec §3). If one did slip through, surface it
            // loudly rather than unpause and hand out an already-used sandbox.
            debug_assert!(!handle.has_executed(), "pooled sandbox has already executed a command");

            match self.driver.unpause(&handle).await {
                Ok(()) => {
                    let _ = self.replenish_tx.try_send(ReplenishRequest { runtime });
                    return Ok(handle);
                }
                Err(err) => {
                    warn!(%runtime, attempt, error = %err, "discarding poisoned sandbox on checkout");
                    let _ = self.driver.remove(&handle).await;
                }
            }
        }

        Err(SandboxError::Unavailable(format!(
            "exhausted {MAX_CHECKOUT_RETRIES} checkout attempts for runtime {runtime}"
        )))
    }

    /// Current resident count for `runtime`'s bucket (used by tests to
    /// observe eventual reconciliation to `target`, spec §8).
    pub fn resident_count(&self, runtime: Runtime) -> usize {
        self.bucket_for(runtime).entries.lock().len()
    }
}

async fn create_paused(
    driver: &Arc<dyn SandboxDriver>,
    runtime: Runtime,
    limits: ResourceLimits,
) -> Result<Handle, SandboxError> {
    let workspace = std::env::temp_dir().join(format!("cave-warm-{}", uuid::Uuid::new_v4()));
    let handle = driver.create(&runtime.to_string(), &workspace, limits).await?;
    driver.pause(&handle).await?;
    Ok(handle)
}

fn spawn_replenish_workers(
    driver: Arc<dyn SandboxDriver>,
    buckets: HashMap<Runtime, Arc<Bucket>>,
    default_limits: ResourceLimits,
    mut rx: mpsc::Receiver<ReplenishRequest>,
) {
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let Some(bucket) = buckets.get(&request.runtime).cloned() else {
                continue;
            };
            let driver = driver.clone();
            tokio::spawn(async move {
                for attempt in 0..=MAX_REPLENISH_RETRIES {
                    match create_paused(&driver, request.runtime, default_limits).await {
                        Ok(handle) => {
                            bucket.entries.lock().push_back((handle, Instant::now()));
                            info!(runtime = %request.runtime, "warm pool replenished");
                            return;
                        }
                        Err(err) if attempt < MAX_REPLENISH_RETRIES => {
                            warn!(runtime = %request.runtime, attempt, error = %err, "replenishment attempt failed, retrying");
                        }
                        Err(err) => {
                            warn!(runtime = %request.runtime, error = %err, "replenishment failed persistently, bucket left below target");
                        }
                    }
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{IsolationSettings, ProcessSandboxDriver};
    use std::time::Duration;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            memory_mb: 128,
            cpu_millis: 500,
            timeout_seconds: 10,
        }
    }

    #[tokio::test]
    async fn checkout_unpauses_and_schedules_replenishment() {
        let mut isolation = IsolationSettings::default();
        isolation.enable_cgroups = false;
        let driver: Arc<dyn SandboxDriver> = Arc::new(ProcessSandboxDriver::new(isolation));

        let mut targets = HashMap::new();
        targets.insert(Runtime::Python, 2);

        let pool = WarmPool::start(driver, targets, limits()).await;
        assert_eq!(pool.resident_count(Runtime::Python), 2);

        for _ in 0..5 {
            let handle = pool.checkout(Runtime::Python).await.unwrap();
            assert_eq!(handle.state(), crate::sandbox::SandboxState::Running);
        }

        // Replenishment runs in the background; give it a moment to settle.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.resident_count(Runtime::Python), 2);
    }

    #[tokio::test]
    async fn zero_target_bucket_creates_on_demand_and_checkout_succeeds() {
        let mut isolation = IsolationSettings::default();
        isolation.enable_cgroups = false;
        let driver: Arc<dyn SandboxDriver> = Arc::new(ProcessSandboxDriver::new(isolation));

        let mut targets = HashMap::new();
        targets.insert(Runtime::Python, 1);
        targets.insert(Runtime::Nodejs, 0);

        let pool = WarmPool::start(driver, targets, limits()).await;
        assert_eq!(pool.resident_count(Runtime::Nodejs), 0);

        let handle = pool.checkout(Runtime::Nodejs).await.unwrap();
        assert_eq!(handle.state(), crate::sandbox::SandboxState::Running);
        // Nodejs's own (empty) bucket was used, not Python's.
        assert_eq!(pool.resident_count(Runtime::Python), 1);
    }
}
