//! [MemorySampler] — background peak-memory sampling for one execution
//! (spec §4.5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::sandbox::{Handle as SandboxHandle, SandboxDriver};

const DEFAULT_INTERVAL_MS: u64 = 50;

struct Shared {
    peak_bytes: AtomicU64,
    stop: Notify,
}

/// A running sampler; `stop()` signals it to cease, joins the background
/// task, then takes one final sample to catch late allocations (spec §4.5).
pub struct Sampler {
    shared: Arc<Shared>,
    join: JoinHandle<()>,
    driver: Arc<dyn SandboxDriver>,
    handle: Arc<SandboxHandle>,
}

impl Sampler {
    pub fn start(driver: Arc<dyn SandboxDriver>, handle: Arc<SandboxHandle>, interval_ms: Option<u64>) -> Self {
        let interval = Duration::from_millis(interval_ms.unwrap_or(DEFAULT_INTERVAL_MS));
        let shared = Arc::new(Shared {
            peak_bytes: AtomicU64::new(0),
            stop: Notify::new(),
        });

        let join = tokio::spawn(sample_loop(driver.clone(), handle.clone(), shared.clone(), interval));

        Self {
            shared,
            join,
            driver,
            handle,
        }
    }

    /// Stops sampling and returns the observed peak, in bytes.
    pub async fn stop(self) -> u64 {
        self.shared.stop.notify_one();
        let _ = self.join.await;

        if let Ok(sample) = self.driver.sample_memory(&self.handle).await {
            record_peak(&self.shared, sample);
        }

        self.shared.peak_bytes.load(Ordering::SeqCst)
    }
}

async fn sample_loop(driver: Arc<dyn SandboxDriver>, handle: Arc<SandboxHandle>, shared: Arc<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shared.stop.notified() => break,
            _ = ticker.tick() => {
                match driver.sample_memory(&handle).await {
                    Ok(sample) => record_peak(&shared, sample),
                    Err(err) => warn!(sandbox = %handle.id, error = %err, "memory sample failed"),
                }
            }
        }
    }
}

fn record_peak(shared: &Shared, sample: u64) {
    shared.peak_bytes.fetch_max(sample, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{IsolationSettings, ProcessSandboxDriver, ResourceLimits};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    struct FakeDriver {
        next: StdAtomicU64,
    }

    #[async_trait]
    impl SandboxDriver for FakeDriver {
        async fn create(
            &self,
            _runtime_image: &str,
            _workspace: &Path,
            _limits: ResourceLimits,
        ) -> Result<SandboxHandle, crate::sandbox::SandboxError> {
            unimplemented!()
        }
        async fn pause(&self, _h: &SandboxHandle) -> Result<(), crate::sandbox::SandboxError> {
            Ok(())
        }
        async fn unpause(&self, _h: &SandboxHandle) -> Result<(), crate::sandbox::SandboxError> {
            Ok(())
        }
        async fn exec(
            &self,
            _h: &SandboxHandle,
            _argv: &[String],
            _env: &[(String, String)],
            _cwd: &Path,
        ) -> Result<crate::sandbox::ExecOutput, crate::sandbox::SandboxError> {
            unimplemented!()
        }
        async fn stop(&self, _h: &SandboxHandle, _grace: Duration) -> Result<(), crate::sandbox::SandboxError> {
            Ok(())
        }
        async fn kill(&self, _h: &SandboxHandle) -> Result<(), crate::sandbox::SandboxError> {
            Ok(())
        }
        async fn remove(&self, _h: &SandboxHandle) -> Result<(), crate::sandbox::SandboxError> {
            Ok(())
        }
        async fn sample_memory(&self, _h: &SandboxHandle) -> Result<u64, crate::sandbox::SandboxError> {
            Ok(self.next.fetch_add(1_000_000, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn tracks_running_maximum_across_samples() {
        let isolation = IsolationSettings::default();
        let real_driver = ProcessSandboxDriver::new(isolation);
        // We only need a Handle shell for the id field; build one through the
        // real driver against a scratch workspace.
        let workspace = tempfile::tempdir().unwrap();
        let handle = real_driver
            .create("python", workspace.path(), ResourceLimits { memory_mb: 128, cpu_millis: 500, timeout_seconds: 5 })
            .await
            .unwrap();

        let driver: Arc<dyn SandboxDriver> = Arc::new(FakeDriver { next: StdAtomicU64::new(0) });
        let sampler = Sampler::start(driver, Arc::new(handle), Some(5));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let peak = sampler.stop().await;

        assert!(peak > 0, "expected at least one sample to have been recorded");
    }
}
