//! [TimeoutController] — wall-clock deadline with graceful stop → force
//! kill escalation (spec §4.6). Cancellation from above (e.g. the agent
//! shutting down) is modeled identically to a fired timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::sandbox::{Handle, SandboxDriver};

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutState {
    Armed,
    Fired,
    Disarmed,
}

struct Shared {
    disarm: Notify,
    fired: std::sync::atomic::AtomicBool,
}

/// Arms a deadline concurrent with the exec call. `disarm()` cancels it
/// cleanly if the exec finished first; otherwise the timer fires, stops the
/// sandbox gracefully, and force-kills it if it hasn't exited after an
/// additional grace window.
pub struct TimeoutController {
    shared: Arc<Shared>,
    join: JoinHandle<()>,
}

impl TimeoutController {
    /// Arms a deadline of `deadline_ms` against `handle`, using `driver` to
    /// escalate stop → kill on fire.
    pub fn arm(driver: Arc<dyn SandboxDriver>, handle: Arc<Handle>, deadline_ms: u64) -> Self {
        let shared = Arc::new(Shared {
            disarm: Notify::new(),
            fired: std::sync::atomic::AtomicBool::new(false),
        });

        let join = tokio::spawn(watch(driver, handle, Duration::from_millis(deadline_ms), shared.clone()));

        Self { shared, join }
    }

    /// Cancels the timer because the exec returned in time (spec §4.6:
    /// "Exec finishes before timer: DISARMED").
    pub async fn disarm(self) -> TimeoutState {
        self.shared.disarm.notify_one();
        let _ = self.join.await;
        if self.shared.fired.load(std::sync::atomic::Ordering::SeqCst) {
            TimeoutState::Fired
        } else {
            TimeoutState::Disarmed
        }
    }
}

async fn watch(driver: Arc<dyn SandboxDriver>, handle: Arc<Handle>, deadline: Duration, shared: Arc<Shared>) {
    tokio::select! {
        _ = shared.disarm.notified() => {}
        _ = tokio::time::sleep(deadline) => {
            shared.fired.store(true, std::sync::atomic::Ordering::SeqCst);
            if let Err(err) = driver.stop(&handle, DEFAULT_STOP_GRACE).await {
                warn!(sandbox = %handle.id, error = %err, "graceful stop failed on timeout");
            }
            tokio::time::sleep(DEFAULT_KILL_GRACE).await;
            if let Err(err) = driver.kill(&handle).await {
                warn!(sandbox = %handle.id, error = %err, "force kill failed after timeout");
            }
        }
    }
}
