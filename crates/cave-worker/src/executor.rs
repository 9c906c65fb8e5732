//! [Executor] — runs one task end to end (spec §4.7). The result path is
//! total: any failure in steps 3-12 is folded into a failed `TaskResult`
//! rather than propagated, so cleanup (step 13) and the limiter release
//! (step 14) always happen.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, instrument, warn};

use crate::autotuner::{self, ExecutionMetrics};
use crate::collaborators::Collaborators;
use crate::limiter::GlobalLimiter;
use crate::pool::WarmPool;
use crate::sampler::Sampler;
use crate::sandbox::SandboxDriver;
use crate::task::{Status, Task, TaskResult};
use crate::timeout::{TimeoutController, TimeoutState};
use crate::workspace::WorkspaceManager;

const TIMEOUT_EXIT_CODE: i32 = -2;
const INTERNAL_FAILURE_EXIT_CODE: i32 = -1;

pub struct Executor {
    driver: Arc<dyn SandboxDriver>,
    pool: Arc<WarmPool>,
    workspace_manager: Arc<WorkspaceManager>,
    collaborators: Arc<Collaborators>,
    limiter: Arc<GlobalLimiter>,
    worker_id: String,
}

impl Executor {
    /// `worker_id_override` is `WorkerConfig::worker_id_override` (from
    /// `CAVE_WORKER_ID`) — config is the single source of truth for it, so
    /// this falls back to `local_hostname()` only when the caller passes
    /// `None` rather than re-reading the environment itself.
    pub fn new(
        driver: Arc<dyn SandboxDriver>,
        pool: Arc<WarmPool>,
        workspace_manager: Arc<WorkspaceManager>,
        collaborators: Arc<Collaborators>,
        limiter: Arc<GlobalLimiter>,
        worker_id_override: Option<String>,
    ) -> Self {
        Self {
            driver,
            pool,
            workspace_manager,
            collaborators,
            limiter,
            worker_id: worker_id_override.unwrap_or_else(local_hostname),
        }
    }

    /// Runs `task` to completion, always returning a populated
    /// [`TaskResult`] (spec §4.7, §7: "the result path is total").
    #[instrument(skip(self, task), fields(request_id = %task.request_id))]
    pub async fn run(&self, task: Task) -> TaskResult {
        let _permit = self.limiter.acquire().await;
        let start = Instant::now();

        match self.run_inner(&task, start).await {
            Ok(result) => result,
            Err(err) => {
                error!(request_id = %task.request_id, error = %err, "execution failed internally");
                TaskResult {
                    request_id: task.request_id.clone(),
                    status: Status::Failed,
                    exit_code: INTERNAL_FAILURE_EXIT_CODE,
                    stdout: String::new(),
                    stderr: err.to_string(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    peak_memory_bytes: None,
                    optimization_tip: None,
                    estimated_savings: None,
                    recommended_memory_mb: None,
                    output_files: Vec::new(),
                    worker_id: self.worker_id.clone(),
                }
            }
        }
    }

    /// Steps 3-12 of spec §4.7, wrapped so any error here becomes a failed
    /// [`TaskResult`] instead of escaping `run`. Steps 13-14 (cleanup,
    /// permit release) happen in `run` / via RAII regardless of outcome.
    async fn run_inner(&self, task: &Task, start: Instant) -> anyhow::Result<TaskResult> {
        let workspace = self.workspace_manager.prepare(task).await?;
        let cleanup_guard = CleanupGuard {
            manager: self.workspace_manager.clone(),
            workspace: Some(workspace),
        };

        let handle = Arc::new(self.pool.checkout(task.runtime).await?);

        let argv: Vec<String> = task.runtime.argv().into_iter().map(str::to_string).collect();
        let env = build_env(task, &cleanup_guard.workspace.as_ref().unwrap().payload_file);
        let cwd = cleanup_guard.workspace.as_ref().unwrap().root.clone();

        let sampler = Sampler::start(self.driver.clone(), handle.clone(), None);
        let controller = TimeoutController::arm(self.driver.clone(), handle.clone(), task.timeout_ms);

        let exec_result = self.driver.exec(&handle, &argv, &env, &cwd).await;

        let timeout_state = controller.disarm().await;
        let peak_bytes = sampler.stop().await;

        let duration_ms = start.elapsed().as_millis() as u64;

        let output_files = self.collect_outputs(&cwd, task).await;

        let (exit_code, stdout, stderr) = match exec_result {
            Ok(output) => (output.exit_code, output.stdout, output.stderr),
            Err(err) => (INTERNAL_FAILURE_EXIT_CODE, String::new(), err.to_string()),
        };

        let (exit_code, stderr) = if timeout_state == TimeoutState::Fired {
            (TIMEOUT_EXIT_CODE, format!("execution exceeded timeout of {}ms", task.timeout_ms))
        } else {
            (exit_code, stderr)
        };

        let success = exit_code == 0 && timeout_state != TimeoutState::Fired;

        self.publish_metric(task, peak_bytes).await;

        let metrics = ExecutionMetrics {
            peak_memory_bytes: peak_bytes,
            allocated_mb: task.memory_mb,
            duration_ms,
            // The process-based driver has no CPU/IO accounting path; the
            // AutoTuner contract still expects the fields to be present
            // (spec §4, supplemental note on Executor), so they read 0
            // rather than being omitted.
            cpu_usage_micros: 0,
            network_bytes: 0,
            disk_bytes: 0,
        };
        let advice = autotuner::analyze(metrics);

        // The workspace is cleaned up by `cleanup_guard`'s `Drop` impl
        // regardless of anything above having errored.
        if let Err(err) = self.driver.remove(&handle).await {
            warn!(request_id = %task.request_id, error = %err, "sandbox removal failed");
        }
        drop(cleanup_guard);

        Ok(TaskResult {
            request_id: task.request_id.clone(),
            status: if success { Status::Success } else { Status::Failed },
            exit_code,
            stdout,
            stderr,
            duration_ms,
            peak_memory_bytes: Some(peak_bytes),
            optimization_tip: advice.tip,
            estimated_savings: advice.estimated_savings,
            recommended_memory_mb: advice.recommended_memory_mb,
            output_files,
            worker_id: self.worker_id.clone(),
        })
    }

    /// Uploads every file under `<workspace>/output` through the blob
    /// store (spec §4.7 step 10). Missing output directories are not an
    /// error; per-file upload failures are logged and the file is skipped.
    async fn collect_outputs(&self, workspace_root: &Path, task: &Task) -> Vec<String> {
        let output_dir = workspace_root.join("output");
        let mut uris = Vec::new();

        let mut entries = match tokio::fs::read_dir(&output_dir).await {
            Ok(entries) => entries,
            Err(_) => return uris,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let key = format!("{}/{}", task.request_id, file_name.to_string_lossy());
            match self.collaborators.blob_store.upload(&path, &key).await {
                Ok(uri) => uris.push(uri),
                Err(err) => warn!(request_id = %task.request_id, file = ?file_name, error = %err, "output upload failed"),
            }
        }

        uris
    }

    /// Publishes the peak-memory metric non-blocking and best-effort
    /// (spec §4.7 step 11: "failure logged").
    async fn publish_metric(&self, task: &Task, peak_bytes: u64) {
        self.collaborators
            .metrics
            .put(
                "cave-worker",
                "PeakMemoryBytes",
                &[("runtime".to_string(), task.runtime.to_string())],
                peak_bytes as f64,
                "Bytes",
                chrono::Utc::now(),
            )
            .await;
    }
}

/// `PAYLOAD`/`PAYLOAD_FILE` plus the fixed identity variables every
/// invocation receives (spec §4.7 step 6). `OUTPUT_DIR` is not set here —
/// only `SandboxDriver::exec` knows whether the child will actually be
/// chrooted into the workspace, so it picks that value itself.
fn build_env(task: &Task, payload_file: &Option<std::path::PathBuf>) -> Vec<(String, String)> {
    let mut env = vec![
        ("REQUEST_ID".to_string(), task.request_id.clone()),
        ("FUNCTION_ID".to_string(), task.function_id.clone()),
        ("MEMORY_MB".to_string(), task.memory_mb.to_string()),
    ];

    if let Some(model) = &task.llm_model {
        env.push(("LLM_MODEL".to_string(), model.clone()));
    }

    match payload_file {
        Some(path) => env.push(("PAYLOAD_FILE".to_string(), path.display().to_string())),
        None => {
            if let Some(payload) = &task.payload {
                env.push(("PAYLOAD".to_string(), payload.to_string()));
            }
        }
    }

    env
}

/// Ensures `WorkspaceManager::cleanup` runs even if an earlier `?` inside
/// `run_inner` returns before reaching the normal cleanup call. Holds its
/// own `Arc` clone so the spawned cleanup task never outlives its manager.
struct CleanupGuard {
    manager: Arc<WorkspaceManager>,
    workspace: Option<crate::workspace::Workspace>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(workspace) = self.workspace.take() {
            let manager = self.manager.clone();
            tokio::spawn(async move { manager.cleanup(workspace).await });
        }
    }
}

/// Fallback used when `Executor::new` isn't given an explicit worker id
/// (i.e. `WorkerConfig::worker_id_override` was `None`).
fn local_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        return name;
    }
    platform_hostname().unwrap_or_else(|| "unknown-worker".to_string())
}

#[cfg(target_os = "linux")]
fn platform_hostname() -> Option<String> {
    let mut buf = vec![0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..len].to_vec()).ok()
}

#[cfg(not(target_os = "linux"))]
fn platform_hostname() -> Option<String> {
    None
}
