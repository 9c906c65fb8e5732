//! [SandboxDriver] — the capability interface over the isolation backend
//! (spec §4.1). `ProcessSandboxDriver` is the in-repo implementation: a
//! cgroup-scoped child process on Linux that, when the worker itself runs
//! as root, is additionally chrooted into its workspace, stripped of a
//! network namespace, and dropped to an unprivileged uid/gid before exec;
//! without root it's a plain scoped child process with none of that applied
//! (matching `ProcessSandboxRuntime` in the kernel this crate is descended
//! from, which documents its own process runtime the same way: workspace
//! scoping first, real namespace/seccomp isolation layered in separately).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::isolation;
use crate::retry::retry;

/// Poll interval while `stop`/`kill` wait for a not-yet-spawned child's pid
/// to appear on `handle`.
const PID_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Bound on how long `kill` waits for a late-appearing pid once it's called
/// (it has no `grace` parameter of its own, unlike `stop`).
const KILL_PID_WAIT: Duration = Duration::from_millis(200);

/// Errors `SandboxDriver` operations can fail with (spec §4.1). Only
/// `Transient` is meant to be retried by callers.
#[derive(Debug, Error, Clone)]
pub enum SandboxError {
    #[error("sandbox {0} not found")]
    NotFound(Uuid),
    #[error("sandbox backend unavailable: {0}")]
    Unavailable(String),
    #[error("operation denied: {0}")]
    Denied(String),
    #[error("transient sandbox error: {0}")]
    Transient(String),
}

/// Resource caps applied to a sandbox at creation time (spec §3 Sandbox).
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    pub cpu_millis: u32,
    pub timeout_seconds: u32,
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb as u64 * 1024 * 1024
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Paused,
    Running,
    Terminated,
}

/// A handle to one isolated execution environment (spec §3 Sandbox).
pub struct Handle {
    pub id: Uuid,
    pub workspace: PathBuf,
    #[allow(dead_code)]
    limits: ResourceLimits,
    cgroup_path: Option<PathBuf>,
    state: std::sync::Mutex<SandboxState>,
    /// pid of the currently running exec, if any. Tracked separately from
    /// the `tokio::process::Child` (owned by the in-flight `exec` future)
    /// so `stop`/`kill` can signal the process while `exec` is still
    /// awaiting its exit status.
    pid: std::sync::Mutex<Option<u32>>,
    used: AtomicBool,
}

impl Handle {
    pub fn state(&self) -> SandboxState {
        *self.state.lock().expect("sandbox state mutex poisoned")
    }

    fn set_state(&self, state: SandboxState) {
        *self.state.lock().expect("sandbox state mutex poisoned") = state;
    }

    /// True once [`SandboxDriver::exec`] has run any command through this
    /// handle — enforces invariant 3.2 (never reused) from the caller side.
    pub fn has_executed(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }
}

pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Thin capability set the rest of the system depends on (spec §4.1).
#[async_trait]
pub trait SandboxDriver: Send + Sync + 'static {
    async fn create(
        &self,
        runtime_image: &str,
        workspace: &Path,
        limits: ResourceLimits,
    ) -> Result<Handle, SandboxError>;

    async fn pause(&self, handle: &Handle) -> Result<(), SandboxError>;

    async fn unpause(&self, handle: &Handle) -> Result<(), SandboxError>;

    async fn exec(
        &self,
        handle: &Handle,
        argv: &[String],
        env: &[(String, String)],
        cwd: &Path,
    ) -> Result<ExecOutput, SandboxError>;

    async fn stop(&self, handle: &Handle, grace: Duration) -> Result<(), SandboxError>;

    async fn kill(&self, handle: &Handle) -> Result<(), SandboxError>;

    async fn remove(&self, handle: &Handle) -> Result<(), SandboxError>;

    /// Low-latency (target <1ms) peak-memory sample, per spec §4.1: read the
    /// kernel's per-cgroup memory counter file directly rather than going
    /// through a control API.
    async fn sample_memory(&self, handle: &Handle) -> Result<u64, SandboxError>;
}

/// Settings that tune how much real OS isolation `ProcessSandboxDriver`
/// applies. Every knob defaults to "on" on Linux and is a no-op elsewhere.
///
/// `enable_fs_isolation`, `enable_network_isolation` and `drop_privileges`
/// only take effect when the worker process is itself running as root:
/// `chroot`/`unshare(CLONE_NEWNET)`/`setuid` all require privilege the
/// worker may not have (e.g. in a dev environment or already-unprivileged
/// deployment), and `exec` checks for that up front rather than attempting
/// and failing every invocation.
#[derive(Debug, Clone)]
pub struct IsolationSettings {
    pub enable_cgroups: bool,
    pub enable_fs_isolation: bool,
    pub enable_network_isolation: bool,
    pub drop_privileges: bool,
    pub unprivileged_uid: u32,
    pub unprivileged_gid: u32,
    pub cgroup_root: PathBuf,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            enable_cgroups: cfg!(target_os = "linux"),
            enable_fs_isolation: cfg!(target_os = "linux"),
            enable_network_isolation: cfg!(target_os = "linux"),
            drop_privileges: cfg!(target_os = "linux"),
            // 65534 is the conventional `nobody`/`nogroup` id on Linux; there's
            // no portable way to look the name up without pulling in a users/
            // groups crate, and the numeric id is standard enough to hardcode.
            unprivileged_uid: 65534,
            unprivileged_gid: 65534,
            cgroup_root: PathBuf::from("/sys/fs/cgroup/cave-worker"),
        }
    }
}

/// Process-based sandbox driver: no container runtime dependency, just a
/// cgroup-scoped (Linux) or plain (other OS) child process rooted at the
/// given workspace. Mirrors `cave_kernel::ProcessSandboxRuntime` generalized
/// to the warm-pool create/pause/unpause lifecycle spec §3 requires.
pub struct ProcessSandboxDriver {
    isolation: IsolationSettings,
}

impl ProcessSandboxDriver {
    pub fn new(isolation: IsolationSettings) -> Self {
        Self { isolation }
    }
}

#[async_trait]
impl SandboxDriver for ProcessSandboxDriver {
    #[instrument(skip(self))]
    async fn create(
        &self,
        _runtime_image: &str,
        workspace: &Path,
        limits: ResourceLimits,
    ) -> Result<Handle, SandboxError> {
        let id = Uuid::new_v4();
        tokio::fs::create_dir_all(workspace)
            .await
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;

        let cgroup_path = if self.isolation.enable_cgroups {
            match isolation::prepare_cgroup(&self.isolation.cgroup_root, id, limits).await {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(sandbox = %id, error = %err, "cgroup setup failed, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        Ok(Handle {
            id,
            workspace: workspace.to_path_buf(),
            limits,
            cgroup_path,
            state: std::sync::Mutex::new(SandboxState::Created),
            pid: std::sync::Mutex::new(None),
            used: AtomicBool::new(false),
        })
    }

    async fn pause(&self, handle: &Handle) -> Result<(), SandboxError> {
        handle.set_state(SandboxState::Paused);
        Ok(())
    }

    async fn unpause(&self, handle: &Handle) -> Result<(), SandboxError> {
        if handle.state() == SandboxState::Terminated {
            return Err(SandboxError::NotFound(handle.id));
        }
        handle.set_state(SandboxState::Running);
        Ok(())
    }

    #[instrument(skip(self, env))]
    async fn exec(
        &self,
        handle: &Handle,
        argv: &[String],
        env: &[(String, String)],
        cwd: &Path,
    ) -> Result<ExecOutput, SandboxError> {
        handle.used.store(true, Ordering::SeqCst);

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::Denied("empty argv".into()))?;

        // Whether `exec` will actually chroot the child below — it's the one
        // place that knows the real fs topology, so it (not the caller) owns
        // picking an `OUTPUT_DIR` that resolves to somewhere inside `cwd`
        // from the child's point of view, chrooted or not.
        let fs_will_be_restricted = self.isolation.enable_fs_isolation && running_as_root();

        let mut command = Command::new(program);
        command.args(args);
        command.current_dir(cwd);
        command.envs(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        command.env("CAVE_SANDBOX_ID", handle.id.to_string());
        command.env("OUTPUT_DIR", output_dir_env(cwd, fs_will_be_restricted));
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        install_isolation_hooks(&mut command, cwd, &self.isolation, fs_will_be_restricted, handle.id);

        let spawn = retry(
            || async {
                command
                    .spawn()
                    .map_err(|e| SandboxError::Transient(e.to_string()))
            },
            3,
            Duration::from_millis(50),
        )
        .await;

        let mut child = spawn?;
        let pid = child.id();
        *handle.pid.lock().expect("pid mutex poisoned") = pid;

        if let Some(cgroup_path) = &handle.cgroup_path {
            if let Some(pid) = pid {
                if let Err(err) = isolation::add_pid_to_cgroup(cgroup_path, pid).await {
                    warn!(sandbox = %handle.id, error = %err, "failed to move process into cgroup");
                }
            }
        }

        let mut stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let (stdout_res, stderr_res, status) = tokio::join!(
            tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut stdout_buf),
            tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut stderr_buf),
            child.wait(),
        );
        *handle.pid.lock().expect("pid mutex poisoned") = None;
        stdout_res.map_err(|e| SandboxError::Transient(e.to_string()))?;
        stderr_res.map_err(|e| SandboxError::Transient(e.to_string()))?;
        let status = status.map_err(|e| SandboxError::Transient(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        })
    }

    /// Sends `SIGTERM` and waits up to `grace` for the process to exit
    /// (spec §4.6: "invoke SandboxDriver.stop(handle, grace=3s)").
    ///
    /// `handle.pid` may still be `None` when this is called — `TimeoutController`
    /// arms its deadline before `exec` has necessarily spawned the child, so a
    /// very short timeout can fire first. Rather than no-op in that case, this
    /// polls for the pid to appear for the rest of `grace` and signals it as
    /// soon as it does, so a late-spawning process is still bounded.
    async fn stop(&self, handle: &Handle, grace: Duration) -> Result<(), SandboxError> {
        let deadline = tokio::time::Instant::now() + grace;
        let mut signaled = false;

        loop {
            let pid = *handle.pid.lock().expect("pid mutex poisoned");
            match pid {
                Some(pid) if !signaled => {
                    send_signal(pid, Signal::Term);
                    signaled = true;
                }
                None if signaled => return Ok(()),
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(());
            }
            tokio::time::sleep(PID_POLL_INTERVAL).await;
        }
    }

    /// Sends `SIGKILL` (spec §4.6: "if exec still has not returned ... kill").
    ///
    /// Same late-spawn race as `stop`: if the child still hasn't appeared by
    /// the time `kill` runs, poll for it briefly instead of silently no-oping.
    async fn kill(&self, handle: &Handle) -> Result<(), SandboxError> {
        let deadline = tokio::time::Instant::now() + KILL_PID_WAIT;
        loop {
            if let Some(pid) = *handle.pid.lock().expect("pid mutex poisoned") {
                send_signal(pid, Signal::Kill);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(());
            }
            tokio::time::sleep(PID_POLL_INTERVAL).await;
        }
    }

    #[instrument(skip(self))]
    async fn remove(&self, handle: &Handle) -> Result<(), SandboxError> {
        handle.set_state(SandboxState::Terminated);
        if let Some(cgroup_path) = &handle.cgroup_path {
            if let Err(err) = isolation::cleanup_cgroup(&self.isolation.cgroup_root, handle.id).await {
                warn!(sandbox = %handle.id, error = %err, "failed to clean up cgroup");
            }
            let _ = cgroup_path;
        }
        Ok(())
    }

    async fn sample_memory(&self, handle: &Handle) -> Result<u64, SandboxError> {
        if let Some(cgroup_path) = &handle.cgroup_path {
            isolation::read_memory_current(cgroup_path)
                .await
                .map_err(|e| SandboxError::Transient(e.to_string()))
        } else {
            // No cgroup (non-Linux or disabled isolation): nothing to sample.
            Ok(0)
        }
    }
}

/// Picks the value handed to the child as `OUTPUT_DIR`. When `exec` is
/// about to `chroot` the child into `cwd`, `cwd` itself becomes `/` from the
/// child's point of view, so the literal path `/output` is correct. Without
/// a chroot (no root privilege, or fs isolation disabled — the common case
/// for this reference driver) the real absolute path is the only one that
/// resolves, since `collect_outputs` scans `cwd.join("output")` on the host
/// side regardless.
fn output_dir_env(cwd: &Path, fs_will_be_restricted: bool) -> String {
    if fs_will_be_restricted {
        "/output".to_string()
    } else {
        cwd.join("output").display().to_string()
    }
}

#[cfg(target_os = "linux")]
fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(target_os = "linux"))]
fn running_as_root() -> bool {
    false
}

/// Installs the `chroot`/network-namespace/uid-drop `pre_exec` hook when at
/// least one of those is enabled and the worker has the privilege to apply
/// it. Without root, `chroot(2)`/`unshare(CLONE_NEWNET)`/`setuid(2)` all
/// fail with `EPERM`, so the caller checks the effective uid up front (via
/// `fs_will_be_restricted` and the network/drop-privileges flags below) and
/// we just warn and skip instead of failing every exec.
#[cfg(target_os = "linux")]
fn install_isolation_hooks(
    command: &mut Command,
    cwd: &Path,
    isolation: &IsolationSettings,
    fs_will_be_restricted: bool,
    sandbox_id: Uuid,
) {
    let wants_isolation = isolation.enable_fs_isolation || isolation.enable_network_isolation || isolation.drop_privileges;
    if !wants_isolation {
        return;
    }
    if !running_as_root() {
        warn!(
            sandbox = %sandbox_id,
            "worker is not running as root: chroot/network-namespace/uid-drop enforcement skipped"
        );
        return;
    }

    let workspace = cwd.to_path_buf();
    let isolate_network = isolation.enable_network_isolation;
    let drop_to = isolation
        .drop_privileges
        .then_some((isolation.unprivileged_uid, isolation.unprivileged_gid));

    // Safety: the closure only calls async-signal-safe libc functions
    // (unshare, chroot, chdir, setgid, setuid) between fork and exec.
    unsafe {
        command.pre_exec(move || {
            isolation::lock_down_process(&workspace, fs_will_be_restricted, isolate_network, drop_to)
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn install_isolation_hooks(
    _command: &mut Command,
    _cwd: &Path,
    _isolation: &IsolationSettings,
    _fs_will_be_restricted: bool,
    _sandbox_id: Uuid,
) {
}

enum Signal {
    Term,
    Kill,
}

#[cfg(target_os = "linux")]
fn send_signal(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

#[cfg(not(target_os = "linux"))]
fn send_signal(_pid: u32, _signal: Signal) {}
