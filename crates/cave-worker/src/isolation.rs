//! Linux isolation plumbing backing [`crate::sandbox::ProcessSandboxDriver`]:
//! cgroup-v2 memory/CPU/pids caps, a low-latency memory read, and the
//! `chroot`/network-namespace/uid-drop lockdown applied to the child just
//! before `exec` when the worker is running as root.
//!
//! Adapted from the cgroup setup this crate's kernel ancestor used for
//! namespace/cgroup sandboxing; trimmed to what this worker actually needs.
//! The kernel ancestor's seccomp BPF filter construction has no counterpart
//! here — syscall filtering is the isolation backend's job, not this
//! driver's (see `DESIGN.md`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::sandbox::ResourceLimits;

#[cfg(target_os = "linux")]
use std::ffi::CString;
#[cfg(target_os = "linux")]
use std::os::unix::ffi::OsStrExt;

/// Prepares a dedicated cgroup for the sandbox and applies memory/CPU/pids
/// limits (spec §3: "memory limit = memory_mb, CPU quota configured").
#[cfg(target_os = "linux")]
pub async fn prepare_cgroup(root: &Path, sandbox_id: Uuid, limits: ResourceLimits) -> Result<PathBuf> {
    let group_path = root.join(sandbox_id.to_string());
    fs::create_dir_all(&group_path)
        .await
        .with_context(|| format!("creating cgroup directory at {}", group_path.display()))?;

    write_string(group_path.join("memory.max"), limits.memory_bytes().to_string()).await?;
    write_string(group_path.join("pids.max"), "256".to_string()).await?;
    write_string(group_path.join("cpu.max"), cpu_quota_value(limits.cpu_millis)).await?;

    Ok(group_path)
}

#[cfg(not(target_os = "linux"))]
pub async fn prepare_cgroup(_root: &Path, _sandbox_id: Uuid, _limits: ResourceLimits) -> Result<PathBuf> {
    Err(anyhow::anyhow!("cgroups are only supported on Linux"))
}

/// Registers the child process with its cgroup.
#[cfg(target_os = "linux")]
pub async fn add_pid_to_cgroup(group_path: &Path, pid: u32) -> Result<()> {
    write_string(group_path.join("cgroup.procs"), pid.to_string()).await
}

#[cfg(not(target_os = "linux"))]
pub async fn add_pid_to_cgroup(_group_path: &Path, _pid: u32) -> Result<()> {
    Ok(())
}

/// Removes the cgroup directory once the sandbox is torn down.
#[cfg(target_os = "linux")]
pub async fn cleanup_cgroup(root: &Path, sandbox_id: Uuid) -> Result<()> {
    let group_path = root.join(sandbox_id.to_string());
    match fs::remove_dir(&group_path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing cgroup {}", group_path.display())),
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn cleanup_cgroup(_root: &Path, _sandbox_id: Uuid) -> Result<()> {
    Ok(())
}

/// Low-latency peak-memory read: the kernel's per-cgroup `memory.current`
/// file, read directly rather than through a control-plane API (spec §4.1,
/// §9 design note (b)).
pub async fn read_memory_current(group_path: &Path) -> Result<u64> {
    let raw = fs::read_to_string(group_path.join("memory.current"))
        .await
        .with_context(|| format!("reading memory.current at {}", group_path.display()))?;
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("parsing memory.current contents: {raw:?}"))
}

#[cfg(target_os = "linux")]
async fn write_string(path: PathBuf, value: String) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(value.as_bytes()).await?;
    Ok(())
}

/// Runs in the child between `fork` and `exec` (called from
/// [`crate::sandbox::ProcessSandboxDriver`]'s `pre_exec` hook): detaches the
/// network namespace, `chroot`s into `workspace`, and drops to an
/// unprivileged uid/gid, in that order — each step requires the privilege
/// the previous ones haven't yet given up. Caller has already confirmed the
/// process is running as root; any failure here aborts the exec with the
/// underlying `errno`.
#[cfg(target_os = "linux")]
pub fn lock_down_process(
    workspace: &Path,
    restrict_fs: bool,
    isolate_network: bool,
    drop_to: Option<(u32, u32)>,
) -> std::io::Result<()> {
    if isolate_network && unsafe { libc::unshare(libc::CLONE_NEWNET) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    if restrict_fs {
        let root = CString::new(workspace.as_os_str().as_bytes()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "workspace path contains a NUL byte")
        })?;
        if unsafe { libc::chroot(root.as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if unsafe { libc::chdir(b"/\0".as_ptr() as *const libc::c_char) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    if let Some((uid, gid)) = drop_to {
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn lock_down_process(
    _workspace: &Path,
    _restrict_fs: bool,
    _isolate_network: bool,
    _drop_to: Option<(u32, u32)>,
) -> std::io::Result<()> {
    Ok(())
}

/// cgroup v2 `cpu.max` is `"<quota> <period>"` in microseconds; we treat
/// 1000 millis as one full CPU and use a 100ms period.
#[cfg(target_os = "linux")]
fn cpu_quota_value(cpu_millis: u32) -> String {
    const PERIOD: u64 = 100_000;
    if cpu_millis == 0 {
        return "max".to_string();
    }
    let quota = ((cpu_millis as u64) * PERIOD) / 1000;
    format!("{} {}", quota.max(1), PERIOD)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn cpu_quota_formats_as_quota_period_pair() {
        assert_eq!(cpu_quota_value(500), "50000 100000");
        assert_eq!(cpu_quota_value(0), "max");
    }
}
