//! [WorkerConfig] — environment-driven configuration, in the same
//! `CAVE_*`-prefixed `from_env()` style as `cave-daemon`'s `AppConfig`.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::sandbox::{IsolationSettings, ResourceLimits};
use crate::task::Runtime;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workspace_root: PathBuf,
    pub sdk_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub results_path: PathBuf,
    pub blob_origin_dir: PathBuf,
    pub default_limits: ResourceLimits,
    pub warm_pool_targets: HashMap<Runtime, usize>,
    pub isolation: IsolationSettings,
    pub otel_sampling_rate: Option<f64>,
    pub worker_id_override: Option<String>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let workspace_root = env::var("CAVE_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.cave_workspaces"));

        let sdk_dir = env::var("CAVE_SDK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./sdk"));

        let queue_dir = env::var("CAVE_QUEUE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.cave_queue"));

        let results_path = env::var("CAVE_RESULTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.cave_results.jsonl"));

        let blob_origin_dir = env::var("CAVE_BLOB_ORIGIN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.cave_blobs"));

        let base_limits = ResourceLimits {
            memory_mb: 128,
            cpu_millis: 500,
            timeout_seconds: 10,
        };
        let default_limits = ResourceLimits {
            memory_mb: env_parse("CAVE_DEFAULT_MEMORY_MB").unwrap_or(base_limits.memory_mb),
            cpu_millis: env_parse("CAVE_DEFAULT_CPU_MILLIS").unwrap_or(base_limits.cpu_millis),
            timeout_seconds: env_parse("CAVE_DEFAULT_TIMEOUT_SECONDS").unwrap_or(base_limits.timeout_seconds),
        };

        let warm_pool_targets = parse_warm_pool_targets()?;

        let mut isolation = IsolationSettings::default();
        if matches!(bool_env("CAVE_DISABLE_ISOLATION"), Some(true)) {
            isolation.enable_cgroups = false;
            isolation.enable_fs_isolation = false;
            isolation.enable_network_isolation = false;
            isolation.drop_privileges = false;
        }
        if let Some(root) = env::var("CAVE_CGROUP_ROOT").ok().map(PathBuf::from) {
            isolation.cgroup_root = root;
        }

        let otel_sampling_rate = env::var("CAVE_OTEL_SAMPLING_RATE").ok().map(|v| {
            v.parse::<f64>()
                .context("invalid CAVE_OTEL_SAMPLING_RATE")
        }).transpose()?;

        let worker_id_override = env::var("CAVE_WORKER_ID").ok();

        Ok(Self {
            workspace_root,
            sdk_dir,
            queue_dir,
            results_path,
            blob_origin_dir,
            default_limits,
            warm_pool_targets,
            isolation,
            otel_sampling_rate,
            worker_id_override,
        })
    }
}

/// Parses `CAVE_WARM_POOL_<RUNTIME>` (e.g. `CAVE_WARM_POOL_PYTHON=4`) for
/// every known runtime, defaulting to 2 each if unset.
fn parse_warm_pool_targets() -> Result<HashMap<Runtime, usize>> {
    let mut targets = HashMap::new();
    for runtime in Runtime::ALL {
        let key = format!("CAVE_WARM_POOL_{}", runtime.to_string().to_uppercase());
        let target = match env::var(&key) {
            Ok(raw) => raw.parse::<usize>().with_context(|| format!("invalid {key}"))?,
            Err(_) => 2,
        };
        targets.insert(runtime, target);
    }
    Ok(targets)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn bool_env(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
}
