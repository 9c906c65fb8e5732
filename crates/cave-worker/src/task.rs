//! Wire-level data model: the `Task` a dispatcher delivers and the
//! `TaskResult` published back on the result bus (spec §3, §6).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of runtimes the worker knows how to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Python,
    Nodejs,
    Cpp,
}

impl Runtime {
    pub const ALL: [Runtime; 3] = [Runtime::Python, Runtime::Nodejs, Runtime::Cpp];

    /// Entrypoint argv inside the sandbox (spec §4.7 step 5).
    pub fn argv(self) -> Vec<&'static str> {
        match self {
            Runtime::Python => vec!["python", "main.py"],
            Runtime::Nodejs => vec!["node", "index.js"],
            Runtime::Cpp => vec!["sh", "-c", "g++ main.cpp -o out && ./out"],
        }
    }

    pub fn entrypoint_file(self) -> &'static str {
        match self {
            Runtime::Python => "main.py",
            Runtime::Nodejs => "index.js",
            Runtime::Cpp => "main.cpp",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Runtime::Python => "python",
            Runtime::Nodejs => "nodejs",
            Runtime::Cpp => "cpp",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown runtime '{0}'")]
pub struct UnknownRuntime(String);

impl FromStr for Runtime {
    type Err = UnknownRuntime;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Runtime::Python),
            "nodejs" => Ok(Runtime::Nodejs),
            "cpp" => Ok(Runtime::Cpp),
            other => Err(UnknownRuntime(other.to_string())),
        }
    }
}

/// Default timeout applied when a task omits `timeoutMs` (spec §3).
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// One task message as delivered by the (external) queue transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub request_id: String,
    pub function_id: String,
    pub runtime: Runtime,
    /// Opaque pointer into the blob store (an S3-style key in the wire schema).
    pub s3_key: String,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub payload: Option<Value>,
    /// Pass-through model hint surfaced to user code as `LLM_MODEL` (spec §4.7 step 6).
    #[serde(default)]
    pub llm_model: Option<String>,
}

fn default_memory_mb() -> u32 {
    128
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Status tag mirrored onto the wire as `"SUCCESS"` / `"FAILED"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
}

/// Outcome of one invocation, always produced (spec §7: the result path is total).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub request_id: String,
    pub status: Status,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimization_tip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_savings: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_memory_mb: Option<u32>,
    pub output_files: Vec<String>,
    pub worker_id: String,
}

impl TaskResult {
    pub fn success(&self) -> bool {
        self.status == Status::Success
    }
}
