//! cave-worker: the function-as-a-service execution core. Accepts one
//! task at a time from a `TaskSource`, runs it inside an isolated,
//! warm-pooled sandbox under a wall-clock deadline, and publishes a
//! `TaskResult` carrying output URIs and AutoTuner advice.

pub mod archive;
pub mod autotuner;
pub mod collaborators;
pub mod config;
pub mod executor;
pub mod isolation;
pub mod limiter;
pub mod pool;
pub mod retry;
pub mod sampler;
pub mod sandbox;
pub mod task;
pub mod telemetry;
pub mod timeout;
pub mod workspace;

pub use config::WorkerConfig;
pub use executor::Executor;
pub use limiter::GlobalLimiter;
pub use pool::WarmPool;
pub use sandbox::{ProcessSandboxDriver, SandboxDriver};
pub use task::{Runtime, Task, TaskResult};
pub use workspace::WorkspaceManager;
