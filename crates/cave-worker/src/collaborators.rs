//! Trait interfaces for everything spec §1 calls an external collaborator:
//! the queue transport, the result bus, the blob store, the distributed
//! cache, and the metrics sink. This crate implements none of their wire
//! protocols — only a local-filesystem reference adapter per trait, good
//! enough to run the worker end-to-end in a dev environment and in
//! integration tests. Swapping in a real SQS/Redis/S3/CloudWatch backend
//! means implementing these traits, not touching the worker core.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use crate::task::{Task, TaskResult};

/// Opaque acknowledgement token returned alongside a received task; the
/// queue transport uses it to delete/ack the underlying message.
#[derive(Debug, Clone)]
pub struct AckToken(pub String);

#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn receive(&self) -> anyhow::Result<Option<(Task, AckToken)>>;
    async fn ack(&self, token: AckToken) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, result: &TaskResult) -> anyhow::Result<()>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn download(&self, archive_ref: &str, local_path: &Path) -> anyhow::Result<()>;
    async fn upload(&self, local_path: &Path, key: &str) -> anyhow::Result<String>;
}

#[async_trait]
pub trait CodeCache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn setex(&self, key: &str, ttl_seconds: u64, bytes: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn put(
        &self,
        namespace: &str,
        metric: &str,
        dims: &[(String, String)],
        value: f64,
        unit: &str,
        timestamp: chrono::DateTime<chrono::Utc>,
    );
}

/// Local-filesystem `TaskSource`: polls a directory for `*.json` task
/// files, analogous in spirit to the Python predecessor's SQS long-poll
/// loop but backed by the filesystem for local runs and tests.
pub struct LocalQueue {
    dir: PathBuf,
}

impl LocalQueue {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl TaskSource for LocalQueue {
    async fn receive(&self) -> anyhow::Result<Option<(Task, AckToken)>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let task: Task = serde_json::from_slice(&bytes)?;
            return Ok(Some((task, AckToken(path.display().to_string()))));
        }
        Ok(None)
    }

    async fn ack(&self, token: AckToken) -> anyhow::Result<()> {
        let _ = tokio::fs::remove_file(token.0).await;
        Ok(())
    }
}

/// Local-filesystem `ResultSink`: appends one JSON line per result to a
/// results file, the dev-mode stand-in for the result bus.
pub struct LocalBus {
    path: PathBuf,
}

impl LocalBus {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ResultSink for LocalBus {
    async fn publish(&self, result: &TaskResult) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }
}

/// Local-filesystem `BlobStore`: `archive_ref` and `key` are both treated
/// as paths under a configured origin directory.
pub struct LocalBlobStore {
    origin_dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(origin_dir: PathBuf) -> Self {
        Self { origin_dir }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn download(&self, archive_ref: &str, local_path: &Path) -> anyhow::Result<()> {
        let source = self.origin_dir.join(archive_ref);
        tokio::fs::copy(&source, local_path).await?;
        Ok(())
    }

    async fn upload(&self, local_path: &Path, key: &str) -> anyhow::Result<String> {
        let dest = self.origin_dir.join("outputs").join(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local_path, &dest).await?;
        Ok(format!("file://{}", dest.display()))
    }
}

/// In-memory `CodeCache` with a TTL sweep on read, matching the semantics
/// of `setex`/`get` against a real Redis-like store (spec §4.3: "bounded
/// TTL, recommended 600 s").
#[derive(Default)]
pub struct LocalCache {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CodeCache for LocalCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        if let Some((bytes, expires_at)) = entries.get(key) {
            if Instant::now() < *expires_at {
                return Ok(Some(bytes.clone()));
            }
            entries.remove(key);
        }
        Ok(None)
    }

    async fn setex(&self, key: &str, ttl_seconds: u64, bytes: &[u8]) -> anyhow::Result<()> {
        self.entries.lock().insert(
            key.to_string(),
            (bytes.to_vec(), Instant::now() + Duration::from_secs(ttl_seconds)),
        );
        Ok(())
    }
}

/// `MetricsSink` that logs via `tracing` instead of shipping to a real
/// sink — the metrics sink is explicitly out of scope (spec §1).
pub struct LoggingMetricsSink;

#[async_trait]
impl MetricsSink for LoggingMetricsSink {
    async fn put(
        &self,
        namespace: &str,
        metric: &str,
        dims: &[(String, String)],
        value: f64,
        unit: &str,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) {
        tracing::info!(namespace, metric, value, unit, ?dims, %timestamp, "metric");
    }
}

/// Bundles the collaborators an `Executor` needs into one `Arc`-friendly
/// struct, mirroring how `cave-daemon`'s `AppState` threads its
/// process-lifetime singletons into request handlers instead of reaching
/// for ambient globals (spec §9 design note).
pub struct Collaborators {
    pub blob_store: Arc<dyn BlobStore>,
    pub cache: Arc<dyn CodeCache>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Collaborators {
    /// Fetches `archive_ref`'s bytes, trying the cache first and falling
    /// back to the origin blob store on miss or cache failure (spec §4.3
    /// step 2, §7 CacheError: "Log, bypass cache").
    pub async fn fetch_archive(&self, function_id: &str, archive_ref: &str, local_path: &Path) -> anyhow::Result<()> {
        let cache_key = format!("code:{function_id}");

        match self.cache.get(&cache_key).await {
            Ok(Some(bytes)) => {
                tokio::fs::write(local_path, &bytes).await?;
                return Ok(());
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "cache read failed, falling back to origin"),
        }

        self.blob_store.download(archive_ref, local_path).await?;

        if let Ok(bytes) = tokio::fs::read(local_path).await {
            if let Err(err) = self.cache.setex(&cache_key, 600, &bytes).await {
                warn!(error = %err, "cache write failed, continuing without caching");
            }
        }

        Ok(())
    }
}
