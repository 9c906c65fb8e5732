//! [WorkspaceManager] — per-task scratch directory lifecycle (spec §4.3).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::archive::{self, ExtractError};
use crate::collaborators::Collaborators;
use crate::task::Task;

/// If the serialized payload exceeds this many bytes it is written to
/// `payload.json` instead of passed via the `PAYLOAD` env var (spec §4.3
/// step 5, §6).
pub const PAYLOAD_INLINE_LIMIT_BYTES: usize = 100 * 1024;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("io error preparing workspace: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to fetch archive: {0}")]
    Fetch(anyhow::Error),
    #[error("failed to extract archive: {0}")]
    Extract(#[from] ExtractError),
}

/// An owned scratch directory for one task invocation (spec §3 Workspace).
pub struct Workspace {
    pub root: PathBuf,
    pub request_id: String,
    /// Set when the payload was large enough to be written to disk rather
    /// than inlined into an env var.
    pub payload_file: Option<PathBuf>,
}

pub struct WorkspaceManager {
    base_dir: PathBuf,
    sdk_dir: PathBuf,
    collaborators: Arc<Collaborators>,
}

impl WorkspaceManager {
    pub fn new(base_dir: PathBuf, sdk_dir: PathBuf, collaborators: Arc<Collaborators>) -> Self {
        Self {
            base_dir,
            sdk_dir,
            collaborators,
        }
    }

    /// Materializes the workspace for `task`: fresh directory, fetched and
    /// extracted code, injected SDK files, and (conditionally) a
    /// `payload.json` (spec §4.3 `prepare`).
    #[instrument(skip(self, task), fields(request_id = %task.request_id))]
    pub async fn prepare(&self, task: &Task) -> Result<Workspace, WorkspaceError> {
        let root = self.base_dir.join(&task.request_id);
        if tokio::fs::metadata(&root).await.is_ok() {
            tokio::fs::remove_dir_all(&root).await?;
        }
        tokio::fs::create_dir_all(&root).await?;

        let archive_path = root.join("code.zip");
        self.collaborators
            .fetch_archive(&task.function_id, &task.s3_key, &archive_path)
            .await
            .map_err(WorkspaceError::Fetch)?;

        let archive_bytes = tokio::fs::read(&archive_path).await?;
        let skipped = archive::extract(&archive_bytes, &root)?;
        if skipped > 0 {
            warn!(request_id = %task.request_id, skipped, "skipped traversal-attempting archive entries");
        }
        tokio::fs::remove_file(&archive_path).await.ok();

        if tokio::fs::metadata(root.join(task.runtime.entrypoint_file())).await.is_err() {
            warn!(
                request_id = %task.request_id,
                entrypoint = task.runtime.entrypoint_file(),
                "archive has no entrypoint file for its runtime; exec will fail"
            );
        }

        self.inject_sdk(&root).await?;

        let payload_file = match &task.payload {
            Some(payload) => self.maybe_write_payload(&root, payload).await?,
            None => None,
        };

        info!(request_id = %task.request_id, workspace = %root.display(), "workspace prepared");

        Ok(Workspace {
            root,
            request_id: task.request_id.clone(),
            payload_file,
        })
    }

    /// Copies `sdk.*` / `ai_client.*` helper files into the workspace,
    /// overwriting existing names (spec §4.3 step 4).
    async fn inject_sdk(&self, root: &Path) -> Result<(), WorkspaceError> {
        let mut entries = match tokio::fs::read_dir(&self.sdk_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let is_helper = {
                let name = name.to_string_lossy();
                name.starts_with("sdk.") || name.starts_with("ai_client.")
            };
            if is_helper {
                tokio::fs::copy(entry.path(), root.join(&name)).await?;
            }
        }
        Ok(())
    }

    async fn maybe_write_payload(
        &self,
        root: &Path,
        payload: &Value,
    ) -> Result<Option<PathBuf>, WorkspaceError> {
        let serialized = serde_json::to_vec(payload).unwrap_or_default();
        if serialized.len() > PAYLOAD_INLINE_LIMIT_BYTES {
            let path = root.join("payload.json");
            tokio::fs::write(&path, &serialized).await?;
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    /// Best-effort recursive removal; failures are logged, never propagated
    /// (spec §4.3 `cleanup`).
    #[instrument(skip(self, workspace), fields(request_id = %workspace.request_id))]
    pub async fn cleanup(&self, workspace: Workspace) {
        if let Err(err) = tokio::fs::remove_dir_all(&workspace.root).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(request_id = %workspace.request_id, error = %err, "workspace cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{BlobStore, CodeCache, LocalCache, MetricsSink};
    use crate::task::Runtime;
    use async_trait::async_trait;
    use std::path::Path;

    struct StaticBlobStore {
        bytes: Vec<u8>,
    }

    #[async_trait]
    impl BlobStore for StaticBlobStore {
        async fn download(&self, _archive_ref: &str, local_path: &Path) -> anyhow::Result<()> {
            tokio::fs::write(local_path, &self.bytes).await?;
            Ok(())
        }
        async fn upload(&self, _local_path: &Path, _key: &str) -> anyhow::Result<String> {
            unimplemented!()
        }
    }

    struct NoopMetrics;
    #[async_trait]
    impl MetricsSink for NoopMetrics {
        async fn put(
            &self,
            _: &str,
            _: &str,
            _: &[(String, String)],
            _: f64,
            _: &str,
            _: chrono::DateTime<chrono::Utc>,
        ) {
        }
    }

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        use std::io::Write;
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options =
                zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
            for (name, contents) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn prepare_then_cleanup_leaves_no_trace() {
        let base_dir = tempfile::tempdir().unwrap();
        let sdk_dir = tempfile::tempdir().unwrap();
        let archive = build_zip(&[("main.py", b"print(1)")]);

        let collaborators = Arc::new(Collaborators {
            blob_store: Arc::new(StaticBlobStore { bytes: archive }),
            cache: Arc::new(LocalCache::new()),
            metrics: Arc::new(NoopMetrics),
        });

        let manager = WorkspaceManager::new(
            base_dir.path().to_path_buf(),
            sdk_dir.path().to_path_buf(),
            collaborators,
        );

        let task = Task {
            request_id: "r1".into(),
            function_id: "f1".into(),
            runtime: Runtime::Python,
            s3_key: "key".into(),
            memory_mb: 128,
            timeout_ms: 5000,
            payload: None,
            llm_model: None,
        };

        let workspace = manager.prepare(&task).await.unwrap();
        assert!(workspace.root.join("main.py").exists());

        let root = workspace.root.clone();
        manager.cleanup(workspace).await;
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn large_payload_is_written_to_disk() {
        let base_dir = tempfile::tempdir().unwrap();
        let sdk_dir = tempfile::tempdir().unwrap();
        let archive = build_zip(&[("main.py", b"print(1)")]);

        let collaborators = Arc::new(Collaborators {
            blob_store: Arc::new(StaticBlobStore { bytes: archive }),
            cache: Arc::new(LocalCache::new()),
            metrics: Arc::new(NoopMetrics),
        });

        let manager = WorkspaceManager::new(
            base_dir.path().to_path_buf(),
            sdk_dir.path().to_path_buf(),
            collaborators,
        );

        let big_string = "x".repeat(PAYLOAD_INLINE_LIMIT_BYTES + 1);
        let task = Task {
            request_id: "r2".into(),
            function_id: "f1".into(),
            runtime: Runtime::Python,
            s3_key: "key".into(),
            memory_mb: 128,
            timeout_ms: 5000,
            payload: Some(serde_json::json!({ "blob": big_string })),
            llm_model: None,
        };

        let workspace = manager.prepare(&task).await.unwrap();
        assert!(workspace.payload_file.is_some());
        assert!(workspace.payload_file.unwrap().exists());
    }
}
