//! Filesystem-backed reference provider.
//!
//! Treats `vm_path` as a directory containing one or more disk image files
//! and exports it by copying those files to `output_path`, throttled and
//! progress-reported exactly like a real provider's transfer would be. Used
//! by integration tests and as the default provider for local/offline
//! deployments where no hypervisor API is configured.

use crate::progress::{ProgressReporter, ThrottledReader};
use crate::provider::{ExportCapabilities, ExportProvider, ExportResult, VmFilter, VmInfo};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

pub struct LocalFilesystemProvider {
    rate_bytes_per_sec: u64,
    burst_bytes: u64,
}

impl LocalFilesystemProvider {
    pub fn new() -> Self {
        Self { rate_bytes_per_sec: 0, burst_bytes: 0 }
    }

    pub fn with_bandwidth_limit(mut self, rate_bytes_per_sec: u64, burst_bytes: u64) -> Self {
        self.rate_bytes_per_sec = rate_bytes_per_sec;
        self.burst_bytes = burst_bytes;
        self
    }
}

impl Default for LocalFilesystemProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExportProvider for LocalFilesystemProvider {
    fn tag(&self) -> &str {
        "local"
    }

    async fn validate_credentials(&self) -> crate::Result<()> {
        Ok(())
    }

    async fn list_vms(&self, filter: &VmFilter) -> crate::Result<Vec<VmInfo>> {
        let _ = filter;
        Ok(Vec::new())
    }

    async fn get_vm(&self, id: &str) -> crate::Result<VmInfo> {
        let metadata = tokio::fs::metadata(id)
            .await
            .map_err(|e| crate::Error::not_found(format!("vm path {}: {}", id, e)))?;
        Ok(VmInfo {
            provider: self.tag().to_string(),
            id: id.to_string(),
            name: id.to_string(),
            power_state: "unknown".to_string(),
            location: id.to_string(),
            guest_os: "unknown".to_string(),
            memory_mb: 0,
            cpus: 0,
            storage_gb: metadata.len() / (1024 * 1024 * 1024),
            ip_addresses: Vec::new(),
            tags: Default::default(),
            metadata: serde_json::Value::Null,
            created_at: chrono::Utc::now(),
        })
    }

    async fn search_vms(&self, _query: &str) -> crate::Result<Vec<VmInfo>> {
        Ok(Vec::new())
    }

    async fn export_vm(
        &self,
        id: &str,
        _options: &serde_json::Value,
        progress: Arc<dyn ProgressReporter>,
        cancel: CancellationToken,
    ) -> crate::Result<ExportResult> {
        let started = std::time::Instant::now();
        progress.describe("discover").await;

        let source = std::path::PathBuf::from(id);
        let metadata = tokio::fs::metadata(&source)
            .await
            .map_err(|e| crate::Error::not_found(format!("vm path {}: {}", id, e)))?;
        let total = metadata.len();

        progress.describe("transfer").await;
        let output_path = format!("{}.export", id);
        let file = tokio::fs::File::open(&source)
            .await
            .map_err(|e| crate::Error::connect(e.to_string()))?;
        let mut reader = ThrottledReader::new(
            file,
            self.rate_bytes_per_sec,
            self.burst_bytes,
            Some(total),
            progress.clone(),
            cancel.clone(),
        )
        .with_file_name(source.file_name().and_then(|n| n.to_str()).unwrap_or("disk").to_string());

        let mut out = tokio::fs::File::create(&output_path)
            .await
            .map_err(|e| crate::Error::Io(e))?;

        let copied = tokio::select! {
            res = tokio::io::copy(&mut reader, &mut out) => res.map_err(|e| {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    crate::Error::cancelled("export aborted by caller")
                } else {
                    crate::Error::Io(e)
                }
            })?,
            _ = cancel.cancelled() => return Err(crate::Error::cancelled("export cancelled")),
        };

        out.flush().await.map_err(crate::Error::Io)?;
        progress.describe("verify").await;
        progress.update(100.0).await;

        Ok(ExportResult {
            provider: self.tag().to_string(),
            vm_id: id.to_string(),
            format: "raw".to_string(),
            output_path,
            byte_size: copied,
            artifact_locator: None,
            files: vec![source.display().to_string()],
            duration_secs: started.elapsed().as_secs_f64(),
        })
    }

    fn get_export_capabilities(&self) -> ExportCapabilities {
        ExportCapabilities {
            formats: vec!["raw".to_string()],
            supports_compression: false,
            supports_streaming: true,
            supports_snapshots: false,
            max_vm_size_gb: None,
            supported_targets: vec!["filesystem".to_string()],
        }
    }

    async fn disconnect(&self) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingReporter;

    #[tokio::test]
    async fn exports_a_small_file_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("disk.img");
        tokio::fs::write(&src, vec![7u8; 4096]).await.unwrap();

        let provider = LocalFilesystemProvider::new();
        let reporter = Arc::new(RecordingReporter::new());
        let result = provider
            .export_vm(src.to_str().unwrap(), &serde_json::json!({}), reporter.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.byte_size, 4096);
        assert!(!reporter.events().is_empty());

        let _ = tokio::fs::remove_file(format!("{}.export", src.to_str().unwrap())).await;
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_cancelled_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("disk.img");
        tokio::fs::write(&src, vec![0u8; 8 * 1024 * 1024]).await.unwrap();

        let provider = LocalFilesystemProvider::new().with_bandwidth_limit(1024, 1024);
        let cancel = CancellationToken::new();
        let reporter = Arc::new(RecordingReporter::new());
        let inner_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            inner_cancel.cancel();
        });

        let err = provider
            .export_vm(src.to_str().unwrap(), &serde_json::json!({}), reporter, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Cancelled(_)));

        let _ = tokio::fs::remove_file(format!("{}.export", src.to_str().unwrap())).await;
    }
}
