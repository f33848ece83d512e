//! Reference adapter for a generic cloud disk-export REST API (the shape a
//! managed snapshot-export service takes: submit a task, poll until it
//! finishes, then download the result). Same `reqwest` client/bearer-auth
//! idiom as [`super::esxi_like::EsxiLikeProvider`]; the poll loop is the
//! part that differs from a synchronous hypervisor export.

use crate::progress::{ProgressReporter, ThrottledReader};
use crate::provider::{ExportCapabilities, ExportProvider, ExportResult, VmFilter, VmInfo};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

pub struct CloudLikeProvider {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    poll_interval: Duration,
    rate_bytes_per_sec: u64,
    burst_bytes: u64,
    download_dir: std::path::PathBuf,
}

impl CloudLikeProvider {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_token: api_token.into(),
            poll_interval: Duration::from_secs(2),
            rate_bytes_per_sec: 0,
            burst_bytes: 0,
            download_dir: std::path::PathBuf::from("."),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_bandwidth_limit(mut self, rate_bytes_per_sec: u64, burst_bytes: u64) -> Self {
        self.rate_bytes_per_sec = rate_bytes_per_sec;
        self.burst_bytes = burst_bytes;
        self
    }

    /// Directory exported artifacts are written to. Defaults to the
    /// process's working directory.
    pub fn with_download_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> crate::Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| crate::Error::connect(format!("cloud-like API request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(crate::Error::connect(format!("cloud-like API returned {}: {}", status, body)));
        }
        response.json::<T>().await.map_err(crate::Error::from)
    }
}

#[derive(Debug, Deserialize)]
struct InstanceDto {
    instance_id: String,
    display_name: String,
    state: String,
    region: String,
    os_family: String,
    memory_mb: u64,
    vcpus: u32,
    volume_gb: u64,
    #[serde(default)]
    public_ips: Vec<String>,
    #[serde(default)]
    labels: std::collections::HashMap<String, String>,
}

impl From<InstanceDto> for VmInfo {
    fn from(dto: InstanceDto) -> Self {
        VmInfo {
            provider: "cloud-like".to_string(),
            id: dto.instance_id,
            name: dto.display_name,
            power_state: dto.state,
            location: dto.region,
            guest_os: dto.os_family,
            memory_mb: dto.memory_mb,
            cpus: dto.vcpus,
            storage_gb: dto.volume_gb,
            ip_addresses: dto.public_ips,
            tags: dto.labels,
            metadata: serde_json::Value::Null,
            created_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExportTaskCreated {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct ExportTaskStatus {
    state: String,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    byte_size: Option<u64>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl ExportProvider for CloudLikeProvider {
    fn tag(&self) -> &str {
        "cloud-like"
    }

    async fn validate_credentials(&self) -> crate::Result<()> {
        let response = self
            .client
            .get(self.url("/v2/account"))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| crate::Error::connect(format!("cloud-like account check failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(crate::Error::auth(format!("cloud-like credentials rejected: {}", response.status())));
        }
        Ok(())
    }

    async fn list_vms(&self, filter: &VmFilter) -> crate::Result<Vec<VmInfo>> {
        let dtos: Vec<InstanceDto> = self.get_json("/v2/instances").await?;
        let vms: Vec<VmInfo> = dtos.into_iter().map(VmInfo::from).collect();
        Ok(vms
            .into_iter()
            .filter(|vm| {
                let query_matches = filter
                    .query
                    .as_deref()
                    .map(|q| vm.name.to_lowercase().contains(&q.to_lowercase()) || vm.id.to_lowercase().contains(&q.to_lowercase()))
                    .unwrap_or(true);
                let tags_match = filter.tags.iter().all(|(k, v)| vm.tags.get(k) == Some(v));
                query_matches && tags_match
            })
            .collect())
    }

    async fn get_vm(&self, id: &str) -> crate::Result<VmInfo> {
        let dto: InstanceDto = self.get_json(&format!("/v2/instances/{}", id)).await?;
        Ok(dto.into())
    }

    async fn search_vms(&self, query: &str) -> crate::Result<Vec<VmInfo>> {
        let vms = self.list_vms(&VmFilter::default()).await?;
        let needle = query.to_lowercase();
        Ok(vms
            .into_iter()
            .filter(|vm| {
                vm.id.to_lowercase().contains(&needle)
                    || vm.name.to_lowercase().contains(&needle)
                    || vm.power_state.to_lowercase().contains(&needle)
                    || vm.ip_addresses.iter().any(|ip| ip.contains(&needle))
            })
            .collect())
    }

    async fn export_vm(
        &self,
        id: &str,
        options: &serde_json::Value,
        progress: Arc<dyn ProgressReporter>,
        cancel: CancellationToken,
    ) -> crate::Result<ExportResult> {
        let started = std::time::Instant::now();
        progress.describe("discover").await;

        let created: ExportTaskCreated = {
            let response = self
                .client
                .post(self.url(&format!("/v2/instances/{}/export-tasks", id)))
                .bearer_auth(&self.api_token)
                .json(options)
                .send()
                .await
                .map_err(|e| crate::Error::connect(format!("cloud-like export task creation failed: {}", e)))?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(crate::Error::connect(format!("cloud-like export task creation returned {}: {}", status, body)));
            }
            response.json().await.map_err(crate::Error::from)?
        };

        progress.describe("export").await;
        let status = self.poll_until_done(&created.task_id, &cancel).await?;
        if status.state == "failed" {
            return Err(crate::Error::connect(status.error.unwrap_or_else(|| "cloud-like export task failed".to_string())));
        }
        let download_url = status.download_url.ok_or_else(|| crate::Error::connect("cloud-like task completed without a download_url"))?;
        let byte_size = status.byte_size.unwrap_or(0);
        let format = status.format.unwrap_or_else(|| "raw".to_string());

        progress.describe("transfer").await;
        let download = self
            .client
            .get(&download_url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| crate::Error::connect(format!("cloud-like download failed: {}", e)))?;
        if !download.status().is_success() {
            return Err(crate::Error::connect(format!("cloud-like download returned {}", download.status())));
        }

        let byte_stream = download.bytes_stream().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let body_reader = tokio_util::io::StreamReader::new(byte_stream);
        let mut reader = ThrottledReader::new(
            body_reader,
            self.rate_bytes_per_sec,
            self.burst_bytes,
            if byte_size > 0 { Some(byte_size) } else { None },
            progress.clone(),
            cancel.clone(),
        )
        .with_file_name(format!("{}.{}", id, format));

        let output_path = self.download_dir.join(format!("{}.{}", id, format)).to_string_lossy().into_owned();
        let mut out = tokio::fs::File::create(&output_path).await.map_err(crate::Error::Io)?;

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
            format,
            output_path,
            byte_size: copied,
            artifact_locator: Some(download_url),
            files: vec![id.to_string()],
            duration_secs: started.elapsed().as_secs_f64(),
        })
    }

    fn get_export_capabilities(&self) -> ExportCapabilities {
        ExportCapabilities {
            formats: vec!["raw".to_string(), "qcow2".to_string()],
            supports_compression: true,
            supports_streaming: false,
            supports_snapshots: true,
            max_vm_size_gb: Some(16384),
            supported_targets: vec!["filesystem".to_string(), "object-storage".to_string()],
        }
    }

    async fn disconnect(&self) -> crate::Result<()> {
        Ok(())
    }
}

impl CloudLikeProvider {
    /// Polls `/v2/export-tasks/{id}` until it leaves the `pending`/`running`
    /// states, honoring cancellation between polls.
    async fn poll_until_done(&self, task_id: &str, cancel: &CancellationToken) -> crate::Result<ExportTaskStatus> {
        loop {
            let status: ExportTaskStatus = self.get_json(&format!("/v2/export-tasks/{}", task_id)).await?;
            if status.state != "pending" && status.state != "running" {
                return Ok(status);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Err(crate::Error::cancelled("export cancelled while waiting on task")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingReporter;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn export_vm_polls_task_to_completion_then_downloads() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .and(path("/v2/instances/i-1/export-tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "task_id": "t-1" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/export-tasks/t-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "state": "completed",
                "download_url": format!("{}/dl/i-1.raw", server.uri()),
                "byte_size": 5,
                "format": "raw",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dl/i-1.raw"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abcde".to_vec()))
            .mount(&server)
            .await;

        let provider = CloudLikeProvider::new(server.uri(), "token")
            .with_poll_interval(Duration::from_millis(1))
            .with_download_dir(dir.path());
        let reporter = Arc::new(RecordingReporter::new());
        let result = provider
            .export_vm("i-1", &serde_json::json!({}), reporter, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.byte_size, 5);
        assert_eq!(result.format, "raw");
        assert!(std::path::Path::new(&result.output_path).starts_with(dir.path()));
    }

    #[tokio::test]
    async fn export_vm_surfaces_task_failure() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v2/instances/i-2/export-tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "task_id": "t-2" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/export-tasks/t-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "state": "failed",
                "error": "volume snapshot quota exceeded",
            })))
            .mount(&server)
            .await;

        let provider = CloudLikeProvider::new(server.uri(), "token").with_poll_interval(Duration::from_millis(1));
        let reporter = Arc::new(RecordingReporter::new());
        let err = provider
            .export_vm("i-2", &serde_json::json!({}), reporter, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, crate::Error::Connect(_)));
    }
}
