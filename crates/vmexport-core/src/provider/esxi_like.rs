//! Reference adapter for a generic ESXi/vCenter-style REST hypervisor API.
//!
//! Talks to a single configurable base URL with a bearer token, the same
//! way the teacher's `StripeGateway` drives the Stripe API: one
//! `reqwest::Client`, JSON request/response bodies, and a status check
//! before deserializing. No real vCenter speaks exactly this wire format;
//! this is a shape a systems-management REST API plausibly takes, useful as
//! a template for a concrete hypervisor integration.

use crate::progress::{ProgressReporter, ThrottledReader};
use crate::provider::{ExportCapabilities, ExportProvider, ExportResult, VmFilter, VmInfo};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

pub struct EsxiLikeProvider {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    rate_bytes_per_sec: u64,
    burst_bytes: u64,
    download_dir: std::path::PathBuf,
}

impl EsxiLikeProvider {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_token: api_token.into(),
            rate_bytes_per_sec: 0,
            burst_bytes: 0,
            download_dir: std::path::PathBuf::from("."),
        }
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
            .map_err(|e| crate::Error::connect(format!("esxi-like API request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(crate::Error::connect(format!("esxi-like API returned {}: {}", status, body)));
        }

        response.json::<T>().await.map_err(crate::Error::from)
    }
}

#[derive(Debug, Deserialize)]
struct VmDto {
    id: String,
    name: String,
    power_state: String,
    datacenter: String,
    guest_os: String,
    memory_mb: u64,
    cpu_count: u32,
    disk_gb: u64,
    #[serde(default)]
    ip_addresses: Vec<String>,
    #[serde(default)]
    tags: std::collections::HashMap<String, String>,
}

impl From<VmDto> for VmInfo {
    fn from(dto: VmDto) -> Self {
        VmInfo {
            provider: "esxi-like".to_string(),
            id: dto.id,
            name: dto.name,
            power_state: dto.power_state,
            location: dto.datacenter,
            guest_os: dto.guest_os,
            memory_mb: dto.memory_mb,
            cpus: dto.cpu_count,
            storage_gb: dto.disk_gb,
            ip_addresses: dto.ip_addresses,
            tags: dto.tags,
            metadata: serde_json::Value::Null,
            created_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExportStartResponse {
    download_url: String,
    byte_size: u64,
    format: String,
}

#[async_trait]
impl ExportProvider for EsxiLikeProvider {
    fn tag(&self) -> &str {
        "esxi-like"
    }

    async fn validate_credentials(&self) -> crate::Result<()> {
        let response = self
            .client
            .get(self.url("/api/v1/session"))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| crate::Error::connect(format!("esxi-like session check failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(crate::Error::auth(format!("esxi-like credentials rejected: {}", response.status())));
        }
        Ok(())
    }

    async fn list_vms(&self, filter: &VmFilter) -> crate::Result<Vec<VmInfo>> {
        let dtos: Vec<VmDto> = self.get_json("/api/v1/vms").await?;
        let vms: Vec<VmInfo> = dtos.into_iter().map(VmInfo::from).collect();
        Ok(apply_filter(vms, filter))
    }

    async fn get_vm(&self, id: &str) -> crate::Result<VmInfo> {
        let dto: VmDto = self.get_json(&format!("/api/v1/vms/{}", id)).await?;
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

        let response = self
            .client
            .post(self.url(&format!("/api/v1/vms/{}/export", id)))
            .bearer_auth(&self.api_token)
            .json(options)
            .send()
            .await
            .map_err(|e| crate::Error::connect(format!("esxi-like export request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(crate::Error::connect(format!("esxi-like export request returned {}: {}", status, body)));
        }
        let start: ExportStartResponse = response.json().await.map_err(crate::Error::from)?;

        progress.describe("transfer").await;
        let download = self
            .client
            .get(&start.download_url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| crate::Error::connect(format!("esxi-like download failed: {}", e)))?;
        if !download.status().is_success() {
            return Err(crate::Error::connect(format!("esxi-like download returned {}", download.status())));
        }

        let byte_stream = download.bytes_stream().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let body_reader = tokio_util::io::StreamReader::new(byte_stream);
        let mut reader = ThrottledReader::new(
            body_reader,
            self.rate_bytes_per_sec,
            self.burst_bytes,
            Some(start.byte_size),
            progress.clone(),
            cancel.clone(),
        )
        .with_file_name(format!("{}.{}", id, start.format));

        let output_path = id_to_output_path(&self.download_dir, id, &start.format);
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
            format: start.format.clone(),
            output_path,
            byte_size: copied,
            artifact_locator: Some(start.download_url),
            files: vec![id.to_string()],
            duration_secs: started.elapsed().as_secs_f64(),
        })
    }

    fn get_export_capabilities(&self) -> ExportCapabilities {
        ExportCapabilities {
            formats: vec!["ova".to_string(), "vmdk".to_string()],
            supports_compression: true,
            supports_streaming: true,
            supports_snapshots: true,
            max_vm_size_gb: Some(2048),
            supported_targets: vec!["filesystem".to_string(), "nfs".to_string()],
        }
    }

    async fn disconnect(&self) -> crate::Result<()> {
        Ok(())
    }
}

fn apply_filter(vms: Vec<VmInfo>, filter: &VmFilter) -> Vec<VmInfo> {
    vms.into_iter()
        .filter(|vm| {
            let query_matches = filter
                .query
                .as_deref()
                .map(|q| vm.name.to_lowercase().contains(&q.to_lowercase()) || vm.id.to_lowercase().contains(&q.to_lowercase()))
                .unwrap_or(true);
            let tags_match = filter.tags.iter().all(|(k, v)| vm.tags.get(k) == Some(v));
            query_matches && tags_match
        })
        .collect()
}

fn id_to_output_path(dir: &std::path::Path, id: &str, format: &str) -> String {
    dir.join(format!("{}.{}", id, format)).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingReporter;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn validate_credentials_rejects_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/session"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let provider = EsxiLikeProvider::new(server.uri(), "bad-token");
        let err = provider.validate_credentials().await.unwrap_err();
        assert!(matches!(err, crate::Error::Auth(_)));
    }

    #[tokio::test]
    async fn list_vms_maps_dtos_and_applies_filter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/vms"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "id": "vm-1", "name": "web01", "power_state": "poweredOn", "datacenter": "dc1",
                    "guest_os": "linux", "memory_mb": 4096, "cpu_count": 2, "disk_gb": 40
                },
                {
                    "id": "vm-2", "name": "db01", "power_state": "poweredOff", "datacenter": "dc1",
                    "guest_os": "linux", "memory_mb": 8192, "cpu_count": 4, "disk_gb": 200
                }
            ])))
            .mount(&server)
            .await;

        let provider = EsxiLikeProvider::new(server.uri(), "token");
        let vms = provider.list_vms(&VmFilter { query: Some("web".to_string()), tags: Default::default() }).await.unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].id, "vm-1");
    }

    #[tokio::test]
    async fn export_vm_streams_download_body_to_disk() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .and(path("/api/v1/vms/vm-1/export"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "download_url": format!("{}/dl/vm-1.ova", server.uri()),
                "byte_size": 8,
                "format": "ova",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dl/vm-1.ova"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ovafile!".to_vec()))
            .mount(&server)
            .await;

        let provider = EsxiLikeProvider::new(server.uri(), "token").with_download_dir(dir.path());
        let reporter = Arc::new(RecordingReporter::new());
        let result = provider
            .export_vm("vm-1", &serde_json::json!({}), reporter, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.byte_size, 8);
        assert_eq!(result.format, "ova");
        assert!(std::path::Path::new(&result.output_path).starts_with(dir.path()));
    }
}
