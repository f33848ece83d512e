//! Provider-agnostic export capability interface and registry.
//!
//! Every cloud/virtualization backend (ESXi, Proxmox, oVirt, a plain
//! filesystem source used in tests) implements [`ExportProvider`]. The
//! [`ProviderRegistry`] resolves a provider type tag from a [`JobDefinition`]
//! into a constructed handle; it never inspects the handle beyond that.
//! This mirrors the way the teacher's `ShippingProviderFactory` maps a
//! carrier tag to a boxed `ShippingProvider`.

pub mod cloud_like;
pub mod esxi_like;
pub mod local;

pub use cloud_like::CloudLikeProvider;
pub use esxi_like::EsxiLikeProvider;
pub use local::LocalFilesystemProvider;

use crate::progress::ProgressReporter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Information about one discoverable VM, normalized across providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub provider: String,
    pub id: String,
    pub name: String,
    pub power_state: String,
    pub location: String,
    pub guest_os: String,
    pub memory_mb: u64,
    pub cpus: u32,
    pub storage_gb: u64,
    pub ip_addresses: Vec<String>,
    pub tags: HashMap<String, String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Free-text filter applied to `list_vms` / `search_vms`.
#[derive(Debug, Clone, Default)]
pub struct VmFilter {
    pub query: Option<String>,
    pub tags: HashMap<String, String>,
}

/// What a single export call produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResult {
    pub provider: String,
    pub vm_id: String,
    pub format: String,
    pub output_path: String,
    pub byte_size: u64,
    pub artifact_locator: Option<String>,
    pub files: Vec<String>,
    pub duration_secs: f64,
}

/// Static capabilities a provider exposes, independent of any one VM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportCapabilities {
    pub formats: Vec<String>,
    pub supports_compression: bool,
    pub supports_streaming: bool,
    pub supports_snapshots: bool,
    pub max_vm_size_gb: Option<u64>,
    pub supported_targets: Vec<String>,
}

/// The capability set every export provider must implement. A handle
/// returned by [`ProviderRegistry::connect`] is single-use from the core's
/// perspective: one `export_vm` call per handle, per job.
#[async_trait]
pub trait ExportProvider: Send + Sync {
    /// Provider type tag, e.g. "esxi", "proxmox", "local".
    fn tag(&self) -> &str;

    async fn validate_credentials(&self) -> crate::Result<()>;

    async fn list_vms(&self, filter: &VmFilter) -> crate::Result<Vec<VmInfo>>;

    async fn get_vm(&self, id: &str) -> crate::Result<VmInfo>;

    /// Free-text match over name/id/state/tags/IPs.
    async fn search_vms(&self, query: &str) -> crate::Result<Vec<VmInfo>>;

    async fn export_vm(
        &self,
        id: &str,
        options: &serde_json::Value,
        progress: Arc<dyn ProgressReporter>,
        cancel: CancellationToken,
    ) -> crate::Result<ExportResult>;

    fn get_export_capabilities(&self) -> ExportCapabilities;

    async fn disconnect(&self) -> crate::Result<()>;
}

/// A constructor closure: given provider-specific connection config, builds
/// a handle. Held by the registry under its type tag.
type ProviderFactory = Box<dyn Fn(&serde_json::Value) -> crate::Result<Arc<dyn ExportProvider>> + Send + Sync>;

/// Maps a provider type tag to a constructor. Registration happens once at
/// daemon startup (see [`crate::runtime::Runtime`]); lookups happen per job.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> crate::Result<Arc<dyn ExportProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(tag.into(), Box::new(factory));
    }

    /// Build a connected handle for `tag`, or `UnknownProvider` if nothing is
    /// registered under it.
    pub fn connect(&self, tag: &str, config: &serde_json::Value) -> crate::Result<Arc<dyn ExportProvider>> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| crate::Error::unknown_provider(tag.to_string()))?;
        factory(config)
    }

    pub fn known_tags(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tag_is_rejected() {
        let registry = ProviderRegistry::new();
        let err = registry.connect("nonexistent", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, crate::Error::UnknownProvider(_)));
    }

    #[test]
    fn registered_tag_resolves() {
        let mut registry = ProviderRegistry::new();
        registry.register("local", |_cfg| Ok(Arc::new(LocalFilesystemProvider::new()) as Arc<dyn ExportProvider>));
        assert!(registry.connect("local", &serde_json::json!({})).is_ok());
        assert_eq!(registry.known_tags(), vec!["local"]);
    }
}
