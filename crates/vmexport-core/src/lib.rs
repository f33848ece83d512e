//! Core domain logic for the VM export control plane: the priority job
//! queue, durable job lifecycle, cron-driven scheduler, and the
//! provider-agnostic export pipeline. Ships a filesystem provider plus two
//! HTTP-based reference adapters (hypervisor-style and cloud-style REST
//! APIs); a gRPC/HTTP operator surface is a collaborator outside this crate.

pub mod audit;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod progress;
pub mod provider;
pub mod runtime;
pub mod schedule;
pub mod secrets;
pub mod session;
pub mod store;

pub use audit::{AuditEvent, AuditEventType, AuditSink, AuditStatus, FileAuditSink, NoopAuditSink};
pub use config::Config;
pub use error::{Error, Result, ValidationErrors};
pub use jobs::{Job, JobDefinition, JobId, JobManager, JobPriority, JobQuery, JobResult, JobStatus};
pub use metrics::{InMemoryMetricsSink, MetricsSink, NoopMetricsSink, SizeBucket};
pub use progress::{CoalescingReporter, ProgressEvent, ProgressReporter};
pub use provider::{CloudLikeProvider, EsxiLikeProvider, ExportCapabilities, ExportProvider, ExportResult, LocalFilesystemProvider, ProviderRegistry, VmFilter, VmInfo};
pub use runtime::Runtime;
pub use schedule::{ConcurrencyPolicy, ScheduleEngine, ScheduleExecution, ScheduledJob, ScheduledJobId};
pub use secrets::{CachedSecretBackend, InMemorySecretBackend, Secret, SecretBackend};
pub use session::{InMemorySessionProvider, Session, SessionProvider};
pub use store::{InMemoryStore, JobStatistics, SqliteStore, Store};

/// Current version of vmexport-core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_available() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn error_creation() {
        let err = Error::validation("test validation error");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.category(), "validation");
    }
}
