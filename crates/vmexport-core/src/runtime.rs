//! Aggregates the durable store, queue/worker manager, scheduler, and the
//! external-sink collaborators (metrics, audit, secrets, sessions) behind
//! one handle, so `vmexportd` has a single object to build and shut down.

use crate::audit::{AuditSink, FileAuditSink};
use crate::config::Config;
use crate::jobs::{JobManager, RetryPolicy};
use crate::metrics::{InMemoryMetricsSink, MetricsSink};
use crate::provider::{CloudLikeProvider, EsxiLikeProvider, LocalFilesystemProvider, ProviderRegistry};
use crate::schedule::ScheduleEngine;
use crate::secrets::{CachedSecretBackend, InMemorySecretBackend, SecretBackend};
use crate::session::InMemorySessionProvider;
use crate::store::{SqliteStore, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Everything a running daemon needs, wired up from [`Config`]. Construction
/// never starts background tasks; call [`Runtime::start`] once the caller is
/// ready to accept work.
pub struct Runtime {
    pub store: Arc<dyn Store>,
    pub jobs: Arc<JobManager>,
    pub scheduler: Arc<ScheduleEngine>,
    pub metrics: Arc<dyn MetricsSink>,
    pub audit: Arc<dyn AuditSink>,
    pub secrets: Arc<dyn SecretBackend>,
    pub sessions: Arc<InMemorySessionProvider>,
    config: Config,
    /// The session-GC and audit-cleanup ticks (§5); cancelled on shutdown.
    background_cancel: CancellationToken,
    background_handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Builds the durable store, registers the shipped providers, and wires
    /// the job manager and scheduler together. Registering a hypervisor
    /// provider beyond the local filesystem reference implementation is left
    /// to the caller via [`ProviderRegistry::register`] before `start`.
    pub async fn build(config: Config) -> crate::Result<Self> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(&config.store.sqlite_path, config.store.pool_size).await?);

        let mut registry = ProviderRegistry::new();
        registry.register("local", |_cfg| Ok(Arc::new(LocalFilesystemProvider::new()) as Arc<dyn crate::provider::ExportProvider>));
        registry.register("esxi", |cfg| {
            let (base_url, api_token) = provider_endpoint_from_options(cfg)?;
            Ok(Arc::new(EsxiLikeProvider::new(base_url, api_token)) as Arc<dyn crate::provider::ExportProvider>)
        });
        registry.register("cloud", |cfg| {
            let (base_url, api_token) = provider_endpoint_from_options(cfg)?;
            Ok(Arc::new(CloudLikeProvider::new(base_url, api_token)) as Arc<dyn crate::provider::ExportProvider>)
        });
        let registry = Arc::new(registry);

        let metrics: Arc<dyn MetricsSink> = if config.metrics.enabled {
            Arc::new(InMemoryMetricsSink::new())
        } else {
            Arc::new(crate::metrics::NoopMetricsSink)
        };

        let audit: Arc<dyn AuditSink> =
            Arc::new(FileAuditSink::new(config.audit.path.clone(), config.audit.max_size_mb, config.audit.max_age_days).await?);

        let secrets: Arc<dyn SecretBackend> = Arc::new(CachedSecretBackend::new(
            InMemorySecretBackend::new(),
            Duration::from_secs(config.secrets.cache_ttl_secs),
        ));

        let sessions = Arc::new(InMemorySessionProvider::new(config.session.lifetime_secs));

        let retry_policy = retry_policy_from_config(&config.retry);
        let jobs = JobManager::new(store.clone(), registry, metrics.clone(), audit.clone(), config.queue.clone(), retry_policy);
        let scheduler = ScheduleEngine::new(store.clone(), jobs.clone(), config.scheduler.clone());

        Ok(Self {
            store,
            jobs,
            scheduler,
            metrics,
            audit,
            secrets,
            sessions,
            config,
            background_cancel: CancellationToken::new(),
            background_handles: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Starts the worker pool, the results collector, the scheduler tick
    /// loop, and the session-GC/audit-cleanup ticks (§5). Optionally
    /// reconciles Running jobs left over from a prior process before
    /// accepting new work.
    pub async fn start(&self) -> crate::Result<()> {
        if self.config.daemon.reconcile_running_on_restart {
            self.jobs.reconcile_running_on_restart().await?;
        }
        self.jobs.start().await?;
        self.scheduler.start().await;
        self.start_background_ticks().await;
        Ok(())
    }

    async fn start_background_ticks(&self) {
        let mut handles = self.background_handles.lock().await;

        let sessions = self.sessions.clone();
        let gc_interval = Duration::from_secs(self.config.session.gc_interval_secs.max(1));
        let cancel = self.background_cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gc_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = sessions.gc();
                        if swept > 0 {
                            debug!(swept, "session GC swept expired sessions");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }));

        let audit = self.audit.clone();
        let cancel = self.background_cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 3600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = audit.cleanup_expired().await {
                            tracing::warn!("audit log cleanup failed: {}", e);
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }));

        // Refreshes the active_jobs/queued_jobs gauges (§4.G) from the
        // queue's own counters; there's no push exporter in-core to drive
        // these off of, so a short internal tick keeps them current for
        // whatever polls the metrics sink.
        let jobs = self.jobs.clone();
        let metrics = self.metrics.clone();
        let cancel = self.background_cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let queue = jobs.queue_metrics();
                        metrics.set_queued_jobs(queue.current_size as i64);
                        metrics.set_active_jobs(jobs.worker_stats_active() as i64);
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }));
    }

    /// Stops the scheduler, the background ticks, and drains the worker pool
    /// within `daemon.graceful_shutdown_timeout_secs`.
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.scheduler.stop().await;
        self.background_cancel.cancel();
        for handle in self.background_handles.lock().await.drain(..) {
            handle.abort();
        }
        self.jobs
            .shutdown(Duration::from_secs(self.config.daemon.graceful_shutdown_timeout_secs))
            .await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Pulls `base_url`/`api_token` out of a job's `provider_options` bag for the
/// HTTP-backed reference adapters. The local filesystem adapter needs
/// neither, so it alone skips this.
fn provider_endpoint_from_options(options: &serde_json::Value) -> crate::Result<(String, String)> {
    let base_url = options
        .get("base_url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| crate::Error::config("provider_options.base_url is required"))?
        .to_string();
    let api_token = options
        .get("api_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| crate::Error::config("provider_options.api_token is required"))?
        .to_string();
    Ok((base_url, api_token))
}

fn retry_policy_from_config(retry: &crate::config::RetryConfig) -> RetryPolicy {
    match retry.backoff {
        crate::config::BackoffKind::Linear => RetryPolicy::Linear {
            unit: Duration::from_secs(1),
            max_attempts: retry.max_attempts,
        },
        crate::config::BackoffKind::Exponential => RetryPolicy::Exponential(
            crate::jobs::ExponentialBackoff::new(
                Duration::from_secs(retry.exponential_initial_delay_secs),
                Duration::from_secs(retry.exponential_max_delay_secs),
                retry.exponential_multiplier,
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_and_starts_against_an_in_memory_database() {
        let mut config = Config::default();
        config.store.sqlite_path = ":memory:".to_string();
        let dir = tempfile::tempdir().unwrap();
        config.audit.path = dir.path().to_string_lossy().to_string();
        config.scheduler.tick_secs = 1;

        let runtime = Runtime::build(config).await.unwrap();
        runtime.start().await.unwrap();
        runtime.shutdown().await.unwrap();
    }
}
