//! The Job Manager: owns the job state machine, bridges submission,
//! execution, persistence, and eventing (§4.E). Nothing else is permitted
//! to mutate a [`Job`]'s runtime fields.

use crate::audit::{AuditEvent, AuditEventType, AuditSink, AuditStatus};
use crate::config::QueueConfig;
use crate::jobs::{
    Job, JobContext, JobDefinition, JobHandler, JobId, JobQuery, JobQueue, JobResult, JobStatistics, JobStatus,
};
use crate::metrics::MetricsSink;
use crate::progress::{CoalescingReporter, ProgressReporter};
use crate::provider::ProviderRegistry;
use crate::schedule::engine::JobSubmitter;
use crate::schedule::ScheduledJobId;
use crate::store::Store;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::worker::JobOutcome;
use super::WorkerPool;

/// The fixed Store.update retry schedule for a terminal state transition
/// (§4.E): three attempts, 200/400/800 ms apart.
const PERSIST_RETRY_BACKOFF_MS: [u64; 3] = [200, 400, 800];

/// Executes the provider-specific work behind a job: resolves the provider
/// from the registry, drives `export_vm` with a bound progress reporter, and
/// reports metrics. Persistence of the returned [`JobResult`] happens in
/// [`JobManager`]'s results-collector loop, not here.
pub struct ExportJobHandler {
    registry: Arc<ProviderRegistry>,
    metrics: Arc<dyn MetricsSink>,
    /// Per-job live progress, consulted by `JobManager::get_progress`.
    progress: Arc<std::sync::Mutex<HashMap<JobId, crate::progress::ProgressEvent>>>,
}

impl ExportJobHandler {
    pub fn new(registry: Arc<ProviderRegistry>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            registry,
            metrics,
            progress: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn progress_snapshot(&self, job_id: JobId) -> Option<crate::progress::ProgressEvent> {
        self.progress.lock().expect("progress map poisoned").get(&job_id).cloned()
    }
}

#[async_trait]
impl JobHandler for ExportJobHandler {
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> crate::Result<JobResult> {
        let provider = self.registry.connect(&job.definition.provider, &job.definition.provider_options)?;
        provider.validate_credentials().await?;

        let job_id = job.id;
        let progress_map = self.progress.clone();
        let reporter: Arc<dyn ProgressReporter> = Arc::new(CoalescingReporter::new(move |event| {
            progress_map.lock().expect("progress map poisoned").insert(job_id, event);
        }));

        let started = std::time::Instant::now();
        let result = provider
            .export_vm(&job.definition.vm_path, &job.definition.provider_options, reporter, cancel)
            .await;
        let _ = provider.disconnect().await;

        match result {
            Ok(export) => {
                self.metrics.incr_bytes_exported(&job.definition.provider, export.byte_size);
                let secs = started.elapsed().as_secs_f64();
                if secs > 0.0 {
                    self.metrics.observe_export_speed(&job.definition.provider, export.byte_size as f64 / secs);
                }
                Ok(JobResult::success(serde_json::to_value(&export).ok()))
            }
            Err(err) => {
                self.metrics.incr_errors_total(err.category(), &job.definition.provider);
                Err(err)
            }
        }
    }
}

/// Owns job submission, cancellation, deletion, and the Store.update
/// persistence discipline for worker-reported outcomes.
pub struct JobManager {
    store: Arc<dyn Store>,
    queue: Arc<JobQueue>,
    pool: Arc<WorkerPool>,
    metrics: Arc<dyn MetricsSink>,
    audit: Arc<dyn AuditSink>,
    handler: Arc<ExportJobHandler>,
    collector: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ProviderRegistry>,
        metrics: Arc<dyn MetricsSink>,
        audit: Arc<dyn AuditSink>,
        queue_config: QueueConfig,
        retry_policy: crate::jobs::RetryPolicy,
    ) -> Arc<Self> {
        let queue = Arc::new(JobQueue::new("export-jobs", queue_config.max_queue_size));
        let handler = Arc::new(ExportJobHandler::new(registry, metrics.clone()));
        let pool = WorkerPool::new(queue.clone(), handler.clone() as Arc<dyn JobHandler>, queue_config, retry_policy);

        Arc::new(Self {
            store,
            queue,
            pool,
            metrics,
            audit,
            handler,
            collector: Mutex::new(None),
        })
    }

    /// Starts the worker pool and the results-collector task. Must be called
    /// once before any job can run to completion.
    pub async fn start(self: &Arc<Self>) -> crate::Result<()> {
        self.load_pending_from_store().await?;
        let results = self.pool.take_results().await.ok_or_else(|| crate::Error::Other("results channel already taken".into()))?;
        self.pool.start().await;
        self.spawn_collector(results).await;
        Ok(())
    }

    /// Re-populates the in-memory queue from Store-persisted Pending jobs,
    /// oldest submission first within each priority band. Covers both a
    /// daemon restart with a non-empty backlog and jobs submitted by a
    /// separate `vmexportd job submit` invocation while this process wasn't
    /// running to enqueue them itself.
    async fn load_pending_from_store(&self) -> crate::Result<()> {
        let mut pending = self.store.list_jobs(&JobQuery::new().with_status(JobStatus::Pending)).await?;
        pending.sort_by_key(|j| j.submitted_at);
        let count = pending.len();
        for job in pending {
            let job_id = job.id;
            if let Err(e) = self.queue.enqueue(job) {
                warn!(job_id = %job_id, error = %e, "failed to re-enqueue persisted pending job on startup");
            }
        }
        if count > 0 {
            info!(count, "re-enqueued persisted pending jobs on startup");
        }
        Ok(())
    }

    async fn spawn_collector(self: &Arc<Self>, mut results: mpsc::Receiver<JobOutcome>) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(outcome) = results.recv().await {
                manager.handle_outcome(outcome).await;
            }
        });
        *self.collector.lock().await = Some(handle);
    }

    async fn handle_outcome(&self, outcome: JobOutcome) {
        let JobOutcome { job, .. } = outcome;

        self.metrics.incr_jobs_total(job.status, &job.definition.provider);
        if let Some(duration) = job.duration() {
            self.metrics.observe_job_duration(job.status, &job.definition.provider, duration.num_milliseconds() as f64 / 1000.0);
        }

        if let Err(e) = self.persist_with_retry(&job).await {
            error!(job_id = %job.id, error = %e, "persisting terminal job state failed after all retries; job left Running in memory");
            return;
        }

        if job.definition.schedule_id.is_some() {
            let duration_seconds = job.duration().map(|d| d.num_milliseconds() as f64 / 1000.0);
            if let Err(e) = self
                .store
                .update_schedule_execution_for_job(job.id, job.status, duration_seconds, job.last_error.clone())
                .await
            {
                warn!(job_id = %job.id, error = %e, "failed to update schedule execution record with terminal outcome");
            }
        }

        let event_type = match job.status {
            JobStatus::Cancelled => AuditEventType::CancelJob,
            _ => AuditEventType::ExportVm,
        };
        // ConfigError/AuthError terminal failures audit as Denied (§7), not
        // a plain Failure -- the job never got a credential/config chance
        // to actually attempt the export.
        let status = match job.status {
            JobStatus::Completed => AuditStatus::Success,
            JobStatus::Failed if matches!(job.error_category.as_deref(), Some("auth") | Some("config")) => AuditStatus::Denied,
            _ => AuditStatus::Failure,
        };
        let mut event = AuditEvent::new(event_type, status).with_resource(job.id.to_string());
        if let Some(err) = &job.last_error {
            event = event.with_error(err.clone());
        }
        let _ = self.audit.record(event).await;
    }

    /// Store.update with the fixed 200/400/800 ms backoff schedule (§4.E).
    /// Persistent failure after all retries is the one documented
    /// inconsistency window: the job stays Running in memory even though it
    /// reached a terminal state, awaiting external reconciliation.
    async fn persist_with_retry(&self, job: &Job) -> crate::Result<()> {
        let mut last_err = None;
        for (attempt, delay_ms) in PERSIST_RETRY_BACKOFF_MS.iter().enumerate() {
            match self.store.update_job(job).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(job_id = %job.id, attempt = attempt + 1, error = %e, "Store.update failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(std::time::Duration::from_millis(*delay_ms)).await;
                }
            }
        }
        match self.store.update_job(job).await {
            Ok(()) => Ok(()),
            Err(_) => Err(last_err.unwrap_or_else(|| crate::Error::Other("persist retry exhausted".into()))),
        }
    }

    pub async fn submit(&self, definition: JobDefinition) -> crate::Result<JobId> {
        definition.validate()?;
        if !self.handler_knows(&definition.provider) {
            return Err(crate::Error::unknown_provider(definition.provider.clone()));
        }

        let job = Job::new(definition);
        let job_id = job.id;
        self.store.create_job(&job).await?;
        if let Err(e) = self.queue.enqueue(job) {
            let _ = self.store.delete_job(job_id).await;
            return Err(e);
        }

        let event = AuditEvent::new(AuditEventType::CreateJob, AuditStatus::Success).with_resource(job_id.to_string());
        let _ = self.audit.record(event).await;
        Ok(job_id)
    }

    fn handler_knows(&self, tag: &str) -> bool {
        self.handler.registry.known_tags().contains(&tag)
    }

    pub async fn cancel(&self, id: JobId) -> crate::Result<()> {
        let mut job = self.store.get_job(id).await?.ok_or_else(|| crate::Error::not_found(format!("job {}", id)))?;

        match job.status {
            JobStatus::Pending => {
                job.mark_cancelled();
                self.store.update_job(&job).await?;
            }
            JobStatus::Running => {
                self.pool.cancel_job(id);
            }
            _ => {}
        }

        let event = AuditEvent::new(AuditEventType::CancelJob, AuditStatus::Success).with_resource(id.to_string());
        let _ = self.audit.record(event).await;
        Ok(())
    }

    pub async fn delete(&self, id: JobId) -> crate::Result<()> {
        let job = self.store.get_job(id).await?.ok_or_else(|| crate::Error::not_found(format!("job {}", id)))?;
        if !job.status.is_terminal() {
            return Err(crate::Error::validation("cannot delete a non-terminal job"));
        }
        self.store.delete_job(id).await?;
        let event = AuditEvent::new(AuditEventType::DeleteJob, AuditStatus::Success).with_resource(id.to_string());
        let _ = self.audit.record(event).await;
        Ok(())
    }

    pub async fn get(&self, id: JobId) -> crate::Result<Option<Job>> {
        self.store.get_job(id).await
    }

    pub async fn list(&self, query: &JobQuery) -> crate::Result<Vec<Job>> {
        self.store.list_jobs(query).await
    }

    pub async fn statistics(&self) -> crate::Result<JobStatistics> {
        self.store.job_statistics().await
    }

    pub fn queue_metrics(&self) -> crate::jobs::QueueMetrics {
        self.queue.metrics()
    }

    pub fn worker_stats(&self) -> crate::jobs::WorkerStats {
        self.pool.stats()
    }

    /// Number of workers currently inside a handler call, for the
    /// `active_jobs` gauge (§4.G).
    pub fn worker_stats_active(&self) -> usize {
        self.pool.active_workers()
    }

    pub fn progress(&self, id: JobId) -> Option<crate::progress::ProgressEvent> {
        self.handler.progress_snapshot(id)
    }

    /// Graceful shutdown: stop accepting new work and drain the pool.
    pub async fn shutdown(&self, deadline: std::time::Duration) -> crate::Result<()> {
        self.pool.shutdown(deadline).await?;
        if let Some(handle) = self.collector.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    /// Daemon-restart reconciliation (§9 open question): jobs that were
    /// persisted as Running when the process died have no worker driving
    /// them anymore. We resolve this the documented way -- mark them Failed
    /// with an explanatory reason rather than leaving them stuck forever.
    pub async fn reconcile_running_on_restart(&self) -> crate::Result<u64> {
        let running = self.store.list_jobs(&JobQuery::new().with_status(JobStatus::Running)).await?;
        let mut reconciled = 0u64;
        for mut job in running {
            job.mark_failed("daemon restart");
            self.store.update_job(&job).await?;
            reconciled += 1;
        }
        if reconciled > 0 {
            info!(count = reconciled, "reconciled Running jobs left over from a previous daemon instance");
        }
        Ok(reconciled)
    }
}

/// Resolves the JobManager's submit path into the [`JobSubmitter`] contract
/// the scheduler depends on, so a scheduled firing looks identical to an
/// external submission from the scheduler's point of view.
#[async_trait]
impl JobSubmitter for JobManager {
    async fn submit(&self, job: Job) -> crate::Result<()> {
        self.store.create_job(&job).await?;
        self.queue.enqueue(job)
    }

    async fn cancel_non_terminal_for_schedule(&self, schedule_id: ScheduledJobId) -> crate::Result<Vec<JobId>> {
        let jobs = self.store.list_jobs(&JobQuery::new().with_schedule(schedule_id)).await?;
        let mut cancelled = Vec::new();
        for job in jobs.into_iter().filter(|j| j.status.is_active()) {
            self.cancel(job.id).await?;
            cancelled.push(job.id);
        }
        Ok(cancelled)
    }

    async fn non_terminal_exists_for_schedule(&self, schedule_id: ScheduledJobId) -> crate::Result<bool> {
        let jobs = self.store.list_jobs(&JobQuery::new().with_schedule(schedule_id)).await?;
        Ok(jobs.iter().any(|j| j.status.is_active()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopAuditSink;
    use crate::metrics::NoopMetricsSink;
    use crate::provider::LocalFilesystemProvider;
    use crate::store::InMemoryStore;

    fn registry() -> Arc<ProviderRegistry> {
        let mut r = ProviderRegistry::new();
        r.register("local", |_cfg| Ok(Arc::new(LocalFilesystemProvider::new()) as Arc<dyn crate::provider::ExportProvider>));
        Arc::new(r)
    }

    fn def(vm_path: impl Into<String>, output_path: impl Into<String>) -> JobDefinition {
        JobDefinition {
            name: "t".to_string(),
            vm_path: vm_path.into(),
            output_path: output_path.into(),
            provider: "local".to_string(),
            provider_options: serde_json::json!({}),
            priority: crate::jobs::JobPriority::Normal,
            max_retries: 1,
            timeout_secs: 10,
            tags: vec![],
            schedule_id: None,
        }
    }

    #[tokio::test]
    async fn submit_unknown_provider_is_rejected_without_persisting() {
        let store = Arc::new(InMemoryStore::new());
        let manager = JobManager::new(
            store.clone(),
            registry(),
            Arc::new(NoopMetricsSink),
            Arc::new(NoopAuditSink),
            QueueConfig::default(),
            crate::jobs::RetryPolicy::default(),
        );

        let mut definition = def("/vms/a", "/out/a.ova");
        definition.provider = "nonexistent".to_string();
        let err = manager.submit(definition).await.unwrap_err();
        assert!(matches!(err, crate::Error::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn submit_persists_and_enqueues() {
        let store = Arc::new(InMemoryStore::new());
        let manager = JobManager::new(
            store.clone(),
            registry(),
            Arc::new(NoopMetricsSink),
            Arc::new(NoopAuditSink),
            QueueConfig::default(),
            crate::jobs::RetryPolicy::default(),
        );

        let job_id = manager.submit(def("/vms/a", "/out/a.ova")).await.unwrap();
        let job = manager.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(manager.queue_metrics().current_size, 1);
    }

    #[tokio::test]
    async fn reconcile_marks_running_jobs_failed() {
        let store = Arc::new(InMemoryStore::new());
        let mut job = Job::new(def("/vms/a", "/out/a.ova"));
        job.mark_started(Uuid::new_v4());
        store.create_job(&job).await.unwrap();

        let manager = JobManager::new(
            store.clone(),
            registry(),
            Arc::new(NoopMetricsSink),
            Arc::new(NoopAuditSink),
            QueueConfig::default(),
            crate::jobs::RetryPolicy::default(),
        );

        let reconciled = manager.reconcile_running_on_restart().await.unwrap();
        assert_eq!(reconciled, 1);
        let refetched = manager.get(job.id).await.unwrap().unwrap();
        assert_eq!(refetched.status, JobStatus::Failed);
        assert_eq!(refetched.last_error.as_deref(), Some("daemon restart"));
    }

    #[tokio::test]
    async fn delete_rejects_non_terminal_job() {
        let store = Arc::new(InMemoryStore::new());
        let manager = JobManager::new(
            store.clone(),
            registry(),
            Arc::new(NoopMetricsSink),
            Arc::new(NoopAuditSink),
            QueueConfig::default(),
            crate::jobs::RetryPolicy::default(),
        );
        let job_id = manager.submit(def("/vms/a", "/out/a.ova")).await.unwrap();
        let err = manager.delete(job_id).await.unwrap_err();
        assert!(matches!(err, crate::Error::Validation(_)));
    }

    #[tokio::test]
    async fn schedule_owned_job_completion_patches_execution_record() {
        let store = Arc::new(InMemoryStore::new());
        let manager = JobManager::new(
            store.clone(),
            registry(),
            Arc::new(NoopMetricsSink),
            Arc::new(NoopAuditSink),
            QueueConfig::default(),
            crate::jobs::RetryPolicy::default(),
        );

        let schedule_id = Uuid::new_v4();
        let mut definition = def("/vms/a", "/out/a.ova");
        definition.schedule_id = Some(schedule_id);
        let mut job = Job::new(definition);
        job.mark_started(Uuid::new_v4());
        store.create_job(&job).await.unwrap();

        let record = crate::schedule::ScheduleExecution::new(schedule_id, job.id, JobStatus::Pending);
        store.append_schedule_execution(&record).await.unwrap();

        job.mark_completed(JobResult::success(None));
        manager.handle_outcome(JobOutcome { job: job.clone(), worker_id: Uuid::new_v4() }).await;

        let executions = store.list_schedule_executions(schedule_id, 10).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, JobStatus::Completed);
        assert!(executions[0].duration_seconds.is_some());
    }

    struct RecordingAuditSink {
        events: std::sync::Mutex<Vec<AuditEvent>>,
    }

    #[async_trait]
    impl AuditSink for RecordingAuditSink {
        async fn record(&self, event: AuditEvent) -> crate::Result<()> {
            self.events.lock().expect("recording sink mutex poisoned").push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn auth_failure_audits_as_denied() {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(RecordingAuditSink { events: std::sync::Mutex::new(Vec::new()) });
        let manager = JobManager::new(
            store.clone(),
            registry(),
            Arc::new(NoopMetricsSink),
            audit.clone(),
            QueueConfig::default(),
            crate::jobs::RetryPolicy::default(),
        );

        let mut job = Job::new(def("/vms/a", "/out/a.ova"));
        store.create_job(&job).await.unwrap();
        job.mark_started(Uuid::new_v4());
        job.mark_failed_with_category("authentication error: bad credentials", "auth");

        manager.handle_outcome(JobOutcome { job, worker_id: Uuid::new_v4() }).await;

        let events = audit.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AuditStatus::Denied);
    }
}
