//! Bounded worker pool driving the priority queue.

use crate::config::QueueConfig;
use crate::jobs::{Job, JobHandler, JobId, JobQueue, RetryPolicy};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Outcome of one job's terminal attempt, posted for external observers
/// (the Job Manager persists it; metrics/audit consume it downstream).
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: Job,
    pub worker_id: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
    pub jobs_retried: u64,
}

impl WorkerStats {
    pub fn success_rate(&self) -> f64 {
        if self.jobs_processed == 0 {
            0.0
        } else {
            self.jobs_succeeded as f64 / self.jobs_processed as f64
        }
    }
}

struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    retried: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            retried: AtomicU64::new(0),
        }
    }
}

/// A pool of `max_workers` tasks polling `queue`. Workers never hold the
/// queue's mutex across handler invocation or backoff sleeps.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: QueueConfig,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    busy: Vec<Arc<AtomicBool>>,
    results_tx: mpsc::Sender<JobOutcome>,
    results_rx: tokio::sync::Mutex<Option<mpsc::Receiver<JobOutcome>>>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Cancellation token for each job currently inside a handler call, so an
    /// external cancel request on a Running job can reach it without the pool
    /// exposing worker-slot identity.
    in_flight: StdMutex<HashMap<JobId, CancellationToken>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>, config: QueueConfig, retry_policy: RetryPolicy) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.results_channel_depth);
        let busy = (0..config.max_workers).map(|_| Arc::new(AtomicBool::new(false))).collect();
        Arc::new(Self {
            queue,
            handler,
            config,
            retry_policy,
            cancel: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
            busy,
            results_tx: tx,
            results_rx: tokio::sync::Mutex::new(Some(rx)),
            handles: tokio::sync::Mutex::new(Vec::new()),
            in_flight: StdMutex::new(HashMap::new()),
        })
    }

    /// Take the results receiver; callable exactly once.
    pub async fn take_results(&self) -> Option<mpsc::Receiver<JobOutcome>> {
        self.results_rx.lock().await.take()
    }

    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;
        for idx in 0..self.config.max_workers {
            let pool = self.clone();
            let worker_id = Uuid::new_v4();
            let busy = self.busy[idx].clone();
            handles.push(tokio::spawn(async move {
                pool.run(worker_id, busy).await;
            }));
        }
        info!("worker pool started with {} workers", self.config.max_workers);
    }

    async fn run(self: Arc<Self>, worker_id: Uuid, busy: Arc<AtomicBool>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let Some(job) = self.queue.dequeue() else {
                tokio::time::sleep(std::time::Duration::from_millis(self.config.idle_poll_ms)).await;
                continue;
            };

            busy.store(true, Ordering::SeqCst);
            self.process(worker_id, job).await;
            busy.store(false, Ordering::SeqCst);
            self.counters.processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn process(&self, worker_id: Uuid, mut job: Job) {
        job.mark_started(worker_id);
        let timeout = job.timeout();
        let job_cancel = self.cancel.child_token();
        self.in_flight.lock().expect("in_flight mutex poisoned").insert(job.id, job_cancel.clone());

        let outcome = tokio::time::timeout(timeout, self.handler.handle(&job, job_cancel)).await;
        self.in_flight.lock().expect("in_flight mutex poisoned").remove(&job.id);

        match outcome {
            Ok(Ok(result)) => {
                job.mark_completed(result);
                self.queue.record_completed();
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                let _ = self.results_tx.send(JobOutcome { job, worker_id }).await;
            }
            Ok(Err(err)) => {
                self.handle_failure(worker_id, job, err).await;
            }
            Err(_) => {
                self.queue.record_timed_out();
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                let err = crate::Error::timeout(format!("job exceeded {:?}", timeout));
                self.handle_failure(worker_id, job, err).await;
            }
        }
    }

    async fn handle_failure(&self, worker_id: Uuid, mut job: Job, err: crate::Error) {
        warn!(job_id = %job.id, error = %err, "job attempt failed");

        if matches!(err, crate::Error::Cancelled(_)) {
            job.mark_cancelled();
            job.last_error = Some(err.to_string());
            let _ = self.results_tx.send(JobOutcome { job, worker_id }).await;
            return;
        }

        if job.can_retry() && self.retry_policy.should_retry(&err) {
            let delay = self
                .retry_policy
                .calculate_delay(job.retry_count + 1, &err)
                .unwrap_or(std::time::Duration::from_secs(1));

            job.last_error = Some(err.to_string());
            job.prepare_retry();
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            self.queue.record_retried();

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return,
            }

            if let Err(e) = self.queue.enqueue(job) {
                error!("failed to re-enqueue job after retry backoff: {}", e);
            }
        } else {
            job.mark_failed_with_category(err.to_string(), err.category());
            self.queue.record_failed();
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            let _ = self.results_tx.send(JobOutcome { job, worker_id }).await;
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            jobs_processed: self.counters.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
            jobs_timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            jobs_retried: self.counters.retried.load(Ordering::Relaxed),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.busy.iter().filter(|b| b.load(Ordering::SeqCst)).count()
    }

    /// Cancel the pool's parent token and wait up to `deadline` for all
    /// workers to drain. Returns `Err(Timeout)` if they don't.
    pub async fn shutdown(&self, deadline: std::time::Duration) -> crate::Result<()> {
        self.cancel.cancel();
        let mut handles = self.handles.lock().await;
        let joins = std::mem::take(&mut *handles);
        let all = futures::future::join_all(joins);
        match tokio::time::timeout(deadline, all).await {
            Ok(_) => Ok(()),
            Err(_) => Err(crate::Error::timeout("worker pool did not drain before deadline")),
        }
    }

    /// Signal cancellation to a job currently running inside a handler.
    /// Returns `false` if no such job is in flight (already finished, or
    /// never dequeued).
    pub fn cancel_job(&self, id: JobId) -> bool {
        match self.in_flight.lock().expect("in_flight mutex poisoned").get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobDefinition;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail_times: usize,
    }

    #[async_trait::async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job, _cancel: CancellationToken) -> crate::Result<crate::jobs::JobResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(crate::Error::Other("synthetic failure".into()))
            } else {
                Ok(crate::jobs::JobResult::success(None))
            }
        }
    }

    fn def() -> JobDefinition {
        JobDefinition {
            name: "t".to_string(),
            vm_path: "/vms/a".to_string(),
            output_path: "/out/a.ova".to_string(),
            provider: "local".to_string(),
            provider_options: serde_json::json!({}),
            priority: crate::jobs::JobPriority::Normal,
            max_retries: 5,
            timeout_secs: 5,
            tags: vec![],
            schedule_id: None,
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let queue = Arc::new(JobQueue::new("q", 10));
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler { calls: calls.clone(), fail_times: 2 });
        let mut config = QueueConfig::default();
        config.max_workers = 1;
        config.idle_poll_ms = 5;
        let retry = RetryPolicy::Linear { unit: std::time::Duration::from_millis(5), max_attempts: 5 };
        let pool = WorkerPool::new(queue.clone(), handler, config, retry);
        let mut results = pool.take_results().await.unwrap();

        queue.enqueue(Job::new(def())).unwrap();
        pool.start().await;

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), results.recv())
            .await
            .expect("did not receive outcome in time")
            .expect("channel closed");

        assert!(outcome.job.status.is_terminal());
        assert_eq!(outcome.job.retry_count, 2);
        pool.shutdown(std::time::Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_terminate_failed() {
        let queue = Arc::new(JobQueue::new("q", 10));
        let handler = Arc::new(CountingHandler { calls: Arc::new(AtomicUsize::new(0)), fail_times: 100 });
        let mut config = QueueConfig::default();
        config.max_workers = 1;
        config.idle_poll_ms = 5;
        let retry = RetryPolicy::Linear { unit: std::time::Duration::from_millis(2), max_attempts: 2 };
        let pool = WorkerPool::new(queue.clone(), handler, config, retry);
        let mut results = pool.take_results().await.unwrap();

        let mut job_def = def();
        job_def.max_retries = 2;
        queue.enqueue(Job::new(job_def)).unwrap();
        pool.start().await;

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), results.recv())
            .await
            .expect("did not receive outcome in time")
            .expect("channel closed");

        assert_eq!(outcome.job.status, crate::jobs::JobStatus::Failed);
        pool.shutdown(std::time::Duration::from_secs(1)).await.unwrap();
    }

    struct WaitForCancelHandler;

    #[async_trait::async_trait]
    impl JobHandler for WaitForCancelHandler {
        async fn handle(&self, _job: &Job, cancel: CancellationToken) -> crate::Result<crate::jobs::JobResult> {
            cancel.cancelled().await;
            Err(crate::Error::cancelled("handler observed cancellation"))
        }
    }

    #[tokio::test]
    async fn cancel_job_reaches_running_handler() {
        let queue = Arc::new(JobQueue::new("q", 10));
        let handler = Arc::new(WaitForCancelHandler);
        let mut config = QueueConfig::default();
        config.max_workers = 1;
        config.idle_poll_ms = 5;
        let pool = WorkerPool::new(queue.clone(), handler, config, RetryPolicy::None);
        let mut results = pool.take_results().await.unwrap();

        let job = Job::new(def());
        let job_id = job.id;
        queue.enqueue(job).unwrap();
        pool.start().await;

        // Give the worker a moment to dequeue and register the in-flight token.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(pool.cancel_job(job_id));

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), results.recv())
            .await
            .expect("did not receive outcome in time")
            .expect("channel closed");
        assert_eq!(outcome.job.status, crate::jobs::JobStatus::Cancelled);
        pool.shutdown(std::time::Duration::from_secs(1)).await.unwrap();
    }
}
