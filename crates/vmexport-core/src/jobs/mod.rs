//! Priority job queue, worker pool, and job lifecycle management.
//!
//! ## Architecture
//!
//! The queue itself (`queue.rs`) is a synchronous, in-memory binary heap
//! behind a `std::sync::Mutex` — no I/O is ever held across that lock.
//! Workers (`worker.rs`) are `tokio` tasks that poll the queue, hand jobs to
//! a pluggable [`JobHandler`], and report outcomes on a bounded results
//! channel. [`manager::JobManager`] owns the state machine and is the only
//! component allowed to mutate a [`Job`]'s runtime fields.

pub mod job;
pub mod manager;
pub mod queue;
pub mod retry;
pub mod worker;

pub use job::{Job, JobDefinition, JobId, JobPriority, JobQuery, JobResult, JobStatus, ProgressRecord};
pub use manager::JobManager;
pub use queue::{JobQueue, QueueMetrics};
pub use retry::{ExponentialBackoff, RetryAttempt, RetryHistory, RetryPolicy};
pub use worker::{WorkerPool, WorkerStats};

use std::time::Duration;

/// Executes the provider-specific work behind a job. The concrete
/// implementation lives in [`manager::ExportJobHandler`], which resolves a
/// provider from the registry and drives the export pipeline; tests use a
/// simple closure-backed handler instead.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        job: &Job,
        cancel: tokio_util::sync::CancellationToken,
    ) -> crate::Result<JobResult>;
}

/// Context handed to a handler invocation; mirrors the bookkeeping the
/// worker already tracks but in a read-only, handler-facing shape.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub attempt: u32,
    pub max_attempts: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub timeout: Duration,
}

impl JobContext {
    pub fn new(job_id: JobId, attempt: u32, max_attempts: u32, timeout: Duration) -> Self {
        Self {
            job_id,
            attempt,
            max_attempts,
            started_at: chrono::Utc::now(),
            timeout,
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn elapsed(&self) -> Duration {
        let ms = (chrono::Utc::now() - self.started_at).num_milliseconds();
        Duration::from_millis(ms.max(0) as u64)
    }

    pub fn has_timed_out(&self) -> bool {
        self.elapsed() > self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_context_tracks_attempts() {
        let ctx = JobContext::new(uuid::Uuid::new_v4(), 1, 3, Duration::from_secs(60));
        assert!(!ctx.is_last_attempt());
        assert!(!ctx.has_timed_out());
    }
}
