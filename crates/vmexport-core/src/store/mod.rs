//! Durable persistence contract for jobs and scheduled jobs.
//!
//! Any conforming backend — relational, embedded, or otherwise — satisfies
//! [`Store`]; the shipped implementation (`sqlite`) is SQLite-backed, and an
//! in-memory implementation (`memory`) backs unit tests without touching the
//! filesystem.

pub mod memory;
pub mod migrate;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use migrate::{auto_migrate, DbStatus, Migrator};
pub use sqlite::SqliteStore;

use crate::jobs::{Job, JobId, JobQuery, JobStatus};
use crate::schedule::{ScheduleExecution, ScheduledJob, ScheduledJobId};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct JobStatistics {
    pub counts_by_status: HashMap<JobStatus, u64>,
}

/// The minimum durable persistence contract the core requires.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn create_job(&self, job: &Job) -> crate::Result<()>;
    async fn update_job(&self, job: &Job) -> crate::Result<()>;
    async fn get_job(&self, id: JobId) -> crate::Result<Option<Job>>;
    async fn delete_job(&self, id: JobId) -> crate::Result<()>;
    async fn list_jobs(&self, query: &JobQuery) -> crate::Result<Vec<Job>>;
    async fn job_statistics(&self) -> crate::Result<JobStatistics>;

    async fn create_scheduled_job(&self, job: &ScheduledJob) -> crate::Result<()>;
    async fn update_scheduled_job(&self, job: &ScheduledJob) -> crate::Result<()>;
    async fn get_scheduled_job(&self, id: ScheduledJobId) -> crate::Result<Option<ScheduledJob>>;
    async fn delete_scheduled_job(&self, id: ScheduledJobId) -> crate::Result<()>;
    async fn list_scheduled_jobs(&self, enabled_only: bool) -> crate::Result<Vec<ScheduledJob>>;

    async fn append_schedule_execution(&self, record: &ScheduleExecution) -> crate::Result<()>;
    /// Patches the execution record produced for `job_id` once that job
    /// reaches a terminal state -- the record is appended at fire time with
    /// `status = Pending` and no duration (the job hasn't run yet), so this
    /// is the only path that ever gives it its real terminal status.
    async fn update_schedule_execution_for_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        duration_seconds: Option<f64>,
        error: Option<String>,
    ) -> crate::Result<()>;
    async fn list_schedule_executions(&self, schedule_id: ScheduledJobId, limit: u32) -> crate::Result<Vec<ScheduleExecution>>;
    /// Delete execution records older than `before` for `schedule_id`. Callers
    /// must collect ids to delete under their own lock and call this outside
    /// it — the store itself does no locking beyond the backend's own.
    /// Successful (`Completed`) and failed (`Failed`/`Cancelled`) records are
    /// bounded independently, per §4.F; still-pending/running records are
    /// never pruned.
    async fn prune_schedule_executions(&self, schedule_id: ScheduledJobId, keep_successful: usize, keep_failed: usize) -> crate::Result<u64>;
}

#[cfg(test)]
mod contract_tests {
    use super::*;
    use crate::jobs::job::JobDefinition;
    use crate::jobs::{Job, JobPriority, JobStatus};

    fn def() -> JobDefinition {
        JobDefinition {
            name: "t".to_string(),
            vm_path: "/vms/a".to_string(),
            output_path: "/out/a.ova".to_string(),
            provider: "local".to_string(),
            provider_options: serde_json::json!({}),
            priority: JobPriority::Normal,
            max_retries: 3,
            timeout_secs: 60,
            tags: vec![],
            schedule_id: None,
        }
    }

    async fn exercise_store<S: Store>(store: &S) {
        let job = Job::new(def());
        store.create_job(&job).await.unwrap();

        let fetched = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.definition.name, job.definition.name);

        let dup = store.create_job(&job).await;
        assert!(matches!(dup, Err(crate::Error::AlreadyExists(_))));

        let mut updated = fetched.clone();
        updated.mark_completed(crate::jobs::JobResult::success(None));
        store.update_job(&updated).await.unwrap();
        let refetched = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(refetched.status, JobStatus::Completed);

        let stats = store.job_statistics().await.unwrap();
        assert_eq!(*stats.counts_by_status.get(&JobStatus::Completed).unwrap(), 1);

        store.delete_job(job.id).await.unwrap();
        assert!(store.get_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_satisfies_contract() {
        let store = InMemoryStore::new();
        exercise_store(&store).await;
    }
}
