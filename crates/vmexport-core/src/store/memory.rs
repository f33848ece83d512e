//! In-memory [`Store`] implementation. Backs unit tests; not durable.

use crate::jobs::{Job, JobId, JobQuery, JobStatus};
use crate::schedule::{ScheduleExecution, ScheduledJob, ScheduledJobId};
use crate::store::{JobStatistics, Store};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    job_history: Vec<(JobId, JobStatus, chrono::DateTime<chrono::Utc>)>,
    scheduled_jobs: HashMap<ScheduledJobId, ScheduledJob>,
    schedule_executions: HashMap<ScheduledJobId, Vec<ScheduleExecution>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_job(&self, job: &Job) -> crate::Result<()> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if inner.jobs.contains_key(&job.id) {
            return Err(crate::Error::already_exists(format!("job {}", job.id)));
        }
        inner.jobs.insert(job.id, job.clone());
        inner.job_history.push((job.id, job.status, chrono::Utc::now()));
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> crate::Result<()> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if !inner.jobs.contains_key(&job.id) {
            return Err(crate::Error::not_found(format!("job {}", job.id)));
        }
        inner.jobs.insert(job.id, job.clone());
        inner.job_history.push((job.id, job.status, chrono::Utc::now()));
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> crate::Result<Option<Job>> {
        Ok(self.inner.read().expect("store lock poisoned").jobs.get(&id).cloned())
    }

    async fn delete_job(&self, id: JobId) -> crate::Result<()> {
        self.inner.write().expect("store lock poisoned").jobs.remove(&id);
        Ok(())
    }

    async fn list_jobs(&self, query: &JobQuery) -> crate::Result<Vec<Job>> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut jobs: Vec<Job> = inner.jobs.values().filter(|j| query.matches(j)).cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(offset) = query.offset {
            jobs = jobs.into_iter().skip(offset as usize).collect();
        }
        if let Some(limit) = query.limit {
            jobs.truncate(limit as usize);
        }
        Ok(jobs)
    }

    async fn job_statistics(&self) -> crate::Result<JobStatistics> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut counts = std::collections::HashMap::new();
        for job in inner.jobs.values() {
            *counts.entry(job.status).or_insert(0u64) += 1;
        }
        Ok(JobStatistics { counts_by_status: counts })
    }

    async fn create_scheduled_job(&self, job: &ScheduledJob) -> crate::Result<()> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if inner.scheduled_jobs.contains_key(&job.id) {
            return Err(crate::Error::already_exists(format!("scheduled job {}", job.id)));
        }
        inner.scheduled_jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_scheduled_job(&self, job: &ScheduledJob) -> crate::Result<()> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if !inner.scheduled_jobs.contains_key(&job.id) {
            return Err(crate::Error::not_found(format!("scheduled job {}", job.id)));
        }
        inner.scheduled_jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_scheduled_job(&self, id: ScheduledJobId) -> crate::Result<Option<ScheduledJob>> {
        Ok(self.inner.read().expect("store lock poisoned").scheduled_jobs.get(&id).cloned())
    }

    async fn delete_scheduled_job(&self, id: ScheduledJobId) -> crate::Result<()> {
        self.inner.write().expect("store lock poisoned").scheduled_jobs.remove(&id);
        Ok(())
    }

    async fn list_scheduled_jobs(&self, enabled_only: bool) -> crate::Result<Vec<ScheduledJob>> {
        Ok(self
            .inner
            .read()
            .expect("store lock poisoned")
            .scheduled_jobs
            .values()
            .filter(|s| !enabled_only || s.enabled)
            .cloned()
            .collect())
    }

    async fn append_schedule_execution(&self, record: &ScheduleExecution) -> crate::Result<()> {
        self.inner
            .write()
            .expect("store lock poisoned")
            .schedule_executions
            .entry(record.schedule_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn update_schedule_execution_for_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        duration_seconds: Option<f64>,
        error: Option<String>,
    ) -> crate::Result<()> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        for records in inner.schedule_executions.values_mut() {
            if let Some(record) = records.iter_mut().find(|r| r.job_id == job_id) {
                record.status = status;
                record.duration_seconds = duration_seconds;
                record.error = error;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn list_schedule_executions(&self, schedule_id: ScheduledJobId, limit: u32) -> crate::Result<Vec<ScheduleExecution>> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut records = inner.schedule_executions.get(&schedule_id).cloned().unwrap_or_default();
        records.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn prune_schedule_executions(&self, schedule_id: ScheduledJobId, keep_successful: usize, keep_failed: usize) -> crate::Result<u64> {
        // Collect ids to drop under the lock, release it, then mutate -- the
        // source's retention code deadlocks by deleting while still holding
        // this lock; we never do that. Successful and failed records are
        // bounded independently; still-pending/running ones are never pruned.
        let (keep_successful_at, keep_failed_at): (Vec<_>, Vec<_>) = {
            let inner = self.inner.read().expect("store lock poisoned");
            let mut records = inner.schedule_executions.get(&schedule_id).cloned().unwrap_or_default();
            records.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
            let successful = records
                .iter()
                .filter(|r| r.status == JobStatus::Completed)
                .take(keep_successful)
                .map(|r| r.executed_at)
                .collect();
            let failed = records
                .iter()
                .filter(|r| matches!(r.status, JobStatus::Failed | JobStatus::Cancelled))
                .take(keep_failed)
                .map(|r| r.executed_at)
                .collect();
            (successful, failed)
        };

        let mut inner = self.inner.write().expect("store lock poisoned");
        let mut removed = 0u64;
        if let Some(records) = inner.schedule_executions.get_mut(&schedule_id) {
            let before = records.len();
            records.retain(|r| match r.status {
                JobStatus::Completed => keep_successful_at.contains(&r.executed_at),
                JobStatus::Failed | JobStatus::Cancelled => keep_failed_at.contains(&r.executed_at),
                JobStatus::Pending | JobStatus::Running => true,
            });
            removed = (before - records.len()) as u64;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobDefinition;

    fn def() -> JobDefinition {
        JobDefinition {
            name: "t".into(),
            vm_path: "/vms/a".into(),
            output_path: "/out/a.ova".into(),
            provider: "local".into(),
            provider_options: serde_json::json!({}),
            priority: crate::jobs::JobPriority::Normal,
            max_retries: 3,
            timeout_secs: 60,
            tags: vec![],
            schedule_id: None,
        }
    }

    #[tokio::test]
    async fn list_orders_by_created_at_desc() {
        let store = InMemoryStore::new();
        let older = Job::new(def());
        let mut newer = Job::new(def());
        newer.created_at = older.created_at + chrono::Duration::seconds(1);
        store.create_job(&older).await.unwrap();
        store.create_job(&newer).await.unwrap();

        let jobs = store.list_jobs(&JobQuery::new()).await.unwrap();
        assert_eq!(jobs[0].id, newer.id);
        assert_eq!(jobs[1].id, older.id);
    }

    #[tokio::test]
    async fn prune_keeps_latest_and_releases_lock_before_delete() {
        let store = InMemoryStore::new();
        let schedule_id = uuid::Uuid::new_v4();
        for i in 0..5 {
            let mut record = ScheduleExecution::new(schedule_id, uuid::Uuid::new_v4(), JobStatus::Completed);
            record.executed_at = chrono::Utc::now() + chrono::Duration::seconds(i);
            store.append_schedule_execution(&record).await.unwrap();
        }
        let removed = store.prune_schedule_executions(schedule_id, 2, 2).await.unwrap();
        assert_eq!(removed, 3);
        let remaining = store.list_schedule_executions(schedule_id, 10).await.unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn prune_bounds_successful_and_failed_independently() {
        let store = InMemoryStore::new();
        let schedule_id = uuid::Uuid::new_v4();
        for i in 0..5 {
            let mut record = ScheduleExecution::new(schedule_id, uuid::Uuid::new_v4(), JobStatus::Completed);
            record.executed_at = chrono::Utc::now() + chrono::Duration::seconds(i);
            store.append_schedule_execution(&record).await.unwrap();
        }
        for i in 0..2 {
            let mut record = ScheduleExecution::new(schedule_id, uuid::Uuid::new_v4(), JobStatus::Failed);
            record.executed_at = chrono::Utc::now() + chrono::Duration::seconds(10 + i);
            store.append_schedule_execution(&record).await.unwrap();
        }

        let removed = store.prune_schedule_executions(schedule_id, 10, 1).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = store.list_schedule_executions(schedule_id, 20).await.unwrap();
        let successful = remaining.iter().filter(|r| r.status == JobStatus::Completed).count();
        let failed = remaining.iter().filter(|r| r.status == JobStatus::Failed).count();
        assert_eq!(successful, 5);
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn update_schedule_execution_for_job_patches_terminal_outcome() {
        let store = InMemoryStore::new();
        let schedule_id = uuid::Uuid::new_v4();
        let job_id = uuid::Uuid::new_v4();
        let record = ScheduleExecution::new(schedule_id, job_id, JobStatus::Pending);
        store.append_schedule_execution(&record).await.unwrap();

        store
            .update_schedule_execution_for_job(job_id, JobStatus::Failed, Some(12.5), Some("boom".to_string()))
            .await
            .unwrap();

        let records = store.list_schedule_executions(schedule_id, 10).await.unwrap();
        assert_eq!(records[0].status, JobStatus::Failed);
        assert_eq!(records[0].duration_seconds, Some(12.5));
        assert_eq!(records[0].error.as_deref(), Some("boom"));
    }
}
