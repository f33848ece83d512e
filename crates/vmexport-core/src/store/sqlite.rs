//! SQLite-backed [`Store`]. The shipped durable implementation; any
//! sqlx-supported backend could implement the same trait (see §4.A).

use crate::jobs::job::JobDefinition;
use crate::jobs::{Job, JobId, JobQuery, JobStatus, ProgressRecord};
use crate::schedule::{ConcurrencyPolicy, ScheduleExecution, ScheduledJob, ScheduledJobId};
use crate::store::{JobStatistics, Store};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(path: &str, pool_size: u32) -> crate::Result<Self> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };
        let pool = SqlitePoolOptions::new().max_connections(pool_size).connect(&url).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> crate::Result<()> {
        crate::store::migrate::Migrator::new(self.pool.clone()).migrate().await
    }

    /// Status of applied migrations and row counts, exposed for operator tooling.
    pub async fn status(&self) -> crate::Result<crate::store::migrate::DbStatus> {
        crate::store::migrate::Migrator::new(self.pool.clone()).status().await
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> crate::Result<Job> {
        let definition_json: String = row.try_get("definition_json")?;
        let definition: JobDefinition = serde_json::from_str(&definition_json)?;

        let progress_json: String = row.try_get("progress_json")?;
        let progress: ProgressRecord = serde_json::from_str(&progress_json)?;

        let result_json: Option<String> = row.try_get("result_json")?;
        let result = result_json.map(|s| serde_json::from_str(&s)).transpose()?;

        let status: String = row.try_get("status")?;
        let status = parse_job_status(&status)?;

        let worker_id: Option<String> = row.try_get("worker_id")?;
        let worker_id = worker_id.map(|s| uuid::Uuid::parse_str(&s)).transpose()?;

        Ok(Job {
            id: uuid::Uuid::parse_str(row.try_get::<String, _>("id")?.as_str())?,
            definition,
            status,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            created_at: parse_ts(row.try_get("created_at")?)?,
            started_at: row.try_get::<Option<String>, _>("started_at")?.map(parse_ts).transpose()?,
            completed_at: row.try_get::<Option<String>, _>("completed_at")?.map(parse_ts).transpose()?,
            worker_id,
            progress,
            result,
            last_error: row.try_get("error")?,
            // Not persisted (§6 durable schema has no column for it) -- it's
            // only used in-process to classify a terminal outcome's audit
            // status at the moment the worker reports it.
            error_category: None,
            submitted_at: parse_ts(row.try_get("submitted_at")?)?,
        })
    }

    fn row_to_scheduled_job(row: &sqlx::sqlite::SqliteRow) -> crate::Result<ScheduledJob> {
        let job_template_json: String = row.try_get("job_template_json")?;
        let job_template: JobDefinition = serde_json::from_str(&job_template_json)?;
        let tags_json: String = row.try_get("tags_json")?;
        let tags: Vec<String> = serde_json::from_str(&tags_json)?;
        let concurrency_policy: String = row.try_get("concurrency_policy")?;
        let concurrency_policy = match concurrency_policy.as_str() {
            "allow" => ConcurrencyPolicy::Allow,
            "forbid" => ConcurrencyPolicy::Forbid,
            "replace" => ConcurrencyPolicy::Replace,
            other => return Err(crate::Error::Other(format!("unknown concurrency policy: {}", other))),
        };

        Ok(ScheduledJob {
            id: uuid::Uuid::parse_str(row.try_get::<String, _>("id")?.as_str())?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            schedule: row.try_get("schedule")?,
            timezone: row.try_get("timezone")?,
            job_template,
            concurrency_policy,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            created_at: parse_ts(row.try_get("created_at")?)?,
            updated_at: parse_ts(row.try_get("updated_at")?)?,
            last_run: row.try_get::<Option<String>, _>("last_run")?.map(parse_ts).transpose()?,
            next_run: row.try_get::<Option<String>, _>("next_run")?.map(parse_ts).transpose()?,
            run_count: row.try_get::<i64, _>("run_count")? as u64,
            successful_history_limit: row.try_get::<i64, _>("successful_history_limit")? as usize,
            failed_history_limit: row.try_get::<i64, _>("failed_history_limit")? as usize,
            tags,
        })
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> crate::Result<ScheduleExecution> {
        let status: String = row.try_get("status")?;
        Ok(ScheduleExecution {
            schedule_id: uuid::Uuid::parse_str(row.try_get::<String, _>("schedule_id")?.as_str())?,
            job_id: uuid::Uuid::parse_str(row.try_get::<String, _>("job_id")?.as_str())?,
            executed_at: parse_ts(row.try_get("executed_at")?)?,
            status: parse_job_status(&status)?,
            duration_seconds: row.try_get("duration_seconds")?,
            error: row.try_get("error")?,
        })
    }
}

fn parse_ts(s: String) -> crate::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| crate::Error::Other(format!("invalid timestamp '{}': {}", s, e)))
}

fn parse_job_status(s: &str) -> crate::Result<JobStatus> {
    match s {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" => Ok(JobStatus::Cancelled),
        other => Err(crate::Error::Other(format!("unknown job status: {}", other))),
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn policy_str(policy: ConcurrencyPolicy) -> &'static str {
    match policy {
        ConcurrencyPolicy::Allow => "allow",
        ConcurrencyPolicy::Forbid => "forbid",
        ConcurrencyPolicy::Replace => "replace",
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_job(&self, job: &Job) -> crate::Result<()> {
        let existing = self.get_job(job.id).await?;
        if existing.is_some() {
            return Err(crate::Error::already_exists(format!("job {}", job.id)));
        }

        sqlx::query(
            "INSERT INTO jobs (id, name, vm_path, output_path, status, created_at, started_at, completed_at, \
             progress_json, result_json, error, definition_json, retry_count, submitted_at, worker_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(&job.definition.name)
        .bind(&job.definition.vm_path)
        .bind(&job.definition.output_path)
        .bind(status_str(job.status))
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&job.progress)?)
        .bind(job.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&job.last_error)
        .bind(serde_json::to_string(&job.definition)?)
        .bind(job.retry_count as i64)
        .bind(job.submitted_at.to_rfc3339())
        .bind(job.worker_id.map(|w| w.to_string()))
        .execute(&self.pool)
        .await?;

        self.append_history(job.id, job.status, None).await?;
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> crate::Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, started_at = ?, completed_at = ?, progress_json = ?, result_json = ?, \
             error = ?, retry_count = ?, submitted_at = ?, worker_id = ? WHERE id = ?",
        )
        .bind(status_str(job.status))
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&job.progress)?)
        .bind(job.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&job.last_error)
        .bind(job.retry_count as i64)
        .bind(job.submitted_at.to_rfc3339())
        .bind(job.worker_id.map(|w| w.to_string()))
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(crate::Error::not_found(format!("job {}", job.id)));
        }

        self.append_history(job.id, job.status, job.last_error.clone()).await?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> crate::Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn delete_job(&self, id: JobId) -> crate::Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?").bind(id.to_string()).execute(&self.pool).await?;
        Ok(())
    }

    async fn list_jobs(&self, query: &JobQuery) -> crate::Result<Vec<Job>> {
        // Filtering beyond status is applied in-process; the statuses/date
        // window still benefit from pushing down to SQL for large stores.
        let mut sql = String::from("SELECT * FROM jobs WHERE 1=1");
        if let Some(statuses) = &query.statuses {
            let list = statuses.iter().map(|s| format!("'{}'", status_str(*s))).collect::<Vec<_>>().join(",");
            sql.push_str(&format!(" AND status IN ({})", list));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
            if let Some(offset) = query.offset {
                sql.push_str(&format!(" OFFSET {}", offset));
            }
        }

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let job = Self::row_to_job(row)?;
            if query.matches(&job) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn job_statistics(&self) -> crate::Result<JobStatistics> {
        let rows = sqlx::query("SELECT status, COUNT(*) as n FROM jobs GROUP BY status").fetch_all(&self.pool).await?;
        let mut counts = std::collections::HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(parse_job_status(&status)?, n as u64);
        }
        Ok(JobStatistics { counts_by_status: counts })
    }

    async fn create_scheduled_job(&self, job: &ScheduledJob) -> crate::Result<()> {
        sqlx::query(
            "INSERT INTO scheduled_jobs (id, name, description, schedule, timezone, job_template_json, \
             concurrency_policy, enabled, created_at, updated_at, last_run, next_run, run_count, \
             successful_history_limit, failed_history_limit, tags_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.schedule)
        .bind(&job.timezone)
        .bind(serde_json::to_string(&job.job_template)?)
        .bind(policy_str(job.concurrency_policy))
        .bind(job.enabled as i64)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(job.last_run.map(|t| t.to_rfc3339()))
        .bind(job.next_run.map(|t| t.to_rfc3339()))
        .bind(job.run_count as i64)
        .bind(job.successful_history_limit as i64)
        .bind(job.failed_history_limit as i64)
        .bind(serde_json::to_string(&job.tags)?)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => crate::Error::already_exists(format!("scheduled job {}", job.id)),
            other => crate::Error::from(other),
        })?;
        Ok(())
    }

    async fn update_scheduled_job(&self, job: &ScheduledJob) -> crate::Result<()> {
        let result = sqlx::query(
            "UPDATE scheduled_jobs SET name = ?, description = ?, schedule = ?, timezone = ?, \
             concurrency_policy = ?, enabled = ?, updated_at = ?, last_run = ?, next_run = ?, run_count = ?, \
             successful_history_limit = ?, failed_history_limit = ?, tags_json = ? WHERE id = ?",
        )
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.schedule)
        .bind(&job.timezone)
        .bind(policy_str(job.concurrency_policy))
        .bind(job.enabled as i64)
        .bind(job.updated_at.to_rfc3339())
        .bind(job.last_run.map(|t| t.to_rfc3339()))
        .bind(job.next_run.map(|t| t.to_rfc3339()))
        .bind(job.run_count as i64)
        .bind(job.successful_history_limit as i64)
        .bind(job.failed_history_limit as i64)
        .bind(serde_json::to_string(&job.tags)?)
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(crate::Error::not_found(format!("scheduled job {}", job.id)));
        }
        Ok(())
    }

    async fn get_scheduled_job(&self, id: ScheduledJobId) -> crate::Result<Option<ScheduledJob>> {
        let row = sqlx::query("SELECT * FROM scheduled_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_scheduled_job).transpose()
    }

    async fn delete_scheduled_job(&self, id: ScheduledJobId) -> crate::Result<()> {
        sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?").bind(id.to_string()).execute(&self.pool).await?;
        Ok(())
    }

    async fn list_scheduled_jobs(&self, enabled_only: bool) -> crate::Result<Vec<ScheduledJob>> {
        let sql = if enabled_only {
            "SELECT * FROM scheduled_jobs WHERE enabled = 1"
        } else {
            "SELECT * FROM scheduled_jobs"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_scheduled_job).collect()
    }

    async fn append_schedule_execution(&self, record: &ScheduleExecution) -> crate::Result<()> {
        sqlx::query(
            "INSERT INTO schedule_executions (schedule_id, job_id, executed_at, status, duration_seconds, error) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.schedule_id.to_string())
        .bind(record.job_id.to_string())
        .bind(record.executed_at.to_rfc3339())
        .bind(status_str(record.status))
        .bind(record.duration_seconds)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_schedule_execution_for_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        duration_seconds: Option<f64>,
        error: Option<String>,
    ) -> crate::Result<()> {
        sqlx::query("UPDATE schedule_executions SET status = ?, duration_seconds = ?, error = ? WHERE job_id = ?")
            .bind(status_str(status))
            .bind(duration_seconds)
            .bind(&error)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_schedule_executions(&self, schedule_id: ScheduledJobId, limit: u32) -> crate::Result<Vec<ScheduleExecution>> {
        let rows = sqlx::query("SELECT * FROM schedule_executions WHERE schedule_id = ? ORDER BY executed_at DESC LIMIT ?")
            .bind(schedule_id.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn prune_schedule_executions(&self, schedule_id: ScheduledJobId, keep_successful: usize, keep_failed: usize) -> crate::Result<u64> {
        // Collect the row ids to drop under a read query, then delete by id
        // in a second statement -- never hold a lock across the delete (see
        // the open question in the design notes about the source's
        // retention deadlock). Successful and failed rows are bounded
        // independently; pending/running rows (not yet resolved) are never
        // pruned.
        let rows = sqlx::query("SELECT row_id, status FROM schedule_executions WHERE schedule_id = ? ORDER BY executed_at DESC")
            .bind(schedule_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        let mut successful_seen = 0usize;
        let mut failed_seen = 0usize;
        let mut to_delete: Vec<i64> = Vec::new();
        for row in &rows {
            let row_id: i64 = row.try_get("row_id")?;
            let status: String = row.try_get("status")?;
            match status.as_str() {
                "completed" => {
                    successful_seen += 1;
                    if successful_seen > keep_successful {
                        to_delete.push(row_id);
                    }
                }
                "failed" | "cancelled" => {
                    failed_seen += 1;
                    if failed_seen > keep_failed {
                        to_delete.push(row_id);
                    }
                }
                _ => {}
            }
        }
        if to_delete.is_empty() {
            return Ok(0);
        }

        let placeholders = to_delete.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM schedule_executions WHERE row_id IN ({})", placeholders);
        let mut q = sqlx::query(&sql);
        for id in &to_delete {
            q = q.bind(id);
        }
        let result = q.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

impl SqliteStore {
    async fn append_history(&self, job_id: JobId, status: JobStatus, details: Option<String>) -> crate::Result<()> {
        sqlx::query("INSERT INTO job_history (job_id, status, timestamp, details) VALUES (?, ?, ?, ?)")
            .bind(job_id.to_string())
            .bind(status_str(status))
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(details)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobPriority;

    fn def() -> JobDefinition {
        JobDefinition {
            name: "nightly".into(),
            vm_path: "/vms/web01".into(),
            output_path: "/exports/web01.ova".into(),
            provider: "esxi".into(),
            provider_options: serde_json::json!({}),
            priority: JobPriority::Normal,
            max_retries: 3,
            timeout_secs: 3600,
            tags: vec![],
            schedule_id: None,
        }
    }

    #[tokio::test]
    async fn create_get_update_delete_roundtrip() {
        let store = SqliteStore::connect(":memory:", 1).await.unwrap();
        let job = Job::new(def());
        store.create_job(&job).await.unwrap();

        let fetched = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.definition.name, "nightly");

        let dup = store.create_job(&job).await;
        assert!(matches!(dup, Err(crate::Error::AlreadyExists(_))));

        let mut updated = fetched.clone();
        updated.mark_completed(crate::jobs::JobResult::success(None));
        store.update_job(&updated).await.unwrap();
        let refetched = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(refetched.status, JobStatus::Completed);

        store.delete_job(job.id).await.unwrap();
        assert!(store.get_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn statistics_count_by_status() {
        let store = SqliteStore::connect(":memory:", 1).await.unwrap();
        store.create_job(&Job::new(def())).await.unwrap();
        store.create_job(&Job::new(def())).await.unwrap();
        let stats = store.job_statistics().await.unwrap();
        assert_eq!(*stats.counts_by_status.get(&JobStatus::Pending).unwrap(), 2);
    }
}
