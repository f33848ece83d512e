//! Scheduled-job types: cron-driven templates that materialize [`Job`](crate::jobs::Job)s.

pub mod engine;

pub use engine::ScheduleEngine;

use crate::jobs::JobDefinition;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ScheduledJobId = Uuid;

/// How a due schedule interacts with jobs it previously produced that are
/// still non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Always instantiate a new job regardless of in-flight jobs.
    Allow,
    /// Skip this firing if any non-terminal job from this schedule exists.
    Forbid,
    /// Cancel all non-terminal jobs from this schedule, then instantiate.
    Replace,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        ConcurrencyPolicy::Allow
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: ScheduledJobId,
    pub name: String,
    pub description: Option<String>,
    /// 5-field cron expression or an `@hourly`/`@daily`/`@weekly`/`@monthly`/`@yearly` macro.
    pub schedule: String,
    /// IANA timezone name, e.g. "America/New_York".
    pub timezone: String,
    pub job_template: JobDefinition,
    pub concurrency_policy: ConcurrencyPolicy,
    pub enabled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub last_run: Option<chrono::DateTime<chrono::Utc>>,
    pub next_run: Option<chrono::DateTime<chrono::Utc>>,
    pub run_count: u64,
    pub successful_history_limit: usize,
    pub failed_history_limit: usize,
    pub tags: Vec<String>,
}

impl ScheduledJob {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        timezone: impl Into<String>,
        job_template: JobDefinition,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            schedule: schedule.into(),
            timezone: timezone.into(),
            job_template,
            concurrency_policy: ConcurrencyPolicy::default(),
            enabled: true,
            created_at: now,
            updated_at: now,
            last_run: None,
            next_run: None,
            run_count: 0,
            successful_history_limit: 50,
            failed_history_limit: 50,
            tags: Vec::new(),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::validation("name is required"));
        }
        if self.schedule.trim().is_empty() {
            return Err(crate::Error::validation("schedule expression is required"));
        }
        self.job_template.validate()
    }
}

/// Append-only record of one schedule firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleExecution {
    pub schedule_id: ScheduledJobId,
    pub job_id: crate::jobs::JobId,
    pub executed_at: chrono::DateTime<chrono::Utc>,
    pub status: crate::jobs::JobStatus,
    pub duration_seconds: Option<f64>,
    pub error: Option<String>,
}

impl ScheduleExecution {
    pub fn new(schedule_id: ScheduledJobId, job_id: crate::jobs::JobId, status: crate::jobs::JobStatus) -> Self {
        Self {
            schedule_id,
            job_id,
            executed_at: chrono::Utc::now(),
            status,
            duration_seconds: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobPriority;

    fn template() -> JobDefinition {
        JobDefinition {
            name: "nightly".to_string(),
            vm_path: "/vms/web01".to_string(),
            output_path: "/exports/web01.ova".to_string(),
            provider: "esxi".to_string(),
            provider_options: serde_json::json!({}),
            priority: JobPriority::Normal,
            max_retries: 3,
            timeout_secs: 3600,
            tags: vec![],
            schedule_id: None,
        }
    }

    #[test]
    fn new_schedule_defaults_to_allow_and_enabled() {
        let s = ScheduledJob::new("nightly", "0 2 * * *", "UTC", template());
        assert_eq!(s.concurrency_policy, ConcurrencyPolicy::Allow);
        assert!(s.enabled);
        assert_eq!(s.run_count, 0);
    }

    #[test]
    fn validate_rejects_empty_cron() {
        let mut s = ScheduledJob::new("nightly", "", "UTC", template());
        s.schedule = "".to_string();
        assert!(s.validate().is_err());
    }
}
