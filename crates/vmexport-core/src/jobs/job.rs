//! Job types and definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Unique job identifier
pub type JobId = Uuid;

/// Job priority bands, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobPriority {
    Critical = 150,
    High = 100,
    Normal = 50,
    Low = 10,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPriority::Critical => write!(f, "critical"),
            JobPriority::High => write!(f, "high"),
            JobPriority::Normal => write!(f, "normal"),
            JobPriority::Low => write!(f, "low"),
        }
    }
}

impl JobPriority {
    pub fn weight(&self) -> u8 {
        *self as u8
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(JobPriority::Critical),
            "high" => Some(JobPriority::High),
            "normal" => Some(JobPriority::Normal),
            "low" => Some(JobPriority::Low),
            _ => None,
        }
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// Outcome of a single handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl JobResult {
    pub fn success(data: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Byte/phase-level progress, persisted on the job for checkpoint/resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub phase: String,
    pub percent_complete: f32,
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
    pub current_file: Option<String>,
    pub files_completed: Option<u32>,
    pub files_total: Option<u32>,
    pub resume_token: Option<String>,
}

impl ProgressRecord {
    /// Apply an update, enforcing monotonic percent_complete within a phase.
    pub fn apply(&mut self, phase: &str, percent: f32) {
        if self.phase != phase {
            self.phase = phase.to_string();
            self.percent_complete = percent.max(0.0);
        } else {
            self.percent_complete = self.percent_complete.max(percent);
        }
    }
}

/// The immutable part of a job, supplied at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub vm_path: String,
    pub output_path: String,
    pub provider: String,
    #[serde(default)]
    pub provider_options: serde_json::Value,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub schedule_id: Option<Uuid>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    3600
}

impl JobDefinition {
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::validation("name is required"));
        }
        if self.vm_path.trim().is_empty() {
            return Err(crate::Error::validation("vm_path is required"));
        }
        if self.output_path.trim().is_empty() {
            return Err(crate::Error::validation("output_path is required"));
        }
        if self.provider.trim().is_empty() {
            return Err(crate::Error::validation("provider is required"));
        }
        if self.timeout_secs == 0 {
            return Err(crate::Error::validation("timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// A submitted VM export job, definition plus runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub definition: JobDefinition,
    pub status: JobStatus,
    pub retry_count: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub worker_id: Option<Uuid>,
    pub progress: ProgressRecord,
    pub result: Option<JobResult>,
    pub last_error: Option<String>,
    /// `Error::category()` of `last_error`, if the worker set one. Not part
    /// of the durable schema (§6) -- it's an in-process signal the Job
    /// Manager reads when classifying a terminal outcome for the audit log
    /// (e.g. auth/config failures audit as `Denied`, not `Failure`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    /// Stamped on (re-)enqueue; used for FIFO-within-priority ordering.
    pub submitted_at: chrono::DateTime<chrono::Utc>,
}

impl Job {
    pub fn new(definition: JobDefinition) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            definition,
            status: JobStatus::Pending,
            retry_count: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            worker_id: None,
            progress: ProgressRecord::default(),
            result: None,
            last_error: None,
            error_category: None,
            submitted_at: now,
        }
    }

    pub fn mark_started(&mut self, worker_id: Uuid) {
        self.status = JobStatus::Running;
        self.started_at = Some(chrono::Utc::now());
        self.worker_id = Some(worker_id);
    }

    pub fn mark_completed(&mut self, result: JobResult) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(chrono::Utc::now());
        self.result = Some(result);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(chrono::Utc::now());
        self.last_error = Some(error.into());
    }

    /// As [`Job::mark_failed`], additionally recording the error's stable
    /// category (e.g. "auth", "config") for audit classification.
    pub fn mark_failed_with_category(&mut self, error: impl Into<String>, category: impl Into<String>) {
        self.mark_failed(error);
        self.error_category = Some(category.into());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(chrono::Utc::now());
    }

    /// Reset for a retry: bumps retry_count, re-stamps submitted_at, returns to Pending.
    pub fn prepare_retry(&mut self) {
        self.retry_count += 1;
        self.submitted_at = chrono::Utc::now();
        self.status = JobStatus::Pending;
        self.started_at = None;
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.definition.max_retries
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.definition.timeout_secs)
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(s), Some(e)) => Some(e - s),
            _ => None,
        }
    }
}

/// Filter for Store::list / JobManager::list.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub statuses: Option<Vec<JobStatus>>,
    pub created_after: Option<chrono::DateTime<chrono::Utc>>,
    pub created_before: Option<chrono::DateTime<chrono::Utc>>,
    pub schedule_id: Option<Uuid>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.get_or_insert_with(Vec::new).push(status);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_schedule(mut self, schedule_id: Uuid) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&job.status) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if job.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if job.created_at > before {
                return false;
            }
        }
        if let Some(schedule_id) = self.schedule_id {
            if job.definition.schedule_id != Some(schedule_id) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def() -> JobDefinition {
        JobDefinition {
            name: "nightly-export".to_string(),
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
    fn priority_ordering() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn lifecycle_transitions() {
        let mut job = Job::new(def());
        assert_eq!(job.status, JobStatus::Pending);
        let worker = Uuid::new_v4();
        job.mark_started(worker);
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
        job.mark_completed(JobResult::success(None));
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.status.is_terminal());
    }

    #[test]
    fn retry_bumps_count_and_restamps() {
        let mut job = Job::new(def());
        let first_submit = job.submitted_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        job.prepare_retry();
        assert_eq!(job.retry_count, 1);
        assert!(job.submitted_at > first_submit);
        assert!(job.can_retry());
    }

    #[test]
    fn retry_exhaustion() {
        let mut job = Job::new(def());
        job.definition.max_retries = 1;
        job.prepare_retry();
        assert!(!job.can_retry());
    }

    #[test]
    fn validation_rejects_missing_fields() {
        let mut d = def();
        d.name = "".to_string();
        assert!(d.validate().is_err());
    }

    #[test]
    fn query_filters_by_status() {
        let job = Job::new(def());
        let q = JobQuery::new().with_status(JobStatus::Pending);
        assert!(q.matches(&job));
        let q2 = JobQuery::new().with_status(JobStatus::Completed);
        assert!(!q2.matches(&job));
    }

    #[test]
    fn progress_is_monotonic_within_phase() {
        let mut p = ProgressRecord::default();
        p.apply("transfer", 10.0);
        p.apply("transfer", 5.0);
        assert_eq!(p.percent_complete, 10.0);
        p.apply("verify", 0.0);
        assert_eq!(p.phase, "verify");
    }
}
