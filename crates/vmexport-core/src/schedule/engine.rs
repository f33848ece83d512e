//! Cron-driven supervisor that materializes jobs from [`ScheduledJob`] templates.

use super::{ConcurrencyPolicy, ScheduleExecution, ScheduledJob, ScheduledJobId};
use crate::config::SchedulerConfig;
use crate::jobs::{Job, JobId, JobQuery, JobStatus};
use crate::store::Store;
use chrono_tz::Tz;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Anything the scheduler can hand a materialized job to. [`crate::jobs::manager::JobManager`]
/// implements this; tests use an in-memory recorder instead.
#[async_trait::async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, job: Job) -> crate::Result<()>;
    async fn cancel_non_terminal_for_schedule(&self, schedule_id: ScheduledJobId) -> crate::Result<Vec<JobId>>;
    async fn non_terminal_exists_for_schedule(&self, schedule_id: ScheduledJobId) -> crate::Result<bool>;
}

pub struct ScheduleEngine {
    store: Arc<dyn Store>,
    submitter: Arc<dyn JobSubmitter>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ScheduleEngine {
    pub fn new(store: Arc<dyn Store>, submitter: Arc<dyn JobSubmitter>, config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            submitter,
            config,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("scheduler disabled by configuration");
            return;
        }
        let engine = self.clone();
        let mut handle = self.handle.lock().await;
        *handle = Some(tokio::spawn(async move { engine.run().await }));
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(h) = self.handle.lock().await.take() {
            let _ = h.await;
        }
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.config.tick_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => break,
            }
            if let Err(e) = self.tick().await {
                error!("scheduler tick failed: {}", e);
            }
        }
    }

    async fn tick(&self) -> crate::Result<()> {
        let now = chrono::Utc::now();
        let due: Vec<ScheduledJob> = self
            .store
            .list_scheduled_jobs(true)
            .await?
            .into_iter()
            .filter(|s| s.next_run.map(|n| n <= now).unwrap_or(true))
            .collect();

        for schedule in due {
            if let Err(e) = self.fire(schedule).await {
                warn!("schedule firing failed: {}", e);
            }
        }
        Ok(())
    }

    async fn fire(&self, mut schedule: ScheduledJob) -> crate::Result<()> {
        match schedule.concurrency_policy {
            ConcurrencyPolicy::Forbid => {
                if self.submitter.non_terminal_exists_for_schedule(schedule.id).await? {
                    info!(schedule = %schedule.id, "skipping due firing, prior run still in flight");
                    self.reschedule(&mut schedule)?;
                    self.store.update_scheduled_job(&schedule).await?;
                    return Ok(());
                }
            }
            ConcurrencyPolicy::Replace => {
                self.submitter.cancel_non_terminal_for_schedule(schedule.id).await?;
            }
            ConcurrencyPolicy::Allow => {}
        }

        let mut definition = schedule.job_template.clone();
        definition.schedule_id = Some(schedule.id);
        let job = Job::new(definition);
        let job_id = job.id;
        self.submitter.submit(job).await?;

        schedule.last_run = Some(chrono::Utc::now());
        schedule.run_count += 1;
        self.reschedule(&mut schedule)?;
        self.store.update_scheduled_job(&schedule).await?;

        let record = ScheduleExecution::new(schedule.id, job_id, JobStatus::Pending);
        self.store.append_schedule_execution(&record).await?;
        self.prune_history(&schedule).await?;
        Ok(())
    }

    async fn prune_history(&self, schedule: &ScheduledJob) -> crate::Result<()> {
        self.store
            .prune_schedule_executions(schedule.id, schedule.successful_history_limit, schedule.failed_history_limit)
            .await?;
        Ok(())
    }

    fn reschedule(&self, schedule: &mut ScheduledJob) -> crate::Result<()> {
        schedule.next_run = Some(next_fire_after(&schedule.schedule, &schedule.timezone, chrono::Utc::now())?);
        schedule.updated_at = chrono::Utc::now();
        Ok(())
    }
}

/// Resolve the next instant the cron expression fires, evaluated in `timezone`.
/// DST-ambiguous instants resolve to the zone's earlier valid occurrence and
/// never fire twice; a skipped (spring-forward) instant is simply absent from
/// the schedule iterator.
pub fn next_fire_after(expression: &str, timezone: &str, after: chrono::DateTime<chrono::Utc>) -> crate::Result<chrono::DateTime<chrono::Utc>> {
    let schedule = parse_schedule(expression)?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| crate::Error::validation(format!("unknown timezone: {}", timezone)))?;

    let local_after = after.with_timezone(&tz);
    let mut upcoming = schedule.upcoming(tz).skip_while(|t| *t <= local_after);
    upcoming
        .next()
        .map(|t| t.with_timezone(&chrono::Utc))
        .ok_or_else(|| crate::Error::Other("cron expression never fires".into()))
}

fn parse_schedule(expression: &str) -> crate::Result<cron::Schedule> {
    let normalized = match expression.trim() {
        "@hourly" => "0 0 * * * *",
        "@daily" => "0 0 0 * * *",
        "@weekly" => "0 0 0 * * SUN",
        "@monthly" => "0 0 0 1 * *",
        "@yearly" | "@annually" => "0 0 0 1 1 *",
        other => other,
    };
    // The `cron` crate expects a leading seconds field; a 5-field crontab
    // expression gets `0` seconds prepended.
    let with_seconds = if normalized.split_whitespace().count() == 5 {
        format!("0 {}", normalized)
    } else {
        normalized.to_string()
    };
    cron::Schedule::from_str(&with_seconds).map_err(|e| crate::Error::Cron(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_macro_resolves_to_midnight() {
        let now = chrono::Utc::now();
        let next = next_fire_after("@daily", "UTC", now).unwrap();
        assert!(next > now);
    }

    #[test]
    fn five_field_expression_gets_seconds_prepended() {
        let now = chrono::Utc::now();
        let next = next_fire_after("0 2 * * *", "UTC", now).unwrap();
        assert!(next > now);
    }

    #[test]
    fn unknown_timezone_rejected() {
        let now = chrono::Utc::now();
        assert!(next_fire_after("@hourly", "Mars/Olympus", now).is_err());
    }
}
