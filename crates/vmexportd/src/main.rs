use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use vmexport_core::{Config, JobPriority, JobQuery, JobStatus, Result, Runtime};
use vmexport_core::schedule::ConcurrencyPolicy;

/// Security checks for CLI operations, applied before anything that touches
/// the durable store or spawns background work.
mod security {
    use colored::Colorize;
    use std::path::PathBuf;

    /// Check if running as root.
    pub fn check_not_root() -> Result<(), String> {
        #[cfg(unix)]
        {
            let uid = unsafe { libc::getuid() };
            if uid == 0 {
                return Err(format!(
                    "\n{}\n{}\n{}",
                    "ERROR: Running as root is not allowed!".red().bold(),
                    "   vmexportd should not run as root for security reasons.",
                    "   Run as a non-privileged user with access to the store path."
                ));
            }
        }
        Ok(())
    }

    /// Check config file permissions, warning on world-readable and refusing
    /// world-writable files (the config can carry store/audit paths and
    /// secret-backend settings).
    pub fn check_config_permissions(path: &PathBuf) -> Result<(), String> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = std::fs::metadata(path).map_err(|e| format!("cannot read config file: {}", e))?;
        let mode = metadata.permissions().mode();
        let world_readable = (mode & 0o004) != 0;
        let world_writable = (mode & 0o002) != 0;

        if world_writable {
            return Err(format!(
                "\n{}\n{}\n{}",
                "ERROR: Config file is world-writable!".red().bold(),
                format!("   Path: {}", path.display()),
                format!("   Run: chmod 600 {}", path.display())
            ));
        }
        if world_readable {
            eprintln!(
                "{}",
                format!(
                    "\n{}\n{}\n{}",
                    "WARNING: Config file is world-readable".yellow().bold(),
                    format!("   Path: {}", path.display()),
                    format!("   Consider running: chmod 600 {}", path.display())
                )
            );
        }
        Ok(())
    }
}

#[derive(Parser)]
#[command(name = "vmexportd")]
#[command(about = "VM export control plane daemon and operator CLI")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Override the configured log level")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the daemon: worker pool, scheduler, and restart reconciliation
    Run,

    /// Job lifecycle operations
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Scheduled-job (cron) operations
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },

    /// Show the effective configuration
    Config,
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Submit a new export job
    Submit {
        #[arg(long, help = "Human-readable job name")]
        name: String,

        #[arg(long, help = "Source VM path/identifier on the provider")]
        vm_path: String,

        #[arg(long, help = "Destination path for the exported artifact")]
        output_path: String,

        #[arg(long, help = "Registered provider tag, e.g. 'local'")]
        provider: String,

        #[arg(long, help = "Provider-specific options as a JSON object")]
        provider_options: Option<String>,

        #[arg(long, default_value = "normal", help = "critical|high|normal|low")]
        priority: String,

        #[arg(long, default_value_t = 3, help = "Maximum retry attempts")]
        max_retries: u32,

        #[arg(long, default_value_t = 3600, help = "Per-attempt timeout in seconds")]
        timeout_secs: u64,

        #[arg(long, help = "Repeatable free-form tag")]
        tag: Vec<String>,
    },

    /// Get job details
    Get {
        #[arg(help = "Job id")]
        id: uuid::Uuid,
    },

    /// List jobs
    List {
        #[arg(long, help = "Filter by status: pending|running|completed|failed|cancelled")]
        status: Option<String>,

        #[arg(long, help = "Maximum rows to return")]
        limit: Option<u32>,
    },

    /// Cancel a pending or running job
    Cancel {
        #[arg(help = "Job id")]
        id: uuid::Uuid,
    },

    /// Delete a terminal job
    Delete {
        #[arg(help = "Job id")]
        id: uuid::Uuid,

        #[arg(long, help = "Skip confirmation prompt")]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommands {
    /// Create a cron-driven schedule
    Create {
        #[arg(long, help = "Schedule name")]
        name: String,

        #[arg(long, help = "5-field cron expression or an @hourly/@daily/@weekly/@monthly/@yearly macro")]
        cron: String,

        #[arg(long, default_value = "UTC", help = "IANA timezone, e.g. America/New_York")]
        timezone: String,

        #[arg(long, default_value = "allow", help = "allow|forbid|replace")]
        concurrency_policy: String,

        #[arg(long, help = "Job template: human-readable name")]
        job_name: String,

        #[arg(long, help = "Job template: source VM path/identifier")]
        vm_path: String,

        #[arg(long, help = "Job template: destination path")]
        output_path: String,

        #[arg(long, help = "Job template: registered provider tag")]
        provider: String,

        #[arg(long, help = "Job template: provider-specific options as a JSON object")]
        provider_options: Option<String>,

        #[arg(long, default_value = "normal", help = "Job template priority")]
        priority: String,

        #[arg(long, default_value_t = 3, help = "Job template max retries")]
        max_retries: u32,

        #[arg(long, default_value_t = 3600, help = "Job template timeout in seconds")]
        timeout_secs: u64,
    },

    /// List schedules
    List {
        #[arg(long, help = "Only show enabled schedules")]
        enabled_only: bool,
    },

    /// Enable a schedule
    Enable {
        #[arg(help = "Schedule id")]
        id: uuid::Uuid,
    },

    /// Disable a schedule
    Disable {
        #[arg(help = "Schedule id")]
        id: uuid::Uuid,
    },

    /// Delete a schedule
    Delete {
        #[arg(help = "Schedule id")]
        id: uuid::Uuid,

        #[arg(long, help = "Skip confirmation prompt")]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if let Some(ref config_path) = cli.config {
        if let Err(e) = security::check_config_permissions(config_path) {
            eprintln!("{}", e);
            std::process::exit(1);
        }
        Config::load(config_path.to_str().expect("config path is not valid UTF-8"))?
    } else {
        Config::from_env()?
    };

    let _log_guard = init_logging(&config, cli.log_level.as_deref());

    match cli.command {
        Commands::Run => {
            if let Err(e) = security::check_not_root() {
                eprintln!("{}", e);
                std::process::exit(1);
            }
            run_daemon(config).await?;
        }

        Commands::Job { command } => handle_job_command(config, command).await?,
        Commands::Schedule { command } => handle_schedule_command(config, command).await?,

        Commands::Config => {
            println!(
                "Configuration loaded from: {}",
                cli.config.map(|p| p.display().to_string()).unwrap_or_else(|| "environment/defaults".to_string())
            );
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Initializes the global tracing subscriber. Returns the non-blocking
/// writer's guard when file logging is configured; the caller must hold it
/// for the process lifetime or buffered log lines are dropped on exit.
fn init_logging(config: &Config, level_override: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    let level = level_override.unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = matches!(config.logging.format, vmexport_core::config::LogFormat::Json);

    match &config.logging.file {
        Some(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(rolling_appender(file));
            let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(non_blocking);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            Some(guard)
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            None
        }
    }
}

fn rolling_appender(file: &vmexport_core::config::FileLogConfig) -> tracing_appender::rolling::RollingFileAppender {
    let path = std::path::Path::new(&file.path);
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let filename = path.file_name().and_then(|f| f.to_str()).unwrap_or("vmexportd.log");
    match file.rotation {
        vmexport_core::config::LogRotation::Daily => tracing_appender::rolling::daily(dir, filename),
        vmexport_core::config::LogRotation::Hourly => tracing_appender::rolling::hourly(dir, filename),
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    let shutdown_timeout = config.daemon.graceful_shutdown_timeout_secs;
    let runtime = Runtime::build(config).await?;
    info!(version = vmexport_core::VERSION, "starting vmexportd");
    runtime.start().await?;

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining worker pool");
    runtime.shutdown().await?;
    info!(timeout_secs = shutdown_timeout, "vmexportd stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn handle_job_command(config: Config, command: JobCommands) -> anyhow::Result<()> {
    let runtime = Runtime::build(config).await?;

    match command {
        JobCommands::Submit {
            name,
            vm_path,
            output_path,
            provider,
            provider_options,
            priority,
            max_retries,
            timeout_secs,
            tag,
        } => {
            let priority = JobPriority::from_str(&priority)
                .ok_or_else(|| anyhow::anyhow!("unknown priority '{}': expected critical|high|normal|low", priority))?;
            let provider_options = match provider_options {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::json!({}),
            };

            let definition = vmexport_core::JobDefinition {
                name,
                vm_path,
                output_path,
                provider,
                provider_options,
                priority,
                max_retries,
                timeout_secs,
                tags: tag,
                schedule_id: None,
            };

            match runtime.jobs.submit(definition).await {
                Ok(id) => println!("{} job {}", "submitted".green().bold(), id),
                Err(e) => {
                    eprintln!("{}", format!("failed to submit job: {}", e).red());
                    std::process::exit(1);
                }
            }
        }

        JobCommands::Get { id } => match runtime.jobs.get(id).await? {
            Some(job) => print_job(&job),
            None => {
                println!("{}", format!("job '{}' not found", id).yellow());
                std::process::exit(1);
            }
        },

        JobCommands::List { status, limit } => {
            let mut query = JobQuery::new();
            if let Some(status) = status {
                query = query.with_status(parse_job_status(&status)?);
            }
            if let Some(limit) = limit {
                query = query.with_limit(limit);
            }

            let jobs = runtime.jobs.list(&query).await?;
            if jobs.is_empty() {
                println!("{}", "no jobs found".yellow());
            } else {
                println!("{:<36} {:<20} {:<10} {:<8} {:<12}", "ID", "NAME", "STATUS", "PRIORITY", "CREATED");
                println!("{}", "-".repeat(92));
                for job in &jobs {
                    println!(
                        "{:<36} {:<20} {:<10} {:<8} {:<12}",
                        job.id,
                        truncate(&job.definition.name, 18),
                        colorize_status(job.status),
                        job.definition.priority,
                        job.created_at.format("%Y-%m-%d %H:%M")
                    );
                }
                println!("\ntotal: {} job(s)", jobs.len());
            }
        }

        JobCommands::Cancel { id } => match runtime.jobs.cancel(id).await {
            Ok(()) => println!("{}", format!("job {} cancelled", id).green()),
            Err(e) => {
                eprintln!("{}", format!("failed to cancel job: {}", e).red());
                std::process::exit(1);
            }
        },

        JobCommands::Delete { id, force } => {
            if !force && !confirm(&format!("delete job {}?", id)) {
                println!("aborted.");
                return Ok(());
            }
            match runtime.jobs.delete(id).await {
                Ok(()) => println!("{}", format!("job {} deleted", id).green()),
                Err(e) => {
                    eprintln!("{}", format!("failed to delete job: {}", e).red());
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

async fn handle_schedule_command(config: Config, command: ScheduleCommands) -> anyhow::Result<()> {
    let runtime = Runtime::build(config).await?;
    let store = &runtime.store;

    match command {
        ScheduleCommands::Create {
            name,
            cron,
            timezone,
            concurrency_policy,
            job_name,
            vm_path,
            output_path,
            provider,
            provider_options,
            priority,
            max_retries,
            timeout_secs,
        } => {
            let priority = JobPriority::from_str(&priority)
                .ok_or_else(|| anyhow::anyhow!("unknown priority '{}': expected critical|high|normal|low", priority))?;
            let provider_options = match provider_options {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::json!({}),
            };
            let concurrency_policy = parse_concurrency_policy(&concurrency_policy)?;

            let template = vmexport_core::JobDefinition {
                name: job_name,
                vm_path,
                output_path,
                provider,
                provider_options,
                priority,
                max_retries,
                timeout_secs,
                tags: vec![],
                schedule_id: None,
            };

            let mut schedule = vmexport_core::ScheduledJob::new(name, cron, timezone, template);
            schedule.concurrency_policy = concurrency_policy;
            schedule.validate()?;
            schedule.next_run = Some(vmexport_core::schedule::engine::next_fire_after(
                &schedule.schedule,
                &schedule.timezone,
                chrono::Utc::now(),
            )?);

            store.create_scheduled_job(&schedule).await?;
            println!("{} schedule {}", "created".green().bold(), schedule.id);
            if let Some(next_run) = schedule.next_run {
                println!("  next run: {}", next_run);
            }
        }

        ScheduleCommands::List { enabled_only } => {
            let schedules = store.list_scheduled_jobs(enabled_only).await?;
            if schedules.is_empty() {
                println!("{}", "no schedules found".yellow());
            } else {
                println!("{:<36} {:<20} {:<16} {:<8} {:<20}", "ID", "NAME", "SCHEDULE", "ENABLED", "NEXT RUN");
                println!("{}", "-".repeat(104));
                for s in &schedules {
                    let enabled = if s.enabled { "yes".green() } else { "no".red() };
                    println!(
                        "{:<36} {:<20} {:<16} {:<8} {:<20}",
                        s.id,
                        truncate(&s.name, 18),
                        truncate(&s.schedule, 14),
                        enabled,
                        s.next_run.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string())
                    );
                }
                println!("\ntotal: {} schedule(s)", schedules.len());
            }
        }

        ScheduleCommands::Enable { id } => set_schedule_enabled(store, id, true).await?,
        ScheduleCommands::Disable { id } => set_schedule_enabled(store, id, false).await?,

        ScheduleCommands::Delete { id, force } => {
            if !force && !confirm(&format!("delete schedule {}?", id)) {
                println!("aborted.");
                return Ok(());
            }
            store.delete_scheduled_job(id).await?;
            println!("{}", format!("schedule {} deleted", id).green());
        }
    }

    Ok(())
}

async fn set_schedule_enabled(store: &std::sync::Arc<dyn vmexport_core::Store>, id: uuid::Uuid, enabled: bool) -> anyhow::Result<()> {
    let mut schedule = store
        .get_scheduled_job(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("schedule '{}' not found", id))?;
    schedule.enabled = enabled;
    schedule.updated_at = chrono::Utc::now();
    store.update_scheduled_job(&schedule).await?;
    let verb = if enabled { "enabled" } else { "disabled" };
    println!("{}", format!("schedule {} {}", id, verb).green());
    Ok(())
}

fn print_job(job: &vmexport_core::Job) {
    println!("{}", "Job Details".bold().underline());
    println!("  ID:         {}", job.id);
    println!("  Name:       {}", job.definition.name);
    println!("  Status:     {}", colorize_status(job.status));
    println!("  Priority:   {}", job.definition.priority);
    println!("  Provider:   {}", job.definition.provider);
    println!("  VM path:    {}", job.definition.vm_path);
    println!("  Output:     {}", job.definition.output_path);
    println!("  Retries:    {}/{}", job.retry_count, job.definition.max_retries);
    println!("  Created:    {}", job.created_at);
    if let Some(started) = job.started_at {
        println!("  Started:    {}", started);
    }
    if let Some(completed) = job.completed_at {
        println!("  Completed:  {}", completed);
    }
    if job.progress.bytes_total.is_some() || job.progress.percent_complete > 0.0 {
        println!("  Progress:   {:.1}% ({})", job.progress.percent_complete, job.progress.phase);
    }
    if let Some(err) = &job.last_error {
        println!("  Last error: {}", err.red());
    }
}

fn colorize_status(status: JobStatus) -> colored::ColoredString {
    match status {
        JobStatus::Completed => status.to_string().green(),
        JobStatus::Failed => status.to_string().red(),
        JobStatus::Cancelled => status.to_string().yellow(),
        JobStatus::Running => status.to_string().cyan(),
        JobStatus::Pending => status.to_string().normal(),
    }
}

fn parse_job_status(s: &str) -> anyhow::Result<JobStatus> {
    match s.to_lowercase().as_str() {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
        other => Err(anyhow::anyhow!("unknown status '{}': expected pending|running|completed|failed|cancelled", other)),
    }
}

fn parse_concurrency_policy(s: &str) -> anyhow::Result<ConcurrencyPolicy> {
    match s.to_lowercase().as_str() {
        "allow" => Ok(ConcurrencyPolicy::Allow),
        "forbid" => Ok(ConcurrencyPolicy::Forbid),
        "replace" => Ok(ConcurrencyPolicy::Replace),
        other => Err(anyhow::anyhow!("unknown concurrency policy '{}': expected allow|forbid|replace", other)),
    }
}

fn confirm(prompt: &str) -> bool {
    dialoguer::Confirm::new().with_prompt(prompt).default(false).interact().unwrap_or(false)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_strings_untouched() {
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn truncate_ellipsizes_long_strings() {
        assert_eq!(truncate("a very long job name indeed", 10), "a very ...");
    }

    #[test]
    fn job_status_parsing_accepts_canonical_names() {
        assert_eq!(parse_job_status("Running").unwrap(), JobStatus::Running);
        assert_eq!(parse_job_status("canceled").unwrap(), JobStatus::Cancelled);
        assert!(parse_job_status("bogus").is_err());
    }

    #[test]
    fn concurrency_policy_parsing_accepts_canonical_names() {
        assert_eq!(parse_concurrency_policy("REPLACE").unwrap(), ConcurrencyPolicy::Replace);
        assert!(parse_concurrency_policy("bogus").is_err());
    }
}
