use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for the vmexport daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub secrets: SecretConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            store: StoreConfig::default(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            audit: AuditConfig::default(),
            secrets: SecretConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, crate::Error> {
        use crate::Error;

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from `VMEXPORT_CONFIG` or a set of default search paths.
    pub fn from_env() -> Result<Self, crate::Error> {
        if let Ok(config_path) = std::env::var("VMEXPORT_CONFIG") {
            return Self::load(&config_path);
        }

        let default_paths = [
            "./config/default.toml",
            "./config/production.toml",
            "/etc/vmexport/config.toml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<(), crate::Error> {
        use crate::Error;

        if self.queue.max_workers == 0 {
            return Err(Error::Config("queue.max_workers must be > 0".to_string()));
        }
        if self.queue.max_queue_size == 0 {
            return Err(Error::Config("queue.max_queue_size must be > 0".to_string()));
        }
        if self.store.pool_size == 0 {
            return Err(Error::Config("store.pool_size must be > 0".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be > 0".to_string()));
        }
        if self.audit.max_size_mb == 0 {
            return Err(Error::Config("audit.max_size_mb must be > 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_graceful_shutdown")]
    pub graceful_shutdown_timeout_secs: u64,

    #[serde(default = "default_restart_reconcile")]
    pub reconcile_running_on_restart: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            graceful_shutdown_timeout_secs: default_graceful_shutdown(),
            reconcile_running_on_restart: default_restart_reconcile(),
        }
    }
}

fn default_graceful_shutdown() -> u64 {
    30
}

fn default_restart_reconcile() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_sqlite_path() -> String {
    "./vmexport.db".to_string()
}

fn default_pool_size() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_job_timeout_secs")]
    pub default_job_timeout_secs: u64,

    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    #[serde(default = "default_results_channel_depth")]
    pub results_channel_depth: usize,

    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_queue_size: default_max_queue_size(),
            default_job_timeout_secs: default_job_timeout_secs(),
            idle_poll_ms: default_idle_poll_ms(),
            results_channel_depth: default_results_channel_depth(),
            metrics_enabled: true,
        }
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_job_timeout_secs() -> u64 {
    3600
}

fn default_idle_poll_ms() -> u64 {
    100
}

fn default_results_channel_depth() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    #[serde(default = "default_history_limit")]
    pub successful_history_limit: usize,

    #[serde(default = "default_history_limit")]
    pub failed_history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: default_tick_secs(),
            default_timezone: default_timezone(),
            successful_history_limit: default_history_limit(),
            failed_history_limit: default_history_limit(),
        }
    }
}

fn default_tick_secs() -> u64 {
    1
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_history_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_kind")]
    pub backoff: BackoffKind,

    #[serde(default = "default_exp_initial_delay_secs")]
    pub exponential_initial_delay_secs: u64,

    #[serde(default = "default_exp_max_delay_secs")]
    pub exponential_max_delay_secs: u64,

    #[serde(default = "default_exp_multiplier")]
    pub exponential_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff_kind(),
            exponential_initial_delay_secs: default_exp_initial_delay_secs(),
            exponential_max_delay_secs: default_exp_max_delay_secs(),
            exponential_multiplier: default_exp_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Linear,
    Exponential,
}

fn default_backoff_kind() -> BackoffKind {
    BackoffKind::Linear
}

fn default_max_attempts() -> u32 {
    3
}

fn default_exp_initial_delay_secs() -> u64 {
    1
}

fn default_exp_max_delay_secs() -> u64 {
    60
}

fn default_exp_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    #[serde(default)]
    pub file: Option<FileLogConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLogConfig {
    pub path: String,
    pub rotation: LogRotation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogRotation {
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub thresholds: AlertThresholds,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: AlertThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    #[serde(default = "default_queue_depth_threshold")]
    pub queue_depth: usize,

    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate: f64,

    #[serde(default = "default_latency_secs_threshold")]
    pub latency_secs: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth_threshold(),
            failure_rate: default_failure_rate_threshold(),
            latency_secs: default_latency_secs_threshold(),
        }
    }
}

fn default_queue_depth_threshold() -> usize {
    500
}

fn default_failure_rate_threshold() -> f64 {
    0.25
}

fn default_latency_secs_threshold() -> u64 {
    1800
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_path")]
    pub path: String,

    #[serde(default = "default_audit_max_size_mb")]
    pub max_size_mb: u64,

    #[serde(default = "default_audit_max_age_days")]
    pub max_age_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
            max_size_mb: default_audit_max_size_mb(),
            max_age_days: default_audit_max_age_days(),
        }
    }
}

fn default_audit_path() -> String {
    "./audit".to_string()
}

fn default_audit_max_size_mb() -> u64 {
    100
}

fn default_audit_max_age_days() -> u32 {
    90
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretConfig {
    #[serde(default = "default_secret_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_secret_cache_ttl_secs(),
        }
    }
}

fn default_secret_cache_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_lifetime_secs")]
    pub lifetime_secs: u64,

    #[serde(default = "default_session_gc_interval_secs")]
    pub gc_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lifetime_secs: default_session_lifetime_secs(),
            gc_interval_secs: default_session_gc_interval_secs(),
        }
    }
}

fn default_session_lifetime_secs() -> u64 {
    24 * 3600
}

fn default_session_gc_interval_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.max_workers, 4);
        assert_eq!(config.retry.backoff, BackoffKind::Linear);
    }

    #[test]
    fn rejects_zero_workers() {
        let mut config = Config::default();
        config.queue.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_max_attempts() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string(&config).expect("serialize");
        let parsed: Config = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.queue.max_workers, config.queue.max_workers);
    }
}
