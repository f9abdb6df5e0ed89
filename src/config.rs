//! Engine configuration
//!
//! Loaded from `FENIX_*` environment variables with fixed defaults for
//! anything unset.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker slots (W): maximum concurrently running executions
    pub workers: usize,
    /// Admission queue depth (Q_max)
    pub queue_depth: usize,
    /// Lower bound for the per-request timeout in seconds
    pub min_timeout_secs: u64,
    /// Upper bound for the per-request timeout in seconds
    pub max_timeout_secs: u64,
    /// Lower bound for the per-request memory ceiling in MB
    pub min_memory_mb: u64,
    /// Upper bound for the per-request memory ceiling in MB
    pub max_memory_mb: u64,
    /// Maximum source size in bytes (default: 64KB)
    pub max_source_bytes: usize,
    /// Maximum stdin size in bytes (default: 1MB)
    pub max_stdin_bytes: usize,
    /// Per-stream capture cap for stdout/stderr
    pub output_limit_bytes: usize,
    /// Grace period between a kill signal and forced slot reclamation
    pub kill_grace: Duration,
    /// Share of the total timeout granted to the compile step (percent)
    pub compile_share_percent: u32,
    /// Backoff before the single infrastructure retry
    pub infra_retry_backoff: Duration,
    /// Retention window for results
    pub result_ttl: Duration,
    /// Extra time a synchronous caller waits beyond timeout + grace
    pub sync_wait_slack: Duration,
    /// Interval between health self-tests
    pub health_interval: Duration,
    /// Consecutive backend failures before the engine is marked degraded
    pub health_failure_threshold: u32,
    /// Whether sandboxes may reach the network
    pub allow_network: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 64,
            min_timeout_secs: 1,
            max_timeout_secs: 30,
            min_memory_mb: 16,
            max_memory_mb: 1024,
            max_source_bytes: 64 * 1024,
            max_stdin_bytes: 1024 * 1024,
            output_limit_bytes: 64 * 1024,
            kill_grace: Duration::from_millis(500),
            compile_share_percent: 50,
            infra_retry_backoff: Duration::from_millis(250),
            result_ttl: Duration::from_secs(24 * 3600),
            sync_wait_slack: Duration::from_secs(30),
            health_interval: Duration::from_secs(60),
            health_failure_threshold: 3,
            allow_network: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `FENIX_*` environment variables
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let config = Self {
            workers: env_or("FENIX_WORKERS", d.workers)?,
            queue_depth: env_or("FENIX_QUEUE_DEPTH", d.queue_depth)?,
            min_timeout_secs: env_or("FENIX_MIN_TIMEOUT_SECS", d.min_timeout_secs)?,
            max_timeout_secs: env_or("FENIX_MAX_TIMEOUT_SECS", d.max_timeout_secs)?,
            min_memory_mb: env_or("FENIX_MIN_MEMORY_MB", d.min_memory_mb)?,
            max_memory_mb: env_or("FENIX_MAX_MEMORY_MB", d.max_memory_mb)?,
            max_source_bytes: env_or("FENIX_MAX_SOURCE_BYTES", d.max_source_bytes)?,
            max_stdin_bytes: env_or("FENIX_MAX_STDIN_BYTES", d.max_stdin_bytes)?,
            output_limit_bytes: env_or("FENIX_OUTPUT_LIMIT_BYTES", d.output_limit_bytes)?,
            kill_grace: Duration::from_millis(env_or(
                "FENIX_KILL_GRACE_MS",
                d.kill_grace.as_millis() as u64,
            )?),
            compile_share_percent: env_or(
                "FENIX_COMPILE_SHARE_PERCENT",
                d.compile_share_percent,
            )?,
            infra_retry_backoff: Duration::from_millis(env_or(
                "FENIX_INFRA_RETRY_BACKOFF_MS",
                d.infra_retry_backoff.as_millis() as u64,
            )?),
            result_ttl: Duration::from_secs(env_or(
                "FENIX_RESULT_TTL_SECS",
                d.result_ttl.as_secs(),
            )?),
            sync_wait_slack: Duration::from_secs(env_or(
                "FENIX_SYNC_WAIT_SLACK_SECS",
                d.sync_wait_slack.as_secs(),
            )?),
            health_interval: Duration::from_secs(env_or(
                "FENIX_HEALTH_INTERVAL_SECS",
                d.health_interval.as_secs(),
            )?),
            health_failure_threshold: env_or(
                "FENIX_HEALTH_FAILURE_THRESHOLD",
                d.health_failure_threshold,
            )?,
            allow_network: env_or("FENIX_ALLOW_NETWORK", d.allow_network)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(EngineError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.min_timeout_secs == 0 || self.min_timeout_secs > self.max_timeout_secs {
            return Err(EngineError::InvalidConfig(format!(
                "timeout bounds {}..={} are invalid",
                self.min_timeout_secs, self.max_timeout_secs
            )));
        }
        if self.min_memory_mb == 0 || self.min_memory_mb > self.max_memory_mb {
            return Err(EngineError::InvalidConfig(format!(
                "memory bounds {}..={} MB are invalid",
                self.min_memory_mb, self.max_memory_mb
            )));
        }
        if !(1..=99).contains(&self.compile_share_percent) {
            return Err(EngineError::InvalidConfig(format!(
                "compile share must be within 1..=99 percent, got {}",
                self.compile_share_percent
            )));
        }
        if self.output_limit_bytes == 0 || self.max_source_bytes == 0 {
            return Err(EngineError::InvalidConfig(
                "output and source limits must be non-zero".into(),
            ));
        }
        if self.health_interval.is_zero() {
            return Err(EngineError::InvalidConfig(
                "health interval must be non-zero".into(),
            ));
        }
        if self.health_failure_threshold == 0 {
            return Err(EngineError::InvalidConfig(
                "health failure threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// How long a synchronous caller may wait for a request with `timeout`.
    pub fn sync_wait_budget(&self, timeout: Duration) -> Duration {
        timeout + self.kill_grace * 2 + self.sync_wait_slack
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| EngineError::InvalidConfig(format!("{}={:?}: {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}
