//! Dispatcher configuration from environment variables

use super::engine::RoutingMode;
use super::retry::RetryPolicy;
use super::scheduler::SchedulerSettings;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkType {
    Http,
    Sqlite,
}

impl FromStr for SinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown sink type '{}'", other)),
        }
    }
}

/// Configuration for the dispatcher runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Idle time after which a series is considered complete
    pub max_wait: Duration,

    /// Scheduler tick cadence
    pub poll_interval: Duration,

    pub mode: RoutingMode,

    /// Records routed per tick
    pub ingest_batch: usize,

    pub sink_type: SinkType,

    /// Endpoint of the HTTP sink
    pub sink_url: String,

    /// Database file of the SQLite sink
    pub sink_db_path: String,

    /// Upper bound for one sink submit
    pub sink_timeout: Duration,

    pub retry_initial: Duration,
    pub retry_max: Duration,

    /// Consecutive failures before a series is reported as degraded
    pub retry_degraded_after: u32,

    /// JSONL file tailed for incoming records
    pub record_feed_path: String,

    /// Capacity of the ingress channel (records)
    pub channel_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_millis(1_000),
            poll_interval: Duration::from_millis(200),
            mode: RoutingMode::PerSeries,
            ingest_batch: 1,
            sink_type: SinkType::Http,
            sink_url: "http://localhost:5000".to_string(),
            sink_db_path: "seriesflow.db".to_string(),
            sink_timeout: Duration::from_millis(5_000),
            retry_initial: Duration::from_millis(1_000),
            retry_max: Duration::from_millis(30_000),
            retry_degraded_after: 5,
            record_feed_path: "records.jsonl".to_string(),
            channel_buffer: 10_000,
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `DISPATCH_MAX_WAIT_MS` (default: 1000)
    /// - `DISPATCH_POLL_INTERVAL_MS` (default: 200)
    /// - `DISPATCH_MODE` (default: per_series, or single_series)
    /// - `DISPATCH_INGEST_BATCH` (default: 1)
    /// - `SINK_TYPE` (default: http, or sqlite)
    /// - `SINK_URL` (default: http://localhost:5000)
    /// - `SINK_DB_PATH` (default: seriesflow.db)
    /// - `SINK_TIMEOUT_MS` (default: 5000)
    /// - `RETRY_INITIAL_MS` (default: 1000)
    /// - `RETRY_MAX_MS` (default: 30000)
    /// - `RETRY_DEGRADED_AFTER` (default: 5)
    /// - `RECORD_FEED_PATH` (default: records.jsonl)
    /// - `RECORD_CHANNEL_BUFFER` (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            max_wait: millis_var("DISPATCH_MAX_WAIT_MS", defaults.max_wait)?,
            poll_interval: millis_var("DISPATCH_POLL_INTERVAL_MS", defaults.poll_interval)?,
            mode: parsed_var("DISPATCH_MODE", defaults.mode)?,
            ingest_batch: positive_var("DISPATCH_INGEST_BATCH", defaults.ingest_batch)?,
            sink_type: parsed_var("SINK_TYPE", defaults.sink_type)?,
            sink_url: env::var("SINK_URL").unwrap_or(defaults.sink_url),
            sink_db_path: env::var("SINK_DB_PATH").unwrap_or(defaults.sink_db_path),
            sink_timeout: millis_var("SINK_TIMEOUT_MS", defaults.sink_timeout)?,
            retry_initial: millis_var("RETRY_INITIAL_MS", defaults.retry_initial)?,
            retry_max: millis_var("RETRY_MAX_MS", defaults.retry_max)?,
            retry_degraded_after: parsed_var("RETRY_DEGRADED_AFTER", defaults.retry_degraded_after)?,
            record_feed_path: env::var("RECORD_FEED_PATH").unwrap_or(defaults.record_feed_path),
            channel_buffer: positive_var("RECORD_CHANNEL_BUFFER", defaults.channel_buffer)?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_initial, self.retry_max, self.retry_degraded_after)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: self.poll_interval,
            ingest_batch: self.ingest_batch,
            ..SchedulerSettings::default()
        }
    }
}

fn parsed_var<T>(var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: var.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn positive_var(var: &str, default: usize) -> Result<usize, ConfigError> {
    match parsed_var(var, default)? {
        0 => Err(ConfigError::InvalidValue {
            var: var.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        n => Ok(n),
    }
}

fn millis_var(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = default.as_millis() as usize;
    positive_var(var, default_ms).map(|ms| Duration::from_millis(ms as u64))
}
