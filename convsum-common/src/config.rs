//! Configuration loading for the pipeline service
//!
//! Resolution priority order:
//! 1. Command-line argument (highest priority)
//! 2. `CONVSUM_CONFIG` environment variable
//! 3. Platform config file (`<config dir>/convsum/config.toml`)
//! 4. Built-in defaults (queue URLs have no default and must be set)
//!
//! Individual settings can be overridden by environment variables
//! (`CONVSUM_DB`, `CONVSUM_OUTBOUND_QUEUE_URL`, `CONVSUM_INBOUND_QUEUE_URL`,
//! `CONVSUM_DEAD_LETTER_QUEUE_URL`).

use crate::{Error, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Full pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// SQLite database file holding pipeline state and the summary store
    pub database_path: PathBuf,

    /// Outbound queue (conversations to the ML service)
    pub outbound_queue_url: String,
    /// Inbound queue (results from the ML service)
    pub inbound_queue_url: String,
    /// Dead-letter queue for results that exceed redelivery limits
    pub dead_letter_queue_url: String,

    /// Seconds between poll cycles in normal mode
    pub poll_interval_secs: u64,
    /// Sliding source window scanned each cycle, in minutes
    pub window_minutes: i64,
    /// Quiet time after the last fragment before a conversation counts
    /// as complete, in seconds
    pub grace_window_secs: i64,
    /// Maximum conversations collected per cycle
    pub max_batch_size: i64,
    /// Maximum conversations processed concurrently within a cycle
    pub max_concurrency: usize,
    /// Minimum fragments for a conversation to be dispatchable
    pub min_fragments: usize,

    /// Bounded publish retries before deferring to the next cycle
    pub dispatch_max_retries: u32,
    /// Delay between publish retries, in milliseconds
    pub dispatch_retry_delay_ms: u64,

    /// Long-poll wait on queue receive, in seconds
    pub receive_wait_secs: u64,
    /// Maximum messages fetched per receive call
    pub receive_max_messages: u32,
    /// Redeliveries before a message is diverted to the dead-letter queue
    pub max_receive_count: u32,
    /// Visibility timeout requested on receive, in seconds
    pub visibility_timeout_secs: u64,
    /// HTTP timeout for broker calls, in seconds
    pub request_timeout_secs: u64,

    /// Statistics flush cadence, in cycles
    pub stats_every_cycles: u64,

    /// Backfill range start (inclusive)
    pub historical_start_date: NaiveDate,
    /// Backfill range end (exclusive); defaults to today when absent
    pub historical_end_date: Option<NaiveDate>,
    /// Days covered by one backfill batch
    pub historical_batch_days: i64,
    /// Maximum conversations per backfill batch
    pub historical_batch_size: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("convsum.db"),
            outbound_queue_url: String::new(),
            inbound_queue_url: String::new(),
            dead_letter_queue_url: String::new(),
            poll_interval_secs: 10,
            window_minutes: 10,
            grace_window_secs: 120,
            max_batch_size: 50,
            max_concurrency: 10,
            min_fragments: 2,
            dispatch_max_retries: 3,
            dispatch_retry_delay_ms: 5000,
            receive_wait_secs: 5,
            receive_max_messages: 10,
            max_receive_count: 5,
            visibility_timeout_secs: 600,
            request_timeout_secs: 30,
            stats_every_cycles: 10,
            historical_start_date: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap_or(NaiveDate::MIN),
            historical_end_date: None,
            historical_batch_days: 1,
            historical_batch_size: 50,
        }
    }
}

impl PipelineConfig {
    /// Load configuration following the priority order above
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let mut config = match resolve_config_path(cli_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid config file {}: {}", path.display(), e)))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("CONVSUM_DB") {
            self.database_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("CONVSUM_OUTBOUND_QUEUE_URL") {
            self.outbound_queue_url = url;
        }
        if let Ok(url) = std::env::var("CONVSUM_INBOUND_QUEUE_URL") {
            self.inbound_queue_url = url;
        }
        if let Ok(url) = std::env::var("CONVSUM_DEAD_LETTER_QUEUE_URL") {
            self.dead_letter_queue_url = url;
        }
    }

    /// Validate required settings; missing configuration is fatal at boot
    pub fn validate(&self) -> Result<()> {
        if self.outbound_queue_url.is_empty() {
            return Err(Error::Config("outbound_queue_url is required".into()));
        }
        if self.inbound_queue_url.is_empty() {
            return Err(Error::Config("inbound_queue_url is required".into()));
        }
        if self.dead_letter_queue_url.is_empty() {
            return Err(Error::Config("dead_letter_queue_url is required".into()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".into()));
        }
        if self.historical_batch_days < 1 {
            return Err(Error::Config("historical_batch_days must be at least 1".into()));
        }
        if let Some(end) = self.historical_end_date {
            if end <= self.historical_start_date {
                return Err(Error::Config(
                    "historical_end_date must be after historical_start_date".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Pick the config file path, if any exists
fn resolve_config_path(cli_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var("CONVSUM_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let default = dirs::config_dir().map(|d| d.join("convsum").join("config.toml"))?;
    if default.exists() {
        Some(default)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_fail_validation_without_queues() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_toml_with_partial_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            database_path = "/var/lib/convsum/convsum.db"
            outbound_queue_url = "http://broker:9324/queue/summary-pipe-queue"
            inbound_queue_url = "http://broker:9324/queue/summary-pipe-complete"
            dead_letter_queue_url = "http://broker:9324/queue/summary-pipe-dlq"
            poll_interval_secs = 30
            historical_start_date = "2026-01-01"
            "#
        )
        .unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.window_minutes, 10); // default preserved
        assert_eq!(
            config.historical_start_date,
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_date_range_rejected() {
        let config = PipelineConfig {
            outbound_queue_url: "a".into(),
            inbound_queue_url: "b".into(),
            dead_letter_queue_url: "c".into(),
            historical_start_date: NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
            historical_end_date: NaiveDate::from_ymd_opt(2026, 1, 1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
