//! Runtime configuration.
//!
//! All fields have defaults, so an empty file is a valid config. Binaries load the file first
//! and apply command line flags on top.
//!
//! Example:
//!
//! ```toml
//! [log]
//! dir = "/data/rivulet"
//! partitions = 4
//!
//! [producer]
//! batch_size = 25
//! max_delivery_attempts = 8
//!
//! [consumer]
//! window_secs = 300
//! start_position = "trim_horizon"
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error_bail;
use crate::stream_log::StartPosition;

/// Max records in one delivery batch.
pub const DEFAULT_BATCH_SIZE: usize = 25;

/// Default trailing window, 5 minutes.
pub const DEFAULT_WINDOW_SECS: u64 = 300;

/// Longest accepted trailing window, 30 days.
pub const MAX_WINDOW_SECS: u64 = 30 * 24 * 3600;

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RivuletConfig {
    pub log: LogConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
}

impl RivuletConfig {
    /// Parse from a toml file.
    pub fn from_config_file(filename: &str) -> Result<Self> {
        let content = std::fs::read_to_string(filename)
            .map_err(|e| anyhow!("read config file failed, filename: {}, error: {}", filename, e))?;
        Self::from_config_str(&content)
    }

    /// Parse from a toml string.
    pub fn from_config_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| anyhow!("invalid config, error: {}", e))?;
        config.validate()?;

        Ok(config)
    }

    /// Load `filename` if given, defaults otherwise.
    pub fn load(filename: Option<&str>) -> Result<Self> {
        match filename {
            Some(f) => Self::from_config_file(f),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.log.partitions == 0 {
            error_bail!("log.partitions must be positive");
        }

        if self.producer.batch_size == 0 {
            error_bail!("producer.batch_size must be positive");
        }

        if self.producer.max_delivery_attempts == 0 {
            error_bail!("producer.max_delivery_attempts must be positive");
        }

        if self.producer.chunk_size == 0 {
            error_bail!("producer.chunk_size must be positive");
        }

        if self.producer.pace_min_ms > self.producer.pace_max_ms {
            error_bail!(
                "producer.pace_min_ms {} greater than pace_max_ms {}",
                self.producer.pace_min_ms,
                self.producer.pace_max_ms
            );
        }

        if self.consumer.fetch_limit == 0 {
            error_bail!("consumer.fetch_limit must be positive");
        }

        if self.consumer.window_secs == 0 {
            error_bail!("consumer.window_secs must be positive");
        }

        if self.consumer.window_secs > MAX_WINDOW_SECS {
            error_bail!(
                "consumer.window_secs {} greater than max {}",
                self.consumer.window_secs,
                MAX_WINDOW_SECS
            );
        }

        Ok(())
    }
}

/// Where the log lives.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Root directory of the file log.
    pub dir: String,

    /// Partition count used when the producer creates the stream.
    pub partitions: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: "./rivulet-data".to_string(),
            partitions: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub batch_size: usize,

    /// Attempts per batch, the first send included.
    pub max_delivery_attempts: usize,

    /// Pause before resubmitting the failed records of a batch.
    pub retry_delay_ms: u64,

    /// Pause after a whole `put_batch` call failed.
    pub send_error_delay_ms: u64,

    /// Read size of the bulk source.
    pub chunk_size: usize,

    /// In continuous mode, pause every `pace_every` records.
    pub pace_every: usize,
    pub pace_min_ms: u64,
    pub pace_max_ms: u64,

    /// Log progress every `progress_every` records.
    pub progress_every: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_delivery_attempts: 8,
            retry_delay_ms: 1000,
            send_error_delay_ms: 5000,
            chunk_size: 1024 * 1024,
            pace_every: 10,
            pace_min_ms: 100,
            pace_max_ms: 300,
            progress_every: 100,
        }
    }
}

impl ProducerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn send_error_delay(&self) -> Duration {
        Duration::from_millis(self.send_error_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Max records per fetch.
    pub fetch_limit: usize,

    /// Pause after an empty fetch. Doubles on consecutive empty fetches up to
    /// `max_idle_backoff_ms`.
    pub idle_backoff_ms: u64,
    pub max_idle_backoff_ms: u64,

    /// Pause after a failed fetch, before repositioning the cursor.
    pub error_backoff_ms: u64,

    /// Deadline of one fetch call.
    pub fetch_timeout_ms: u64,

    /// Trailing window retention.
    pub window_secs: u64,

    /// Interval of the periodic report, 0 disables it.
    pub report_interval_secs: u64,

    pub top_terms: usize,
    pub top_entities: usize,

    pub start_position: StartPosition,

    /// Time given to workers to finish after shutdown is requested.
    pub shutdown_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            fetch_limit: 100,
            idle_backoff_ms: 500,
            max_idle_backoff_ms: 500,
            error_backoff_ms: 5000,
            fetch_timeout_ms: 10_000,
            window_secs: DEFAULT_WINDOW_SECS,
            report_interval_secs: 30,
            top_terms: 10,
            top_entities: 5,
            start_position: StartPosition::TrimHorizon,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl ConsumerConfig {
    pub fn idle_backoff(&self, consecutive_empty: u32) -> Duration {
        let shift = consecutive_empty.saturating_sub(1).min(16);
        let ms = self
            .idle_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_idle_backoff_ms.max(self.idle_backoff_ms));

        Duration::from_millis(ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Trailing window, clamped to `MAX_WINDOW_SECS`.
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs.min(MAX_WINDOW_SECS) as i64)
    }

    pub fn report_interval(&self) -> Option<Duration> {
        if self.report_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.report_interval_secs))
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() -> Result<()> {
        let config = RivuletConfig::from_config_str("")?;

        assert_eq!(config.producer.batch_size, 25);
        assert_eq!(config.consumer.window_secs, 300);
        assert_eq!(config.consumer.start_position, StartPosition::TrimHorizon);
        assert_eq!(config.log.partitions, 4);

        Ok(())
    }

    #[test]
    fn test_partial_config() -> Result<()> {
        let config = RivuletConfig::from_config_str(
            r#"
            [producer]
            max_delivery_attempts = 3

            [consumer]
            window_secs = 60
            start_position = "latest"
            "#,
        )?;

        assert_eq!(config.producer.max_delivery_attempts, 3);
        assert_eq!(config.producer.batch_size, 25);
        assert_eq!(config.consumer.window_secs, 60);
        assert_eq!(config.consumer.start_position, StartPosition::Latest);

        Ok(())
    }

    #[test]
    fn test_invalid_config() {
        assert!(RivuletConfig::from_config_str("[producer]\nbatch_size = 0").is_err());
        assert!(RivuletConfig::from_config_str("[consumer]\nstart_position = \"middle\"").is_err());
        assert!(
            RivuletConfig::from_config_str("[producer]\npace_min_ms = 10\npace_max_ms = 5").is_err()
        );
    }

    #[test]
    fn test_window_secs_ceiling() -> Result<()> {
        let mut config = RivuletConfig::default();

        config.consumer.window_secs = MAX_WINDOW_SECS;
        config.validate()?;
        assert_eq!(config.consumer.window().num_seconds(), MAX_WINDOW_SECS as i64);

        config.consumer.window_secs = 10_000_000_000_000;
        assert!(config.validate().is_err());

        config.consumer.window_secs = u64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(config.consumer.window().num_seconds(), MAX_WINDOW_SECS as i64);

        assert!(RivuletConfig::from_config_str("[consumer]\nwindow_secs = 10000000000000").is_err());

        Ok(())
    }

    #[test]
    fn test_idle_backoff() {
        let mut config = ConsumerConfig::default();
        assert_eq!(config.idle_backoff(1), Duration::from_millis(500));
        assert_eq!(config.idle_backoff(10), Duration::from_millis(500));

        config.idle_backoff_ms = 100;
        config.max_idle_backoff_ms = 1000;
        assert_eq!(config.idle_backoff(1), Duration::from_millis(100));
        assert_eq!(config.idle_backoff(2), Duration::from_millis(200));
        assert_eq!(config.idle_backoff(3), Duration::from_millis(400));
        assert_eq!(config.idle_backoff(5), Duration::from_millis(1000));
        assert_eq!(config.idle_backoff(100), Duration::from_millis(1000));
    }
}
