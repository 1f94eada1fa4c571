// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer configuration.
//!
//! Supports both programmatic and file-based configuration.
//!
//! ```toml
//! group_name = "order-producer"
//! send_msg_timeout_ms = 3000
//! max_attempt_times = 3
//! send_latency_fault_enable = true
//!
//! [[isolation_steps]]
//! latency_ms = 550
//! duration_ms = 30000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default producer group.
pub const DEFAULT_PRODUCER_GROUP: &str = "DEFAULT_PRODUCER";

/// Largest body accepted by default (4 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Bodies above this size are compressed by default (4 MiB).
pub const DEFAULT_COMPRESS_BODY_THRESHOLD: usize = 4 * 1024 * 1024;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One row of the latency → isolation table.
///
/// A send whose latency is at least `latency_ms` keeps its broker out of
/// selection for `duration_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationStep {
    pub latency_ms: u64,
    pub duration_ms: u64,
}

impl IsolationStep {
    /// Step isolating for `duration_ms` once latency reaches `latency_ms`.
    pub const fn new(latency_ms: u64, duration_ms: u64) -> Self {
        Self {
            latency_ms,
            duration_ms,
        }
    }
}

fn default_isolation_steps() -> Vec<IsolationStep> {
    vec![
        IsolationStep::new(50, 0),
        IsolationStep::new(100, 0),
        IsolationStep::new(550, 30_000),
        IsolationStep::new(1_000, 60_000),
        IsolationStep::new(2_000, 120_000),
        IsolationStep::new(3_000, 180_000),
        IsolationStep::new(15_000, 600_000),
    ]
}

/// Producer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Producer group (sent with every request, used by transaction checks).
    pub group_name: String,

    /// Instance name (distinguishes producers sharing a process).
    pub instance_name: String,

    /// Unit name for unit-mode deployments.
    pub unit_name: Option<String>,

    /// Overall deadline of a send call, retries included (ms).
    pub send_msg_timeout_ms: u64,

    /// Dispatch attempts for synchronous sends.
    pub max_attempt_times: u32,

    /// Dispatch attempts for asynchronous sends.
    pub async_max_attempt_times: u32,

    /// Retry on another broker when the store status is not `SendOk`.
    pub retry_another_broker_when_not_store_ok: bool,

    /// Enable latency-based broker isolation.
    pub send_latency_fault_enable: bool,

    /// Latency charged to a broker on an isolating failure (ms).
    pub isolation_latency_ms: u64,

    /// Maximum message body size (bytes).
    pub max_message_size: usize,

    /// Bodies larger than this are compressed (bytes).
    pub compress_body_threshold: usize,

    /// zlib compression level (0-9).
    pub compress_level: u32,

    /// Worker threads delivering async send callbacks.
    pub callback_thread_pool_size: usize,

    /// Pending callback jobs before delivery falls back to the I/O context.
    pub callback_queue_capacity: usize,

    /// Worker threads servicing broker transaction checks.
    pub check_thread_pool_size: usize,

    /// Pending check requests before new ones are rejected.
    pub check_request_hold_max: usize,

    /// Timeout of the end-transaction report (ms).
    pub end_transaction_timeout_ms: u64,

    /// Route refresh interval (ms, 0 disables the background refresher).
    pub route_poll_interval_ms: u64,

    /// Period of the housekeeping pass expiring requests and stale
    /// transaction records (ms).
    pub housekeeping_interval_ms: u64,

    /// How long an undecided transaction record is kept (ms).
    pub transaction_record_ttl_ms: u64,

    /// Latency → isolation duration step table (ascending latency).
    pub isolation_steps: Vec<IsolationStep>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            group_name: DEFAULT_PRODUCER_GROUP.to_string(),
            instance_name: "DEFAULT".to_string(),
            unit_name: None,
            send_msg_timeout_ms: 3_000,
            max_attempt_times: 3,
            async_max_attempt_times: 2,
            retry_another_broker_when_not_store_ok: false,
            send_latency_fault_enable: false,
            isolation_latency_ms: 30_000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            compress_body_threshold: DEFAULT_COMPRESS_BODY_THRESHOLD,
            compress_level: 5,
            callback_thread_pool_size: 4,
            callback_queue_capacity: 10_000,
            check_thread_pool_size: 1,
            check_request_hold_max: 2_000,
            end_transaction_timeout_ms: 3_000,
            route_poll_interval_ms: 30_000,
            housekeeping_interval_ms: 1_000,
            transaction_record_ttl_ms: 300_000,
            isolation_steps: default_isolation_steps(),
        }
    }
}

impl ProducerConfig {
    /// Create a config for the given producer group.
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_name.is_empty() {
            return Err(ConfigError::Invalid("group_name is empty".into()));
        }
        if self.max_attempt_times == 0 || self.async_max_attempt_times == 0 {
            return Err(ConfigError::Invalid(
                "attempt times must be at least 1".into(),
            ));
        }
        if self.send_msg_timeout_ms == 0 {
            return Err(ConfigError::Invalid("send_msg_timeout_ms is zero".into()));
        }
        if self.callback_thread_pool_size == 0 || self.check_thread_pool_size == 0 {
            return Err(ConfigError::Invalid("thread pool size is zero".into()));
        }
        if self.callback_queue_capacity == 0 || self.check_request_hold_max == 0 {
            return Err(ConfigError::Invalid("pool queue capacity is zero".into()));
        }
        if self.compress_level > 9 {
            return Err(ConfigError::Invalid(format!(
                "compress_level {} out of range 0-9",
                self.compress_level
            )));
        }
        if self.housekeeping_interval_ms == 0 || self.transaction_record_ttl_ms == 0 {
            return Err(ConfigError::Invalid(
                "housekeeping interval and transaction record ttl must be non-zero".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size is zero".into()));
        }

        for (i, pair) in self.isolation_steps.windows(2).enumerate() {
            if pair[1].latency_ms <= pair[0].latency_ms {
                return Err(ConfigError::Invalid(format!(
                    "isolation step {} latency {} is not above {}",
                    i + 1,
                    pair[1].latency_ms,
                    pair[0].latency_ms
                )));
            }
            if pair[1].duration_ms < pair[0].duration_ms {
                return Err(ConfigError::Invalid(format!(
                    "isolation step {} duration decreases",
                    i + 1
                )));
            }
        }

        Ok(())
    }

    /// Set the producer group.
    pub fn group_name(mut self, group: impl Into<String>) -> Self {
        self.group_name = group.into();
        self
    }

    /// Set the overall send deadline.
    pub fn send_msg_timeout(mut self, timeout: Duration) -> Self {
        self.send_msg_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the synchronous attempt bound.
    pub fn max_attempt_times(mut self, attempts: u32) -> Self {
        self.max_attempt_times = attempts;
        self
    }

    /// Set the asynchronous attempt bound.
    pub fn async_max_attempt_times(mut self, attempts: u32) -> Self {
        self.async_max_attempt_times = attempts;
        self
    }

    /// Enable or disable latency-based isolation.
    pub fn send_latency_fault_enable(mut self, enabled: bool) -> Self {
        self.send_latency_fault_enable = enabled;
        self
    }

    /// Replace the isolation step table.
    pub fn isolation_steps(mut self, steps: Vec<IsolationStep>) -> Self {
        self.isolation_steps = steps;
        self
    }

    /// Set the compression threshold.
    pub fn compress_body_threshold(mut self, bytes: usize) -> Self {
        self.compress_body_threshold = bytes;
        self
    }

    /// Set the transaction check pool size.
    pub fn check_thread_pool_size(mut self, threads: usize) -> Self {
        self.check_thread_pool_size = threads;
        self
    }

    /// Set the route refresh interval (zero disables it).
    pub fn route_poll_interval(mut self, interval: Duration) -> Self {
        self.route_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the housekeeping period.
    pub fn housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set how long undecided transaction records are kept.
    pub fn transaction_record_ttl(mut self, ttl: Duration) -> Self {
        self.transaction_record_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Keep retrying on another broker when the store status is not OK.
    pub fn retry_another_broker_when_not_store_ok(mut self, enabled: bool) -> Self {
        self.retry_another_broker_when_not_store_ok = enabled;
        self
    }

    /// Default send timeout.
    pub fn send_msg_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.send_msg_timeout_ms)
    }

    /// Timeout of end-transaction reports.
    pub fn end_transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.end_transaction_timeout_ms)
    }

    /// Route refresh period; `None` disables the refresher.
    pub fn route_poll_interval_duration(&self) -> Option<Duration> {
        (self.route_poll_interval_ms > 0).then(|| Duration::from_millis(self.route_poll_interval_ms))
    }

    /// Housekeeping period.
    pub fn housekeeping_interval_duration(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    /// Age after which open transaction records are dropped.
    pub fn transaction_record_ttl_duration(&self) -> Duration {
        Duration::from_millis(self.transaction_record_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProducerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_attempt_times, 3);
        assert!(!config.send_latency_fault_enable);
        assert_eq!(config.isolation_steps.len(), 7);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = ProducerConfig::default().max_attempt_times(0);
        assert!(config.validate().is_err());

        let config = ProducerConfig::default().group_name("");
        assert!(config.validate().is_err());

        let config = ProducerConfig::default().isolation_steps(vec![
            IsolationStep::new(100, 0),
            IsolationStep::new(50, 10),
        ]);
        assert!(config.validate().is_err());

        let config = ProducerConfig::default().isolation_steps(vec![
            IsolationStep::new(100, 500),
            IsolationStep::new(200, 10),
        ]);
        assert!(config.validate().is_err());

        let mut config = ProducerConfig::default();
        config.compress_level = 12;
        assert!(config.validate().is_err());

        let config = ProducerConfig::default().transaction_record_ttl(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = ProducerConfig::new("orders")
            .send_msg_timeout(Duration::from_secs(5))
            .max_attempt_times(4)
            .send_latency_fault_enable(true)
            .route_poll_interval(Duration::ZERO);

        assert_eq!(config.group_name, "orders");
        assert_eq!(config.send_msg_timeout_ms, 5_000);
        assert_eq!(config.max_attempt_times, 4);
        assert!(config.send_latency_fault_enable);
        assert!(config.route_poll_interval_duration().is_none());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            r#"
group_name = "orders"
send_latency_fault_enable = true
max_attempt_times = 5

[[isolation_steps]]
latency_ms = 100
duration_ms = 0

[[isolation_steps]]
latency_ms = 500
duration_ms = 10000
"#
        )
        .expect("write");

        let config = ProducerConfig::from_file(file.path()).expect("load");
        assert_eq!(config.group_name, "orders");
        assert!(config.send_latency_fault_enable);
        assert_eq!(config.max_attempt_times, 5);
        assert_eq!(config.isolation_steps.len(), 2);
        // untouched keys keep their defaults
        assert_eq!(config.send_msg_timeout_ms, 3_000);
    }

    #[test]
    fn test_from_file_invalid() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "max_attempt_times = 0").expect("write");
        assert!(matches!(
            ProducerConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_config_serialization() {
        let config = ProducerConfig::new("orders");
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        assert!(toml_str.contains("group_name = \"orders\""));
        assert!(toml_str.contains("latency_ms = 550"));
    }
}
