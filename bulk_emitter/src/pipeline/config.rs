use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use super::{batching::BatchConfig, failure::RetryPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_batch_size must be positive")]
    ZeroBatchSize,

    #[error("max_batch_bytes must be positive when set")]
    ZeroBatchBytes,

    #[error("delivery_interval_ms must be positive")]
    ZeroDeliveryInterval,

    #[error("max_in_flight must be positive")]
    ZeroMaxInFlight,

    #[error("retry.min_backoff_ms ({min}) exceeds retry.max_backoff_ms ({max})")]
    InvalidBackoff { min: u64, max: u64 },

    #[error("unreadable configuration: {0}")]
    Parse(String),
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_delivery_interval_ms() -> u64 {
    1000
}

fn default_max_in_flight() -> usize {
    4
}

fn default_shutdown_grace_period_ms() -> u64 {
    5000
}

/// Every option the delivery core recognizes.
///
/// - `max_batch_size`: items per batch before a size-triggered flush.
/// - `max_batch_bytes`: optional payload byte limit, also triggers a flush.
/// - `delivery_interval_ms`: period of the time-triggered flush.
/// - `max_in_flight`: concurrent `deliver` calls; 1 keeps delivery in swap order.
/// - `shutdown_grace_period_ms`: how long `stop` waits for in-flight deliveries.
/// - `retry`: redelivery ceiling and backoff for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub max_batch_bytes: Option<usize>,
    #[serde(default = "default_delivery_interval_ms")]
    pub delivery_interval_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_shutdown_grace_period_ms")]
    pub shutdown_grace_period_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            max_batch_size: default_max_batch_size(),
            max_batch_bytes: None,
            delivery_interval_ms: default_delivery_interval_ms(),
            max_in_flight: default_max_in_flight(),
            shutdown_grace_period_ms: default_shutdown_grace_period_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DeliveryConfig {
    pub fn new(max_batch_size: usize, delivery_interval: Duration) -> Self {
        DeliveryConfig {
            max_batch_size,
            delivery_interval_ms: delivery_interval.as_millis() as u64,
            ..DeliveryConfig::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: DeliveryConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.max_batch_bytes == Some(0) {
            return Err(ConfigError::ZeroBatchBytes);
        }
        if self.delivery_interval_ms == 0 {
            return Err(ConfigError::ZeroDeliveryInterval);
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::ZeroMaxInFlight);
        }
        if self.retry.min_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff {
                min: self.retry.min_backoff_ms,
                max: self.retry.max_backoff_ms,
            });
        }
        Ok(())
    }

    pub fn delivery_interval(&self) -> Duration {
        Duration::from_millis(self.delivery_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn batch_config(&self) -> BatchConfig {
        let config = BatchConfig::new(self.max_batch_size);
        match self.max_batch_bytes {
            Some(max) => config.with_max_batch_bytes(max),
            None => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        assert_eq!(DeliveryConfig::from_json("{}").unwrap(), DeliveryConfig::default());
    }

    #[test]
    fn parses_every_option() {
        let config = DeliveryConfig::from_json(
            r#"{
                "max_batch_size": 3,
                "max_batch_bytes": 4096,
                "delivery_interval_ms": 250,
                "max_in_flight": 1,
                "shutdown_grace_period_ms": 100,
                "retry": { "max_retries": 2, "min_backoff_ms": 10, "max_backoff_ms": 20 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_batch_size, 3);
        assert_eq!(config.batch_config().max_batch_size(), 3);
        assert_eq!(config.delivery_interval(), Duration::from_millis(250));
        assert_eq!(config.shutdown_grace_period(), Duration::from_millis(100));
        assert_eq!(config.retry.max_retries, 2);
    }

    #[test]
    fn rejects_invalid_values() {
        let cases = [
            (r#"{ "max_batch_size": 0 }"#, ConfigError::ZeroBatchSize),
            (r#"{ "max_batch_bytes": 0 }"#, ConfigError::ZeroBatchBytes),
            (r#"{ "delivery_interval_ms": 0 }"#, ConfigError::ZeroDeliveryInterval),
            (r#"{ "max_in_flight": 0 }"#, ConfigError::ZeroMaxInFlight),
            (
                r#"{ "retry": { "min_backoff_ms": 50, "max_backoff_ms": 10 } }"#,
                ConfigError::InvalidBackoff { min: 50, max: 10 },
            ),
        ];

        for (json, expected) in cases {
            assert_eq!(DeliveryConfig::from_json(json).unwrap_err(), expected, "{json}");
        }
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            DeliveryConfig::from_json("{ max_batch_size"),
            Err(ConfigError::Parse(_))
        ));
    }
}
