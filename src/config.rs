//! Configuration management for floodgate limiters.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{FloodgateError, Result};

/// Main configuration for a floodgate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Rate applied when the limiter is built
    #[serde(default)]
    pub rate: RateConfig,

    /// Pending-callback buffer configuration
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Ramp-up configuration
    #[serde(default)]
    pub ramp: RampConfig,
}

impl Default for FloodgateConfig {
    fn default() -> Self {
        Self {
            rate: RateConfig::default(),
            buffer: BufferConfig::default(),
            ramp: RampConfig::default(),
        }
    }
}

/// Initial rate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Permits issued per period; may be fractional
    #[serde(default = "default_events_per_period")]
    pub events_per_period: f64,

    /// Period length in milliseconds
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Maximum permits consumable instantaneously
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            events_per_period: default_events_per_period(),
            period_ms: default_period_ms(),
            burst: default_burst(),
        }
    }
}

// The default rate is zero: nothing is dispatched until a rate is set.
fn default_events_per_period() -> f64 {
    0.0
}

fn default_period_ms() -> u64 {
    1000
}

fn default_burst() -> u32 {
    1
}

/// Pending-callback buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Number of slots in the ring
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Time-to-live for a buffered callback, in milliseconds
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_ms: default_ttl_ms(),
        }
    }
}

fn default_capacity() -> usize {
    1024
}

fn default_ttl_ms() -> u64 {
    5000
}

/// Ramp-up configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    /// Permits per second added toward an increased target rate. The default
    /// is unbounded: increases jump straight to the target.
    #[serde(default = "default_ramp_permits_per_second")]
    pub permits_per_second: f64,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            permits_per_second: default_ramp_permits_per_second(),
        }
    }
}

fn default_ramp_permits_per_second() -> f64 {
    f64::INFINITY
}

impl FloodgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse limiter config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FloodgateConfig::default();

        assert_eq!(config.rate.events_per_period, 0.0);
        assert_eq!(config.rate.period_ms, 1000);
        assert_eq!(config.rate.burst, 1);
        assert_eq!(config.buffer.capacity, 1024);
        assert_eq!(config.buffer.ttl_ms, 5000);
        assert!(config.ramp.permits_per_second.is_infinite());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
rate:
  events_per_period: 50
  period_ms: 1000
  burst: 10
buffer:
  capacity: 128
  ttl_ms: 2000
ramp:
  permits_per_second: 5
"#;

        let config = FloodgateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.rate.events_per_period, 50.0);
        assert_eq!(config.rate.burst, 10);
        assert_eq!(config.buffer.capacity, 128);
        assert_eq!(config.buffer.ttl_ms, 2000);
        assert_eq!(config.ramp.permits_per_second, 5.0);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
rate:
  events_per_period: 3
"#;

        let config = FloodgateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.rate.events_per_period, 3.0);
        assert_eq!(config.rate.period_ms, 1000);
        assert_eq!(config.buffer.capacity, 1024);
    }

    #[test]
    fn test_invalid_yaml_is_a_config_error() {
        let result = FloodgateConfig::from_yaml("rate: [not, a, map]");
        assert!(matches!(result, Err(FloodgateError::Config(_))));
    }
}
