//! Configuration for the pub/sub engine.
//!
//! Supports YAML file and environment variable overrides.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Pub/sub engine configuration.
///
/// The `seed` and `hash_family_size` must be identical on every node of a
/// cluster; they define the shared hash family that makes replicated Bloom
/// filters comparable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Seed string for the cluster-wide hash family.
    pub seed: String,
    /// Number of hash functions in the family.
    pub hash_family_size: usize,
    /// Target false-positive probability for exported Bloom filters.
    pub false_positive_rate: f64,
    /// Sizing headroom so topic growth between ticks needs no resize.
    pub buffer_factor: f64,
    /// Initial topic-count estimate for filter sizing.
    pub expected_topics: usize,
    /// Replication tick interval in milliseconds.
    pub update_interval_ms: u64,
    /// Probability per tick of re-exporting an unchanged store.
    pub force_update_probability: f64,
    /// Delay before the supervisor restarts crashed children, milliseconds.
    pub restart_delay_ms: u64,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            seed: "clustercast".to_string(),
            hash_family_size: 5,
            false_positive_rate: 0.01,
            buffer_factor: 1.5,
            expected_topics: 128,
            update_interval_ms: 1000,
            force_update_probability: 0.01,
            restart_delay_ms: 2000,
        }
    }
}

impl PubSubConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CLUSTERCAST_CONFIG").unwrap_or_else(|_| "pubsub.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(seed) = std::env::var("CLUSTERCAST_SEED") {
            self.seed = seed;
        }

        if let Ok(interval) = std::env::var("CLUSTERCAST_UPDATE_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.update_interval_ms = ms;
            }
        }

        if let Ok(delay) = std::env::var("CLUSTERCAST_RESTART_DELAY_MS") {
            if let Ok(ms) = delay.parse() {
                self.restart_delay_ms = ms;
            }
        }

        if let Ok(probability) = std::env::var("CLUSTERCAST_FORCE_UPDATE_PROBABILITY") {
            if let Ok(p) = probability.parse() {
                self.force_update_probability = p;
            }
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.seed.is_empty() {
            return Err(ConfigError::Invalid("seed must not be empty".to_string()));
        }
        if self.hash_family_size == 0 {
            return Err(ConfigError::Invalid(
                "hash_family_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.false_positive_rate) || self.false_positive_rate == 0.0 {
            return Err(ConfigError::Invalid(
                "false_positive_rate must be in (0, 1)".to_string(),
            ));
        }
        if self.buffer_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "buffer_factor must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.force_update_probability) {
            return Err(ConfigError::Invalid(
                "force_update_probability must be in [0, 1]".to_string(),
            ));
        }
        if self.update_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "update_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PubSubConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hash_family_size, 5);
        assert_eq!(config.update_interval(), Duration::from_millis(1000));
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
seed: "production-cluster"
update_interval_ms: 250
"#;
        let config: PubSubConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.seed, "production-cluster");
        assert_eq!(config.update_interval_ms, 250);
        // Unspecified fields keep their defaults.
        assert_eq!(config.buffer_factor, 1.5);
    }

    #[test]
    fn test_validate_rejects_zero_family() {
        let config = PubSubConfig {
            hash_family_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_probability() {
        let config = PubSubConfig {
            force_update_probability: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PubSubConfig {
            false_positive_rate: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_shrinking_buffer() {
        let config = PubSubConfig {
            buffer_factor: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
