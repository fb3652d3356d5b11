//! Configuration module for the RPC proxy
//!
//! Handles configuration loading from TOML files and provides
//! structured configuration types with validated defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ingress server bind options
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream RPC endpoint URLs
    pub endpoints: Vec<String>,

    /// Rate-limit detection and cooldown tuning
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Per-endpoint worker behaviour
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Statistics persistence
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the JSON-RPC ingress listens on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Failure-rate signal threshold over the recent window [0, 1]
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f64,

    /// Lower bound for computed cooldowns (ms)
    #[serde(default = "default_min_cooldown_ms")]
    pub min_cooldown_ms: u64,

    /// Upper bound for any cooldown (ms)
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,

    /// Exponent base for consecutive-strike backoff
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Number of recent requests sampled by the failure-rate signal
    #[serde(default = "default_history_window_size")]
    pub history_window_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Upstream HTTP timeout (ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Per-endpoint queue capacity
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Interval between health probes of errored workers (ms)
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Consecutive transport failures before a worker is marked errored
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database location
    #[serde(default = "default_database_path")]
    pub path: String,
}

// Default value functions
fn default_port() -> u16 { 8545 }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_detection_threshold() -> f64 { 0.5 }
fn default_min_cooldown_ms() -> u64 { 60_000 }
fn default_max_cooldown_ms() -> u64 { 300_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_history_window_size() -> usize { 20 }
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_max_queue_size() -> usize { 1000 }
fn default_health_check_interval_ms() -> u64 { 30_000 }
fn default_failure_threshold() -> u32 { 5 }
fn default_database_path() -> String { "./data/statistics.db".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            detection_threshold: default_detection_threshold(),
            min_cooldown_ms: default_min_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            history_window_size: default_history_window_size(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_queue_size: default_max_queue_size(),
            health_check_interval_ms: default_health_check_interval_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Build a configuration from a list of endpoint URLs with defaults everywhere else
    pub fn from_urls(urls: &[String]) -> Self {
        Self {
            server: ServerConfig::default(),
            endpoints: urls.to_vec(),
            rate_limit: RateLimitConfig::default(),
            worker: WorkerConfig::default(),
            database: DatabaseConfig::default(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoints.is_empty() {
            anyhow::bail!("At least one upstream RPC endpoint must be configured");
        }

        let mut seen_urls = std::collections::HashSet::new();
        for url in &self.endpoints {
            if !seen_urls.insert(url) {
                anyhow::bail!("Duplicate RPC URL: {}", url);
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("Invalid URL format: {}", url);
            }
        }

        if !(0.0..=1.0).contains(&self.rate_limit.detection_threshold) {
            anyhow::bail!("rate_limit.detection_threshold must be between 0.0 and 1.0");
        }
        if self.rate_limit.min_cooldown_ms > self.rate_limit.max_cooldown_ms {
            anyhow::bail!("rate_limit.min_cooldown_ms must not exceed max_cooldown_ms");
        }
        if self.rate_limit.backoff_multiplier < 1.0 || !self.rate_limit.backoff_multiplier.is_finite() {
            anyhow::bail!("rate_limit.backoff_multiplier must be >= 1.0");
        }
        if self.rate_limit.history_window_size == 0 {
            anyhow::bail!("rate_limit.history_window_size must be > 0");
        }

        if self.worker.max_queue_size == 0 {
            anyhow::bail!("worker.max_queue_size must be > 0");
        }
        if self.worker.request_timeout_ms == 0 {
            anyhow::bail!("worker.request_timeout_ms must be > 0");
        }
        if self.worker.failure_threshold == 0 {
            anyhow::bail!("worker.failure_threshold must be > 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::from_urls(&["https://rpc-a.example.com".to_string()])
    }

    #[test]
    fn test_default_values() {
        let config = base_config();
        assert_eq!(config.server.port, 8545);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.rate_limit.detection_threshold, 0.5);
        assert_eq!(config.rate_limit.min_cooldown_ms, 60_000);
        assert_eq!(config.rate_limit.max_cooldown_ms, 300_000);
        assert_eq!(config.rate_limit.backoff_multiplier, 2.0);
        assert_eq!(config.rate_limit.history_window_size, 20);
        assert_eq!(config.worker.request_timeout_ms, 30_000);
        assert_eq!(config.worker.max_queue_size, 1000);
        assert_eq!(config.worker.health_check_interval_ms, 30_000);
        assert_eq!(config.database.path, "./data/statistics.db");
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            endpoints = ["https://rpc-a.example.com", "https://rpc-b.example.com"]
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.server.port, 8545);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_overrides() {
        let config: Config = toml::from_str(
            r#"
            endpoints = ["http://localhost:8545"]

            [server]
            port = 9000

            [rate_limit]
            min_cooldown_ms = 1000
            max_cooldown_ms = 5000

            [worker]
            max_queue_size = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.rate_limit.min_cooldown_ms, 1000);
        assert_eq!(config.rate_limit.max_cooldown_ms, 5000);
        assert_eq!(config.worker.max_queue_size, 8);
        // Untouched sections keep defaults
        assert_eq!(config.worker.request_timeout_ms, 30_000);
    }

    #[test]
    fn test_config_validation() {
        assert!(base_config().validate().is_ok());

        let mut empty = base_config();
        empty.endpoints.clear();
        assert!(empty.validate().is_err());

        let dup = Config::from_urls(&[
            "https://rpc-a.example.com".to_string(),
            "https://rpc-a.example.com".to_string(),
        ]);
        assert!(dup.validate().is_err());

        let mut bad_url = base_config();
        bad_url.endpoints[0] = "not-a-url".to_string();
        assert!(bad_url.validate().is_err());

        let mut bad_threshold = base_config();
        bad_threshold.rate_limit.detection_threshold = 1.5;
        assert!(bad_threshold.validate().is_err());

        let mut inverted_bounds = base_config();
        inverted_bounds.rate_limit.min_cooldown_ms = 10_000;
        inverted_bounds.rate_limit.max_cooldown_ms = 5_000;
        assert!(inverted_bounds.validate().is_err());

        let mut zero_queue = base_config();
        zero_queue.worker.max_queue_size = 0;
        assert!(zero_queue.validate().is_err());
    }
}
