//! Configuration management for Floodgate.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};
use crate::ratelimit::store::PolicyStore;

/// Environment variable prefix for overrides, e.g. `FLOODGATE__COORDINATOR__URL`.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Coordinator (Redis) connection
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// In-process fallback limiter
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Metrics and alerting
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Circuit breaker guarding the coordinator
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Request admission
    #[serde(default)]
    pub gate: GateConfig,

    /// Rate limit policies
    #[serde(default)]
    pub policies: PolicyStore,
}

/// Coordinator connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Whether the distributed limiter is used at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Redis connection URL
    #[serde(default = "default_coordinator_url")]
    pub url: String,

    #[serde(default = "default_connect_timeout", with = "crate::duration")]
    pub connect_timeout: Duration,

    /// Deadline for each individual command
    #[serde(default = "default_io_timeout", with = "crate::duration")]
    pub io_timeout: Duration,

    /// Keys scanned per cleanup page
    #[serde(default = "default_cleanup_batch_size")]
    pub cleanup_batch_size: usize,

    /// Upper bound on pages per cleanup run
    #[serde(default = "default_cleanup_max_batches")]
    pub cleanup_max_batches: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_coordinator_url(),
            connect_timeout: default_connect_timeout(),
            io_timeout: default_io_timeout(),
            cleanup_batch_size: default_cleanup_batch_size(),
            cleanup_max_batches: default_cleanup_max_batches(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_coordinator_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_cleanup_batch_size() -> usize {
    1000
}

fn default_cleanup_max_batches() -> usize {
    100
}

/// Local fallback limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// How often the sweeper compacts windows and evicts idle ones
    #[serde(default = "default_sweep_interval", with = "crate::duration")]
    pub sweep_interval: Duration,

    /// Minimum time between compactions of one window on the request path
    #[serde(default = "default_compaction_interval", with = "crate::duration")]
    pub compaction_interval: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            compaction_interval: default_compaction_interval(),
        }
    }
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_compaction_interval() -> Duration {
    Duration::from_secs(60)
}

/// Monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    #[serde(default = "default_true")]
    pub enable_alerting: bool,

    /// Utilization at or above which `high_usage` fires, in [0, 1]
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,

    #[serde(default = "default_high_latency_threshold", with = "crate::duration")]
    pub high_latency_threshold: Duration,

    /// Minimum spacing between alerts of the same type for the same endpoint
    #[serde(default = "default_alert_throttle", with = "crate::duration")]
    pub alert_throttle: Duration,

    /// Capacity of the alert queue; alerts beyond it are dropped
    #[serde(default = "default_alert_queue_capacity")]
    pub alert_queue_capacity: usize,

    /// Minimum spacing between "alerts dropped" warnings
    #[serde(default = "default_drop_log_interval", with = "crate::duration")]
    pub drop_log_interval: Duration,

    #[serde(default = "default_health_check_interval", with = "crate::duration")]
    pub health_check_interval: Duration,

    #[serde(default = "default_performance_interval", with = "crate::duration")]
    pub performance_interval: Duration,

    /// How often delivered alerts older than `alert_retention` are pruned
    #[serde(default = "default_alert_cleanup_interval", with = "crate::duration")]
    pub alert_cleanup_interval: Duration,

    #[serde(default = "default_alert_retention", with = "crate::duration")]
    pub alert_retention: Duration,

    /// Optional webhook receiving every alert as JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            enable_alerting: true,
            alert_threshold: default_alert_threshold(),
            high_latency_threshold: default_high_latency_threshold(),
            alert_throttle: default_alert_throttle(),
            alert_queue_capacity: default_alert_queue_capacity(),
            drop_log_interval: default_drop_log_interval(),
            health_check_interval: default_health_check_interval(),
            performance_interval: default_performance_interval(),
            alert_cleanup_interval: default_alert_cleanup_interval(),
            alert_retention: default_alert_retention(),
            webhook_url: None,
        }
    }
}

fn default_alert_threshold() -> f64 {
    0.8
}

fn default_high_latency_threshold() -> Duration {
    Duration::from_millis(100)
}

fn default_alert_throttle() -> Duration {
    Duration::from_secs(300)
}

fn default_alert_queue_capacity() -> usize {
    100
}

fn default_drop_log_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_performance_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_alert_cleanup_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_alert_retention() -> Duration {
    Duration::from_secs(24 * 3600)
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Successful probes needed to close it again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_open_timeout", with = "crate::duration")]
    pub open_timeout: Duration,

    /// In-flight probes allowed while half-open
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout: default_open_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_concurrent_requests() -> usize {
    1
}

/// What the gate does when the coordinator cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Decide with the local fallback limiter
    #[default]
    Fallback,
    /// Admit the request
    FailOpen,
    /// Return the error to the caller
    FailClosed,
}

/// Admission gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Overall deadline for one coordinator check
    #[serde(default = "default_check_deadline", with = "crate::duration")]
    pub check_deadline: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            check_deadline: default_check_deadline(),
        }
    }
}

fn default_check_deadline() -> Duration {
    Duration::from_millis(250)
}

impl FloodgateConfig {
    /// Load configuration from a YAML or JSON file, with `FLOODGATE__*`
    /// environment overrides applied on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| LimiterError::Config(format!("{}: {}", path.display(), e)))?;

        let mut config: FloodgateConfig = settings
            .try_deserialize()
            .map_err(|e| LimiterError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without environment overrides.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let mut config: FloodgateConfig =
            serde_yaml::from_str(contents).map_err(|e| LimiterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.monitor.alert_threshold) {
            return Err(LimiterError::Config(format!(
                "monitor.alert_threshold must be between 0 and 1, got {}",
                self.monitor.alert_threshold
            )));
        }
        if self.monitor.alert_queue_capacity == 0 {
            return Err(LimiterError::Config(
                "monitor.alert_queue_capacity must be positive".to_string(),
            ));
        }
        if self.breaker.max_concurrent_requests == 0 {
            return Err(LimiterError::Config(
                "breaker.max_concurrent_requests must be positive".to_string(),
            ));
        }
        if self.gate.check_deadline.is_zero() {
            return Err(LimiterError::Config(
                "gate.check_deadline must be positive".to_string(),
            ));
        }
        self.policies.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FloodgateConfig::default();
        assert!(config.coordinator.enabled);
        assert_eq!(config.coordinator.io_timeout, Duration::from_secs(3));
        assert_eq!(config.fallback.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.monitor.alert_queue_capacity, 100);
        assert_eq!(config.breaker.max_concurrent_requests, 1);
        assert_eq!(config.gate.failure_policy, FailurePolicy::Fallback);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
coordinator:
  url: redis://cache:6379/2
  io_timeout: 500ms
monitor:
  alert_threshold: 0.9
  high_latency_threshold: 250ms
gate:
  failure_policy: fail_open
policies:
  default_limit: 50
  default_window: 30s
  endpoint_limits:
    /api/login:
      limit: 5
      window: 1m
"#;
        let config = FloodgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.coordinator.url, "redis://cache:6379/2");
        assert_eq!(config.coordinator.io_timeout, Duration::from_millis(500));
        assert_eq!(config.monitor.high_latency_threshold, Duration::from_millis(250));
        assert_eq!(config.gate.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.policies.default_limit, 50);
        assert_eq!(config.policies.get_endpoint_limit("/api/login").limit, 5);
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let yaml = "monitor:\n  alert_threshold: 1.5\n";
        assert!(matches!(
            FloodgateConfig::from_yaml(yaml),
            Err(LimiterError::Config(_))
        ));
    }

    #[test]
    fn test_from_file_reads_yaml() {
        let path = std::env::temp_dir().join(format!("floodgate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "gate:\n  check_deadline: 1s\n").unwrap();

        let config = FloodgateConfig::from_file(&path).unwrap();
        assert_eq!(config.gate.check_deadline, Duration::from_secs(1));

        std::fs::remove_file(&path).unwrap();
    }
}
