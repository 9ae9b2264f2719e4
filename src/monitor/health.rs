//! Health report exported by the monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub limiter_healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limiter_error: Option<String>,
    pub monitoring_enabled: bool,
    pub alerting_enabled: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub alerts_in_queue: usize,
    pub total_requests: u64,
    /// Allowed over total; zero before any request
    pub success_rate: f64,
    /// Errors over total; zero before any request
    pub error_rate: f64,
    pub active_endpoints: usize,
}

/// `part / total`, or zero when nothing has been counted.
pub fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_guards_zero() {
        assert_eq!(ratio(0, 0), 0.0);
        assert_eq!(ratio(5, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
    }

    #[test]
    fn test_serializes_camel_case() {
        let status = HealthStatus {
            limiter_healthy: true,
            limiter_error: None,
            monitoring_enabled: true,
            alerting_enabled: false,
            last_check: None,
            alerts_in_queue: 2,
            total_requests: 10,
            success_rate: 0.9,
            error_rate: 0.0,
            active_endpoints: 3,
        };
        let json = serde_json::to_value(&status).unwrap();
        for field in [
            "limiterHealthy",
            "monitoringEnabled",
            "alertingEnabled",
            "lastCheck",
            "alertsInQueue",
            "totalRequests",
            "successRate",
            "errorRate",
            "activeEndpoints",
        ] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
        assert!(json.get("limiterError").is_none());
    }
}
