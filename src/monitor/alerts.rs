//! Alert types and delivery sinks.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{LimiterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighUsage,
    RateLimited,
    RedisDown,
    HighLatency,
    ConfigError,
    FallbackUsed,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighUsage => "high_usage",
            AlertType::RateLimited => "rate_limited",
            AlertType::RedisDown => "redis_down",
            AlertType::HighLatency => "high_latency",
            AlertType::ConfigError => "config_error",
            AlertType::FallbackUsed => "fallback_used",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A rate limiting alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: Severity,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            alert_type,
            severity,
            message: message.into(),
            timestamp,
            endpoint: None,
            key: None,
            metadata: HashMap::new(),
            resolved: false,
            resolved_at: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_metadata(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(name.to_string(), value.into());
        self
    }

    pub fn resolve(&mut self, at: DateTime<Utc>) {
        self.resolved = true;
        self.resolved_at = Some(at);
    }
}

/// Destination for delivered alerts.
#[async_trait]
pub trait AlertSink: Send + Sync + fmt::Debug {
    async fn send(&self, alert: &Alert) -> Result<()>;

    fn name(&self) -> &str;
}

/// Writes alerts to the tracing log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        let payload = serde_json::to_string(alert).unwrap_or_else(|_| format!("{:?}", alert));
        match alert.severity {
            Severity::Info => info!(alert_type = %alert.alert_type, alert = %payload, "Rate limit alert"),
            Severity::Warning => warn!(alert_type = %alert.alert_type, alert = %payload, "Rate limit alert"),
            Severity::Error | Severity::Critical => {
                error!(alert_type = %alert.alert_type, alert = %payload, "Rate limit alert")
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// POSTs each alert as JSON to a webhook.
#[derive(Debug)]
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
    min_severity: Severity,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LimiterError::Config(format!("failed to build webhook client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
            min_severity: Severity::Info,
        })
    }

    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        if alert.severity < self.min_severity {
            return Ok(());
        }

        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| LimiterError::Delivery(format!("webhook {}: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(LimiterError::Delivery(format!(
                "webhook {} returned status {}",
                self.url,
                response.status()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}
