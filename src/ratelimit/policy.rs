//! Rate limit policies.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

/// Status code used when a policy does not set one.
pub const DEFAULT_RESPONSE_CODE: u16 = 429;
/// Body used when a policy does not set one.
pub const DEFAULT_RESPONSE_BODY: &str = r#"{"error":"Rate limit exceeded","retry_after":60}"#;

/// Rate limiting algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    SlidingWindow,
    TokenBucket,
    FixedWindow,
    LeakyBucket,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which identity a policy counts requests against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    #[default]
    PerIp,
    PerUser,
    PerSession,
    PerClient,
    Custom,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::PerIp => "per_ip",
            Scope::PerUser => "per_user",
            Scope::PerSession => "per_session",
            Scope::PerClient => "per_client",
            Scope::Custom => "custom",
        }
    }
}

/// A rate limit policy for one endpoint (or endpoint pattern).
///
/// Policies are validated once when loaded and treated as immutable
/// afterwards; derive a modified copy with `Clone` instead of editing a
/// shared one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length
    #[serde(with = "crate::duration")]
    pub window: Duration,
    /// Extra acceptances permitted above `limit`
    #[serde(default)]
    pub burst: u64,

    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub scope: Scope,

    /// Tighter limit applied when the key is IP-scoped (0 = unset)
    #[serde(default)]
    pub per_ip_limit: u64,
    /// Tighter limit applied when the key is user-scoped (0 = unset)
    #[serde(default)]
    pub per_user_limit: u64,

    #[serde(default)]
    pub include_headers: bool,
    /// HTTP status for denials; 0 means the default (429)
    #[serde(default)]
    pub response_code: u16,
    #[serde(default)]
    pub response_body: String,

    #[serde(default)]
    pub skip_successful_requests: bool,
    #[serde(default)]
    pub skip_failed_requests: bool,
    #[serde(default)]
    pub skip_paths: Vec<String>,
    #[serde(default)]
    pub skip_methods: Vec<String>,

    /// Identity used by the `custom` scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_key: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RateLimitPolicy {
    /// Create a policy with the given limit and window and defaults elsewhere.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            burst: 0,
            algorithm: Algorithm::default(),
            scope: Scope::default(),
            per_ip_limit: 0,
            per_user_limit: 0,
            include_headers: false,
            response_code: 0,
            response_body: String::new(),
            skip_successful_requests: false,
            skip_failed_requests: false,
            skip_paths: Vec::new(),
            skip_methods: Vec::new(),
            custom_key: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_headers(mut self) -> Self {
        self.include_headers = true;
        self
    }

    /// Check ranges and fill in defaults for the response fields.
    pub fn validate(&mut self) -> Result<()> {
        self.check()?;
        if self.response_code == 0 {
            self.response_code = DEFAULT_RESPONSE_CODE;
        }
        if self.response_body.is_empty() {
            self.response_body = DEFAULT_RESPONSE_BODY.to_string();
        }
        Ok(())
    }

    /// Range checks that do not modify the policy, used on the request path.
    pub fn check(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(LimiterError::Config("limit must be positive".to_string()));
        }
        if self.window.is_zero() {
            return Err(LimiterError::Config("window must be positive".to_string()));
        }
        if self.response_code != 0 && !(400..=599).contains(&self.response_code) {
            return Err(LimiterError::Config(format!(
                "response code must be a valid HTTP error code (400-599), got {}",
                self.response_code
            )));
        }
        Ok(())
    }

    /// Window length in whole milliseconds (at least 1).
    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis())
            .unwrap_or(i64::MAX)
            .max(1)
    }

    /// The status code to answer a denial with.
    pub fn effective_response_code(&self) -> u16 {
        if self.response_code == 0 {
            DEFAULT_RESPONSE_CODE
        } else {
            self.response_code
        }
    }

    /// True when the request path or method is listed as exempt.
    pub fn should_skip(&self, path: &str, method: &str) -> bool {
        self.skip_paths.iter().any(|p| p == path)
            || self.skip_methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}
