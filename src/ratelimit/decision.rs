//! Rate limit decisions and the deny response contract.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::policy::{Algorithm, RateLimitPolicy};

/// The outcome of one rate limit check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitDecision {
    pub allowed: bool,
    /// Requests counted against the key, including this one when allowed
    pub count: u64,
    pub limit: u64,
    /// `max(0, limit - count)`
    pub remaining: u64,
    /// Zero when allowed
    #[serde(with = "crate::duration")]
    pub retry_after: Duration,
    pub reset_time: DateTime<Utc>,
    pub algorithm: Algorithm,
    pub key: String,
    #[serde(with = "crate::duration")]
    pub window: Duration,
    pub burst: u64,
    pub is_first_request: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl LimitDecision {
    /// Build a decision, deriving `remaining`, `retry_after` and `is_first_request`.
    pub fn new(
        allowed: bool,
        count: u64,
        policy: &RateLimitPolicy,
        key: &str,
        now: DateTime<Utc>,
        reset_time: DateTime<Utc>,
    ) -> Self {
        let retry_after = if allowed {
            Duration::ZERO
        } else {
            (reset_time - now).to_std().unwrap_or(Duration::ZERO)
        };

        Self {
            allowed,
            count,
            limit: policy.limit,
            remaining: policy.limit.saturating_sub(count),
            retry_after,
            reset_time,
            algorithm: policy.algorithm,
            key: key.to_string(),
            window: policy.window,
            burst: policy.burst,
            is_first_request: count == 1,
            metadata: HashMap::new(),
        }
    }

    /// A denial that carries an error description rather than a counter value.
    pub fn failed(policy: &RateLimitPolicy, key: &str, now: DateTime<Utc>, error: String) -> Self {
        let mut decision = Self::new(false, 0, policy, key, now, now);
        decision.remaining = 0;
        decision
            .metadata
            .insert("error".to_string(), serde_json::Value::String(error));
        decision
    }

    /// Utilization of the limit, `count / limit`.
    pub fn utilization(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.count as f64 / self.limit as f64
        }
    }

    /// Machine-readable reason attached to a denial.
    pub fn denial_reason(&self) -> Option<DenialReason> {
        (!self.allowed).then(|| DenialReason {
            algorithm: self.algorithm,
            limit: self.limit,
            retry_after_secs: retry_after_secs(self.retry_after),
        })
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialReason {
    pub algorithm: Algorithm,
    pub limit: u64,
    pub retry_after_secs: u64,
}

fn retry_after_secs(retry_after: Duration) -> u64 {
    // round up so a client never retries before the window frees a slot
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// The HTTP-style response for a denied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DenyResponse {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl DenyResponse {
    pub fn from_decision(decision: &LimitDecision, policy: &RateLimitPolicy) -> Self {
        let mut headers = vec![(
            "Retry-After".to_string(),
            retry_after_secs(decision.retry_after).to_string(),
        )];
        headers.extend(rate_limit_headers(decision, policy));
        headers.push(("Content-Type".to_string(), "application/json".to_string()));

        let body = if policy.response_body.is_empty() {
            super::policy::DEFAULT_RESPONSE_BODY.to_string()
        } else {
            policy.response_body.clone()
        };

        Self {
            status: policy.effective_response_code(),
            body,
            headers,
        }
    }
}

/// The `X-RateLimit-*` headers for a decision, empty when the policy disables them.
pub fn rate_limit_headers(decision: &LimitDecision, policy: &RateLimitPolicy) -> Vec<(String, String)> {
    if !policy.include_headers {
        return Vec::new();
    }
    vec![
        ("X-RateLimit-Limit".to_string(), decision.limit.to_string()),
        ("X-RateLimit-Remaining".to_string(), decision.remaining.to_string()),
        (
            "X-RateLimit-Reset".to_string(),
            decision.reset_time.timestamp().to_string(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_allowed_decision() {
        let policy = RateLimitPolicy::new(5, Duration::from_secs(60));
        let reset = now() + chrono::Duration::seconds(60);
        let decision = LimitDecision::new(true, 1, &policy, "k", now(), reset);

        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.retry_after, Duration::ZERO);
        assert!(decision.is_first_request);
        assert!(decision.denial_reason().is_none());
    }

    #[test]
    fn test_denied_decision_has_retry_after() {
        let policy = RateLimitPolicy::new(5, Duration::from_secs(60));
        let reset = now() + chrono::Duration::milliseconds(1500);
        let decision = LimitDecision::new(false, 7, &policy, "k", now(), reset);

        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after, Duration::from_millis(1500));

        let reason = decision.denial_reason().unwrap();
        assert_eq!(reason.retry_after_secs, 2);
        assert_eq!(reason.limit, 5);
    }

    #[test]
    fn test_deny_response_headers() {
        let mut policy = RateLimitPolicy::new(5, Duration::from_secs(60)).with_headers();
        policy.validate().unwrap();
        let reset = now() + chrono::Duration::seconds(30);
        let decision = LimitDecision::new(false, 5, &policy, "k", now(), reset);

        let response = DenyResponse::from_decision(&decision, &policy);
        assert_eq!(response.status, 429);
        assert!(response.headers.contains(&("Retry-After".to_string(), "30".to_string())));
        assert!(response.headers.contains(&("X-RateLimit-Limit".to_string(), "5".to_string())));
        assert!(response
            .headers
            .contains(&("X-RateLimit-Remaining".to_string(), "0".to_string())));
    }

    #[test]
    fn test_deny_response_without_headers() {
        let mut policy = RateLimitPolicy::new(5, Duration::from_secs(60));
        policy.response_code = 503;
        policy.response_body = "slow down".to_string();
        let decision = LimitDecision::new(false, 5, &policy, "k", now(), now());

        let response = DenyResponse::from_decision(&decision, &policy);
        assert_eq!(response.status, 503);
        assert_eq!(response.body, "slow down");
        assert!(!response.headers.iter().any(|(name, _)| name.starts_with("X-RateLimit")));
    }
}
