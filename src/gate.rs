//! Request admission: the composition the request middleware calls.
//!
//! A request is checked against bypass rules, its endpoint policy and skip
//! rules, then counted by the coordinator under a deadline. When the
//! coordinator cannot answer, the configured `FailurePolicy` decides.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::{BreakerConfig, FailurePolicy, FloodgateConfig, GateConfig};
use crate::error::{LimiterError, Result};
use crate::monitor::{ErrorKind, Monitor};
use crate::ratelimit::decision::rate_limit_headers;
use crate::ratelimit::{
    CoordinatorBreaker, DenyResponse, DistributedLimiter, Identity, KeyKind, LimitDecision,
    Limiter, LocalFallbackLimiter, PolicyHandle, RateLimitKey, RateLimitPolicy,
};

/// What the middleware knows about a request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub endpoint: String,
    pub method: String,
    pub identity: Identity,
    pub user_agent: String,
    pub is_internal: bool,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, endpoint: impl Into<String>, identity: Identity) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            identity,
            ..Self::default()
        }
    }
}

/// Which limiter produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Coordinator,
    /// The local limiter, used as the primary because no coordinator is configured
    Local,
    /// The local limiter, standing in for a failed coordinator
    Fallback,
    /// Admitted without counting because the coordinator failed
    FailOpen,
}

#[derive(Debug, Clone)]
pub enum Admission {
    /// Exempt by bypass rules
    Bypassed,
    /// Exempt by the policy's skip paths or methods
    Skipped,
    Decided {
        decision: LimitDecision,
        policy: RateLimitPolicy,
        source: DecisionSource,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        match self {
            Admission::Bypassed | Admission::Skipped => true,
            Admission::Decided { decision, .. } => decision.allowed,
        }
    }

    /// The response to send instead of serving the request, if denied.
    pub fn deny_response(&self) -> Option<DenyResponse> {
        match self {
            Admission::Decided {
                decision, policy, ..
            } if !decision.allowed => Some(DenyResponse::from_decision(decision, policy)),
            _ => None,
        }
    }

    /// `X-RateLimit-*` headers to attach to an admitted response.
    pub fn headers(&self) -> Vec<(String, String)> {
        match self {
            Admission::Decided {
                decision, policy, ..
            } => rate_limit_headers(decision, policy),
            _ => Vec::new(),
        }
    }
}

/// Tighten the policy limit with the per-IP or per-user cap for this key.
fn effective_policy(mut policy: RateLimitPolicy, key: &RateLimitKey) -> RateLimitPolicy {
    let cap = match key.kind {
        KeyKind::Ip => policy.per_ip_limit,
        KeyKind::User => policy.per_user_limit,
        _ => 0,
    };
    if cap > 0 && cap < policy.limit {
        policy.limit = cap;
    }
    policy
}

pub struct AdmissionGate {
    config: GateConfig,
    policies: Arc<PolicyHandle>,
    distributed: Option<Arc<dyn Limiter>>,
    fallback: Arc<LocalFallbackLimiter>,
    breaker: CoordinatorBreaker,
    monitor: Option<Arc<Monitor>>,
}

impl AdmissionGate {
    pub fn new(
        config: GateConfig,
        breaker: BreakerConfig,
        policies: Arc<PolicyHandle>,
        fallback: Arc<LocalFallbackLimiter>,
    ) -> Self {
        Self {
            config,
            policies,
            distributed: None,
            fallback,
            breaker: CoordinatorBreaker::new(breaker),
            monitor: None,
        }
    }

    /// Build a gate, and its limiters, from service configuration.
    ///
    /// Starts the fallback limiter's sweeper, so it must be called inside a
    /// tokio runtime. `shutdown` stops it.
    pub fn from_config(config: &FloodgateConfig, monitor: Option<Arc<Monitor>>) -> Result<Self> {
        let policies = Arc::new(PolicyHandle::new(config.policies.clone())?);
        let fallback = Arc::new(LocalFallbackLimiter::new(&config.fallback));
        fallback.start_sweeper();
        let mut gate = Self::new(
            config.gate.clone(),
            config.breaker.clone(),
            policies,
            fallback,
        );

        if config.coordinator.enabled {
            let limiter = DistributedLimiter::new(&config.coordinator, &config.policies.key_prefix)?;
            gate = gate.with_distributed(Arc::new(limiter));
        }
        if let Some(monitor) = monitor {
            gate = gate.with_monitor(monitor);
        }
        Ok(gate)
    }

    pub fn with_distributed(mut self, limiter: Arc<dyn Limiter>) -> Self {
        self.distributed = Some(limiter);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn policies(&self) -> &Arc<PolicyHandle> {
        &self.policies
    }

    pub fn breaker(&self) -> &CoordinatorBreaker {
        &self.breaker
    }

    pub fn fallback(&self) -> &Arc<LocalFallbackLimiter> {
        &self.fallback
    }

    /// Decide whether a request is admitted.
    pub async fn admit(&self, request: &RequestContext) -> Result<Admission> {
        let store = self.policies.load();
        if store.should_bypass(&request.identity.ip, &request.user_agent, request.is_internal) {
            trace!(endpoint = %request.endpoint, ip = %request.identity.ip, "Bypassing rate limit");
            return Ok(Admission::Bypassed);
        }

        let policy = store.get_endpoint_limit(&request.endpoint).into_owned();
        if policy.should_skip(&request.endpoint, &request.method) {
            return Ok(Admission::Skipped);
        }

        let key = RateLimitKey::for_request(&request.endpoint, &request.identity, &policy);
        let policy = effective_policy(policy, &key);
        let key = key.to_string_key();

        let started = Instant::now();
        let (decision, source) = match &self.distributed {
            None => (self.fallback.check(&key, &policy).await?, DecisionSource::Local),
            Some(limiter) => match self.check_coordinator(limiter.as_ref(), &key, &policy).await {
                Ok(decision) => (decision, DecisionSource::Coordinator),
                Err(e) if e.is_coordinator_failure() => {
                    self.on_coordinator_failure(&request.endpoint, &key, &policy, e)
                        .await?
                }
                Err(e) => return Err(e),
            },
        };

        if let Some(monitor) = &self.monitor {
            monitor.record_request(&request.endpoint, &key, &decision, started.elapsed());
        }

        Ok(Admission::Decided {
            decision,
            policy,
            source,
        })
    }

    async fn check_coordinator(
        &self,
        limiter: &dyn Limiter,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<LimitDecision> {
        let permit = self.breaker.acquire()?;
        let deadline = self.config.check_deadline;

        match tokio::time::timeout(deadline, limiter.check(key, policy)).await {
            Ok(Ok(decision)) => {
                permit.record_success();
                Ok(decision)
            }
            Ok(Err(e)) => {
                if e.is_coordinator_failure() {
                    permit.record_failure();
                }
                Err(e)
            }
            Err(_) => {
                permit.record_failure();
                Err(LimiterError::Timeout(deadline))
            }
        }
    }

    async fn on_coordinator_failure(
        &self,
        endpoint: &str,
        key: &str,
        policy: &RateLimitPolicy,
        error: LimiterError,
    ) -> Result<(LimitDecision, DecisionSource)> {
        let kind = match &error {
            LimiterError::Script(_) => ErrorKind::Script,
            _ => ErrorKind::Coordinator,
        };
        debug!(key = %key, error = %error, policy = ?self.config.failure_policy, "Coordinator check failed");
        if let Some(monitor) = &self.monitor {
            monitor.record_error(kind, &error);
        }

        match self.config.failure_policy {
            FailurePolicy::Fallback => match self.fallback.check(key, policy).await {
                Ok(decision) => {
                    if let Some(monitor) = &self.monitor {
                        monitor.record_fallback_used(endpoint);
                    }
                    Ok((decision, DecisionSource::Fallback))
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Fallback limiter failed");
                    if let Some(monitor) = &self.monitor {
                        monitor.record_error(ErrorKind::Fallback, &e);
                    }
                    Err(e)
                }
            },
            FailurePolicy::FailOpen => {
                let now = Utc::now();
                let reset = now
                    + chrono::Duration::from_std(policy.window)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                let mut decision = LimitDecision::new(true, 0, policy, key, now, reset);
                decision
                    .metadata
                    .insert("fail_open".to_string(), serde_json::Value::Bool(true));
                Ok((decision, DecisionSource::FailOpen))
            }
            FailurePolicy::FailClosed => Err(error),
        }
    }

    /// Forget the state for `key` in every limiter.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.fallback.reset(key).await?;
        if let Some(limiter) = &self.distributed {
            limiter.reset(key).await?;
        }
        Ok(())
    }

    /// Stop background work owned by the gate.
    pub async fn shutdown(&self) {
        self.fallback.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FallbackConfig, MonitorConfig};
    use crate::ratelimit::PolicyStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// A coordinator that is always down.
    #[derive(Default)]
    struct DownLimiter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Limiter for DownLimiter {
        fn name(&self) -> &'static str {
            "down"
        }

        async fn check(&self, _key: &str, _policy: &RateLimitPolicy) -> Result<LimitDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LimiterError::coordinator(
                "check",
                redis::RedisError::from(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )),
            ))
        }

        async fn check_multiple(
            &self,
            _checks: &[(String, RateLimitPolicy)],
        ) -> Result<Vec<LimitDecision>> {
            Ok(Vec::new())
        }

        async fn reset(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn reset_multiple(&self, _keys: &[String]) -> Result<()> {
            Ok(())
        }

        async fn is_healthy(&self) -> Result<()> {
            Err(LimiterError::CircuitOpen)
        }
    }

    /// A coordinator that never answers in time.
    struct SlowLimiter;

    #[async_trait]
    impl Limiter for SlowLimiter {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn check(&self, _key: &str, _policy: &RateLimitPolicy) -> Result<LimitDecision> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Err(LimiterError::CircuitOpen)
        }

        async fn check_multiple(
            &self,
            _checks: &[(String, RateLimitPolicy)],
        ) -> Result<Vec<LimitDecision>> {
            Ok(Vec::new())
        }

        async fn reset(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn reset_multiple(&self, _keys: &[String]) -> Result<()> {
            Ok(())
        }

        async fn is_healthy(&self) -> Result<()> {
            Ok(())
        }
    }

    fn store() -> PolicyStore {
        let mut store = PolicyStore::default();
        store.bypass_ips = vec!["10.0.0.99".to_string()];
        store.insert(
            "/api/login",
            RateLimitPolicy::new(3, Duration::from_secs(60)).with_headers(),
        );

        let mut capped = RateLimitPolicy::new(10, Duration::from_secs(60));
        capped.per_ip_limit = 2;
        store.insert("/api/capped", capped);

        let mut health = RateLimitPolicy::new(1, Duration::from_secs(60));
        health.skip_paths = vec!["/health".to_string()];
        store.insert("/health", health);
        store
    }

    fn gate(failure_policy: FailurePolicy) -> AdmissionGate {
        let config = GateConfig {
            failure_policy,
            check_deadline: Duration::from_millis(50),
        };
        AdmissionGate::new(
            config,
            BreakerConfig::default(),
            Arc::new(PolicyHandle::new(store()).unwrap()),
            Arc::new(LocalFallbackLimiter::new(&FallbackConfig::default())),
        )
    }

    fn login(ip: &str) -> RequestContext {
        RequestContext::new("POST", "/api/login", Identity::from_ip(ip))
    }

    #[tokio::test]
    async fn test_from_config_sweeps_idle_windows() {
        let mut config = FloodgateConfig::default();
        config.coordinator.enabled = false;
        config.fallback.sweep_interval = Duration::from_millis(20);
        config
            .policies
            .insert("/p", RateLimitPolicy::new(100, Duration::from_millis(5)));
        let gate = AdmissionGate::from_config(&config, None).unwrap();

        for i in 0..50 {
            let request = RequestContext::new("GET", "/p", Identity::from_ip(format!("10.1.0.{}", i)));
            assert!(gate.admit(&request).await.unwrap().is_allowed());
        }
        assert_eq!(gate.fallback().window_count(), 50);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(gate.fallback().window_count(), 0);

        gate.shutdown().await;
    }

    #[tokio::test]
    async fn test_bypass_and_skip() {
        let gate = gate(FailurePolicy::Fallback);

        let admission = gate.admit(&login("10.0.0.99")).await.unwrap();
        assert!(matches!(admission, Admission::Bypassed));

        let mut internal = login("1.2.3.4");
        internal.is_internal = true;
        assert!(matches!(gate.admit(&internal).await.unwrap(), Admission::Bypassed));

        let health = RequestContext::new("GET", "/health", Identity::from_ip("1.2.3.4"));
        assert!(matches!(gate.admit(&health).await.unwrap(), Admission::Skipped));
    }

    #[tokio::test]
    async fn test_local_limiter_without_coordinator() {
        let gate = gate(FailurePolicy::Fallback);

        for _ in 0..3 {
            let admission = gate.admit(&login("1.2.3.4")).await.unwrap();
            assert!(admission.is_allowed());
            assert!(matches!(
                admission,
                Admission::Decided {
                    source: DecisionSource::Local,
                    ..
                }
            ));
        }

        let denied = gate.admit(&login("1.2.3.4")).await.unwrap();
        assert!(!denied.is_allowed());
        let response = denied.deny_response().unwrap();
        assert_eq!(response.status, 429);
        assert!(response
            .headers
            .iter()
            .any(|(name, value)| name == "X-RateLimit-Limit" && value == "3"));

        // another caller has its own counter
        assert!(gate.admit(&login("5.6.7.8")).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_per_ip_cap_tightens_limit() {
        let gate = gate(FailurePolicy::Fallback);
        let request = RequestContext::new("GET", "/api/capped", Identity::from_ip("1.2.3.4"));

        assert!(gate.admit(&request).await.unwrap().is_allowed());
        assert!(gate.admit(&request).await.unwrap().is_allowed());
        let denied = gate.admit(&request).await.unwrap();
        assert!(!denied.is_allowed());
        match denied {
            Admission::Decided { decision, .. } => assert_eq!(decision.limit, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_coordinator_failure_uses_fallback() {
        let monitor = Arc::new(Monitor::start(MonitorConfig::default(), Vec::new(), None));
        let gate = gate(FailurePolicy::Fallback)
            .with_distributed(Arc::new(DownLimiter::default()))
            .with_monitor(monitor.clone());

        let admission = gate.admit(&login("1.2.3.4")).await.unwrap();
        assert!(matches!(
            admission,
            Admission::Decided {
                source: DecisionSource::Fallback,
                ..
            }
        ));

        let metrics = monitor.metrics();
        assert_eq!(metrics.fallback_usage, 1);
        assert_eq!(metrics.errors_of(ErrorKind::Coordinator), 1);
        assert_eq!(metrics.total_requests, 1);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_fail_open_and_fail_closed() {
        let open = gate(FailurePolicy::FailOpen).with_distributed(Arc::new(DownLimiter::default()));
        let admission = open.admit(&login("1.2.3.4")).await.unwrap();
        assert!(admission.is_allowed());
        assert!(matches!(
            admission,
            Admission::Decided {
                source: DecisionSource::FailOpen,
                ..
            }
        ));

        let closed =
            gate(FailurePolicy::FailClosed).with_distributed(Arc::new(DownLimiter::default()));
        let err = closed.admit(&login("1.2.3.4")).await.unwrap_err();
        assert!(matches!(err, LimiterError::Coordinator { .. }));
    }

    #[tokio::test]
    async fn test_breaker_opens_and_stops_calling_coordinator() {
        let down = Arc::new(DownLimiter::default());
        let gate = gate(FailurePolicy::FailClosed).with_distributed(down.clone());

        for _ in 0..5 {
            assert!(gate.admit(&login("1.2.3.4")).await.is_err());
        }
        let err = gate.admit(&login("1.2.3.4")).await.unwrap_err();
        assert!(matches!(err, LimiterError::CircuitOpen));
        assert_eq!(down.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_deadline_exceeded_is_a_coordinator_failure() {
        let gate = gate(FailurePolicy::FailClosed).with_distributed(Arc::new(SlowLimiter));
        let err = gate.admit(&login("1.2.3.4")).await.unwrap_err();
        assert!(matches!(err, LimiterError::Timeout(_)));

        let gate = self::gate(FailurePolicy::Fallback).with_distributed(Arc::new(SlowLimiter));
        let admission = gate.admit(&login("1.2.3.4")).await.unwrap();
        assert!(admission.is_allowed());
    }

    #[tokio::test]
    async fn test_swapped_policies_apply_to_next_request() {
        let gate = gate(FailurePolicy::Fallback);
        gate.policies()
            .update(|store| {
                store.insert("/api/login", RateLimitPolicy::new(1, Duration::from_secs(60)));
            })
            .unwrap();

        assert!(gate.admit(&login("1.2.3.4")).await.unwrap().is_allowed());
        assert!(!gate.admit(&login("1.2.3.4")).await.unwrap().is_allowed());

        gate.reset(&RateLimitKey::for_request(
            "/api/login",
            &Identity::from_ip("1.2.3.4"),
            &RateLimitPolicy::new(1, Duration::from_secs(60)),
        )
        .to_string_key())
        .await
        .unwrap();
        assert!(gate.admit(&login("1.2.3.4")).await.unwrap().is_allowed());
    }
}
