//! Limiter trait for abstracting the coordinator-backed and local implementations.

use async_trait::async_trait;

use super::decision::LimitDecision;
use super::policy::RateLimitPolicy;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// Implemented by both `DistributedLimiter` and `LocalFallbackLimiter` so
/// callers and the monitor can work with either. Dropping a returned future
/// cancels the operation; deadlines are applied by the caller.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Short name used in logs and health output.
    fn name(&self) -> &'static str;

    /// Count one request against `key` and decide whether it is admitted.
    async fn check(&self, key: &str, policy: &RateLimitPolicy) -> Result<LimitDecision>;

    /// Check several independent keys, returning decisions in input order.
    async fn check_multiple(
        &self,
        checks: &[(String, RateLimitPolicy)],
    ) -> Result<Vec<LimitDecision>>;

    /// Forget all state for `key`.
    async fn reset(&self, key: &str) -> Result<()>;

    async fn reset_multiple(&self, keys: &[String]) -> Result<()>;

    /// Liveness probe.
    async fn is_healthy(&self) -> Result<()>;
}
