//! Circuit breaker guarding calls to the coordinator.

use std::fmt;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::{LimiterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub half_open_in_flight: usize,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_open: u64,
    pub rejected_concurrency: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: usize,
    /// Bumped on every transition so permits from an older half-open phase
    /// do not release slots of the current one
    generation: u64,
    opened_at: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    rejected_open: u64,
    rejected_concurrency: u64,
}

impl Inner {
    fn transition(&mut self, to: BreakerState) {
        if self.state == to {
            return;
        }
        match to {
            BreakerState::Open => {
                warn!(from = %self.state, "Coordinator circuit opened");
                self.opened_at = Some(Instant::now());
            }
            BreakerState::HalfOpen => info!("Coordinator circuit half-open, probing"),
            BreakerState::Closed => info!("Coordinator circuit closed"),
        }
        self.state = to;
        self.generation += 1;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.half_open_in_flight = 0;
    }
}

/// Closed / open / half-open breaker with a cap on half-open probes.
#[derive(Debug)]
pub struct CoordinatorBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CoordinatorBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                generation: 0,
                opened_at: None,
                total_successes: 0,
                total_failures: 0,
                rejected_open: 0,
                rejected_concurrency: 0,
            }),
        }
    }

    /// Ask permission to call the coordinator.
    ///
    /// Fails with `CircuitOpen` while open, and with `ConcurrencyLimit` when
    /// the half-open probe slots are taken.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut inner = self.inner.lock();

        if inner.state == BreakerState::Open {
            let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
            if elapsed < self.config.open_timeout {
                inner.rejected_open += 1;
                return Err(LimiterError::CircuitOpen);
            }
            inner.transition(BreakerState::HalfOpen);
        }

        let probe = inner.state == BreakerState::HalfOpen;
        if probe {
            let max = self.config.max_concurrent_requests;
            if inner.half_open_in_flight >= max {
                inner.rejected_concurrency += 1;
                return Err(LimiterError::ConcurrencyLimit {
                    in_flight: inner.half_open_in_flight,
                    max,
                });
            }
            inner.half_open_in_flight += 1;
        }

        Ok(BreakerPermit {
            breaker: self,
            probe,
            generation: inner.generation,
        })
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_in_flight: inner.half_open_in_flight,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_open: inner.rejected_open,
            rejected_concurrency: inner.rejected_concurrency,
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        self.inner.lock().transition(BreakerState::Closed);
    }

    fn on_success(&self, generation: u64) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen if inner.generation == generation => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.transition(BreakerState::Closed);
                }
            }
            _ => {}
        }
    }

    fn on_failure(&self, generation: u64) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.transition(BreakerState::Open);
                }
            }
            BreakerState::HalfOpen if inner.generation == generation => {
                inner.transition(BreakerState::Open);
            }
            _ => {}
        }
    }

    fn release(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen && inner.generation == generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// Permission to make one coordinator call. Dropping it without recording
/// an outcome releases its half-open slot without counting anything.
#[must_use]
pub struct BreakerPermit<'a> {
    breaker: &'a CoordinatorBreaker,
    probe: bool,
    generation: u64,
}

impl BreakerPermit<'_> {
    pub fn record_success(self) {
        self.breaker.on_success(self.generation);
    }

    pub fn record_failure(self) {
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.probe {
            self.breaker.release(self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(open_timeout: Duration) -> CoordinatorBreaker {
        CoordinatorBreaker::new(BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout,
            max_concurrent_requests: 1,
        })
    }

    fn trip(breaker: &CoordinatorBreaker) {
        for _ in 0..3 {
            breaker.acquire().unwrap().record_failure();
        }
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = breaker(Duration::from_secs(60));
        breaker.acquire().unwrap().record_failure();
        breaker.acquire().unwrap().record_failure();
        breaker.acquire().unwrap().record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);

        trip(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(breaker.acquire(), Err(LimiterError::CircuitOpen)));
        assert_eq!(breaker.stats().rejected_open, 1);
    }

    #[test]
    fn test_half_open_caps_concurrent_probes() {
        let breaker = breaker(Duration::ZERO);
        trip(&breaker);

        let probe = breaker.acquire().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        match breaker.acquire() {
            Err(LimiterError::ConcurrencyLimit { in_flight, max }) => {
                assert_eq!(in_flight, 1);
                assert_eq!(max, 1);
            }
            other => panic!("expected concurrency limit, got {:?}", other.map(|_| ())),
        }

        // releasing the slot lets the next probe through
        drop(probe);
        assert!(breaker.acquire().is_ok());
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let breaker = breaker(Duration::ZERO);
        trip(&breaker);

        breaker.acquire().unwrap().record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.acquire().unwrap().record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker(Duration::from_millis(0));
        trip(&breaker);

        breaker.acquire().unwrap().record_failure();
        let stats = breaker.stats();
        assert_eq!(stats.state, BreakerState::Open);
        assert_eq!(stats.half_open_in_flight, 0);
    }

    #[test]
    fn test_reset_closes() {
        let breaker = breaker(Duration::from_secs(60));
        trip(&breaker);
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.acquire().is_ok());
    }
}
