//! In-process sliding window limiter used when the coordinator is unavailable.
//!
//! Each key owns a `Window` of admitted-request timestamps behind its own
//! mutex; the map of windows sits behind a coarse read-write lock that is
//! only taken for writing when a window is created or evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::backend::Limiter;
use super::decision::LimitDecision;
use super::policy::RateLimitPolicy;
use crate::clock::{datetime_from_ms, Clock, SystemClock};
use crate::config::FallbackConfig;
use crate::error::{LimiterError, Result};

/// Admitted timestamps for one key, oldest first.
#[derive(Debug)]
struct Window {
    timestamps: VecDeque<i64>,
    limit: u64,
    window_ms: i64,
    burst: u64,
    last_cleanup_ms: i64,
    last_access_ms: i64,
}

impl Window {
    fn new(policy: &RateLimitPolicy, now_ms: i64) -> Self {
        Self {
            timestamps: VecDeque::new(),
            limit: policy.limit,
            window_ms: policy.window_ms(),
            burst: policy.burst,
            last_cleanup_ms: now_ms,
            last_access_ms: now_ms,
        }
    }

    /// Drop timestamps that fell out of the window.
    fn compact(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        while matches!(self.timestamps.front(), Some(ts) if *ts <= cutoff) {
            self.timestamps.pop_front();
        }
        self.last_cleanup_ms = now_ms;
    }

    fn in_window(&self, now_ms: i64) -> impl Iterator<Item = &i64> {
        let cutoff = now_ms - self.window_ms;
        self.timestamps.iter().filter(move |ts| **ts > cutoff)
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.timestamps.capacity() * std::mem::size_of::<i64>()
    }
}

/// Point-in-time view of one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub key: String,
    pub count: u64,
    pub limit: u64,
    pub burst: u64,
    #[serde(with = "crate::duration")]
    pub window: Duration,
    pub utilization: f64,
    /// Admitted requests per second over the window
    pub request_rate: f64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub last_cleanup: DateTime<Utc>,
}

/// Aggregate view of the limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackInfo {
    pub windows: usize,
    pub tracked_requests: usize,
    pub memory_bytes: usize,
}

struct Sweeper {
    shutdown: watch::Sender<bool>,
    trigger: Arc<Notify>,
    handle: JoinHandle<()>,
}

type WindowMap = Arc<RwLock<HashMap<String, Arc<Mutex<Window>>>>>;

/// Local sliding-window rate limiter.
pub struct LocalFallbackLimiter {
    windows: WindowMap,
    compaction_interval_ms: i64,
    sweep_interval: Duration,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl LocalFallbackLimiter {
    pub fn new(config: &FallbackConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &FallbackConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            compaction_interval_ms: i64::try_from(config.compaction_interval.as_millis())
                .unwrap_or(i64::MAX),
            sweep_interval: config.sweep_interval,
            clock,
            sweeper: Mutex::new(None),
        }
    }

    fn window_for(&self, key: &str, policy: &RateLimitPolicy, now_ms: i64) -> Arc<Mutex<Window>> {
        if let Some(window) = self.windows.read().get(key) {
            return window.clone();
        }

        let mut windows = self.windows.write();
        windows
            .entry(key.to_string())
            .or_insert_with(|| {
                trace!(key = %key, limit = policy.limit, "Creating fallback window");
                Arc::new(Mutex::new(Window::new(policy, now_ms)))
            })
            .clone()
    }

    fn decide(&self, key: &str, policy: &RateLimitPolicy) -> LimitDecision {
        let now_ms = self.clock.now_ms();
        let window = self.window_for(key, policy, now_ms);
        let mut window = window.lock();

        // the policy may have been swapped since the window was created
        window.limit = policy.limit;
        window.window_ms = policy.window_ms();
        window.burst = policy.burst;
        window.last_access_ms = now_ms;

        if now_ms - window.last_cleanup_ms > self.compaction_interval_ms {
            window.compact(now_ms);
        }

        let mut count = window.in_window(now_ms).count() as u64;
        let allowed = count < policy.limit.saturating_add(policy.burst);
        if allowed {
            window.timestamps.push_back(now_ms);
            count += 1;
        }

        let oldest = window.in_window(now_ms).next().copied().unwrap_or(now_ms);
        let reset = oldest + window.window_ms;
        drop(window);

        if !allowed {
            debug!(key = %key, count, limit = policy.limit, "Fallback rate limit exceeded");
        }

        LimitDecision::new(
            allowed,
            count,
            policy,
            key,
            datetime_from_ms(now_ms),
            datetime_from_ms(reset),
        )
    }

    /// Stats for one key, `None` if it has no window.
    pub fn stats(&self, key: &str) -> Option<WindowStats> {
        let window = self.windows.read().get(key).cloned()?;
        let now_ms = self.clock.now_ms();
        let window = window.lock();
        Some(window_stats(key, &window, now_ms))
    }

    pub fn all_stats(&self) -> Vec<WindowStats> {
        let now_ms = self.clock.now_ms();
        let windows = self.windows.read();
        let mut stats: Vec<WindowStats> = windows
            .iter()
            .map(|(key, window)| window_stats(key, &window.lock(), now_ms))
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    pub fn info(&self) -> FallbackInfo {
        let windows = self.windows.read();
        let mut tracked_requests = 0;
        let mut memory_bytes = 0;
        for (key, window) in windows.iter() {
            let window = window.lock();
            tracked_requests += window.timestamps.len();
            memory_bytes += key.capacity() + window.memory_usage();
        }
        FallbackInfo {
            windows: windows.len(),
            tracked_requests,
            memory_bytes,
        }
    }

    pub fn window_count(&self) -> usize {
        self.windows.read().len()
    }

    /// Timestamps currently held across all windows.
    pub fn total_requests(&self) -> usize {
        self.windows
            .read()
            .values()
            .map(|w| w.lock().timestamps.len())
            .sum()
    }

    /// Compact every window and evict those that are empty and idle for
    /// more than twice their window. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        sweep(&self.windows, self.clock.as_ref())
    }

    /// Start the periodic sweeper. Must be called inside a tokio runtime;
    /// calling it again while running does nothing.
    pub fn start_sweeper(&self) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let trigger = Arc::new(Notify::new());
        let windows = self.windows.clone();
        let clock = self.clock.clone();
        let notified = trigger.clone();
        let period = self.sweep_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notified.notified() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
                sweep(&windows, clock.as_ref());
            }
            debug!("Fallback sweeper stopped");
        });

        info!(interval = ?period, "Started fallback sweeper");
        *slot = Some(Sweeper {
            shutdown,
            trigger,
            handle,
        });
    }

    /// Ask for an immediate sweep; sweeps inline when no sweeper is running.
    pub fn trigger_cleanup(&self) {
        let trigger = self.sweeper.lock().as_ref().map(|s| s.trigger.clone());
        match trigger {
            Some(trigger) => trigger.notify_one(),
            None => {
                self.sweep();
            }
        }
    }

    /// Stop the sweeper and wait for it. Safe to call more than once.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown.send(true);
            let _ = sweeper.handle.await;
        }
    }
}

fn window_stats(key: &str, window: &Window, now_ms: i64) -> WindowStats {
    let live: Vec<i64> = window.in_window(now_ms).copied().collect();
    let count = live.len() as u64;
    let window_secs = window.window_ms as f64 / 1000.0;
    WindowStats {
        key: key.to_string(),
        count,
        limit: window.limit,
        burst: window.burst,
        window: Duration::from_millis(window.window_ms.max(0) as u64),
        utilization: if window.limit == 0 {
            0.0
        } else {
            count as f64 / window.limit as f64
        },
        request_rate: if window_secs > 0.0 {
            count as f64 / window_secs
        } else {
            0.0
        },
        oldest: live.first().map(|ts| datetime_from_ms(*ts)),
        newest: live.last().map(|ts| datetime_from_ms(*ts)),
        last_cleanup: datetime_from_ms(window.last_cleanup_ms),
    }
}

fn sweep(windows: &WindowMap, clock: &dyn Clock) -> usize {
    let now_ms = clock.now_ms();
    let mut windows = windows.write();
    let before = windows.len();

    windows.retain(|_, window| {
        let mut window = window.lock();
        window.compact(now_ms);
        let idle = now_ms - window.last_access_ms > window.window_ms.saturating_mul(2);
        !(window.timestamps.is_empty() && idle)
    });

    let evicted = before - windows.len();
    if evicted > 0 {
        debug!(evicted, remaining = windows.len(), "Evicted idle fallback windows");
    }
    evicted
}

#[async_trait]
impl Limiter for LocalFallbackLimiter {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn check(&self, key: &str, policy: &RateLimitPolicy) -> Result<LimitDecision> {
        policy.check().map_err(|e| LimiterError::Validation(e.to_string()))?;
        if key.is_empty() {
            return Err(LimiterError::Validation("rate limit key cannot be empty".to_string()));
        }
        Ok(self.decide(key, policy))
    }

    async fn check_multiple(
        &self,
        checks: &[(String, RateLimitPolicy)],
    ) -> Result<Vec<LimitDecision>> {
        let mut decisions = Vec::with_capacity(checks.len());
        for (key, policy) in checks {
            decisions.push(self.check(key, policy).await?);
        }
        Ok(decisions)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        if let Some(window) = self.windows.read().get(key) {
            window.lock().timestamps.clear();
        }
        Ok(())
    }

    async fn reset_multiple(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.reset(key).await?;
        }
        Ok(())
    }

    async fn is_healthy(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const START: i64 = 1_700_000_000_000;

    fn limiter() -> (LocalFallbackLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let limiter = LocalFallbackLimiter::with_clock(&FallbackConfig::default(), clock.clone());
        (limiter, clock)
    }

    fn policy(limit: u64, burst: u64) -> RateLimitPolicy {
        RateLimitPolicy::new(limit, Duration::from_secs(60)).with_burst(burst)
    }

    #[tokio::test]
    async fn test_allows_limit_plus_burst() {
        let (limiter, _) = limiter();
        let policy = policy(3, 2);

        for i in 1..=5 {
            let decision = limiter.check("k", &policy).await.unwrap();
            assert!(decision.allowed, "request {} should be allowed", i);
            assert_eq!(decision.count, i);
        }

        let denied = limiter.check("k", &policy).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 5);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (limiter, clock) = limiter();
        let policy = policy(2, 0);

        assert!(limiter.check("k", &policy).await.unwrap().allowed);
        clock.advance(Duration::from_secs(30));
        assert!(limiter.check("k", &policy).await.unwrap().allowed);

        let denied = limiter.check("k", &policy).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(30));

        clock.advance(Duration::from_secs(30));
        let decision = limiter.check("k", &policy).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.count, 2);
    }

    #[tokio::test]
    async fn test_compaction_bounds_memory() {
        let (limiter, clock) = limiter();
        let policy = RateLimitPolicy::new(100, Duration::from_secs(10));

        for _ in 0..50 {
            limiter.check("k", &policy).await.unwrap();
        }
        assert_eq!(limiter.total_requests(), 50);

        clock.advance(Duration::from_secs(61));
        limiter.check("k", &policy).await.unwrap();
        assert_eq!(limiter.total_requests(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_window() {
        let (limiter, _) = limiter();
        let policy = policy(1, 0);

        assert!(limiter.check("a", &policy).await.unwrap().allowed);
        assert!(limiter.check("b", &policy).await.unwrap().allowed);
        assert!(!limiter.check("a", &policy).await.unwrap().allowed);

        limiter.reset("a").await.unwrap();
        let decision = limiter.check("a", &policy).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.count, 1);

        limiter
            .reset_multiple(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(limiter.check("b", &policy).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_check_multiple_in_order() {
        let (limiter, _) = limiter();
        let checks = vec![
            ("x".to_string(), policy(1, 0)),
            ("x".to_string(), policy(1, 0)),
            ("y".to_string(), policy(1, 0)),
        ];
        let decisions = limiter.check_multiple(&checks).await.unwrap();
        let allowed: Vec<bool> = decisions.iter().map(|d| d.allowed).collect();
        assert_eq!(allowed, vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let (limiter, _) = limiter();
        assert!(matches!(
            limiter.check("", &policy(1, 0)).await,
            Err(LimiterError::Validation(_))
        ));
        assert!(matches!(
            limiter.check("k", &policy(0, 0)).await,
            Err(LimiterError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_windows() {
        let (limiter, clock) = limiter();
        let policy = policy(5, 0);

        limiter.check("idle", &policy).await.unwrap();
        clock.advance(Duration::from_secs(100));
        limiter.check("busy", &policy).await.unwrap();

        // idle's timestamp expired but it has been idle for less than 2x window
        assert_eq!(limiter.sweep(), 0);
        assert_eq!(limiter.stats("idle").unwrap().count, 0);

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.sweep(), 1);
        assert!(limiter.stats("idle").is_none());
        assert!(limiter.stats("busy").is_some());
        assert_eq!(limiter.window_count(), 1);
    }

    #[tokio::test]
    async fn test_stats_and_info() {
        let (limiter, clock) = limiter();
        let policy = policy(4, 0);

        limiter.check("k", &policy).await.unwrap();
        clock.advance(Duration::from_secs(1));
        limiter.check("k", &policy).await.unwrap();

        let stats = limiter.stats("k").unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.utilization, 0.5);
        assert_eq!(stats.oldest.unwrap().timestamp_millis(), START);
        assert_eq!(stats.newest.unwrap().timestamp_millis(), START + 1000);

        let info = limiter.info();
        assert_eq!(info.windows, 1);
        assert_eq!(info.tracked_requests, 2);
        assert!(info.memory_bytes > 0);
        assert_eq!(limiter.all_stats().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_checks_admit_exactly_limit_plus_burst() {
        let limiter = Arc::new(LocalFallbackLimiter::new(&FallbackConfig::default()));
        let policy = policy(10, 5);

        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = limiter.clone();
            let policy = policy.clone();
            handles.push(tokio::spawn(async move {
                limiter.check("shared", &policy).await.unwrap().allowed
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 15);
    }

    #[tokio::test]
    async fn test_trigger_cleanup_without_sweeper_sweeps_inline() {
        let (limiter, clock) = limiter();
        limiter.check("k", &policy(1, 0)).await.unwrap();
        clock.advance(Duration::from_secs(200));

        limiter.trigger_cleanup();
        assert_eq!(limiter.window_count(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_runs_on_trigger_and_shuts_down() {
        let (limiter, clock) = limiter();
        limiter.start_sweeper();
        limiter.start_sweeper();

        limiter.check("k", &policy(1, 0)).await.unwrap();
        clock.advance(Duration::from_secs(200));
        limiter.trigger_cleanup();

        for _ in 0..100 {
            if limiter.window_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(limiter.window_count(), 0);

        limiter.shutdown().await;
        limiter.shutdown().await;
    }
}
