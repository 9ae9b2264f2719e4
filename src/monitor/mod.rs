//! Metrics aggregation, deduplicated alerting and health reporting.
//!
//! A `Monitor` owns all of its mutable state; collaborators hold it by
//! handle. Alerts pass through a bounded queue drained by a background task
//! that fans each alert out to the configured sinks. Producers never block:
//! when the queue is full the newest alert is dropped and the drop is
//! logged at most once per `drop_log_interval`.

mod alerts;
mod health;
mod metrics;

pub use alerts::{Alert, AlertSink, AlertType, LogSink, Severity, WebhookSink};
pub use health::{ratio, HealthStatus};
pub use metrics::{
    EndpointMetrics, ErrorKind, MetricsSnapshot, MinuteSeries, PerformanceSample, RequestRecord,
};

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::MonitorConfig;
use crate::ratelimit::{LimitDecision, Limiter};
use metrics::MetricsState;

/// Delivered alerts kept for `recent_alerts`.
const ALERT_HISTORY: usize = 1000;
/// Performance samples kept.
const PERFORMANCE_SAMPLES: usize = 1000;
/// Throttle entries older than this are forgotten by the cleanup task.
const THROTTLE_RETENTION: Duration = Duration::from_secs(3600);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Throttle scope for alerts about the coordinator itself.
const COORDINATOR_SCOPE: &str = "coordinator";

struct Shared {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    metrics: Mutex<MetricsState>,
    /// Last emission per (type, endpoint or error kind), in ms
    throttle: DashMap<(AlertType, String), i64>,
    alerts: mpsc::Sender<Alert>,
    dropped_total: AtomicU64,
    dropped_since_log: AtomicU64,
    last_drop_log_ms: Mutex<Option<i64>>,
    delivered: Mutex<VecDeque<Alert>>,
    performance: Mutex<VecDeque<PerformanceSample>>,
    last_check: Mutex<Option<DateTime<Utc>>>,
    probe: Option<Arc<dyn Limiter>>,
}

struct Tasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Rate limiting monitor.
pub struct Monitor {
    shared: Arc<Shared>,
    tasks: Mutex<Option<Tasks>>,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("config", &self.shared.config)
            .field("running", &self.tasks.lock().is_some())
            .finish()
    }
}

impl Monitor {
    /// Create a monitor and start its background tasks.
    ///
    /// `probe` is the limiter polled for health; without one only the
    /// alert drain and performance sampling run.
    /// Spawns tasks, so it must be called inside a tokio runtime.
    pub fn start(
        config: MonitorConfig,
        sinks: Vec<Arc<dyn AlertSink>>,
        probe: Option<Arc<dyn Limiter>>,
    ) -> Self {
        Self::start_with_clock(config, sinks, probe, Arc::new(SystemClock))
    }

    pub fn start_with_clock(
        config: MonitorConfig,
        sinks: Vec<Arc<dyn AlertSink>>,
        probe: Option<Arc<dyn Limiter>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (alerts, alert_rx) = mpsc::channel(config.alert_queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            config,
            clock,
            metrics: Mutex::new(MetricsState::default()),
            throttle: DashMap::new(),
            alerts,
            dropped_total: AtomicU64::new(0),
            dropped_since_log: AtomicU64::new(0),
            last_drop_log_ms: Mutex::new(None),
            delivered: Mutex::new(VecDeque::new()),
            performance: Mutex::new(VecDeque::new()),
            last_check: Mutex::new(None),
            probe,
        });

        let mut handles = vec![
            tokio::spawn(drain_alerts(
                shared.clone(),
                alert_rx,
                sinks,
                shutdown_rx.clone(),
            )),
            tokio::spawn(sample_performance(shared.clone(), shutdown_rx.clone())),
        ];
        if shared.probe.is_some() {
            handles.push(tokio::spawn(poll_health(shared.clone(), shutdown_rx)));
        }

        info!(
            metrics = shared.config.enable_metrics,
            alerting = shared.config.enable_alerting,
            "Started rate limit monitor"
        );

        Self {
            shared,
            tasks: Mutex::new(Some(Tasks { shutdown, handles })),
        }
    }

    /// Record one limiting decision and raise any alerts it warrants.
    pub fn record_request(
        &self,
        endpoint: &str,
        key: &str,
        decision: &LimitDecision,
        latency: Duration,
    ) {
        let shared = &self.shared;
        if !shared.config.enable_metrics {
            return;
        }

        let now = shared.clock.now();
        let record = RequestRecord {
            timestamp: now,
            key: key.to_string(),
            allowed: decision.allowed,
            latency,
            count: decision.count,
            limit: decision.limit,
        };
        let recorded = shared.metrics.lock().record_request(endpoint, record, now);

        if !shared.config.enable_alerting {
            return;
        }

        let utilization = recorded.utilization;
        if decision.limit > 0 && utilization >= shared.config.alert_threshold {
            shared.emit(
                Alert::new(
                    AlertType::HighUsage,
                    Severity::Warning,
                    format!(
                        "High usage detected for endpoint {}: {:.1}% of limit",
                        endpoint,
                        utilization * 100.0
                    ),
                    now,
                )
                .with_endpoint(endpoint)
                .with_key(key)
                .with_metadata("utilization_rate", utilization)
                .with_metadata("current_count", decision.count)
                .with_metadata("limit", decision.limit),
                endpoint,
            );
        }

        if !decision.allowed {
            shared.emit(
                Alert::new(
                    AlertType::RateLimited,
                    Severity::Info,
                    format!("Rate limit exceeded for endpoint {}", endpoint),
                    now,
                )
                .with_endpoint(endpoint)
                .with_key(key)
                .with_metadata("current_count", decision.count)
                .with_metadata("limit", decision.limit)
                .with_metadata("retry_after", decision.retry_after.as_secs_f64()),
                endpoint,
            );
        }

        let threshold = shared.config.high_latency_threshold;
        if !threshold.is_zero() && latency >= threshold {
            shared.emit(
                Alert::new(
                    AlertType::HighLatency,
                    Severity::Warning,
                    format!(
                        "Rate limit check for endpoint {} took {:?} (threshold {:?})",
                        endpoint, latency, threshold
                    ),
                    now,
                )
                .with_endpoint(endpoint)
                .with_key(key)
                .with_metadata("latency_ms", latency.as_secs_f64() * 1000.0),
                endpoint,
            );
        }
    }

    /// Count an error and raise a `config_error` alert for it.
    pub fn record_error(&self, kind: ErrorKind, err: &dyn fmt::Display) {
        self.shared.record_error(kind, err);
    }

    /// Note that a decision came from the local fallback limiter.
    pub fn record_fallback_used(&self, endpoint: &str) {
        let shared = &self.shared;
        if !shared.config.enable_metrics {
            return;
        }
        shared.metrics.lock().fallback_usage += 1;

        if shared.config.enable_alerting {
            let now = shared.clock.now();
            shared.emit(
                Alert::new(
                    AlertType::FallbackUsed,
                    Severity::Warning,
                    format!("Local fallback limiter used for endpoint {}", endpoint),
                    now,
                )
                .with_endpoint(endpoint),
                endpoint,
            );
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let now = self.shared.clock.now();
        self.shared.metrics.lock().snapshot(now)
    }

    /// Probe the limiter and summarize monitor state.
    pub async fn health_status(&self) -> HealthStatus {
        let shared = &self.shared;
        let (limiter_healthy, limiter_error) = match &shared.probe {
            Some(limiter) => match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, limiter.is_healthy()).await {
                Ok(Ok(())) => (true, None),
                Ok(Err(e)) => (false, Some(e.to_string())),
                Err(_) => (false, Some(format!("health probe timed out after {:?}", HEALTH_PROBE_TIMEOUT))),
            },
            None => (false, None),
        };

        let metrics = shared.metrics.lock();
        HealthStatus {
            limiter_healthy,
            limiter_error,
            monitoring_enabled: shared.config.enable_metrics,
            alerting_enabled: shared.config.enable_alerting,
            last_check: *shared.last_check.lock(),
            alerts_in_queue: self.alerts_in_queue(),
            total_requests: metrics.total_requests,
            success_rate: ratio(metrics.allowed_requests, metrics.total_requests),
            error_rate: ratio(metrics.total_errors, metrics.total_requests),
            active_endpoints: metrics.endpoints.len(),
        }
    }

    /// Alerts handed to the sinks, oldest first.
    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.shared.delivered.lock().iter().cloned().collect()
    }

    pub fn performance_samples(&self) -> Vec<PerformanceSample> {
        self.shared.performance.lock().iter().cloned().collect()
    }

    pub fn alerts_in_queue(&self) -> usize {
        let sender = &self.shared.alerts;
        sender.max_capacity() - sender.capacity()
    }

    /// Alerts dropped because the queue was full.
    pub fn alerts_dropped(&self) -> u64 {
        self.shared.dropped_total.load(Ordering::Relaxed)
    }

    /// Stop the background tasks, delivering alerts still queued.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            let _ = tasks.shutdown.send(true);
            for result in futures::future::join_all(tasks.handles).await {
                if let Err(e) = result {
                    warn!(error = %e, "Monitor task ended abnormally");
                }
            }
            info!("Stopped rate limit monitor");
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().take() {
            let _ = tasks.shutdown.send(true);
        }
    }
}

impl Shared {
    fn record_error(&self, kind: ErrorKind, err: &dyn fmt::Display) {
        if !self.config.enable_metrics {
            return;
        }
        let now = self.clock.now();
        self.metrics.lock().record_error(kind, now);

        if self.config.enable_alerting {
            let message = err.to_string();
            self.emit(
                Alert::new(
                    AlertType::ConfigError,
                    Severity::Error,
                    format!("Rate limiting error: {} - {}", kind, message),
                    now,
                )
                .with_metadata("error_type", kind.as_str())
                .with_metadata("error", message),
                kind.as_str(),
            );
        }
    }

    /// Throttle check and check-in for one (type, scope) pair.
    fn permit(&self, alert_type: AlertType, scope: &str, now_ms: i64) -> bool {
        let throttle_ms = self.config.alert_throttle.as_millis() as i64;
        match self.throttle.entry((alert_type, scope.to_string())) {
            Entry::Occupied(mut last) => {
                if now_ms - *last.get() < throttle_ms {
                    return false;
                }
                last.insert(now_ms);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now_ms);
                true
            }
        }
    }

    /// Queue an alert unless one of its type was sent for `scope` recently.
    fn emit(&self, alert: Alert, scope: &str) -> bool {
        let now_ms = self.clock.now_ms();
        if !self.permit(alert.alert_type, scope, now_ms) {
            return false;
        }

        match self.alerts.try_send(alert) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(alert)) => {
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                let pending = self.dropped_since_log.fetch_add(1, Ordering::Relaxed) + 1;

                let interval_ms = self.config.drop_log_interval.as_millis() as i64;
                let mut last_log = self.last_drop_log_ms.lock();
                if last_log.map_or(true, |last| now_ms - last >= interval_ms) {
                    *last_log = Some(now_ms);
                    self.dropped_since_log.store(0, Ordering::Relaxed);
                    warn!(
                        dropped = pending,
                        latest = %alert.alert_type,
                        "Alert queue full, dropping alerts"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                debug!(alert_type = %alert.alert_type, "Monitor stopped, discarding alert");
                false
            }
        }
    }

    fn remember(&self, alert: Alert) {
        let mut delivered = self.delivered.lock();
        if delivered.len() == ALERT_HISTORY {
            delivered.pop_front();
        }
        delivered.push_back(alert);
    }

    fn cleanup_stale(&self) {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let keep_ms = THROTTLE_RETENTION.max(self.config.alert_throttle).as_millis() as i64;
        self.throttle.retain(|_, last| now_ms - *last < keep_ms);

        let cutoff = now
            - chrono::Duration::from_std(self.config.alert_retention)
                .unwrap_or_else(|_| chrono::Duration::days(1));
        self.delivered.lock().retain(|alert| alert.timestamp > cutoff);
    }
}

async fn deliver(shared: &Shared, sinks: &[Arc<dyn AlertSink>], alert: Alert) {
    let sends = sinks.iter().map(|sink| sink.send(&alert));
    let results = futures::future::join_all(sends).await;
    for (sink, result) in sinks.iter().zip(results) {
        if let Err(e) = result {
            warn!(sink = sink.name(), alert_type = %alert.alert_type, error = %e, "Alert delivery failed");
        }
    }
    shared.remember(alert);
}

async fn drain_alerts(
    shared: Arc<Shared>,
    mut alerts: mpsc::Receiver<Alert>,
    sinks: Vec<Arc<dyn AlertSink>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cleanup = tokio::time::interval(shared.config.alert_cleanup_interval.max(Duration::from_millis(1)));
    cleanup.tick().await;

    loop {
        tokio::select! {
            alert = alerts.recv() => match alert {
                Some(alert) => deliver(&shared, &sinks, alert).await,
                None => break,
            },
            _ = cleanup.tick() => shared.cleanup_stale(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    alerts.close();
    while let Some(alert) = alerts.recv().await {
        deliver(&shared, &sinks, alert).await;
    }
    debug!("Alert drain stopped");
}

async fn poll_health(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let Some(limiter) = shared.probe.clone() else {
        return;
    };
    let mut ticker = tokio::time::interval(shared.config.health_check_interval.max(Duration::from_millis(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let outcome = tokio::time::timeout(HEALTH_PROBE_TIMEOUT, limiter.is_healthy()).await;
        let now = shared.clock.now();
        *shared.last_check.lock() = Some(now);

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("health probe timed out after {:?}", HEALTH_PROBE_TIMEOUT)),
        };
        if let Some(reason) = failure {
            warn!(limiter = limiter.name(), error = %reason, "Limiter health check failed");
            shared.record_error(ErrorKind::HealthCheck, &reason);
            if shared.config.enable_alerting {
                shared.emit(
                    Alert::new(
                        AlertType::RedisDown,
                        Severity::Critical,
                        format!("Rate limit coordinator unreachable: {}", reason),
                        now,
                    )
                    .with_metadata("limiter", limiter.name()),
                    COORDINATOR_SCOPE,
                );
            }
        }
    }
}

async fn sample_performance(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.performance_interval.max(Duration::from_millis(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let sample = {
            let metrics = shared.metrics.lock();
            PerformanceSample {
                timestamp: shared.clock.now(),
                request_count: metrics.total_requests,
                error_count: metrics.total_errors,
                average_check_time: metrics.average_check_time,
                alerts_dropped: shared.dropped_total.load(Ordering::Relaxed),
            }
        };
        let mut samples = shared.performance.lock();
        if samples.len() == PERFORMANCE_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(sample);
    }
}
