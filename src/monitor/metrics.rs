//! Metrics aggregation for limiting decisions.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Entries kept in each endpoint's recent-request ring.
pub const RECENT_REQUESTS: usize = 100;
/// Slots in each per-minute series.
pub const SERIES_SLOTS: usize = 60;

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// Error classes tracked by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Coordinator,
    Fallback,
    HealthCheck,
    Script,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Coordinator => "coordinator",
            ErrorKind::Fallback => "fallback",
            ErrorKind::HealthCheck => "health_check",
            ErrorKind::Script => "script",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts per minute over the last hour.
///
/// Slot `minute % 60` holds the count for that absolute minute; a slot
/// still holding an older minute is zeroed before it is reused, so counts
/// from a previous hour never leak into the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinuteSeries {
    counts: [u64; SERIES_SLOTS],
    minutes: [i64; SERIES_SLOTS],
}

impl Default for MinuteSeries {
    fn default() -> Self {
        Self {
            counts: [0; SERIES_SLOTS],
            minutes: [i64::MIN; SERIES_SLOTS],
        }
    }
}

impl MinuteSeries {
    fn slot(minute: i64) -> usize {
        minute.rem_euclid(SERIES_SLOTS as i64) as usize
    }

    pub fn record(&mut self, minute: i64) {
        let slot = Self::slot(minute);
        if self.minutes[slot] != minute {
            self.minutes[slot] = minute;
            self.counts[slot] = 0;
        }
        self.counts[slot] += 1;
    }

    /// Count for an absolute minute, zero if it is no longer held.
    pub fn get(&self, minute: i64) -> u64 {
        let slot = Self::slot(minute);
        if self.minutes[slot] == minute {
            self.counts[slot]
        } else {
            0
        }
    }

    /// The 60 minutes ending at `now_minute`, indexed by minute of the hour.
    pub fn snapshot(&self, now_minute: i64) -> Vec<u64> {
        let mut out = vec![0; SERIES_SLOTS];
        for (slot, value) in out.iter_mut().enumerate() {
            let minute = self.minutes[slot];
            if minute <= now_minute && now_minute.saturating_sub(minute) < SERIES_SLOTS as i64 {
                *value = self.counts[slot];
            }
        }
        out
    }
}

/// One recorded check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub key: String,
    pub allowed: bool,
    #[serde(serialize_with = "as_millis")]
    pub latency: Duration,
    pub count: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointMetrics {
    pub endpoint: String,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    #[serde(serialize_with = "as_millis")]
    pub average_latency: Duration,
    pub last_request: Option<DateTime<Utc>>,
    pub recent_requests: VecDeque<RequestRecord>,
    pub utilization_rate: f64,
}

impl EndpointMetrics {
    fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            total_requests: 0,
            allowed_requests: 0,
            blocked_requests: 0,
            average_latency: Duration::ZERO,
            last_request: None,
            recent_requests: VecDeque::with_capacity(RECENT_REQUESTS),
            utilization_rate: 0.0,
        }
    }
}

/// Periodic sample of the global counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub timestamp: DateTime<Utc>,
    pub request_count: u64,
    pub error_count: u64,
    #[serde(serialize_with = "as_millis")]
    pub average_check_time: Duration,
    pub alerts_dropped: u64,
}

/// Moving latency estimate, `(old + sample) / 2`.
fn blend(average: Duration, sample: Duration) -> Duration {
    if average.is_zero() {
        sample
    } else {
        (average + sample) / 2
    }
}

/// Mutable aggregate owned by the monitor.
#[derive(Debug, Default)]
pub(crate) struct MetricsState {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub average_check_time: Duration,
    pub max_check_time: Duration,
    pub min_check_time: Duration,
    pub total_errors: u64,
    pub errors_by_kind: HashMap<ErrorKind, u64>,
    pub fallback_usage: u64,
    pub endpoints: HashMap<String, EndpointMetrics>,
    pub requests_per_minute: MinuteSeries,
    pub blocked_per_minute: MinuteSeries,
    pub errors_per_minute: MinuteSeries,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Values the alert checks need after a request is recorded.
pub(crate) struct Recorded {
    pub utilization: f64,
}

impl MetricsState {
    pub fn record_request(
        &mut self,
        endpoint: &str,
        record: RequestRecord,
        now: DateTime<Utc>,
    ) -> Recorded {
        let minute = now.timestamp().div_euclid(60);
        let allowed = record.allowed;
        let latency = record.latency;

        self.total_requests += 1;
        if allowed {
            self.allowed_requests += 1;
        } else {
            self.blocked_requests += 1;
        }

        if !latency.is_zero() {
            self.average_check_time = blend(self.average_check_time, latency);
            self.max_check_time = self.max_check_time.max(latency);
            if self.min_check_time.is_zero() || latency < self.min_check_time {
                self.min_check_time = latency;
            }
        }

        let metrics = self
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointMetrics::new(endpoint));
        metrics.total_requests += 1;
        if allowed {
            metrics.allowed_requests += 1;
        } else {
            metrics.blocked_requests += 1;
        }
        metrics.last_request = Some(now);
        if !latency.is_zero() {
            metrics.average_latency = blend(metrics.average_latency, latency);
        }
        if record.limit > 0 {
            metrics.utilization_rate = record.count as f64 / record.limit as f64;
        }
        let utilization = metrics.utilization_rate;

        if metrics.recent_requests.len() == RECENT_REQUESTS {
            metrics.recent_requests.pop_front();
        }
        metrics.recent_requests.push_back(record);

        self.requests_per_minute.record(minute);
        if !allowed {
            self.blocked_per_minute.record(minute);
        }
        self.last_updated = Some(now);

        Recorded { utilization }
    }

    pub fn record_error(&mut self, kind: ErrorKind, now: DateTime<Utc>) {
        self.total_errors += 1;
        *self.errors_by_kind.entry(kind).or_insert(0) += 1;
        self.errors_per_minute.record(now.timestamp().div_euclid(60));
        self.last_updated = Some(now);
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let minute = now.timestamp().div_euclid(60);
        let mut errors_by_kind: Vec<(ErrorKind, u64)> =
            self.errors_by_kind.iter().map(|(k, v)| (*k, *v)).collect();
        errors_by_kind.sort_by_key(|(kind, _)| kind.as_str());

        MetricsSnapshot {
            total_requests: self.total_requests,
            allowed_requests: self.allowed_requests,
            blocked_requests: self.blocked_requests,
            average_check_time: self.average_check_time,
            max_check_time: self.max_check_time,
            min_check_time: self.min_check_time,
            total_errors: self.total_errors,
            errors_by_kind: errors_by_kind
                .into_iter()
                .map(|(kind, count)| (kind.as_str().to_string(), count))
                .collect(),
            fallback_usage: self.fallback_usage,
            endpoint_metrics: self.endpoints.clone(),
            requests_per_minute: self.requests_per_minute.snapshot(minute),
            blocked_per_minute: self.blocked_per_minute.snapshot(minute),
            errors_per_minute: self.errors_per_minute.snapshot(minute),
            last_updated: self.last_updated,
        }
    }
}

/// Owned copy of the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    #[serde(serialize_with = "as_millis")]
    pub average_check_time: Duration,
    #[serde(serialize_with = "as_millis")]
    pub max_check_time: Duration,
    #[serde(serialize_with = "as_millis")]
    pub min_check_time: Duration,
    pub total_errors: u64,
    pub errors_by_kind: Vec<(String, u64)>,
    pub fallback_usage: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetrics>,
    pub requests_per_minute: Vec<u64>,
    pub blocked_per_minute: Vec<u64>,
    pub errors_per_minute: Vec<u64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl MetricsSnapshot {
    pub fn errors_of(&self, kind: ErrorKind) -> u64 {
        self.errors_by_kind
            .iter()
            .find(|(name, _)| name == kind.as_str())
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(allowed: bool, latency_ms: u64, count: u64, limit: u64) -> RequestRecord {
        RequestRecord {
            timestamp: at(0),
            key: "k".to_string(),
            allowed,
            latency: Duration::from_millis(latency_ms),
            count,
            limit,
        }
    }

    #[test]
    fn test_minute_series_does_not_alias_across_hours() {
        let mut series = MinuteSeries::default();
        series.record(5);
        series.record(5);
        assert_eq!(series.get(5), 2);

        // same minute of the next hour reuses the slot from zero
        series.record(65);
        assert_eq!(series.get(65), 1);
        assert_eq!(series.get(5), 0);

        let snapshot = series.snapshot(65);
        assert_eq!(snapshot[5], 1);
        // an hour later the slot is stale
        assert_eq!(series.snapshot(125)[5], 0);
    }

    #[test]
    fn test_latency_estimator() {
        let mut state = MetricsState::default();
        state.record_request("/a", record(true, 10, 1, 10), at(0));
        state.record_request("/a", record(true, 30, 2, 10), at(1));
        state.record_request("/a", record(true, 2, 3, 10), at(2));

        assert_eq!(state.average_check_time, Duration::from_millis(11));
        assert_eq!(state.max_check_time, Duration::from_millis(30));
        assert_eq!(state.min_check_time, Duration::from_millis(2));
    }

    #[test]
    fn test_recent_ring_is_capped() {
        let mut state = MetricsState::default();
        for i in 0..150 {
            state.record_request("/a", record(true, 1, i, 1000), at(i as i64));
        }
        let endpoint = &state.endpoints["/a"];
        assert_eq!(endpoint.recent_requests.len(), RECENT_REQUESTS);
        assert_eq!(endpoint.recent_requests.front().unwrap().count, 50);
        assert_eq!(endpoint.total_requests, 150);
    }

    #[test]
    fn test_utilization_and_blocked_counts() {
        let mut state = MetricsState::default();
        let recorded = state.record_request("/a", record(false, 1, 8, 10), at(120));
        assert_eq!(recorded.utilization, 0.8);

        let snapshot = state.snapshot(at(130));
        assert_eq!(snapshot.blocked_requests, 1);
        assert_eq!(snapshot.blocked_per_minute[2], 1);
        assert_eq!(snapshot.requests_per_minute[2], 1);
        assert_eq!(snapshot.endpoint_metrics["/a"].blocked_requests, 1);
    }

    #[test]
    fn test_error_counters() {
        let mut state = MetricsState::default();
        state.record_error(ErrorKind::Coordinator, at(0));
        state.record_error(ErrorKind::Coordinator, at(0));
        state.record_error(ErrorKind::Script, at(0));

        let snapshot = state.snapshot(at(0));
        assert_eq!(snapshot.total_errors, 3);
        assert_eq!(snapshot.errors_of(ErrorKind::Coordinator), 2);
        assert_eq!(snapshot.errors_of(ErrorKind::Script), 1);
        assert_eq!(snapshot.errors_of(ErrorKind::Fallback), 0);
        assert_eq!(snapshot.errors_per_minute[0], 3);
    }
}
