use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::QueueStats;

use super::health::{HealthStatus, MemoryUsage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub uptime_secs: u64,
    pub memory: Option<MemoryUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub status: HealthStatus,
    pub duration_ms: u64,
}

/// Request counters since `since`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiUsageSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub average_response_ms: f64,
    pub since: DateTime<Utc>,
}

/// One sample of the monitored system, taken every monitor tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub checks: BTreeMap<String, CheckSummary>,
    pub queue: Option<QueueStats>,
    pub api: ApiUsageSnapshot,
}

/// The most recent snapshots, oldest first.
#[derive(Debug, Clone)]
pub(crate) struct MetricsHistory {
    entries: VecDeque<MetricsSnapshot>,
    capacity: usize,
}

impl MetricsHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&mut self, snapshot: MetricsSnapshot) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
    }

    /// Snapshots taken at or after `cutoff`, oldest first.
    pub(crate) fn since(&self, cutoff: DateTime<Utc>) -> Vec<MetricsSnapshot> {
        self.entries
            .iter()
            .filter(|snapshot| snapshot.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn to_vec(&self) -> Vec<MetricsSnapshot> {
        self.entries.iter().cloned().collect()
    }

    pub(crate) fn replace(&mut self, mut snapshots: Vec<MetricsSnapshot>) {
        snapshots.sort_by_key(|snapshot| snapshot.timestamp);
        self.entries.clear();
        for snapshot in snapshots {
            self.push(snapshot);
        }
    }
}

/// Request counters, reset once an hour has passed since the last reset.
#[derive(Debug, Clone)]
pub(crate) struct ApiUsage {
    requests: u64,
    errors: u64,
    total_response: Duration,
    since: DateTime<Utc>,
}

impl ApiUsage {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self {
            requests: 0,
            errors: 0,
            total_response: Duration::ZERO,
            since: now,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        if now - self.since >= TimeDelta::hours(1) {
            tracing::debug!(
                requests = self.requests,
                errors = self.errors,
                "Resetting API usage counters"
            );
            *self = Self::new(now);
        }
    }

    pub(crate) fn record(&mut self, response_time: Duration, is_error: bool, now: DateTime<Utc>) {
        self.roll(now);
        self.requests += 1;
        if is_error {
            self.errors += 1;
        }
        self.total_response = self.total_response.saturating_add(response_time);
    }

    /// The counters of the current hour, which are empty when nothing was recorded in it.
    pub(crate) fn snapshot(&mut self, now: DateTime<Utc>) -> ApiUsageSnapshot {
        self.roll(now);
        let (error_rate, average_response_ms) = if self.requests == 0 {
            (0.0, 0.0)
        } else {
            (
                self.errors as f64 / self.requests as f64,
                self.total_response.as_secs_f64() * 1000.0 / self.requests as f64,
            )
        };
        ApiUsageSnapshot {
            requests: self.requests,
            errors: self.errors,
            error_rate,
            average_response_ms,
            since: self.since,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(timestamp: DateTime<Utc>) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp,
            system: SystemMetrics {
                uptime_secs: 0,
                memory: None,
            },
            checks: BTreeMap::new(),
            queue: None,
            api: ApiUsage::new(timestamp).snapshot(timestamp),
        }
    }

    #[test]
    fn history_evicts_oldest_entries() {
        let now = Utc::now();
        let mut history = MetricsHistory::new(3);

        for minutes in 0..5 {
            history.push(snapshot(now + TimeDelta::minutes(minutes)));
        }

        assert_eq!(history.len(), 3);
        let timestamps: Vec<_> = history.to_vec().iter().map(|s| s.timestamp).collect();
        assert_eq!(
            timestamps,
            vec![
                now + TimeDelta::minutes(2),
                now + TimeDelta::minutes(3),
                now + TimeDelta::minutes(4)
            ]
        );
    }

    #[test]
    fn since_filters_by_timestamp() {
        let now = Utc::now();
        let mut history = MetricsHistory::new(10);
        for minutes in [30, 20, 10, 0] {
            history.push(snapshot(now - TimeDelta::minutes(minutes)));
        }

        assert_eq!(history.since(now - TimeDelta::minutes(15)).len(), 2);
        assert_eq!(history.since(now - TimeDelta::minutes(60)).len(), 4);
    }

    #[test]
    fn replace_keeps_order_and_capacity() {
        let now = Utc::now();
        let mut history = MetricsHistory::new(2);

        history.replace(vec![
            snapshot(now),
            snapshot(now - TimeDelta::minutes(2)),
            snapshot(now - TimeDelta::minutes(1)),
        ]);

        let timestamps: Vec<_> = history.to_vec().iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![now - TimeDelta::minutes(1), now]);
    }

    #[test]
    fn error_rate_and_average_response() {
        let now = Utc::now();
        let mut usage = ApiUsage::new(now);

        for i in 0..10 {
            usage.record(Duration::from_millis(100), i < 2, now);
        }

        let snapshot = usage.snapshot(now);
        assert_eq!(snapshot.requests, 10);
        assert_eq!(snapshot.errors, 2);
        assert!((snapshot.error_rate - 0.2).abs() < f64::EPSILON);
        assert!((snapshot.average_response_ms - 100.0).abs() < 1e-9);
    }

    #[test]
    fn counters_reset_after_an_hour() {
        let start = Utc::now();
        let mut usage = ApiUsage::new(start);
        usage.record(Duration::from_millis(10), true, start);

        usage.record(
            Duration::from_millis(10),
            false,
            start + TimeDelta::minutes(59),
        );
        assert_eq!(usage.snapshot(start + TimeDelta::minutes(59)).requests, 2);

        let later = start + TimeDelta::minutes(61);
        usage.record(Duration::from_millis(10), false, later);
        let snapshot = usage.snapshot(later);
        assert_eq!(snapshot.requests, 1);
        assert_eq!(snapshot.errors, 0);
        assert_eq!(snapshot.since, later);
    }

    #[test]
    fn empty_usage_has_zero_rates() {
        let now = Utc::now();
        let snapshot = ApiUsage::new(now).snapshot(now);

        assert_eq!(snapshot.error_rate, 0.0);
        assert_eq!(snapshot.average_response_ms, 0.0);
    }

    #[test]
    fn quiet_hour_reads_as_empty() {
        let start = Utc::now();
        let mut usage = ApiUsage::new(start);
        for _ in 0..20 {
            usage.record(Duration::from_millis(2000), true, start);
        }

        let later = start + TimeDelta::minutes(75);
        let snapshot = usage.snapshot(later);

        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.error_rate, 0.0);
        assert_eq!(snapshot.average_response_ms, 0.0);
        assert_eq!(snapshot.since, later);
    }
}
