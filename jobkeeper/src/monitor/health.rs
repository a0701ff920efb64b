use std::{
    fmt::Display,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    queue::JobQueue,
    store::{KeyType, Keyspace, SetOptions, Store},
};

use super::alert::AlertKind;

/// The status of a subsystem. Ordered from best to worst.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// The worst of `statuses`, [`HealthStatus::Healthy`] when empty.
pub fn rollup(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
    statuses.into_iter().max().unwrap_or_default()
}

/// What a [`HealthCheck`] found.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub status: HealthStatus,
    pub message: String,
    pub details: serde_json::Value,
}

impl CheckOutcome {
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Healthy, message)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy, message)
    }

    pub fn with_details(self, details: serde_json::Value) -> Self {
        Self { details, ..self }
    }
}

/// The latest result of one health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// A probe of one subsystem, evaluated on every monitor tick.
///
/// ```
/// # use jobkeeper::monitor::{CheckOutcome, HealthCheck};
/// struct Payments;
///
/// #[async_trait::async_trait]
/// impl HealthCheck for Payments {
///     fn name(&self) -> &str {
///         "payments"
///     }
///
///     async fn check(&self) -> CheckOutcome {
///         CheckOutcome::healthy("Payment provider reachable")
///     }
/// }
/// ```
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> CheckOutcome;

    /// The alert raised while the check reports `status`.
    ///
    /// Alerts returned for [`HealthStatus::Degraded`] or [`HealthStatus::Unhealthy`] are
    /// resolved automatically once no check reports a status mapped to them.
    fn alert_for(&self, _status: HealthStatus) -> Option<AlertKind> {
        None
    }
}

pub(crate) async fn run_check(check: &dyn HealthCheck) -> HealthCheckResult {
    let started = Instant::now();
    let outcome = check.check().await;
    let duration_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
    HealthCheckResult {
        name: check.name().to_owned(),
        status: outcome.status,
        message: outcome.message,
        duration_ms,
        timestamp: Utc::now(),
        details: outcome.details,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreRole {
    Database,
    Cache,
}

/// Writes and reads back a probe key, timing the round trip.
pub struct StoreHealthCheck {
    role: StoreRole,
    store: Arc<dyn Store>,
    probe_key: String,
    latency_limit: Duration,
}

impl StoreHealthCheck {
    /// Raises [`AlertKind::DatabaseUnavailable`] and [`AlertKind::DatabaseSlow`].
    pub fn database(store: Arc<dyn Store>, keyspace: &Keyspace, latency_limit: Duration) -> Self {
        Self {
            role: StoreRole::Database,
            store,
            probe_key: keyspace.key(KeyType::HealthProbe("database")),
            latency_limit,
        }
    }

    /// Raises [`AlertKind::CacheUnavailable`] and [`AlertKind::CacheSlow`].
    pub fn cache(store: Arc<dyn Store>, keyspace: &Keyspace, latency_limit: Duration) -> Self {
        Self {
            role: StoreRole::Cache,
            store,
            probe_key: keyspace.key(KeyType::HealthProbe("cache")),
            latency_limit,
        }
    }
}

#[async_trait]
impl HealthCheck for StoreHealthCheck {
    fn name(&self) -> &str {
        match self.role {
            StoreRole::Database => "database",
            StoreRole::Cache => "cache",
        }
    }

    async fn check(&self) -> CheckOutcome {
        let started = Instant::now();
        let probe = Utc::now().to_rfc3339();
        let result = async {
            self.store
                .set(
                    &self.probe_key,
                    probe.clone(),
                    SetOptions::ttl(Duration::from_secs(60)),
                )
                .await?;
            self.store.get(&self.probe_key).await
        }
        .await;
        let latency = started.elapsed();
        let details = json!({ "latency_ms": latency.as_millis() as u64 });

        match result {
            Err(err) => CheckOutcome::unhealthy(format!("Store unavailable: {err}")).with_details(
                json!({ "latency_ms": latency.as_millis() as u64, "error": err.to_string() }),
            ),
            Ok(value) if value.as_deref() != Some(probe.as_str()) => {
                CheckOutcome::unhealthy("Probe value could not be read back").with_details(details)
            }
            Ok(_) if latency > self.latency_limit => CheckOutcome::degraded(format!(
                "Slow response: {}ms exceeds {}ms",
                latency.as_millis(),
                self.latency_limit.as_millis()
            ))
            .with_details(details),
            Ok(_) => {
                CheckOutcome::healthy(format!("Responded in {}ms", latency.as_millis()))
                    .with_details(details)
            }
        }
    }

    fn alert_for(&self, status: HealthStatus) -> Option<AlertKind> {
        match (self.role, status) {
            (_, HealthStatus::Healthy) => None,
            (StoreRole::Database, HealthStatus::Degraded) => Some(AlertKind::DatabaseSlow),
            (StoreRole::Database, HealthStatus::Unhealthy) => Some(AlertKind::DatabaseUnavailable),
            (StoreRole::Cache, HealthStatus::Degraded) => Some(AlertKind::CacheSlow),
            (StoreRole::Cache, HealthStatus::Unhealthy) => Some(AlertKind::CacheUnavailable),
        }
    }
}

/// Checks the backlog of ready jobs and that the dispatcher is running.
pub struct QueueHealthCheck {
    queue: JobQueue,
    backlog: usize,
    backlog_critical: usize,
}

impl QueueHealthCheck {
    pub fn new(queue: JobQueue, backlog: usize, backlog_critical: usize) -> Self {
        Self {
            queue,
            backlog,
            backlog_critical,
        }
    }
}

#[async_trait]
impl HealthCheck for QueueHealthCheck {
    fn name(&self) -> &str {
        "job_queue"
    }

    async fn check(&self) -> CheckOutcome {
        let stats = match self.queue.stats() {
            Ok(stats) => stats,
            Err(err) => return CheckOutcome::unhealthy(format!("Queue state unavailable: {err}")),
        };
        let details = serde_json::to_value(&stats).unwrap_or_default();
        let ready = stats.ready_jobs;
        let outcome = if ready > self.backlog_critical {
            CheckOutcome::unhealthy(format!(
                "{ready} jobs waiting, above the critical backlog of {}",
                self.backlog_critical
            ))
        } else if ready > self.backlog {
            CheckOutcome::degraded(format!(
                "{ready} jobs waiting, above the backlog of {}",
                self.backlog
            ))
        } else if !self.queue.is_running() {
            CheckOutcome::degraded(format!("Dispatcher is not running, {ready} jobs waiting"))
        } else {
            CheckOutcome::healthy(format!(
                "{ready} jobs waiting, {} processing",
                stats.processing_jobs
            ))
        };
        outcome.with_details(details)
    }

    fn alert_for(&self, status: HealthStatus) -> Option<AlertKind> {
        match status {
            HealthStatus::Healthy => None,
            HealthStatus::Degraded | HealthStatus::Unhealthy => Some(AlertKind::QueueBacklog),
        }
    }
}

/// System memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryUsage {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// A source of [`MemoryUsage`]. Returns [`None`] when the statistics are unavailable.
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> Option<MemoryUsage>;
}

impl<F> MemorySampler for F
where
    F: Fn() -> Option<MemoryUsage> + Send + Sync,
{
    fn sample(&self) -> Option<MemoryUsage> {
        self()
    }
}

/// Reads memory usage from `/proc/meminfo`. Unavailable on platforms without procfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMeminfo;

impl MemorySampler for ProcMeminfo {
    fn sample(&self) -> Option<MemoryUsage> {
        let contents = std::fs::read_to_string("/proc/meminfo")
            .inspect_err(|err| tracing::debug!(?err, "Memory statistics unavailable: {err}"))
            .ok()?;
        parse_meminfo(&contents)
    }
}

fn parse_meminfo(contents: &str) -> Option<MemoryUsage> {
    let field = |name: &str| -> Option<u64> {
        contents
            .lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))?
            .split_whitespace()
            .next()?
            .parse::<u64>()
            .ok()
            .map(|kib| kib * 1024)
    };
    let total_bytes = field("MemTotal")?;
    let available = field("MemAvailable")?;
    Some(MemoryUsage {
        used_bytes: total_bytes.saturating_sub(available),
        total_bytes,
    })
}

/// Checks system memory usage against two percentages.
pub struct MemoryHealthCheck {
    sampler: Arc<dyn MemorySampler>,
    percent: f64,
    percent_critical: f64,
}

impl MemoryHealthCheck {
    pub fn new(sampler: Arc<dyn MemorySampler>, percent: f64, percent_critical: f64) -> Self {
        Self {
            sampler,
            percent,
            percent_critical,
        }
    }
}

#[async_trait]
impl HealthCheck for MemoryHealthCheck {
    fn name(&self) -> &str {
        "memory"
    }

    async fn check(&self) -> CheckOutcome {
        let Some(usage) = self.sampler.sample() else {
            return CheckOutcome::healthy("Memory statistics unavailable");
        };
        let percent = usage.percent();
        let details = json!({
            "used_bytes": usage.used_bytes,
            "total_bytes": usage.total_bytes,
            "percent": percent,
        });
        let outcome = if percent > self.percent_critical {
            CheckOutcome::unhealthy(format!("Memory usage at {percent:.1}%"))
        } else if percent > self.percent {
            CheckOutcome::degraded(format!("Memory usage at {percent:.1}%"))
        } else {
            CheckOutcome::healthy(format!("Memory usage at {percent:.1}%"))
        };
        outcome.with_details(details)
    }

    fn alert_for(&self, status: HealthStatus) -> Option<AlertKind> {
        match status {
            HealthStatus::Healthy => None,
            HealthStatus::Degraded | HealthStatus::Unhealthy => Some(AlertKind::HighMemoryUsage),
        }
    }
}
