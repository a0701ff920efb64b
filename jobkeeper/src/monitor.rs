//! Health checks, metrics and alerting.
//!
//! A [`Monitor`] evaluates its [`HealthCheck`]s every tick, records a [`MetricsSnapshot`] and
//! raises de-duplicated [`Alert`]s. An unresolved alert of a kind is updated in place when the
//! condition is breached again, and resolved once a tick finds the condition cleared. Newly
//! created critical alerts are emailed to the configured recipients.
//!
//! ```
//! # use std::sync::Arc;
//! # use jobkeeper::prelude::*;
//! # use jobkeeper::store::memory::InMemoryStore;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
//! let queue = JobQueue::with_store(QueueConfig::default(), store.clone());
//! let monitor = Monitor::builder(queue.clone())
//!     .with_store(store.clone())
//!     .with_database(store)
//!     .with_mailer(Arc::new(LogMailer))
//!     .with_config(MonitorConfig::default().with_alert_recipients(["ops@example.com"]))
//!     .build();
//!
//! let status = monitor.check_now().await.unwrap();
//! println!("{}", monitor.generate_health_report().unwrap());
//! # assert_eq!(status.checks.len(), 3);
//! # });
//! ```
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    mailer::{Email, Mailer},
    queue::JobQueue,
    store::{mirror::Mirror, KeyType, Keyspace, PersistenceStatus, Store},
    JobKeeperError,
};

mod alert;
mod health;
mod metrics;
mod report;

pub use alert::{Alert, AlertId, AlertKind, Severity};
pub use health::{
    rollup, CheckOutcome, HealthCheck, HealthCheckResult, HealthStatus, MemoryHealthCheck,
    MemorySampler, MemoryUsage, ProcMeminfo, QueueHealthCheck, StoreHealthCheck,
};
pub use metrics::{ApiUsageSnapshot, CheckSummary, MetricsSnapshot, SystemMetrics};
pub use report::{HealthReport, SystemStatus};

use alert::{AlertBook, Breach};
use health::run_check;
use metrics::{ApiUsage, MetricsHistory};

const ALERTS: &str = "alerts";
const METRICS: &str = "metrics";

/// The limits the monitor's checks and alert rules compare against.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    /// Store round trips slower than this are degraded.
    pub store_latency: Duration,
    /// Ready jobs above which the queue is degraded.
    pub queue_backlog: usize,
    /// Ready jobs above which the queue is unhealthy.
    pub queue_backlog_critical: usize,
    pub memory_percent: f64,
    pub memory_percent_critical: f64,
    /// Terminal job failures between two ticks that raise [`AlertKind::JobFailures`].
    pub job_failures: u64,
    /// Error rate above which [`AlertKind::HighErrorRate`] is raised.
    pub error_rate: f64,
    /// Requests needed before the request based alerts are evaluated.
    pub min_requests: u64,
    /// Average response time above which [`AlertKind::SlowResponses`] is raised.
    pub slow_response: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            store_latency: Duration::from_millis(1000),
            queue_backlog: 100,
            queue_backlog_critical: 1000,
            memory_percent: 90.0,
            memory_percent_critical: 97.0,
            job_failures: 5,
            error_rate: 0.05,
            min_requests: 10,
            slow_response: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub(crate) interval: Duration,
    pub(crate) history_size: usize,
    pub(crate) resolved_retention: usize,
    pub(crate) retention_ttl: Duration,
    pub(crate) thresholds: Thresholds,
    pub(crate) alert_recipients: Vec<String>,
    pub(crate) alert_from: Option<String>,
    pub(crate) keyspace: Option<Keyspace>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            // A day of snapshots at the default interval.
            history_size: 1440,
            resolved_retention: 500,
            retention_ttl: Duration::from_secs(24 * 60 * 60),
            thresholds: Thresholds::default(),
            alert_recipients: Vec::new(),
            alert_from: None,
            keyspace: None,
        }
    }
}

impl MonitorConfig {
    pub fn with_interval(self, interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            ..self
        }
    }

    /// The number of metrics snapshots kept in memory.
    pub fn with_history_size(self, history_size: usize) -> Self {
        Self {
            history_size: history_size.max(1),
            ..self
        }
    }

    /// The number of resolved alerts kept, oldest dropped first.
    pub fn with_resolved_retention(self, resolved_retention: usize) -> Self {
        Self {
            resolved_retention,
            ..self
        }
    }

    /// How long persisted alerts and metrics live in the store.
    pub fn with_retention_ttl(self, retention_ttl: Duration) -> Self {
        Self {
            retention_ttl,
            ..self
        }
    }

    pub fn with_thresholds(self, thresholds: Thresholds) -> Self {
        Self { thresholds, ..self }
    }

    /// Addresses emailed when a critical alert is raised.
    pub fn with_alert_recipients<I, S>(self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            alert_recipients: recipients.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn with_alert_from(self, from: impl Into<String>) -> Self {
        Self {
            alert_from: Some(from.into()),
            ..self
        }
    }

    /// Defaults to the keyspace of the monitored queue.
    pub fn with_keyspace(self, keyspace: Keyspace) -> Self {
        Self {
            keyspace: Some(keyspace),
            ..self
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }
}

/// Assembles a [`Monitor`].
///
/// The database and cache checks are only added when a store is given for them. The queue and
/// memory checks are always added, followed by the checks given to [`MonitorBuilder::with_check`].
pub struct MonitorBuilder {
    queue: JobQueue,
    config: MonitorConfig,
    store: Option<Arc<dyn Store>>,
    database: Option<Arc<dyn Store>>,
    cache: Option<Arc<dyn Store>>,
    mailer: Option<Arc<dyn Mailer>>,
    memory_sampler: Arc<dyn MemorySampler>,
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl MonitorBuilder {
    fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            config: MonitorConfig::default(),
            store: None,
            database: None,
            cache: None,
            mailer: None,
            memory_sampler: Arc::new(ProcMeminfo),
            checks: Vec::new(),
        }
    }

    pub fn with_config(self, config: MonitorConfig) -> Self {
        Self { config, ..self }
    }

    /// Persists alerts and metrics into `store`.
    pub fn with_store(self, store: Arc<dyn Store>) -> Self {
        Self {
            store: Some(store),
            ..self
        }
    }

    pub fn with_database(self, store: Arc<dyn Store>) -> Self {
        Self {
            database: Some(store),
            ..self
        }
    }

    pub fn with_cache(self, store: Arc<dyn Store>) -> Self {
        Self {
            cache: Some(store),
            ..self
        }
    }

    /// Sends critical alerts. Without a mailer they are only logged.
    pub fn with_mailer(self, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            mailer: Some(mailer),
            ..self
        }
    }

    pub fn with_memory_sampler(self, memory_sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            memory_sampler,
            ..self
        }
    }

    pub fn with_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn build(self) -> Monitor {
        let keyspace = self
            .config
            .keyspace
            .clone()
            .unwrap_or_else(|| self.queue.config().keyspace().clone());
        let thresholds = &self.config.thresholds;

        let mut checks: Vec<Arc<dyn HealthCheck>> = Vec::new();
        if let Some(database) = self.database {
            checks.push(Arc::new(StoreHealthCheck::database(
                database,
                &keyspace,
                thresholds.store_latency,
            )));
        }
        if let Some(cache) = self.cache {
            checks.push(Arc::new(StoreHealthCheck::cache(
                cache,
                &keyspace,
                thresholds.store_latency,
            )));
        }
        checks.push(Arc::new(QueueHealthCheck::new(
            self.queue.clone(),
            thresholds.queue_backlog,
            thresholds.queue_backlog_critical,
        )));
        checks.push(Arc::new(MemoryHealthCheck::new(
            self.memory_sampler.clone(),
            thresholds.memory_percent,
            thresholds.memory_percent_critical,
        )));
        checks.extend(self.checks);

        let now = Utc::now();
        let failed_total = self
            .queue
            .stats()
            .map(|stats| stats.failed_total)
            .unwrap_or_default();
        let state = MonitorState {
            results: Vec::new(),
            alerts: AlertBook::new(self.config.resolved_retention),
            history: MetricsHistory::new(self.config.history_size),
            api: ApiUsage::new(now),
            failed_total,
            last_check: None,
        };

        Monitor {
            inner: Arc::new(MonitorInner {
                mirror: Mirror::new(self.store, keyspace),
                persisting: Default::default(),
                config: self.config,
                queue: self.queue,
                checks,
                mailer: self.mailer,
                memory_sampler: self.memory_sampler,
                started_at: now,
                state: Mutex::new(state),
                ticker: Default::default(),
            }),
        }
    }
}

/// A cloneable handle to the monitoring of a [`JobQueue`] and the stores it depends on.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("config", &self.inner.config)
            .field("checks", &self.inner.checks.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

struct MonitorInner {
    config: MonitorConfig,
    queue: JobQueue,
    checks: Vec<Arc<dyn HealthCheck>>,
    mailer: Option<Arc<dyn Mailer>>,
    mirror: Mirror,
    /// Held from taking a snapshot of the state until it is written, so that an older snapshot
    /// never overwrites a newer one.
    persisting: tokio::sync::Mutex<()>,
    memory_sampler: Arc<dyn MemorySampler>,
    started_at: DateTime<Utc>,
    state: Mutex<MonitorState>,
    ticker: Mutex<Option<Ticker>>,
}

struct MonitorState {
    results: Vec<HealthCheckResult>,
    alerts: AlertBook,
    history: MetricsHistory,
    api: ApiUsage,
    /// The queue's terminal failures at the previous tick.
    failed_total: u64,
    last_check: Option<DateTime<Utc>>,
}

struct Ticker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorInner {
    fn state(&self) -> Result<MutexGuard<'_, MonitorState>, JobKeeperError> {
        self.state.lock().map_err(|_| JobKeeperError::BadState)
    }

    fn uptime_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.started_at).num_seconds().try_into().unwrap_or(0)
    }

    /// Writes the current alerts, and the metrics history when `with_metrics` is set.
    async fn persist(&self, with_metrics: bool) {
        let _persisting = self.persisting.lock().await;
        let snapshot = self.state().map(|state| {
            (
                state.alerts.alerts().to_vec(),
                with_metrics.then(|| state.history.to_vec()),
            )
        });
        let (alerts, metrics) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::error!(?err, "Failed to read the monitor state to persist: {err}");
                return;
            }
        };
        let ttl = Some(self.config.retention_ttl);
        self.mirror
            .put(KeyType::Monitor(ALERTS), alerts.as_slice(), ttl)
            .await;
        if let Some(metrics) = metrics {
            self.mirror
                .put(KeyType::Monitor(METRICS), metrics.as_slice(), ttl)
                .await;
        }
    }

    async fn notify(&self, alert: &Alert) {
        let Some(mailer) = &self.mailer else {
            tracing::warn!(alert_id = %alert.id, "No mailer configured for critical alert {}", alert.kind);
            return;
        };
        let subject = format!("[CRITICAL] {}: {}", alert.kind, alert.message);
        let html = format!(
            "<h2>Critical alert: {kind}</h2><p>{message}</p><p>Raised at {timestamp}</p><pre>{details}</pre>",
            kind = alert.kind,
            message = alert.message,
            timestamp = alert.timestamp.to_rfc3339(),
            details = alert.details,
        );
        let text = format!(
            "Critical alert {}: {} (raised at {})",
            alert.kind,
            alert.message,
            alert.timestamp.to_rfc3339()
        );
        for recipient in &self.config.alert_recipients {
            let mut email = Email::new(recipient, &subject, &html).with_text(&text);
            if let Some(from) = &self.config.alert_from {
                email = email.with_from(from);
            }
            let _ = mailer.send_email(&email).await.inspect_err(|err| {
                tracing::error!(
                    ?err,
                    alert_id = %alert.id,
                    %recipient,
                    "Failed to send critical alert to {recipient}: {err}"
                )
            });
        }
    }
}

impl Monitor {
    pub fn builder(queue: JobQueue) -> MonitorBuilder {
        MonitorBuilder::new(queue)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Runs every check and evaluates every alert rule once.
    pub async fn check_now(&self) -> Result<SystemStatus, JobKeeperError> {
        let inner = &self.inner;
        let results =
            futures::future::join_all(inner.checks.iter().map(|check| run_check(check.as_ref())))
                .await;
        let now = Utc::now();
        let queue = inner
            .queue
            .stats()
            .inspect_err(|err| tracing::error!(?err, "Failed to read queue stats: {err}"))
            .ok();
        let memory = inner.memory_sampler.sample();
        let thresholds = &inner.config.thresholds;

        let (status, created) = {
            let mut state = inner.state()?;
            let mut created = Vec::new();

            // Several checks may map to the same kind, which stays raised while any of them
            // breaches it.
            let mut watched = BTreeSet::new();
            let mut breaches = Vec::new();
            for (check, result) in inner.checks.iter().zip(&results) {
                watched.extend(
                    [HealthStatus::Degraded, HealthStatus::Unhealthy]
                        .into_iter()
                        .filter_map(|status| check.alert_for(status)),
                );
                if let Some(kind) = check.alert_for(result.status) {
                    let breach = Breach::new(
                        format!("{}: {}", result.name, result.message),
                        result.details.clone(),
                    );
                    breaches.push((kind, breach));
                }
            }
            for kind in watched {
                if !breaches.iter().any(|(breached, _)| *breached == kind) {
                    state.alerts.clear(kind, now);
                }
            }
            for (kind, breach) in breaches {
                created.extend(state.alerts.raise(kind, breach, now));
            }

            if let Some(queue) = &queue {
                let failures = queue.failed_total.saturating_sub(state.failed_total);
                state.failed_total = queue.failed_total;
                let breach = (failures >= thresholds.job_failures).then(|| {
                    Breach::new(
                        format!("{failures} jobs failed permanently since the last check"),
                        json!({ "failures": failures, "failed_total": queue.failed_total }),
                    )
                });
                created.extend(state.alerts.evaluate(AlertKind::JobFailures, breach, now));
            }

            let api = state.api.snapshot(now);
            let enough_requests = api.requests >= thresholds.min_requests;
            let breach = (enough_requests && api.error_rate > thresholds.error_rate).then(|| {
                Breach::new(
                    format!(
                        "Error rate {:.1}% above {:.1}%",
                        api.error_rate * 100.0,
                        thresholds.error_rate * 100.0
                    ),
                    json!({ "requests": api.requests, "errors": api.errors, "error_rate": api.error_rate }),
                )
            });
            created.extend(state.alerts.evaluate(AlertKind::HighErrorRate, breach, now));
            let slow_response_ms = thresholds.slow_response.as_secs_f64() * 1000.0;
            let breach = (enough_requests && api.average_response_ms > slow_response_ms).then(|| {
                Breach::new(
                    format!(
                        "Average response time {:.0}ms above {:.0}ms",
                        api.average_response_ms, slow_response_ms
                    ),
                    json!({ "requests": api.requests, "average_response_ms": api.average_response_ms }),
                )
            });
            created.extend(state.alerts.evaluate(AlertKind::SlowResponses, breach, now));

            state.history.push(MetricsSnapshot {
                timestamp: now,
                system: SystemMetrics {
                    uptime_secs: inner.uptime_secs(now),
                    memory,
                },
                checks: results
                    .iter()
                    .map(|result| {
                        (
                            result.name.clone(),
                            CheckSummary {
                                status: result.status,
                                duration_ms: result.duration_ms,
                            },
                        )
                    })
                    .collect::<BTreeMap<_, _>>(),
                queue,
                api,
            });
            state.results = results;
            state.last_check = Some(now);

            (self.status_of(&state, now), created)
        };

        tracing::debug!(status = %status.status, "Health check completed");
        inner.persist(true).await;
        for alert in created
            .iter()
            .filter(|alert| alert.severity == Severity::Critical)
        {
            inner.notify(alert).await;
        }
        Ok(status)
    }

    fn status_of(&self, state: &MonitorState, now: DateTime<Utc>) -> SystemStatus {
        let active = state.alerts.unresolved().count();
        let critical = state
            .alerts
            .unresolved()
            .filter(|alert| alert.severity == Severity::Critical)
            .count();
        SystemStatus {
            status: rollup(state.results.iter().map(|result| result.status)),
            checks: state.results.clone(),
            active_alerts: active,
            critical_alerts: critical,
            last_check: state.last_check,
            uptime_secs: self.inner.uptime_secs(now),
        }
    }

    /// Runs [`Monitor::check_now`] every interval, starting immediately. Calling it on a running
    /// monitor does nothing.
    pub fn start(&self) -> Result<(), JobKeeperError> {
        let mut ticker = self
            .inner
            .ticker
            .lock()
            .map_err(|_| JobKeeperError::BadState)?;
        if ticker.is_some() {
            tracing::warn!("Monitor is already running");
            return Ok(());
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let monitor = self.clone();
            let token = token.clone();
            async move { monitor.run(token).await }
        });
        *ticker = Some(Ticker { token, handle });
        tracing::info!(
            interval = ?self.inner.config.interval,
            checks = self.inner.checks.len(),
            "Monitor started"
        );
        Ok(())
    }

    async fn run(self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let _ = self
                        .check_now()
                        .await
                        .inspect_err(|err| tracing::error!(?err, "Health check failed: {err}"));
                },
                _ = token.cancelled() => {
                    break;
                }
            }
        }
        tracing::debug!("Shutting down the monitor");
    }

    pub async fn stop(&self) -> Result<(), JobKeeperError> {
        let ticker = self
            .inner
            .ticker
            .lock()
            .map_err(|_| JobKeeperError::BadState)?
            .take();
        if let Some(Ticker { token, handle }) = ticker {
            token.cancel();
            handle
                .await
                .map_err(|_| JobKeeperError::GracefulShutdownFailed)?;
            tracing::info!("Monitor stopped");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .ticker
            .lock()
            .map(|ticker| ticker.is_some())
            .unwrap_or(false)
    }

    /// The results of the last tick. Healthy with no checks before the first one.
    pub fn system_status(&self) -> Result<SystemStatus, JobKeeperError> {
        let state = self.inner.state()?;
        Ok(self.status_of(&state, Utc::now()))
    }

    /// Alerts newest first, optionally only the resolved or unresolved ones.
    pub fn alerts(&self, resolved: Option<bool>) -> Result<Vec<Alert>, JobKeeperError> {
        Ok(self.inner.state()?.alerts.list(resolved))
    }

    /// Marks an unresolved alert as resolved. Returns `false` when there is no such alert.
    pub async fn resolve_alert(&self, id: AlertId) -> bool {
        let resolved = match self.inner.state() {
            Ok(mut state) => state.alerts.resolve(id, Utc::now()),
            Err(err) => {
                tracing::error!(?err, alert_id = %id, "Failed to resolve alert {id}: {err}");
                false
            }
        };
        if resolved {
            self.inner.persist(false).await;
        }
        resolved
    }

    /// Snapshots from the last `window_minutes`, oldest first.
    pub fn metrics(&self, window_minutes: u32) -> Result<Vec<MetricsSnapshot>, JobKeeperError> {
        let cutoff = Utc::now() - TimeDelta::minutes(window_minutes.into());
        Ok(self.inner.state()?.history.since(cutoff))
    }

    pub fn api_usage(&self) -> Result<ApiUsageSnapshot, JobKeeperError> {
        Ok(self.inner.state()?.api.snapshot(Utc::now()))
    }

    /// Accounts one handled request. Counters reset once an hour.
    pub fn record_request(&self, response_time: Duration, is_error: bool) {
        match self.inner.state() {
            Ok(mut state) => state.api.record(response_time, is_error, Utc::now()),
            Err(err) => tracing::error!(?err, "Failed to record request: {err}"),
        }
    }

    pub fn persistence_status(&self) -> PersistenceStatus {
        self.inner.mirror.status()
    }

    pub fn generate_health_report(&self) -> Result<HealthReport, JobKeeperError> {
        let now = Utc::now();
        let queue = self
            .inner
            .queue
            .stats()
            .inspect_err(|err| tracing::warn!(?err, "Queue stats unavailable for report: {err}"))
            .ok();
        let mut state = self.inner.state()?;
        Ok(HealthReport {
            generated_at: now,
            status: rollup(state.results.iter().map(|result| result.status)),
            uptime_secs: self.inner.uptime_secs(now),
            persistence: self.inner.mirror.status(),
            checks: state.results.clone(),
            active_alerts: state.alerts.list(Some(false)),
            recently_resolved: state.alerts.list(Some(true)).into_iter().take(5).collect(),
            queue,
            api: state.api.snapshot(now),
            samples_last_hour: state.history.since(now - TimeDelta::hours(1)).len(),
        })
    }

    /// Loads the alerts and metrics persisted by a previous process, replacing the ones held in
    /// memory.
    pub async fn restore(&self) -> Result<(), JobKeeperError> {
        let alerts: Option<Vec<Alert>> = self.inner.mirror.get(KeyType::Monitor(ALERTS)).await;
        let metrics: Option<Vec<MetricsSnapshot>> =
            self.inner.mirror.get(KeyType::Monitor(METRICS)).await;
        let mut state = self.inner.state()?;
        if let Some(alerts) = alerts {
            tracing::info!("Restored {} alerts", alerts.len());
            state.alerts.replace(alerts);
        }
        if let Some(metrics) = metrics {
            tracing::info!("Restored {} metrics snapshots", metrics.len());
            state.history.replace(metrics);
        }
        Ok(())
    }
}
