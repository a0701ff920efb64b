use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How urgent an alert is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// The condition an alert reports. Each kind has a fixed [`Severity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    DatabaseUnavailable,
    DatabaseSlow,
    CacheUnavailable,
    CacheSlow,
    QueueBacklog,
    HighMemoryUsage,
    JobFailures,
    HighErrorRate,
    SlowResponses,
}

impl AlertKind {
    pub fn severity(&self) -> Severity {
        match self {
            Self::DatabaseUnavailable => Severity::Critical,
            Self::CacheUnavailable
            | Self::HighMemoryUsage
            | Self::JobFailures
            | Self::HighErrorRate => Severity::High,
            Self::DatabaseSlow | Self::QueueBacklog | Self::SlowResponses => Severity::Medium,
            Self::CacheSlow => Severity::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DatabaseUnavailable => "database_unavailable",
            Self::DatabaseSlow => "database_slow",
            Self::CacheUnavailable => "cache_unavailable",
            Self::CacheSlow => "cache_slow",
            Self::QueueBacklog => "queue_backlog",
            Self::HighMemoryUsage => "high_memory_usage",
            Self::JobFailures => "job_failures",
            Self::HighErrorRate => "high_error_rate",
            Self::SlowResponses => "slow_responses",
        }
    }
}

impl Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(Uuid);

impl AlertId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for AlertId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl Display for AlertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
    /// When the alert was created, or last triggered again while unresolved.
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A condition found to be breached, to be raised as an alert.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Breach {
    pub(crate) message: String,
    pub(crate) details: serde_json::Value,
}

impl Breach {
    pub(crate) fn new(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            message: message.into(),
            details,
        }
    }
}

/// All alerts, in creation order, with at most one unresolved alert per kind.
#[derive(Debug, Clone)]
pub(crate) struct AlertBook {
    alerts: Vec<Alert>,
    resolved_retention: usize,
}

impl AlertBook {
    pub(crate) fn new(resolved_retention: usize) -> Self {
        Self {
            alerts: Vec::new(),
            resolved_retention,
        }
    }

    fn unresolved_mut(&mut self, kind: AlertKind) -> Option<&mut Alert> {
        self.alerts
            .iter_mut()
            .find(|alert| alert.kind == kind && !alert.resolved)
    }

    /// Raises `kind`, updating the unresolved alert of that kind in place when there is one.
    ///
    /// Returns the alert when it was newly created.
    pub(crate) fn raise(
        &mut self,
        kind: AlertKind,
        breach: Breach,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        if let Some(alert) = self.unresolved_mut(kind) {
            alert.message = breach.message;
            alert.details = breach.details;
            alert.timestamp = now;
            return None;
        }
        let alert = Alert {
            id: AlertId::new(),
            kind,
            severity: kind.severity(),
            message: breach.message,
            details: breach.details,
            timestamp: now,
            resolved: false,
            resolved_at: None,
        };
        tracing::warn!(
            alert_id = %alert.id,
            %kind,
            severity = %alert.severity,
            "Alert raised: {}",
            alert.message
        );
        self.alerts.push(alert.clone());
        Some(alert)
    }

    /// Resolves the unresolved alert of `kind`, if any.
    pub(crate) fn clear(&mut self, kind: AlertKind, now: DateTime<Utc>) -> bool {
        let Some(alert) = self.unresolved_mut(kind) else {
            return false;
        };
        alert.resolved = true;
        alert.resolved_at = Some(now);
        tracing::info!(alert_id = %alert.id, %kind, "Alert {kind} cleared");
        self.prune();
        true
    }

    /// Raises `kind` when `breach` is set and clears it otherwise.
    pub(crate) fn evaluate(
        &mut self,
        kind: AlertKind,
        breach: Option<Breach>,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        match breach {
            Some(breach) => self.raise(kind, breach, now),
            None => {
                self.clear(kind, now);
                None
            }
        }
    }

    /// Returns whether the alert existed and was unresolved.
    pub(crate) fn resolve(&mut self, id: AlertId, now: DateTime<Utc>) -> bool {
        let Some(alert) = self
            .alerts
            .iter_mut()
            .find(|alert| alert.id == id && !alert.resolved)
        else {
            return false;
        };
        alert.resolved = true;
        alert.resolved_at = Some(now);
        tracing::info!(alert_id = %id, kind = %alert.kind, "Alert {id} resolved");
        self.prune();
        true
    }

    /// Alerts matching the `resolved` filter, newest first.
    pub(crate) fn list(&self, resolved: Option<bool>) -> Vec<Alert> {
        self.alerts
            .iter()
            .rev()
            .filter(|alert| resolved.map_or(true, |resolved| alert.resolved == resolved))
            .cloned()
            .collect()
    }

    pub(crate) fn unresolved(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(|alert| !alert.resolved)
    }

    pub(crate) fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub(crate) fn replace(&mut self, alerts: Vec<Alert>) {
        self.alerts = alerts;
        self.prune();
    }

    /// Drops the oldest resolved alerts beyond the retention.
    fn prune(&mut self) {
        let resolved = self.alerts.iter().filter(|alert| alert.resolved).count();
        let mut excess = resolved.saturating_sub(self.resolved_retention);
        if excess == 0 {
            return;
        }
        self.alerts.retain(|alert| {
            if alert.resolved && excess > 0 {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}
