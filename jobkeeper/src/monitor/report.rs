use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{queue::QueueStats, store::PersistenceStatus};

use super::{
    alert::Alert,
    health::{HealthCheckResult, HealthStatus},
    metrics::ApiUsageSnapshot,
};

/// The latest health check results and their rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub active_alerts: usize,
    pub critical_alerts: usize,
    /// [`None`] until the first monitor tick.
    pub last_check: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
}

/// A summary of the monitored system meant for operators.
///
/// The [`Display`] implementation renders it as plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub persistence: PersistenceStatus,
    pub checks: Vec<HealthCheckResult>,
    pub active_alerts: Vec<Alert>,
    pub recently_resolved: Vec<Alert>,
    pub queue: Option<QueueStats>,
    pub api: ApiUsageSnapshot,
    /// Number of metrics snapshots taken in the last hour.
    pub samples_last_hour: usize,
}

impl Display for HealthReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hours = self.uptime_secs / 3600;
        let minutes = (self.uptime_secs % 3600) / 60;
        writeln!(f, "Health report generated at {}", self.generated_at.to_rfc3339())?;
        writeln!(f, "Overall status: {}", self.status.to_string().to_uppercase())?;
        writeln!(f, "Uptime: {hours}h {minutes}m")?;
        writeln!(f, "Persistence: {}", self.persistence)?;

        writeln!(f)?;
        writeln!(f, "Checks:")?;
        if self.checks.is_empty() {
            writeln!(f, "  none run yet")?;
        }
        for check in &self.checks {
            writeln!(
                f,
                "  - {}: {} ({}ms) {}",
                check.name, check.status, check.duration_ms, check.message
            )?;
        }

        writeln!(f)?;
        writeln!(f, "Active alerts ({}):", self.active_alerts.len())?;
        for alert in &self.active_alerts {
            writeln!(
                f,
                "  - [{}] {}: {} (last seen {})",
                alert.severity,
                alert.kind,
                alert.message,
                alert.timestamp.to_rfc3339()
            )?;
        }
        if !self.recently_resolved.is_empty() {
            writeln!(f, "Recently resolved:")?;
            for alert in &self.recently_resolved {
                let resolved_at = alert
                    .resolved_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_default();
                writeln!(f, "  - {}: {} (resolved {resolved_at})", alert.kind, alert.message)?;
            }
        }

        writeln!(f)?;
        match &self.queue {
            Some(queue) => writeln!(
                f,
                "Job queue: {} queued, {} ready, {} processing, {} scheduled, {} completed, {} failed",
                queue.total_jobs,
                queue.ready_jobs,
                queue.processing_jobs,
                queue.scheduled_jobs,
                queue.completed_total,
                queue.failed_total
            )?,
            None => writeln!(f, "Job queue: unavailable")?,
        }
        writeln!(
            f,
            "API usage: {} requests, {} errors ({:.1}% error rate), {:.0}ms average response",
            self.api.requests,
            self.api.errors,
            self.api.error_rate * 100.0,
            self.api.average_response_ms
        )?;
        write!(f, "Metrics samples in the last hour: {}", self.samples_last_hour)
    }
}
