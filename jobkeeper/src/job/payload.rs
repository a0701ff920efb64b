use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mailer::Email;

/// The kind of a job, used to look up the [`crate::registry::Processor`] that handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    SendEmail,
    ConsultationReminder,
    Cleanup,
    RefreshLeaderboard,
    WarmCache,
    AggregateAnalytics,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        Self::SendEmail,
        Self::ConsultationReminder,
        Self::Cleanup,
        Self::RefreshLeaderboard,
        Self::WarmCache,
        Self::AggregateAnalytics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendEmail => "send_email",
            Self::ConsultationReminder => "consultation_reminder",
            Self::Cleanup => "cleanup",
            Self::RefreshLeaderboard => "refresh_leaderboard",
            Self::WarmCache => "warm_cache",
            Self::AggregateAnalytics => "aggregate_analytics",
        }
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The data of a job. Each variant is the payload shape of one [`JobKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    SendEmail(Email),
    ConsultationReminder(ConsultationReminder),
    Cleanup { target: CleanupTarget },
    RefreshLeaderboard,
    WarmCache { keys: Vec<String> },
    AggregateAnalytics { window_hours: u32 },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::SendEmail(_) => JobKind::SendEmail,
            Self::ConsultationReminder(_) => JobKind::ConsultationReminder,
            Self::Cleanup { .. } => JobKind::Cleanup,
            Self::RefreshLeaderboard => JobKind::RefreshLeaderboard,
            Self::WarmCache { .. } => JobKind::WarmCache,
            Self::AggregateAnalytics { .. } => JobKind::AggregateAnalytics,
        }
    }
}

/// Reminder sent ahead of a booked consultation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsultationReminder {
    pub consultation_id: String,
    pub email: String,
    pub name: String,
    pub starts_at: DateTime<Utc>,
}

/// The group of keys removed by a [`JobPayload::Cleanup`] job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTarget {
    ExpiredSessions,
    StaleCache,
    OldNotifications,
}

impl CleanupTarget {
    /// The key prefix, relative to the namespace, of the keys owned by this target.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Self::ExpiredSessions => "session:",
            Self::StaleCache => "cache:",
            Self::OldNotifications => "notification:",
        }
    }
}
