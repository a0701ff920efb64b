//! The job record and the types it is made of.
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod builder;
pub mod payload;

pub use builder::JobOptions;
pub use payload::{CleanupTarget, JobKind, JobPayload};

/// Unique identifier of a job, generated when the job is submitted.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The priority of a job. Jobs with a higher priority are dispatched first.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A unit of work owned by the [`crate::queue::JobQueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub priority: Priority,
    /// The number of times the job has been picked up for processing.
    pub attempts: u16,
    pub max_attempts: u16,
    pub created_at: DateTime<Utc>,
    /// The job is not eligible for processing before this time.
    pub scheduled_for: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<JobError>,
    pub result: Option<serde_json::Value>,
}

impl Job {
    pub(crate) fn new(
        payload: JobPayload,
        options: &JobOptions,
        default_max_attempts: u16,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            payload,
            priority: options.priority,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(default_max_attempts).max(1),
            created_at: now,
            scheduled_for: options.scheduled_for(now).max(now),
            processed_at: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
            result: None,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for <= now && !self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub(crate) fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        self.processed_at = Some(now);
    }
}

/// A record of the error returned by the last failed attempt of a job.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// The attempt when this error occurred.
    pub attempt: u16,
    pub error_type: ErrorType,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Classification of the ways a job attempt can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// The processor returned an error.
    Handler,
    /// The processor panicked.
    Panic,
    /// The processor did not finish within [`crate::registry::Processor::timeout`].
    Timeout,
    /// No processor is registered for the job's kind.
    MissingProcessor,
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Handler => "handler",
            Self::Panic => "panic",
            Self::Timeout => "timeout",
            Self::MissingProcessor => "missing_processor",
        };
        f.write_str(name)
    }
}
