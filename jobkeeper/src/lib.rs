//! An in-process background job queue with retries, plus health checks and alerting built on
//! top of it.
//!
//! Jobs are submitted to a [`queue::JobQueue`] with a typed [`job::JobPayload`] and processed by
//! the [`registry::Processor`] registered for their [`job::JobKind`]. Failed attempts are retried
//! with exponential backoff until the job runs out of attempts.
//!
//! A [`monitor::Monitor`] periodically runs health checks (including one of the queue itself),
//! records metrics and raises de-duplicated alerts, emailing the configured recipients through a
//! [`mailer::Mailer`] when an alert is critical.
//!
//! State is mirrored into an optional [`store::Store`] so that queued jobs, alerts and metrics can
//! be recovered after a restart.
use thiserror::Error;

pub mod backoff;
pub mod job;
pub mod mailer;
pub mod maintenance;
pub mod monitor;
pub mod prelude;
pub mod processors;
pub mod queue;
pub mod registry;
pub mod store;
pub mod testing;

use store::StoreError;

#[derive(Debug, Error)]
pub enum JobKeeperError {
    #[error("Internal state poisoned")]
    BadState,
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Invalid cron schedule {expression:?}: {message}")]
    InvalidSchedule { expression: String, message: String },
}
