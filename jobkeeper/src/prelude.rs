//! The purpose of this module is to alleviate the need to import many of the `[jobkeeper]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobkeeper::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::job::{
    CleanupTarget, Job, JobError, JobId, JobKind, JobOptions, JobPayload, Priority,
};
pub use crate::mailer::{Email, LogMailer, Mailer, MailerError};
pub use crate::maintenance::{daily_maintenance, hourly_updates, MaintenanceScheduler};
pub use crate::monitor::{
    Alert, AlertId, AlertKind, CheckOutcome, HealthCheck, HealthStatus, Monitor, MonitorConfig,
    Severity, Thresholds,
};
pub use crate::processors::{CleanupProcessor, EmailProcessor};
pub use crate::queue::{JobQueue, QueueConfig, QueueStats};
pub use crate::registry::{BoxError, Processor};
pub use crate::store::{Keyspace, PersistenceStatus, Store};
pub use crate::JobKeeperError;
