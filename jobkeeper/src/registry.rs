//! Processors and the registry mapping each [`JobKind`] to the processor that handles it.
use std::{collections::HashMap, error::Error, sync::Arc, sync::RwLock, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;

use crate::{
    backoff::{BackoffStrategy, Strategy},
    job::{Job, JobError, JobKind},
    JobKeeperError,
};

/// The error type returned by processors and their callbacks.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Executes the jobs of one or more [`JobKind`]s.
///
/// # Example
///
/// ```
/// # use jobkeeper::prelude::*;
/// struct RefreshLeaderboard;
///
/// #[async_trait::async_trait]
/// impl Processor for RefreshLeaderboard {
///     async fn process(&self, _job: &Job) -> Result<serde_json::Value, BoxError> {
///         Ok(serde_json::json!({ "entries": 10 }))
///     }
///
///     fn max_attempts(&self) -> Option<u16> {
///         Some(5)
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Runs the job. An error fails the current attempt.
    async fn process(&self, job: &Job) -> Result<serde_json::Value, BoxError>;

    /// Called once the job completed. Errors are logged and do not affect the job.
    async fn on_success(&self, _job: &Job, _result: &serde_json::Value) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called once the job failed for the last time. Errors are logged.
    async fn on_failure(&self, _job: &Job, _error: &JobError) -> Result<(), BoxError> {
        Ok(())
    }

    /// The number of attempts for jobs submitted without an explicit maximum.
    ///
    /// When [`None`] the queue's default is used.
    fn max_attempts(&self) -> Option<u16> {
        None
    }

    /// The base delay for the default exponential backoff.
    ///
    /// When [`None`] the queue's default is used.
    fn retry_delay(&self) -> Option<TimeDelta> {
        None
    }

    /// How long to wait before retrying after `attempt` failed.
    ///
    /// Defaults to `retry_delay × 2^(attempt − 1)`.
    fn backoff(&self, attempt: u16, default_retry_delay: TimeDelta) -> TimeDelta {
        BackoffStrategy::exponential(self.retry_delay().unwrap_or(default_retry_delay))
            .backoff(attempt)
    }

    /// Maximum duration of a single attempt. No limit by default.
    fn timeout(&self, _job: &Job) -> Option<Duration> {
        None
    }
}

/// The processors known to a queue, at most one per [`JobKind`].
#[derive(Default)]
pub struct Registry {
    processors: RwLock<HashMap<JobKind, Arc<dyn Processor>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `processor` for `kind`, returning the processor it replaced, if any.
    pub fn register(
        &self,
        kind: JobKind,
        processor: Arc<dyn Processor>,
    ) -> Result<Option<Arc<dyn Processor>>, JobKeeperError> {
        let previous = self
            .processors
            .write()
            .map_err(|_| JobKeeperError::BadState)?
            .insert(kind, processor);
        if previous.is_some() {
            tracing::warn!(%kind, "Replacing the processor registered for {kind}");
        } else {
            tracing::debug!(%kind, "Registered processor for {kind}");
        }
        Ok(previous)
    }

    pub fn get(&self, kind: JobKind) -> Result<Option<Arc<dyn Processor>>, JobKeeperError> {
        Ok(self
            .processors
            .read()
            .map_err(|_| JobKeeperError::BadState)?
            .get(&kind)
            .cloned())
    }

    pub fn kinds(&self) -> Result<Vec<JobKind>, JobKeeperError> {
        let mut kinds: Vec<_> = self
            .processors
            .read()
            .map_err(|_| JobKeeperError::BadState)?
            .keys()
            .copied()
            .collect();
        kinds.sort();
        Ok(kinds)
    }
}
