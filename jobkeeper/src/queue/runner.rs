use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use crate::{
    job::{ErrorType, Job, JobError, JobId},
    registry::{BoxError, Processor},
};

use super::{Inner, COMPLETED_COUNTER, FAILED_COUNTER};

/// Keeps a job marked as in flight until dropped, whatever the outcome of the attempt.
pub(super) struct InFlightGuard {
    inner: Arc<Inner>,
    job_id: JobId,
}

impl InFlightGuard {
    pub(super) fn new(inner: Arc<Inner>, job_id: JobId) -> Self {
        Self { inner, job_id }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let job_id = self.job_id;
        match self.inner.state() {
            Ok(mut state) => state.finish(job_id),
            Err(err) => {
                tracing::error!(?err, %job_id, "Failed to release job {job_id}: {err}")
            }
        }
    }
}

struct Failure {
    error_type: ErrorType,
    message: String,
}

impl Failure {
    fn into_job_error(self, attempt: u16, recorded_at: DateTime<Utc>) -> JobError {
        JobError {
            attempt,
            error_type: self.error_type,
            message: self.message,
            recorded_at,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> Option<String> {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
}

/// Awaits a success or failure callback. Neither an error nor a panic in it changes the outcome
/// of the job.
async fn run_callback<F>(job_id: JobId, callback: &str, fut: F)
where
    F: Future<Output = Result<(), BoxError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::error!(?err, %job_id, "{callback} callback of job {job_id} failed: {err}")
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref()).unwrap_or_default();
            tracing::error!(%job_id, "{callback} callback of job {job_id} panicked: {message}")
        }
    }
}

pub(super) struct JobRunner {
    inner: Arc<Inner>,
}

impl JobRunner {
    pub(super) fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    #[instrument(skip(self, job, _guard), fields(job_id = %job.id, kind = %job.kind(), attempt = job.attempts))]
    pub(super) async fn execute_job(&self, job: Job, _guard: InFlightGuard) {
        let job_id = job.id;
        self.inner.persist_job(&job).await;

        let processor = self.inner.registry.get(job.kind()).unwrap_or_else(|err| {
            tracing::error!(?err, %job_id, "Failed to look up the processor for job {job_id}: {err}");
            None
        });
        let Some(processor) = processor else {
            let failure = Failure {
                error_type: ErrorType::MissingProcessor,
                message: format!("No processor registered for {}", job.kind()),
            };
            self.handle_job_error(None, job, failure).await;
            return;
        };

        let timeout = processor.timeout(&job);
        let fut = {
            let processor = processor.clone();
            let job = job.clone();
            async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, processor.process(&job))
                        .await
                        .map_err(|_| limit),
                    None => Ok(processor.process(&job).await),
                }
            }
        };

        tracing::debug!(%job_id, "Executing job {job_id}");
        match tokio::spawn(fut.in_current_span()).await {
            Ok(Ok(Ok(value))) => self.handle_job_complete(processor, job, value).await,
            Ok(Ok(Err(error))) => {
                self.handle_job_error(Some(processor), job, error.into())
                    .await
            }
            Ok(Err(limit)) => {
                self.handle_job_error(Some(processor), job, limit.into())
                    .await
            }
            Err(error) => {
                self.handle_job_error(Some(processor), job, error.into())
                    .await
            }
        }
    }

    async fn handle_job_complete(
        &self,
        processor: Arc<dyn Processor>,
        mut job: Job,
        result: serde_json::Value,
    ) {
        let job_id = job.id;
        job.completed_at = Some(Utc::now());
        job.result = Some(result.clone());
        run_callback(job_id, "Success", processor.on_success(&job, &result)).await;

        if let Err(err) = self.inner.state().map(|mut state| state.complete(job_id)) {
            tracing::error!(?err, %job_id, "Failed to mark job {job_id} as complete: {err}");
        }
        self.inner.forget_job(job_id, COMPLETED_COUNTER).await;
        tracing::debug!(%job_id, "Job complete {job_id}");
    }

    async fn handle_job_error(
        &self,
        processor: Option<Arc<dyn Processor>>,
        mut job: Job,
        failure: Failure,
    ) {
        let job_id = job.id;
        let now = Utc::now();
        let error = failure.into_job_error(job.attempts, now);

        match processor.as_ref().filter(|_| !job.is_exhausted()) {
            Some(processor) => {
                let delay = processor.backoff(job.attempts, self.inner.config.default_retry_delay);
                let scheduled_for = now
                    .checked_add_signed(delay)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                tracing::warn!(
                    %job_id,
                    ?error,
                    "Job {job_id} failed and will be retried in {delay}: error type: {}, message: {}",
                    error.error_type,
                    error.message
                );
                let rescheduled = self
                    .inner
                    .state()
                    .map(|mut state| state.reschedule(job_id, scheduled_for, error));
                match rescheduled {
                    Ok(Some(job)) => self.inner.persist_job(&job).await,
                    Ok(None) => tracing::debug!(%job_id, "Job {job_id} is no longer queued"),
                    Err(err) => tracing::error!(
                        ?err,
                        %job_id,
                        "Failed to mark job {job_id} as retryable: {err}"
                    ),
                }
            }
            None => {
                tracing::error!(
                    %job_id,
                    ?error,
                    "Job {job_id} failed and will be discarded: error type: {}, message: {}",
                    error.error_type,
                    error.message
                );
                job.failed_at = Some(now);
                job.last_error = Some(error.clone());
                if let Some(processor) = &processor {
                    run_callback(job_id, "Failure", processor.on_failure(&job, &error)).await;
                }
                if let Err(err) = self.inner.state().map(|mut state| state.fail(job_id)) {
                    tracing::error!(?err, %job_id, "Failed to mark job {job_id} as discarded: {err}");
                }
                self.inner.forget_job(job_id, FAILED_COUNTER).await;
            }
        }
    }

    /// Finishes a job that was swept from the queue with no attempts left.
    pub(super) async fn discard_exhausted(&self, mut job: Job) {
        let job_id = job.id;
        let now = Utc::now();
        let error = job.last_error.clone().unwrap_or_else(|| JobError {
            attempt: job.attempts,
            error_type: ErrorType::Handler,
            message: "No attempts left".to_owned(),
            recorded_at: now,
        });
        tracing::error!(%job_id, "Job {job_id} has no attempts left and will be discarded");
        job.failed_at = Some(now);

        if let Ok(Some(processor)) = self.inner.registry.get(job.kind()) {
            run_callback(job_id, "Failure", processor.on_failure(&job, &error)).await;
        }
        self.inner.forget_job(job_id, FAILED_COUNTER).await;
    }
}

impl From<JoinError> for Failure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic_message(panic.as_ref()).unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            error_type: ErrorType::Panic,
            message,
        }
    }
}

impl From<BoxError> for Failure {
    fn from(value: BoxError) -> Self {
        Self {
            error_type: ErrorType::Handler,
            message: value.to_string(),
        }
    }
}

impl From<Duration> for Failure {
    fn from(value: Duration) -> Self {
        Self {
            error_type: ErrorType::Timeout,
            message: format!("Job failed to complete within timeout: {value:?}"),
        }
    }
}
