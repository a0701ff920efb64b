//! The job queue: submission, dispatch and the lifecycle of jobs.
//!
//! A [`JobQueue`] keeps its jobs in memory, ordered by priority and then by the time they are
//! scheduled for, and mirrors them into an optional [`Store`] so they can be recovered by a later
//! process with [`JobQueue::recover`].
//!
//! ```
//! # use jobkeeper::prelude::*;
//! # use std::time::Duration;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let queue = JobQueue::new(QueueConfig::default().with_max_concurrent_jobs(2));
//!
//! let job_id = queue
//!     .add_job(
//!         JobPayload::RefreshLeaderboard,
//!         JobOptions::default().with_delay(Duration::from_secs(60)),
//!     )
//!     .await
//!     .unwrap();
//!
//! assert!(queue.get_job(job_id).unwrap().is_some());
//! assert_eq!(queue.stats().unwrap().scheduled_jobs, 1);
//! # });
//! ```
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    job::{Job, JobId, JobKind, JobOptions, JobPayload},
    registry::{Processor, Registry},
    store::{mirror::Mirror, KeyType, Keyspace, PersistenceStatus, Store},
    JobKeeperError,
};

mod runner;
mod state;
mod stats;

use runner::{InFlightGuard, JobRunner};
use state::QueueState;
pub use stats::QueueStats;

pub(crate) const COMPLETED_COUNTER: &str = "completed";
pub(crate) const FAILED_COUNTER: &str = "failed";

/// Configuration of a [`JobQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub(crate) poll_interval: Duration,
    pub(crate) max_concurrent_jobs: usize,
    pub(crate) default_max_attempts: u16,
    pub(crate) default_retry_delay: TimeDelta,
    pub(crate) job_ttl: Duration,
    pub(crate) keyspace: Keyspace,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_concurrent_jobs: 5,
            default_max_attempts: 3,
            default_retry_delay: TimeDelta::seconds(1),
            job_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            keyspace: Keyspace::default(),
        }
    }
}

impl QueueConfig {
    /// How often the dispatcher looks for ready jobs.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            ..self
        }
    }

    /// The maximum number of jobs processed at the same time. At least one.
    pub fn with_max_concurrent_jobs(self, max_concurrent_jobs: usize) -> Self {
        Self {
            max_concurrent_jobs: max_concurrent_jobs.max(1),
            ..self
        }
    }

    pub fn with_default_max_attempts(self, default_max_attempts: u16) -> Self {
        Self {
            default_max_attempts: default_max_attempts.max(1),
            ..self
        }
    }

    /// The base delay of the default backoff for processors without their own.
    pub fn with_default_retry_delay(self, default_retry_delay: TimeDelta) -> Self {
        Self {
            default_retry_delay,
            ..self
        }
    }

    /// How long a mirrored job is kept in the store.
    pub fn with_job_ttl(self, job_ttl: Duration) -> Self {
        Self { job_ttl, ..self }
    }

    pub fn with_keyspace(self, keyspace: Keyspace) -> Self {
        Self { keyspace, ..self }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }
}

/// A cloneable handle to an in-process job queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

struct Inner {
    config: QueueConfig,
    registry: Registry,
    mirror: Mirror,
    state: Mutex<QueueState>,
    tracker: TaskTracker,
    dispatcher: Mutex<Option<Dispatcher>>,
}

struct Dispatcher {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Inner {
    fn state(&self) -> Result<MutexGuard<'_, QueueState>, JobKeeperError> {
        self.state.lock().map_err(|_| JobKeeperError::BadState)
    }

    async fn persist_job(&self, job: &Job) {
        let key = job.id.to_string();
        self.mirror
            .put(KeyType::Job(&key), job, Some(self.config.job_ttl))
            .await;
    }

    async fn forget_job(&self, job_id: JobId, counter: &str) {
        let key = job_id.to_string();
        self.mirror.remove(KeyType::Job(&key)).await;
        self.mirror.increment(KeyType::Counter(counter)).await;
    }
}

impl JobQueue {
    /// A queue that only keeps its jobs in memory.
    pub fn new(config: QueueConfig) -> Self {
        Self::build(config, None)
    }

    /// A queue that mirrors its jobs and lifetime counters into `store`.
    pub fn with_store(config: QueueConfig, store: Arc<dyn Store>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: QueueConfig, store: Option<Arc<dyn Store>>) -> Self {
        let mirror = Mirror::new(store, config.keyspace.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Registry::new(),
                mirror,
                state: Default::default(),
                tracker: TaskTracker::new(),
                dispatcher: Default::default(),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Registers the processor for `kind`, returning the one it replaced.
    pub fn register_processor(
        &self,
        kind: JobKind,
        processor: Arc<dyn Processor>,
    ) -> Result<Option<Arc<dyn Processor>>, JobKeeperError> {
        self.inner.registry.register(kind, processor)
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Submits a job. It is mirrored to the store before it becomes visible to the dispatcher.
    ///
    /// Without an explicit maximum in `options` the number of attempts is taken from the
    /// processor registered for the job's kind, and then from the queue's default.
    pub async fn add_job(
        &self,
        payload: JobPayload,
        options: JobOptions,
    ) -> Result<JobId, JobKeeperError> {
        let kind = payload.kind();
        let default_max_attempts = self
            .inner
            .registry
            .get(kind)?
            .and_then(|processor| processor.max_attempts())
            .unwrap_or(self.inner.config.default_max_attempts);
        let job = Job::new(payload, &options, default_max_attempts, Utc::now());
        let job_id = job.id;

        self.inner.persist_job(&job).await;
        tracing::debug!(
            %job_id,
            %kind,
            priority = %job.priority,
            "Queued job {job_id} of kind {kind} for {}",
            job.scheduled_for
        );
        self.inner.state()?.insert(job);
        Ok(job_id)
    }

    /// Runs a single dispatch tick, returning the number of jobs launched.
    ///
    /// Launched jobs run in the background; [`JobQueue::stop`] waits for them.
    pub fn dispatch(&self) -> Result<usize, JobKeeperError> {
        let (exhausted, ready) = {
            let mut state = self.inner.state()?;
            let exhausted = state.take_exhausted();
            let ready = state.select_ready(Utc::now(), self.inner.config.max_concurrent_jobs);
            (exhausted, ready)
        };

        for job in exhausted {
            let runner = JobRunner::new(self.inner.clone());
            self.inner
                .tracker
                .spawn(async move { runner.discard_exhausted(job).await });
        }

        let launched = ready.len();
        for job in ready {
            let guard = InFlightGuard::new(self.inner.clone(), job.id);
            let runner = JobRunner::new(self.inner.clone());
            self.inner
                .tracker
                .spawn(async move { runner.execute_job(job, guard).await });
        }
        if launched > 0 {
            tracing::debug!("Dispatched {launched} jobs");
        }
        Ok(launched)
    }

    /// Starts dispatching every poll interval. Calling it on a running queue does nothing.
    pub fn start(&self) -> Result<(), JobKeeperError> {
        let mut dispatcher = self
            .inner
            .dispatcher
            .lock()
            .map_err(|_| JobKeeperError::BadState)?;
        if dispatcher.is_some() {
            tracing::warn!("Job queue is already running");
            return Ok(());
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let queue = self.clone();
            let token = token.clone();
            async move { queue.run(token).await }
        });
        *dispatcher = Some(Dispatcher { token, handle });
        tracing::info!(
            poll_interval = ?self.inner.config.poll_interval,
            max_concurrent_jobs = self.inner.config.max_concurrent_jobs,
            "Job queue started"
        );
        Ok(())
    }

    async fn run(self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let _ = self
                        .dispatch()
                        .inspect_err(|err| tracing::error!(?err, "Failed to dispatch jobs: {err}"));
                },
                _ = token.cancelled() => {
                    break;
                }
            }
        }
        tracing::debug!("Shutting down the job dispatcher");
    }

    /// Stops the dispatcher and waits for every launched job to finish.
    ///
    /// Jobs that were not dispatched yet stay queued and mirrored. The queue can be started
    /// again afterwards.
    pub async fn stop(&self) -> Result<(), JobKeeperError> {
        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .map_err(|_| JobKeeperError::BadState)?
            .take();
        if let Some(Dispatcher { token, handle }) = dispatcher {
            token.cancel();
            handle
                .await
                .map_err(|_| JobKeeperError::GracefulShutdownFailed)?;
        }
        self.wait_for_jobs().await;
        tracing::info!("Job queue stopped");
        Ok(())
    }

    async fn wait_for_jobs(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .dispatcher
            .lock()
            .map(|dispatcher| dispatcher.is_some())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> Result<QueueStats, JobKeeperError> {
        let mut stats = self.inner.state()?.stats(Utc::now());
        stats.persistence = self.inner.mirror.status();
        Ok(stats)
    }

    pub fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobKeeperError> {
        Ok(self.inner.state()?.get(job_id).cloned())
    }

    pub fn persistence_status(&self) -> PersistenceStatus {
        self.inner.mirror.status()
    }

    /// Loads the jobs mirrored by a previous process, returning how many were queued.
    pub async fn recover(&self) -> Result<usize, JobKeeperError> {
        let jobs: Vec<Job> = self.inner.mirror.load_all(KeyType::JobPrefix).await;
        let mut state = self.inner.state()?;
        let mut recovered = 0;
        for job in jobs {
            if !state.contains(job.id) && !state.is_in_flight(job.id) {
                state.insert(job);
                recovered += 1;
            }
        }
        tracing::info!("Recovered {recovered} persisted jobs");
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::*;
    use crate::{
        job::{CleanupTarget, ErrorType, JobError, Priority},
        registry::{test::MockProcessor, BoxError},
        store::memory::InMemoryStore,
        testing::FailingStore,
    };

    /// Fails every attempt, recording the attempt numbers it saw.
    #[derive(Default)]
    struct AlwaysFails {
        attempts: Mutex<Vec<u16>>,
        failures: Mutex<Vec<JobError>>,
        retry_delay: Option<TimeDelta>,
    }

    #[async_trait]
    impl Processor for AlwaysFails {
        async fn process(&self, job: &Job) -> Result<serde_json::Value, BoxError> {
            self.attempts.lock().unwrap().push(job.attempts);
            Err("always fails".into())
        }

        async fn on_failure(&self, _job: &Job, error: &JobError) -> Result<(), BoxError> {
            self.failures.lock().unwrap().push(error.clone());
            Ok(())
        }

        fn retry_delay(&self) -> Option<TimeDelta> {
            Some(self.retry_delay.unwrap_or(TimeDelta::zero()))
        }
    }

    /// Succeeds after a short pause, recording the order of jobs and any overlap.
    #[derive(Default)]
    struct Recording {
        order: Mutex<Vec<JobId>>,
        active: Mutex<HashSet<JobId>>,
        overlap: AtomicBool,
        successes: AtomicUsize,
        pause: Duration,
    }

    #[async_trait]
    impl Processor for Recording {
        async fn process(&self, job: &Job) -> Result<serde_json::Value, BoxError> {
            self.order.lock().unwrap().push(job.id);
            if !self.active.lock().unwrap().insert(job.id) {
                self.overlap.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(self.pause).await;
            self.active.lock().unwrap().remove(&job.id);
            Ok(serde_json::json!({ "ok": true }))
        }

        async fn on_success(&self, _job: &Job, _result: &serde_json::Value) -> Result<(), BoxError> {
            self.successes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl Processor for Panics {
        async fn process(&self, _job: &Job) -> Result<serde_json::Value, BoxError> {
            panic!("processor exploded");
        }
    }

    struct TooSlow;

    #[async_trait]
    impl Processor for TooSlow {
        async fn process(&self, _job: &Job) -> Result<serde_json::Value, BoxError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(serde_json::Value::Null)
        }

        fn timeout(&self, _job: &Job) -> Option<Duration> {
            Some(Duration::from_millis(10))
        }
    }

    async fn tick(queue: &JobQueue) -> usize {
        let launched = queue.dispatch().unwrap();
        queue.wait_for_jobs().await;
        launched
    }

    fn options() -> JobOptions {
        JobOptions::default()
    }

    #[tokio::test]
    async fn add_job_queues_and_returns_id() {
        let queue = JobQueue::new(QueueConfig::default());

        let job_id = queue
            .add_job(JobPayload::RefreshLeaderboard, options())
            .await
            .unwrap();

        let job = queue.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.kind(), JobKind::RefreshLeaderboard);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        let stats = queue.stats().unwrap();
        assert_eq!(stats.total_jobs, 1);
        assert_eq!(stats.ready_jobs, 1);
        assert_eq!(stats.persistence, PersistenceStatus::Disabled);
    }

    #[tokio::test]
    async fn max_attempts_prefers_options_then_processor() {
        struct FiveAttempts;

        #[async_trait]
        impl Processor for FiveAttempts {
            async fn process(&self, _job: &Job) -> Result<serde_json::Value, BoxError> {
                Ok(serde_json::Value::Null)
            }

            fn max_attempts(&self) -> Option<u16> {
                Some(5)
            }
        }

        let queue = JobQueue::new(QueueConfig::default());
        queue
            .register_processor(JobKind::RefreshLeaderboard, Arc::new(FiveAttempts))
            .unwrap();

        let from_processor = queue
            .add_job(JobPayload::RefreshLeaderboard, options())
            .await
            .unwrap();
        let from_options = queue
            .add_job(
                JobPayload::RefreshLeaderboard,
                options().with_max_attempts(2),
            )
            .await
            .unwrap();
        let from_queue = queue
            .add_job(
                JobPayload::AggregateAnalytics { window_hours: 1 },
                options(),
            )
            .await
            .unwrap();

        assert_eq!(queue.get_job(from_processor).unwrap().unwrap().max_attempts, 5);
        assert_eq!(queue.get_job(from_options).unwrap().unwrap().max_attempts, 2);
        assert_eq!(queue.get_job(from_queue).unwrap().unwrap().max_attempts, 3);
    }

    #[tokio::test]
    async fn successful_job_is_removed_and_counted() {
        let store = InMemoryStore::new();
        let queue = JobQueue::with_store(QueueConfig::default(), Arc::new(store.clone()));
        let processor = Arc::new(Recording::default());
        queue
            .register_processor(JobKind::RefreshLeaderboard, processor.clone())
            .unwrap();
        let job_id = queue
            .add_job(JobPayload::RefreshLeaderboard, options())
            .await
            .unwrap();
        let key = format!("jobkeeper:job:{job_id}");
        assert!(store.get(&key).await.unwrap().is_some());

        assert_eq!(tick(&queue).await, 1);

        assert!(queue.get_job(job_id).unwrap().is_none());
        assert_eq!(processor.successes.load(Ordering::SeqCst), 1);
        let stats = queue.stats().unwrap();
        assert_eq!(stats.total_jobs, 0);
        assert_eq!(stats.processing_jobs, 0);
        assert_eq!(stats.completed_total, 1);
        assert_eq!(stats.persistence, PersistenceStatus::BestEffort);
        assert!(store.get(&key).await.unwrap().is_none());
        assert_eq!(
            store.get("jobkeeper:stats:completed").await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn failing_job_is_retried_until_attempts_are_exhausted() {
        let queue = JobQueue::new(QueueConfig::default());
        let processor = Arc::new(AlwaysFails::default());
        queue
            .register_processor(JobKind::RefreshLeaderboard, processor.clone())
            .unwrap();
        let job_id = queue
            .add_job(
                JobPayload::RefreshLeaderboard,
                options().with_max_attempts(3),
            )
            .await
            .unwrap();

        for expected_attempt in 1..=3 {
            assert_eq!(tick(&queue).await, 1);
            if expected_attempt < 3 {
                let job = queue.get_job(job_id).unwrap().unwrap();
                assert_eq!(job.attempts, expected_attempt);
                assert_matches!(
                    job.last_error,
                    Some(JobError { error_type: ErrorType::Handler, attempt, .. }) if attempt == expected_attempt
                );
            }
        }

        assert_eq!(*processor.attempts.lock().unwrap(), vec![1, 2, 3]);
        assert!(queue.get_job(job_id).unwrap().is_none());
        assert_eq!(tick(&queue).await, 0);
        let failures = processor.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempt, 3);
        let stats = queue.stats().unwrap();
        assert_eq!(stats.failed_total, 1);
        assert_eq!(stats.total_jobs, 0);
    }

    #[tokio::test]
    async fn retry_delays_at_least_double() {
        let queue = JobQueue::new(QueueConfig::default());
        queue
            .register_processor(
                JobKind::RefreshLeaderboard,
                Arc::new(AlwaysFails {
                    retry_delay: Some(TimeDelta::milliseconds(20)),
                    ..Default::default()
                }),
            )
            .unwrap();
        let job_id = queue
            .add_job(
                JobPayload::RefreshLeaderboard,
                options().with_max_attempts(3),
            )
            .await
            .unwrap();
        let gap = |job: &Job| job.scheduled_for - job.last_error.as_ref().unwrap().recorded_at;

        tick(&queue).await;
        let first = gap(&queue.get_job(job_id).unwrap().unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        tick(&queue).await;
        let second = gap(&queue.get_job(job_id).unwrap().unwrap());

        assert_eq!(first, TimeDelta::milliseconds(20));
        assert!(second >= first * 2);
    }

    #[tokio::test]
    async fn higher_priority_runs_first() {
        let queue = JobQueue::new(QueueConfig::default().with_max_concurrent_jobs(1));
        let processor = Arc::new(Recording::default());
        queue
            .register_processor(JobKind::RefreshLeaderboard, processor.clone())
            .unwrap();
        let low = queue
            .add_job(
                JobPayload::RefreshLeaderboard,
                options().with_priority(Priority::Low),
            )
            .await
            .unwrap();
        let high = queue
            .add_job(
                JobPayload::RefreshLeaderboard,
                options().with_priority(Priority::High),
            )
            .await
            .unwrap();

        assert_eq!(tick(&queue).await, 1);
        assert_eq!(tick(&queue).await, 1);

        assert_eq!(*processor.order.lock().unwrap(), vec![high, low]);
    }

    #[tokio::test]
    async fn job_without_processor_fails_permanently() {
        let queue = JobQueue::new(QueueConfig::default());
        let processor = Arc::new(MockProcessor::default());
        queue
            .register_processor(JobKind::RefreshLeaderboard, processor.clone())
            .unwrap();
        let job_id = queue
            .add_job(
                JobPayload::Cleanup {
                    target: CleanupTarget::StaleCache,
                },
                options(),
            )
            .await
            .unwrap();

        assert_eq!(tick(&queue).await, 1);

        assert!(queue.get_job(job_id).unwrap().is_none());
        assert_eq!(queue.stats().unwrap().failed_total, 1);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delayed_job_becomes_ready_after_delay() {
        let queue = JobQueue::new(QueueConfig::default());
        queue
            .register_processor(JobKind::RefreshLeaderboard, Arc::new(Recording::default()))
            .unwrap();
        queue
            .add_job(
                JobPayload::RefreshLeaderboard,
                options().with_delay(Duration::from_millis(1000)),
            )
            .await
            .unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.ready_jobs, 0);
        assert_eq!(stats.scheduled_jobs, 1);
        assert_eq!(tick(&queue).await, 0);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(queue.stats().unwrap().ready_jobs, 1);
        assert_eq!(tick(&queue).await, 1);
    }

    #[tokio::test]
    async fn panic_is_recorded_as_failure() {
        let queue = JobQueue::new(QueueConfig::default());
        queue
            .register_processor(JobKind::RefreshLeaderboard, Arc::new(Panics))
            .unwrap();
        let job_id = queue
            .add_job(
                JobPayload::RefreshLeaderboard,
                options().with_max_attempts(2),
            )
            .await
            .unwrap();

        tick(&queue).await;

        let error = queue.get_job(job_id).unwrap().unwrap().last_error.unwrap();
        assert_eq!(error.error_type, ErrorType::Panic);
        assert_eq!(error.message, "processor exploded");
    }

    /// Panics in its callbacks after the attempt itself has settled.
    #[derive(Default)]
    struct PanickingCallbacks {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Processor for PanickingCallbacks {
        async fn process(&self, _job: &Job) -> Result<serde_json::Value, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("rejected".into());
            }
            Ok(serde_json::Value::Null)
        }

        async fn on_success(&self, _job: &Job, _result: &serde_json::Value) -> Result<(), BoxError> {
            panic!("success callback exploded");
        }

        async fn on_failure(&self, _job: &Job, _error: &JobError) -> Result<(), BoxError> {
            panic!("failure callback exploded");
        }
    }

    #[tokio::test]
    async fn panicking_success_callback_still_completes_the_job() {
        let store = InMemoryStore::new();
        let queue = JobQueue::with_store(QueueConfig::default(), Arc::new(store.clone()));
        let processor = Arc::new(PanickingCallbacks::default());
        queue
            .register_processor(JobKind::RefreshLeaderboard, processor.clone())
            .unwrap();
        let job_id = queue
            .add_job(JobPayload::RefreshLeaderboard, options())
            .await
            .unwrap();

        for _ in 0..3 {
            tick(&queue).await;
        }

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert!(queue.get_job(job_id).unwrap().is_none());
        let stats = queue.stats().unwrap();
        assert_eq!(stats.completed_total, 1);
        assert_eq!(stats.failed_total, 0);
        assert_eq!(stats.processing_jobs, 0);
        assert!(store
            .get(&format!("jobkeeper:job:{job_id}"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn panicking_failure_callback_still_discards_the_job() {
        let queue = JobQueue::new(QueueConfig::default());
        let processor = Arc::new(PanickingCallbacks {
            fail: true,
            ..Default::default()
        });
        queue
            .register_processor(JobKind::RefreshLeaderboard, processor.clone())
            .unwrap();
        let job_id = queue
            .add_job(
                JobPayload::RefreshLeaderboard,
                options().with_max_attempts(1),
            )
            .await
            .unwrap();

        for _ in 0..3 {
            tick(&queue).await;
        }

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert!(queue.get_job(job_id).unwrap().is_none());
        let stats = queue.stats().unwrap();
        assert_eq!(stats.failed_total, 1);
        assert_eq!(stats.completed_total, 0);
    }

    #[tokio::test]
    async fn timeout_is_recorded_as_failure() {
        let queue = JobQueue::new(QueueConfig::default());
        queue
            .register_processor(JobKind::RefreshLeaderboard, Arc::new(TooSlow))
            .unwrap();
        let job_id = queue
            .add_job(
                JobPayload::RefreshLeaderboard,
                options().with_max_attempts(2),
            )
            .await
            .unwrap();

        tick(&queue).await;

        let error = queue.get_job(job_id).unwrap().unwrap().last_error.unwrap();
        assert_eq!(error.error_type, ErrorType::Timeout);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn job_is_never_processed_twice_at_once() {
        let queue = JobQueue::new(QueueConfig::default().with_max_concurrent_jobs(4));
        let processor = Arc::new(Recording {
            pause: Duration::from_millis(5),
            ..Default::default()
        });
        queue
            .register_processor(JobKind::RefreshLeaderboard, processor.clone())
            .unwrap();

        let submitters = (0..4).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for _ in 0..10 {
                    queue
                        .add_job(JobPayload::RefreshLeaderboard, JobOptions::default())
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        });
        let dispatchers = (0..4).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    queue.dispatch().unwrap();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        });
        for handle in submitters.chain(dispatchers).collect::<Vec<_>>() {
            handle.await.unwrap();
        }
        while queue.stats().unwrap().total_jobs > 0 {
            tick(&queue).await;
        }

        assert!(!processor.overlap.load(Ordering::SeqCst));
        let order = processor.order.lock().unwrap();
        assert_eq!(order.len(), 40);
        assert_eq!(order.iter().collect::<HashSet<_>>().len(), 40);
        assert_eq!(queue.stats().unwrap().completed_total, 40);
    }

    #[tokio::test]
    async fn start_dispatches_until_stopped() {
        let queue = JobQueue::new(
            QueueConfig::default().with_poll_interval(Duration::from_millis(10)),
        );
        let processor = Arc::new(Recording::default());
        queue
            .register_processor(JobKind::RefreshLeaderboard, processor.clone())
            .unwrap();

        queue.start().unwrap();
        queue.start().unwrap();
        assert!(queue.is_running());
        queue
            .add_job(JobPayload::RefreshLeaderboard, options())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.stop().await.unwrap();

        assert!(!queue.is_running());
        assert_eq!(processor.successes.load(Ordering::SeqCst), 1);

        queue.start().unwrap();
        assert!(queue.is_running());
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn recover_loads_jobs_from_a_previous_queue() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let previous = JobQueue::with_store(QueueConfig::default(), store.clone());
        let job_id = previous
            .add_job(JobPayload::RefreshLeaderboard, options())
            .await
            .unwrap();

        let queue = JobQueue::with_store(QueueConfig::default(), store);

        assert_eq!(queue.recover().await.unwrap(), 1);
        assert!(queue.get_job(job_id).unwrap().is_some());
        assert_eq!(queue.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recovered_exhausted_job_is_swept() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue = JobQueue::with_store(QueueConfig::default(), store.clone());
        let mut job = Job::mock_job().with_attempts(3);
        job.scheduled_for = Utc::now();
        store
            .set(
                &format!("jobkeeper:job:{}", job.id),
                serde_json::to_string(&job).unwrap(),
                Default::default(),
            )
            .await
            .unwrap();

        assert_eq!(queue.recover().await.unwrap(), 1);
        assert_eq!(queue.stats().unwrap().failed_jobs, 1);
        assert_eq!(tick(&queue).await, 0);

        let stats = queue.stats().unwrap();
        assert_eq!(stats.total_jobs, 0);
        assert_eq!(stats.failed_total, 1);
    }

    #[tokio::test]
    async fn store_failures_degrade_without_failing_submission() {
        let store = FailingStore::new();
        let queue = JobQueue::with_store(QueueConfig::default(), Arc::new(store.clone()));

        let job_id = queue
            .add_job(JobPayload::RefreshLeaderboard, options())
            .await
            .unwrap();

        assert!(queue.get_job(job_id).unwrap().is_some());
        assert_eq!(queue.persistence_status(), PersistenceStatus::Degraded);

        store.set_failing(false);
        queue
            .add_job(JobPayload::RefreshLeaderboard, options())
            .await
            .unwrap();
        assert_eq!(queue.persistence_status(), PersistenceStatus::Durable);
    }
}
