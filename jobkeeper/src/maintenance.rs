//! Recurring maintenance work, enqueued as ordinary jobs.
//!
//! [`daily_maintenance`] and [`hourly_updates`] can be called directly, e.g. from an external
//! scheduler, or driven by a [`MaintenanceScheduler`].
use std::{fmt::Display, str::FromStr, time::Duration};

use chrono::{TimeDelta, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    job::{CleanupTarget, JobId, JobOptions, JobPayload, Priority},
    queue::JobQueue,
    JobKeeperError,
};

/// The cache entries warmed by [`daily_maintenance`].
pub const WARM_CACHE_KEYS: [&str; 4] = ["leaderboard", "services", "testimonials", "pricing"];

/// Enqueues the cleanup of expired sessions, stale cache entries and old notifications, a
/// leaderboard refresh and a cache warm-up.
pub async fn daily_maintenance(queue: &JobQueue) -> Result<Vec<JobId>, JobKeeperError> {
    let cleanup = JobOptions::default().with_priority(Priority::Low);
    let mut job_ids = Vec::with_capacity(5);
    for target in [
        CleanupTarget::ExpiredSessions,
        CleanupTarget::StaleCache,
        CleanupTarget::OldNotifications,
    ] {
        job_ids.push(
            queue
                .add_job(JobPayload::Cleanup { target }, cleanup.clone())
                .await?,
        );
    }
    job_ids.push(
        queue
            .add_job(JobPayload::RefreshLeaderboard, JobOptions::default())
            .await?,
    );
    job_ids.push(
        queue
            .add_job(
                JobPayload::WarmCache {
                    keys: WARM_CACHE_KEYS.iter().map(ToString::to_string).collect(),
                },
                JobOptions::default(),
            )
            .await?,
    );
    tracing::info!("Queued {} daily maintenance jobs", job_ids.len());
    Ok(job_ids)
}

/// Enqueues the aggregation of the last hour of analytics and a leaderboard refresh.
pub async fn hourly_updates(queue: &JobQueue) -> Result<Vec<JobId>, JobKeeperError> {
    let options = JobOptions::default().with_priority(Priority::Low);
    let job_ids = vec![
        queue
            .add_job(
                JobPayload::AggregateAnalytics { window_hours: 1 },
                options.clone(),
            )
            .await?,
        queue
            .add_job(JobPayload::RefreshLeaderboard, options)
            .await?,
    ];
    tracing::info!("Queued {} hourly update jobs", job_ids.len());
    Ok(job_ids)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    DailyMaintenance,
    HourlyUpdates,
}

impl Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyMaintenance => f.write_str("daily maintenance"),
            Self::HourlyUpdates => f.write_str("hourly updates"),
        }
    }
}

impl Task {
    async fn run(self, queue: &JobQueue) -> Result<Vec<JobId>, JobKeeperError> {
        match self {
            Self::DailyMaintenance => daily_maintenance(queue).await,
            Self::HourlyUpdates => hourly_updates(queue).await,
        }
    }
}

/// Runs [`daily_maintenance`] and [`hourly_updates`] on cron schedules.
///
/// Schedules use the six field syntax of the `cron` crate, seconds first. The defaults are
/// `0 0 3 * * *` (03:00 UTC) and `0 0 * * * *` (every hour).
///
/// ```
/// # use jobkeeper::{maintenance::MaintenanceScheduler, queue::{JobQueue, QueueConfig}};
/// let queue = JobQueue::new(QueueConfig::default());
/// let scheduler = MaintenanceScheduler::new(queue)
///     .and_then(|scheduler| scheduler.with_daily_schedule("0 30 4 * * *"))
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct MaintenanceScheduler {
    queue: JobQueue,
    daily: Schedule,
    hourly: Schedule,
}

pub const DEFAULT_DAILY_SCHEDULE: &str = "0 0 3 * * *";
pub const DEFAULT_HOURLY_SCHEDULE: &str = "0 0 * * * *";

fn parse(expression: &str) -> Result<Schedule, JobKeeperError> {
    Schedule::from_str(expression).map_err(|err| JobKeeperError::InvalidSchedule {
        expression: expression.to_owned(),
        message: err.to_string(),
    })
}

impl MaintenanceScheduler {
    pub fn new(queue: JobQueue) -> Result<Self, JobKeeperError> {
        Ok(Self {
            queue,
            daily: parse(DEFAULT_DAILY_SCHEDULE)?,
            hourly: parse(DEFAULT_HOURLY_SCHEDULE)?,
        })
    }

    pub fn with_daily_schedule(self, expression: &str) -> Result<Self, JobKeeperError> {
        Ok(Self {
            daily: parse(expression)?,
            ..self
        })
    }

    pub fn with_hourly_schedule(self, expression: &str) -> Result<Self, JobKeeperError> {
        Ok(Self {
            hourly: parse(expression)?,
            ..self
        })
    }

    /// Spawns both schedules. They run until `cancellation_token` is cancelled.
    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let daily = tokio::spawn(run_schedule(
            self.queue.clone(),
            self.daily,
            Task::DailyMaintenance,
            cancellation_token.clone(),
        ));
        let hourly = tokio::spawn(run_schedule(
            self.queue,
            self.hourly,
            Task::HourlyUpdates,
            cancellation_token,
        ));
        tokio::spawn(async move {
            for result in futures::future::join_all([daily, hourly]).await {
                let _ = result.inspect_err(|err| {
                    tracing::error!(?err, "Maintenance schedule stopped unexpectedly: {err}")
                });
            }
        })
    }
}

async fn run_schedule(
    queue: JobQueue,
    schedule: Schedule,
    task: Task,
    cancellation_token: CancellationToken,
) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            tracing::warn!("No upcoming time for {task}, stopping its schedule");
            break;
        };
        let delay = (next - Utc::now() - TimeDelta::milliseconds(10))
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let _ = task
                    .run(&queue)
                    .await
                    .inspect_err(|err| tracing::error!(?err, "Failed to queue {task}: {err}"));
                let delay = next - Utc::now();
                if delay > TimeDelta::zero() {
                    tokio::time::sleep(delay.to_std().unwrap_or(Duration::ZERO)).await;
                }
            }
            _ = cancellation_token.cancelled() => {
                tracing::debug!("Shutting down the {task} schedule");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{job::JobKind, queue::QueueConfig};

    fn kinds(queue: &JobQueue, job_ids: &[JobId]) -> Vec<JobKind> {
        job_ids
            .iter()
            .map(|job_id| queue.get_job(*job_id).unwrap().unwrap().kind())
            .collect()
    }

    #[tokio::test]
    async fn daily_maintenance_queues_cleanup_and_refresh() {
        let queue = JobQueue::new(QueueConfig::default());

        let job_ids = daily_maintenance(&queue).await.unwrap();

        assert_eq!(
            kinds(&queue, &job_ids),
            vec![
                JobKind::Cleanup,
                JobKind::Cleanup,
                JobKind::Cleanup,
                JobKind::RefreshLeaderboard,
                JobKind::WarmCache
            ]
        );
        let cleanup = queue.get_job(job_ids[0]).unwrap().unwrap();
        assert_eq!(cleanup.priority, Priority::Low);
        assert_eq!(
            cleanup.payload,
            JobPayload::Cleanup {
                target: CleanupTarget::ExpiredSessions
            }
        );
    }

    #[tokio::test]
    async fn hourly_updates_queue_analytics_and_refresh() {
        let queue = JobQueue::new(QueueConfig::default());

        let job_ids = hourly_updates(&queue).await.unwrap();

        assert_eq!(
            kinds(&queue, &job_ids),
            vec![JobKind::AggregateAnalytics, JobKind::RefreshLeaderboard]
        );
    }

    #[test]
    fn rejects_invalid_schedule() {
        let queue = JobQueue::new(QueueConfig::default());

        let result = MaintenanceScheduler::new(queue)
            .unwrap()
            .with_hourly_schedule("every hour");

        assert_matches!(result, Err(JobKeeperError::InvalidSchedule { .. }));
    }

    #[tokio::test]
    async fn scheduler_queues_jobs_until_cancelled() {
        let queue = JobQueue::new(QueueConfig::default());
        let token = CancellationToken::new();
        let handle = MaintenanceScheduler::new(queue.clone())
            .unwrap()
            .with_hourly_schedule("* * * * * *")
            .unwrap()
            .spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        token.cancel();
        handle.await.unwrap();

        let queued = queue.stats().unwrap().total_jobs;
        assert!(queued >= 2);
        assert_eq!(queued % 2, 0);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(queue.stats().unwrap().total_jobs, queued);
    }
}
