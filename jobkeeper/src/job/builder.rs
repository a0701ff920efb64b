use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use super::Priority;

/// Options for submitting a job via [`crate::queue::JobQueue::add_job`].
///
/// ```
/// # use jobkeeper::prelude::*;
/// # use std::time::Duration;
/// let options = JobOptions::default()
///     .with_priority(Priority::High)
///     .with_delay(Duration::from_secs(30))
///     .with_max_attempts(5);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub(crate) priority: Priority,
    pub(crate) delay: Duration,
    pub(crate) max_attempts: Option<u16>,
    pub(crate) scheduled_for: Option<DateTime<Utc>>,
}

impl JobOptions {
    pub fn with_priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    /// Overrides both the processor's and the queue's default number of attempts.
    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    /// Schedules the job for an exact time. Takes precedence over [`JobOptions::with_delay`].
    pub fn schedule_at(self, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            scheduled_for: Some(scheduled_for),
            ..self
        }
    }

    pub(crate) fn scheduled_for(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.scheduled_for.unwrap_or_else(|| {
            TimeDelta::from_std(self.delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_relative_to_now() {
        let now = Utc::now();
        let options = JobOptions::default().with_delay(Duration::from_millis(1500));

        assert_eq!(options.scheduled_for(now), now + TimeDelta::milliseconds(1500));
    }

    #[test]
    fn explicit_schedule_overrides_delay() {
        let now = Utc::now();
        let at = now + TimeDelta::days(1);
        let options = JobOptions::default()
            .with_delay(Duration::from_secs(5))
            .schedule_at(at);

        assert_eq!(options.scheduled_for(now), at);
    }

    #[test]
    fn defaults() {
        let options = JobOptions::default();

        assert_eq!(options.priority, Priority::Normal);
        assert_eq!(options.delay, Duration::ZERO);
        assert_eq!(options.max_attempts, None);
    }
}
