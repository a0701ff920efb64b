//! Processors for the job kinds that only need the ports provided by this crate.
//!
//! [`EmailProcessor`] delivers [`JobPayload::SendEmail`] and [`JobPayload::ConsultationReminder`]
//! jobs through a [`Mailer`]. [`CleanupProcessor`] removes outdated keys from a [`Store`].
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::{
    backoff::{BackoffStrategy, Jitter, Strategy},
    job::{payload::ConsultationReminder, CleanupTarget, Job, JobKind, JobPayload},
    mailer::{Email, Mailer},
    queue::JobQueue,
    registry::{BoxError, Processor},
    store::{KeyType, Keyspace, Store},
    JobKeeperError,
};

#[derive(Debug, thiserror::Error)]
#[error("{processor} cannot process {kind} jobs")]
struct UnsupportedPayload {
    processor: &'static str,
    kind: JobKind,
}

/// Sends emails and consultation reminders through a [`Mailer`].
pub struct EmailProcessor {
    mailer: Arc<dyn Mailer>,
    from: Option<String>,
}

impl EmailProcessor {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer, from: None }
    }

    /// Sender used for emails that do not set their own.
    pub fn with_from(self, from: impl Into<String>) -> Self {
        Self {
            from: Some(from.into()),
            ..self
        }
    }

    /// Registers the processor for every kind of job it handles.
    pub fn register(self, queue: &JobQueue) -> Result<(), JobKeeperError> {
        let processor = Arc::new(self);
        queue.register_processor(JobKind::SendEmail, processor.clone())?;
        queue.register_processor(JobKind::ConsultationReminder, processor)?;
        Ok(())
    }

    fn prepare(&self, email: &Email) -> Email {
        match (&email.from, &self.from) {
            (None, Some(from)) => email.clone().with_from(from.clone()),
            _ => email.clone(),
        }
    }
}

fn reminder_email(reminder: &ConsultationReminder) -> Email {
    let when = reminder.starts_at.format("%A %e %B %Y at %H:%M UTC");
    Email::new(
        &reminder.email,
        format!("Reminder: your consultation on {when}"),
        format!(
            "<p>Hi {name},</p><p>This is a reminder that your consultation is scheduled for \
             <strong>{when}</strong>.</p><p>Reference: {id}</p>",
            name = reminder.name,
            id = reminder.consultation_id,
        ),
    )
    .with_text(format!(
        "Hi {name},\n\nThis is a reminder that your consultation is scheduled for {when}.\n\n\
         Reference: {id}\n",
        name = reminder.name,
        id = reminder.consultation_id,
    ))
}

#[async_trait]
impl Processor for EmailProcessor {
    async fn process(&self, job: &Job) -> Result<serde_json::Value, BoxError> {
        let email = match &job.payload {
            JobPayload::SendEmail(email) => self.prepare(email),
            JobPayload::ConsultationReminder(reminder) => self.prepare(&reminder_email(reminder)),
            _ => {
                return Err(UnsupportedPayload {
                    processor: "EmailProcessor",
                    kind: job.kind(),
                }
                .into())
            }
        };
        self.mailer.send_email(&email).await?;
        Ok(json!({ "to": email.to, "subject": email.subject }))
    }

    fn max_attempts(&self) -> Option<u16> {
        Some(5)
    }

    fn backoff(&self, attempt: u16, _default_retry_delay: TimeDelta) -> TimeDelta {
        BackoffStrategy::exponential(TimeDelta::seconds(30))
            .with_max(TimeDelta::hours(1))
            .with_jitter(Jitter::Relative(0.1))
            .backoff(attempt)
    }
}

/// Removes outdated entries under the key prefix of a [`CleanupTarget`].
///
/// Entries are expected to be JSON objects. An entry is removed once its `expires_at` has passed,
/// or once its `created_at` is older than the maximum age of the target. Entries with neither
/// field are left alone.
pub struct CleanupProcessor {
    store: Arc<dyn Store>,
    keyspace: Keyspace,
}

#[derive(Deserialize)]
struct Timestamps {
    expires_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
}

/// How long an entry of `target` is kept after it was created.
pub fn max_age(target: CleanupTarget) -> TimeDelta {
    match target {
        CleanupTarget::ExpiredSessions => TimeDelta::days(30),
        CleanupTarget::StaleCache => TimeDelta::days(1),
        CleanupTarget::OldNotifications => TimeDelta::days(90),
    }
}

impl CleanupProcessor {
    pub fn new(store: Arc<dyn Store>, keyspace: Keyspace) -> Self {
        Self { store, keyspace }
    }

    fn is_outdated(value: &str, max_age: TimeDelta, now: DateTime<Utc>) -> bool {
        let Ok(timestamps) = serde_json::from_str::<Timestamps>(value) else {
            return false;
        };
        let expired = timestamps.expires_at.is_some_and(|at| at <= now);
        let too_old = timestamps
            .created_at
            .is_some_and(|at| now.signed_duration_since(at) > max_age);
        expired || too_old
    }

    async fn clean(&self, target: CleanupTarget) -> Result<usize, BoxError> {
        let prefix = self.keyspace.key(KeyType::Raw(target.key_prefix()));
        let max_age = max_age(target);
        let now = Utc::now();
        let mut deleted = 0;
        for key in self.store.keys(&prefix).await? {
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };
            if Self::is_outdated(&value, max_age, now) && self.store.delete(&key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl Processor for CleanupProcessor {
    async fn process(&self, job: &Job) -> Result<serde_json::Value, BoxError> {
        let JobPayload::Cleanup { target } = job.payload else {
            return Err(UnsupportedPayload {
                processor: "CleanupProcessor",
                kind: job.kind(),
            }
            .into());
        };
        let deleted = self.clean(target).await?;
        tracing::info!(?target, deleted, "Cleanup removed {deleted} entries");
        Ok(json!({ "target": target, "deleted": deleted }))
    }

    fn backoff(&self, _attempt: u16, _default_retry_delay: TimeDelta) -> TimeDelta {
        BackoffStrategy::constant(TimeDelta::minutes(1)).backoff(1)
    }
}
