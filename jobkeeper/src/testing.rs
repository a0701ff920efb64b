//! Helpers for testing code that uses the job queue or the monitor.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;

use crate::{
    mailer::{Email, Mailer, MailerError},
    store::{memory::InMemoryStore, Durability, SetOptions, Store, StoreError},
};

/// A [`Mailer`] that records every email instead of sending it.
///
/// ```
/// # use jobkeeper::prelude::*;
/// # use jobkeeper::testing::RecordingMailer;
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let mailer = RecordingMailer::new();
///
/// mailer
///     .send_email(&Email::new("a@example.com", "Hello", "<p>Hi</p>"))
///     .await
///     .unwrap();
///
/// assert_eq!(mailer.sent().len(), 1);
/// # });
/// ```
#[derive(Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<Email>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mailer whose deliveries all fail.
    pub fn failing() -> Self {
        let mailer = Self::default();
        mailer.failing.store(true, Ordering::Relaxed);
        mailer
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_email(&self, email: &Email) -> Result<(), MailerError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(MailerError::Delivery("mailer configured to fail".to_owned()));
        }
        email.validate()?;
        self.sent
            .lock()
            .map_err(|_| MailerError::Delivery("recording mailer poisoned".to_owned()))?
            .push(email.clone());
        Ok(())
    }
}

/// A durable [`Store`] that fails every operation while failing is switched on.
///
/// Backed by an [`InMemoryStore`] once failing is switched off. Starts failing.
#[derive(Clone)]
pub struct FailingStore {
    inner: InMemoryStore,
    failing: Arc<AtomicBool>,
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            failing: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Relaxed) {
            Err(StoreError::Unavailable("connection refused".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String, options: SetOptions) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set(key, value, options).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.check()?;
        self.inner.increment(key, by).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.inner.keys(prefix).await
    }

    fn durability(&self) -> Durability {
        Durability::Durable
    }
}
