//! The persistence port.
//!
//! A [`Store`] is a small key/value interface used to mirror queued jobs, keep lifetime counters
//! and persist the monitor's alerts and metrics. Values are JSON strings.
//!
//! The crate provides [`memory::InMemoryStore`]; a redis implementation lives in the
//! `jobkeeper-redis` crate. Implementors can check their store with [`crate::store_test_suite`].
use std::{error::Error, fmt::Display, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub(crate) mod mirror;
#[doc(hidden)]
pub mod testing;

pub use mirror::PersistenceStatus;

/// Whether the data written to a [`Store`] survives a restart of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    Durable,
    BestEffort,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: String, options: SetOptions) -> Result<(), StoreError>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    /// Adds `by` to the integer stored at `key`, starting from zero, and returns the new value.
    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError>;
    /// All live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    fn durability(&self) -> Durability;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Value at {0} is not an integer")]
    NotAnInteger(String),
    #[error("Store in bad state")]
    BadState,
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
    #[error("Store error: {0}")]
    Backend(#[source] Box<dyn Error + Send + Sync>),
}

/// Builds the namespaced keys used by this crate, e.g. `jobkeeper:job:<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace(String);

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("jobkeeper")
    }
}

impl Keyspace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self(namespace.into())
    }

    pub fn namespace(&self) -> &str {
        &self.0
    }

    pub fn key(&self, kind: KeyType<'_>) -> String {
        NameSpacedKey {
            namespace: &self.0,
            kind,
        }
        .to_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum KeyType<'a> {
    Job(&'a str),
    JobPrefix,
    Counter(&'a str),
    Monitor(&'a str),
    HealthProbe(&'a str),
    Raw(&'a str),
}

struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyType<'a>,
}

impl Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace)?;
        match self.kind {
            KeyType::Job(id) => write!(f, ":job:{id}"),
            KeyType::JobPrefix => write!(f, ":job:"),
            KeyType::Counter(name) => write!(f, ":stats:{name}"),
            KeyType::Monitor(name) => write!(f, ":monitor:{name}"),
            KeyType::HealthProbe(name) => write!(f, ":health:{name}"),
            KeyType::Raw(suffix) => write!(f, ":{suffix}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let keyspace = Keyspace::new("app");

        assert_eq!(keyspace.key(KeyType::Job("42")), "app:job:42");
        assert_eq!(keyspace.key(KeyType::JobPrefix), "app:job:");
        assert_eq!(keyspace.key(KeyType::Counter("failed")), "app:stats:failed");
        assert_eq!(keyspace.key(KeyType::Monitor("alerts")), "app:monitor:alerts");
        assert_eq!(keyspace.key(KeyType::HealthProbe("cache")), "app:health:cache");
        assert_eq!(keyspace.key(KeyType::Raw("session:")), "app:session:");
    }

    #[test]
    fn default_namespace() {
        assert_eq!(Keyspace::default().namespace(), "jobkeeper");
    }
}
