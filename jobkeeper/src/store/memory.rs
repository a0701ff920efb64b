//! Provides an in memory implementation of [`Store`].
//!
//! Nothing written to it survives the process, so it reports [`Durability::BestEffort`]. It is
//! suitable for development, tests, and deployments where losing queued jobs on restart is
//! acceptable.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use super::{Durability, SetOptions, Store, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

/// An in memory implementation of [`Store`] with lazily evicted TTLs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryStore {
    /// Creates a new instance of [`InMemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        Ok(self
            .entries
            .read()
            .map_err(|_| StoreError::BadState)?
            .values()
            .filter(|entry| entry.is_live(now))
            .count())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.write().map_err(|_| StoreError::BadState)?;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, options: SetOptions) -> Result<(), StoreError> {
        let expires_at = options.ttl.map(|ttl| {
            TimeDelta::from_std(ttl)
                .ok()
                .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });
        self.entries
            .write()
            .map_err(|_| StoreError::BadState)?
            .insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        Ok(self
            .entries
            .write()
            .map_err(|_| StoreError::BadState)?
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.write().map_err(|_| StoreError::BadState)?;
        let entry = entries
            .entry(key.to_owned())
            .and_modify(|entry| {
                if !entry.is_live(now) {
                    entry.value = "0".to_owned();
                    entry.expires_at = None;
                }
            })
            .or_insert_with(|| Entry {
                value: "0".to_owned(),
                expires_at: None,
            });
        let current: i64 = entry
            .value
            .parse()
            .map_err(|_| StoreError::NotAnInteger(key.to_owned()))?;
        let next = current
            .checked_add(by)
            .ok_or_else(|| StoreError::NotAnInteger(key.to_owned()))?;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn durability(&self) -> Durability {
        Durability::BestEffort
    }
}
