use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{Durability, KeyType, Keyspace, SetOptions, Store, StoreError};

/// How the in-process state is currently being persisted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceStatus {
    /// No store was configured, state only lives in memory.
    #[default]
    Disabled,
    /// Writes succeed but the store does not survive a restart.
    BestEffort,
    Durable,
    /// The last write to the configured store failed.
    Degraded,
}

impl std::fmt::Display for PersistenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disabled => "disabled",
            Self::BestEffort => "best-effort",
            Self::Durable => "durable",
            Self::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Best effort mirror of in-process state into an optional [`Store`].
///
/// Failures are logged and reflected in [`Mirror::status`], never returned.
pub(crate) struct Mirror {
    store: Option<Arc<dyn Store>>,
    keyspace: Keyspace,
    degraded: AtomicBool,
}

impl Mirror {
    pub(crate) fn new(store: Option<Arc<dyn Store>>, keyspace: Keyspace) -> Self {
        Self {
            store,
            keyspace,
            degraded: AtomicBool::new(false),
        }
    }

    pub(crate) fn status(&self) -> PersistenceStatus {
        match &self.store {
            None => PersistenceStatus::Disabled,
            Some(_) if self.degraded.load(Ordering::Relaxed) => PersistenceStatus::Degraded,
            Some(store) => match store.durability() {
                Durability::Durable => PersistenceStatus::Durable,
                Durability::BestEffort => PersistenceStatus::BestEffort,
            },
        }
    }

    pub(crate) async fn put<T: Serialize + ?Sized>(
        &self,
        key: KeyType<'_>,
        value: &T,
        ttl: Option<Duration>,
    ) {
        let Some(store) = &self.store else {
            return;
        };
        let key = self.keyspace.key(key);
        let result = match serde_json::to_string(value) {
            Ok(value) => store.set(&key, value, SetOptions { ttl }).await,
            Err(err) => Err(err.into()),
        };
        self.record("write", &key, result);
    }

    pub(crate) async fn remove(&self, key: KeyType<'_>) {
        let Some(store) = &self.store else {
            return;
        };
        let key = self.keyspace.key(key);
        let result = store.delete(&key).await;
        self.record("delete", &key, result);
    }

    pub(crate) async fn increment(&self, key: KeyType<'_>) {
        let Some(store) = &self.store else {
            return;
        };
        let key = self.keyspace.key(key);
        let result = store.increment(&key, 1).await;
        self.record("increment", &key, result);
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, key: KeyType<'_>) -> Option<T> {
        let store = self.store.as_ref()?;
        let key = self.keyspace.key(key);
        let value = self.record("read", &key, store.get(&key).await)??;
        serde_json::from_str(&value)
            .inspect_err(|err| tracing::warn!(?err, %key, "Failed to decode {key}: {err}"))
            .ok()
    }

    /// Loads and decodes every value whose key starts with `prefix`, skipping entries that
    /// cannot be decoded.
    pub(crate) async fn load_all<T: DeserializeOwned>(&self, prefix: KeyType<'_>) -> Vec<T> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        let prefix = self.keyspace.key(prefix);
        let Some(keys) = self.record("list", &prefix, store.keys(&prefix).await) else {
            return Vec::new();
        };
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.record("read", &key, store.get(&key).await).flatten() {
                match serde_json::from_str(&value) {
                    Ok(value) => values.push(value),
                    Err(err) => tracing::warn!(?err, %key, "Skipping undecodable entry {key}: {err}"),
                }
            }
        }
        values
    }

    fn record<T>(&self, operation: &str, key: &str, result: Result<T, StoreError>) -> Option<T> {
        match result {
            Ok(value) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    tracing::info!("Persistence restored, store {operation} of {key} succeeded");
                }
                Some(value)
            }
            Err(err) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        ?err,
                        %key,
                        "Persistence degraded, continuing in memory: store {operation} of {key} failed: {err}"
                    );
                } else {
                    tracing::debug!(?err, %key, "Store {operation} of {key} failed: {err}");
                }
                None
            }
        }
    }
}
