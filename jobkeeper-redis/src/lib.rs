//! A [`Store`] backed by redis, for persisting jobkeeper state across restarts.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use jobkeeper::prelude::*;
//! # use jobkeeper_redis::RedisStore;
//! # async fn run() -> Result<(), jobkeeper::store::StoreError> {
//! let store = Arc::new(RedisStore::connect("redis://127.0.0.1").await?);
//! let queue = JobQueue::with_store(QueueConfig::default(), store);
//! # Ok(())
//! # }
//! ```
use async_trait::async_trait;
use jobkeeper::store::{Durability, SetOptions, Store, StoreError};
use redis::{aio::ConnectionManager, AsyncCommands, Client, ErrorKind, RedisError};

/// Keys scanned per SCAN round trip.
const SCAN_COUNT: usize = 100;

/// A [`Store`] using a managed, automatically reconnecting redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

fn map_err(error: RedisError) -> StoreError {
    if error.is_io_error()
        || error.is_connection_refusal()
        || error.is_connection_dropped()
        || error.is_timeout()
    {
        StoreError::Unavailable(error.to_string())
    } else {
        StoreError::Backend(Box::new(error))
    }
}

fn is_not_an_integer(error: &RedisError) -> bool {
    error.kind() == ErrorKind::ResponseError
        && error
            .detail()
            .is_some_and(|detail| detail.contains("not an integer"))
}

/// Escapes the glob characters of `prefix` and matches anything after it.
fn match_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(map_err)?;
        let conn = ConnectionManager::new(client).await.map_err(map_err)?;
        tracing::debug!("Connected to redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn.clone().get(key).await.map_err(map_err)
    }

    async fn set(&self, key: &str, value: String, options: SetOptions) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = options.ttl {
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }
        cmd.query_async::<_, ()>(&mut self.conn.clone())
            .await
            .map_err(map_err)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: i64 = self.conn.clone().del(key).await.map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.conn
            .clone()
            .incr(key, by)
            .await
            .map_err(|err| {
                if is_not_an_integer(&err) {
                    StoreError::NotAnInteger(key.to_owned())
                } else {
                    map_err(err)
                }
            })
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = match_pattern(prefix);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    fn durability(&self) -> Durability {
        Durability::Durable
    }
}
