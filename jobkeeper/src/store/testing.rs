//! Test suite for ensuring a correct implementation of a store.
use std::time::Duration;

use super::*;

/// Create the test suite for a [`Store`] implementation.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use jobkeeper::store_test_suite;
/// use jobkeeper::store::memory::InMemoryStore;
/// store_test_suite!(for: InMemoryStore::new());
/// ```
///
/// Tests needing an external service can be given extra attributes:
///
/// ```ignore
/// store_test_suite!(
///     attrs: [#[tokio::test] #[ignore = "requires a running redis server"]],
///     for: RedisStore::connect(DEFAULT_URL).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attrs: [#[tokio::test]], for: $store);
    };
    (attrs: [$(#[$attr:meta])*], for: $store:expr) => {
        $(#[$attr])*
        async fn get_missing_key() {
            $crate::store::testing::get_missing_key($store).await;
        }
        $(#[$attr])*
        async fn set_then_get() {
            $crate::store::testing::set_then_get($store).await;
        }
        $(#[$attr])*
        async fn set_overwrites() {
            $crate::store::testing::set_overwrites($store).await;
        }
        $(#[$attr])*
        async fn set_with_ttl_expires() {
            $crate::store::testing::set_with_ttl_expires($store).await;
        }
        $(#[$attr])*
        async fn delete_existing_key() {
            $crate::store::testing::delete_existing_key($store).await;
        }
        $(#[$attr])*
        async fn delete_missing_key() {
            $crate::store::testing::delete_missing_key($store).await;
        }
        $(#[$attr])*
        async fn increment_starts_from_zero() {
            $crate::store::testing::increment_starts_from_zero($store).await;
        }
        $(#[$attr])*
        async fn increment_rejects_non_integer() {
            $crate::store::testing::increment_rejects_non_integer($store).await;
        }
        $(#[$attr])*
        async fn keys_by_prefix() {
            $crate::store::testing::keys_by_prefix($store).await;
        }
    };
}

fn unique_prefix() -> String {
    format!("jobkeeper-test:{}:", uuid::Uuid::new_v4())
}

pub async fn get_missing_key(store: impl Store) {
    let key = format!("{}missing", unique_prefix());

    assert_eq!(store.get(&key).await.unwrap(), None);
}

pub async fn set_then_get(store: impl Store) {
    let key = format!("{}key", unique_prefix());

    store
        .set(&key, "value".to_owned(), SetOptions::default())
        .await
        .unwrap();

    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("value"));
}

pub async fn set_overwrites(store: impl Store) {
    let key = format!("{}key", unique_prefix());

    store
        .set(&key, "first".to_owned(), SetOptions::default())
        .await
        .unwrap();
    store
        .set(&key, "second".to_owned(), SetOptions::default())
        .await
        .unwrap();

    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("second"));
}

pub async fn set_with_ttl_expires(store: impl Store) {
    let key = format!("{}key", unique_prefix());

    store
        .set(
            &key,
            "value".to_owned(),
            SetOptions::ttl(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(store.get(&key).await.unwrap(), None);
}

pub async fn delete_existing_key(store: impl Store) {
    let key = format!("{}key", unique_prefix());
    store
        .set(&key, "value".to_owned(), SetOptions::default())
        .await
        .unwrap();

    assert!(store.delete(&key).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap(), None);
}

pub async fn delete_missing_key(store: impl Store) {
    let key = format!("{}missing", unique_prefix());

    assert!(!store.delete(&key).await.unwrap());
}

pub async fn increment_starts_from_zero(store: impl Store) {
    let key = format!("{}counter", unique_prefix());

    assert_eq!(store.increment(&key, 1).await.unwrap(), 1);
    assert_eq!(store.increment(&key, 5).await.unwrap(), 6);
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("6"));
}

pub async fn increment_rejects_non_integer(store: impl Store) {
    let key = format!("{}text", unique_prefix());
    store
        .set(&key, "text".to_owned(), SetOptions::default())
        .await
        .unwrap();

    match store.increment(&key, 1).await {
        Err(StoreError::NotAnInteger(_)) => {}
        other => panic!("expected StoreError::NotAnInteger, got {other:?}"),
    }
}

pub async fn keys_by_prefix(store: impl Store) {
    let prefix = unique_prefix();
    for suffix in ["b", "a", "c"] {
        store
            .set(
                &format!("{prefix}job:{suffix}"),
                suffix.to_owned(),
                SetOptions::default(),
            )
            .await
            .unwrap();
    }
    store
        .set(
            &format!("{prefix}other"),
            "other".to_owned(),
            SetOptions::default(),
        )
        .await
        .unwrap();

    let mut keys = store.keys(&format!("{prefix}job:")).await.unwrap();
    keys.sort();

    assert_eq!(
        keys,
        vec![
            format!("{prefix}job:a"),
            format!("{prefix}job:b"),
            format!("{prefix}job:c"),
        ]
    );
}
