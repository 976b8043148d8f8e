use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use riskmesh_store::{DuckDbCacheStore, StoreError};

/// Durable cache tier. Values are serialized JSON documents.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn set_many(&self, entries: &[(String, String, Duration)]) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn delete_matching(&self, pattern: &str) -> Result<usize, StoreError>;

    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

async fn blocking<T, F>(store: &DuckDbCacheStore, work: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(DuckDbCacheStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || work(store))
        .await
        .map_err(|error| StoreError::Unavailable {
            reason: format!("store task failed: {error}"),
        })?
}

#[async_trait]
impl DurableStore for DuckDbCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_owned();
        blocking(self, move |store| {
            Ok(store.get(&key)?.map(|entry| entry.value))
        })
        .await
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError> {
        let keys = keys.to_vec();
        blocking(self, move |store| {
            Ok(store
                .get_many(&keys)?
                .into_iter()
                .map(|(key, entry)| (key, entry.value))
                .collect())
        })
        .await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let (key, value) = (key.to_owned(), value.to_owned());
        blocking(self, move |store| store.set_with_ttl(&key, &value, ttl)).await
    }

    async fn set_many(&self, entries: &[(String, String, Duration)]) -> Result<(), StoreError> {
        let entries = entries.to_vec();
        blocking(self, move |store| store.set_many(&entries)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_owned();
        blocking(self, move |store| store.delete(&key)).await
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let pattern = pattern.to_owned();
        blocking(self, move |store| store.keys_matching(&pattern)).await
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize, StoreError> {
        let pattern = pattern.to_owned();
        blocking(self, move |store| store.delete_matching(&pattern)).await
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        blocking(self, |store| store.purge_expired()).await
    }
}
