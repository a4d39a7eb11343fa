// ABOUTME: Lock service and set store backed by the local state-cache SQLite file
// ABOUTME: Blocking rusqlite calls run on the blocking pool behind a shared connection

use anyhow::anyhow;
use async_trait::async_trait;
use state_cache::CacheStore;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Result, StateError};
use crate::lease::LockService;
use crate::queue::SetStore;

/// Shares one cache connection between the lease coordinator and the queue.
/// Several processes opening the same file coordinate through SQLite locking.
#[derive(Clone)]
pub struct SqliteCache {
    store: Arc<Mutex<CacheStore>>,
    path: PathBuf,
}

impl SqliteCache {
    pub fn open(path: &Path) -> Result<Self> {
        let store = CacheStore::open(path).map_err(StateError::Cache)?;
        tracing::debug!(path = %path.display(), "opened state cache");
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn call<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut CacheStore) -> anyhow::Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let joined = tokio::task::spawn_blocking(move || {
            let mut store = store
                .lock()
                .map_err(|_| anyhow!("state cache connection poisoned"))?;
            op(&mut store)
        })
        .await;
        match joined {
            Ok(result) => result.map_err(StateError::Cache),
            Err(e) => Err(StateError::Cache(anyhow!("state cache task failed: {}", e))),
        }
    }
}

#[async_trait]
impl LockService for SqliteCache {
    async fn try_obtain(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let (key, token) = (key.to_string(), token.to_string());
        self.call(move |store| store.try_lock(&key, &token, ttl))
            .await
    }

    async fn refresh(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let (key, token) = (key.to_string(), token.to_string());
        self.call(move |store| store.refresh_lock(&key, &token, ttl))
            .await
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let (key, token) = (key.to_string(), token.to_string());
        self.call(move |store| store.unlock(&key, &token)).await
    }
}

#[async_trait]
impl SetStore for SqliteCache {
    async fn sadd(&self, key: &str, member: Vec<u8>) -> Result<bool> {
        let key = key.to_string();
        self.call(move |store| store.sadd(&key, &member)).await
    }

    async fn spop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.call(move |store| store.spop(&key)).await
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let key = key.to_string();
        self.call(move |store| store.scard(&key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let key = key.to_string();
        self.call(move |store| store.expire(&key, ttl)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lock_and_set_share_one_file() {
        let dir = TempDir::new().unwrap();
        let cache = SqliteCache::open(&dir.path().join("cache.db")).unwrap();

        assert!(cache
            .try_obtain("mutex-ds", "a", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!cache
            .try_obtain("mutex-ds", "b", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(cache.sadd("ds", b"one".to_vec()).await.unwrap());
        assert!(cache.expire("ds", Duration::from_secs(5)).await.unwrap());
        assert_eq!(cache.scard("ds").await.unwrap(), 1);
        assert_eq!(cache.spop("ds").await.unwrap(), Some(b"one".to_vec()));
        assert!(cache.release("mutex-ds", "a").await.unwrap());
    }
}
