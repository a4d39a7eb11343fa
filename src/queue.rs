// ABOUTME: Per-dataset queue over a set-shaped cache container
// ABOUTME: Every access is serialized by a "mutex-<dataset>" lease and refreshes the container ttl

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{LeaseSettings, StateConfig};
use crate::error::{Result, StateError};
use crate::lease::LeaseCoordinator;

pub const MUTEX_PREFIX: &str = "mutex";

/// Set containers with key expiry.
#[async_trait]
pub trait SetStore: Send + Sync {
    /// Returns false if the member was already present.
    async fn sadd(&self, key: &str, member: Vec<u8>) -> Result<bool>;

    /// Remove and return an arbitrary member.
    async fn spop(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn scard(&self, key: &str) -> Result<usize>;

    /// Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Lease-guarded, ttl-bounded buffer between the single watcher of a dataset
/// and any number of consumers.
///
/// Entries are kept in a set: byte-identical encodings collapse into one entry
/// and pops come back in no particular order.
pub struct Queue {
    leases: LeaseCoordinator,
    sets: Arc<dyn SetStore>,
    expiry: Duration,
    enqueue_lease: LeaseSettings,
    dequeue_lease: LeaseSettings,
}

impl Queue {
    pub fn new(leases: LeaseCoordinator, sets: Arc<dyn SetStore>, config: &StateConfig) -> Self {
        Self {
            leases,
            sets,
            expiry: config.queue_expiry(),
            enqueue_lease: config.enqueue_lease,
            dequeue_lease: config.dequeue_lease,
        }
    }

    pub fn mutex_key(dataset: &str) -> String {
        format!("{}-{}", MUTEX_PREFIX, dataset)
    }

    /// Add `record` to the dataset's container.
    ///
    /// Returns false when an identical entry was already queued. Fails with
    /// [`StateError::NotObtained`] if the access lease stays busy; callers retry.
    pub async fn enqueue<M: prost::Message>(
        &self,
        cancel: &CancellationToken,
        dataset: &str,
        record: &M,
    ) -> Result<bool> {
        let mut mutex = self
            .leases
            .acquire(
                cancel,
                &Self::mutex_key(dataset),
                self.enqueue_lease.ttl(),
                &self.enqueue_lease.retry(),
            )
            .await?;
        let result = self.push(dataset, record.encode_to_vec()).await;
        mutex.release().await;

        let added = result?;
        tracing::debug!(dataset, added, "enqueued record");
        Ok(added)
    }

    async fn push(&self, dataset: &str, data: Vec<u8>) -> Result<bool> {
        let added = self.sets.sadd(dataset, data).await?;
        // The key may have just been created, so the ttl is applied after the add.
        self.refresh_expire(dataset).await?;
        Ok(added)
    }

    /// Pop one entry from the dataset's container and decode it.
    ///
    /// `timeout` bounds how long the access lease is waited for. An empty or
    /// expired container fails with [`StateError::QueueEmpty`].
    pub async fn dequeue<M: prost::Message + Default>(
        &self,
        cancel: &CancellationToken,
        dataset: &str,
        timeout: Duration,
    ) -> Result<M> {
        let retry = self.dequeue_lease.retry().with_max_wait(timeout);
        let mut mutex = self
            .leases
            .acquire(
                cancel,
                &Self::mutex_key(dataset),
                self.dequeue_lease.ttl(),
                &retry,
            )
            .await?;
        let result = self.pop(dataset).await;
        mutex.release().await;

        match result? {
            Some(data) => Ok(M::decode(data.as_slice())?),
            None => Err(StateError::QueueEmpty {
                dataset: dataset.to_string(),
            }),
        }
    }

    async fn pop(&self, dataset: &str) -> Result<Option<Vec<u8>>> {
        self.refresh_expire(dataset).await?;
        self.sets.spop(dataset).await
    }

    /// Extend the container's ttl without touching its contents. Returns false
    /// when the container does not exist.
    pub async fn refresh_expire(&self, dataset: &str) -> Result<bool> {
        self.sets.expire(dataset, self.expiry).await
    }

    /// Number of queued entries.
    pub async fn depth(&self, dataset: &str) -> Result<usize> {
        self.sets.scard(dataset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutex_key() {
        assert_eq!(Queue::mutex_key("sub_123"), "mutex-sub_123");
    }
}
