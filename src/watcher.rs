// ABOUTME: ChangeStreamWatcher - the single streamer of a dataset across all replicas
// ABOUTME: Receive task feeds a supervising loop that keeps the lease and queue alive and enqueues records

use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{LeaseSettings, StateConfig};
use crate::document::{ChangeEvent, ChangeKind, ChangeStream, DocumentStore};
use crate::error::{Result, StateError};
use crate::lease::{Lease, LeaseCoordinator};
use crate::model::Record;
use crate::queue::Queue;
use crate::serialize::{deserialize_into, is_populated};

const EVENT_BUFFER: usize = 64;

/// Watches a document collection on behalf of one dataset and forwards every
/// change into the dataset's queue.
pub struct ChangeStreamWatcher {
    leases: LeaseCoordinator,
    queue: Arc<Queue>,
    store: Arc<dyn DocumentStore>,
    watch_lease: LeaseSettings,
    liveness: Duration,
}

impl ChangeStreamWatcher {
    pub fn new(
        leases: LeaseCoordinator,
        queue: Arc<Queue>,
        store: Arc<dyn DocumentStore>,
        config: &StateConfig,
    ) -> Self {
        Self {
            leases,
            queue,
            store,
            watch_lease: config.watch_lease,
            liveness: config.liveness_interval(),
        }
    }

    pub fn watch_key(dataset: &str) -> String {
        format!("{}-populate", dataset)
    }

    /// Stream `collection` into the queue of `dataset` until canceled or failed.
    ///
    /// Returns [`StateError::NotObtained`] without opening a stream when another
    /// watcher holds the dataset. Cancellation ends the watch with `Ok(())`; any
    /// receive or decode failure ends it with the error. The watch lease is
    /// released on every path. Losing the lease to expiry ends the watch with
    /// [`StateError::LeaseExpired`].
    pub async fn watch<R: Record>(
        &self,
        cancel: &CancellationToken,
        dataset: &str,
        collection: &str,
    ) -> Result<()> {
        let key = Self::watch_key(dataset);
        let mut lease = match self
            .leases
            .acquire(cancel, &key, self.watch_lease.ttl(), &self.watch_lease.retry())
            .await
        {
            Ok(lease) => lease,
            Err(StateError::Canceled) => return Ok(()),
            Err(e) => return Err(e),
        };
        tracing::info!(dataset, collection, "Starting change stream watch");

        let result = self.stream::<R>(cancel, &lease, dataset, collection).await;
        lease.release().await;

        match result {
            Err(StateError::Canceled) => {
                tracing::info!(dataset, "Change stream watch canceled");
                Ok(())
            }
            Err(e) => {
                tracing::error!(dataset, "Change stream watch failed: {}", e);
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn stream<R: Record>(
        &self,
        cancel: &CancellationToken,
        lease: &Lease,
        dataset: &str,
        collection: &str,
    ) -> Result<()> {
        let stream = self
            .store
            .listen(collection)
            .await
            .map_err(|e| StateError::Upstream(format!("listen on {} failed: {}", collection, e)))?;

        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let mut receiver = tokio::spawn(receive_events(stream, tx));

        let result = self.supervise::<R>(cancel, lease, dataset, &mut rx).await;

        drop(rx);
        receiver.abort();
        match (&mut receiver).await {
            Err(join) if join.is_panic() && !matches!(result, Err(StateError::Canceled)) => Err(
                StateError::Upstream("change stream receive task panicked".to_string()),
            ),
            _ => result,
        }
    }

    async fn supervise<R: Record>(
        &self,
        cancel: &CancellationToken,
        lease: &Lease,
        dataset: &str,
        events: &mut mpsc::Receiver<Result<ChangeEvent>>,
    ) -> Result<()> {
        let mut liveness = interval(self.liveness);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(StateError::Canceled),
                _ = liveness.tick() => self.keep_alive(cancel, lease, dataset).await?,
                event = events.recv() => match event {
                    Some(Ok(event)) => self.forward::<R>(cancel, lease, dataset, event).await?,
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(StateError::Upstream(
                            "change stream receiver stopped".to_string(),
                        ))
                    }
                },
            }
        }
    }

    /// Losing the watch lease ends the watch. Other refresh failures are
    /// logged and the next tick tries again.
    async fn keep_alive(
        &self,
        cancel: &CancellationToken,
        lease: &Lease,
        dataset: &str,
    ) -> Result<()> {
        self.refresh_lease(cancel, lease, dataset).await?;
        if let Err(e) = self.queue.refresh_expire(dataset).await {
            tracing::error!(dataset, "Failed to refresh dataset expiry: {}", e);
        }
        Ok(())
    }

    async fn refresh_lease(
        &self,
        cancel: &CancellationToken,
        lease: &Lease,
        dataset: &str,
    ) -> Result<()> {
        match lease.refresh(cancel, self.watch_lease.ttl()).await {
            Ok(()) => Ok(()),
            Err(e @ (StateError::Canceled | StateError::LeaseExpired { .. })) => {
                if !e.is_canceled() {
                    tracing::error!(dataset, key = %lease.key(), "Watch lease lost");
                }
                Err(e)
            }
            Err(e) => {
                tracing::error!(dataset, "Watch lease refresh error: {}", e);
                Ok(())
            }
        }
    }

    /// Await `work` while the liveness tick keeps the lease and queue alive.
    async fn holding<T>(
        &self,
        cancel: &CancellationToken,
        lease: &Lease,
        dataset: &str,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::pin!(work);
        let mut liveness = interval_at(Instant::now() + self.liveness, self.liveness);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;

                result = &mut work => return result,
                _ = liveness.tick() => self.keep_alive(cancel, lease, dataset).await?,
            }
        }
    }

    async fn forward<R: Record>(
        &self,
        cancel: &CancellationToken,
        lease: &Lease,
        dataset: &str,
        event: ChangeEvent,
    ) -> Result<()> {
        let reference = &event.document.reference;
        if event.kind == ChangeKind::Removed {
            tracing::debug!(dataset, document = %reference, "ignoring removed document");
            return Ok(());
        }
        if !is_populated(&event.document) {
            tracing::debug!(dataset, document = %reference, "skipping unpopulated document");
            return Ok(());
        }

        self.refresh_lease(cancel, lease, dataset).await?;

        let mut record = R::default();
        deserialize_into(&event.document, &mut record).map_err(|e| {
            StateError::Upstream(format!("failed to decode {}: {}", reference, e))
        })?;

        loop {
            let enqueued = self
                .holding(cancel, lease, dataset, self.queue.enqueue(cancel, dataset, &record))
                .await;
            match enqueued {
                Ok(_) => {
                    tracing::info!(dataset, document = %reference, "Enqueued {}", R::KIND);
                    return Ok(());
                }
                Err(e) if e.is_contention() => {
                    tracing::debug!(dataset, "queue busy, retrying enqueue");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Forward stream items until the stream fails, ends or the supervisor goes away.
async fn receive_events(mut stream: ChangeStream, events: mpsc::Sender<Result<ChangeEvent>>) {
    loop {
        let item = match stream.next().await {
            Some(item) => item,
            None => Err(StateError::Upstream("change stream closed".to_string())),
        };
        let failed = item.is_err();
        if events.send(item).await.is_err() || failed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_key() {
        assert_eq!(ChangeStreamWatcher::watch_key("sub_123"), "sub_123-populate");
    }
}
