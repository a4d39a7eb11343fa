// ABOUTME: StateManager - the facade wiring leases, queue, watcher, handlers and sweeper together
// ABOUTME: Transactional create/update/delete of provider objects plus full resync with reconciliation

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::StateConfig;
use crate::document::{DocumentRef, DocumentStore};
use crate::error::{Result, StateError};
use crate::handlers::{Handler, RecordHandler};
use crate::lease::{LeaseCoordinator, LockService};
use crate::model::{Record, RecordKind, Subscription, Workspace, COLLECTION_WORKSPACES};
use crate::queue::{Queue, SetStore};
use crate::sweeper::{SweepResult, Sweeper};
use crate::upstream::{
    UpstreamCustomer, UpstreamPlan, UpstreamProduct, UpstreamSource, UpstreamSubscription,
};
use crate::watcher::ChangeStreamWatcher;

/// Kinds listed from the provider during a resync, in write order.
const RESYNC_KINDS: [RecordKind; 4] = [
    RecordKind::Subscription,
    RecordKind::Customer,
    RecordKind::Plan,
    RecordKind::Product,
];

/// Outcome of a full resync.
#[derive(Debug, Clone, Default)]
pub struct ResyncStats {
    pub written: usize,
    /// `<kind> <id>` of every object that could not be written
    pub failed: Vec<String>,
    pub deleted: usize,
    pub duration_ms: u64,
}

impl ResyncStats {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct StateManager {
    config: Arc<StateConfig>,
    store: Arc<dyn DocumentStore>,
    queue: Arc<Queue>,
    watcher: ChangeStreamWatcher,
    sweeper: Sweeper,
    handlers: HashMap<RecordKind, Box<dyn RecordHandler>>,
}

impl StateManager {
    /// Build a manager with handlers for every record kind registered.
    pub fn new(
        config: StateConfig,
        locks: Arc<dyn LockService>,
        sets: Arc<dyn SetStore>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let leases = LeaseCoordinator::new(locks);
        let queue = Arc::new(Queue::new(leases.clone(), sets, &config));
        let watcher =
            ChangeStreamWatcher::new(leases, Arc::clone(&queue), Arc::clone(&store), &config);

        let mut manager = Self {
            config: Arc::new(config),
            sweeper: Sweeper::new(Arc::clone(&store)),
            store,
            queue,
            watcher,
            handlers: HashMap::new(),
        };
        manager.register(
            RecordKind::Subscription,
            Box::new(Handler::<UpstreamSubscription>::new()),
        );
        manager.register(
            RecordKind::Customer,
            Box::new(Handler::<UpstreamCustomer>::new()),
        );
        manager.register(RecordKind::Plan, Box::new(Handler::<UpstreamPlan>::new()));
        manager.register(
            RecordKind::Product,
            Box::new(Handler::<UpstreamProduct>::new()),
        );
        manager.register(RecordKind::Workspace, Box::new(Handler::<Workspace>::new()));
        manager
    }

    /// Replace the handler for `kind`.
    pub fn register(&mut self, kind: RecordKind, handler: Box<dyn RecordHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    fn handler(&self, kind: RecordKind) -> Result<&dyn RecordHandler> {
        self.handlers
            .get(&kind)
            .map(|handler| handler.as_ref())
            .ok_or(StateError::UnsupportedKind(kind.as_str()))
    }

    /// Stream subscription documents into the queue of `dataset`.
    pub async fn watch(&self, cancel: &CancellationToken, dataset: &str) -> Result<()> {
        self.watch_collection::<Subscription>(cancel, dataset).await
    }

    pub async fn watch_collection<R: Record>(
        &self,
        cancel: &CancellationToken,
        dataset: &str,
    ) -> Result<()> {
        self.watcher.watch::<R>(cancel, dataset, R::COLLECTION).await
    }

    pub async fn enqueue<M: prost::Message>(
        &self,
        cancel: &CancellationToken,
        dataset: &str,
        record: &M,
    ) -> Result<bool> {
        self.queue.enqueue(cancel, dataset, record).await
    }

    pub async fn dequeue<M: prost::Message + Default>(
        &self,
        cancel: &CancellationToken,
        dataset: &str,
        timeout: Duration,
    ) -> Result<M> {
        self.queue.dequeue(cancel, dataset, timeout).await
    }

    pub async fn refresh_expire(&self, dataset: &str) -> Result<bool> {
        self.queue.refresh_expire(dataset).await
    }

    /// Write a raw JSON provider object of `kind` in its own transaction.
    pub async fn create_or_update(&self, kind: RecordKind, raw: &[u8]) -> Result<DocumentRef> {
        let payload: Value = serde_json::from_slice(raw)?;
        self.create_or_update_value(kind, &payload).await
    }

    pub async fn create_or_update_value(
        &self,
        kind: RecordKind,
        payload: &Value,
    ) -> Result<DocumentRef> {
        let handler = self.handler(kind)?;
        let mut txn = self.store.begin().await?;
        let reference = handler.upsert(txn.as_mut(), payload).await?;
        txn.commit().await?;
        tracing::info!(kind = %kind, document = %reference, "Stored {}", kind);
        Ok(reference)
    }

    /// Remove the documents of a raw JSON provider object of `kind`, cascading
    /// through child references.
    pub async fn delete(&self, kind: RecordKind, raw: &[u8]) -> Result<Vec<DocumentRef>> {
        let payload: Value = serde_json::from_slice(raw)?;
        self.delete_value(kind, &payload).await
    }

    pub async fn delete_value(&self, kind: RecordKind, payload: &Value) -> Result<Vec<DocumentRef>> {
        let handler = self.handler(kind)?;
        let mut txn = self.store.begin().await?;
        let deleted = handler.remove(txn.as_mut(), payload).await?;
        txn.commit().await?;
        tracing::info!(kind = %kind, deleted = deleted.len(), "Deleted {}", kind);
        Ok(deleted)
    }

    pub async fn sweep(&self, collection: &str, live_ids: &HashSet<String>) -> Result<SweepResult> {
        self.sweeper.sweep(collection, live_ids).await
    }

    /// Rewrite every provider object in one transaction, then delete documents
    /// the provider no longer knows about.
    ///
    /// Individual objects that fail to write are recorded in the stats and do
    /// not abort the resync.
    pub async fn resync(&self, source: &dyn UpstreamSource) -> Result<ResyncStats> {
        let start = Instant::now();
        let mut stats = ResyncStats::default();
        let mut live: HashMap<RecordKind, HashSet<String>> = HashMap::new();

        tracing::info!("Starting resync");
        let mut txn = self.store.begin().await?;
        for kind in RESYNC_KINDS {
            let handler = self.handler(kind)?;
            let ids = live.entry(kind).or_default();
            let mut cursor: Option<String> = None;
            loop {
                let page = source.list(kind, cursor.as_deref()).await?;
                for item in &page.items {
                    let id = item.get("id").and_then(Value::as_str).unwrap_or_default();
                    match handler.live_id(item) {
                        Ok(Some(live_id)) => {
                            ids.insert(live_id);
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(kind = %kind, "Unreadable {} {}: {}", kind, id, e),
                    }
                    match handler.upsert(txn.as_mut(), item).await {
                        Ok(_) => stats.written += 1,
                        Err(e) => {
                            tracing::warn!(kind = %kind, "Failed to update {} state {}: {}", kind, id, e);
                            stats.failed.push(format!("{} {}", kind, id));
                        }
                    }
                }
                match (page.has_more, page.last_id()) {
                    (true, Some(last)) => cursor = Some(last.to_string()),
                    _ => break,
                }
            }
            tracing::debug!(kind = %kind, live = ids.len(), "listed upstream objects");
        }
        txn.commit().await?;

        for kind in RESYNC_KINDS {
            let ids = live.remove(&kind).unwrap_or_default();
            let result = self.sweeper.sweep(kind.collection(), &ids).await?;
            stats.deleted += result.deleted_count();
            if kind == RecordKind::Subscription {
                let result = self.sweeper.sweep_scoped(COLLECTION_WORKSPACES, &ids).await?;
                stats.deleted += result.deleted_count();
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "Resync complete: {} written, {} failed, {} deleted in {}ms",
            stats.written,
            stats.failed.len(),
            stats.deleted,
            stats.duration_ms
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resync_stats_success() {
        let mut stats = ResyncStats::default();
        assert!(stats.is_success());
        stats.failed.push("plan plan_1".to_string());
        assert!(!stats.is_success());
    }
}
