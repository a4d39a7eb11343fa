// ABOUTME: Reconciliation sweeper - prunes documents absent from an authoritative id set
// ABOUTME: Plain ids or "<subscription>-<name>" compound ids, one transaction per collection

use std::collections::HashSet;
use std::sync::Arc;

use crate::document::{DocumentRef, DocumentStore};
use crate::error::Result;

/// Which part of a document id is checked against the live set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepKey {
    Whole,
    ScopePrefix,
}

impl SweepKey {
    /// `None` means the document is out of scope for this sweep and is kept.
    fn live_key<'a>(&self, id: &'a str) -> Option<&'a str> {
        match self {
            SweepKey::Whole => Some(id),
            SweepKey::ScopePrefix => id.split_once('-').map(|(scope, _)| scope),
        }
    }
}

/// Result of sweeping one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub collection: String,
    pub scanned: usize,
    pub deleted: Vec<DocumentRef>,
}

impl SweepResult {
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    /// Nothing needed deleting.
    pub fn is_clean(&self) -> bool {
        self.deleted.is_empty()
    }
}

/// Deletes documents whose identifier is missing from a freshly fetched
/// authoritative set.
///
/// Document writes only ever add or replace, so entities deleted upstream while
/// no webhook was delivered linger until a sweep runs after a full resync.
#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn DocumentStore>,
}

impl Sweeper {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Delete every document in `collection` whose id is not in `live_ids`.
    pub async fn sweep(&self, collection: &str, live_ids: &HashSet<String>) -> Result<SweepResult> {
        self.sweep_by(collection, live_ids, SweepKey::Whole).await
    }

    /// Delete every `<subscription>-<name>` document whose subscription is not
    /// in `live_subscriptions`. Ids without a separator are left alone.
    pub async fn sweep_scoped(
        &self,
        collection: &str,
        live_subscriptions: &HashSet<String>,
    ) -> Result<SweepResult> {
        self.sweep_by(collection, live_subscriptions, SweepKey::ScopePrefix)
            .await
    }

    async fn sweep_by(
        &self,
        collection: &str,
        live: &HashSet<String>,
        key: SweepKey,
    ) -> Result<SweepResult> {
        let mut txn = self.store.begin().await?;
        let documents = txn.documents(collection).await?;

        let mut result = SweepResult {
            collection: collection.to_string(),
            scanned: documents.len(),
            deleted: Vec::new(),
        };
        for document in documents {
            let Some(live_key) = key.live_key(&document.reference.id) else {
                continue;
            };
            if !live.contains(live_key) {
                tracing::info!("Purged stale document: {}", document.reference);
                txn.delete(document.reference.clone());
                result.deleted.push(document.reference);
            }
        }
        txn.commit().await?;

        if result.is_clean() {
            tracing::debug!("No stale documents in {}", collection);
        } else {
            tracing::info!(
                "Swept {} of {} documents from {}",
                result.deleted_count(),
                result.scanned,
                collection
            );
        }
        Ok(result)
    }
}
