// ABOUTME: In-process lock service, set store, document store and upstream listing
// ABOUTME: Expiry runs on the tokio clock so paused-time tests can drive it

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::document::{
    field_at, ChangeEvent, ChangeKind, ChangeStream, Document, DocumentRef, DocumentStore,
    Transaction,
};
use crate::error::{Result, StateError};
use crate::lease::LockService;
use crate::model::RecordKind;
use crate::queue::SetStore;
use crate::upstream::{Page, UpstreamSource};

const FEED_CAPACITY: usize = 1024;
const DEFAULT_PAGE_SIZE: usize = 100;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Held {
    token: String,
    expires_at: Instant,
}

/// Lock table held in process memory.
#[derive(Default)]
pub struct MemoryLocks {
    held: Mutex<HashMap<String, Held>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token of the live holder of `key`.
    pub fn holder(&self, key: &str) -> Option<String> {
        let held = lock(&self.held);
        held.get(key)
            .filter(|h| h.expires_at > Instant::now())
            .map(|h| h.token.clone())
    }
}

#[async_trait]
impl LockService for MemoryLocks {
    async fn try_obtain(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut held = lock(&self.held);
        if matches!(held.get(key), Some(h) if h.expires_at > now) {
            return Ok(false);
        }
        held.insert(
            key.to_string(),
            Held {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn refresh(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut held = lock(&self.held);
        match held.get_mut(key) {
            Some(h) if h.token == token && h.expires_at > now => {
                h.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut held = lock(&self.held);
        if matches!(held.get(key), Some(h) if h.token == token) {
            held.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

#[derive(Default)]
struct SetEntry {
    members: HashSet<Vec<u8>>,
    expires_at: Option<Instant>,
}

/// Set containers held in process memory.
#[derive(Default)]
pub struct MemorySets {
    sets: Mutex<HashMap<String, SetEntry>>,
}

impl MemorySets {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(sets: &'a mut HashMap<String, SetEntry>, key: &str) -> Option<&'a mut SetEntry> {
        let expired = matches!(
            sets.get(key),
            Some(SetEntry { expires_at: Some(at), .. }) if *at <= Instant::now()
        );
        if expired {
            sets.remove(key);
            tracing::debug!(key, "set container expired");
        }
        sets.get_mut(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        let mut sets = lock(&self.sets);
        Self::live(&mut sets, key).is_some()
    }
}

#[async_trait]
impl SetStore for MemorySets {
    async fn sadd(&self, key: &str, member: Vec<u8>) -> Result<bool> {
        let mut sets = lock(&self.sets);
        if Self::live(&mut sets, key).is_none() {
            sets.insert(key.to_string(), SetEntry::default());
        }
        let entry = sets.entry(key.to_string()).or_default();
        Ok(entry.members.insert(member))
    }

    async fn spop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut sets = lock(&self.sets);
        let Some(entry) = Self::live(&mut sets, key) else {
            return Ok(None);
        };
        let member = entry.members.iter().next().cloned();
        if let Some(member) = &member {
            entry.members.remove(member);
        }
        if entry.members.is_empty() {
            sets.remove(key);
        }
        Ok(member)
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let mut sets = lock(&self.sets);
        Ok(Self::live(&mut sets, key).map_or(0, |entry| entry.members.len()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut sets = lock(&self.sets);
        match Self::live(&mut sets, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Debug, Clone)]
enum Feed {
    Change(ChangeEvent),
    Fault(String),
}

struct Versioned {
    fields: Value,
    version: u64,
}

#[derive(Default)]
struct Documents {
    docs: BTreeMap<DocumentRef, Versioned>,
    next_version: u64,
}

impl Documents {
    fn snapshot(&self, reference: &DocumentRef) -> Option<Document> {
        self.docs.get(reference).map(|v| Document {
            reference: reference.clone(),
            fields: v.fields.clone(),
        })
    }

    fn collection(&self, collection: &str) -> Vec<Document> {
        self.docs
            .iter()
            .filter(|(reference, _)| reference.collection == collection)
            .map(|(reference, v)| Document {
                reference: reference.clone(),
                fields: v.fields.clone(),
            })
            .collect()
    }

    fn version(&self, reference: &DocumentRef) -> Option<u64> {
        self.docs.get(reference).map(|v| v.version)
    }

    fn write(&mut self, reference: DocumentRef, fields: Option<Value>) -> Option<ChangeEvent> {
        match fields {
            Some(fields) => {
                self.next_version += 1;
                let previous = self.docs.insert(
                    reference.clone(),
                    Versioned {
                        fields: fields.clone(),
                        version: self.next_version,
                    },
                );
                Some(ChangeEvent {
                    kind: if previous.is_some() {
                        ChangeKind::Modified
                    } else {
                        ChangeKind::Added
                    },
                    document: Document { reference, fields },
                })
            }
            None => self.docs.remove(&reference).map(|removed| ChangeEvent {
                kind: ChangeKind::Removed,
                document: Document {
                    reference,
                    fields: removed.fields,
                },
            }),
        }
    }
}

struct Shared {
    documents: Mutex<Documents>,
    feed: broadcast::Sender<Feed>,
}

impl Shared {
    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            // No listeners is fine.
            let _ = self.feed.send(Feed::Change(event));
        }
    }
}

/// Document database held in process memory.
///
/// Transactions are optimistic: every document read is version-checked at
/// commit and a concurrent write fails the commit. Reads inside a
/// transaction do not observe its own buffered writes.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    shared: Arc<Shared>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                documents: Mutex::new(Documents::default()),
                feed,
            }),
        }
    }

    /// Write a document outside of any transaction.
    pub fn put(&self, reference: DocumentRef, fields: Value) {
        let event = lock(&self.shared.documents).write(reference, Some(fields));
        self.shared.publish(event.into_iter().collect());
    }

    pub fn get(&self, reference: &DocumentRef) -> Option<Value> {
        lock(&self.shared.documents)
            .snapshot(reference)
            .map(|doc| doc.fields)
    }

    /// Sorted ids of the documents in `collection`.
    pub fn ids(&self, collection: &str) -> Vec<String> {
        lock(&self.shared.documents)
            .collection(collection)
            .into_iter()
            .map(|doc| doc.reference.id)
            .collect()
    }

    /// Fail every open listen stream with `reason`.
    pub fn interrupt_listeners(&self, reason: &str) {
        let _ = self.shared.feed.send(Feed::Fault(reason.to_string()));
    }
}

fn translate(
    collection: &str,
    item: std::result::Result<Feed, BroadcastStreamRecvError>,
) -> Option<Result<ChangeEvent>> {
    match item {
        Ok(Feed::Change(event)) if event.document.reference.collection == collection => {
            Some(Ok(event))
        }
        Ok(Feed::Change(_)) => None,
        Ok(Feed::Fault(reason)) => Some(Err(StateError::Upstream(reason))),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(StateError::Upstream(
            format!("listener fell behind by {} changes", skipped),
        ))),
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            reads: HashMap::new(),
            writes: Vec::new(),
        }))
    }

    async fn listen(&self, collection: &str) -> Result<ChangeStream> {
        // Subscribe under the lock so no write lands between snapshot and feed.
        let (initial, receiver) = {
            let documents = lock(&self.shared.documents);
            (
                documents.collection(collection),
                self.shared.feed.subscribe(),
            )
        };
        let collection = collection.to_string();
        let initial = initial.into_iter().map(|document| {
            Ok::<_, StateError>(ChangeEvent {
                kind: ChangeKind::Added,
                document,
            })
        });
        let changes = BroadcastStream::new(receiver)
            .filter_map(move |item| futures::future::ready(translate(&collection, item)));
        Ok(stream::iter(initial).chain(changes).boxed())
    }
}

pub struct MemoryTransaction {
    shared: Arc<Shared>,
    reads: HashMap<DocumentRef, Option<u64>>,
    writes: Vec<(DocumentRef, Option<Value>)>,
}

impl MemoryTransaction {
    fn record_reads(&mut self, documents: &Documents, found: &[Document]) {
        for doc in found {
            self.reads
                .entry(doc.reference.clone())
                .or_insert_with(|| documents.version(&doc.reference));
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, reference: &DocumentRef) -> Result<Option<Document>> {
        let documents = lock(&self.shared.documents);
        self.reads
            .entry(reference.clone())
            .or_insert_with(|| documents.version(reference));
        Ok(documents.snapshot(reference))
    }

    async fn query(
        &mut self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Document>> {
        let shared = Arc::clone(&self.shared);
        let documents = lock(&shared.documents);
        let found: Vec<Document> = documents
            .collection(collection)
            .into_iter()
            .filter(|doc| field_at(&doc.fields, field) == Some(value))
            .collect();
        self.record_reads(&documents, &found);
        Ok(found)
    }

    async fn documents(&mut self, collection: &str) -> Result<Vec<Document>> {
        let shared = Arc::clone(&self.shared);
        let documents = lock(&shared.documents);
        let found = documents.collection(collection);
        self.record_reads(&documents, &found);
        Ok(found)
    }

    fn set(&mut self, reference: DocumentRef, fields: Value) {
        self.writes.push((reference, Some(fields)));
    }

    fn delete(&mut self, reference: DocumentRef) {
        self.writes.push((reference, None));
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            shared,
            reads,
            writes,
        } = *self;
        let events = {
            let mut documents = lock(&shared.documents);
            for (reference, seen) in &reads {
                if documents.version(reference) != *seen {
                    return Err(StateError::Store(format!(
                        "transaction conflict on {}",
                        reference
                    )));
                }
            }
            writes
                .into_iter()
                .filter_map(|(reference, fields)| documents.write(reference, fields))
                .collect::<Vec<_>>()
        };
        shared.publish(events);
        Ok(())
    }
}

/// Provider listing served from memory, in insertion order.
pub struct MemoryUpstream {
    objects: Mutex<HashMap<RecordKind, Vec<Value>>>,
    page_size: usize,
}

impl Default for MemoryUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUpstream {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    pub fn insert(&self, kind: RecordKind, object: Value) {
        lock(&self.objects).entry(kind).or_default().push(object);
    }
}

#[async_trait]
impl UpstreamSource for MemoryUpstream {
    async fn list(&self, kind: RecordKind, starting_after: Option<&str>) -> Result<Page> {
        let objects = lock(&self.objects);
        let all = objects.get(&kind).map(Vec::as_slice).unwrap_or_default();
        let start = match starting_after {
            Some(cursor) => all
                .iter()
                .position(|o| o.get("id").and_then(Value::as_str) == Some(cursor))
                .map_or(all.len(), |index| index + 1),
            None => 0,
        };
        let end = (start + self.page_size).min(all.len());
        Ok(Page {
            items: all[start..end].to_vec(),
            has_more: end < all.len(),
        })
    }
}
