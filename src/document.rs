// ABOUTME: Document store abstraction: references, transactions and listen streams
// ABOUTME: Backends implement DocumentStore; the serializer and sweeper only see these traits

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::Result;

/// Location of a document inside its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentRef {
    pub collection: String,
    pub id: String,
}

impl DocumentRef {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// `collection/id`
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub reference: DocumentRef,
    pub fields: Value,
}

impl Document {
    /// Look up a dotted field path such as `proto.id`.
    pub fn field(&self, path: &str) -> Option<&Value> {
        field_at(&self.fields, path)
    }
}

pub fn field_at<'a>(fields: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(fields, |current, segment| current.get(segment))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change pushed by a listen stream, carrying the document snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub document: Document,
}

pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

/// A read-then-write transaction. Writes are buffered and applied atomically
/// by [`Transaction::commit`]; dropping the transaction discards them.
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, reference: &DocumentRef) -> Result<Option<Document>>;

    /// Documents in `collection` whose `field` equals `value`.
    async fn query(&mut self, collection: &str, field: &str, value: &Value)
        -> Result<Vec<Document>>;

    async fn documents(&mut self, collection: &str) -> Result<Vec<Document>>;

    fn set(&mut self, reference: DocumentRef, fields: Value);

    fn delete(&mut self, reference: DocumentRef);

    async fn commit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Stream the current documents of `collection` as additions, then every
    /// later change to it.
    async fn listen(&self, collection: &str) -> Result<ChangeStream>;
}
