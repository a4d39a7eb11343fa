// ABOUTME: Identity-keyed document serializer for canonical records
// ABOUTME: Writes {proto, raw, parent, children} envelopes and removes documents with their descendants

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::document::{Document, DocumentRef, Transaction};
use crate::error::{Result, StateError};
use crate::model::{IdentityStrategy, Record};

pub const FIELD_PROTO: &str = "proto";
pub const FIELD_RAW: &str = "raw";
pub const FIELD_PARENT: &str = "parent";
pub const FIELD_CHILDREN: &str = "children";

/// Stored form of a record: its JSON projection, its protobuf encoding and
/// links to related documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub proto: Value,
    #[serde(with = "base64_bytes")]
    pub raw: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<DocumentRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DocumentRef>,
}

impl Envelope {
    pub fn new<R: Record>(
        record: &R,
        parent: Option<DocumentRef>,
        children: Vec<DocumentRef>,
    ) -> Result<Self> {
        Ok(Self {
            proto: serde_json::to_value(record)?,
            raw: record.encode_to_vec(),
            parent,
            children,
        })
    }

    pub fn into_fields(self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

mod base64_bytes {
    use super::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Write `record` into `collection` at the document its identity resolves to.
///
/// Fails with [`StateError::Identity`] when the record has no usable key; nothing
/// is written in that case.
pub fn serialize<R: Record>(
    txn: &mut dyn Transaction,
    collection: &str,
    record: &R,
    parent: Option<DocumentRef>,
    children: Vec<DocumentRef>,
) -> Result<DocumentRef> {
    let identity = record.identity()?;
    let reference = DocumentRef::new(collection, identity.document_id());
    let fields = Envelope::new(record, parent, children)?.into_fields()?;
    txn.set(reference.clone(), fields);
    Ok(reference)
}

/// True once the document carries an encoded record.
pub fn is_populated(document: &Document) -> bool {
    matches!(document.fields.get(FIELD_RAW), Some(Value::String(_)))
}

/// Decode the document's raw field into `out`. Leaves `out` untouched when the
/// field is absent.
pub fn deserialize_into<R: Record>(document: &Document, out: &mut R) -> Result<()> {
    let encoded = match document.fields.get(FIELD_RAW) {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::String(encoded)) => encoded,
        Some(other) => {
            return Err(StateError::Malformed {
                path: document.reference.path(),
                reason: format!("raw field is not a string: {}", other),
            })
        }
    };
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| StateError::Malformed {
            path: document.reference.path(),
            reason: e.to_string(),
        })?;
    *out = R::decode(bytes.as_slice())?;
    Ok(())
}

/// Child references stored on a document.
pub fn children_of(document: &Document) -> Result<Vec<DocumentRef>> {
    match document.fields.get(FIELD_CHILDREN) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(children) => Ok(serde_json::from_value(children.clone())?),
    }
}

/// Delete every document in `collection` matching the record's identity,
/// together with all documents reachable through their children references.
///
/// Returns the deleted references.
pub async fn remove_serialized<R: Record>(
    txn: &mut dyn Transaction,
    collection: &str,
    record: &R,
) -> Result<Vec<DocumentRef>> {
    let identity = record.identity()?;
    let document_id = identity.document_id();
    let mut roots = txn
        .query(
            collection,
            identity.query_field(),
            &Value::String(identity.query_value().to_string()),
        )
        .await?;
    // A scoped name is shared across scopes; only the scoped document is ours,
    // including the bare-name document of an empty scope.
    if matches!(R::STRATEGY, IdentityStrategy::ScopedName) {
        roots.retain(|doc| doc.reference.id == document_id);
    }

    let mut seen = HashSet::new();
    let mut doomed = Vec::new();
    let mut pending = Vec::new();
    for root in &roots {
        if seen.insert(root.reference.clone()) {
            doomed.push(root.reference.clone());
        }
        pending.extend(children_of(root)?);
    }
    while let Some(child) = pending.pop() {
        if !seen.insert(child.clone()) {
            continue;
        }
        doomed.push(child.clone());
        if let Some(snapshot) = txn.get(&child).await? {
            pending.extend(children_of(&snapshot)?);
        }
    }

    for reference in &doomed {
        txn.delete(reference.clone());
    }
    tracing::debug!(
        collection,
        identity = %document_id,
        deleted = doomed.len(),
        "removed serialized documents"
    );
    Ok(doomed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Plan, PlanScope};
    use serde_json::json;

    #[test]
    fn test_envelope_fields() {
        let plan = Plan {
            id: "plan_123".to_string(),
            amount: 1500,
            scope: PlanScope::Public as i32,
            ..Default::default()
        };
        let fields = Envelope::new(&plan, None, vec![DocumentRef::new("products", "prod_1")])
            .unwrap()
            .into_fields()
            .unwrap();
        assert_eq!(fields["proto"]["id"], json!("plan_123"));
        assert!(fields["raw"].is_string());
        assert!(fields.get("parent").is_none());
        assert_eq!(fields["children"][0]["id"], json!("prod_1"));
    }

    #[test]
    fn test_deserialize_without_raw_is_noop() {
        let doc = Document {
            reference: DocumentRef::new("plans", "plan_1"),
            fields: json!({"proto": {"id": "plan_1"}}),
        };
        let mut out = Plan {
            id: "untouched".to_string(),
            ..Default::default()
        };
        deserialize_into(&doc, &mut out).unwrap();
        assert_eq!(out.id, "untouched");
        assert!(!is_populated(&doc));
    }

    #[test]
    fn test_deserialize_rejects_bad_base64() {
        let doc = Document {
            reference: DocumentRef::new("plans", "plan_1"),
            fields: json!({"raw": "%%% not base64 %%%"}),
        };
        let err = deserialize_into(&doc, &mut Plan::default()).unwrap_err();
        assert!(matches!(err, StateError::Malformed { .. }));
    }
}
