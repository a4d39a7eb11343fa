// ABOUTME: Per-kind handlers turning provider payloads into stored documents
// ABOUTME: One generic handler over the UpstreamObject projection, registered per RecordKind

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;

use crate::document::{DocumentRef, Transaction};
use crate::error::Result;
use crate::model::{
    Customer, Plan, Product, Record, Subscription, Workspace, COLLECTION_CUSTOMERS,
    COLLECTION_PRODUCTS, COLLECTION_SUBSCRIPTIONS,
};
use crate::serialize::{remove_serialized, serialize};
use crate::upstream::{UpstreamCustomer, UpstreamPlan, UpstreamProduct, UpstreamSubscription};

/// Writes and removes the documents of one record kind inside a caller's transaction.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn upsert(&self, txn: &mut dyn Transaction, payload: &Value) -> Result<DocumentRef>;

    /// Returns every deleted reference, descendants included.
    async fn remove(&self, txn: &mut dyn Transaction, payload: &Value) -> Result<Vec<DocumentRef>>;

    /// Id that a resync must keep, or `None` when the object is no longer live.
    fn live_id(&self, payload: &Value) -> Result<Option<String>>;
}

/// A payload shape that projects into a canonical record.
pub trait UpstreamObject: DeserializeOwned + Send + Sync + 'static {
    type Record: Record;

    fn project(&self) -> Self::Record;

    fn parent(&self) -> Option<DocumentRef> {
        None
    }

    fn children(&self) -> Vec<DocumentRef> {
        Vec::new()
    }

    fn is_live(&self) -> bool {
        true
    }
}

impl UpstreamObject for UpstreamSubscription {
    type Record = Subscription;

    fn project(&self) -> Subscription {
        self.to_record()
    }

    fn parent(&self) -> Option<DocumentRef> {
        let customer = self.customer_id();
        (!customer.is_empty()).then(|| DocumentRef::new(COLLECTION_CUSTOMERS, customer))
    }

    fn is_live(&self) -> bool {
        UpstreamSubscription::is_live(self)
    }
}

impl UpstreamObject for UpstreamCustomer {
    type Record = Customer;

    fn project(&self) -> Customer {
        self.to_record()
    }

    /// Subscriptions go with their customer.
    fn children(&self) -> Vec<DocumentRef> {
        self.subscription_ids()
            .into_iter()
            .map(|id| DocumentRef::new(COLLECTION_SUBSCRIPTIONS, id))
            .collect()
    }
}

impl UpstreamObject for UpstreamPlan {
    type Record = Plan;

    fn project(&self) -> Plan {
        self.to_record()
    }

    fn parent(&self) -> Option<DocumentRef> {
        let product = self.product_id();
        (!product.is_empty()).then(|| DocumentRef::new(COLLECTION_PRODUCTS, product))
    }
}

impl UpstreamObject for UpstreamProduct {
    type Record = Product;

    fn project(&self) -> Product {
        self.to_record()
    }
}

/// Workspaces arrive in canonical form.
impl UpstreamObject for Workspace {
    type Record = Workspace;

    fn project(&self) -> Workspace {
        self.clone()
    }

    fn parent(&self) -> Option<DocumentRef> {
        (!self.subscription.is_empty())
            .then(|| DocumentRef::new(COLLECTION_SUBSCRIPTIONS, self.subscription.clone()))
    }
}

pub struct Handler<U> {
    _payload: PhantomData<fn() -> U>,
}

impl<U> Handler<U> {
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<U> Default for Handler<U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U: UpstreamObject> Handler<U> {
    fn parse(payload: &Value) -> Result<U> {
        Ok(U::deserialize(payload)?)
    }
}

#[async_trait]
impl<U: UpstreamObject> RecordHandler for Handler<U> {
    async fn upsert(&self, txn: &mut dyn Transaction, payload: &Value) -> Result<DocumentRef> {
        let object = Self::parse(payload)?;
        let record = object.project();
        serialize(
            txn,
            <U::Record as Record>::COLLECTION,
            &record,
            object.parent(),
            object.children(),
        )
    }

    async fn remove(&self, txn: &mut dyn Transaction, payload: &Value) -> Result<Vec<DocumentRef>> {
        let record = Self::parse(payload)?.project();
        remove_serialized(txn, <U::Record as Record>::COLLECTION, &record).await
    }

    fn live_id(&self, payload: &Value) -> Result<Option<String>> {
        let object = Self::parse(payload)?;
        if !object.is_live() {
            return Ok(None);
        }
        let identity = object.project().identity()?;
        Ok(Some(identity.document_id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_customer_children_are_subscriptions() {
        let customer: UpstreamCustomer = serde_json::from_value(json!({
            "id": "cus_1",
            "subscriptions": {"data": [{"id": "sub_1"}, "sub_2"]},
        }))
        .unwrap();
        assert_eq!(
            customer.children(),
            vec![
                DocumentRef::new("subscriptions", "sub_1"),
                DocumentRef::new("subscriptions", "sub_2"),
            ]
        );
    }

    #[test]
    fn test_live_id_skips_ended_subscriptions() {
        let handler = Handler::<UpstreamSubscription>::new();
        let live = handler
            .live_id(&json!({"id": "sub_1", "customer": "cus_1"}))
            .unwrap();
        assert_eq!(live.as_deref(), Some("sub_1"));
        let ended = handler
            .live_id(&json!({"id": "sub_2", "ended_at": 1700000000}))
            .unwrap();
        assert_eq!(ended, None);
    }

    #[test]
    fn test_workspace_parent() {
        let ws = Workspace {
            name: "myworkspace".to_string(),
            subscription: "acme".to_string(),
            ..Default::default()
        };
        assert_eq!(ws.parent(), Some(DocumentRef::new("subscriptions", "acme")));
    }
}
