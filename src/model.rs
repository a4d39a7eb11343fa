// ABOUTME: Canonical billing records (protobuf-encoded, JSON-projected)
// ABOUTME: Each record type declares its document identity strategy up front

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StateError};

pub const COLLECTION_CUSTOMERS: &str = "customers";
pub const COLLECTION_SUBSCRIPTIONS: &str = "subscriptions";
pub const COLLECTION_WORKSPACES: &str = "workspaces";
pub const COLLECTION_PLANS: &str = "plans";
pub const COLLECTION_PRODUCTS: &str = "products";

/// How a record maps to a document id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStrategy {
    /// `collection/<id>`
    Id,
    /// `collection/<name>`
    Name,
    /// `collection/<scope>-<name>`, or `collection/<name>` when the scope is empty
    ScopedName,
}

impl IdentityStrategy {
    fn describe(self) -> &'static str {
        match self {
            IdentityStrategy::Id => "id",
            IdentityStrategy::Name | IdentityStrategy::ScopedName => "name",
        }
    }
}

/// A resolved document identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Id(String),
    Name {
        name: String,
        scope: Option<String>,
    },
}

impl Identity {
    pub fn document_id(&self) -> String {
        match self {
            Identity::Id(id) => id.clone(),
            Identity::Name {
                name,
                scope: Some(scope),
            } => format!("{}-{}", scope, name),
            Identity::Name { name, scope: None } => name.clone(),
        }
    }

    /// Envelope field holding the identity key, for collection queries.
    pub fn query_field(&self) -> &'static str {
        match self {
            Identity::Id(_) => "proto.id",
            Identity::Name { .. } => "proto.name",
        }
    }

    pub fn query_value(&self) -> &str {
        match self {
            Identity::Id(id) => id,
            Identity::Name { name, .. } => name,
        }
    }

    pub fn scope(&self) -> Option<&str> {
        match self {
            Identity::Name { scope, .. } => scope.as_deref(),
            Identity::Id(_) => None,
        }
    }
}

/// A canonical record that can be stored as a document and queued.
pub trait Record:
    prost::Message + Default + Clone + Serialize + DeserializeOwned + 'static
{
    const KIND: RecordKind;
    const COLLECTION: &'static str;
    const STRATEGY: IdentityStrategy;

    /// The id or name read by [`Record::STRATEGY`].
    fn identity_key(&self) -> &str;

    /// Qualifier for [`IdentityStrategy::ScopedName`].
    fn identity_scope(&self) -> Option<&str> {
        None
    }

    fn identity(&self) -> Result<Identity> {
        let key = self.identity_key();
        if key.is_empty() {
            return Err(StateError::Identity {
                kind: Self::KIND.as_str(),
                strategy: Self::STRATEGY.describe(),
            });
        }
        Ok(match Self::STRATEGY {
            IdentityStrategy::Id => Identity::Id(key.to_string()),
            IdentityStrategy::Name => Identity::Name {
                name: key.to_string(),
                scope: None,
            },
            IdentityStrategy::ScopedName => Identity::Name {
                name: key.to_string(),
                scope: self
                    .identity_scope()
                    .filter(|scope| !scope.is_empty())
                    .map(str::to_string),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Subscription,
    Customer,
    Plan,
    Product,
    Workspace,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Subscription,
        RecordKind::Customer,
        RecordKind::Plan,
        RecordKind::Product,
        RecordKind::Workspace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Subscription => "subscription",
            RecordKind::Customer => "customer",
            RecordKind::Plan => "plan",
            RecordKind::Product => "product",
            RecordKind::Workspace => "workspace",
        }
    }

    pub fn collection(&self) -> &'static str {
        match self {
            RecordKind::Subscription => COLLECTION_SUBSCRIPTIONS,
            RecordKind::Customer => COLLECTION_CUSTOMERS,
            RecordKind::Plan => COLLECTION_PLANS,
            RecordKind::Product => COLLECTION_PRODUCTS,
            RecordKind::Workspace => COLLECTION_WORKSPACES,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = StateError;

    fn from_str(value: &str) -> Result<Self> {
        RecordKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| StateError::UnknownKind(value.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SubscriptionState {
    Active = 0,
    Delinquent = 1,
    Cancelled = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PlanScope {
    Enterprise = 0,
    Public = 1,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionItem {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(btree_map = "string, string", tag = "2")]
    pub metadata: BTreeMap<String, String>,
    /// Plan id
    #[prost(string, tag = "3")]
    pub plan: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Subscription {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    /// Customer id
    #[prost(string, tag = "3")]
    pub customer: String,
    #[prost(message, repeated, tag = "4")]
    pub items: Vec<SubscriptionItem>,
    #[prost(bool, tag = "5")]
    pub active: bool,
    #[prost(string, tag = "6")]
    pub coupon: String,
    #[prost(enumeration = "SubscriptionState", tag = "7")]
    pub state: i32,
    #[prost(int64, tag = "8")]
    pub current_period_start: i64,
    #[prost(int64, tag = "9")]
    pub current_period_end: i64,
}

impl Record for Subscription {
    const KIND: RecordKind = RecordKind::Subscription;
    const COLLECTION: &'static str = COLLECTION_SUBSCRIPTIONS;
    const STRATEGY: IdentityStrategy = IdentityStrategy::Id;

    fn identity_key(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Address {
    #[prost(string, tag = "1")]
    pub city: String,
    #[prost(string, tag = "2")]
    pub country: String,
    #[prost(string, tag = "3")]
    pub line1: String,
    #[prost(string, tag = "4")]
    pub line2: String,
    #[prost(string, tag = "5")]
    pub postal_code: String,
    #[prost(string, tag = "6")]
    pub state: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Customer {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(string, tag = "3")]
    pub email: String,
    #[prost(btree_map = "string, string", tag = "4")]
    pub metadata: BTreeMap<String, String>,
    #[prost(string, tag = "5")]
    pub name: String,
    #[prost(string, tag = "6")]
    pub phone: String,
    /// Subscription ids
    #[prost(string, repeated, tag = "7")]
    pub subscriptions: Vec<String>,
    #[prost(message, optional, tag = "8")]
    pub address: Option<Address>,
    #[prost(string, tag = "9")]
    pub default_source: String,
}

impl Record for Customer {
    const KIND: RecordKind = RecordKind::Customer;
    const COLLECTION: &'static str = COLLECTION_CUSTOMERS;
    const STRATEGY: IdentityStrategy = IdentityStrategy::Id;

    fn identity_key(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Plan {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bool, tag = "2")]
    pub active: bool,
    /// Amount in the smallest currency unit
    #[prost(int64, tag = "3")]
    pub amount: i64,
    #[prost(string, tag = "4")]
    pub currency: String,
    #[prost(string, tag = "5")]
    pub interval: String,
    #[prost(btree_map = "string, string", tag = "6")]
    pub metadata: BTreeMap<String, String>,
    #[prost(string, tag = "7")]
    pub nickname: String,
    /// Product id
    #[prost(string, tag = "8")]
    pub product: String,
    #[prost(enumeration = "PlanScope", tag = "9")]
    pub scope: i32,
}

impl Record for Plan {
    const KIND: RecordKind = RecordKind::Plan;
    const COLLECTION: &'static str = COLLECTION_PLANS;
    const STRATEGY: IdentityStrategy = IdentityStrategy::Id;

    fn identity_key(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Product {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bool, tag = "2")]
    pub active: bool,
    #[prost(string, tag = "3")]
    pub description: String,
    #[prost(string, tag = "4")]
    pub name: String,
    #[prost(btree_map = "string, string", tag = "5")]
    pub metadata: BTreeMap<String, String>,
}

impl Record for Product {
    const KIND: RecordKind = RecordKind::Product;
    const COLLECTION: &'static str = COLLECTION_PRODUCTS;
    const STRATEGY: IdentityStrategy = IdentityStrategy::Id;

    fn identity_key(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Workspace {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Owning subscription id
    #[prost(string, tag = "2")]
    pub subscription: String,
    #[prost(string, tag = "3")]
    pub display_name: String,
    #[prost(btree_map = "string, string", tag = "4")]
    pub labels: BTreeMap<String, String>,
}

impl Record for Workspace {
    const KIND: RecordKind = RecordKind::Workspace;
    const COLLECTION: &'static str = COLLECTION_WORKSPACES;
    const STRATEGY: IdentityStrategy = IdentityStrategy::ScopedName;

    fn identity_key(&self) -> &str {
        &self.name
    }

    fn identity_scope(&self) -> Option<&str> {
        Some(&self.subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_identity() {
        let plan = Plan {
            id: "plan_123".to_string(),
            ..Default::default()
        };
        let identity = plan.identity().unwrap();
        assert_eq!(identity.document_id(), "plan_123");
        assert_eq!(identity.query_field(), "proto.id");
    }

    #[test]
    fn test_scoped_name_identity() {
        let ws = Workspace {
            name: "myworkspace".to_string(),
            subscription: "acme".to_string(),
            ..Default::default()
        };
        assert_eq!(ws.identity().unwrap().document_id(), "acme-myworkspace");

        let unscoped = Workspace {
            name: "myworkspace".to_string(),
            ..Default::default()
        };
        assert_eq!(unscoped.identity().unwrap().document_id(), "myworkspace");
    }

    #[test]
    fn test_empty_key_is_identity_error() {
        let err = Customer::default().identity().unwrap_err();
        assert!(matches!(
            err,
            StateError::Identity {
                kind: "customer",
                strategy: "id"
            }
        ));
    }

    #[test]
    fn test_record_kind_parse() {
        assert_eq!("plan".parse::<RecordKind>().unwrap(), RecordKind::Plan);
        assert_eq!(RecordKind::Workspace.collection(), COLLECTION_WORKSPACES);
        assert!(matches!(
            "invoice".parse::<RecordKind>(),
            Err(StateError::UnknownKind(kind)) if kind == "invoice"
        ));
    }
}
