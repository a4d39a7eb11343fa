// ABOUTME: Payment-provider object shapes and their projection into canonical records
// ABOUTME: Nullable upstream fields, expandable references and the paged listing seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::model::{
    Address, Customer, Plan, PlanScope, Product, RecordKind, Subscription, SubscriptionItem,
    SubscriptionState,
};

/// Product ids with this suffix carry self-serve plans.
pub const PUBLIC_PRODUCT_SUFFIX: &str = "-site";

const DEFAULT_CURRENCY: &str = "USD";

pub trait HasId {
    fn id(&self) -> &str;
}

/// A reference the provider sends either as a bare id or as the expanded object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

impl<T: HasId> Expandable<T> {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object(object) => object.id(),
        }
    }

    pub fn object(&self) -> Option<&T> {
        match self {
            Expandable::Object(object) => Some(object.as_ref()),
            Expandable::Id(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectId {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct List<T> {
    pub data: Vec<T>,
    pub has_more: bool,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            has_more: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamAddress {
    pub city: Option<String>,
    pub country: Option<String>,
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub postal_code: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamProduct {
    pub id: String,
    pub active: bool,
    pub description: Option<String>,
    pub name: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamPlan {
    pub id: String,
    pub active: bool,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub interval: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
    pub nickname: Option<String>,
    pub product: Option<Expandable<UpstreamProduct>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSubscriptionItem {
    pub id: String,
    pub metadata: Option<BTreeMap<String, String>>,
    pub plan: Option<UpstreamPlan>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamDiscount {
    pub coupon: Option<ObjectId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSubscription {
    pub id: String,
    pub customer: Option<Expandable<UpstreamCustomer>>,
    pub items: Option<List<UpstreamSubscriptionItem>>,
    pub plan: Option<UpstreamPlan>,
    pub discount: Option<UpstreamDiscount>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub canceled_at: Option<i64>,
    pub ended_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamCustomer {
    pub id: String,
    pub delinquent: bool,
    pub description: Option<String>,
    pub email: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub subscriptions: Option<List<Expandable<UpstreamSubscription>>>,
    pub address: Option<UpstreamAddress>,
    pub default_source: Option<Expandable<ObjectId>>,
}

impl HasId for ObjectId {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for UpstreamProduct {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for UpstreamSubscription {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for UpstreamCustomer {
    fn id(&self) -> &str {
        &self.id
    }
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn timestamp_set(value: Option<i64>) -> bool {
    value.unwrap_or(0) != 0
}

impl UpstreamProduct {
    pub fn to_record(&self) -> Product {
        Product {
            id: self.id.clone(),
            active: self.active,
            description: text(&self.description),
            name: text(&self.name),
            metadata: self.metadata.clone().unwrap_or_default(),
        }
    }
}

impl UpstreamPlan {
    pub fn product_id(&self) -> &str {
        self.product.as_ref().map(Expandable::id).unwrap_or_default()
    }

    pub fn scope(&self) -> PlanScope {
        if self.product_id().ends_with(PUBLIC_PRODUCT_SUFFIX) {
            PlanScope::Public
        } else {
            PlanScope::Enterprise
        }
    }

    pub fn to_record(&self) -> Plan {
        let currency = match self.currency.as_deref() {
            Some(currency) if !currency.is_empty() => currency.to_ascii_uppercase(),
            _ => DEFAULT_CURRENCY.to_string(),
        };
        Plan {
            id: self.id.clone(),
            active: self.active,
            amount: self.amount.unwrap_or(0),
            currency,
            interval: text(&self.interval),
            metadata: self.metadata.clone().unwrap_or_default(),
            nickname: text(&self.nickname),
            product: self.product_id().to_string(),
            scope: self.scope() as i32,
        }
    }
}

impl UpstreamSubscription {
    pub fn customer_id(&self) -> &str {
        self.customer.as_ref().map(Expandable::id).unwrap_or_default()
    }

    /// Neither ended nor canceled.
    pub fn is_live(&self) -> bool {
        !timestamp_set(self.ended_at) && !timestamp_set(self.canceled_at)
    }

    pub fn state(&self) -> SubscriptionState {
        if timestamp_set(self.canceled_at) {
            return SubscriptionState::Cancelled;
        }
        let delinquent = self
            .customer
            .as_ref()
            .and_then(Expandable::object)
            .map(|customer| customer.delinquent)
            .unwrap_or(false);
        if delinquent {
            SubscriptionState::Delinquent
        } else {
            SubscriptionState::Active
        }
    }

    pub fn to_record(&self) -> Subscription {
        let items = self
            .items
            .as_ref()
            .map(|list| {
                list.data
                    .iter()
                    .map(|item| SubscriptionItem {
                        id: item.id.clone(),
                        metadata: item.metadata.clone().unwrap_or_default(),
                        plan: item.plan.as_ref().map(|p| p.id.clone()).unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let coupon = self
            .discount
            .as_ref()
            .and_then(|d| d.coupon.as_ref())
            .map(|c| c.id.clone())
            .unwrap_or_default();

        Subscription {
            id: self.id.clone(),
            name: self.id.clone(),
            customer: self.customer_id().to_string(),
            items,
            active: self.plan.as_ref().map(|p| p.active).unwrap_or(false),
            coupon,
            state: self.state() as i32,
            current_period_start: self.current_period_start.unwrap_or(0),
            current_period_end: self.current_period_end.unwrap_or(0),
        }
    }
}

impl UpstreamCustomer {
    pub fn subscription_ids(&self) -> Vec<String> {
        self.subscriptions
            .as_ref()
            .map(|list| list.data.iter().map(|s| s.id().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn to_record(&self) -> Customer {
        let address = self.address.as_ref().map(|a| Address {
            city: text(&a.city),
            country: text(&a.country),
            line1: text(&a.line1),
            line2: text(&a.line2),
            postal_code: text(&a.postal_code),
            state: text(&a.state),
        });
        Customer {
            id: self.id.clone(),
            description: text(&self.description),
            email: text(&self.email),
            metadata: self.metadata.clone().unwrap_or_default(),
            name: text(&self.name),
            phone: text(&self.phone),
            subscriptions: self.subscription_ids(),
            address,
            default_source: self
                .default_source
                .as_ref()
                .map(|s| s.id().to_string())
                .unwrap_or_default(),
        }
    }
}

/// One page of a provider listing, as raw objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub has_more: bool,
}

impl Page {
    /// Id of the last object, used as the cursor for the next page.
    pub fn last_id(&self) -> Option<&str> {
        self.items.last().and_then(|item| item.get("id")).and_then(Value::as_str)
    }
}

/// Paged listing of every object of a kind held by the payment provider.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn list(&self, kind: RecordKind, starting_after: Option<&str>) -> Result<Page>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_scope_from_product_suffix() {
        let plan: UpstreamPlan = serde_json::from_value(json!({
            "id": "plan_1",
            "product": "prod_team-site",
            "currency": "usd",
            "amount": 1500,
        }))
        .unwrap();
        let record = plan.to_record();
        assert_eq!(record.scope, PlanScope::Public as i32);
        assert_eq!(record.product, "prod_team-site");
        assert_eq!(record.currency, "USD");

        let enterprise: UpstreamPlan = serde_json::from_value(json!({
            "id": "plan_2",
            "product": {"id": "prod_big", "name": "Big"},
        }))
        .unwrap();
        assert_eq!(enterprise.scope(), PlanScope::Enterprise);
        assert_eq!(enterprise.product_id(), "prod_big");
    }

    #[test]
    fn test_subscription_projection() {
        let sub: UpstreamSubscription = serde_json::from_value(json!({
            "id": "sub_1",
            "customer": {"id": "cus_1", "delinquent": true},
            "items": {"data": [{"id": "si_1", "plan": {"id": "plan_1"}, "metadata": null}]},
            "plan": {"id": "plan_1", "active": true},
            "discount": {"coupon": {"id": "SPRING"}},
            "current_period_start": 10,
            "current_period_end": 20,
            "canceled_at": null,
        }))
        .unwrap();
        assert!(sub.is_live());
        let record = sub.to_record();
        assert_eq!(record.customer, "cus_1");
        assert_eq!(record.items[0].plan, "plan_1");
        assert_eq!(record.coupon, "SPRING");
        assert_eq!(record.state, SubscriptionState::Delinquent as i32);
        assert!(record.active);
    }

    #[test]
    fn test_canceled_subscription_is_not_live() {
        let sub: UpstreamSubscription = serde_json::from_value(json!({
            "id": "sub_2",
            "customer": "cus_1",
            "canceled_at": 1700000000,
        }))
        .unwrap();
        assert!(!sub.is_live());
        assert_eq!(sub.state(), SubscriptionState::Cancelled);
    }

    #[test]
    fn test_customer_projection() {
        let customer: UpstreamCustomer = serde_json::from_value(json!({
            "id": "cus_1",
            "email": "ops@example.com",
            "subscriptions": {"data": ["sub_1", {"id": "sub_2"}]},
            "address": {"city": "Berlin", "line2": null},
            "default_source": "card_1",
        }))
        .unwrap();
        let record = customer.to_record();
        assert_eq!(record.subscriptions, vec!["sub_1", "sub_2"]);
        assert_eq!(record.address.unwrap().city, "Berlin");
        assert_eq!(record.default_source, "card_1");
        assert_eq!(record.name, "");
    }
}
