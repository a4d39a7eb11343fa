use std::sync::Arc;
use std::time::Duration;

use billing_state::backend::{MemoryDocumentStore, MemoryLocks, MemorySets, MemoryUpstream};
use billing_state::model::{PlanScope, RecordKind, Subscription, SubscriptionState};
use billing_state::webhook::MAX_BODY_BYTES;
use billing_state::{DocumentRef, StateConfig, StateError, StateManager, WebhookHandler};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn manager() -> (Arc<StateManager>, MemoryDocumentStore) {
    let store = MemoryDocumentStore::new();
    let manager = StateManager::new(
        StateConfig::default(),
        Arc::new(MemoryLocks::new()),
        Arc::new(MemorySets::new()),
        Arc::new(store.clone()),
    );
    (Arc::new(manager), store)
}

fn bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap()
}

fn upstream_subscription(id: &str, customer: &str) -> Value {
    json!({
        "id": id,
        "object": "subscription",
        "customer": customer,
        "items": {"data": [{"id": format!("si_{id}"), "plan": {"id": "plan_1"}}]},
        "plan": {"id": "plan_1", "active": true},
        "current_period_start": 1700000000,
        "current_period_end": 1702592000,
        "canceled_at": null,
        "ended_at": null,
    })
}

#[tokio::test]
async fn create_or_update_projects_provider_objects() {
    let (manager, store) = manager();

    let reference = manager
        .create_or_update(
            RecordKind::Subscription,
            &bytes(&upstream_subscription("sub_1", "cus_1")),
        )
        .await
        .unwrap();
    assert_eq!(reference.path(), "subscriptions/sub_1");
    let fields = store.get(&reference).unwrap();
    assert_eq!(fields["proto"]["customer"], json!("cus_1"));
    assert_eq!(fields["proto"]["items"][0]["plan"], json!("plan_1"));
    assert_eq!(fields["parent"]["id"], json!("cus_1"));

    let plan = json!({"id": "plan_9", "product": "prod_team-site", "amount": 900});
    manager
        .create_or_update(RecordKind::Plan, &bytes(&plan))
        .await
        .unwrap();
    let fields = store.get(&DocumentRef::new("plans", "plan_9")).unwrap();
    assert_eq!(fields["proto"]["scope"], json!(PlanScope::Public as i32));

    let ws = json!({"name": "myworkspace", "subscription": "sub_1"});
    let reference = manager
        .create_or_update(RecordKind::Workspace, &bytes(&ws))
        .await
        .unwrap();
    assert_eq!(reference.path(), "workspaces/sub_1-myworkspace");
}

#[tokio::test]
async fn malformed_payload_is_rejected() {
    let (manager, store) = manager();
    let err = manager
        .create_or_update(RecordKind::Plan, b"{not json")
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::Json(_)));

    let err = manager
        .create_or_update(RecordKind::Plan, &bytes(&json!({"amount": 5})))
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::Identity { .. }));
    assert!(store.ids("plans").is_empty());
}

#[tokio::test]
async fn deleting_a_customer_removes_its_subscriptions() {
    let (manager, store) = manager();
    for (id, customer) in [("sub_1", "cus_1"), ("sub_2", "cus_1"), ("sub_3", "cus_2")] {
        manager
            .create_or_update(
                RecordKind::Subscription,
                &bytes(&upstream_subscription(id, customer)),
            )
            .await
            .unwrap();
    }
    let customer = json!({
        "id": "cus_1",
        "email": "billing@example.com",
        "subscriptions": {"data": [{"id": "sub_1"}, {"id": "sub_2"}]},
    });
    manager
        .create_or_update(RecordKind::Customer, &bytes(&customer))
        .await
        .unwrap();

    let mut deleted = manager
        .delete(RecordKind::Customer, &bytes(&json!({"id": "cus_1", "deleted": true})))
        .await
        .unwrap();
    deleted.sort();

    assert_eq!(
        deleted,
        vec![
            DocumentRef::new("customers", "cus_1"),
            DocumentRef::new("subscriptions", "sub_1"),
            DocumentRef::new("subscriptions", "sub_2"),
        ]
    );
    assert_eq!(store.ids("subscriptions"), vec!["sub_3"]);
}

#[tokio::test]
async fn resync_rewrites_and_reconciles() {
    let (manager, store) = manager();
    store.put(DocumentRef::new("plans", "plan_old"), json!({"proto": {"id": "plan_old"}}));
    store.put(
        DocumentRef::new("workspaces", "sub_gone-ws"),
        json!({"proto": {"name": "ws"}}),
    );
    store.put(
        DocumentRef::new("workspaces", "sub_1-ws"),
        json!({"proto": {"name": "ws"}}),
    );

    let upstream = MemoryUpstream::with_page_size(1);
    upstream.insert(
        RecordKind::Subscription,
        upstream_subscription("sub_1", "cus_1"),
    );
    let mut canceled = upstream_subscription("sub_c", "cus_1");
    canceled["canceled_at"] = json!(1700000500);
    upstream.insert(RecordKind::Subscription, canceled);
    upstream.insert(
        RecordKind::Customer,
        json!({"id": "cus_1", "subscriptions": {"data": ["sub_1"]}}),
    );
    upstream.insert(RecordKind::Plan, json!({"id": "plan_1", "product": "prod_1"}));
    upstream.insert(RecordKind::Plan, json!({"id": "plan_2", "product": "prod_1"}));
    upstream.insert(RecordKind::Plan, json!({"amount": 5}));
    upstream.insert(RecordKind::Product, json!({"id": "prod_1", "name": "Team"}));

    let stats = manager.resync(&upstream).await.unwrap();

    assert_eq!(stats.written, 6);
    assert_eq!(stats.failed.len(), 1);
    assert!(!stats.is_success());
    assert_eq!(stats.deleted, 3);

    assert_eq!(store.ids("subscriptions"), vec!["sub_1"]);
    assert_eq!(store.ids("customers"), vec!["cus_1"]);
    assert_eq!(store.ids("plans"), vec!["plan_1", "plan_2"]);
    assert_eq!(store.ids("products"), vec!["prod_1"]);
    assert_eq!(store.ids("workspaces"), vec!["sub_1-ws"]);
}

#[tokio::test(start_paused = true)]
async fn watched_writes_reach_consumers() {
    let (manager, _store) = manager();
    let cancel = CancellationToken::new();
    let watch = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.watch(&cancel, "ds").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut sub = upstream_subscription("sub_1", "cus_1");
    sub["customer"] = json!({"id": "cus_1", "delinquent": true});
    manager
        .create_or_update(RecordKind::Subscription, &bytes(&sub))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let record: Subscription = manager
        .dequeue(&cancel, "ds", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(record.id, "sub_1");
    assert_eq!(record.state, SubscriptionState::Delinquent as i32);
    assert_eq!(record.current_period_end, 1702592000);

    cancel.cancel();
    watch.await.unwrap().unwrap();
}

#[tokio::test]
async fn webhook_status_codes() {
    let (manager, store) = manager();
    let webhook = WebhookHandler::new(manager);

    let oversized = vec![b' '; MAX_BODY_BYTES + 1];
    assert_eq!(webhook.handle(&oversized).await.status, 503);
    assert_eq!(webhook.handle(b"not json").await.status, 400);

    let ignored = json!({"type": "invoice.paid", "data": {"object": {"id": "in_1"}}});
    let response = webhook.handle(&bytes(&ignored)).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.message, "ignored");

    let created = json!({
        "type": "product.created",
        "data": {"object": {"id": "prod_1", "name": "Team", "active": true}},
    });
    assert_eq!(webhook.handle(&bytes(&created)).await.status, 200);
    assert_eq!(store.ids("products"), vec!["prod_1"]);

    let deleted = json!({
        "type": "product.deleted",
        "data": {"object": {"id": "prod_1", "deleted": true}},
    });
    assert_eq!(webhook.handle(&bytes(&deleted)).await.status, 200);
    assert!(store.ids("products").is_empty());

    let broken = json!({
        "type": "customer.subscription.created",
        "data": {"object": {"customer": "cus_1"}},
    });
    let response = webhook.handle(&bytes(&broken)).await;
    assert_eq!(response.status, 500);
    assert_eq!(response.message, "internal error");
    assert!(store.ids("subscriptions").is_empty());
}
