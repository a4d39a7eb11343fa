use std::collections::HashSet;
use std::sync::Arc;

use billing_state::backend::MemoryDocumentStore;
use billing_state::{DocumentRef, Sweeper};
use serde_json::json;

fn live(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

fn seeded(collection: &str, ids: &[&str]) -> MemoryDocumentStore {
    let store = MemoryDocumentStore::new();
    for id in ids {
        store.put(DocumentRef::new(collection, *id), json!({"proto": {"id": id}}));
    }
    store
}

#[tokio::test]
async fn sweep_deletes_ids_missing_from_live_set() {
    let store = seeded("plans", &["a", "b", "c"]);
    store.put(DocumentRef::new("products", "c"), json!({}));
    let sweeper = Sweeper::new(Arc::new(store.clone()));

    let result = sweeper.sweep("plans", &live(&["a", "b"])).await.unwrap();

    assert_eq!(result.scanned, 3);
    assert_eq!(result.deleted, vec![DocumentRef::new("plans", "c")]);
    assert_eq!(store.ids("plans"), vec!["a", "b"]);
    assert_eq!(store.ids("products"), vec!["c"]);
}

#[tokio::test]
async fn sweep_with_everything_live_is_clean() {
    let store = seeded("plans", &["a", "b"]);
    let sweeper = Sweeper::new(Arc::new(store.clone()));

    let result = sweeper.sweep("plans", &live(&["a", "b", "z"])).await.unwrap();
    assert!(result.is_clean());
    assert_eq!(store.ids("plans"), vec!["a", "b"]);

    let empty = sweeper.sweep("customers", &live(&[])).await.unwrap();
    assert_eq!(empty.scanned, 0);
    assert!(empty.is_clean());
}

#[tokio::test]
async fn scoped_sweep_checks_subscription_prefix() {
    let store = seeded("workspaces", &["sub_1-ws", "sub_1-other-ws", "sub_2-ws", "loose"]);
    let sweeper = Sweeper::new(Arc::new(store.clone()));

    let result = sweeper
        .sweep_scoped("workspaces", &live(&["sub_1"]))
        .await
        .unwrap();

    assert_eq!(result.deleted_count(), 1);
    assert_eq!(result.deleted, vec![DocumentRef::new("workspaces", "sub_2-ws")]);
    assert_eq!(
        store.ids("workspaces"),
        vec!["loose", "sub_1-other-ws", "sub_1-ws"]
    );
}
