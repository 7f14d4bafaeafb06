//! Store behaviour every backend must share. Each backend test file builds
//! fresh stores and runs these checks against them.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier::config::DurabilitySettings;
use courier::envelope::Envelope;
use courier::envelope_store::MessageStore;
use courier::error::DurableError;
use courier::locking::LockId;
use courier::nodes::NodeLifecycle;
use courier::recovery::DormantNodeReassignment;
use courier::testing::fast_settings;
use courier::types::{EndpointUri, NodeId, NodeIdentity};
use uuid::Uuid;

pub const ORDERS: &str = "local://orders";

/// Settings in a schema no other test run uses.
pub fn isolated_settings() -> DurabilitySettings {
    let suffix = Uuid::new_v4().simple().to_string();
    DurabilitySettings {
        schema_name: format!("courier_test_{}", &suffix[..12]),
        stale_node_timeout: Duration::from_secs(5),
        ..fast_settings()
    }
}

fn identity(id: i32) -> NodeIdentity {
    NodeIdentity::new(NodeId::new(id), format!("tcp://node-{id}"))
}

fn order(owner: NodeId) -> Envelope {
    Envelope::new("OrderPlaced", b"{}".to_vec())
        .with_destination(EndpointUri::new(ORDERS))
        .owned_by(owner)
}

async fn unclaimed(store: &dyn MessageStore, count: usize) -> HashSet<Uuid> {
    let receiver = NodeId::new(99);
    let envelopes: Vec<Envelope> = (0..count).map(|_| order(receiver)).collect();
    store.store_incoming_batch(&envelopes).await.unwrap();
    store.release_ownership(receiver, None).await.unwrap();
    envelopes.iter().map(|e| e.id).collect()
}

pub async fn concurrent_claims_are_disjoint(store: Arc<dyn MessageStore>) {
    let ids = unclaimed(store.as_ref(), 20).await;

    let mut workers = Vec::new();
    for node in [1, 2] {
        let store = Arc::clone(&store);
        workers.push(tokio::spawn(async move {
            let ready = store
                .load_ready_incoming(&EndpointUri::new(ORDERS), 20)
                .await
                .unwrap();
            let ready: Vec<Uuid> = ready.iter().map(|e| e.id).collect();
            store.claim_incoming(&ready, NodeId::new(node)).await.unwrap()
        }));
    }
    let mut claimed = Vec::new();
    for worker in workers {
        claimed.push(worker.await.unwrap());
    }

    let first: HashSet<Uuid> = claimed[0].iter().map(|e| e.id).collect();
    let second: HashSet<Uuid> = claimed[1].iter().map(|e| e.id).collect();
    assert!(first.is_disjoint(&second));
    let union: HashSet<Uuid> = first.union(&second).copied().collect();
    assert_eq!(union, ids);
}

pub async fn claims_larger_than_one_transaction(store: Arc<dyn MessageStore>) {
    let ids = unclaimed(store.as_ref(), 150).await;
    let ready: Vec<Uuid> = ids.iter().copied().collect();
    let claimed = store.claim_incoming(&ready, NodeId::new(1)).await.unwrap();
    assert_eq!(claimed.len(), 150);
    assert!(store
        .claim_incoming(&ready, NodeId::new(2))
        .await
        .unwrap()
        .is_empty());
}

pub async fn duplicates_are_rejected(store: Arc<dyn MessageStore>) {
    let existing = order(NodeId::new(1));
    store.store_incoming(&existing).await.unwrap();
    assert!(store
        .store_incoming(&existing)
        .await
        .unwrap_err()
        .is_duplicate());

    let fresh = order(NodeId::new(1));
    let err = store
        .store_incoming_batch(&[fresh.clone(), existing.clone()])
        .await
        .unwrap_err();
    assert!(err.is_duplicate());
    let stored: Vec<Uuid> = store.all_incoming().await.unwrap().iter().map(|e| e.id).collect();
    assert_eq!(stored, vec![existing.id]);
}

pub async fn dispatch_waits_for_the_scheduler_lock(store: Arc<dyn MessageStore>) {
    let now = Utc::now();
    let reminder = Envelope::new("Reminder", b"{}".to_vec())
        .with_destination(EndpointUri::new(ORDERS))
        .scheduled_for(now);
    store.schedule(&reminder).await.unwrap();

    let mut session = store.lock_session().await.unwrap();
    let lock = LockId::scheduled_jobs(&store.settings().schema_name);
    assert!(session.try_get_lock(lock).await.unwrap());
    assert!(store.dispatch_due(now, 10).await.unwrap().is_empty());

    session.close().await.unwrap();
    let released = store.dispatch_due(now, 10).await.unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].id, reminder.id);
}

pub async fn locks_are_not_reentrant(store: Arc<dyn MessageStore>) {
    let lock = LockId::from_name("courier-reentry");
    let mut session = store.lock_session().await.unwrap();
    assert!(session.try_get_lock(lock).await.unwrap());
    assert!(!session.try_get_lock(lock).await.unwrap());

    let err = tokio::time::timeout(Duration::from_secs(5), session.get_lock(lock))
        .await
        .expect("get_lock on a held lock must fail at once")
        .unwrap_err();
    assert!(matches!(err, DurableError::LockAlreadyHeld { .. }));

    // One release frees it for everyone else.
    session.release_lock(lock).await.unwrap();
    let mut other = store.lock_session().await.unwrap();
    assert!(other.try_get_lock(lock).await.unwrap());
    other.close().await.unwrap();
    session.close().await.unwrap();
}

/// `registry` is where nodes register and lock; `tenant` only holds envelopes.
pub async fn tenant_leader_checks_liveness_in_the_registry(
    registry: Arc<dyn MessageStore>,
    tenant: Arc<dyn MessageStore>,
) {
    let owner = NodeLifecycle::new(identity(1), Arc::clone(&registry));
    owner.start().await.unwrap();
    let envelope = order(NodeId::new(1));
    tenant.store_incoming(&envelope).await.unwrap();

    let leader =
        DormantNodeReassignment::new(identity(2), Arc::clone(&tenant), Arc::clone(&registry));
    assert!(leader.run(Utc::now()).await.unwrap().is_empty());
    let later = Utc::now() + chrono::Duration::hours(1);
    assert!(leader.run(later).await.unwrap().is_empty());
    assert_eq!(tenant.all_incoming().await.unwrap()[0].owner_id, NodeId::new(1));

    owner.shutdown().await.unwrap();
    assert_eq!(leader.run(Utc::now()).await.unwrap(), vec![NodeId::new(1)]);
    assert!(tenant.all_incoming().await.unwrap()[0].owner_id.is_any());
}
