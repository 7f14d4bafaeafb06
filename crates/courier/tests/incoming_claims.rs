use std::collections::HashSet;
use std::sync::Arc;

use courier::envelope::Envelope;
use courier::envelope_store::{EnvelopeStore, MessageStore};
use courier::error::DurableError;
use courier::storage::memory::MemoryEnvelopeStore;
use courier::testing::fast_settings;
use courier::types::{EndpointUri, NodeId};
use uuid::Uuid;

const ORDERS: &str = "local://orders";

/// Store `count` envelopes at `destination`, then release them so any node may claim them.
async fn unclaimed(store: &MemoryEnvelopeStore, count: usize) -> Vec<Uuid> {
    let receiver = NodeId::new(99);
    let envelopes: Vec<Envelope> = (0..count)
        .map(|i| {
            Envelope::new("OrderPlaced", format!("{{\"n\":{i}}}").into_bytes())
                .with_destination(EndpointUri::new(ORDERS))
                .owned_by(receiver)
        })
        .collect();
    store.store_incoming_batch(&envelopes).await.unwrap();
    store.release_ownership(receiver, None).await.unwrap();
    envelopes.iter().map(|e| e.id).collect()
}

#[tokio::test]
async fn two_workers_claim_disjoint_sets() {
    let store = MemoryEnvelopeStore::new("main", fast_settings()).unwrap();
    let ids = unclaimed(&store, 10).await;
    let destination = EndpointUri::new(ORDERS);

    let mut workers = Vec::new();
    for node in [1, 2] {
        let store: Arc<dyn MessageStore> = Arc::new(store.clone());
        let destination = destination.clone();
        workers.push(tokio::spawn(async move {
            let ready = store.load_ready_incoming(&destination, 10).await.unwrap();
            let ready: Vec<Uuid> = ready.iter().map(|e| e.id).collect();
            store
                .claim_incoming(&ready, NodeId::new(node))
                .await
                .unwrap()
        }));
    }

    let mut claimed: Vec<Vec<Envelope>> = Vec::new();
    for worker in workers {
        claimed.push(worker.await.unwrap());
    }

    let first: HashSet<Uuid> = claimed[0].iter().map(|e| e.id).collect();
    let second: HashSet<Uuid> = claimed[1].iter().map(|e| e.id).collect();
    assert!(first.is_disjoint(&second));
    let union: HashSet<Uuid> = first.union(&second).copied().collect();
    assert_eq!(union, ids.into_iter().collect::<HashSet<_>>());
}

#[tokio::test]
async fn concurrent_claims_never_double_assign() {
    let store = MemoryEnvelopeStore::new("main", fast_settings()).unwrap();
    let ids = unclaimed(&store, 50).await;

    let mut workers = Vec::new();
    for node in 1..=8 {
        let store = store.clone();
        let ids = ids.clone();
        workers.push(tokio::spawn(async move {
            let claimed = store.claim_incoming(&ids, NodeId::new(node)).await.unwrap();
            (node, claimed)
        }));
    }

    let mut seen = HashSet::new();
    for worker in workers {
        let (node, claimed) = worker.await.unwrap();
        for envelope in claimed {
            assert_eq!(envelope.owner_id, NodeId::new(node));
            assert!(seen.insert(envelope.id), "{} claimed twice", envelope.id);
        }
    }
    assert_eq!(seen.len(), ids.len());

    let destination = EndpointUri::new(ORDERS);
    assert!(store
        .load_ready_incoming(&destination, 100)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn ready_incoming_is_returned_in_arrival_order() {
    let store = MemoryEnvelopeStore::new("main", fast_settings()).unwrap();
    let ids = unclaimed(&store, 5).await;
    let ready = store
        .load_ready_incoming(&EndpointUri::new(ORDERS), 3)
        .await
        .unwrap();
    let ready: Vec<Uuid> = ready.iter().map(|e| e.id).collect();
    assert_eq!(ready, ids[..3]);
}

#[tokio::test]
async fn duplicate_incoming_is_rejected_and_not_stored_twice() {
    let store = MemoryEnvelopeStore::new("main", fast_settings()).unwrap();
    let envelope = Envelope::new("OrderPlaced", b"{}".to_vec())
        .with_destination(EndpointUri::new(ORDERS))
        .owned_by(NodeId::new(1));

    store.store_incoming(&envelope).await.unwrap();
    let err = store.store_incoming(&envelope).await.unwrap_err();
    assert!(matches!(err, DurableError::DuplicateEnvelope { id } if id == envelope.id));
    assert_eq!(store.fetch_counts().await.unwrap().incoming, 1);
}

#[tokio::test]
async fn batch_with_duplicate_writes_nothing() {
    let store = MemoryEnvelopeStore::new("main", fast_settings()).unwrap();
    let existing = Envelope::new("OrderPlaced", b"{}".to_vec())
        .with_destination(EndpointUri::new(ORDERS))
        .owned_by(NodeId::new(1));
    store.store_incoming(&existing).await.unwrap();

    let fresh = Envelope::new("OrderPlaced", b"{}".to_vec())
        .with_destination(EndpointUri::new(ORDERS))
        .owned_by(NodeId::new(1));
    let err = store
        .store_incoming_batch(&[fresh.clone(), existing.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, DurableError::DuplicateEnvelope { id } if id == existing.id));

    let stored: Vec<Uuid> = store
        .all_incoming()
        .await
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(stored, vec![existing.id]);
}

#[tokio::test]
async fn handled_envelopes_are_not_ready() {
    let store = MemoryEnvelopeStore::new("main", fast_settings()).unwrap();
    let ids = unclaimed(&store, 2).await;
    let claimed = store.claim_incoming(&ids[..1], NodeId::new(1)).await.unwrap();
    store.mark_handled(&claimed).await.unwrap();
    store.release_ownership(NodeId::new(1), None).await.unwrap();

    let ready = store
        .load_ready_incoming(&EndpointUri::new(ORDERS), 10)
        .await
        .unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, ids[1]);
    assert_eq!(store.fetch_counts().await.unwrap().handled, 1);
}
