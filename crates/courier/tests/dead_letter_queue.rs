use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier::config::DurabilitySettings;
use courier::dead_letters::{
    DeadLetterCount, DeadLetterFilter, DeadLetterGrouping, DeadLetterManager, DeadLetterQuery,
    DeadLetterSelector, DeadLetterStore, sweep_replayable,
};
use courier::envelope::{Envelope, EnvelopeStatus, ErrorReport};
use courier::envelope_store::{EnvelopeStore, MessageStore};
use courier::recovery::RecoveryStore;
use courier::storage::memory::MemoryEnvelopeStore;
use courier::testing::{fast_settings, TestNode};
use courier::types::{EndpointUri, NodeId};

fn settings(batch_size: usize) -> DurabilitySettings {
    DurabilitySettings {
        dead_letter_batch_size: batch_size,
        ..fast_settings()
    }
}

async fn fail(store: &MemoryEnvelopeStore, message_type: &str, exception: &str) -> Envelope {
    let envelope = Envelope::new(message_type, b"{}".to_vec())
        .with_destination(EndpointUri::new("local://orders"))
        .owned_by(NodeId::new(1));
    store.store_incoming(&envelope).await.unwrap();
    store.increment_attempts(&envelope).await.unwrap();
    store
        .move_to_dead_letter(&envelope, &ErrorReport::new(exception, "handler failed"))
        .await
        .unwrap();
    envelope
}

fn manager(store: &MemoryEnvelopeStore) -> DeadLetterManager {
    let store: Arc<dyn MessageStore> = Arc::new(store.clone());
    DeadLetterManager::new(store)
}

#[tokio::test]
async fn failed_envelope_moves_to_dead_letters_with_its_error() {
    let store = MemoryEnvelopeStore::new("main", settings(100)).unwrap();
    let envelope = fail(&store, "OrderPlaced", "TimeoutError").await;

    let counts = store.fetch_counts().await.unwrap();
    assert_eq!(counts.incoming, 0);
    assert_eq!(counts.dead_letters, 1);

    let record = store.load_dead_letter(envelope.id).await.unwrap().unwrap();
    assert_eq!(record.envelope.attempts, 1);
    assert_eq!(record.error.exception_type, "TimeoutError");
    assert_eq!(record.error.exception_message, "handler failed");
    assert!(!record.replayable);
    assert_eq!(record.expires_at, None);
}

#[tokio::test]
async fn replay_returns_envelope_to_incoming_unowned() {
    let store = MemoryEnvelopeStore::new("main", settings(100)).unwrap();
    let envelope = fail(&store, "OrderPlaced", "TimeoutError").await;

    let replayed = manager(&store)
        .replay(&DeadLetterSelector::Ids(vec![envelope.id]))
        .await
        .unwrap();
    assert_eq!(replayed, 1);

    assert!(store.load_dead_letter(envelope.id).await.unwrap().is_none());
    let incoming = store.all_incoming().await.unwrap();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].id, envelope.id);
    assert_eq!(incoming[0].status, EnvelopeStatus::Incoming);
    assert!(incoming[0].owner_id.is_any());
    assert_eq!(incoming[0].attempts, 0);
}

#[tokio::test]
async fn replayed_envelope_is_recovered_by_a_listening_node() {
    let store = MemoryEnvelopeStore::new("main", settings(100)).unwrap();
    let envelope = fail(&store, "OrderPlaced", "TimeoutError").await;
    manager(&store)
        .replay(&DeadLetterSelector::Filter(DeadLetterFilter::default()))
        .await
        .unwrap();

    let node = TestNode::new(2, &store);
    let listener = node.listen("local://orders");
    assert_eq!(node.recovery.recover_incoming().await.unwrap(), 1);
    assert_eq!(listener.received()[0].id, envelope.id);
}

#[tokio::test]
async fn replay_can_keep_attempt_counts() {
    let store = MemoryEnvelopeStore::new(
        "main",
        DurabilitySettings {
            reset_attempts_on_replay: false,
            ..settings(100)
        },
    )
    .unwrap();
    let envelope = fail(&store, "OrderPlaced", "TimeoutError").await;
    manager(&store)
        .replay(&DeadLetterSelector::Ids(vec![envelope.id]))
        .await
        .unwrap();
    assert_eq!(store.all_incoming().await.unwrap()[0].attempts, 1);
}

#[tokio::test]
async fn bulk_operations_run_in_batches_until_exhausted() {
    let store = MemoryEnvelopeStore::new("main", settings(2)).unwrap();
    for _ in 0..5 {
        fail(&store, "OrderPlaced", "TimeoutError").await;
    }
    let keep = fail(&store, "InvoiceSent", "TimeoutError").await;

    let by_type = DeadLetterSelector::Filter(DeadLetterFilter {
        message_type: Some("OrderPlaced".into()),
        ..Default::default()
    });
    assert_eq!(manager(&store).discard(&by_type).await.unwrap(), 5);

    let remaining = store
        .query_dead_letters(&DeadLetterQuery::default())
        .await
        .unwrap();
    assert_eq!(remaining.total_count, 1);
    assert_eq!(remaining.records[0].id(), keep.id);
}

#[tokio::test]
async fn replay_by_ids_chunks_large_selections() {
    let store = MemoryEnvelopeStore::new("main", settings(2)).unwrap();
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(fail(&store, "OrderPlaced", "TimeoutError").await.id);
    }
    let replayed = manager(&store)
        .replay(&DeadLetterSelector::Ids(ids))
        .await
        .unwrap();
    assert_eq!(replayed, 5);
    let counts = store.fetch_counts().await.unwrap();
    assert_eq!(counts.dead_letters, 0);
    assert_eq!(counts.incoming, 5);
}

#[tokio::test]
async fn query_pages_in_failure_order() {
    let store = MemoryEnvelopeStore::new("main", settings(100)).unwrap();
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(fail(&store, "OrderPlaced", "TimeoutError").await.id);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let page = manager(&store)
        .query(&DeadLetterQuery {
            filter: DeadLetterFilter::default(),
            page: 1,
            page_size: 2,
        })
        .await
        .unwrap();
    assert_eq!(page.total_count, 5);
    let page_ids: Vec<_> = page.records.iter().map(|r| r.id()).collect();
    assert_eq!(page_ids, ids[2..4]);
}

#[tokio::test]
async fn summary_groups_by_exception_type() {
    let store = MemoryEnvelopeStore::new("main", settings(100)).unwrap();
    fail(&store, "OrderPlaced", "TimeoutError").await;
    fail(&store, "InvoiceSent", "TimeoutError").await;
    fail(&store, "OrderPlaced", "ValidationError").await;

    let summary = manager(&store)
        .summarize(DeadLetterGrouping::ExceptionType)
        .await
        .unwrap();
    assert_eq!(
        summary,
        vec![
            DeadLetterCount {
                key: "TimeoutError".into(),
                count: 2
            },
            DeadLetterCount {
                key: "ValidationError".into(),
                count: 1
            },
        ]
    );
}

#[tokio::test]
async fn dead_letters_expire_when_enabled() {
    let store = MemoryEnvelopeStore::new(
        "main",
        DurabilitySettings {
            dead_letter_queue_expiration_enabled: true,
            dead_letter_queue_expiration: Duration::from_secs(60),
            ..settings(100)
        },
    )
    .unwrap();
    let envelope = fail(&store, "OrderPlaced", "TimeoutError").await;
    let record = store.load_dead_letter(envelope.id).await.unwrap().unwrap();
    assert!(record.expires_at.is_some());

    let sweep = store.delete_expired(Utc::now()).await.unwrap();
    assert_eq!(sweep.dead_letters, 0);

    let sweep = store
        .delete_expired(Utc::now() + chrono::Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(sweep.dead_letters, 1);
    assert!(store.load_dead_letter(envelope.id).await.unwrap().is_none());
}

#[tokio::test]
async fn replay_sweep_with_zero_batch_size_still_finishes() {
    let store = MemoryEnvelopeStore::new("main", settings(100)).unwrap();
    for _ in 0..3 {
        fail(&store, "OrderPlaced", "TimeoutError").await;
    }
    store
        .mark_dead_letters_replayable(&DeadLetterSelector::Filter(DeadLetterFilter::default()), 100)
        .await
        .unwrap();

    let replayed = tokio::time::timeout(Duration::from_secs(5), sweep_replayable(&store, 0, true))
        .await
        .expect("replay sweep did not finish")
        .unwrap();
    assert_eq!(replayed, 3);
    assert_eq!(store.fetch_counts().await.unwrap().dead_letters, 0);
}

#[test]
fn store_rejects_zero_dead_letter_batch_size() {
    assert!(MemoryEnvelopeStore::new("main", settings(0)).is_err());
}
