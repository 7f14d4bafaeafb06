use std::time::Duration;

use chrono::Utc;
use courier::agents::Agent;
use courier::envelope::{Envelope, EnvelopeStatus};
use courier::envelope_store::EnvelopeStore;
use courier::locking::{AdvisoryLocks, LockId, LockSession};
use courier::recovery::DurabilityAgent;
use courier::scheduler::{DispatchSummary, ScheduledJobs};
use courier::storage::memory::MemoryEnvelopeStore;
use courier::testing::{fast_settings, TestNode};
use courier::types::EndpointUri;

const REMINDERS: &str = "local://reminders";

fn reminder(at: chrono::DateTime<Utc>) -> Envelope {
    Envelope::new("Reminder", b"{}".to_vec())
        .with_destination(EndpointUri::new(REMINDERS))
        .scheduled_for(at)
}

#[tokio::test]
async fn scheduled_envelope_is_dispatched_once_due() {
    let store = MemoryEnvelopeStore::new("main", fast_settings()).unwrap();
    let node = TestNode::new(1, &store);
    let listener = node.listen(REMINDERS);

    let now = Utc::now();
    let e1 = reminder(now + chrono::Duration::seconds(2));
    store.schedule(&e1).await.unwrap();

    let early = node
        .recovery
        .dispatch_scheduled(now + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(early, DispatchSummary::default());
    assert!(store
        .load_ready_incoming(&EndpointUri::new(REMINDERS), 10)
        .await
        .unwrap()
        .is_empty());

    let due = node
        .recovery
        .dispatch_scheduled(now + chrono::Duration::seconds(4))
        .await
        .unwrap();
    assert_eq!(
        due,
        DispatchSummary {
            released: 1,
            enqueued: 1
        }
    );
    let received = listener.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, e1.id);
    assert_eq!(received[0].status, EnvelopeStatus::Incoming);
    assert_eq!(received[0].owner_id, node.id());
}

#[tokio::test]
async fn released_envelopes_never_return_to_scheduled() {
    let store = MemoryEnvelopeStore::new("main", fast_settings()).unwrap();
    let now = Utc::now();
    let envelope = reminder(now);
    store.schedule(&envelope).await.unwrap();

    let released = store.dispatch_due(now, 10).await.unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].scheduled_time, None);

    // A later tick must not release it again.
    let later = now + chrono::Duration::minutes(5);
    assert!(store.dispatch_due(later, 10).await.unwrap().is_empty());
    let counts = store.fetch_counts().await.unwrap();
    assert_eq!(counts.scheduled, 0);
    assert_eq!(counts.incoming, 1);
}

#[tokio::test]
async fn due_envelopes_are_released_in_due_order() {
    let store = MemoryEnvelopeStore::new("main", fast_settings()).unwrap();
    let now = Utc::now();
    let late = reminder(now - chrono::Duration::seconds(1));
    let early = reminder(now - chrono::Duration::seconds(10));
    let future = reminder(now + chrono::Duration::seconds(10));
    for envelope in [&late, &early, &future] {
        store.schedule(envelope).await.unwrap();
    }

    let released: Vec<_> = store
        .dispatch_due(now, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(released, vec![early.id, late.id]);
}

#[tokio::test]
async fn dispatch_respects_batch_limit() {
    let store = MemoryEnvelopeStore::new("main", fast_settings()).unwrap();
    let now = Utc::now();
    for _ in 0..5 {
        store.schedule(&reminder(now)).await.unwrap();
    }
    assert_eq!(store.dispatch_due(now, 3).await.unwrap().len(), 3);
    assert_eq!(store.dispatch_due(now, 3).await.unwrap().len(), 2);
}

#[tokio::test]
async fn dispatch_is_skipped_while_another_node_holds_the_lock() {
    let settings = fast_settings();
    let store = MemoryEnvelopeStore::new("main", settings.clone()).unwrap();
    let now = Utc::now();
    store.schedule(&reminder(now)).await.unwrap();

    let mut session = store.lock_session().await.unwrap();
    assert!(session
        .try_get_lock(LockId::scheduled_jobs(&settings.schema_name))
        .await
        .unwrap());
    assert!(store.dispatch_due(now, 10).await.unwrap().is_empty());

    session.close().await.unwrap();
    assert_eq!(store.dispatch_due(now, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn released_envelope_without_local_listener_stays_unowned() {
    let store = MemoryEnvelopeStore::new("main", fast_settings()).unwrap();
    let node = TestNode::new(1, &store);
    let now = Utc::now();
    store.schedule(&reminder(now)).await.unwrap();

    let summary = node.recovery.dispatch_scheduled(now).await.unwrap();
    assert_eq!(summary.released, 1);
    assert_eq!(summary.enqueued, 0);

    let ready = store
        .load_ready_incoming(&EndpointUri::new(REMINDERS), 10)
        .await
        .unwrap();
    assert_eq!(ready.len(), 1);
    assert!(ready[0].owner_id.is_any());
}

#[tokio::test]
async fn rescheduled_envelope_waits_for_its_new_time() {
    let store = MemoryEnvelopeStore::new("main", fast_settings()).unwrap();
    let now = Utc::now();
    store.schedule(&reminder(now)).await.unwrap();
    let released = store.dispatch_due(now, 10).await.unwrap();

    let retry_at = now + chrono::Duration::seconds(30);
    store
        .reschedule_incoming(&released[0], retry_at)
        .await
        .unwrap();
    assert!(store.dispatch_due(now, 10).await.unwrap().is_empty());
    assert_eq!(store.dispatch_due(retry_at, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn durability_agent_dispatches_scheduled_envelopes_in_real_time() {
    let store = MemoryEnvelopeStore::new("main", fast_settings()).unwrap();
    let node = TestNode::new(1, &store);
    let listener = node.listen(REMINDERS);
    let envelope = reminder(Utc::now() + chrono::Duration::milliseconds(100));
    store.schedule(&envelope).await.unwrap();

    let agent = DurabilityAgent::new(node.recovery);
    agent.start().await.unwrap();
    assert!(agent.is_running());

    tokio::time::timeout(Duration::from_secs(5), async {
        while listener.received().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("scheduled envelope was not dispatched");

    agent.stop().await.unwrap();
    assert!(!agent.is_running());
    assert_eq!(listener.received()[0].id, envelope.id);
}
