mod common;

use std::sync::Arc;

use courier::envelope_store::MessageStore;
use courier::storage::memory::MemoryEnvelopeStore;

fn store(name: &str) -> Arc<dyn MessageStore> {
    Arc::new(MemoryEnvelopeStore::new(name, common::isolated_settings()).unwrap())
}

#[tokio::test]
async fn concurrent_claims_are_disjoint() {
    common::concurrent_claims_are_disjoint(store("main")).await;
}

#[tokio::test]
async fn claims_larger_than_one_transaction() {
    common::claims_larger_than_one_transaction(store("main")).await;
}

#[tokio::test]
async fn duplicates_are_rejected() {
    common::duplicates_are_rejected(store("main")).await;
}

#[tokio::test]
async fn dispatch_waits_for_the_scheduler_lock() {
    common::dispatch_waits_for_the_scheduler_lock(store("main")).await;
}

#[tokio::test]
async fn locks_are_not_reentrant() {
    common::locks_are_not_reentrant(store("main")).await;
}

#[tokio::test]
async fn tenant_leader_checks_liveness_in_the_registry() {
    common::tenant_leader_checks_liveness_in_the_registry(store("main"), store("tenant-red"))
        .await;
}
