//! Runs against a real etcd when `COURIER_TEST_ETCD_ENDPOINTS` is set to a
//! comma-separated endpoint list, e.g. `http://localhost:2379`. Skipped otherwise.
#![cfg(feature = "etcd")]

mod common;

use std::sync::Arc;

use courier::envelope_store::{EnvelopeStore, MessageStore};
use courier::storage::etcd::EtcdEnvelopeStore;

const ENDPOINTS: &str = "COURIER_TEST_ETCD_ENDPOINTS";

async fn store(name: &str) -> Option<Arc<dyn MessageStore>> {
    let Ok(endpoints) = std::env::var(ENDPOINTS) else {
        eprintln!("{ENDPOINTS} not set, skipping");
        return None;
    };
    let endpoints: Vec<String> = endpoints.split(',').map(|e| e.trim().to_string()).collect();
    let store =
        EtcdEnvelopeStore::connect(name, &endpoints, "/courier-test/", common::isolated_settings())
            .await
            .unwrap();
    store.ensure_schema().await.unwrap();
    Some(Arc::new(store))
}

#[tokio::test]
async fn concurrent_claims_are_disjoint() {
    if let Some(store) = store("main").await {
        common::concurrent_claims_are_disjoint(store).await;
    }
}

#[tokio::test]
async fn claims_larger_than_one_transaction() {
    if let Some(store) = store("main").await {
        common::claims_larger_than_one_transaction(store).await;
    }
}

#[tokio::test]
async fn duplicates_are_rejected() {
    if let Some(store) = store("main").await {
        common::duplicates_are_rejected(store).await;
    }
}

#[tokio::test]
async fn dispatch_waits_for_the_scheduler_lock() {
    if let Some(store) = store("main").await {
        common::dispatch_waits_for_the_scheduler_lock(store).await;
    }
}

#[tokio::test]
async fn locks_are_not_reentrant() {
    if let Some(store) = store("main").await {
        common::locks_are_not_reentrant(store).await;
    }
}

#[tokio::test]
async fn tenant_leader_checks_liveness_in_the_registry() {
    let (Some(registry), Some(tenant)) = (store("main").await, store("tenant-red").await) else {
        return;
    };
    common::tenant_leader_checks_liveness_in_the_registry(registry, tenant).await;
}
