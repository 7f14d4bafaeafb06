//! Node liveness: registration, heartbeats and dormant-node detection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::to_chrono;
use crate::envelope_store::MessageStore;
use crate::error::DurableError;
use crate::locking::{LockId, LockSession};
use crate::types::{NodeId, NodeIdentity};

/// Persisted liveness record of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub uri: String,
    pub weight: i32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(node: &NodeIdentity, now: DateTime<Utc>) -> Self {
        Self {
            id: node.id,
            uri: node.uri.clone(),
            weight: node.weight,
            started_at: now,
            last_heartbeat: now,
        }
    }

    /// A node is dormant once its last heartbeat is older than `stale_after`.
    pub fn is_dormant(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now - self.last_heartbeat > to_chrono(stale_after)
    }
}

#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Insert or replace the record for `node`, stamping a fresh heartbeat.
    async fn register_node(&self, node: &NodeIdentity) -> Result<(), DurableError>;

    async fn heartbeat(&self, node: NodeId) -> Result<(), DurableError>;

    async fn unregister_node(&self, node: NodeId) -> Result<(), DurableError>;

    async fn nodes(&self) -> Result<Vec<NodeRecord>, DurableError>;

    async fn live_nodes(&self, stale_after: Duration) -> Result<Vec<NodeRecord>, DurableError> {
        Ok(partition_nodes(self.nodes().await?, Utc::now(), stale_after).0)
    }

    async fn dormant_nodes(&self, stale_after: Duration) -> Result<Vec<NodeRecord>, DurableError> {
        Ok(partition_nodes(self.nodes().await?, Utc::now(), stale_after).1)
    }
}

/// Split node records into (live, dormant).
pub fn partition_nodes(
    records: Vec<NodeRecord>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> (Vec<NodeRecord>, Vec<NodeRecord>) {
    records
        .into_iter()
        .partition(|record| !record.is_dormant(now, stale_after))
}

/// Owns this node's presence in the cluster.
///
/// On start the node registers itself and takes its own node lock in a
/// dedicated lock session. The session lives until [`NodeLifecycle::shutdown`],
/// so the leader can only take the lock (and reassign this node's envelopes)
/// after the node is really gone.
pub struct NodeLifecycle {
    node: NodeIdentity,
    store: Arc<dyn MessageStore>,
    session: Mutex<Option<Box<dyn LockSession>>>,
    cancel: CancellationToken,
    heartbeat_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl NodeLifecycle {
    pub fn new(node: NodeIdentity, store: Arc<dyn MessageStore>) -> Self {
        Self {
            node,
            store,
            session: Mutex::new(None),
            cancel: CancellationToken::new(),
            heartbeat_task: parking_lot::Mutex::new(None),
        }
    }

    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    /// Register, take the node lock and start heartbeating.
    ///
    /// Fails with `InvalidConfig` if another live process already holds this node id.
    #[instrument(skip(self), fields(node = %self.node))]
    pub async fn start(&self) -> Result<(), DurableError> {
        let schema = self.store.settings().schema_name.clone();
        let mut session = self.store.lock_session().await?;
        if !session
            .try_get_lock(LockId::node(&schema, self.node.id))
            .await?
        {
            session.close().await?;
            return Err(DurableError::InvalidConfig {
                reason: format!("node id {} is already held by a live process", self.node.id),
            });
        }
        *self.session.lock().await = Some(session);

        self.store.register_node(&self.node).await?;

        let store = Arc::clone(&self.store);
        let node_id = self.node.id;
        let interval = self.store.settings().heartbeat_interval;
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = store.heartbeat(node_id).await {
                    tracing::warn!(node = %node_id, error = %e, "node heartbeat failed");
                }
            }
        });
        *self.heartbeat_task.lock() = Some(handle);
        tracing::info!("node registered");
        Ok(())
    }

    /// Controlled shutdown: give every owned envelope back to any node,
    /// unregister and drop the node lock.
    #[instrument(skip(self), fields(node = %self.node))]
    pub async fn shutdown(&self) -> Result<(), DurableError> {
        self.cancel.cancel();
        let handle = self.heartbeat_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "heartbeat task ended abnormally");
            }
        }

        self.store.release_ownership(self.node.id, None).await?;
        self.store.unregister_node(self.node.id).await?;

        if let Some(session) = self.session.lock().await.take() {
            session.close().await?;
        }
        tracing::info!("node unregistered");
        Ok(())
    }
}

impl Drop for NodeLifecycle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.heartbeat_task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i32, seconds_ago: i64, now: DateTime<Utc>) -> NodeRecord {
        let node = NodeIdentity::new(NodeId::new(id), format!("tcp://node-{id}"));
        let mut record = NodeRecord::new(&node, now);
        record.last_heartbeat = now - chrono::Duration::seconds(seconds_ago);
        record
    }

    #[test]
    fn dormant_after_stale_timeout() {
        let now = Utc::now();
        assert!(!record(1, 59, now).is_dormant(now, Duration::from_secs(60)));
        assert!(record(1, 61, now).is_dormant(now, Duration::from_secs(60)));
    }

    #[test]
    fn partition_splits_live_and_dormant() {
        let now = Utc::now();
        let (live, dormant) = partition_nodes(
            vec![record(1, 5, now), record(2, 300, now), record(3, 0, now)],
            now,
            Duration::from_secs(60),
        );
        let live: Vec<i32> = live.iter().map(|r| r.id.value()).collect();
        let dormant: Vec<i32> = dormant.iter().map(|r| r.id.value()).collect();
        assert_eq!(live, vec![1, 3]);
        assert_eq!(dormant, vec![2]);
    }
}
