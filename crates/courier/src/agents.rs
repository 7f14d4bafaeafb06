//! Distribution of durability agents across the cluster.
//!
//! Every agent has a stable [`AgentUri`]. Agents a family marks as per-node
//! run on every node; the [`AgentAssigner`] maps each remaining agent to
//! exactly one live node by weighted consistent hashing, and each node's
//! [`AgentController`] starts and stops its local agents to match.

use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use hashring::HashRing;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::DurabilityMode;
use crate::endpoints::Endpoints;
use crate::envelope_store::MessageStore;
use crate::error::DurableError;
use crate::metrics::DurabilityMetrics;
use crate::nodes::NodeRecord;
use crate::recovery::{
    DormantNodeAgent, DormantNodeReassignment, DurabilityAgent, StoreRecovery, DURABILITY_SCHEME,
};
use crate::tenancy::TenantStoreRouter;
use crate::types::{AgentUri, NodeId, NodeIdentity};

/// A long-running background worker with a stable identity.
#[async_trait]
pub trait Agent: Send + Sync {
    fn uri(&self) -> &AgentUri;

    async fn start(&self) -> Result<(), DurableError>;

    async fn stop(&self) -> Result<(), DurableError>;

    fn is_running(&self) -> bool;
}

/// The agents of one URI scheme.
#[async_trait]
pub trait AgentFamily: Send + Sync {
    fn scheme(&self) -> &str;

    async fn all_known_agents(&self) -> Result<Vec<AgentUri>, DurableError>;

    /// Per-node agents run on every node instead of one ring-assigned node.
    fn is_per_node(&self, _uri: &AgentUri) -> bool {
        false
    }

    /// Build the agent for `uri`. An unknown URI is `UnknownAgent`.
    async fn build_agent(&self, uri: &AgentUri) -> Result<Arc<dyn Agent>, DurableError>;
}

/// Cancellation plus join handles of an agent's spawned tasks.
#[derive(Default)]
pub(crate) struct AgentTasks {
    running: tokio::sync::Mutex<Option<(CancellationToken, Vec<JoinHandle<()>>)>>,
    active: AtomicBool,
}

impl AgentTasks {
    /// Stop whatever is running and track the new tasks instead.
    pub(crate) async fn replace(&self, cancel: CancellationToken, handles: Vec<JoinHandle<()>>) {
        let previous = self.running.lock().await.replace((cancel, handles));
        if let Some((cancel, handles)) = previous {
            cancel.cancel();
            log_join_errors(join_all(handles).await);
        }
        self.active.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        let running = self.running.lock().await.take();
        if let Some((cancel, handles)) = running {
            cancel.cancel();
            log_join_errors(join_all(handles).await);
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

fn log_join_errors(results: Vec<Result<(), tokio::task::JoinError>>) {
    for result in results {
        if let Err(e) = result {
            tracing::warn!(error = %e, "agent task ended abnormally");
        }
    }
}

/// One store agent and one leader agent per active store.
///
/// Store agents recover work for this node's own listeners, so they run on
/// every node. Leader agents are ring-assigned to a single node.
pub struct DurabilityAgentFamily {
    node: NodeIdentity,
    router: Arc<TenantStoreRouter>,
    endpoints: Arc<Endpoints>,
    metrics: Option<Arc<DurabilityMetrics>>,
}

impl DurabilityAgentFamily {
    pub fn new(
        node: NodeIdentity,
        router: Arc<TenantStoreRouter>,
        endpoints: Arc<Endpoints>,
        metrics: Option<Arc<DurabilityMetrics>>,
    ) -> Self {
        Self {
            node,
            router,
            endpoints,
            metrics,
        }
    }

    async fn store_named(&self, uri: &AgentUri) -> Result<Arc<dyn MessageStore>, DurableError> {
        self.router
            .store_by_name(&uri.name)
            .await?
            .ok_or_else(|| DurableError::UnknownAgent { uri: uri.clone() })
    }
}

#[async_trait]
impl AgentFamily for DurabilityAgentFamily {
    fn scheme(&self) -> &str {
        DURABILITY_SCHEME
    }

    async fn all_known_agents(&self) -> Result<Vec<AgentUri>, DurableError> {
        self.router.refresh().await?;
        let stores = self.router.all_active_stores();
        let mut uris = Vec::with_capacity(stores.len() * 2);
        for store in stores {
            uris.push(DurabilityAgent::uri_for(store.name()));
            uris.push(DormantNodeAgent::uri_for(store.name()));
        }
        Ok(uris)
    }

    fn is_per_node(&self, uri: &AgentUri) -> bool {
        uri.scheme == DURABILITY_SCHEME && uri.kind == "store"
    }

    async fn build_agent(&self, uri: &AgentUri) -> Result<Arc<dyn Agent>, DurableError> {
        if uri.scheme != DURABILITY_SCHEME {
            return Err(DurableError::UnknownAgent { uri: uri.clone() });
        }
        match uri.kind.as_str() {
            "store" => {
                let store = self.store_named(uri).await?;
                let recovery = StoreRecovery::new(
                    self.node.clone(),
                    store,
                    Arc::clone(&self.endpoints),
                    self.metrics.clone(),
                );
                Ok(Arc::new(DurabilityAgent::new(recovery)))
            }
            "leader" => {
                let store = self.store_named(uri).await?;
                let registry = Arc::clone(self.router.main_store());
                let reassignment = DormantNodeReassignment::new(self.node.clone(), store, registry);
                Ok(Arc::new(DormantNodeAgent::new(reassignment)))
            }
            _ => Err(DurableError::UnknownAgent { uri: uri.clone() }),
        }
    }
}

/// A node on the hash ring; weight is expressed as replica count.
#[derive(Debug, Clone, Eq, PartialEq)]
struct NodeReplica {
    id: NodeId,
    replica: i32,
}

impl Hash for NodeReplica {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.value().hash(state);
        self.replica.hash(state);
    }
}

/// Computes agent-to-node assignments using consistent hashing.
pub struct AgentAssigner;

impl AgentAssigner {
    /// Assign every agent to exactly one of `nodes`.
    ///
    /// Nodes with weight 0 are draining and receive nothing. Returns an empty
    /// map when no node can take work.
    pub fn assign(agents: &[AgentUri], nodes: &[NodeRecord]) -> HashMap<AgentUri, NodeId> {
        const VNODES_PER_WEIGHT: i32 = 100;

        let mut assignments = HashMap::new();
        let mut ring: HashRing<NodeReplica> = HashRing::new();
        let mut any = false;
        for node in nodes.iter().filter(|n| n.weight > 0) {
            any = true;
            for replica in 0..node.weight * VNODES_PER_WEIGHT {
                ring.add(NodeReplica {
                    id: node.id,
                    replica,
                });
            }
        }
        if !any {
            return assignments;
        }
        for agent in agents {
            if let Some(node) = ring.get(&agent.to_string()) {
                assignments.insert(agent.clone(), node.id);
            }
        }
        assignments
    }
}

/// Agents started and stopped by one [`AgentController::evaluate`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentChange {
    pub started: Vec<AgentUri>,
    pub stopped: Vec<AgentUri>,
}

/// Keeps this node's running agents in line with the cluster assignment.
pub struct AgentController {
    node: NodeIdentity,
    mode: DurabilityMode,
    registry: Arc<dyn MessageStore>,
    families: Vec<Arc<dyn AgentFamily>>,
    running: tokio::sync::Mutex<HashMap<AgentUri, Arc<dyn Agent>>>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl AgentController {
    /// `registry` is the store whose node table decides which nodes are live.
    pub fn new(
        node: NodeIdentity,
        registry: Arc<dyn MessageStore>,
        families: Vec<Arc<dyn AgentFamily>>,
    ) -> Self {
        let mode = registry.settings().mode;
        Self {
            node,
            mode,
            registry,
            families,
            running: tokio::sync::Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub async fn running_agents(&self) -> Vec<AgentUri> {
        let mut uris: Vec<AgentUri> = self.running.lock().await.keys().cloned().collect();
        uris.sort();
        uris
    }

    fn family_for(&self, uri: &AgentUri) -> Result<&Arc<dyn AgentFamily>, DurableError> {
        self.families
            .iter()
            .find(|f| f.scheme() == uri.scheme)
            .ok_or_else(|| DurableError::UnknownAgent { uri: uri.clone() })
    }

    async fn desired_agents(&self) -> Result<BTreeSet<AgentUri>, DurableError> {
        let mut desired = BTreeSet::new();
        let mut singletons = Vec::new();
        for family in &self.families {
            for uri in family.all_known_agents().await? {
                if self.mode == DurabilityMode::Solo || family.is_per_node(&uri) {
                    desired.insert(uri);
                } else {
                    singletons.push(uri);
                }
            }
        }
        if singletons.is_empty() {
            return Ok(desired);
        }

        let stale_after = self.registry.settings().stale_node_timeout;
        let mut live = self.registry.live_nodes(stale_after).await?;
        if live.is_empty() {
            live.push(NodeRecord::new(&self.node, chrono::Utc::now()));
        }
        let assignments = AgentAssigner::assign(&singletons, &live);
        desired.extend(
            assignments
                .into_iter()
                .filter(|(_, node)| *node == self.node.id)
                .map(|(uri, _)| uri),
        );
        Ok(desired)
    }

    /// Start newly assigned agents and stop the ones assigned elsewhere.
    ///
    /// `UnknownAgent` is returned as an error; a single agent failing to
    /// start or stop is logged and retried on the next pass.
    #[instrument(skip(self), fields(node = %self.node))]
    pub async fn evaluate(&self) -> Result<AssignmentChange, DurableError> {
        let desired = self.desired_agents().await?;
        let mut running = self.running.lock().await;
        let mut change = AssignmentChange::default();

        let to_stop: Vec<AgentUri> = running
            .keys()
            .filter(|uri| !desired.contains(*uri))
            .cloned()
            .collect();
        for uri in to_stop {
            if let Some(agent) = running.remove(&uri) {
                if let Err(e) = agent.stop().await {
                    tracing::warn!(agent = %uri, error = %e, "failed to stop agent");
                }
                change.stopped.push(uri);
            }
        }

        for uri in desired {
            if running.contains_key(&uri) {
                continue;
            }
            let agent = self.family_for(&uri)?.build_agent(&uri).await?;
            match agent.start().await {
                Ok(()) => {
                    running.insert(uri.clone(), agent);
                    change.started.push(uri);
                }
                Err(e) => tracing::warn!(agent = %uri, error = %e, "failed to start agent"),
            }
        }

        if !change.started.is_empty() || !change.stopped.is_empty() {
            tracing::info!(
                started = change.started.len(),
                stopped = change.stopped.len(),
                "agent assignment changed"
            );
        }
        Ok(change)
    }

    /// Evaluate now, then on every `node_reassignment_polling_time` tick.
    pub async fn run(self: &Arc<Self>) -> Result<(), DurableError> {
        self.evaluate().await?;
        let controller = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = self.registry.settings().node_reassignment_polling_time;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = controller.evaluate().await {
                    tracing::warn!(error = %e, "agent assignment evaluation failed");
                }
            }
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Stop evaluating and stop every local agent.
    pub async fn stop_all(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "agent evaluation task ended abnormally");
            }
        }
        let agents: Vec<(AgentUri, Arc<dyn Agent>)> = self.running.lock().await.drain().collect();
        for (uri, agent) in agents {
            if let Err(e) = agent.stop().await {
                tracing::warn!(agent = %uri, error = %e, "failed to stop agent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn node(id: i32, weight: i32) -> NodeRecord {
        let identity = NodeIdentity::new(NodeId::new(id), format!("tcp://node-{id}")).with_weight(weight);
        NodeRecord::new(&identity, Utc::now())
    }

    fn agents(n: usize) -> Vec<AgentUri> {
        (0..n)
            .map(|i| AgentUri::new(DURABILITY_SCHEME, "store", format!("store-{i}")))
            .collect()
    }

    #[test]
    fn single_node_gets_every_agent() {
        let uris = agents(10);
        let assignments = AgentAssigner::assign(&uris, &[node(1, 1)]);
        assert_eq!(assignments.len(), 10);
        assert!(assignments.values().all(|id| *id == NodeId::new(1)));
    }

    #[test]
    fn each_agent_has_exactly_one_node() {
        let uris = agents(200);
        let nodes = vec![node(1, 1), node(2, 1), node(3, 1)];
        let assignments = AgentAssigner::assign(&uris, &nodes);
        assert_eq!(assignments.len(), 200);
        for id in 1..=3 {
            let count = assignments.values().filter(|n| **n == NodeId::new(id)).count();
            assert!(count > 0, "node {id} received no agents");
        }
    }

    #[test]
    fn assignment_is_deterministic() {
        let uris = agents(50);
        let nodes = vec![node(1, 1), node(2, 2)];
        assert_eq!(
            AgentAssigner::assign(&uris, &nodes),
            AgentAssigner::assign(&uris, &nodes)
        );
    }

    #[test]
    fn draining_nodes_receive_nothing() {
        let uris = agents(20);
        let assignments = AgentAssigner::assign(&uris, &[node(1, 0), node(2, 1)]);
        assert!(assignments.values().all(|id| *id == NodeId::new(2)));
        assert!(AgentAssigner::assign(&uris, &[node(1, 0)]).is_empty());
    }

    #[tokio::test]
    async fn agent_tasks_track_running_state() {
        let tasks = AgentTasks::default();
        assert!(!tasks.is_running());
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let handle = tokio::spawn(async move { child.cancelled().await });
        tasks.replace(cancel, vec![handle]).await;
        assert!(tasks.is_running());
        tasks.shutdown().await;
        assert!(!tasks.is_running());
    }

    #[tokio::test]
    async fn panicked_agent_task_does_not_break_shutdown() {
        let tasks = AgentTasks::default();
        let handle = tokio::spawn(async { panic!("worker failed") });
        tasks.replace(CancellationToken::new(), vec![handle]).await;
        tasks.shutdown().await;
        assert!(!tasks.is_running());
    }
}
