//! Background recovery of persisted envelopes.
//!
//! Every node runs one [`DurabilityAgent`] per logical store. Its operations
//! are driven by independent timers but executed by a single worker task, so
//! two operations of one node never run concurrently against the same store. A failing
//! operation is logged and does not affect the others.
//!
//! Dormant-node reassignment is not part of the per-store agent: it runs in
//! [`DormantNodeAgent`], which the assignment protocol places on exactly one
//! node.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::agents::{Agent, AgentTasks};
use crate::dead_letters::sweep_replayable;
use crate::endpoints::{claim_and_enqueue, Endpoints};
use crate::envelope::Envelope;
use crate::envelope_store::MessageStore;
use crate::error::DurableError;
use crate::locking::LockId;
use crate::metrics::DurabilityMetrics;
use crate::nodes::partition_nodes;
use crate::scheduler::{DispatchSummary, ScheduledJobRunner};
use crate::types::{AgentUri, EndpointUri, NodeId, NodeIdentity};

/// Scheme of every durability agent URI.
pub const DURABILITY_SCHEME: &str = "courier-durability";

/// Unowned incoming envelopes waiting at one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverableIncoming {
    pub destination: EndpointUri,
    pub count: u64,
}

/// Rows removed by one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiredSweep {
    /// Handled incoming envelopes past `keep_until`.
    pub handled: u64,
    /// Incoming or outgoing envelopes past `deliver_by`.
    pub expired: u64,
    /// Dead letters past `expires_at`.
    pub dead_letters: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassignOutcome {
    Reassigned { incoming: u64, outgoing: u64 },
    /// Ownership in a tenant store was released under the node's lock in the
    /// registry store. The node record itself is left to the main leader.
    Released,
    /// The node still holds its node lock; nothing was changed.
    NodeStillAlive,
}

/// Store queries and conditional updates used by recovery.
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    /// Destinations with unowned, unexpired `Incoming` envelopes.
    async fn find_recoverable_incoming(&self) -> Result<Vec<RecoverableIncoming>, DurableError>;

    /// Destinations with unowned outgoing envelopes.
    async fn find_outgoing_destinations(&self) -> Result<Vec<EndpointUri>, DurableError>;

    /// Delete handled envelopes past `keep_until`, envelopes past
    /// `deliver_by` and dead letters past `expires_at`.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<ExpiredSweep, DurableError>;

    /// Distinct non-zero owners referenced by incoming or outgoing envelopes.
    async fn envelope_owners(&self) -> Result<Vec<NodeId>, DurableError>;

    /// Give everything `node` owns back to any node and forget the node.
    ///
    /// Runs under the node's own lock; a node that still holds it is alive
    /// and is left untouched.
    async fn reassign_dormant_node(&self, node: NodeId) -> Result<ReassignOutcome, DurableError>;
}

/// The timed operations of a [`DurabilityAgent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryOperation {
    DispatchScheduled,
    RecoverIncoming,
    RecoverOutgoing,
    DeleteExpired,
    ReplayDeadLetters,
    SampleCounts,
}

/// The recovery operations for one store, callable one at a time.
pub struct StoreRecovery {
    node: NodeIdentity,
    store: Arc<dyn MessageStore>,
    endpoints: Arc<Endpoints>,
    scheduler: ScheduledJobRunner,
    metrics: Option<Arc<DurabilityMetrics>>,
}

impl StoreRecovery {
    pub fn new(
        node: NodeIdentity,
        store: Arc<dyn MessageStore>,
        endpoints: Arc<Endpoints>,
        metrics: Option<Arc<DurabilityMetrics>>,
    ) -> Self {
        let scheduler =
            ScheduledJobRunner::new(node.clone(), Arc::clone(&store), Arc::clone(&endpoints));
        Self {
            node,
            store,
            endpoints,
            scheduler,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Run one operation, logging (not returning) its failure.
    pub async fn execute(&self, operation: RecoveryOperation) {
        let result = match operation {
            RecoveryOperation::DispatchScheduled => {
                self.dispatch_scheduled(Utc::now()).await.map(|_| ())
            }
            RecoveryOperation::RecoverIncoming => self.recover_incoming().await.map(|_| ()),
            RecoveryOperation::RecoverOutgoing => self.recover_outgoing().await.map(|_| ()),
            RecoveryOperation::DeleteExpired => self.delete_expired(Utc::now()).await.map(|_| ()),
            RecoveryOperation::ReplayDeadLetters => self.replay_dead_letters().await.map(|_| ()),
            RecoveryOperation::SampleCounts => self.sample_counts().await,
        };
        if let Err(e) = result {
            tracing::warn!(
                store = %self.store.name(),
                operation = ?operation,
                error = %e,
                "recovery operation failed"
            );
        }
    }

    pub async fn dispatch_scheduled(
        &self,
        now: DateTime<Utc>,
    ) -> Result<DispatchSummary, DurableError> {
        self.scheduler.run(now).await
    }

    /// Claim a page of unowned incoming envelopes for each destination this
    /// node listens on, and hand them to the listener.
    #[instrument(skip(self), fields(store = %self.store.name()))]
    pub async fn recover_incoming(&self) -> Result<usize, DurableError> {
        let batch_size = self.store.settings().recovery_batch_size;
        let mut recovered = 0;
        for item in self.store.find_recoverable_incoming().await? {
            let Some(listener) = self.endpoints.active_listener(&item.destination) else {
                continue;
            };
            let page = batch_size.min(listener.capacity());
            if page == 0 {
                continue;
            }
            let ready = self
                .store
                .load_ready_incoming(&item.destination, page)
                .await?;
            let ids: Vec<Uuid> = ready.iter().map(|e| e.id).collect();
            match claim_and_enqueue(self.store.as_ref(), listener.as_ref(), &ids, self.node.id)
                .await
            {
                Ok(count) => recovered += count,
                Err(e) => tracing::warn!(
                    destination = %item.destination,
                    error = %e,
                    "failed to recover incoming envelopes"
                ),
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "recovered incoming envelopes");
        }
        Ok(recovered)
    }

    /// Discard expired unowned outgoing envelopes, claim the rest and pass
    /// them to the local sender.
    #[instrument(skip(self), fields(store = %self.store.name()))]
    pub async fn recover_outgoing(&self) -> Result<usize, DurableError> {
        let batch_size = self.store.settings().recovery_batch_size;
        let now = Utc::now();
        let mut recovered = 0;
        for destination in self.store.find_outgoing_destinations().await? {
            let Some(sender) = self.endpoints.active_sender(&destination) else {
                continue;
            };
            let (expired, live): (Vec<Envelope>, Vec<Envelope>) = self
                .store
                .load_outgoing(&destination)
                .await?
                .into_iter()
                .filter(|e| e.owner_id.is_any())
                .partition(|e| e.is_expired(now));
            if !expired.is_empty() {
                tracing::debug!(
                    destination = %destination,
                    count = expired.len(),
                    "discarding expired outgoing envelopes"
                );
                self.store.delete_outgoing(&expired).await?;
            }
            let ids: Vec<Uuid> = live.iter().take(batch_size).map(|e| e.id).collect();
            if ids.is_empty() {
                continue;
            }
            let claimed = self.store.claim_outgoing(&ids, self.node.id).await?;
            if claimed.is_empty() {
                continue;
            }
            let count = claimed.len();
            if let Err(e) = sender.send(claimed.clone()).await {
                tracing::warn!(
                    destination = %destination,
                    error = %e,
                    "sender refused recovered envelopes, releasing ownership"
                );
                self.store
                    .discard_and_reassign_outgoing(&[], &claimed, NodeId::ANY)
                    .await?;
                continue;
            }
            recovered += count;
        }
        if recovered > 0 {
            tracing::info!(recovered, "recovered outgoing envelopes");
        }
        Ok(recovered)
    }

    #[instrument(skip(self), fields(store = %self.store.name()))]
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<ExpiredSweep, DurableError> {
        let sweep = self.store.delete_expired(now).await?;
        if sweep != ExpiredSweep::default() {
            tracing::debug!(
                handled = sweep.handled,
                expired = sweep.expired,
                dead_letters = sweep.dead_letters,
                "deleted expired envelopes"
            );
        }
        Ok(sweep)
    }

    #[instrument(skip(self), fields(store = %self.store.name()))]
    pub async fn replay_dead_letters(&self) -> Result<u64, DurableError> {
        let settings = self.store.settings();
        let replayed = sweep_replayable(
            self.store.as_ref(),
            settings.dead_letter_batch_size.max(1),
            settings.reset_attempts_on_replay,
        )
        .await?;
        if replayed > 0 {
            tracing::info!(replayed, "moved replayable dead letters to incoming");
        }
        Ok(replayed)
    }

    async fn sample_counts(&self) -> Result<(), DurableError> {
        let Some(metrics) = &self.metrics else {
            return Ok(());
        };
        let counts = self.store.fetch_counts().await?;
        metrics.record(self.store.name(), &counts);
        Ok(())
    }
}

/// Capacity of the operation queue; ticks that find it full are skipped.
const OPERATION_QUEUE_CAPACITY: usize = 16;

/// Per-store recovery agent: timers feeding one serial worker.
pub struct DurabilityAgent {
    uri: AgentUri,
    recovery: Arc<StoreRecovery>,
    tasks: AgentTasks,
    trigger: parking_lot::Mutex<Option<mpsc::Sender<RecoveryOperation>>>,
}

impl DurabilityAgent {
    pub fn new(recovery: StoreRecovery) -> Self {
        let uri = Self::uri_for(recovery.store.name());
        Self {
            uri,
            recovery: Arc::new(recovery),
            tasks: AgentTasks::default(),
            trigger: parking_lot::Mutex::new(None),
        }
    }

    pub fn uri_for(store_name: &str) -> AgentUri {
        AgentUri::new(DURABILITY_SCHEME, "store", store_name)
    }

    pub fn recovery(&self) -> &Arc<StoreRecovery> {
        &self.recovery
    }

    /// Queue an operation outside its timer, e.g. right after a listener starts.
    pub async fn trigger(&self, operation: RecoveryOperation) -> Result<(), DurableError> {
        let sender = self.trigger.lock().clone();
        match sender {
            Some(sender) => sender
                .send(operation)
                .await
                .map_err(|_| DurableError::ShuttingDown),
            None => Err(DurableError::ShuttingDown),
        }
    }

    fn schedule(&self) -> Vec<(RecoveryOperation, Duration, Duration)> {
        let s = self.recovery.store.settings();
        let mut schedule = vec![
            (
                RecoveryOperation::DispatchScheduled,
                s.scheduled_job_first_execution,
                s.scheduled_job_polling_time,
            ),
            (
                RecoveryOperation::RecoverIncoming,
                s.recovery_first_execution,
                s.recovery_polling_time,
            ),
            (
                RecoveryOperation::RecoverOutgoing,
                s.recovery_first_execution,
                s.recovery_polling_time,
            ),
            (
                RecoveryOperation::ReplayDeadLetters,
                s.recovery_first_execution,
                s.recovery_polling_time,
            ),
            (
                RecoveryOperation::DeleteExpired,
                s.recovery_first_execution,
                s.expiration_polling_time,
            ),
        ];
        if self.recovery.metrics.is_some() {
            schedule.push((
                RecoveryOperation::SampleCounts,
                s.recovery_first_execution,
                s.recovery_polling_time,
            ));
        }
        schedule
    }
}

#[async_trait]
impl Agent for DurabilityAgent {
    fn uri(&self) -> &AgentUri {
        &self.uri
    }

    #[instrument(skip(self), fields(agent = %self.uri))]
    async fn start(&self) -> Result<(), DurableError> {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(OPERATION_QUEUE_CAPACITY);
        let max_jitter = self.recovery.store.settings().first_execution_jitter;
        let mut handles = Vec::new();

        let recovery = Arc::clone(&self.recovery);
        let worker_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let operation = tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    op = rx.recv() => match op {
                        Some(op) => op,
                        None => break,
                    },
                };
                recovery.execute(operation).await;
            }
        }));

        for (operation, first, period) in self.schedule() {
            let delay = first + jitter(max_jitter);
            handles.push(spawn_timer(operation, delay, period, tx.clone(), cancel.clone()));
        }

        *self.trigger.lock() = Some(tx);
        self.tasks.replace(cancel, handles).await;
        tracing::info!("durability agent started");
        Ok(())
    }

    #[instrument(skip(self), fields(agent = %self.uri))]
    async fn stop(&self) -> Result<(), DurableError> {
        self.trigger.lock().take();
        self.tasks.shutdown().await;
        tracing::info!("durability agent stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.tasks.is_running()
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..=max)
}

fn spawn_timer(
    operation: RecoveryOperation,
    first: Duration,
    period: Duration,
    tx: mpsc::Sender<RecoveryOperation>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(first) => {}
        }
        loop {
            match tx.try_send(operation) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(operation = ?operation, "recovery worker busy, skipping tick");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
    })
}

/// Leader-only release of envelopes owned by dead nodes.
///
/// Nodes register and hold their node locks in the registry store only, so
/// liveness always comes from there even when `store` is a tenant store.
pub struct DormantNodeReassignment {
    node: NodeIdentity,
    store: Arc<dyn MessageStore>,
    registry: Arc<dyn MessageStore>,
}

impl DormantNodeReassignment {
    /// `registry` is the store nodes register in; pass `store` again for the
    /// main store's leader.
    pub fn new(
        node: NodeIdentity,
        store: Arc<dyn MessageStore>,
        registry: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            node,
            store,
            registry,
        }
    }

    fn store_is_registry(&self) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.store) as *const (),
            Arc::as_ptr(&self.registry) as *const (),
        )
    }

    /// Reassign every dormant node, and every envelope owner without a live
    /// node record, to any node. Returns the nodes whose envelopes were released.
    #[instrument(skip(self), fields(store = %self.store.name()))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<Vec<NodeId>, DurableError> {
        let stale_after = self.registry.settings().stale_node_timeout;
        let (live, dormant) = partition_nodes(self.registry.nodes().await?, now, stale_after);

        let mut live_ids: HashSet<NodeId> = live.iter().map(|r| r.id).collect();
        live_ids.insert(self.node.id);

        let on_registry = self.store_is_registry();
        let mut candidates = BTreeSet::new();
        if on_registry {
            candidates.extend(dormant.iter().map(|r| r.id).filter(|id| *id != self.node.id));
        }
        for owner in self.store.envelope_owners().await? {
            if !live_ids.contains(&owner) {
                candidates.insert(owner);
            }
        }

        let mut reassigned = Vec::new();
        for node in candidates {
            let outcome = if on_registry {
                self.store.reassign_dormant_node(node).await
            } else {
                self.release_under_registry_lock(node).await
            };
            match outcome {
                Ok(ReassignOutcome::Reassigned { incoming, outgoing }) => {
                    tracing::info!(
                        dormant_node = %node,
                        incoming,
                        outgoing,
                        "reassigned envelopes of dormant node to any node"
                    );
                    reassigned.push(node);
                }
                Ok(ReassignOutcome::Released) => {
                    tracing::info!(dormant_node = %node, "released envelopes of dormant node");
                    reassigned.push(node);
                }
                Ok(ReassignOutcome::NodeStillAlive) => {
                    tracing::debug!(dormant_node = %node, "node still holds its lock, skipping");
                }
                Err(e) => {
                    tracing::warn!(dormant_node = %node, error = %e, "dormant node reassignment failed");
                }
            }
        }
        Ok(reassigned)
    }

    async fn release_under_registry_lock(
        &self,
        node: NodeId,
    ) -> Result<ReassignOutcome, DurableError> {
        let lock = LockId::node(&self.registry.settings().schema_name, node);
        let mut session = self.registry.lock_session().await?;
        if !session.try_get_lock(lock).await? {
            session.close().await?;
            return Ok(ReassignOutcome::NodeStillAlive);
        }
        let released = self.store.release_ownership(node, None).await;
        session.close().await?;
        released.map(|()| ReassignOutcome::Released)
    }
}

/// Runs [`DormantNodeReassignment`] on its own timer. Placed on one node only.
pub struct DormantNodeAgent {
    uri: AgentUri,
    reassignment: Arc<DormantNodeReassignment>,
    tasks: AgentTasks,
}

impl DormantNodeAgent {
    pub fn new(reassignment: DormantNodeReassignment) -> Self {
        Self {
            uri: Self::uri_for(reassignment.store.name()),
            reassignment: Arc::new(reassignment),
            tasks: AgentTasks::default(),
        }
    }

    pub fn uri_for(store_name: &str) -> AgentUri {
        AgentUri::new(DURABILITY_SCHEME, "leader", store_name)
    }
}

#[async_trait]
impl Agent for DormantNodeAgent {
    fn uri(&self) -> &AgentUri {
        &self.uri
    }

    #[instrument(skip(self), fields(agent = %self.uri))]
    async fn start(&self) -> Result<(), DurableError> {
        let cancel = CancellationToken::new();
        let reassignment = Arc::clone(&self.reassignment);
        let settings = reassignment.store.settings();
        let first = jitter(settings.first_execution_jitter);
        let period = settings.node_reassignment_polling_time;
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut delay = first;
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Err(e) = reassignment.run(Utc::now()).await {
                    tracing::warn!(error = %e, "dormant node check failed");
                }
                delay = period;
            }
        });
        self.tasks.replace(cancel, vec![handle]).await;
        tracing::info!("dormant node agent started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), DurableError> {
        self.tasks.shutdown().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.tasks.is_running()
    }
}
