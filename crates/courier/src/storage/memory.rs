//! In-memory envelope store for tests and single-process use.
//!
//! Everything lives behind one [`parking_lot::Mutex`], so every operation is
//! trivially atomic. Advisory locks are kept in a shared table; a lock
//! session releases what it holds when closed or dropped.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::DurabilitySettings;
use crate::dead_letters::{
    sort_counts, DeadLetterCount, DeadLetterGrouping, DeadLetterPage, DeadLetterQuery,
    DeadLetterSelector, DeadLetterStore,
};
use crate::envelope::{DeadLetterRecord, Envelope, EnvelopeStatus, ErrorReport};
use crate::envelope_store::{EnvelopeStore, PersistedCounts};
use crate::error::DurableError;
use crate::locking::{AdvisoryLocks, LockId, LockSession};
use crate::nodes::{NodeRecord, NodeRegistry};
use crate::recovery::{ExpiredSweep, ReassignOutcome, RecoverableIncoming, RecoveryStore};
use crate::scheduler::ScheduledJobs;
use crate::transaction::EnvelopeTransaction;
use crate::types::{EndpointUri, NodeId, NodeIdentity};

/// In-memory implementation of every store capability.
///
/// Clones share the same data.
#[derive(Clone)]
pub struct MemoryEnvelopeStore {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    settings: DurabilitySettings,
    inner: Mutex<Inner>,
    locks: LockTable,
}

#[derive(Clone)]
struct Stored {
    envelope: Envelope,
    /// Insertion order, used as natural storage order.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    incoming: HashMap<Uuid, Stored>,
    outgoing: HashMap<Uuid, Stored>,
    dead_letters: HashMap<Uuid, DeadLetterRecord>,
    /// Scheduled incoming envelopes by (due time, insertion order).
    scheduled: BTreeMap<(DateTime<Utc>, u64), Uuid>,
    nodes: BTreeMap<NodeId, NodeRecord>,
    next_seq: u64,
}

impl MemoryEnvelopeStore {
    pub fn new(name: impl Into<String>, settings: DurabilitySettings) -> Result<Self, DurableError> {
        settings.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                name: name.into(),
                settings,
                inner: Mutex::new(Inner::default()),
                locks: LockTable::default(),
            }),
        })
    }

    /// Whether any lock session currently holds `lock`.
    pub fn is_locked(&self, lock: LockId) -> bool {
        self.shared.locks.holder(lock).is_some()
    }
}

fn sorted(stored: &HashMap<Uuid, Stored>) -> Vec<&Stored> {
    let mut entries: Vec<&Stored> = stored.values().collect();
    entries.sort_by_key(|s| s.seq);
    entries
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Reject a transaction's inserts before anything is applied, tracking
    /// ids the transaction itself adds or removes.
    fn check_ops(&self, ops: &[TxOp]) -> Result<(), DurableError> {
        let mut incoming: HashMap<Uuid, bool> = HashMap::new();
        let mut outgoing: HashSet<Uuid> = HashSet::new();
        for op in ops {
            match op {
                TxOp::Incoming(envelope) => {
                    envelope.validate_for_incoming()?;
                    let present = incoming
                        .get(&envelope.id)
                        .copied()
                        .unwrap_or_else(|| self.incoming.contains_key(&envelope.id));
                    if present {
                        return Err(DurableError::DuplicateEnvelope { id: envelope.id });
                    }
                    incoming.insert(envelope.id, true);
                }
                TxOp::Outgoing(envelope, _) => {
                    if self.outgoing.contains_key(&envelope.id) || !outgoing.insert(envelope.id) {
                        return Err(DurableError::DuplicateEnvelope { id: envelope.id });
                    }
                }
                TxOp::DeadLetter(envelope, _) => {
                    incoming.insert(envelope.id, false);
                }
                TxOp::Handled(_) | TxOp::Attempt(_) => {}
            }
        }
        Ok(())
    }

    fn insert_incoming(&mut self, envelope: &Envelope) -> Result<(), DurableError> {
        envelope.validate_for_incoming()?;
        if self.incoming.contains_key(&envelope.id) {
            return Err(DurableError::DuplicateEnvelope { id: envelope.id });
        }
        let seq = self.next_seq();
        if let (EnvelopeStatus::Scheduled, Some(at)) = (envelope.status, envelope.scheduled_time) {
            self.scheduled.insert((at, seq), envelope.id);
        }
        self.incoming.insert(
            envelope.id,
            Stored {
                envelope: envelope.clone(),
                seq,
            },
        );
        Ok(())
    }

    fn insert_outgoing(&mut self, envelope: &Envelope, owner: NodeId) -> Result<(), DurableError> {
        if self.outgoing.contains_key(&envelope.id) {
            return Err(DurableError::DuplicateEnvelope { id: envelope.id });
        }
        let seq = self.next_seq();
        let mut envelope = envelope.clone();
        envelope.owner_id = owner;
        self.outgoing.insert(envelope.id, Stored { envelope, seq });
        Ok(())
    }

    fn remove_incoming(&mut self, id: &Uuid) -> Option<Envelope> {
        let stored = self.incoming.remove(id)?;
        if let Some(at) = stored.envelope.scheduled_time {
            self.scheduled.remove(&(at, stored.seq));
        }
        Some(stored.envelope)
    }

    fn mark_handled(&mut self, id: &Uuid, keep_until: DateTime<Utc>) {
        if let Some(stored) = self.incoming.get_mut(id) {
            if let Some(at) = stored.envelope.scheduled_time {
                self.scheduled.remove(&(at, stored.seq));
            }
            stored.envelope.mark_handled(keep_until);
        }
    }

    fn increment_attempts(&mut self, id: &Uuid) {
        if let Some(stored) = self.incoming.get_mut(id) {
            stored.envelope.attempts += 1;
        }
    }

    fn move_to_dead_letter(
        &mut self,
        envelope: &Envelope,
        error: &ErrorReport,
        settings: &DurabilitySettings,
    ) {
        let stored = self
            .remove_incoming(&envelope.id)
            .unwrap_or_else(|| envelope.clone());
        let failed_at = Utc::now();
        self.dead_letters.insert(
            stored.id,
            DeadLetterRecord {
                envelope: stored,
                error: error.clone(),
                replayable: false,
                failed_at,
                expires_at: settings.dead_letter_expires_at(failed_at),
            },
        );
    }

    /// Set every envelope `node` owns (optionally at one destination) back to any node.
    fn release(&mut self, node: NodeId, destination: Option<&EndpointUri>) -> (u64, u64) {
        let matches = |envelope: &Envelope| {
            envelope.owner_id == node
                && destination.map_or(true, |d| envelope.destination_key() == d.as_str())
        };
        let mut incoming = 0;
        for stored in self.incoming.values_mut() {
            if matches(&stored.envelope) {
                stored.envelope.owner_id = NodeId::ANY;
                incoming += 1;
            }
        }
        let mut outgoing = 0;
        for stored in self.outgoing.values_mut() {
            if matches(&stored.envelope) {
                stored.envelope.owner_id = NodeId::ANY;
                outgoing += 1;
            }
        }
        (incoming, outgoing)
    }

    fn matching_dead_letters(&self, selector: &DeadLetterSelector) -> Vec<&DeadLetterRecord> {
        let mut records: Vec<&DeadLetterRecord> = self
            .dead_letters
            .values()
            .filter(|r| selector.matches(r))
            .collect();
        records.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then(a.id().cmp(&b.id())));
        records
    }
}

#[async_trait]
impl EnvelopeStore for MemoryEnvelopeStore {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn settings(&self) -> &DurabilitySettings {
        &self.shared.settings
    }

    async fn ensure_schema(&self) -> Result<(), DurableError> {
        Ok(())
    }

    async fn rebuild_schema(&self) -> Result<(), DurableError> {
        *self.shared.inner.lock() = Inner::default();
        Ok(())
    }

    async fn store_incoming(&self, envelope: &Envelope) -> Result<(), DurableError> {
        self.shared.inner.lock().insert_incoming(envelope)
    }

    async fn store_incoming_batch(&self, envelopes: &[Envelope]) -> Result<(), DurableError> {
        let mut inner = self.shared.inner.lock();
        let mut seen = HashSet::with_capacity(envelopes.len());
        for envelope in envelopes {
            envelope.validate_for_incoming()?;
            if inner.incoming.contains_key(&envelope.id) || !seen.insert(envelope.id) {
                return Err(DurableError::DuplicateEnvelope { id: envelope.id });
            }
        }
        for envelope in envelopes {
            inner.insert_incoming(envelope)?;
        }
        Ok(())
    }

    async fn store_outgoing(&self, envelope: &Envelope, owner: NodeId) -> Result<(), DurableError> {
        self.shared.inner.lock().insert_outgoing(envelope, owner)
    }

    async fn mark_handled(&self, envelopes: &[Envelope]) -> Result<(), DurableError> {
        let keep_until = Utc::now() + self.shared.settings.keep_after_handling();
        let mut inner = self.shared.inner.lock();
        for envelope in envelopes {
            inner.mark_handled(&envelope.id, keep_until);
        }
        Ok(())
    }

    async fn increment_attempts(&self, envelope: &Envelope) -> Result<(), DurableError> {
        self.shared.inner.lock().increment_attempts(&envelope.id);
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        envelope: &Envelope,
        error: &ErrorReport,
    ) -> Result<(), DurableError> {
        self.shared
            .inner
            .lock()
            .move_to_dead_letter(envelope, error, &self.shared.settings);
        Ok(())
    }

    async fn reschedule_incoming(
        &self,
        envelope: &Envelope,
        at: DateTime<Utc>,
    ) -> Result<(), DurableError> {
        let mut inner = self.shared.inner.lock();
        let Some(mut current) = inner.remove_incoming(&envelope.id) else {
            return Ok(());
        };
        current.status = EnvelopeStatus::Scheduled;
        current.scheduled_time = Some(at);
        current.owner_id = NodeId::ANY;
        inner.insert_incoming(&current)
    }

    async fn load_ready_incoming(
        &self,
        destination: &EndpointUri,
        limit: usize,
    ) -> Result<Vec<Envelope>, DurableError> {
        let now = Utc::now();
        let inner = self.shared.inner.lock();
        Ok(sorted(&inner.incoming)
            .into_iter()
            .map(|s| &s.envelope)
            .filter(|e| {
                e.status == EnvelopeStatus::Incoming
                    && e.owner_id.is_any()
                    && !e.is_expired(now)
                    && e.destination_key() == destination.as_str()
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_incoming(
        &self,
        ids: &[Uuid],
        node: NodeId,
    ) -> Result<Vec<Envelope>, DurableError> {
        let mut inner = self.shared.inner.lock();
        let mut claimed = Vec::new();
        for id in ids {
            if let Some(stored) = inner.incoming.get_mut(id) {
                let envelope = &mut stored.envelope;
                if envelope.status == EnvelopeStatus::Incoming && envelope.owner_id.is_any() {
                    envelope.owner_id = node;
                    claimed.push(envelope.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn release_incoming(&self, ids: &[Uuid], node: NodeId) -> Result<(), DurableError> {
        let mut inner = self.shared.inner.lock();
        for id in ids {
            if let Some(stored) = inner.incoming.get_mut(id) {
                if stored.envelope.owner_id == node {
                    stored.envelope.owner_id = NodeId::ANY;
                }
            }
        }
        Ok(())
    }

    async fn load_outgoing(
        &self,
        destination: &EndpointUri,
    ) -> Result<Vec<Envelope>, DurableError> {
        let inner = self.shared.inner.lock();
        Ok(sorted(&inner.outgoing)
            .into_iter()
            .map(|s| &s.envelope)
            .filter(|e| e.destination_key() == destination.as_str())
            .cloned()
            .collect())
    }

    async fn claim_outgoing(
        &self,
        ids: &[Uuid],
        node: NodeId,
    ) -> Result<Vec<Envelope>, DurableError> {
        let mut inner = self.shared.inner.lock();
        let mut claimed = Vec::new();
        for id in ids {
            if let Some(stored) = inner.outgoing.get_mut(id) {
                if stored.envelope.owner_id.is_any() {
                    stored.envelope.owner_id = node;
                    claimed.push(stored.envelope.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn delete_outgoing(&self, envelopes: &[Envelope]) -> Result<(), DurableError> {
        let mut inner = self.shared.inner.lock();
        for envelope in envelopes {
            inner.outgoing.remove(&envelope.id);
        }
        Ok(())
    }

    async fn discard_and_reassign_outgoing(
        &self,
        discards: &[Envelope],
        reassigned: &[Envelope],
        node: NodeId,
    ) -> Result<(), DurableError> {
        let mut inner = self.shared.inner.lock();
        for envelope in discards {
            inner.outgoing.remove(&envelope.id);
        }
        for envelope in reassigned {
            if let Some(stored) = inner.outgoing.get_mut(&envelope.id) {
                stored.envelope.owner_id = node;
            }
        }
        Ok(())
    }

    async fn fetch_counts(&self) -> Result<PersistedCounts, DurableError> {
        let inner = self.shared.inner.lock();
        let mut counts = PersistedCounts {
            outgoing: inner.outgoing.len() as i64,
            dead_letters: inner.dead_letters.len() as i64,
            ..Default::default()
        };
        for stored in inner.incoming.values() {
            match stored.envelope.status {
                EnvelopeStatus::Incoming => counts.incoming += 1,
                EnvelopeStatus::Scheduled => counts.scheduled += 1,
                EnvelopeStatus::Handled => counts.handled += 1,
            }
        }
        Ok(counts)
    }

    async fn all_incoming(&self) -> Result<Vec<Envelope>, DurableError> {
        let inner = self.shared.inner.lock();
        Ok(sorted(&inner.incoming)
            .into_iter()
            .map(|s| s.envelope.clone())
            .collect())
    }

    async fn all_outgoing(&self) -> Result<Vec<Envelope>, DurableError> {
        let inner = self.shared.inner.lock();
        Ok(sorted(&inner.outgoing)
            .into_iter()
            .map(|s| s.envelope.clone())
            .collect())
    }

    async fn clear_all(&self) -> Result<(), DurableError> {
        let mut inner = self.shared.inner.lock();
        inner.incoming.clear();
        inner.outgoing.clear();
        inner.dead_letters.clear();
        inner.scheduled.clear();
        Ok(())
    }

    async fn release_ownership(
        &self,
        node: NodeId,
        destination: Option<&EndpointUri>,
    ) -> Result<(), DurableError> {
        self.shared.inner.lock().release(node, destination);
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn EnvelopeTransaction>, DurableError> {
        Ok(Box::new(MemoryEnvelopeTransaction {
            store: self.clone(),
            ops: Vec::new(),
        }))
    }
}

#[async_trait]
impl ScheduledJobs for MemoryEnvelopeStore {
    async fn schedule(&self, envelope: &Envelope) -> Result<(), DurableError> {
        if envelope.status != EnvelopeStatus::Scheduled {
            return Err(DurableError::InvariantViolation {
                reason: format!("envelope {} is not scheduled", envelope.id),
            });
        }
        self.shared.inner.lock().insert_incoming(envelope)
    }

    async fn dispatch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Envelope>, DurableError> {
        let lock = LockId::scheduled_jobs(&self.shared.settings.schema_name);
        if self.shared.locks.holder(lock).is_some() {
            tracing::debug!("scheduled jobs are being dispatched elsewhere, skipping");
            return Ok(Vec::new());
        }

        let mut inner = self.shared.inner.lock();
        let due: Vec<((DateTime<Utc>, u64), Uuid)> = inner
            .scheduled
            .range(..=(now, u64::MAX))
            .take(limit)
            .map(|(key, id)| (*key, *id))
            .collect();

        let mut released = Vec::with_capacity(due.len());
        for (key, id) in due {
            inner.scheduled.remove(&key);
            if let Some(stored) = inner.incoming.get_mut(&id) {
                stored.envelope.release_scheduled();
                released.push(stored.envelope.clone());
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl RecoveryStore for MemoryEnvelopeStore {
    async fn find_recoverable_incoming(&self) -> Result<Vec<RecoverableIncoming>, DurableError> {
        let now = Utc::now();
        let inner = self.shared.inner.lock();
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for stored in inner.incoming.values() {
            let e = &stored.envelope;
            if e.status == EnvelopeStatus::Incoming && e.owner_id.is_any() && !e.is_expired(now) {
                *counts.entry(e.destination_key().to_string()).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(destination, count)| RecoverableIncoming {
                destination: EndpointUri::new(destination),
                count,
            })
            .collect())
    }

    async fn find_outgoing_destinations(&self) -> Result<Vec<EndpointUri>, DurableError> {
        let inner = self.shared.inner.lock();
        let destinations: BTreeSet<&str> = inner
            .outgoing
            .values()
            .filter(|s| s.envelope.owner_id.is_any())
            .map(|s| s.envelope.destination_key())
            .collect();
        Ok(destinations.into_iter().map(EndpointUri::new).collect())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<ExpiredSweep, DurableError> {
        let mut inner = self.shared.inner.lock();
        let mut sweep = ExpiredSweep::default();

        let mut handled = Vec::new();
        let mut expired = Vec::new();
        for (id, stored) in &inner.incoming {
            let e = &stored.envelope;
            if e.status == EnvelopeStatus::Handled {
                if e.keep_until.is_some_and(|until| until <= now) {
                    handled.push(*id);
                }
            } else if e.is_expired(now) {
                expired.push(*id);
            }
        }
        for id in &handled {
            inner.remove_incoming(id);
        }
        for id in &expired {
            inner.remove_incoming(id);
        }
        sweep.handled = handled.len() as u64;
        sweep.expired = expired.len() as u64;

        let before = inner.outgoing.len();
        inner.outgoing.retain(|_, s| !s.envelope.is_expired(now));
        sweep.expired += (before - inner.outgoing.len()) as u64;

        let before = inner.dead_letters.len();
        inner
            .dead_letters
            .retain(|_, r| !r.expires_at.is_some_and(|at| at <= now));
        sweep.dead_letters = (before - inner.dead_letters.len()) as u64;

        Ok(sweep)
    }

    async fn envelope_owners(&self) -> Result<Vec<NodeId>, DurableError> {
        let inner = self.shared.inner.lock();
        let owners: BTreeSet<NodeId> = inner
            .incoming
            .values()
            .chain(inner.outgoing.values())
            .map(|s| s.envelope.owner_id)
            .filter(|owner| !owner.is_any())
            .collect();
        Ok(owners.into_iter().collect())
    }

    async fn reassign_dormant_node(&self, node: NodeId) -> Result<ReassignOutcome, DurableError> {
        let lock = LockId::node(&self.shared.settings.schema_name, node);
        if self.shared.locks.holder(lock).is_some() {
            return Ok(ReassignOutcome::NodeStillAlive);
        }
        let mut inner = self.shared.inner.lock();
        let (incoming, outgoing) = inner.release(node, None);
        inner.nodes.remove(&node);
        Ok(ReassignOutcome::Reassigned { incoming, outgoing })
    }
}

#[async_trait]
impl DeadLetterStore for MemoryEnvelopeStore {
    async fn query_dead_letters(
        &self,
        query: &DeadLetterQuery,
    ) -> Result<DeadLetterPage, DurableError> {
        let inner = self.shared.inner.lock();
        let matching = inner.matching_dead_letters(&DeadLetterSelector::Filter(query.filter.clone()));
        Ok(DeadLetterPage {
            total_count: matching.len() as u64,
            records: matching
                .into_iter()
                .skip(query.offset())
                .take(query.page_size)
                .cloned()
                .collect(),
            page: query.page,
            page_size: query.page_size,
        })
    }

    async fn summarize_dead_letters(
        &self,
        grouping: DeadLetterGrouping,
    ) -> Result<Vec<DeadLetterCount>, DurableError> {
        let inner = self.shared.inner.lock();
        let mut groups: HashMap<String, u64> = HashMap::new();
        for record in inner.dead_letters.values() {
            *groups.entry(grouping.key_of(record)).or_default() += 1;
        }
        let mut counts: Vec<DeadLetterCount> = groups
            .into_iter()
            .map(|(key, count)| DeadLetterCount { key, count })
            .collect();
        sort_counts(&mut counts);
        Ok(counts)
    }

    async fn load_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, DurableError> {
        Ok(self.shared.inner.lock().dead_letters.get(&id).cloned())
    }

    async fn discard_dead_letters(
        &self,
        selector: &DeadLetterSelector,
        limit: usize,
    ) -> Result<u64, DurableError> {
        let mut inner = self.shared.inner.lock();
        let ids: Vec<Uuid> = inner
            .matching_dead_letters(selector)
            .into_iter()
            .take(limit)
            .map(DeadLetterRecord::id)
            .collect();
        for id in &ids {
            inner.dead_letters.remove(id);
        }
        Ok(ids.len() as u64)
    }

    async fn mark_dead_letters_replayable(
        &self,
        selector: &DeadLetterSelector,
        limit: usize,
    ) -> Result<u64, DurableError> {
        let mut inner = self.shared.inner.lock();
        let ids: Vec<Uuid> = inner
            .matching_dead_letters(selector)
            .into_iter()
            .filter(|r| !r.replayable)
            .take(limit)
            .map(DeadLetterRecord::id)
            .collect();
        for id in &ids {
            if let Some(record) = inner.dead_letters.get_mut(id) {
                record.replayable = true;
            }
        }
        Ok(ids.len() as u64)
    }

    async fn replay_dead_letters(
        &self,
        limit: usize,
        reset_attempts: bool,
    ) -> Result<u64, DurableError> {
        let mut inner = self.shared.inner.lock();
        let mut replayable: Vec<&DeadLetterRecord> =
            inner.dead_letters.values().filter(|r| r.replayable).collect();
        replayable.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then(a.id().cmp(&b.id())));
        let ids: Vec<Uuid> = replayable.into_iter().take(limit).map(|r| r.id()).collect();

        for id in &ids {
            let Some(record) = inner.dead_letters.remove(id) else {
                continue;
            };
            let envelope = record.into_replayed(reset_attempts);
            inner.remove_incoming(id);
            let seq = inner.next_seq();
            inner.incoming.insert(*id, Stored { envelope, seq });
        }
        Ok(ids.len() as u64)
    }
}

#[async_trait]
impl NodeRegistry for MemoryEnvelopeStore {
    async fn register_node(&self, node: &NodeIdentity) -> Result<(), DurableError> {
        self.shared
            .inner
            .lock()
            .nodes
            .insert(node.id, NodeRecord::new(node, Utc::now()));
        Ok(())
    }

    async fn heartbeat(&self, node: NodeId) -> Result<(), DurableError> {
        if let Some(record) = self.shared.inner.lock().nodes.get_mut(&node) {
            record.last_heartbeat = Utc::now();
        }
        Ok(())
    }

    async fn unregister_node(&self, node: NodeId) -> Result<(), DurableError> {
        self.shared.inner.lock().nodes.remove(&node);
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<NodeRecord>, DurableError> {
        Ok(self.shared.inner.lock().nodes.values().cloned().collect())
    }
}

#[async_trait]
impl AdvisoryLocks for MemoryEnvelopeStore {
    async fn lock_session(&self) -> Result<Box<dyn LockSession>, DurableError> {
        Ok(Box::new(MemoryLockSession {
            id: self.shared.locks.next_session.fetch_add(1, Ordering::SeqCst) + 1,
            store: self.clone(),
            held: HashSet::new(),
        }))
    }
}

/// Lock id -> holding session id.
#[derive(Default)]
struct LockTable {
    held: Mutex<HashMap<LockId, u64>>,
    released: Notify,
    next_session: AtomicU64,
}

impl LockTable {
    fn holder(&self, lock: LockId) -> Option<u64> {
        self.held.lock().get(&lock).copied()
    }

    fn try_acquire(&self, lock: LockId, session: u64) -> bool {
        let mut held = self.held.lock();
        match held.get(&lock) {
            Some(_) => false,
            None => {
                held.insert(lock, session);
                true
            }
        }
    }

    fn release(&self, lock: LockId, session: u64) {
        let mut held = self.held.lock();
        if held.get(&lock) == Some(&session) {
            held.remove(&lock);
        }
        drop(held);
        self.released.notify_waiters();
    }
}

pub struct MemoryLockSession {
    id: u64,
    store: MemoryEnvelopeStore,
    held: HashSet<LockId>,
}

impl MemoryLockSession {
    fn table(&self) -> &LockTable {
        &self.store.shared.locks
    }

    fn release_all(&mut self) {
        for lock in std::mem::take(&mut self.held) {
            self.store.shared.locks.release(lock, self.id);
        }
    }
}

#[async_trait]
impl LockSession for MemoryLockSession {
    async fn get_lock(&mut self, lock: LockId) -> Result<(), DurableError> {
        if self.held.contains(&lock) {
            return Err(DurableError::LockAlreadyHeld { lock });
        }
        let shared = Arc::clone(&self.store.shared);
        loop {
            let released = shared.locks.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if shared.locks.try_acquire(lock, self.id) {
                self.held.insert(lock);
                return Ok(());
            }
            released.await;
        }
    }

    async fn try_get_lock(&mut self, lock: LockId) -> Result<bool, DurableError> {
        let acquired = self.table().try_acquire(lock, self.id);
        if acquired {
            self.held.insert(lock);
        }
        Ok(acquired)
    }

    async fn release_lock(&mut self, lock: LockId) -> Result<(), DurableError> {
        if self.held.remove(&lock) {
            self.table().release(lock, self.id);
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), DurableError> {
        self.release_all();
        Ok(())
    }
}

impl Drop for MemoryLockSession {
    fn drop(&mut self) {
        self.release_all();
    }
}

enum TxOp {
    Incoming(Envelope),
    Outgoing(Envelope, NodeId),
    Handled(Uuid),
    Attempt(Uuid),
    DeadLetter(Envelope, ErrorReport),
}

/// Buffers its operations and applies them all at once on commit.
pub struct MemoryEnvelopeTransaction {
    store: MemoryEnvelopeStore,
    ops: Vec<TxOp>,
}

#[async_trait]
impl EnvelopeTransaction for MemoryEnvelopeTransaction {
    async fn persist_incoming(&mut self, envelope: &Envelope) -> Result<(), DurableError> {
        envelope.validate_for_incoming()?;
        self.ops.push(TxOp::Incoming(envelope.clone()));
        Ok(())
    }

    async fn persist_outgoing(
        &mut self,
        envelope: &Envelope,
        owner: NodeId,
    ) -> Result<(), DurableError> {
        self.ops.push(TxOp::Outgoing(envelope.clone(), owner));
        Ok(())
    }

    async fn mark_handled(&mut self, envelope: &Envelope) -> Result<(), DurableError> {
        self.ops.push(TxOp::Handled(envelope.id));
        Ok(())
    }

    async fn increment_attempts(&mut self, envelope: &Envelope) -> Result<(), DurableError> {
        self.ops.push(TxOp::Attempt(envelope.id));
        Ok(())
    }

    async fn move_to_dead_letter(
        &mut self,
        envelope: &Envelope,
        error: &ErrorReport,
    ) -> Result<(), DurableError> {
        self.ops
            .push(TxOp::DeadLetter(envelope.clone(), error.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), DurableError> {
        let shared = &self.store.shared;
        let keep_until = Utc::now() + shared.settings.keep_after_handling();
        let mut inner = shared.inner.lock();
        inner.check_ops(&self.ops)?;
        for op in &self.ops {
            match op {
                TxOp::Incoming(envelope) => inner.insert_incoming(envelope)?,
                TxOp::Outgoing(envelope, owner) => inner.insert_outgoing(envelope, *owner)?,
                TxOp::Handled(id) => inner.mark_handled(id, keep_until),
                TxOp::Attempt(id) => inner.increment_attempts(id),
                TxOp::DeadLetter(envelope, error) => {
                    inner.move_to_dead_letter(envelope, error, &shared.settings)
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DurableError> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
