//! etcd-backed envelope store.
//!
//! Key layout under the configured prefix, with `{stream}` being
//! `{prefix}{schema_name}`:
//!
//! - `{stream}/incoming/{id}`: incoming, scheduled and handled envelopes
//! - `{stream}/outgoing/{id}`: outbox
//! - `{stream}:scheduled/{score:020}/{id}`: due-time index of scheduled envelopes
//! - `{stream}:dead-letter/{id}`: dead letters
//! - `{prefix}nodes/{id}`: node records (JSON)
//! - `{prefix}locks/{lock}`: lease-attached advisory locks
//!
//! Envelope values are MessagePack. Every conditional write is an etcd `Txn`
//! comparing `create_revision` (for inserts) or `mod_revision` (for claims and
//! moves), so two nodes never both win the same envelope.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, GetOptions, KeyValue, LeaseGrantOptions,
    PutOptions, Txn, TxnOp, TxnOpResponse, TxnResponse,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::instrument;
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

/// etcd's default `--max-txn-ops`.
const MAX_TXN_OPS: usize = 128;

/// Operations per `Txn` for work that may be split across transactions.
const TXN_OPS: usize = MAX_TXN_OPS / 2;

const MAX_CAS_RETRIES: u32 = 10;

/// Poll interval while waiting for a held lock.
const LOCK_RETRY: Duration = Duration::from_millis(100);

/// Lease TTL for the short-lived lock taken while reassigning a dormant node.
const REASSIGN_LEASE_TTL: i64 = 30;

fn map_err(e: etcd_client::Error) -> DurableError {
    DurableError::PersistenceError {
        reason: e.to_string(),
        source: Some(Box::new(e)),
    }
}

/// A transaction that must stay atomic cannot be chunked, so reject it.
fn check_txn_size(compares: usize, writes: usize) -> Result<(), DurableError> {
    if compares > MAX_TXN_OPS || writes > MAX_TXN_OPS {
        return Err(DurableError::persistence(format!(
            "transaction too large for one etcd txn: {compares} compares, {writes} writes \
             (limit {MAX_TXN_OPS})"
        )));
    }
    Ok(())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DurableError> {
    rmp_serde::to_vec_named(value).map_err(|e| DurableError::MalformedEnvelope {
        reason: format!("failed to encode value: {e}"),
        source: Some(Box::new(e)),
    })
}

fn decode<T: DeserializeOwned>(kv: &KeyValue) -> Result<T, DurableError> {
    rmp_serde::from_slice(kv.value()).map_err(|e| DurableError::MalformedEnvelope {
        reason: format!(
            "failed to decode value at key '{}': {e}",
            String::from_utf8_lossy(kv.key())
        ),
        source: Some(Box::new(e)),
    })
}

/// Sortable due-time score: milliseconds since the epoch, clamped at zero.
fn score(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_millis()).unwrap_or(0)
}

/// Key builders for one stream.
#[derive(Debug, Clone)]
struct Keys {
    root: String,
    stream: String,
}

impl Keys {
    fn new(prefix: &str, stream: &str) -> Self {
        Self {
            root: prefix.to_string(),
            stream: format!("{prefix}{stream}"),
        }
    }

    fn incoming_prefix(&self) -> String {
        format!("{}/incoming/", self.stream)
    }

    fn incoming(&self, id: Uuid) -> String {
        format!("{}{id}", self.incoming_prefix())
    }

    fn outgoing_prefix(&self) -> String {
        format!("{}/outgoing/", self.stream)
    }

    fn outgoing(&self, id: Uuid) -> String {
        format!("{}{id}", self.outgoing_prefix())
    }

    fn scheduled_prefix(&self) -> String {
        format!("{}:scheduled/", self.stream)
    }

    fn scheduled(&self, at: DateTime<Utc>, id: Uuid) -> String {
        format!("{}{:020}/{id}", self.scheduled_prefix(), score(at))
    }

    /// Exclusive range end covering every entry due at or before `now`.
    fn scheduled_until(&self, now: DateTime<Utc>) -> String {
        format!("{}{:020}", self.scheduled_prefix(), score(now).saturating_add(1))
    }

    fn dead_letter_prefix(&self) -> String {
        format!("{}:dead-letter/", self.stream)
    }

    fn dead_letter(&self, id: Uuid) -> String {
        format!("{}{id}", self.dead_letter_prefix())
    }

    fn nodes_prefix(&self) -> String {
        format!("{}nodes/", self.root)
    }

    fn node(&self, id: NodeId) -> String {
        format!("{}{id}", self.nodes_prefix())
    }

    fn lock(&self, lock: LockId) -> String {
        format!("{}locks/{lock}", self.root)
    }
}

/// A decoded value with the revisions needed for compare-and-swap.
#[derive(Debug)]
struct Entry<T> {
    key: String,
    value: T,
    create_revision: i64,
    mod_revision: i64,
}

impl<T: DeserializeOwned> Entry<T> {
    fn decode(kv: &KeyValue) -> Result<Self, DurableError> {
        Ok(Self {
            key: String::from_utf8_lossy(kv.key()).into_owned(),
            value: decode(kv)?,
            create_revision: kv.create_revision(),
            mod_revision: kv.mod_revision(),
        })
    }
}

/// Persisted dead-letter value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DeadLetterEntry {
    envelope_id: Uuid,
    exception_type: String,
    exception_message: String,
    exception_stack: String,
    #[serde(default)]
    explanation: String,
    message_type: String,
    failed_at: DateTime<Utc>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    replayable: bool,
    envelope: Envelope,
}

impl DeadLetterEntry {
    fn new(envelope: &Envelope, error: &ErrorReport, failed_at: DateTime<Utc>) -> Self {
        Self {
            envelope_id: envelope.id,
            exception_type: error.exception_type.clone(),
            exception_message: error.exception_message.clone(),
            exception_stack: error.exception_detail.clone(),
            explanation: error.explanation.clone(),
            message_type: envelope.message_type.clone(),
            failed_at,
            expires_at: None,
            replayable: false,
            envelope: envelope.clone(),
        }
    }

    fn into_record(self) -> DeadLetterRecord {
        DeadLetterRecord {
            envelope: self.envelope,
            error: ErrorReport {
                exception_type: self.exception_type,
                exception_message: self.exception_message,
                exception_detail: self.exception_stack,
                explanation: self.explanation,
            },
            replayable: self.replayable,
            failed_at: self.failed_at,
            expires_at: self.expires_at,
        }
    }
}

/// etcd-backed envelope store. Cheap to clone; clones share one client.
#[derive(Clone)]
pub struct EtcdEnvelopeStore {
    name: String,
    client: Arc<Mutex<Client>>,
    keys: Keys,
    settings: DurabilitySettings,
    lease_ttl: i64,
}

impl EtcdEnvelopeStore {
    /// Create a store over a connected client.
    ///
    /// - `prefix`: key prefix shared by every store in the cluster (e.g. "/courier/").
    pub fn new(
        name: impl Into<String>,
        client: Client,
        prefix: impl Into<String>,
        settings: DurabilitySettings,
    ) -> Result<Self, DurableError> {
        settings.validate()?;
        let prefix = prefix.into();
        let lease_ttl = i64::try_from(settings.stale_node_timeout.as_secs())
            .unwrap_or(i64::MAX)
            .max(2);
        Ok(Self {
            name: name.into(),
            client: Arc::new(Mutex::new(client)),
            keys: Keys::new(&prefix, &settings.schema_name),
            settings,
            lease_ttl,
        })
    }

    /// Connect to `endpoints` and create a store.
    pub async fn connect(
        name: impl Into<String>,
        endpoints: &[String],
        prefix: impl Into<String>,
        settings: DurabilitySettings,
    ) -> Result<Self, DurableError> {
        let client = Client::connect(endpoints, None).await.map_err(map_err)?;
        Self::new(name, client, prefix, settings)
    }

    /// TTL in seconds of lock-session leases.
    pub fn with_lease_ttl(mut self, lease_ttl: i64) -> Self {
        self.lease_ttl = lease_ttl.max(1);
        self
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse, DurableError> {
        let mut client = self.client.lock().await;
        client.txn(txn).await.map_err(map_err)
    }

    /// Apply unconditional ops, [`TXN_OPS`] per transaction.
    async fn apply(&self, ops: Vec<TxnOp>) -> Result<(), DurableError> {
        let mut ops = ops.into_iter().peekable();
        while ops.peek().is_some() {
            let chunk: Vec<TxnOp> = ops.by_ref().take(TXN_OPS).collect();
            self.txn(Txn::new().and_then(chunk)).await?;
        }
        Ok(())
    }

    async fn scan_raw(&self, prefix: String) -> Result<Vec<KeyValue>, DurableError> {
        let mut client = self.client.lock().await;
        let mut resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_err)?;
        Ok(resp.take_kvs())
    }

    /// Every value under `prefix`, in creation order.
    async fn scan<T: DeserializeOwned>(&self, prefix: String) -> Result<Vec<Entry<T>>, DurableError> {
        let mut entries = self
            .scan_raw(prefix)
            .await?
            .iter()
            .map(Entry::decode)
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.create_revision);
        Ok(entries)
    }

    async fn count(&self, prefix: String) -> Result<i64, DurableError> {
        let mut client = self.client.lock().await;
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix().with_count_only()))
            .await
            .map_err(map_err)?;
        Ok(resp.count())
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Entry<T>>, DurableError> {
        let mut client = self.client.lock().await;
        let resp = client.get(key, None).await.map_err(map_err)?;
        resp.kvs().first().map(Entry::decode).transpose()
    }

    /// Load several keys with one `Txn` of range reads per chunk.
    async fn load_many<T: DeserializeOwned>(
        &self,
        keys: &[String],
    ) -> Result<Vec<Entry<T>>, DurableError> {
        let mut entries = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(TXN_OPS) {
            let ops: Vec<TxnOp> = chunk.iter().map(|key| TxnOp::get(key.as_str(), None)).collect();
            let resp = self.txn(Txn::new().and_then(ops)).await?;
            for op in resp.op_responses() {
                if let TxnOpResponse::Get(get) = op {
                    if let Some(kv) = get.kvs().first() {
                        entries.push(Entry::decode(kv)?);
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Compare-and-swap one envelope.
    ///
    /// `mutate` returns `None` to leave the envelope alone, or the extra ops
    /// to apply alongside the rewrite. Returns whether a write happened.
    async fn update_envelope(
        &self,
        key: &str,
        mut mutate: impl FnMut(&mut Envelope) -> Option<Vec<TxnOp>> + Send,
    ) -> Result<bool, DurableError> {
        for attempt in 1..=MAX_CAS_RETRIES {
            let Some(mut entry) = self.load::<Envelope>(key).await? else {
                return Ok(false);
            };
            let Some(mut ops) = mutate(&mut entry.value) else {
                return Ok(false);
            };
            ops.push(TxnOp::put(key, encode(&entry.value)?, None));
            let txn = Txn::new()
                .when([Compare::mod_revision(key, CompareOp::Equal, entry.mod_revision)])
                .and_then(ops);
            if self.txn(txn).await?.succeeded() {
                return Ok(true);
            }
            tracing::debug!(attempt, key, "envelope CAS conflict, retrying");
            let backoff_ms = (1u64 << attempt.min(5)).min(50);
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
        Err(DurableError::persistence(format!(
            "envelope CAS failed after {MAX_CAS_RETRIES} retries at key '{key}'"
        )))
    }

    /// Ops writing a new incoming envelope plus its schedule index entry.
    fn incoming_put_ops(&self, envelope: &Envelope) -> Result<Vec<TxnOp>, DurableError> {
        let mut ops = vec![TxnOp::put(
            self.keys.incoming(envelope.id),
            encode(envelope)?,
            None,
        )];
        if let Some(at) = envelope.scheduled_time {
            ops.push(TxnOp::put(
                self.keys.scheduled(at, envelope.id),
                envelope.id.to_string(),
                None,
            ));
        }
        Ok(ops)
    }

    /// The first of `ids` that already exists under `key_of`.
    async fn find_existing(
        &self,
        ids: impl Iterator<Item = Uuid>,
        key_of: impl Fn(Uuid) -> String,
    ) -> Result<Option<Uuid>, DurableError> {
        let mut client = self.client.lock().await;
        for id in ids {
            let resp = client
                .get(key_of(id), Some(GetOptions::new().with_count_only()))
                .await
                .map_err(map_err)?;
            if resp.count() > 0 {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Claim each still-unowned envelope with its own compare on `mod_revision`.
    ///
    /// Every claim is a nested `Txn`, so one round trip settles a whole chunk
    /// and a lost race only drops that envelope.
    async fn claim(
        &self,
        keys: Vec<String>,
        node: NodeId,
        eligible: impl Fn(&Envelope) -> bool,
    ) -> Result<Vec<Envelope>, DurableError> {
        let mut entries = self.load_many::<Envelope>(&keys).await?;
        entries.sort_by_key(|entry| entry.create_revision);
        let candidates: Vec<Entry<Envelope>> = entries
            .into_iter()
            .filter(|entry| entry.value.owner_id.is_any() && eligible(&entry.value))
            .collect();

        let mut claimed = Vec::new();
        for chunk in candidates.chunks(TXN_OPS) {
            let mut ops = Vec::with_capacity(chunk.len());
            let mut owned = Vec::with_capacity(chunk.len());
            for entry in chunk {
                let mut envelope = entry.value.clone();
                envelope.owner_id = node;
                let claim = Txn::new()
                    .when([Compare::mod_revision(
                        entry.key.as_str(),
                        CompareOp::Equal,
                        entry.mod_revision,
                    )])
                    .and_then([TxnOp::put(entry.key.as_str(), encode(&envelope)?, None)]);
                ops.push(TxnOp::txn(claim));
                owned.push(envelope);
            }
            let resp = self.txn(Txn::new().and_then(ops)).await?;
            for (envelope, op) in owned.into_iter().zip(resp.op_responses()) {
                if let TxnOpResponse::Txn(inner) = op {
                    if inner.succeeded() {
                        claimed.push(envelope);
                    }
                }
            }
        }
        Ok(claimed)
    }

    async fn dead_letters(&self) -> Result<Vec<Entry<DeadLetterEntry>>, DurableError> {
        let mut entries = self
            .scan::<DeadLetterEntry>(self.keys.dead_letter_prefix())
            .await?;
        entries.sort_by(|a, b| {
            (a.value.failed_at, a.value.envelope_id).cmp(&(b.value.failed_at, b.value.envelope_id))
        });
        Ok(entries)
    }

    async fn selected_dead_letters(
        &self,
        selector: &DeadLetterSelector,
        limit: usize,
        extra: impl Fn(&DeadLetterEntry) -> bool,
    ) -> Result<Vec<Entry<DeadLetterEntry>>, DurableError> {
        Ok(self
            .dead_letters()
            .await?
            .into_iter()
            .filter(|entry| extra(&entry.value))
            .filter(|entry| selector.matches(&entry.value.clone().into_record()))
            .take(limit)
            .collect())
    }

    async fn grant_lease(&self, ttl: i64) -> Result<i64, DurableError> {
        let mut client = self.client.lock().await;
        let lease = client
            .lease_grant(ttl, None::<LeaseGrantOptions>)
            .await
            .map_err(map_err)?;
        Ok(lease.id())
    }

    async fn revoke_lease(&self, lease_id: i64) {
        let mut client = self.client.lock().await;
        if let Err(e) = client.lease_revoke(lease_id).await {
            tracing::warn!(lease_id, error = %e, "failed to revoke lease, it will expire via TTL");
        }
    }
}

#[async_trait]
impl EnvelopeStore for EtcdEnvelopeStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn settings(&self) -> &DurabilitySettings {
        &self.settings
    }

    async fn ensure_schema(&self) -> Result<(), DurableError> {
        Ok(())
    }

    #[instrument(skip(self), fields(stream = %self.keys.stream))]
    async fn rebuild_schema(&self) -> Result<(), DurableError> {
        self.clear_all().await?;
        tracing::warn!("deleted envelope stream");
        Ok(())
    }

    async fn store_incoming(&self, envelope: &Envelope) -> Result<(), DurableError> {
        envelope.validate_for_incoming()?;
        let key = self.keys.incoming(envelope.id);
        let txn = Txn::new()
            .when([Compare::create_revision(key.as_str(), CompareOp::Equal, 0)])
            .and_then(self.incoming_put_ops(envelope)?);
        if !self.txn(txn).await?.succeeded() {
            return Err(DurableError::DuplicateEnvelope { id: envelope.id });
        }
        Ok(())
    }

    async fn store_incoming_batch(&self, envelopes: &[Envelope]) -> Result<(), DurableError> {
        let mut seen = HashSet::with_capacity(envelopes.len());
        for envelope in envelopes {
            envelope.validate_for_incoming()?;
            if !seen.insert(envelope.id) {
                return Err(DurableError::DuplicateEnvelope { id: envelope.id });
            }
        }

        // Two puts per scheduled envelope, so half of TXN_OPS envelopes per Txn.
        let mut written: Vec<&Envelope> = Vec::with_capacity(envelopes.len());
        for chunk in envelopes.chunks(TXN_OPS / 2) {
            let compares: Vec<Compare> = chunk
                .iter()
                .map(|e| Compare::create_revision(self.keys.incoming(e.id), CompareOp::Equal, 0))
                .collect();
            let mut ops = Vec::with_capacity(chunk.len() * 2);
            for envelope in chunk {
                ops.extend(self.incoming_put_ops(envelope)?);
            }
            if self.txn(Txn::new().when(compares).and_then(ops)).await?.succeeded() {
                written.extend(chunk);
                continue;
            }

            // Undo earlier chunks so the batch stays all-or-nothing.
            let mut undo = Vec::with_capacity(written.len() * 2);
            for envelope in &written {
                undo.push(TxnOp::delete(self.keys.incoming(envelope.id), None));
                if let Some(at) = envelope.scheduled_time {
                    undo.push(TxnOp::delete(self.keys.scheduled(at, envelope.id), None));
                }
            }
            self.apply(undo).await?;
            let id = self
                .find_existing(chunk.iter().map(|e| e.id), |id| self.keys.incoming(id))
                .await?
                .unwrap_or(chunk[0].id);
            return Err(DurableError::DuplicateEnvelope { id });
        }
        Ok(())
    }

    async fn store_outgoing(&self, envelope: &Envelope, owner: NodeId) -> Result<(), DurableError> {
        let key = self.keys.outgoing(envelope.id);
        let mut envelope = envelope.clone();
        envelope.owner_id = owner;
        let txn = Txn::new()
            .when([Compare::create_revision(key.as_str(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key.as_str(), encode(&envelope)?, None)]);
        if !self.txn(txn).await?.succeeded() {
            return Err(DurableError::DuplicateEnvelope { id: envelope.id });
        }
        Ok(())
    }

    async fn mark_handled(&self, envelopes: &[Envelope]) -> Result<(), DurableError> {
        let keys: Vec<String> = envelopes.iter().map(|e| self.keys.incoming(e.id)).collect();
        let keep_until = Utc::now() + self.settings.keep_after_handling();
        let mut ops = Vec::with_capacity(keys.len());
        for mut entry in self.load_many::<Envelope>(&keys).await? {
            if let Some(at) = entry.value.scheduled_time {
                ops.push(TxnOp::delete(self.keys.scheduled(at, entry.value.id), None));
            }
            entry.value.mark_handled(keep_until);
            ops.push(TxnOp::put(entry.key, encode(&entry.value)?, None));
        }
        self.apply(ops).await
    }

    async fn increment_attempts(&self, envelope: &Envelope) -> Result<(), DurableError> {
        self.update_envelope(&self.keys.incoming(envelope.id), |stored| {
            stored.attempts += 1;
            Some(Vec::new())
        })
        .await?;
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        envelope: &Envelope,
        error: &ErrorReport,
    ) -> Result<(), DurableError> {
        let failed_at = Utc::now();
        let mut entry = DeadLetterEntry::new(envelope, error, failed_at);
        entry.expires_at = self.settings.dead_letter_expires_at(failed_at);
        let mut ops = vec![
            TxnOp::delete(self.keys.incoming(envelope.id), None),
            TxnOp::put(self.keys.dead_letter(envelope.id), encode(&entry)?, None),
        ];
        if let Some(at) = envelope.scheduled_time {
            ops.push(TxnOp::delete(self.keys.scheduled(at, envelope.id), None));
        }
        self.txn(Txn::new().and_then(ops)).await?;
        Ok(())
    }

    async fn reschedule_incoming(
        &self,
        envelope: &Envelope,
        at: DateTime<Utc>,
    ) -> Result<(), DurableError> {
        let keys = self.keys.clone();
        self.update_envelope(&keys.incoming(envelope.id), |stored| {
            let mut ops = Vec::with_capacity(2);
            if let Some(previous) = stored.scheduled_time {
                ops.push(TxnOp::delete(keys.scheduled(previous, stored.id), None));
            }
            stored.status = EnvelopeStatus::Scheduled;
            stored.scheduled_time = Some(at);
            stored.owner_id = NodeId::ANY;
            ops.push(TxnOp::put(keys.scheduled(at, stored.id), stored.id.to_string(), None));
            Some(ops)
        })
        .await?;
        Ok(())
    }

    async fn load_ready_incoming(
        &self,
        destination: &EndpointUri,
        limit: usize,
    ) -> Result<Vec<Envelope>, DurableError> {
        let now = Utc::now();
        Ok(self
            .scan::<Envelope>(self.keys.incoming_prefix())
            .await?
            .into_iter()
            .map(|entry| entry.value)
            .filter(|e| {
                e.status == EnvelopeStatus::Incoming
                    && e.owner_id.is_any()
                    && !e.is_expired(now)
                    && e.destination_key() == destination.as_str()
            })
            .take(limit)
            .collect())
    }

    async fn claim_incoming(
        &self,
        ids: &[Uuid],
        node: NodeId,
    ) -> Result<Vec<Envelope>, DurableError> {
        let keys = ids.iter().map(|id| self.keys.incoming(*id)).collect();
        self.claim(keys, node, |e| e.status == EnvelopeStatus::Incoming)
            .await
    }

    async fn release_incoming(&self, ids: &[Uuid], node: NodeId) -> Result<(), DurableError> {
        for id in ids {
            self.update_envelope(&self.keys.incoming(*id), |stored| {
                (stored.owner_id == node).then(|| {
                    stored.owner_id = NodeId::ANY;
                    Vec::new()
                })
            })
            .await?;
        }
        Ok(())
    }

    async fn load_outgoing(
        &self,
        destination: &EndpointUri,
    ) -> Result<Vec<Envelope>, DurableError> {
        Ok(self
            .scan::<Envelope>(self.keys.outgoing_prefix())
            .await?
            .into_iter()
            .map(|entry| entry.value)
            .filter(|e| e.destination_key() == destination.as_str())
            .collect())
    }

    async fn claim_outgoing(
        &self,
        ids: &[Uuid],
        node: NodeId,
    ) -> Result<Vec<Envelope>, DurableError> {
        let keys = ids.iter().map(|id| self.keys.outgoing(*id)).collect();
        self.claim(keys, node, |_| true).await
    }

    async fn delete_outgoing(&self, envelopes: &[Envelope]) -> Result<(), DurableError> {
        let ops = envelopes
            .iter()
            .map(|e| TxnOp::delete(self.keys.outgoing(e.id), None))
            .collect();
        self.apply(ops).await
    }

    async fn discard_and_reassign_outgoing(
        &self,
        discards: &[Envelope],
        reassigned: &[Envelope],
        node: NodeId,
    ) -> Result<(), DurableError> {
        let mut ops: Vec<TxnOp> = discards
            .iter()
            .map(|e| TxnOp::delete(self.keys.outgoing(e.id), None))
            .collect();
        let keys: Vec<String> = reassigned.iter().map(|e| self.keys.outgoing(e.id)).collect();
        for mut entry in self.load_many::<Envelope>(&keys).await? {
            entry.value.owner_id = node;
            ops.push(TxnOp::put(entry.key, encode(&entry.value)?, None));
        }
        self.apply(ops).await
    }

    async fn fetch_counts(&self) -> Result<PersistedCounts, DurableError> {
        let mut counts = PersistedCounts::default();
        for entry in self.scan::<Envelope>(self.keys.incoming_prefix()).await? {
            match entry.value.status {
                EnvelopeStatus::Incoming => counts.incoming += 1,
                EnvelopeStatus::Scheduled => counts.scheduled += 1,
                EnvelopeStatus::Handled => counts.handled += 1,
            }
        }
        counts.outgoing = self.count(self.keys.outgoing_prefix()).await?;
        counts.dead_letters = self.count(self.keys.dead_letter_prefix()).await?;
        Ok(counts)
    }

    async fn all_incoming(&self) -> Result<Vec<Envelope>, DurableError> {
        Ok(self
            .scan::<Envelope>(self.keys.incoming_prefix())
            .await?
            .into_iter()
            .map(|entry| entry.value)
            .collect())
    }

    async fn all_outgoing(&self) -> Result<Vec<Envelope>, DurableError> {
        Ok(self
            .scan::<Envelope>(self.keys.outgoing_prefix())
            .await?
            .into_iter()
            .map(|entry| entry.value)
            .collect())
    }

    #[instrument(skip(self), fields(stream = %self.keys.stream))]
    async fn clear_all(&self) -> Result<(), DurableError> {
        let ops = [
            self.keys.incoming_prefix(),
            self.keys.outgoing_prefix(),
            self.keys.scheduled_prefix(),
            self.keys.dead_letter_prefix(),
        ]
        .into_iter()
        .map(|prefix| TxnOp::delete(prefix, Some(DeleteOptions::new().with_prefix())))
        .collect::<Vec<_>>();
        self.txn(Txn::new().and_then(ops)).await?;
        Ok(())
    }

    async fn release_ownership(
        &self,
        node: NodeId,
        destination: Option<&EndpointUri>,
    ) -> Result<(), DurableError> {
        let matches = |e: &Envelope| {
            e.owner_id == node && destination.map_or(true, |d| e.destination_key() == d.as_str())
        };
        let mut keys = Vec::new();
        for prefix in [self.keys.incoming_prefix(), self.keys.outgoing_prefix()] {
            keys.extend(
                self.scan::<Envelope>(prefix)
                    .await?
                    .into_iter()
                    .filter(|entry| matches(&entry.value))
                    .map(|entry| entry.key),
            );
        }
        for key in keys {
            self.update_envelope(&key, |stored| {
                matches(stored).then(|| {
                    stored.owner_id = NodeId::ANY;
                    Vec::new()
                })
            })
            .await?;
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn EnvelopeTransaction>, DurableError> {
        Ok(Box::new(EtcdEnvelopeTransaction {
            store: self.clone(),
            compares: Vec::new(),
            inserted: Vec::new(),
            writes: BTreeMap::new(),
            pending: HashMap::new(),
        }))
    }
}

#[async_trait]
impl ScheduledJobs for EtcdEnvelopeStore {
    async fn schedule(&self, envelope: &Envelope) -> Result<(), DurableError> {
        if envelope.status != EnvelopeStatus::Scheduled {
            return Err(DurableError::InvariantViolation {
                reason: format!("envelope {} is not scheduled", envelope.id),
            });
        }
        self.store_incoming(envelope).await
    }

    #[instrument(skip(self), fields(store = %self.name))]
    async fn dispatch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Envelope>, DurableError> {
        let mut due = {
            let mut client = self.client.lock().await;
            let mut resp = client
                .get(
                    self.keys.scheduled_prefix(),
                    Some(GetOptions::new().with_range(self.keys.scheduled_until(now))),
                )
                .await
                .map_err(map_err)?;
            resp.take_kvs()
        };
        // Key order is (score, id); ties on score go by insertion order.
        due.sort_by_key(|kv| {
            let score = kv.key().rsplitn(2, |b| *b == b'/').nth(1).map(<[u8]>::to_vec);
            (score, kv.create_revision())
        });

        let mut released = Vec::new();
        for index in due {
            if released.len() >= limit {
                break;
            }
            let index_key = String::from_utf8_lossy(index.key()).into_owned();
            let id = match std::str::from_utf8(index.value())
                .ok()
                .and_then(|v| Uuid::parse_str(v).ok())
            {
                Some(id) => id,
                None => {
                    tracing::warn!(key = %index_key, "skipping malformed schedule entry");
                    continue;
                }
            };
            let key = self.keys.incoming(id);
            let Some(mut entry) = self.load::<Envelope>(&key).await? else {
                self.txn(Txn::new().and_then([TxnOp::delete(index_key.as_str(), None)]))
                    .await?;
                continue;
            };
            if entry.value.status != EnvelopeStatus::Scheduled {
                continue;
            }
            entry.value.release_scheduled();
            let txn = Txn::new()
                .when([
                    Compare::mod_revision(index_key.as_str(), CompareOp::Equal, index.mod_revision()),
                    Compare::mod_revision(key.as_str(), CompareOp::Equal, entry.mod_revision),
                ])
                .and_then([
                    TxnOp::put(key.as_str(), encode(&entry.value)?, None),
                    TxnOp::delete(index_key.as_str(), None),
                ]);
            if self.txn(txn).await?.succeeded() {
                released.push(entry.value);
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl RecoveryStore for EtcdEnvelopeStore {
    async fn find_recoverable_incoming(&self) -> Result<Vec<RecoverableIncoming>, DurableError> {
        let now = Utc::now();
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for entry in self.scan::<Envelope>(self.keys.incoming_prefix()).await? {
            let e = &entry.value;
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
        let destinations: BTreeSet<String> = self
            .scan::<Envelope>(self.keys.outgoing_prefix())
            .await?
            .into_iter()
            .filter(|entry| entry.value.owner_id.is_any())
            .map(|entry| entry.value.destination_key().to_string())
            .collect();
        Ok(destinations.into_iter().map(EndpointUri::new).collect())
    }

    #[instrument(skip(self), fields(store = %self.name))]
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<ExpiredSweep, DurableError> {
        let mut sweep = ExpiredSweep::default();
        let mut ops = Vec::new();
        for entry in self.scan::<Envelope>(self.keys.incoming_prefix()).await? {
            let e = &entry.value;
            let purge = if e.status == EnvelopeStatus::Handled {
                let purge = e.keep_until.is_some_and(|at| at <= now);
                sweep.handled += u64::from(purge);
                purge
            } else {
                let purge = e.is_expired(now);
                sweep.expired += u64::from(purge);
                purge
            };
            if purge {
                if let Some(at) = e.scheduled_time {
                    ops.push(TxnOp::delete(self.keys.scheduled(at, e.id), None));
                }
                ops.push(TxnOp::delete(entry.key, None));
            }
        }
        for entry in self.scan::<Envelope>(self.keys.outgoing_prefix()).await? {
            if entry.value.is_expired(now) {
                sweep.expired += 1;
                ops.push(TxnOp::delete(entry.key, None));
            }
        }
        for entry in self.dead_letters().await? {
            if entry.value.expires_at.is_some_and(|at| at <= now) {
                sweep.dead_letters += 1;
                ops.push(TxnOp::delete(entry.key, None));
            }
        }
        self.apply(ops).await?;
        Ok(sweep)
    }

    async fn envelope_owners(&self) -> Result<Vec<NodeId>, DurableError> {
        let mut owners = BTreeSet::new();
        for prefix in [self.keys.incoming_prefix(), self.keys.outgoing_prefix()] {
            for entry in self.scan::<Envelope>(prefix).await? {
                if !entry.value.owner_id.is_any() {
                    owners.insert(entry.value.owner_id);
                }
            }
        }
        Ok(owners.into_iter().collect())
    }

    #[instrument(skip(self), fields(store = %self.name))]
    async fn reassign_dormant_node(&self, node: NodeId) -> Result<ReassignOutcome, DurableError> {
        // The live node holds this key through its lock-session lease.
        let lock_key = self
            .keys
            .lock(LockId::node(&self.settings.schema_name, node));
        let lease_id = self.grant_lease(REASSIGN_LEASE_TTL).await?;
        let txn = Txn::new()
            .when([Compare::create_revision(lock_key.as_str(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                lock_key.as_str(),
                "reassigning",
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        if !self.txn(txn).await?.succeeded() {
            self.revoke_lease(lease_id).await;
            return Ok(ReassignOutcome::NodeStillAlive);
        }

        let result = async {
            let mut released = [0u64; 2];
            let prefixes = [self.keys.incoming_prefix(), self.keys.outgoing_prefix()];
            for (count, prefix) in released.iter_mut().zip(prefixes) {
                for entry in self.scan::<Envelope>(prefix).await? {
                    if entry.value.owner_id != node {
                        continue;
                    }
                    let updated = self
                        .update_envelope(&entry.key, |stored| {
                            (stored.owner_id == node).then(|| {
                                stored.owner_id = NodeId::ANY;
                                Vec::new()
                            })
                        })
                        .await?;
                    *count += u64::from(updated);
                }
            }
            self.txn(Txn::new().and_then([TxnOp::delete(self.keys.node(node), None)]))
                .await?;
            Ok::<_, DurableError>(ReassignOutcome::Reassigned {
                incoming: released[0],
                outgoing: released[1],
            })
        }
        .await;

        // Revoking the lease deletes the lock key.
        self.revoke_lease(lease_id).await;
        result
    }
}

#[async_trait]
impl DeadLetterStore for EtcdEnvelopeStore {
    async fn query_dead_letters(
        &self,
        query: &DeadLetterQuery,
    ) -> Result<DeadLetterPage, DurableError> {
        let matching: Vec<DeadLetterRecord> = self
            .dead_letters()
            .await?
            .into_iter()
            .map(|entry| entry.value.into_record())
            .filter(|record| query.filter.matches(record))
            .collect();
        let total_count = matching.len() as u64;
        Ok(DeadLetterPage {
            records: matching
                .into_iter()
                .skip(query.offset())
                .take(query.page_size)
                .collect(),
            total_count,
            page: query.page,
            page_size: query.page_size,
        })
    }

    async fn summarize_dead_letters(
        &self,
        grouping: DeadLetterGrouping,
    ) -> Result<Vec<DeadLetterCount>, DurableError> {
        let mut groups: BTreeMap<String, u64> = BTreeMap::new();
        for entry in self.dead_letters().await? {
            *groups
                .entry(grouping.key_of(&entry.value.into_record()))
                .or_default() += 1;
        }
        let mut counts: Vec<DeadLetterCount> = groups
            .into_iter()
            .map(|(key, count)| DeadLetterCount { key, count })
            .collect();
        sort_counts(&mut counts);
        Ok(counts)
    }

    async fn load_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, DurableError> {
        Ok(self
            .load::<DeadLetterEntry>(&self.keys.dead_letter(id))
            .await?
            .map(|entry| entry.value.into_record()))
    }

    async fn discard_dead_letters(
        &self,
        selector: &DeadLetterSelector,
        limit: usize,
    ) -> Result<u64, DurableError> {
        let selected = self.selected_dead_letters(selector, limit, |_| true).await?;
        let deleted = selected.len() as u64;
        let ops = selected
            .into_iter()
            .map(|entry| TxnOp::delete(entry.key, None))
            .collect();
        self.apply(ops).await?;
        Ok(deleted)
    }

    async fn mark_dead_letters_replayable(
        &self,
        selector: &DeadLetterSelector,
        limit: usize,
    ) -> Result<u64, DurableError> {
        let selected = self
            .selected_dead_letters(selector, limit, |entry| !entry.replayable)
            .await?;
        let marked = selected.len() as u64;
        let mut ops = Vec::with_capacity(selected.len());
        for mut entry in selected {
            entry.value.replayable = true;
            ops.push(TxnOp::put(entry.key, encode(&entry.value)?, None));
        }
        self.apply(ops).await?;
        Ok(marked)
    }

    #[instrument(skip(self), fields(store = %self.name))]
    async fn replay_dead_letters(
        &self,
        limit: usize,
        reset_attempts: bool,
    ) -> Result<u64, DurableError> {
        let mut replayed = 0;
        for entry in self
            .dead_letters()
            .await?
            .into_iter()
            .filter(|entry| entry.value.replayable)
            .take(limit)
        {
            let envelope = entry.value.into_record().into_replayed(reset_attempts);
            let txn = Txn::new()
                .when([Compare::mod_revision(
                    entry.key.as_str(),
                    CompareOp::Equal,
                    entry.mod_revision,
                )])
                .and_then([
                    TxnOp::delete(entry.key.as_str(), None),
                    TxnOp::put(self.keys.incoming(envelope.id), encode(&envelope)?, None),
                ]);
            if self.txn(txn).await?.succeeded() {
                replayed += 1;
            }
        }
        Ok(replayed)
    }
}

#[async_trait]
impl NodeRegistry for EtcdEnvelopeStore {
    async fn register_node(&self, node: &NodeIdentity) -> Result<(), DurableError> {
        let record = NodeRecord::new(node, Utc::now());
        let data = serde_json::to_vec(&record).map_err(|e| DurableError::PersistenceError {
            reason: format!("failed to serialize node record: {e}"),
            source: Some(Box::new(e)),
        })?;
        let mut client = self.client.lock().await;
        client
            .put(self.keys.node(node.id), data, None)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn heartbeat(&self, node: NodeId) -> Result<(), DurableError> {
        let key = self.keys.node(node);
        let mut client = self.client.lock().await;
        let resp = client.get(key.as_str(), None).await.map_err(map_err)?;
        let Some(kv) = resp.kvs().first() else {
            return Ok(());
        };
        let mut record: NodeRecord =
            serde_json::from_slice(kv.value()).map_err(|e| DurableError::PersistenceError {
                reason: format!("failed to deserialize node record at key '{key}': {e}"),
                source: Some(Box::new(e)),
            })?;
        record.last_heartbeat = Utc::now();
        let data = serde_json::to_vec(&record).map_err(|e| DurableError::PersistenceError {
            reason: format!("failed to serialize node record: {e}"),
            source: Some(Box::new(e)),
        })?;
        // Lost races only mean a concurrent unregister won.
        let txn = Txn::new()
            .when([Compare::mod_revision(key.as_str(), CompareOp::Equal, kv.mod_revision())])
            .and_then([TxnOp::put(key.as_str(), data, None)]);
        client.txn(txn).await.map_err(map_err)?;
        Ok(())
    }

    async fn unregister_node(&self, node: NodeId) -> Result<(), DurableError> {
        let mut client = self.client.lock().await;
        client
            .delete(self.keys.node(node), None)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<NodeRecord>, DurableError> {
        let mut records = Vec::new();
        for kv in self.scan_raw(self.keys.nodes_prefix()).await? {
            match serde_json::from_slice::<NodeRecord>(kv.value()) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        key = ?String::from_utf8_lossy(kv.key()),
                        error = %e,
                        "skipping malformed node entry in etcd"
                    );
                }
            }
        }
        records.sort_by_key(|record| record.id);
        Ok(records)
    }
}

#[async_trait]
impl AdvisoryLocks for EtcdEnvelopeStore {
    async fn lock_session(&self) -> Result<Box<dyn LockSession>, DurableError> {
        Ok(Box::new(EtcdLockSession {
            store: self.clone(),
            lease: None,
            held: HashSet::new(),
        }))
    }
}

struct SessionLease {
    id: i64,
    keep_alive: JoinHandle<()>,
}

/// Locks attached to one lease, kept alive for the session's lifetime.
///
/// If the process dies the lease expires and every lock key goes with it.
pub struct EtcdLockSession {
    store: EtcdEnvelopeStore,
    lease: Option<SessionLease>,
    held: HashSet<LockId>,
}

impl EtcdLockSession {
    async fn lease_id(&mut self) -> Result<i64, DurableError> {
        if let Some(lease) = &self.lease {
            return Ok(lease.id);
        }
        let ttl = self.store.lease_ttl;
        let id = self.store.grant_lease(ttl).await?;
        let keep_alive = tokio::spawn(keep_lease_alive(Arc::clone(&self.store.client), id, ttl));
        self.lease = Some(SessionLease { id, keep_alive });
        Ok(id)
    }
}

async fn keep_lease_alive(client: Arc<Mutex<Client>>, lease_id: i64, ttl: i64) {
    let interval = Duration::from_secs(u64::try_from(ttl / 3).unwrap_or(1).max(1));
    loop {
        let result = {
            let mut c = client.lock().await;
            c.lease_keep_alive(lease_id).await
        };
        match result {
            Ok((mut keeper, mut stream)) => loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = keeper.keep_alive().await {
                    tracing::warn!(lease_id, error = %e, "etcd lease keep-alive failed, reconnecting");
                    break;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {}
                    Ok(Some(_)) => {
                        tracing::error!(lease_id, "etcd lock lease expired, locks are lost");
                        return;
                    }
                    Ok(None) => {
                        tracing::warn!(lease_id, "etcd keep-alive stream ended");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(lease_id, error = %e, "etcd keep-alive stream error");
                        break;
                    }
                }
            },
            Err(e) => {
                tracing::warn!(lease_id, error = %e, "etcd keep-alive initialization failed, retrying in 1s");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[async_trait]
impl LockSession for EtcdLockSession {
    async fn get_lock(&mut self, lock: LockId) -> Result<(), DurableError> {
        if self.held.contains(&lock) {
            return Err(DurableError::LockAlreadyHeld { lock });
        }
        while !self.try_get_lock(lock).await? {
            tokio::time::sleep(LOCK_RETRY).await;
        }
        Ok(())
    }

    async fn try_get_lock(&mut self, lock: LockId) -> Result<bool, DurableError> {
        if self.held.contains(&lock) {
            return Ok(false);
        }
        let lease_id = self.lease_id().await?;
        let key = self.store.keys.lock(lock);
        let txn = Txn::new()
            .when([Compare::create_revision(key.as_str(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                key.as_str(),
                lease_id.to_string(),
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        let acquired = self.store.txn(txn).await?.succeeded();
        if acquired {
            self.held.insert(lock);
        }
        Ok(acquired)
    }

    async fn release_lock(&mut self, lock: LockId) -> Result<(), DurableError> {
        if !self.held.remove(&lock) {
            return Ok(());
        }
        let mut client = self.store.client.lock().await;
        client
            .delete(self.store.keys.lock(lock), None)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), DurableError> {
        self.held.clear();
        if let Some(lease) = self.lease.take() {
            lease.keep_alive.abort();
            let mut client = self.store.client.lock().await;
            client.lease_revoke(lease.id).await.map_err(map_err)?;
        }
        Ok(())
    }
}

impl Drop for EtcdLockSession {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        lease.keep_alive.abort();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        runtime.spawn(async move { store.revoke_lease(lease.id).await });
    }
}

/// Buffers writes and applies them as one `Txn` on commit.
///
/// Reads made through the transaction add a `mod_revision` compare, so the
/// commit fails if any envelope it read was changed in the meantime.
pub struct EtcdEnvelopeTransaction {
    store: EtcdEnvelopeStore,
    compares: Vec<Compare>,
    inserted: Vec<(String, Uuid)>,
    /// Final value per key; `None` deletes.
    writes: BTreeMap<String, Option<Vec<u8>>>,
    /// Incoming envelopes as this transaction sees them.
    pending: HashMap<Uuid, Option<Envelope>>,
}

impl EtcdEnvelopeTransaction {
    async fn current(&mut self, id: Uuid) -> Result<Option<Envelope>, DurableError> {
        if let Some(envelope) = self.pending.get(&id) {
            return Ok(envelope.clone());
        }
        let key = self.store.keys.incoming(id);
        let entry = self.store.load::<Envelope>(&key).await?;
        let envelope = match entry {
            Some(entry) => {
                self.compares.push(Compare::mod_revision(
                    key.as_str(),
                    CompareOp::Equal,
                    entry.mod_revision,
                ));
                Some(entry.value)
            }
            None => {
                self.compares
                    .push(Compare::create_revision(key.as_str(), CompareOp::Equal, 0));
                None
            }
        };
        self.pending.insert(id, envelope.clone());
        Ok(envelope)
    }

    fn write_incoming(&mut self, envelope: Envelope) -> Result<(), DurableError> {
        self.writes
            .insert(self.store.keys.incoming(envelope.id), Some(encode(&envelope)?));
        self.pending.insert(envelope.id, Some(envelope));
        Ok(())
    }
}

#[async_trait]
impl EnvelopeTransaction for EtcdEnvelopeTransaction {
    async fn persist_incoming(&mut self, envelope: &Envelope) -> Result<(), DurableError> {
        envelope.validate_for_incoming()?;
        let key = self.store.keys.incoming(envelope.id);
        if self.pending.get(&envelope.id).is_some_and(Option::is_some) {
            return Err(DurableError::DuplicateEnvelope { id: envelope.id });
        }
        self.compares
            .push(Compare::create_revision(key.as_str(), CompareOp::Equal, 0));
        self.inserted.push((key, envelope.id));
        if let Some(at) = envelope.scheduled_time {
            self.writes.insert(
                self.store.keys.scheduled(at, envelope.id),
                Some(envelope.id.to_string().into_bytes()),
            );
        }
        self.write_incoming(envelope.clone())
    }

    async fn persist_outgoing(
        &mut self,
        envelope: &Envelope,
        owner: NodeId,
    ) -> Result<(), DurableError> {
        let key = self.store.keys.outgoing(envelope.id);
        let mut envelope = envelope.clone();
        envelope.owner_id = owner;
        self.compares
            .push(Compare::create_revision(key.as_str(), CompareOp::Equal, 0));
        self.inserted.push((key.clone(), envelope.id));
        self.writes.insert(key, Some(encode(&envelope)?));
        Ok(())
    }

    async fn mark_handled(&mut self, envelope: &Envelope) -> Result<(), DurableError> {
        let keep_until = Utc::now() + self.store.settings.keep_after_handling();
        if let Some(mut current) = self.current(envelope.id).await? {
            if let Some(at) = current.scheduled_time {
                self.writes
                    .insert(self.store.keys.scheduled(at, current.id), None);
            }
            current.mark_handled(keep_until);
            self.write_incoming(current)?;
        }
        Ok(())
    }

    async fn increment_attempts(&mut self, envelope: &Envelope) -> Result<(), DurableError> {
        if let Some(mut current) = self.current(envelope.id).await? {
            current.attempts += 1;
            self.write_incoming(current)?;
        }
        Ok(())
    }

    async fn move_to_dead_letter(
        &mut self,
        envelope: &Envelope,
        error: &ErrorReport,
    ) -> Result<(), DurableError> {
        let failed_at = Utc::now();
        let mut entry = DeadLetterEntry::new(envelope, error, failed_at);
        entry.expires_at = self.store.settings.dead_letter_expires_at(failed_at);
        if let Some(at) = envelope.scheduled_time {
            self.writes
                .insert(self.store.keys.scheduled(at, envelope.id), None);
        }
        self.writes.insert(self.store.keys.incoming(envelope.id), None);
        self.writes.insert(
            self.store.keys.dead_letter(envelope.id),
            Some(encode(&entry)?),
        );
        self.pending.insert(envelope.id, None);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), DurableError> {
        let Self {
            store,
            compares,
            inserted,
            writes,
            ..
        } = *self;
        if writes.is_empty() {
            return Ok(());
        }
        check_txn_size(compares.len(), writes.len())?;
        let ops: Vec<TxnOp> = writes
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => TxnOp::put(key, value, None),
                None => TxnOp::delete(key, None),
            })
            .collect();
        if store.txn(Txn::new().when(compares).and_then(ops)).await?.succeeded() {
            return Ok(());
        }
        let mut client = store.client.lock().await;
        for (key, id) in inserted {
            let resp = client
                .get(key, Some(GetOptions::new().with_count_only()))
                .await
                .map_err(map_err)?;
            if resp.count() > 0 {
                return Err(DurableError::DuplicateEnvelope { id });
            }
        }
        Err(DurableError::persistence(
            "transaction conflict: an envelope changed before commit",
        ))
    }

    async fn rollback(self: Box<Self>) -> Result<(), DurableError> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn keys() -> Keys {
        Keys::new("/courier/", "main")
    }

    #[test]
    fn oversized_transactions_are_rejected() {
        assert!(check_txn_size(MAX_TXN_OPS, MAX_TXN_OPS).is_ok());
        let err = check_txn_size(MAX_TXN_OPS + 1, 2).unwrap_err();
        assert!(matches!(err, DurableError::PersistenceError { .. }));
        assert!(err.to_string().contains("too large"));
        assert!(check_txn_size(3, MAX_TXN_OPS + 1).is_err());
    }

    #[test]
    fn key_layout() {
        let keys = keys();
        let id = Uuid::nil();
        assert_eq!(
            keys.incoming(id),
            "/courier/main/incoming/00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            keys.outgoing(id),
            "/courier/main/outgoing/00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            keys.dead_letter(id),
            "/courier/main:dead-letter/00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(keys.node(NodeId::new(3)), "/courier/nodes/3");
        assert_eq!(keys.lock(LockId(42)), "/courier/locks/42");
    }

    #[test]
    fn scheduled_keys_sort_by_due_time() {
        let keys = keys();
        let early = Utc.timestamp_millis_opt(9_000).unwrap();
        let late = Utc.timestamp_millis_opt(10_000).unwrap();
        let a = keys.scheduled(late, Uuid::nil());
        let b = keys.scheduled(early, Uuid::from_u128(u128::MAX));
        assert_eq!(
            b,
            "/courier/main:scheduled/00000000000000009000/ffffffff-ffff-ffff-ffff-ffffffffffff"
        );
        assert!(b < a, "zero padding keeps lexical order equal to time order");
    }

    #[test]
    fn scheduled_range_includes_entries_due_now() {
        let keys = keys();
        let now = Utc.timestamp_millis_opt(10_000).unwrap();
        let end = keys.scheduled_until(now);
        assert!(keys.scheduled(now, Uuid::from_u128(u128::MAX)) < end);
        assert!(keys.scheduled(now + chrono::Duration::milliseconds(1), Uuid::nil()) >= end);
    }

    #[test]
    fn pre_epoch_scores_clamp_to_zero() {
        let before = Utc.timestamp_millis_opt(-5_000).unwrap();
        assert_eq!(score(before), 0);
    }

    #[test]
    fn dead_letter_entry_keeps_failure_fields() {
        let envelope = Envelope::new("OrderPlaced", b"{}".to_vec()).owned_by(NodeId::new(2));
        let error = ErrorReport::new("Timeout", "handler timed out").with_explanation("gave up");
        let failed_at = Utc::now();
        let entry = DeadLetterEntry::new(&envelope, &error, failed_at);
        assert_eq!(entry.envelope_id, envelope.id);
        assert_eq!(entry.message_type, "OrderPlaced");

        let value = rmp_serde::to_vec_named(&entry).unwrap();
        let map: HashMap<String, serde::de::IgnoredAny> = rmp_serde::from_slice(&value).unwrap();
        assert!(map.contains_key("exception-stack"));

        let record = entry.into_record();
        assert_eq!(record.error, error);
        assert!(!record.replayable);
        assert_eq!(record.failed_at, failed_at);
    }
}
