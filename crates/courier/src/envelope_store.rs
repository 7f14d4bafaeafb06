use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DurabilitySettings;
use crate::dead_letters::DeadLetterStore;
use crate::envelope::{Envelope, ErrorReport};
use crate::error::DurableError;
use crate::locking::AdvisoryLocks;
use crate::nodes::NodeRegistry;
use crate::recovery::RecoveryStore;
use crate::scheduler::ScheduledJobs;
use crate::transaction::EnvelopeTransaction;
use crate::types::{EndpointUri, NodeId};

/// Number of persisted envelopes per collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCounts {
    pub incoming: i64,
    pub scheduled: i64,
    pub handled: i64,
    pub outgoing: i64,
    pub dead_letters: i64,
}

/// Durable storage of incoming, outgoing and dead-lettered envelopes.
///
/// Every method is a single round trip against the backing store (or a
/// single backing-store transaction). Errors are returned unmodified so the
/// dispatch pipeline's own retry policy applies.
#[async_trait]
pub trait EnvelopeStore: Send + Sync {
    /// Logical store name, used in agent URIs, metrics and logs.
    fn name(&self) -> &str;

    fn settings(&self) -> &DurabilitySettings;

    /// Create the backing schema if it does not exist.
    async fn ensure_schema(&self) -> Result<(), DurableError>;

    /// Drop and recreate the backing schema. Destroys all data.
    async fn rebuild_schema(&self) -> Result<(), DurableError>;

    /// Persist one incoming or scheduled envelope.
    ///
    /// Returns `InvariantViolation` for an unowned `Incoming` envelope and
    /// `DuplicateEnvelope` if the id already exists.
    async fn store_incoming(&self, envelope: &Envelope) -> Result<(), DurableError>;

    /// Persist several envelopes in one round trip. All or nothing.
    async fn store_incoming_batch(&self, envelopes: &[Envelope]) -> Result<(), DurableError>;

    /// Persist an outgoing envelope owned by the sending node.
    async fn store_outgoing(&self, envelope: &Envelope, owner: NodeId) -> Result<(), DurableError>;

    /// Mark incoming envelopes `Handled`, keeping them for
    /// `keep_after_message_handling`.
    async fn mark_handled(&self, envelopes: &[Envelope]) -> Result<(), DurableError>;

    async fn increment_attempts(&self, envelope: &Envelope) -> Result<(), DurableError>;

    /// Remove the envelope from incoming and record it as a dead letter.
    async fn move_to_dead_letter(
        &self,
        envelope: &Envelope,
        error: &ErrorReport,
    ) -> Result<(), DurableError>;

    /// Put an existing incoming envelope back into the scheduled state, due at `at`.
    async fn reschedule_incoming(
        &self,
        envelope: &Envelope,
        at: DateTime<Utc>,
    ) -> Result<(), DurableError>;

    /// Unclaimed, unexpired incoming envelopes at `destination`, up to `limit`.
    ///
    /// Always follow with [`EnvelopeStore::claim_incoming`] before dispatch.
    async fn load_ready_incoming(
        &self,
        destination: &EndpointUri,
        limit: usize,
    ) -> Result<Vec<Envelope>, DurableError>;

    /// Atomically take ownership of the given unclaimed envelopes.
    ///
    /// Only envelopes still owned by [`NodeId::ANY`] are updated; the returned
    /// envelopes are exactly the ones this caller won.
    async fn claim_incoming(&self, ids: &[Uuid], node: NodeId)
        -> Result<Vec<Envelope>, DurableError>;

    /// Give claimed incoming envelopes back to any node.
    async fn release_incoming(&self, ids: &[Uuid], node: NodeId) -> Result<(), DurableError>;

    /// All outgoing envelopes for `destination`, regardless of owner.
    async fn load_outgoing(&self, destination: &EndpointUri)
        -> Result<Vec<Envelope>, DurableError>;

    /// Atomically take ownership of unclaimed outgoing envelopes.
    async fn claim_outgoing(&self, ids: &[Uuid], node: NodeId)
        -> Result<Vec<Envelope>, DurableError>;

    async fn delete_outgoing(&self, envelopes: &[Envelope]) -> Result<(), DurableError>;

    /// Delete `discards` and move `reassigned` to `node`, in one round trip.
    async fn discard_and_reassign_outgoing(
        &self,
        discards: &[Envelope],
        reassigned: &[Envelope],
        node: NodeId,
    ) -> Result<(), DurableError>;

    async fn fetch_counts(&self) -> Result<PersistedCounts, DurableError>;

    async fn all_incoming(&self) -> Result<Vec<Envelope>, DurableError>;

    async fn all_outgoing(&self) -> Result<Vec<Envelope>, DurableError>;

    /// Delete every incoming, outgoing and dead-letter envelope.
    async fn clear_all(&self) -> Result<(), DurableError>;

    /// Set `owner_id = 0` on everything `node` owns, optionally only at one destination.
    async fn release_ownership(
        &self,
        node: NodeId,
        destination: Option<&EndpointUri>,
    ) -> Result<(), DurableError>;

    /// Open a transaction the dispatch pipeline can enlist its own work in.
    async fn begin(&self) -> Result<Box<dyn EnvelopeTransaction>, DurableError>;
}

/// A complete backing store: envelopes plus every capability the agents need.
pub trait MessageStore:
    EnvelopeStore + ScheduledJobs + RecoveryStore + DeadLetterStore + NodeRegistry + AdvisoryLocks
{
}

impl<T> MessageStore for T where
    T: EnvelopeStore
        + ScheduledJobs
        + RecoveryStore
        + DeadLetterStore
        + NodeRegistry
        + AdvisoryLocks
        + ?Sized
{
}
