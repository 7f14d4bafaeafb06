//! Scheduled-job execution.
//!
//! `Scheduled --(scheduled_time <= now)--> Incoming(owner = any)`.
//!
//! Backends differ only in how due envelopes are selected, so that part sits
//! behind the [`ScheduledJobs`] capability. [`ScheduledJobRunner`] then claims
//! the released envelopes for this node and hands them to local listeners.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;
use uuid::Uuid;

use crate::endpoints::{claim_and_enqueue, Endpoints};
use crate::envelope::Envelope;
use crate::envelope_store::MessageStore;
use crate::error::DurableError;
use crate::types::{EndpointUri, NodeIdentity};

#[async_trait]
pub trait ScheduledJobs: Send + Sync {
    /// Persist a new `Scheduled` envelope.
    async fn schedule(&self, envelope: &Envelope) -> Result<(), DurableError>;

    /// Move up to `limit` envelopes due at `now` into `Incoming`, owned by
    /// any node, and return them in due order.
    ///
    /// Idempotent: envelopes already moved no longer match. Returns an empty
    /// list when another node is dispatching the same store concurrently.
    async fn dispatch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Envelope>, DurableError>;
}

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Envelopes moved from scheduled to incoming.
    pub released: usize,
    /// Envelopes claimed by this node and handed to a local listener.
    pub enqueued: usize,
}

pub struct ScheduledJobRunner {
    node: NodeIdentity,
    store: Arc<dyn MessageStore>,
    endpoints: Arc<Endpoints>,
}

impl ScheduledJobRunner {
    pub fn new(node: NodeIdentity, store: Arc<dyn MessageStore>, endpoints: Arc<Endpoints>) -> Self {
        Self {
            node,
            store,
            endpoints,
        }
    }

    /// Release every envelope due at `now` and enqueue the ones this node listens for.
    ///
    /// Released envelopes without a local listener stay unowned for whichever
    /// node listens on their destination.
    #[instrument(skip(self), fields(store = %self.store.name()))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<DispatchSummary, DurableError> {
        let limit = self.store.settings().scheduled_job_batch_size;
        let due = self.store.dispatch_due(now, limit).await?;
        let mut summary = DispatchSummary {
            released: due.len(),
            enqueued: 0,
        };
        if due.is_empty() {
            return Ok(summary);
        }

        let mut by_destination: BTreeMap<Option<EndpointUri>, Vec<Uuid>> = BTreeMap::new();
        for envelope in &due {
            by_destination
                .entry(envelope.destination.clone())
                .or_default()
                .push(envelope.id);
        }

        for (destination, ids) in by_destination {
            let Some(listener) = destination
                .as_ref()
                .and_then(|uri| self.endpoints.active_listener(uri))
            else {
                continue;
            };
            match claim_and_enqueue(self.store.as_ref(), listener.as_ref(), &ids, self.node.id)
                .await
            {
                Ok(enqueued) => summary.enqueued += enqueued,
                Err(e) => tracing::warn!(
                    listener = %listener.uri(),
                    error = %e,
                    "failed to enqueue released scheduled envelopes"
                ),
            }
        }

        tracing::debug!(
            released = summary.released,
            enqueued = summary.enqueued,
            "dispatched scheduled envelopes"
        );
        Ok(summary)
    }
}
