//! Local listeners and outgoing senders that recovered envelopes are handed to.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::envelope_store::MessageStore;
use crate::error::DurableError;
use crate::types::{EndpointUri, NodeId};

/// A destination this node is actively listening on.
#[async_trait]
pub trait LocalListener: Send + Sync {
    fn uri(&self) -> &EndpointUri;

    /// False while the listener is paused or draining.
    fn is_accepting(&self) -> bool {
        true
    }

    /// How many more envelopes the listener can take right now.
    fn capacity(&self) -> usize;

    /// Queue envelopes (already claimed by this node) for local dispatch.
    async fn enqueue(&self, envelopes: Vec<Envelope>) -> Result<(), DurableError>;
}

/// A sending agent for one outgoing destination.
#[async_trait]
pub trait OutgoingSender: Send + Sync {
    fn destination(&self) -> &EndpointUri;

    /// True while the sender's circuit is open and it should not be fed.
    fn is_latched(&self) -> bool {
        false
    }

    async fn send(&self, envelopes: Vec<Envelope>) -> Result<(), DurableError>;
}

/// Registry of the listeners and senders active on this node.
#[derive(Default)]
pub struct Endpoints {
    listeners: DashMap<EndpointUri, Arc<dyn LocalListener>>,
    senders: DashMap<EndpointUri, Arc<dyn OutgoingSender>>,
}

impl Endpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn LocalListener>) {
        self.listeners.insert(listener.uri().clone(), listener);
    }

    pub fn remove_listener(&self, uri: &EndpointUri) {
        self.listeners.remove(uri);
    }

    pub fn add_sender(&self, sender: Arc<dyn OutgoingSender>) {
        self.senders.insert(sender.destination().clone(), sender);
    }

    pub fn remove_sender(&self, uri: &EndpointUri) {
        self.senders.remove(uri);
    }

    /// The listener for `uri` if it exists and is accepting.
    pub fn active_listener(&self, uri: &EndpointUri) -> Option<Arc<dyn LocalListener>> {
        self.listeners
            .get(uri)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|listener| listener.is_accepting())
    }

    /// The sender for `uri` if it exists and is not latched.
    pub fn active_sender(&self, uri: &EndpointUri) -> Option<Arc<dyn OutgoingSender>> {
        self.senders
            .get(uri)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|sender| !sender.is_latched())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

/// Claim `ids` for `node` and hand the winners to `listener`.
///
/// If the listener refuses them, ownership is released again so another
/// node (or the next recovery tick) can pick them up.
pub(crate) async fn claim_and_enqueue(
    store: &dyn MessageStore,
    listener: &dyn LocalListener,
    ids: &[Uuid],
    node: NodeId,
) -> Result<usize, DurableError> {
    if ids.is_empty() {
        return Ok(0);
    }
    let claimed = store.claim_incoming(ids, node).await?;
    if claimed.is_empty() {
        return Ok(0);
    }
    let claimed_ids: Vec<Uuid> = claimed.iter().map(|e| e.id).collect();
    let count = claimed.len();
    if let Err(e) = listener.enqueue(claimed).await {
        tracing::warn!(
            listener = %listener.uri(),
            count,
            error = %e,
            "listener refused claimed envelopes, releasing ownership"
        );
        store.release_incoming(&claimed_ids, node).await?;
        return Err(e);
    }
    Ok(count)
}
