//! In-memory test fixtures.
//!
//! Provides recording listeners and senders plus a [`TestNode`] wiring a
//! node identity, a shared [`MemoryEnvelopeStore`] and the recovery
//! operations, so several simulated nodes can run against one store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::DurabilitySettings;
use crate::endpoints::{Endpoints, LocalListener, OutgoingSender};
use crate::envelope::Envelope;
use crate::envelope_store::MessageStore;
use crate::error::DurableError;
use crate::nodes::NodeLifecycle;
use crate::recovery::StoreRecovery;
use crate::storage::memory::MemoryEnvelopeStore;
use crate::types::{EndpointUri, NodeId, NodeIdentity};

/// Settings with short timers, for tests that run agents in real time.
pub fn fast_settings() -> DurabilitySettings {
    DurabilitySettings {
        scheduled_job_first_execution: Duration::ZERO,
        scheduled_job_polling_time: Duration::from_millis(50),
        first_execution_jitter: Duration::ZERO,
        recovery_first_execution: Duration::ZERO,
        recovery_polling_time: Duration::from_millis(50),
        expiration_polling_time: Duration::from_millis(50),
        node_reassignment_polling_time: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(50),
        stale_node_timeout: Duration::from_millis(500),
        ..DurabilitySettings::default()
    }
}

/// A listener that records everything it is given.
pub struct RecordingListener {
    uri: EndpointUri,
    capacity: usize,
    accepting: Mutex<bool>,
    refuse: Mutex<bool>,
    received: Mutex<Vec<Envelope>>,
}

impl RecordingListener {
    pub fn new(uri: impl Into<String>) -> Arc<Self> {
        Self::with_capacity(uri, usize::MAX)
    }

    pub fn with_capacity(uri: impl Into<String>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            uri: EndpointUri::new(uri),
            capacity,
            accepting: Mutex::new(true),
            refuse: Mutex::new(false),
            received: Mutex::new(Vec::new()),
        })
    }

    /// Pause (or resume) the listener; paused listeners receive nothing.
    pub fn set_accepting(&self, accepting: bool) {
        *self.accepting.lock() = accepting;
    }

    /// Make `enqueue` fail, as a listener whose buffer is closed would.
    pub fn set_refusing(&self, refuse: bool) {
        *self.refuse.lock() = refuse;
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl LocalListener for RecordingListener {
    fn uri(&self) -> &EndpointUri {
        &self.uri
    }

    fn is_accepting(&self) -> bool {
        *self.accepting.lock()
    }

    fn capacity(&self) -> usize {
        self.capacity.saturating_sub(self.received.lock().len())
    }

    async fn enqueue(&self, envelopes: Vec<Envelope>) -> Result<(), DurableError> {
        if *self.refuse.lock() {
            return Err(DurableError::ShuttingDown);
        }
        self.received.lock().extend(envelopes);
        Ok(())
    }
}

/// A sender that records everything it is asked to send.
pub struct RecordingSender {
    destination: EndpointUri,
    latched: Mutex<bool>,
    sent: Mutex<Vec<Envelope>>,
}

impl RecordingSender {
    pub fn new(destination: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            destination: EndpointUri::new(destination),
            latched: Mutex::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_latched(&self, latched: bool) {
        *self.latched.lock() = latched;
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl OutgoingSender for RecordingSender {
    fn destination(&self) -> &EndpointUri {
        &self.destination
    }

    fn is_latched(&self) -> bool {
        *self.latched.lock()
    }

    async fn send(&self, envelopes: Vec<Envelope>) -> Result<(), DurableError> {
        self.sent.lock().extend(envelopes);
        Ok(())
    }
}

/// One simulated node attached to a shared store.
pub struct TestNode {
    pub identity: NodeIdentity,
    pub store: Arc<dyn MessageStore>,
    pub endpoints: Arc<Endpoints>,
    pub recovery: StoreRecovery,
    pub lifecycle: NodeLifecycle,
}

impl TestNode {
    pub fn new(id: i32, store: &MemoryEnvelopeStore) -> Self {
        let identity = NodeIdentity::new(NodeId::new(id), format!("tcp://node-{id}"));
        let store: Arc<dyn MessageStore> = Arc::new(store.clone());
        let endpoints = Arc::new(Endpoints::new());
        let recovery = StoreRecovery::new(
            identity.clone(),
            Arc::clone(&store),
            Arc::clone(&endpoints),
            None,
        );
        let lifecycle = NodeLifecycle::new(identity.clone(), Arc::clone(&store));
        Self {
            identity,
            store,
            endpoints,
            recovery,
            lifecycle,
        }
    }

    pub fn id(&self) -> NodeId {
        self.identity.id
    }

    /// Register a recording listener on this node.
    pub fn listen(&self, uri: &str) -> Arc<RecordingListener> {
        let listener = RecordingListener::new(uri);
        self.endpoints.add_listener(listener.clone());
        listener
    }

    /// Register a recording sender on this node.
    pub fn sender(&self, destination: &str) -> Arc<RecordingSender> {
        let sender = RecordingSender::new(destination);
        self.endpoints.add_sender(sender.clone());
        sender
    }

    /// An incoming envelope received by this node at `destination`.
    pub fn received(&self, destination: &str) -> Envelope {
        Envelope::new("TestMessage", b"{}".to_vec())
            .with_destination(EndpointUri::new(destination))
            .owned_by(self.id())
    }
}
