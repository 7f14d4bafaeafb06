//! Durable envelope storage and recovery for a messaging runtime.
//!
//! Incoming, scheduled, outgoing and dead-lettered envelopes are persisted in
//! an [`envelope_store::EnvelopeStore`] (Postgres, etcd or memory). Background
//! [`recovery::DurabilityAgent`]s release due scheduled jobs, recover
//! envelopes orphaned by crashed nodes and sweep expired rows; the
//! [`agents::AgentController`] places each agent on exactly one live node.

pub mod agents;
pub mod config;
pub mod dead_letters;
pub mod endpoints;
pub mod envelope;
pub mod envelope_store;
pub mod error;
pub mod hash;
pub mod locking;
pub mod metrics;
pub mod nodes;
pub mod recovery;
pub mod scheduler;
pub mod storage;
pub mod tenancy;
pub mod testing;
pub mod transaction;
pub mod types;

/// Prelude module for convenient glob imports.
pub mod prelude {
    pub use crate::config::{DurabilityMode, DurabilitySettings};
    pub use crate::dead_letters::{
        DeadLetterFilter, DeadLetterGrouping, DeadLetterManager, DeadLetterQuery,
        DeadLetterSelector,
    };
    pub use crate::endpoints::{Endpoints, LocalListener, OutgoingSender};
    pub use crate::envelope::{DeadLetterRecord, Envelope, EnvelopeStatus, ErrorReport};
    pub use crate::envelope_store::{EnvelopeStore, MessageStore};
    pub use crate::error::DurableError;
    pub use crate::types::{AgentUri, EndpointUri, NodeId, NodeIdentity, TenantId};
}
