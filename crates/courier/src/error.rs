use uuid::Uuid;

use crate::locking::LockId;
use crate::types::{AgentUri, TenantId};

/// Errors raised by envelope stores and the durability agents.
#[derive(Debug, thiserror::Error)]
pub enum DurableError {
    /// The envelope id already exists. Idempotent producers treat this as success.
    #[error("duplicate envelope {id}")]
    DuplicateEnvelope { id: Uuid },

    #[error("invariant violation: {reason}")]
    InvariantViolation { reason: String },

    #[error("persistence error: {reason}")]
    PersistenceError {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("unknown agent {uri}")]
    UnknownAgent { uri: AgentUri },

    #[error("unknown tenant {tenant}")]
    UnknownTenant { tenant: TenantId },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// `get_lock` on a lock the same session already holds.
    #[error("lock {lock} is already held by this session")]
    LockAlreadyHeld { lock: LockId },

    #[error("durability agent is shutting down")]
    ShuttingDown,
}

impl DurableError {
    /// Shorthand for a `PersistenceError` without an underlying cause.
    pub fn persistence(reason: impl Into<String>) -> Self {
        DurableError::PersistenceError {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, DurableError::DuplicateEnvelope { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let id = Uuid::nil();
        let err = DurableError::DuplicateEnvelope { id };
        assert_eq!(
            err.to_string(),
            "duplicate envelope 00000000-0000-0000-0000-000000000000"
        );

        let err = DurableError::InvariantViolation {
            reason: "incoming envelope must be owned".into(),
        };
        assert_eq!(
            err.to_string(),
            "invariant violation: incoming envelope must be owned"
        );

        let err = DurableError::UnknownTenant {
            tenant: TenantId::new("red"),
        };
        assert_eq!(err.to_string(), "unknown tenant red");

        let err = DurableError::LockAlreadyHeld { lock: LockId(7) };
        assert_eq!(err.to_string(), "lock 7 is already held by this session");
    }

    #[test]
    fn duplicate_is_distinguished() {
        assert!(DurableError::DuplicateEnvelope { id: Uuid::new_v4() }.is_duplicate());
        assert!(!DurableError::persistence("boom").is_duplicate());
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DurableError>();
    }
}
