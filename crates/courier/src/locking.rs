//! Advisory locks used to serialize competing nodes around non-idempotent work.
//!
//! Locks are not persisted. A [`LockSession`] owns one connection to the
//! backing store and every lock it takes lives as long as that connection.
//! Lock contention is not an error: `try_get_lock` returns `false` and the
//! caller skips its cycle.

use std::fmt;

use async_trait::async_trait;

use crate::error::DurableError;
use crate::hash::advisory_key;
use crate::types::NodeId;

/// Key of an advisory lock, derived from a logical resource name.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct LockId(pub i64);

impl LockId {
    pub fn from_name(name: &str) -> Self {
        Self(advisory_key(name))
    }

    /// Serializes scheduled-job dispatch across nodes sharing a schema.
    pub fn scheduled_jobs(schema: &str) -> Self {
        Self::from_name(&format!("scheduled-jobs:{schema}"))
    }

    /// Held by a live node for its whole lifetime; taken by the leader to
    /// prove the node is gone before reassigning its envelopes.
    pub fn node(schema: &str, node: NodeId) -> Self {
        Self::from_name(&format!("node:{schema}:{node}"))
    }

    pub fn leader(schema: &str) -> Self {
        Self::from_name(&format!("leader:{schema}"))
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connection-scoped holder of advisory locks.
///
/// Locks are not reentrant. Asking again for a lock the session already
/// holds is `false` from `try_get_lock` and `LockAlreadyHeld` from
/// `get_lock`, on every backend. Closing (or dropping) the session releases
/// everything it holds.
#[async_trait]
pub trait LockSession: Send {
    /// Wait until the lock is acquired. Fails at once if this session
    /// already holds it.
    async fn get_lock(&mut self, lock: LockId) -> Result<(), DurableError>;

    /// Acquire the lock if it is free. Never blocks on another holder.
    async fn try_get_lock(&mut self, lock: LockId) -> Result<bool, DurableError>;

    async fn release_lock(&mut self, lock: LockId) -> Result<(), DurableError>;

    /// Release every lock and return the connection.
    async fn close(self: Box<Self>) -> Result<(), DurableError>;
}

#[async_trait]
pub trait AdvisoryLocks: Send + Sync {
    async fn lock_session(&self) -> Result<Box<dyn LockSession>, DurableError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_ids_are_deterministic_per_resource() {
        assert_eq!(
            LockId::scheduled_jobs("courier"),
            LockId::scheduled_jobs("courier")
        );
        assert_ne!(
            LockId::scheduled_jobs("courier"),
            LockId::scheduled_jobs("tenant_red")
        );
        assert_ne!(
            LockId::node("courier", NodeId::new(1)),
            LockId::node("courier", NodeId::new(2))
        );
        assert_ne!(LockId::leader("courier"), LockId::scheduled_jobs("courier"));
    }
}
