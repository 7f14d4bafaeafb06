//! Envelope-aware transactions for the dispatch pipeline.
//!
//! A handler that produces domain side effects in the same database as the
//! envelope store opens a transaction with [`EnvelopeStore::begin`], performs
//! its own writes through the concrete transaction type, and records the
//! envelope state changes through this trait. Everything becomes visible on
//! `commit()`; dropping the transaction rolls it back.
//!
//! [`EnvelopeStore::begin`]: crate::envelope_store::EnvelopeStore::begin

use std::any::Any;

use async_trait::async_trait;

use crate::envelope::{Envelope, ErrorReport};
use crate::error::DurableError;
use crate::types::NodeId;

#[async_trait]
pub trait EnvelopeTransaction: Send {
    /// Persist an incoming envelope within the transaction.
    async fn persist_incoming(&mut self, envelope: &Envelope) -> Result<(), DurableError>;

    /// Persist an outgoing envelope (an outbox entry) within the transaction.
    async fn persist_outgoing(
        &mut self,
        envelope: &Envelope,
        owner: NodeId,
    ) -> Result<(), DurableError>;

    async fn mark_handled(&mut self, envelope: &Envelope) -> Result<(), DurableError>;

    async fn increment_attempts(&mut self, envelope: &Envelope) -> Result<(), DurableError>;

    async fn move_to_dead_letter(
        &mut self,
        envelope: &Envelope,
        error: &ErrorReport,
    ) -> Result<(), DurableError>;

    async fn commit(self: Box<Self>) -> Result<(), DurableError>;

    async fn rollback(self: Box<Self>) -> Result<(), DurableError>;

    /// Returns self as `Any` for downcasting to the backend transaction.
    ///
    /// ```text
    /// if let Some(pg) = tx.as_any_mut().downcast_mut::<PgEnvelopeTransaction>() {
    ///     sqlx::query("INSERT INTO orders ...").execute(pg.executor()?).await?;
    /// }
    /// ```
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
