//! Postgres-backed envelope store using sqlx.
//!
//! Tables (see [`super::postgres_schema`]):
//! - `incoming_envelopes`: incoming, scheduled and handled envelopes
//! - `outgoing_envelopes`: the outbox
//! - `dead_letters`: envelopes that exhausted their retry policy
//! - `nodes`: liveness records
//! - `tenants`: tenant-to-database lookup
//!
//! Claims are conditional updates on `owner_id = 0`, so concurrent claimers
//! never both win a row. Scheduled dispatch and dormant-node reassignment run
//! under transaction-scoped advisory locks; node liveness is proven by the
//! session-scoped lock each node holds in its [`PgLockSession`].
//!
//! This module is only available when the `sql` feature is enabled.

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{PgExecutor, Postgres, QueryBuilder, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use super::postgres_schema::{Tables, DEAD_LETTER_COLUMNS, ENVELOPE_COLUMNS};
use crate::config::DurabilitySettings;
use crate::dead_letters::{
    sort_counts, DeadLetterCount, DeadLetterFilter, DeadLetterGrouping, DeadLetterPage,
    DeadLetterQuery, DeadLetterSelector, DeadLetterStore,
};
use crate::envelope::{
    DeadLetterRecord, Envelope, EnvelopeStatus, ErrorReport, UNROUTED_DESTINATION,
};
use crate::envelope_store::{EnvelopeStore, MessageStore, PersistedCounts};
use crate::error::DurableError;
use crate::locking::{AdvisoryLocks, LockId, LockSession};
use crate::nodes::{NodeRecord, NodeRegistry};
use crate::recovery::{ExpiredSweep, ReassignOutcome, RecoverableIncoming, RecoveryStore};
use crate::scheduler::ScheduledJobs;
use crate::tenancy::{StoreFactory, TenantAssignment, TenantSource};
use crate::transaction::EnvelopeTransaction;
use crate::types::{EndpointUri, NodeId, NodeIdentity, TenantId};

/// Postgres allows at most 65535 bind parameters per statement.
const INSERT_CHUNK: usize = 1000;

fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> DurableError {
    move |e| DurableError::PersistenceError {
        reason: format!("{context}: {e}"),
        source: Some(Box::new(e)),
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}

/// PostgreSQL-backed envelope store.
pub struct PgEnvelopeStore {
    name: String,
    pool: PgPool,
    settings: DurabilitySettings,
    tables: Tables,
}

impl PgEnvelopeStore {
    /// Create a store over `pool`, using `settings.schema_name` for its tables.
    pub fn new(
        name: impl Into<String>,
        pool: PgPool,
        settings: DurabilitySettings,
    ) -> Result<Self, DurableError> {
        settings.validate()?;
        let tables = Tables::new(&settings.schema_name)?;
        Ok(Self {
            name: name.into(),
            pool,
            settings,
            tables,
        })
    }

    /// Connect lazily to `url`; no connection is made until first use.
    pub fn connect_lazy(
        name: impl Into<String>,
        url: &str,
        settings: DurabilitySettings,
    ) -> Result<Self, DurableError> {
        let pool = PgPoolOptions::new()
            .connect_lazy(url)
            .map_err(db_err("invalid database url"))?;
        Self::new(name, pool, settings)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Tenant lookup table in this store's schema.
    pub fn tenant_source(&self) -> PgTenantSource {
        PgTenantSource {
            pool: self.pool.clone(),
            table: self.tables.tenants.clone(),
        }
    }

    async fn begin_tx(&self) -> Result<Transaction<'static, Postgres>, DurableError> {
        self.pool
            .begin()
            .await
            .map_err(db_err("begin transaction failed"))
    }

    async fn select_envelopes(
        &self,
        sql: &str,
        context: &'static str,
    ) -> Result<Vec<Envelope>, DurableError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err(context))?;
        rows.iter().map(row_to_envelope).collect()
    }
}

fn bind_envelope<'args>(
    row: &mut Separated<'_, 'args, Postgres, &'static str>,
    envelope: &'args Envelope,
    owner: NodeId,
) {
    row.push_bind(envelope.id)
        .push_bind(envelope.status.as_str())
        .push_bind(owner.value())
        .push_bind(envelope.scheduled_time)
        .push_bind(envelope.attempts)
        .push_bind(&envelope.body)
        .push_bind(&envelope.message_type)
        .push_bind(&envelope.content_type)
        .push_bind(envelope.destination.as_ref().map(EndpointUri::as_str))
        .push_bind(envelope.deliver_by)
        .push_bind(envelope.keep_until)
        .push_bind(envelope.correlation_id.as_deref())
        .push_bind(envelope.conversation_id)
        .push_bind(envelope.parent_id.as_deref())
        .push_bind(envelope.saga_id.as_deref())
        .push_bind(envelope.reply_uri.as_ref().map(EndpointUri::as_str))
        .push_bind(envelope.reply_requested.as_deref())
        .push_bind(envelope.ack_requested)
        .push_bind(envelope.received_at.as_ref().map(EndpointUri::as_str))
        .push_bind(envelope.sent_at)
        .push_bind(envelope.tenant_id.as_ref().map(TenantId::as_str))
        .push_bind(envelope.source.as_deref());
}

fn try_get_column<'r, T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>>(
    row: &'r PgRow,
    column: &str,
) -> Result<T, DurableError> {
    row.try_get(column)
        .map_err(|e| DurableError::PersistenceError {
            reason: format!("failed to read '{column}' column: {e}"),
            source: Some(Box::new(e)),
        })
}

fn row_to_envelope(row: &PgRow) -> Result<Envelope, DurableError> {
    let status: String = try_get_column(row, "status")?;
    let owner_id: i32 = try_get_column(row, "owner_id")?;
    let destination: Option<String> = try_get_column(row, "destination")?;
    let reply_uri: Option<String> = try_get_column(row, "reply_uri")?;
    let received_at: Option<String> = try_get_column(row, "received_at")?;
    let tenant_id: Option<String> = try_get_column(row, "tenant_id")?;
    Ok(Envelope {
        id: try_get_column(row, "id")?,
        body: try_get_column(row, "body")?,
        content_type: try_get_column(row, "content_type")?,
        message_type: try_get_column(row, "message_type")?,
        status: EnvelopeStatus::parse(&status)?,
        owner_id: NodeId::new(owner_id),
        attempts: try_get_column(row, "attempts")?,
        scheduled_time: try_get_column(row, "execution_time")?,
        deliver_by: try_get_column(row, "deliver_by")?,
        keep_until: try_get_column(row, "keep_until")?,
        destination: destination.map(EndpointUri::new),
        received_at: received_at.map(EndpointUri::new),
        correlation_id: try_get_column(row, "correlation_id")?,
        conversation_id: try_get_column(row, "conversation_id")?,
        parent_id: try_get_column(row, "parent_id")?,
        saga_id: try_get_column(row, "saga_id")?,
        reply_uri: reply_uri.map(EndpointUri::new),
        reply_requested: try_get_column(row, "reply_requested")?,
        ack_requested: try_get_column(row, "ack_requested")?,
        sent_at: try_get_column(row, "sent_at")?,
        tenant_id: tenant_id.map(TenantId),
        source: try_get_column(row, "source")?,
    })
}

fn row_to_dead_letter(row: &PgRow) -> Result<DeadLetterRecord, DurableError> {
    Ok(DeadLetterRecord {
        envelope: row_to_envelope(row)?,
        error: ErrorReport {
            exception_type: try_get_column(row, "exception_type")?,
            exception_message: try_get_column(row, "exception_message")?,
            exception_detail: try_get_column(row, "exception_detail")?,
            explanation: try_get_column(row, "explanation")?,
        },
        replayable: try_get_column(row, "replayable")?,
        failed_at: try_get_column(row, "failed_at")?,
        expires_at: try_get_column(row, "expires_at")?,
    })
}

/// `INSERT ... ON CONFLICT DO NOTHING` for one envelope; `false` on a duplicate id.
async fn insert_envelope<'e>(
    exec: impl PgExecutor<'e>,
    table: &str,
    envelope: &Envelope,
    owner: NodeId,
) -> Result<bool, DurableError> {
    let mut builder: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("INSERT INTO {table} ({ENVELOPE_COLUMNS}) "));
    builder.push_values(std::iter::once(envelope), |mut row, envelope| {
        bind_envelope(&mut row, envelope, owner)
    });
    builder.push(" ON CONFLICT (id) DO NOTHING");
    let result = builder
        .build()
        .execute(exec)
        .await
        .map_err(db_err("insert envelope failed"))?;
    Ok(result.rows_affected() == 1)
}

async fn mark_handled_in<'e>(
    exec: impl PgExecutor<'e>,
    tables: &Tables,
    ids: &[Uuid],
    keep_until: DateTime<Utc>,
) -> Result<(), DurableError> {
    sqlx::query(&format!(
        "UPDATE {} SET status = 'Handled', execution_time = NULL, keep_until = $2 \
         WHERE id = ANY($1)",
        tables.incoming
    ))
    .bind(ids)
    .bind(keep_until)
    .execute(exec)
    .await
    .map_err(db_err("mark handled failed"))?;
    Ok(())
}

async fn increment_attempts_in<'e>(
    exec: impl PgExecutor<'e>,
    tables: &Tables,
    id: Uuid,
) -> Result<(), DurableError> {
    sqlx::query(&format!(
        "UPDATE {} SET attempts = attempts + 1 WHERE id = $1",
        tables.incoming
    ))
    .bind(id)
    .execute(exec)
    .await
    .map_err(db_err("increment attempts failed"))?;
    Ok(())
}

/// Delete from incoming and upsert the dead letter in one statement.
async fn move_to_dead_letter_in<'e>(
    exec: impl PgExecutor<'e>,
    tables: &Tables,
    settings: &DurabilitySettings,
    envelope: &Envelope,
    error: &ErrorReport,
) -> Result<(), DurableError> {
    let failed_at = Utc::now();
    let expires_at = settings.dead_letter_expires_at(failed_at);
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("WITH removed AS (DELETE FROM ");
    builder
        .push(&tables.incoming)
        .push(" WHERE id = ")
        .push_bind(envelope.id)
        .push(format!(
            ") INSERT INTO {} ({ENVELOPE_COLUMNS}, {DEAD_LETTER_COLUMNS}) ",
            tables.dead_letters
        ));
    builder.push_values(std::iter::once(envelope), |mut row, envelope| {
        bind_envelope(&mut row, envelope, envelope.owner_id);
        row.push_bind(&error.exception_type)
            .push_bind(&error.exception_message)
            .push_bind(&error.exception_detail)
            .push_bind(&error.explanation)
            .push_bind(false)
            .push_bind(failed_at)
            .push_bind(expires_at);
    });
    builder.push(
        " ON CONFLICT (id) DO UPDATE SET \
         exception_type = EXCLUDED.exception_type, \
         exception_message = EXCLUDED.exception_message, \
         exception_detail = EXCLUDED.exception_detail, \
         explanation = EXCLUDED.explanation, \
         attempts = EXCLUDED.attempts, \
         replayable = FALSE, \
         failed_at = EXCLUDED.failed_at, \
         expires_at = EXCLUDED.expires_at",
    );
    builder
        .build()
        .execute(exec)
        .await
        .map_err(db_err("move to dead letter failed"))?;
    Ok(())
}

/// Append the structured filter to a query that already has a `WHERE` clause.
fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &DeadLetterFilter) {
    if let Some(exception_type) = &filter.exception_type {
        builder
            .push(" AND exception_type = ")
            .push_bind(exception_type.clone());
    }
    if let Some(message_type) = &filter.message_type {
        builder
            .push(" AND message_type = ")
            .push_bind(message_type.clone());
    }
    if let Some(received_at) = &filter.received_at {
        builder
            .push(" AND received_at = ")
            .push_bind(received_at.as_str().to_string());
    }
    if let Some(from) = filter.from {
        builder.push(" AND failed_at >= ").push_bind(from);
    }
    if let Some(until) = filter.until {
        builder.push(" AND failed_at < ").push_bind(until);
    }
}

fn push_selector(builder: &mut QueryBuilder<'_, Postgres>, selector: &DeadLetterSelector) {
    builder.push(" WHERE TRUE");
    match selector {
        DeadLetterSelector::Filter(filter) => push_filter(builder, filter),
        DeadLetterSelector::Ids(ids) => {
            builder.push(" AND id = ANY(").push_bind(ids.clone()).push(")");
        }
    }
}

#[async_trait]
impl EnvelopeStore for PgEnvelopeStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn settings(&self) -> &DurabilitySettings {
        &self.settings
    }

    #[instrument(skip(self), fields(schema = %self.tables.schema))]
    async fn ensure_schema(&self) -> Result<(), DurableError> {
        let mut tx = self.begin_tx().await?;
        // Concurrent CREATE ... IF NOT EXISTS can still collide in the catalog.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(LockId::from_name(&format!("schema:{}", self.tables.schema)).0)
            .execute(&mut *tx)
            .await
            .map_err(db_err("schema lock failed"))?;
        for statement in self.tables.create_statements() {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(db_err("create schema failed"))?;
        }
        tx.commit().await.map_err(db_err("commit schema failed"))?;
        Ok(())
    }

    #[instrument(skip(self), fields(schema = %self.tables.schema))]
    async fn rebuild_schema(&self) -> Result<(), DurableError> {
        sqlx::query(&self.tables.drop_statement())
            .execute(&self.pool)
            .await
            .map_err(db_err("drop schema failed"))?;
        tracing::warn!("dropped envelope schema");
        self.ensure_schema().await
    }

    async fn store_incoming(&self, envelope: &Envelope) -> Result<(), DurableError> {
        envelope.validate_for_incoming()?;
        if !insert_envelope(&self.pool, &self.tables.incoming, envelope, envelope.owner_id).await? {
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
        if envelopes.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin_tx().await?;
        for chunk in envelopes.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} ({ENVELOPE_COLUMNS}) ",
                self.tables.incoming
            ));
            builder.push_values(chunk, |mut row, envelope| {
                bind_envelope(&mut row, envelope, envelope.owner_id)
            });
            if let Err(e) = builder.build().execute(&mut *tx).await {
                if !is_unique_violation(&e) {
                    return Err(db_err("store incoming batch failed")(e));
                }
                drop(tx);
                let ids: Vec<Uuid> = envelopes.iter().map(|e| e.id).collect();
                let existing: Option<(Uuid,)> = sqlx::query_as(&format!(
                    "SELECT id FROM {} WHERE id = ANY($1) LIMIT 1",
                    self.tables.incoming
                ))
                .bind(&ids)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err("duplicate lookup failed"))?;
                let id = existing.map(|(id,)| id).unwrap_or(envelopes[0].id);
                return Err(DurableError::DuplicateEnvelope { id });
            }
        }
        tx.commit()
            .await
            .map_err(db_err("commit incoming batch failed"))?;
        Ok(())
    }

    async fn store_outgoing(&self, envelope: &Envelope, owner: NodeId) -> Result<(), DurableError> {
        if !insert_envelope(&self.pool, &self.tables.outgoing, envelope, owner).await? {
            return Err(DurableError::DuplicateEnvelope { id: envelope.id });
        }
        Ok(())
    }

    async fn mark_handled(&self, envelopes: &[Envelope]) -> Result<(), DurableError> {
        let ids: Vec<Uuid> = envelopes.iter().map(|e| e.id).collect();
        let keep_until = Utc::now() + self.settings.keep_after_handling();
        mark_handled_in(&self.pool, &self.tables, &ids, keep_until).await
    }

    async fn increment_attempts(&self, envelope: &Envelope) -> Result<(), DurableError> {
        increment_attempts_in(&self.pool, &self.tables, envelope.id).await
    }

    async fn move_to_dead_letter(
        &self,
        envelope: &Envelope,
        error: &ErrorReport,
    ) -> Result<(), DurableError> {
        move_to_dead_letter_in(&self.pool, &self.tables, &self.settings, envelope, error).await
    }

    async fn reschedule_incoming(
        &self,
        envelope: &Envelope,
        at: DateTime<Utc>,
    ) -> Result<(), DurableError> {
        sqlx::query(&format!(
            "UPDATE {} SET status = 'Scheduled', execution_time = $2, owner_id = 0 WHERE id = $1",
            self.tables.incoming
        ))
        .bind(envelope.id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err("reschedule incoming failed"))?;
        Ok(())
    }

    async fn load_ready_incoming(
        &self,
        destination: &EndpointUri,
        limit: usize,
    ) -> Result<Vec<Envelope>, DurableError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENVELOPE_COLUMNS} FROM {} \
             WHERE status = 'Incoming' AND owner_id = 0 \
               AND (deliver_by IS NULL OR deliver_by > NOW()) \
               AND COALESCE(destination, $3) = $1 \
             ORDER BY seq LIMIT $2",
            self.tables.incoming
        ))
        .bind(destination.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(UNROUTED_DESTINATION)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("load ready incoming failed"))?;
        rows.iter().map(row_to_envelope).collect()
    }

    async fn claim_incoming(
        &self,
        ids: &[Uuid],
        node: NodeId,
    ) -> Result<Vec<Envelope>, DurableError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "UPDATE {} SET owner_id = $2 \
             WHERE id = ANY($1) AND owner_id = 0 AND status = 'Incoming' \
             RETURNING {ENVELOPE_COLUMNS}, seq",
            self.tables.incoming
        ))
        .bind(ids)
        .bind(node.value())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("claim incoming failed"))?;
        decode_in_seq_order(rows)
    }

    async fn release_incoming(&self, ids: &[Uuid], node: NodeId) -> Result<(), DurableError> {
        sqlx::query(&format!(
            "UPDATE {} SET owner_id = 0 WHERE id = ANY($1) AND owner_id = $2",
            self.tables.incoming
        ))
        .bind(ids)
        .bind(node.value())
        .execute(&self.pool)
        .await
        .map_err(db_err("release incoming failed"))?;
        Ok(())
    }

    async fn load_outgoing(
        &self,
        destination: &EndpointUri,
    ) -> Result<Vec<Envelope>, DurableError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENVELOPE_COLUMNS} FROM {} WHERE COALESCE(destination, $2) = $1 ORDER BY seq",
            self.tables.outgoing
        ))
        .bind(destination.as_str())
        .bind(UNROUTED_DESTINATION)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("load outgoing failed"))?;
        rows.iter().map(row_to_envelope).collect()
    }

    async fn claim_outgoing(
        &self,
        ids: &[Uuid],
        node: NodeId,
    ) -> Result<Vec<Envelope>, DurableError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "UPDATE {} SET owner_id = $2 WHERE id = ANY($1) AND owner_id = 0 \
             RETURNING {ENVELOPE_COLUMNS}, seq",
            self.tables.outgoing
        ))
        .bind(ids)
        .bind(node.value())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("claim outgoing failed"))?;
        decode_in_seq_order(rows)
    }

    async fn delete_outgoing(&self, envelopes: &[Envelope]) -> Result<(), DurableError> {
        let ids: Vec<Uuid> = envelopes.iter().map(|e| e.id).collect();
        sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ANY($1)",
            self.tables.outgoing
        ))
        .bind(&ids)
        .execute(&self.pool)
        .await
        .map_err(db_err("delete outgoing failed"))?;
        Ok(())
    }

    async fn discard_and_reassign_outgoing(
        &self,
        discards: &[Envelope],
        reassigned: &[Envelope],
        node: NodeId,
    ) -> Result<(), DurableError> {
        let discard_ids: Vec<Uuid> = discards.iter().map(|e| e.id).collect();
        let reassign_ids: Vec<Uuid> = reassigned.iter().map(|e| e.id).collect();
        let outgoing = &self.tables.outgoing;
        sqlx::query(&format!(
            "WITH discarded AS (DELETE FROM {outgoing} WHERE id = ANY($1)) \
             UPDATE {outgoing} SET owner_id = $3 WHERE id = ANY($2)"
        ))
        .bind(&discard_ids)
        .bind(&reassign_ids)
        .bind(node.value())
        .execute(&self.pool)
        .await
        .map_err(db_err("discard and reassign outgoing failed"))?;
        Ok(())
    }

    async fn fetch_counts(&self) -> Result<PersistedCounts, DurableError> {
        let t = &self.tables;
        let row = sqlx::query(&format!(
            "SELECT \
               (SELECT COUNT(*) FROM {incoming} WHERE status = 'Incoming') AS incoming, \
               (SELECT COUNT(*) FROM {incoming} WHERE status = 'Scheduled') AS scheduled, \
               (SELECT COUNT(*) FROM {incoming} WHERE status = 'Handled') AS handled, \
               (SELECT COUNT(*) FROM {outgoing}) AS outgoing, \
               (SELECT COUNT(*) FROM {dead}) AS dead_letters",
            incoming = t.incoming,
            outgoing = t.outgoing,
            dead = t.dead_letters,
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("fetch counts failed"))?;
        Ok(PersistedCounts {
            incoming: try_get_column(&row, "incoming")?,
            scheduled: try_get_column(&row, "scheduled")?,
            handled: try_get_column(&row, "handled")?,
            outgoing: try_get_column(&row, "outgoing")?,
            dead_letters: try_get_column(&row, "dead_letters")?,
        })
    }

    async fn all_incoming(&self) -> Result<Vec<Envelope>, DurableError> {
        self.select_envelopes(
            &format!(
                "SELECT {ENVELOPE_COLUMNS} FROM {} ORDER BY seq",
                self.tables.incoming
            ),
            "load all incoming failed",
        )
        .await
    }

    async fn all_outgoing(&self) -> Result<Vec<Envelope>, DurableError> {
        self.select_envelopes(
            &format!(
                "SELECT {ENVELOPE_COLUMNS} FROM {} ORDER BY seq",
                self.tables.outgoing
            ),
            "load all outgoing failed",
        )
        .await
    }

    #[instrument(skip(self), fields(schema = %self.tables.schema))]
    async fn clear_all(&self) -> Result<(), DurableError> {
        sqlx::query(&format!(
            "TRUNCATE {}, {}, {}",
            self.tables.incoming, self.tables.outgoing, self.tables.dead_letters
        ))
        .execute(&self.pool)
        .await
        .map_err(db_err("clear all failed"))?;
        Ok(())
    }

    async fn release_ownership(
        &self,
        node: NodeId,
        destination: Option<&EndpointUri>,
    ) -> Result<(), DurableError> {
        let t = &self.tables;
        sqlx::query(&format!(
            "WITH released AS ( \
               UPDATE {incoming} SET owner_id = 0 \
               WHERE owner_id = $1 AND ($2::text IS NULL OR COALESCE(destination, $3) = $2)) \
             UPDATE {outgoing} SET owner_id = 0 \
             WHERE owner_id = $1 AND ($2::text IS NULL OR COALESCE(destination, $3) = $2)",
            incoming = t.incoming,
            outgoing = t.outgoing,
        ))
        .bind(node.value())
        .bind(destination.map(EndpointUri::as_str))
        .bind(UNROUTED_DESTINATION)
        .execute(&self.pool)
        .await
        .map_err(db_err("release ownership failed"))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn EnvelopeTransaction>, DurableError> {
        let tx = self.begin_tx().await?;
        Ok(Box::new(PgEnvelopeTransaction {
            tx: Some(tx),
            tables: self.tables.clone(),
            settings: self.settings.clone(),
        }))
    }
}

/// `RETURNING` order is unspecified; restore natural storage order.
fn decode_in_seq_order(rows: Vec<PgRow>) -> Result<Vec<Envelope>, DurableError> {
    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        let seq: i64 = try_get_column(row, "seq")?;
        decoded.push((seq, row_to_envelope(row)?));
    }
    decoded.sort_by_key(|(seq, _)| *seq);
    Ok(decoded.into_iter().map(|(_, envelope)| envelope).collect())
}

#[async_trait]
impl ScheduledJobs for PgEnvelopeStore {
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
        let mut tx = self.begin_tx().await?;
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
            .bind(LockId::scheduled_jobs(&self.tables.schema).0)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err("scheduled jobs lock failed"))?;
        if !locked {
            tracing::debug!("scheduled jobs are being dispatched elsewhere, skipping");
            return Ok(Vec::new());
        }

        let incoming = &self.tables.incoming;
        let returning = ENVELOPE_COLUMNS
            .split(", ")
            .map(|c| format!("i.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = sqlx::query(&format!(
            "WITH due AS ( \
               SELECT id, execution_time AS due_at, seq FROM {incoming} \
               WHERE status = 'Scheduled' AND execution_time <= $1 \
               ORDER BY execution_time, seq \
               LIMIT $2 \
               FOR UPDATE SKIP LOCKED) \
             UPDATE {incoming} i \
             SET status = 'Incoming', execution_time = NULL, owner_id = 0 \
             FROM due WHERE i.id = due.id \
             RETURNING {returning}, due.due_at, due.seq"
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("dispatch scheduled envelopes failed"))?;
        tx.commit()
            .await
            .map_err(db_err("commit scheduled dispatch failed"))?;

        let mut released = Vec::with_capacity(rows.len());
        for row in &rows {
            let due_at: DateTime<Utc> = try_get_column(row, "due_at")?;
            let seq: i64 = try_get_column(row, "seq")?;
            released.push(((due_at, seq), row_to_envelope(row)?));
        }
        released.sort_by_key(|(key, _)| *key);
        Ok(released.into_iter().map(|(_, envelope)| envelope).collect())
    }
}

#[async_trait]
impl RecoveryStore for PgEnvelopeStore {
    async fn find_recoverable_incoming(&self) -> Result<Vec<RecoverableIncoming>, DurableError> {
        let rows = sqlx::query(&format!(
            "SELECT COALESCE(destination, $1) AS destination, COUNT(*) AS total FROM {} \
             WHERE status = 'Incoming' AND owner_id = 0 \
               AND (deliver_by IS NULL OR deliver_by > NOW()) \
             GROUP BY 1 ORDER BY 1",
            self.tables.incoming
        ))
        .bind(UNROUTED_DESTINATION)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("find recoverable incoming failed"))?;
        rows.iter()
            .map(|row| {
                let destination: String = try_get_column(row, "destination")?;
                let total: i64 = try_get_column(row, "total")?;
                Ok(RecoverableIncoming {
                    destination: EndpointUri::new(destination),
                    count: u64::try_from(total).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn find_outgoing_destinations(&self) -> Result<Vec<EndpointUri>, DurableError> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT DISTINCT COALESCE(destination, $1) FROM {} WHERE owner_id = 0 ORDER BY 1",
            self.tables.outgoing
        ))
        .bind(UNROUTED_DESTINATION)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("find outgoing destinations failed"))?;
        Ok(rows.into_iter().map(|(d,)| EndpointUri::new(d)).collect())
    }

    #[instrument(skip(self), fields(store = %self.name))]
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<ExpiredSweep, DurableError> {
        let t = &self.tables;
        let row = sqlx::query(&format!(
            "WITH handled AS ( \
               DELETE FROM {incoming} WHERE status = 'Handled' AND keep_until <= $1 RETURNING 1), \
             expired_incoming AS ( \
               DELETE FROM {incoming} WHERE status <> 'Handled' AND deliver_by <= $1 RETURNING 1), \
             expired_outgoing AS ( \
               DELETE FROM {outgoing} WHERE deliver_by <= $1 RETURNING 1), \
             dead AS ( \
               DELETE FROM {dead} WHERE expires_at <= $1 RETURNING 1) \
             SELECT (SELECT COUNT(*) FROM handled) AS handled, \
                    (SELECT COUNT(*) FROM expired_incoming) \
                      + (SELECT COUNT(*) FROM expired_outgoing) AS expired, \
                    (SELECT COUNT(*) FROM dead) AS dead_letters",
            incoming = t.incoming,
            outgoing = t.outgoing,
            dead = t.dead_letters,
        ))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("delete expired failed"))?;
        let count = |column: &str| -> Result<u64, DurableError> {
            let value: i64 = try_get_column(&row, column)?;
            Ok(u64::try_from(value).unwrap_or_default())
        };
        Ok(ExpiredSweep {
            handled: count("handled")?,
            expired: count("expired")?,
            dead_letters: count("dead_letters")?,
        })
    }

    async fn envelope_owners(&self) -> Result<Vec<NodeId>, DurableError> {
        let rows: Vec<(i32,)> = sqlx::query_as(&format!(
            "SELECT owner_id FROM {} WHERE owner_id <> 0 \
             UNION SELECT owner_id FROM {} WHERE owner_id <> 0 ORDER BY 1",
            self.tables.incoming, self.tables.outgoing
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("load envelope owners failed"))?;
        Ok(rows.into_iter().map(|(id,)| NodeId::new(id)).collect())
    }

    #[instrument(skip(self), fields(store = %self.name))]
    async fn reassign_dormant_node(&self, node: NodeId) -> Result<ReassignOutcome, DurableError> {
        let mut tx = self.begin_tx().await?;
        // Conflicts with the session lock the node holds while alive.
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
            .bind(LockId::node(&self.tables.schema, node).0)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err("node lock failed"))?;
        if !locked {
            return Ok(ReassignOutcome::NodeStillAlive);
        }

        let t = &self.tables;
        let row = sqlx::query(&format!(
            "WITH released_incoming AS ( \
               UPDATE {incoming} SET owner_id = 0 WHERE owner_id = $1 RETURNING 1), \
             released_outgoing AS ( \
               UPDATE {outgoing} SET owner_id = 0 WHERE owner_id = $1 RETURNING 1), \
             removed AS (DELETE FROM {nodes} WHERE id = $1) \
             SELECT (SELECT COUNT(*) FROM released_incoming) AS incoming, \
                    (SELECT COUNT(*) FROM released_outgoing) AS outgoing",
            incoming = t.incoming,
            outgoing = t.outgoing,
            nodes = t.nodes,
        ))
        .bind(node.value())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("reassign dormant node failed"))?;
        let incoming: i64 = try_get_column(&row, "incoming")?;
        let outgoing: i64 = try_get_column(&row, "outgoing")?;
        tx.commit()
            .await
            .map_err(db_err("commit dormant node reassignment failed"))?;
        Ok(ReassignOutcome::Reassigned {
            incoming: u64::try_from(incoming).unwrap_or_default(),
            outgoing: u64::try_from(outgoing).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl DeadLetterStore for PgEnvelopeStore {
    async fn query_dead_letters(
        &self,
        query: &DeadLetterQuery,
    ) -> Result<DeadLetterPage, DurableError> {
        let selector = DeadLetterSelector::Filter(query.filter.clone());

        let mut count: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", self.tables.dead_letters));
        push_selector(&mut count, &selector);
        let (total,): (i64,) = count
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("count dead letters failed"))?;

        let mut page: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {ENVELOPE_COLUMNS}, {DEAD_LETTER_COLUMNS} FROM {}",
            self.tables.dead_letters
        ));
        push_selector(&mut page, &selector);
        page.push(" ORDER BY failed_at, id LIMIT ")
            .push_bind(i64::try_from(query.page_size).unwrap_or(i64::MAX))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));
        let rows = page
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("query dead letters failed"))?;

        Ok(DeadLetterPage {
            records: rows
                .iter()
                .map(row_to_dead_letter)
                .collect::<Result<_, _>>()?,
            total_count: u64::try_from(total).unwrap_or_default(),
            page: query.page,
            page_size: query.page_size,
        })
    }

    async fn summarize_dead_letters(
        &self,
        grouping: DeadLetterGrouping,
    ) -> Result<Vec<DeadLetterCount>, DurableError> {
        let key = match grouping {
            DeadLetterGrouping::MessageType => "message_type",
            DeadLetterGrouping::ExceptionType => "exception_type",
            DeadLetterGrouping::Destination => "COALESCE(destination, '')",
        };
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT {key}, COUNT(*) FROM {} GROUP BY 1",
            self.tables.dead_letters
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("summarize dead letters failed"))?;
        let mut counts: Vec<DeadLetterCount> = rows
            .into_iter()
            .map(|(key, count)| DeadLetterCount {
                key,
                count: u64::try_from(count).unwrap_or_default(),
            })
            .collect();
        sort_counts(&mut counts);
        Ok(counts)
    }

    async fn load_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, DurableError> {
        let row = sqlx::query(&format!(
            "SELECT {ENVELOPE_COLUMNS}, {DEAD_LETTER_COLUMNS} FROM {} WHERE id = $1",
            self.tables.dead_letters
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("load dead letter failed"))?;
        row.as_ref().map(row_to_dead_letter).transpose()
    }

    async fn discard_dead_letters(
        &self,
        selector: &DeadLetterSelector,
        limit: usize,
    ) -> Result<u64, DurableError> {
        let dead = &self.tables.dead_letters;
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "DELETE FROM {dead} WHERE id IN (SELECT id FROM {dead}"
        ));
        push_selector(&mut builder, selector);
        builder
            .push(" ORDER BY failed_at, id LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .push(" FOR UPDATE SKIP LOCKED)");
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_err("discard dead letters failed"))?;
        Ok(result.rows_affected())
    }

    async fn mark_dead_letters_replayable(
        &self,
        selector: &DeadLetterSelector,
        limit: usize,
    ) -> Result<u64, DurableError> {
        let dead = &self.tables.dead_letters;
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "UPDATE {dead} SET replayable = TRUE WHERE id IN (SELECT id FROM {dead}"
        ));
        push_selector(&mut builder, selector);
        builder
            .push(" AND NOT replayable ORDER BY failed_at, id LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .push(" FOR UPDATE SKIP LOCKED)");
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_err("mark dead letters replayable failed"))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(store = %self.name))]
    async fn replay_dead_letters(
        &self,
        limit: usize,
        reset_attempts: bool,
    ) -> Result<u64, DurableError> {
        let t = &self.tables;
        let result = sqlx::query(&format!(
            "WITH moved AS ( \
               DELETE FROM {dead} WHERE id IN ( \
                 SELECT id FROM {dead} WHERE replayable \
                 ORDER BY failed_at, id LIMIT $1 FOR UPDATE SKIP LOCKED) \
               RETURNING {ENVELOPE_COLUMNS}) \
             INSERT INTO {incoming} ({ENVELOPE_COLUMNS}) \
             SELECT id, 'Incoming', 0, NULL, CASE WHEN $2 THEN 0 ELSE attempts END, body, \
                    message_type, content_type, destination, deliver_by, NULL, correlation_id, \
                    conversation_id, parent_id, saga_id, reply_uri, reply_requested, \
                    ack_requested, received_at, sent_at, tenant_id, source \
             FROM moved \
             ON CONFLICT (id) DO UPDATE SET status = 'Incoming', owner_id = 0, \
               execution_time = NULL, keep_until = NULL, attempts = EXCLUDED.attempts",
            dead = t.dead_letters,
            incoming = t.incoming,
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(reset_attempts)
        .execute(&self.pool)
        .await
        .map_err(db_err("replay dead letters failed"))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl NodeRegistry for PgEnvelopeStore {
    async fn register_node(&self, node: &NodeIdentity) -> Result<(), DurableError> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, uri, weight, started_at, last_heartbeat) \
             VALUES ($1, $2, $3, NOW(), NOW()) \
             ON CONFLICT (id) DO UPDATE SET uri = EXCLUDED.uri, weight = EXCLUDED.weight, \
               started_at = NOW(), last_heartbeat = NOW()",
            self.tables.nodes
        ))
        .bind(node.id.value())
        .bind(&node.uri)
        .bind(node.weight)
        .execute(&self.pool)
        .await
        .map_err(db_err("register node failed"))?;
        Ok(())
    }

    async fn heartbeat(&self, node: NodeId) -> Result<(), DurableError> {
        sqlx::query(&format!(
            "UPDATE {} SET last_heartbeat = NOW() WHERE id = $1",
            self.tables.nodes
        ))
        .bind(node.value())
        .execute(&self.pool)
        .await
        .map_err(db_err("node heartbeat failed"))?;
        Ok(())
    }

    async fn unregister_node(&self, node: NodeId) -> Result<(), DurableError> {
        sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.tables.nodes))
            .bind(node.value())
            .execute(&self.pool)
            .await
            .map_err(db_err("unregister node failed"))?;
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<NodeRecord>, DurableError> {
        let rows = sqlx::query(&format!(
            "SELECT id, uri, weight, started_at, last_heartbeat FROM {} ORDER BY id",
            self.tables.nodes
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("load nodes failed"))?;
        rows.iter()
            .map(|row| {
                let id: i32 = try_get_column(row, "id")?;
                Ok(NodeRecord {
                    id: NodeId::new(id),
                    uri: try_get_column(row, "uri")?,
                    weight: try_get_column(row, "weight")?,
                    started_at: try_get_column(row, "started_at")?,
                    last_heartbeat: try_get_column(row, "last_heartbeat")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AdvisoryLocks for PgEnvelopeStore {
    async fn lock_session(&self) -> Result<Box<dyn LockSession>, DurableError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(db_err("acquire lock connection failed"))?;
        Ok(Box::new(PgLockSession {
            conn: Some(conn),
            held: HashSet::new(),
        }))
    }
}

/// Session-level advisory locks on one pooled connection.
///
/// Dropped without `close()`, the connection is detached from the pool and
/// closed, so the server releases its locks instead of a pooled connection
/// carrying them to the next user.
pub struct PgLockSession {
    conn: Option<PoolConnection<Postgres>>,
    held: HashSet<LockId>,
}

impl PgLockSession {
    fn conn(&mut self) -> Result<&mut PgConnection, DurableError> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| DurableError::persistence("lock session is closed"))
    }
}

#[async_trait]
impl LockSession for PgLockSession {
    async fn get_lock(&mut self, lock: LockId) -> Result<(), DurableError> {
        // Postgres would stack a second hold on the same key.
        if self.held.contains(&lock) {
            return Err(DurableError::LockAlreadyHeld { lock });
        }
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(lock.0)
            .execute(self.conn()?)
            .await
            .map_err(db_err("advisory lock failed"))?;
        self.held.insert(lock);
        Ok(())
    }

    async fn try_get_lock(&mut self, lock: LockId) -> Result<bool, DurableError> {
        if self.held.contains(&lock) {
            return Ok(false);
        }
        let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(lock.0)
            .fetch_one(self.conn()?)
            .await
            .map_err(db_err("try advisory lock failed"))?;
        if acquired {
            self.held.insert(lock);
        }
        Ok(acquired)
    }

    async fn release_lock(&mut self, lock: LockId) -> Result<(), DurableError> {
        if !self.held.remove(&lock) {
            return Ok(());
        }
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(lock.0)
            .execute(self.conn()?)
            .await
            .map_err(db_err("advisory unlock failed"))?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), DurableError> {
        if let Some(mut conn) = self.conn.take() {
            self.held.clear();
            sqlx::query("SELECT pg_advisory_unlock_all()")
                .execute(&mut *conn)
                .await
                .map_err(db_err("advisory unlock all failed"))?;
        }
        Ok(())
    }
}

impl Drop for PgLockSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.held.is_empty() {
                drop(conn.detach());
            }
        }
    }
}

/// A database transaction that envelope operations and domain writes share.
pub struct PgEnvelopeTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    tables: Tables,
    settings: DurabilitySettings,
}

impl PgEnvelopeTransaction {
    /// The underlying connection, for executing domain SQL in the same transaction.
    pub fn executor(&mut self) -> Result<&mut PgConnection, DurableError> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| DurableError::persistence("transaction already finished"))
    }
}

#[async_trait]
impl EnvelopeTransaction for PgEnvelopeTransaction {
    async fn persist_incoming(&mut self, envelope: &Envelope) -> Result<(), DurableError> {
        envelope.validate_for_incoming()?;
        let table = self.tables.incoming.clone();
        if !insert_envelope(self.executor()?, &table, envelope, envelope.owner_id).await? {
            return Err(DurableError::DuplicateEnvelope { id: envelope.id });
        }
        Ok(())
    }

    async fn persist_outgoing(
        &mut self,
        envelope: &Envelope,
        owner: NodeId,
    ) -> Result<(), DurableError> {
        let table = self.tables.outgoing.clone();
        if !insert_envelope(self.executor()?, &table, envelope, owner).await? {
            return Err(DurableError::DuplicateEnvelope { id: envelope.id });
        }
        Ok(())
    }

    async fn mark_handled(&mut self, envelope: &Envelope) -> Result<(), DurableError> {
        let tables = self.tables.clone();
        let keep_until = Utc::now() + self.settings.keep_after_handling();
        mark_handled_in(self.executor()?, &tables, &[envelope.id], keep_until).await
    }

    async fn increment_attempts(&mut self, envelope: &Envelope) -> Result<(), DurableError> {
        let tables = self.tables.clone();
        increment_attempts_in(self.executor()?, &tables, envelope.id).await
    }

    async fn move_to_dead_letter(
        &mut self,
        envelope: &Envelope,
        error: &ErrorReport,
    ) -> Result<(), DurableError> {
        let tables = self.tables.clone();
        let settings = self.settings.clone();
        move_to_dead_letter_in(self.executor()?, &tables, &settings, envelope, error).await
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DurableError> {
        match self.tx.take() {
            Some(tx) => tx.commit().await.map_err(db_err("commit failed")),
            None => Err(DurableError::persistence("transaction already finished")),
        }
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), DurableError> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(db_err("rollback failed")),
            None => Ok(()),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Tenant assignments read from the `tenants` table.
pub struct PgTenantSource {
    pool: PgPool,
    table: String,
}

impl PgTenantSource {
    /// Insert or update one assignment.
    pub async fn assign(&self, assignment: &TenantAssignment) -> Result<(), DurableError> {
        sqlx::query(&format!(
            "INSERT INTO {} (tenant_id, connection_string) VALUES ($1, $2) \
             ON CONFLICT (tenant_id) DO UPDATE SET connection_string = EXCLUDED.connection_string",
            self.table
        ))
        .bind(assignment.tenant_id.as_str())
        .bind(&assignment.location)
        .execute(&self.pool)
        .await
        .map_err(db_err("assign tenant failed"))?;
        Ok(())
    }

    pub async fn remove(&self, tenant: &TenantId) -> Result<(), DurableError> {
        sqlx::query(&format!("DELETE FROM {} WHERE tenant_id = $1", self.table))
            .bind(tenant.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err("remove tenant failed"))?;
        Ok(())
    }
}

#[async_trait]
impl TenantSource for PgTenantSource {
    async fn find_assignment(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<TenantAssignment>, DurableError> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT connection_string FROM {} WHERE tenant_id = $1",
            self.table
        ))
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find tenant failed"))?;
        Ok(row.map(|(location,)| TenantAssignment {
            tenant_id: tenant.clone(),
            location,
        }))
    }

    async fn all_assignments(&self) -> Result<Vec<TenantAssignment>, DurableError> {
        let rows: Vec<(String, String)> = sqlx::query_as(&format!(
            "SELECT tenant_id, connection_string FROM {} ORDER BY tenant_id",
            self.table
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("load tenants failed"))?;
        Ok(rows
            .into_iter()
            .map(|(tenant_id, location)| TenantAssignment::new(tenant_id, location))
            .collect())
    }
}

/// Opens a [`PgEnvelopeStore`] per tenant database.
pub struct PgStoreFactory {
    settings: DurabilitySettings,
    max_connections: u32,
}

impl PgStoreFactory {
    pub fn new(settings: DurabilitySettings) -> Self {
        Self {
            settings,
            max_connections: 10,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}

/// Logical store name for a connection string: its database name.
pub fn database_name(url: &str) -> &str {
    let without_query = url.split('?').next().unwrap_or(url);
    without_query
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(without_query)
}

#[async_trait]
impl StoreFactory for PgStoreFactory {
    async fn build(&self, location: &str) -> Result<Arc<dyn MessageStore>, DurableError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect_lazy(location)
            .map_err(db_err("invalid tenant database url"))?;
        let store = PgEnvelopeStore::new(database_name(location), pool, self.settings.clone())?;
        store.ensure_schema().await?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_name_from_url() {
        assert_eq!(database_name("postgres://u:p@db:5432/tenant_red"), "tenant_red");
        assert_eq!(
            database_name("postgres://db/tenant_blue?sslmode=disable"),
            "tenant_blue"
        );
    }

    #[tokio::test]
    async fn store_rejects_invalid_settings() {
        let settings = DurabilitySettings {
            schema_name: "bad schema".into(),
            ..Default::default()
        };
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/courier")
            .unwrap();
        assert!(matches!(
            PgEnvelopeStore::new("main", pool, settings),
            Err(DurableError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn filter_builds_parameterized_sql() {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT id FROM dl");
        push_selector(
            &mut builder,
            &DeadLetterSelector::Filter(DeadLetterFilter {
                exception_type: Some("Timeout".into()),
                message_type: Some("OrderPlaced".into()),
                ..Default::default()
            }),
        );
        assert_eq!(
            builder.sql(),
            "SELECT id FROM dl WHERE TRUE AND exception_type = $1 AND message_type = $2"
        );
    }
}
