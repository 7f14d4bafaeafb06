//! DDL for the Postgres envelope store.
//!
//! Every table lives in one schema named by `DurabilitySettings::schema_name`,
//! which is validated as a plain identifier before it is spliced into SQL.

use crate::config::is_valid_identifier;
use crate::error::DurableError;

/// Envelope columns in insert/select order.
pub(crate) const ENVELOPE_COLUMNS: &str = "id, status, owner_id, execution_time, attempts, body, \
     message_type, content_type, destination, deliver_by, keep_until, correlation_id, \
     conversation_id, parent_id, saga_id, reply_uri, reply_requested, ack_requested, \
     received_at, sent_at, tenant_id, source";

/// Failure columns appended to [`ENVELOPE_COLUMNS`] in the dead-letter table.
pub(crate) const DEAD_LETTER_COLUMNS: &str =
    "exception_type, exception_message, exception_detail, explanation, replayable, failed_at, expires_at";

/// Fully qualified table names for one schema.
#[derive(Debug, Clone)]
pub(crate) struct Tables {
    pub schema: String,
    pub incoming: String,
    pub outgoing: String,
    pub dead_letters: String,
    pub nodes: String,
    pub tenants: String,
}

impl Tables {
    pub fn new(schema: &str) -> Result<Self, DurableError> {
        if !is_valid_identifier(schema) {
            return Err(DurableError::InvalidConfig {
                reason: format!("invalid schema name '{schema}'"),
            });
        }
        Ok(Self {
            schema: schema.to_string(),
            incoming: format!("{schema}.incoming_envelopes"),
            outgoing: format!("{schema}.outgoing_envelopes"),
            dead_letters: format!("{schema}.dead_letters"),
            nodes: format!("{schema}.nodes"),
            tenants: format!("{schema}.tenants"),
        })
    }

    /// Idempotent statements creating the schema, tables and indexes.
    pub fn create_statements(&self) -> Vec<String> {
        let envelope_columns = "
            id              UUID PRIMARY KEY,
            status          TEXT NOT NULL,
            owner_id        INTEGER NOT NULL DEFAULT 0,
            execution_time  TIMESTAMPTZ,
            attempts        INTEGER NOT NULL DEFAULT 0,
            body            BYTEA NOT NULL,
            message_type    TEXT NOT NULL,
            content_type    TEXT NOT NULL,
            destination     TEXT,
            deliver_by      TIMESTAMPTZ,
            keep_until      TIMESTAMPTZ,
            correlation_id  TEXT,
            conversation_id UUID,
            parent_id       TEXT,
            saga_id         TEXT,
            reply_uri       TEXT,
            reply_requested TEXT,
            ack_requested   BOOLEAN NOT NULL DEFAULT FALSE,
            received_at     TEXT,
            sent_at         TIMESTAMPTZ NOT NULL,
            tenant_id       TEXT,
            source          TEXT,
            seq             BIGINT GENERATED ALWAYS AS IDENTITY";
        let schema = &self.schema;
        vec![
            format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({envelope_columns})",
                self.incoming
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({envelope_columns})",
                self.outgoing
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({envelope_columns},
                    exception_type    TEXT NOT NULL,
                    exception_message TEXT NOT NULL,
                    exception_detail  TEXT NOT NULL DEFAULT '',
                    explanation       TEXT NOT NULL DEFAULT '',
                    replayable        BOOLEAN NOT NULL DEFAULT FALSE,
                    failed_at         TIMESTAMPTZ NOT NULL,
                    expires_at        TIMESTAMPTZ)",
                self.dead_letters
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id             INTEGER PRIMARY KEY,
                    uri            TEXT NOT NULL,
                    weight         INTEGER NOT NULL DEFAULT 1,
                    started_at     TIMESTAMPTZ NOT NULL,
                    last_heartbeat TIMESTAMPTZ NOT NULL)",
                self.nodes
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    tenant_id         TEXT PRIMARY KEY,
                    connection_string TEXT NOT NULL)",
                self.tenants
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_incoming_ready \
                 ON {} (destination, seq) WHERE status = 'Incoming' AND owner_id = 0",
                self.incoming
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_incoming_scheduled \
                 ON {} (execution_time, seq) WHERE status = 'Scheduled'",
                self.incoming
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_incoming_owner ON {} (owner_id)",
                self.incoming
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_outgoing_owner ON {} (owner_id, destination)",
                self.outgoing
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_dead_letters_failed_at ON {} (failed_at, id)",
                self.dead_letters
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_dead_letters_replayable \
                 ON {} (failed_at, id) WHERE replayable",
                self.dead_letters
            ),
        ]
    }

    pub fn drop_statement(&self) -> String {
        format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsafe_schema_names() {
        assert!(Tables::new("courier").is_ok());
        assert!(Tables::new("tenant_red").is_ok());
        assert!(Tables::new("courier; DROP TABLE x").is_err());
        assert!(Tables::new("Courier").is_err());
        assert!(Tables::new("").is_err());
    }

    #[test]
    fn tables_are_schema_qualified() {
        let tables = Tables::new("courier").unwrap();
        assert_eq!(tables.incoming, "courier.incoming_envelopes");
        assert_eq!(tables.dead_letters, "courier.dead_letters");
        assert_eq!(tables.drop_statement(), "DROP SCHEMA IF EXISTS courier CASCADE");
    }

    #[test]
    fn create_statements_are_idempotent() {
        let tables = Tables::new("courier").unwrap();
        for statement in tables.create_statements() {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "not idempotent: {statement}"
            );
        }
    }

    #[test]
    fn column_lists_match_table_width() {
        assert_eq!(ENVELOPE_COLUMNS.split(',').count(), 22);
        assert_eq!(DEAD_LETTER_COLUMNS.split(',').count(), 7);
    }
}
