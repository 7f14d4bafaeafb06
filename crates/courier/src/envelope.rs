use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::DurableError;
use crate::types::{EndpointUri, NodeId, TenantId};

/// Lifecycle state of a persisted envelope.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum EnvelopeStatus {
    /// Ready for dispatch (or being dispatched by its owner).
    Incoming,
    /// Waiting for `scheduled_time`.
    Scheduled,
    /// Successfully handled; kept until `keep_until` for idempotency checks.
    Handled,
}

impl EnvelopeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeStatus::Incoming => "Incoming",
            EnvelopeStatus::Scheduled => "Scheduled",
            EnvelopeStatus::Handled => "Handled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DurableError> {
        match value {
            "Incoming" => Ok(EnvelopeStatus::Incoming),
            "Scheduled" => Ok(EnvelopeStatus::Scheduled),
            "Handled" => Ok(EnvelopeStatus::Handled),
            other => Err(DurableError::MalformedEnvelope {
                reason: format!("unknown envelope status '{other}'"),
                source: None,
            }),
        }
    }
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable unit of work: a serialized message plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    /// Serialized message payload.
    pub body: Vec<u8>,
    pub content_type: String,
    pub message_type: String,
    pub status: EnvelopeStatus,
    pub owner_id: NodeId,
    /// Number of dispatch tries so far.
    pub attempts: i32,
    /// When a `Scheduled` envelope becomes due. Set iff `status == Scheduled`.
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Hard expiry. Past this point the envelope is discarded, never delivered.
    #[serde(default)]
    pub deliver_by: Option<DateTime<Utc>>,
    /// After this point a `Handled` envelope may be purged.
    #[serde(default)]
    pub keep_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub destination: Option<EndpointUri>,
    #[serde(default)]
    pub received_at: Option<EndpointUri>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub saga_id: Option<String>,
    #[serde(default)]
    pub reply_uri: Option<EndpointUri>,
    /// Message type the sender expects as a reply, if any.
    #[serde(default)]
    pub reply_requested: Option<String>,
    #[serde(default)]
    pub ack_requested: bool,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    /// Name of the sending service.
    #[serde(default)]
    pub source: Option<String>,
}

impl Envelope {
    /// A new unowned `Incoming` envelope with a fresh id.
    ///
    /// Call [`Envelope::owned_by`] before storing it as incoming, or
    /// [`Envelope::scheduled_for`] to store it as a scheduled job.
    pub fn new(message_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            body: body.into(),
            content_type: "application/json".to_string(),
            message_type: message_type.into(),
            status: EnvelopeStatus::Incoming,
            owner_id: NodeId::ANY,
            attempts: 0,
            scheduled_time: None,
            deliver_by: None,
            keep_until: None,
            destination: None,
            received_at: None,
            correlation_id: None,
            conversation_id: None,
            parent_id: None,
            saga_id: None,
            reply_uri: None,
            reply_requested: None,
            ack_requested: false,
            sent_at: Utc::now(),
            tenant_id: None,
            source: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set the destination; incoming envelopes are also marked as received there.
    pub fn with_destination(mut self, destination: EndpointUri) -> Self {
        if self.received_at.is_none() {
            self.received_at = Some(destination.clone());
        }
        self.destination = Some(destination);
        self
    }

    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant_id = Some(tenant);
        self
    }

    pub fn with_deliver_by(mut self, deliver_by: DateTime<Utc>) -> Self {
        self.deliver_by = Some(deliver_by);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Mark as `Incoming` and owned by the node that received it.
    pub fn owned_by(mut self, node: NodeId) -> Self {
        self.status = EnvelopeStatus::Incoming;
        self.scheduled_time = None;
        self.owner_id = node;
        self
    }

    /// Mark as a `Scheduled`, unowned envelope due at `at`.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.status = EnvelopeStatus::Scheduled;
        self.scheduled_time = Some(at);
        self.owner_id = NodeId::ANY;
        self
    }

    /// Whether `deliver_by` has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deliver_by.is_some_and(|deadline| deadline <= now)
    }

    /// Whether a scheduled envelope is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnvelopeStatus::Scheduled
            && self.scheduled_time.is_some_and(|at| at <= now)
    }

    /// Checks applied before any envelope is persisted to the incoming collection.
    pub fn validate_for_incoming(&self) -> Result<(), DurableError> {
        if self.status == EnvelopeStatus::Incoming && self.owner_id.is_any() {
            return Err(DurableError::InvariantViolation {
                reason: format!(
                    "incoming envelope {} must be owned by the receiving node or scheduled",
                    self.id
                ),
            });
        }
        if self.scheduled_time.is_some() != (self.status == EnvelopeStatus::Scheduled) {
            return Err(DurableError::InvariantViolation {
                reason: format!(
                    "envelope {} has status {} but scheduled_time {:?}",
                    self.id, self.status, self.scheduled_time
                ),
            });
        }
        Ok(())
    }

    /// Transition a scheduled envelope into the ready state.
    pub(crate) fn release_scheduled(&mut self) {
        self.status = EnvelopeStatus::Incoming;
        self.scheduled_time = None;
        self.owner_id = NodeId::ANY;
    }

    pub(crate) fn mark_handled(&mut self, keep_until: DateTime<Utc>) {
        self.status = EnvelopeStatus::Handled;
        self.scheduled_time = None;
        self.keep_until = Some(keep_until);
    }

    /// Storage partition key: the destination, or a shared bucket when unset.
    pub(crate) fn destination_key(&self) -> &str {
        self.destination
            .as_ref()
            .map(EndpointUri::as_str)
            .unwrap_or(UNROUTED_DESTINATION)
    }
}

/// Partition used for envelopes without a destination.
pub(crate) const UNROUTED_DESTINATION: &str = "local://unrouted";

/// Failure detail recorded with a dead letter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub exception_type: String,
    pub exception_message: String,
    /// Source chain or stack text.
    pub exception_detail: String,
    /// Human explanation, e.g. which retry policy gave up.
    pub explanation: String,
}

impl ErrorReport {
    pub fn new(exception_type: impl Into<String>, exception_message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            exception_message: exception_message.into(),
            exception_detail: String::new(),
            explanation: String::new(),
        }
    }

    /// Build a report from a Rust error, recording its type name and source chain.
    pub fn from_error<E: std::error::Error + 'static>(error: &E) -> Self {
        let mut detail = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            detail.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            exception_type: std::any::type_name::<E>().to_string(),
            exception_message: error.to_string(),
            exception_detail: detail.join("\n"),
            explanation: String::new(),
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }
}

/// An envelope that exhausted its retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub envelope: Envelope,
    pub error: ErrorReport,
    /// Flagged for the replay sweep to move back to incoming.
    pub replayable: bool,
    pub failed_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl DeadLetterRecord {
    pub fn id(&self) -> Uuid {
        self.envelope.id
    }

    /// The envelope to reinsert on replay: incoming, unowned, optionally with attempts reset.
    pub fn into_replayed(self, reset_attempts: bool) -> Envelope {
        let mut envelope = self.envelope;
        envelope.status = EnvelopeStatus::Incoming;
        envelope.owner_id = NodeId::ANY;
        envelope.scheduled_time = None;
        envelope.keep_until = None;
        if reset_attempts {
            envelope.attempts = 0;
        }
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_envelope_defaults() {
        let env = Envelope::new("OrderPlaced", b"{}".to_vec());
        assert_eq!(env.status, EnvelopeStatus::Incoming);
        assert!(env.owner_id.is_any());
        assert_eq!(env.attempts, 0);
        assert_eq!(env.scheduled_time, None);
    }

    #[test]
    fn unowned_incoming_is_rejected() {
        let env = Envelope::new("OrderPlaced", b"{}".to_vec());
        let err = env.validate_for_incoming().unwrap_err();
        assert!(matches!(err, DurableError::InvariantViolation { .. }));

        let owned = env.clone().owned_by(NodeId::new(4));
        owned.validate_for_incoming().unwrap();

        let scheduled = env.scheduled_for(Utc::now());
        scheduled.validate_for_incoming().unwrap();
    }

    #[test]
    fn scheduled_time_must_match_status() {
        let mut env = Envelope::new("A", Vec::new()).owned_by(NodeId::new(1));
        env.scheduled_time = Some(Utc::now());
        assert!(env.validate_for_incoming().is_err());
    }

    #[test]
    fn destination_sets_received_at() {
        let uri = EndpointUri::new("local://orders");
        let env = Envelope::new("A", Vec::new()).with_destination(uri.clone());
        assert_eq!(env.destination.as_ref(), Some(&uri));
        assert_eq!(env.received_at.as_ref(), Some(&uri));
        assert_eq!(env.destination_key(), "local://orders");
    }

    #[test]
    fn expiry_and_due() {
        let now = Utc::now();
        let env = Envelope::new("A", Vec::new())
            .with_deliver_by(now - chrono::Duration::seconds(1))
            .scheduled_for(now + chrono::Duration::seconds(5));
        assert!(env.is_expired(now));
        assert!(!env.is_due(now));
        assert!(env.is_due(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn status_parse_round_trips() {
        for status in [
            EnvelopeStatus::Incoming,
            EnvelopeStatus::Scheduled,
            EnvelopeStatus::Handled,
        ] {
            assert_eq!(EnvelopeStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(EnvelopeStatus::parse("Outgoing").is_err());
    }

    #[test]
    fn replayed_dead_letter_is_unowned_incoming() {
        let mut env = Envelope::new("A", Vec::new()).owned_by(NodeId::new(2));
        env.attempts = 5;
        let record = DeadLetterRecord {
            envelope: env,
            error: ErrorReport::new("Timeout", "handler timed out"),
            replayable: true,
            failed_at: Utc::now(),
            expires_at: None,
        };
        let replayed = record.clone().into_replayed(true);
        assert_eq!(replayed.status, EnvelopeStatus::Incoming);
        assert!(replayed.owner_id.is_any());
        assert_eq!(replayed.attempts, 0);
        assert_eq!(record.into_replayed(false).attempts, 5);
    }

    #[test]
    fn error_report_from_error_keeps_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = DurableError::PersistenceError {
            reason: "write failed".into(),
            source: Some(Box::new(io)),
        };
        let report = ErrorReport::from_error(&err);
        assert!(report.exception_type.ends_with("DurableError"));
        assert_eq!(report.exception_message, "persistence error: write failed");
        assert_eq!(report.exception_detail, "caused by: disk gone");
    }

    #[test]
    fn envelope_msgpack_roundtrip() {
        let env = Envelope::new("OrderPlaced", vec![1, 2, 3])
            .with_destination(EndpointUri::new("local://orders"))
            .with_tenant(TenantId::new("red"))
            .owned_by(NodeId::new(9));
        let bytes = rmp_serde::to_vec_named(&env).unwrap();
        let decoded: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, env);
    }
}
