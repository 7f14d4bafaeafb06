//! Dead-letter query, summary, replay and discard.
//!
//! Bulk operations run as bounded batches: each store call touches at most
//! `dead_letter_batch_size` rows, and [`DeadLetterManager`] loops until a
//! batch comes back short.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::envelope::DeadLetterRecord;
use crate::envelope_store::MessageStore;
use crate::error::DurableError;
use crate::types::EndpointUri;

/// Structured dead-letter predicate. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    pub exception_type: Option<String>,
    pub message_type: Option<String>,
    pub received_at: Option<EndpointUri>,
    /// Inclusive lower bound on `failed_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `failed_at`.
    pub until: Option<DateTime<Utc>>,
}

impl DeadLetterFilter {
    pub fn matches(&self, record: &DeadLetterRecord) -> bool {
        self.exception_type
            .as_ref()
            .map_or(true, |t| *t == record.error.exception_type)
            && self
                .message_type
                .as_ref()
                .map_or(true, |t| *t == record.envelope.message_type)
            && self
                .received_at
                .as_ref()
                .map_or(true, |uri| record.envelope.received_at.as_ref() == Some(uri))
            && self.from.map_or(true, |from| record.failed_at >= from)
            && self.until.map_or(true, |until| record.failed_at < until)
    }
}

/// Which dead letters a bulk operation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterSelector {
    Filter(DeadLetterFilter),
    Ids(Vec<Uuid>),
}

impl DeadLetterSelector {
    pub fn matches(&self, record: &DeadLetterRecord) -> bool {
        match self {
            DeadLetterSelector::Filter(filter) => filter.matches(record),
            DeadLetterSelector::Ids(ids) => ids.contains(&record.id()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterQuery {
    pub filter: DeadLetterFilter,
    /// Zero-based page number.
    pub page: usize,
    pub page_size: usize,
}

impl Default for DeadLetterQuery {
    fn default() -> Self {
        Self {
            filter: DeadLetterFilter::default(),
            page: 0,
            page_size: 100,
        }
    }
}

impl DeadLetterQuery {
    pub fn offset(&self) -> usize {
        self.page.saturating_mul(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterPage {
    /// Ordered by `failed_at`, then id.
    pub records: Vec<DeadLetterRecord>,
    /// Matching records across all pages.
    pub total_count: u64,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterGrouping {
    MessageType,
    ExceptionType,
    Destination,
}

impl DeadLetterGrouping {
    pub fn key_of(&self, record: &DeadLetterRecord) -> String {
        match self {
            DeadLetterGrouping::MessageType => record.envelope.message_type.clone(),
            DeadLetterGrouping::ExceptionType => record.error.exception_type.clone(),
            DeadLetterGrouping::Destination => record
                .envelope
                .destination
                .as_ref()
                .map(|d| d.as_str().to_string())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterCount {
    pub key: String,
    pub count: u64,
}

/// Sort summary rows by count descending, then key.
pub(crate) fn sort_counts(counts: &mut [DeadLetterCount]) {
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn query_dead_letters(
        &self,
        query: &DeadLetterQuery,
    ) -> Result<DeadLetterPage, DurableError>;

    async fn summarize_dead_letters(
        &self,
        grouping: DeadLetterGrouping,
    ) -> Result<Vec<DeadLetterCount>, DurableError>;

    async fn load_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, DurableError>;

    /// Delete at most `limit` matching dead letters, returning how many were deleted.
    async fn discard_dead_letters(
        &self,
        selector: &DeadLetterSelector,
        limit: usize,
    ) -> Result<u64, DurableError>;

    /// Flag at most `limit` matching dead letters that are not yet replayable.
    async fn mark_dead_letters_replayable(
        &self,
        selector: &DeadLetterSelector,
        limit: usize,
    ) -> Result<u64, DurableError>;

    /// Move at most `limit` replayable dead letters back to incoming, unowned.
    async fn replay_dead_letters(
        &self,
        limit: usize,
        reset_attempts: bool,
    ) -> Result<u64, DurableError>;
}

/// Run the replay sweep until no replayable dead letters remain.
pub async fn sweep_replayable(
    store: &dyn MessageStore,
    batch_size: usize,
    reset_attempts: bool,
) -> Result<u64, DurableError> {
    let batch_size = batch_size.max(1);
    let mut total = 0;
    loop {
        let moved = store.replay_dead_letters(batch_size, reset_attempts).await?;
        total += moved;
        if moved < batch_size as u64 {
            return Ok(total);
        }
    }
}

/// Operator-facing dead-letter operations over one store.
pub struct DeadLetterManager {
    store: Arc<dyn MessageStore>,
    batch_size: usize,
    reset_attempts: bool,
}

impl DeadLetterManager {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        let settings = store.settings();
        let batch_size = settings.dead_letter_batch_size.max(1);
        let reset_attempts = settings.reset_attempts_on_replay;
        Self {
            store,
            batch_size,
            reset_attempts,
        }
    }

    pub async fn query(&self, query: &DeadLetterQuery) -> Result<DeadLetterPage, DurableError> {
        self.store.query_dead_letters(query).await
    }

    pub async fn summarize(
        &self,
        grouping: DeadLetterGrouping,
    ) -> Result<Vec<DeadLetterCount>, DurableError> {
        self.store.summarize_dead_letters(grouping).await
    }

    /// Permanently delete the selected dead letters.
    #[instrument(skip(self, selector), fields(store = %self.store.name()))]
    pub async fn discard(&self, selector: &DeadLetterSelector) -> Result<u64, DurableError> {
        let discarded = self.in_batches(BatchOp::Discard, selector).await?;
        tracing::info!(discarded, "discarded dead letters");
        Ok(discarded)
    }

    /// Flag the selected dead letters as replayable and move them back to
    /// incoming right away.
    #[instrument(skip(self, selector), fields(store = %self.store.name()))]
    pub async fn replay(&self, selector: &DeadLetterSelector) -> Result<u64, DurableError> {
        let flagged = self.in_batches(BatchOp::MarkReplayable, selector).await?;
        let replayed =
            sweep_replayable(self.store.as_ref(), self.batch_size, self.reset_attempts).await?;
        tracing::info!(flagged, replayed, "replayed dead letters");
        Ok(replayed)
    }

    /// Id lists are chunked; filters are repeated until a batch affects
    /// fewer rows than the limit.
    async fn in_batches(
        &self,
        op: BatchOp,
        selector: &DeadLetterSelector,
    ) -> Result<u64, DurableError> {
        let mut total = 0;
        match selector {
            DeadLetterSelector::Ids(ids) => {
                for chunk in ids.chunks(self.batch_size) {
                    let batch = DeadLetterSelector::Ids(chunk.to_vec());
                    total += self.apply(op, &batch, chunk.len()).await?;
                }
            }
            DeadLetterSelector::Filter(_) => loop {
                let affected = self.apply(op, selector, self.batch_size).await?;
                total += affected;
                if affected < self.batch_size as u64 {
                    break;
                }
            },
        }
        Ok(total)
    }

    async fn apply(
        &self,
        op: BatchOp,
        selector: &DeadLetterSelector,
        limit: usize,
    ) -> Result<u64, DurableError> {
        match op {
            BatchOp::Discard => self.store.discard_dead_letters(selector, limit).await,
            BatchOp::MarkReplayable => {
                self.store
                    .mark_dead_letters_replayable(selector, limit)
                    .await
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BatchOp {
    Discard,
    MarkReplayable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, ErrorReport};

    fn record(message_type: &str, exception_type: &str, failed_at: DateTime<Utc>) -> DeadLetterRecord {
        DeadLetterRecord {
            envelope: Envelope::new(message_type, Vec::new())
                .with_destination(EndpointUri::new("local://orders")),
            error: ErrorReport::new(exception_type, "boom"),
            replayable: false,
            failed_at,
            expires_at: None,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let r = record("OrderPlaced", "Timeout", Utc::now());
        assert!(DeadLetterFilter::default().matches(&r));
    }

    #[test]
    fn filter_matches_each_predicate() {
        let now = Utc::now();
        let r = record("OrderPlaced", "Timeout", now);

        let by_type = DeadLetterFilter {
            message_type: Some("OrderPlaced".into()),
            ..Default::default()
        };
        assert!(by_type.matches(&r));

        let wrong_exception = DeadLetterFilter {
            exception_type: Some("Other".into()),
            ..Default::default()
        };
        assert!(!wrong_exception.matches(&r));

        let received = DeadLetterFilter {
            received_at: Some(EndpointUri::new("local://orders")),
            ..Default::default()
        };
        assert!(received.matches(&r));

        let range = DeadLetterFilter {
            from: Some(now),
            until: Some(now + chrono::Duration::seconds(1)),
            ..Default::default()
        };
        assert!(range.matches(&r));

        let before = DeadLetterFilter {
            until: Some(now),
            ..Default::default()
        };
        assert!(!before.matches(&r), "until is exclusive");
    }

    #[test]
    fn selector_by_ids() {
        let r = record("A", "E", Utc::now());
        assert!(DeadLetterSelector::Ids(vec![r.id()]).matches(&r));
        assert!(!DeadLetterSelector::Ids(vec![Uuid::new_v4()]).matches(&r));
    }

    #[test]
    fn grouping_keys() {
        let r = record("OrderPlaced", "Timeout", Utc::now());
        assert_eq!(DeadLetterGrouping::MessageType.key_of(&r), "OrderPlaced");
        assert_eq!(DeadLetterGrouping::ExceptionType.key_of(&r), "Timeout");
        assert_eq!(DeadLetterGrouping::Destination.key_of(&r), "local://orders");
    }

    #[test]
    fn counts_sort_by_count_then_key() {
        let mut counts = vec![
            DeadLetterCount { key: "b".into(), count: 1 },
            DeadLetterCount { key: "a".into(), count: 1 },
            DeadLetterCount { key: "c".into(), count: 5 },
        ];
        sort_counts(&mut counts);
        let keys: Vec<&str> = counts.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn query_offset() {
        let query = DeadLetterQuery {
            page: 3,
            page_size: 20,
            ..Default::default()
        };
        assert_eq!(query.offset(), 60);
    }
}
