use crate::error::DurableError;
use std::time::Duration;

/// How durability agents are placed across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Agents are distributed so each runs on exactly one live node.
    #[default]
    Balanced,
    /// Every agent runs on this node. For single-process deployments and tests.
    Solo,
}

/// Configuration for envelope durability: polling cadences, retention and batching.
#[derive(Debug, Clone)]
pub struct DurabilitySettings {
    /// Database schema (or etcd sub-prefix) holding the envelope tables. Default: "courier".
    pub schema_name: String,
    /// Agent placement mode. Default: Balanced.
    pub mode: DurabilityMode,
    /// Delay before the first scheduled-job dispatch. Default: 0s.
    pub scheduled_job_first_execution: Duration,
    /// Period of scheduled-job dispatch. Default: 5s.
    pub scheduled_job_polling_time: Duration,
    /// Maximum scheduled envelopes moved to incoming per tick. Default: 500.
    pub scheduled_job_batch_size: usize,
    /// Upper bound of the random delay added to every first execution. Default: 2s.
    pub first_execution_jitter: Duration,
    /// Delay before the first recoverable incoming/outgoing check. Default: 1s.
    pub recovery_first_execution: Duration,
    /// Period of recoverable incoming/outgoing checks and the replay sweep. Default: 5s.
    pub recovery_polling_time: Duration,
    /// Page size when claiming recoverable envelopes. Default: 100.
    pub recovery_batch_size: usize,
    /// Period of the expired-envelope sweep. Default: 30s.
    pub expiration_polling_time: Duration,
    /// Period of dormant-node reassignment on the leader. Default: 5s.
    pub node_reassignment_polling_time: Duration,
    /// Period of this node's heartbeat. Default: 10s.
    pub heartbeat_interval: Duration,
    /// A node whose last heartbeat is older than this is dormant. Default: 60s.
    pub stale_node_timeout: Duration,
    /// Whether dead letters expire. Default: false.
    pub dead_letter_queue_expiration_enabled: bool,
    /// Retention of dead letters when expiration is enabled. Default: 10 days.
    pub dead_letter_queue_expiration: Duration,
    /// Retention of handled incoming envelopes before the sweep removes them. Default: 5m.
    pub keep_after_message_handling: Duration,
    /// Maximum rows touched by one dead-letter discard/replay statement. Default: 500.
    pub dead_letter_batch_size: usize,
    /// Reset `attempts` to zero when a dead letter is replayed. Default: true.
    pub reset_attempts_on_replay: bool,
}

impl DurabilitySettings {
    /// Validate configuration values.
    ///
    /// Checks:
    /// - `schema_name` is a plain SQL identifier (it is spliced into DDL)
    /// - batch sizes are non-zero
    /// - polling periods and retention windows are non-zero
    /// - `stale_node_timeout` exceeds `heartbeat_interval`, otherwise live nodes look dormant
    pub fn validate(&self) -> Result<(), DurableError> {
        if !is_valid_identifier(&self.schema_name) {
            return Err(DurableError::InvalidConfig {
                reason: format!(
                    "schema_name must match [a-z_][a-z0-9_]* and be at most 63 characters, got '{}'",
                    self.schema_name
                ),
            });
        }
        if self.scheduled_job_batch_size == 0 {
            return Err(DurableError::InvalidConfig {
                reason: "scheduled_job_batch_size must be >= 1".to_string(),
            });
        }
        if self.recovery_batch_size == 0 {
            return Err(DurableError::InvalidConfig {
                reason: "recovery_batch_size must be >= 1".to_string(),
            });
        }
        if self.dead_letter_batch_size == 0 {
            return Err(DurableError::InvalidConfig {
                reason: "dead_letter_batch_size must be >= 1".to_string(),
            });
        }
        let periods = [
            ("scheduled_job_polling_time", self.scheduled_job_polling_time),
            ("recovery_polling_time", self.recovery_polling_time),
            ("expiration_polling_time", self.expiration_polling_time),
            (
                "node_reassignment_polling_time",
                self.node_reassignment_polling_time,
            ),
            ("heartbeat_interval", self.heartbeat_interval),
            ("stale_node_timeout", self.stale_node_timeout),
            (
                "keep_after_message_handling",
                self.keep_after_message_handling,
            ),
            (
                "dead_letter_queue_expiration",
                self.dead_letter_queue_expiration,
            ),
        ];
        for (name, value) in periods {
            if value.is_zero() {
                return Err(DurableError::InvalidConfig {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        if self.stale_node_timeout <= self.heartbeat_interval {
            return Err(DurableError::InvalidConfig {
                reason: format!(
                    "stale_node_timeout ({:?}) must be greater than heartbeat_interval ({:?})",
                    self.stale_node_timeout, self.heartbeat_interval
                ),
            });
        }
        Ok(())
    }

    /// `keep_after_message_handling` as a chrono duration for timestamp arithmetic.
    pub fn keep_after_handling(&self) -> chrono::Duration {
        to_chrono(self.keep_after_message_handling)
    }

    /// Expiry stamped on new dead letters, if expiration is enabled.
    pub fn dead_letter_expires_at(
        &self,
        failed_at: chrono::DateTime<chrono::Utc>,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        self.dead_letter_queue_expiration_enabled
            .then(|| failed_at + to_chrono(self.dead_letter_queue_expiration))
    }
}

impl Default for DurabilitySettings {
    fn default() -> Self {
        Self {
            schema_name: "courier".to_string(),
            mode: DurabilityMode::Balanced,
            scheduled_job_first_execution: Duration::ZERO,
            scheduled_job_polling_time: Duration::from_secs(5),
            scheduled_job_batch_size: 500,
            first_execution_jitter: Duration::from_secs(2),
            recovery_first_execution: Duration::from_secs(1),
            recovery_polling_time: Duration::from_secs(5),
            recovery_batch_size: 100,
            expiration_polling_time: Duration::from_secs(30),
            node_reassignment_polling_time: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            stale_node_timeout: Duration::from_secs(60),
            dead_letter_queue_expiration_enabled: false,
            dead_letter_queue_expiration: Duration::from_secs(10 * 24 * 60 * 60),
            keep_after_message_handling: Duration::from_secs(5 * 60),
            dead_letter_batch_size: 500,
            reset_attempts_on_replay: true,
        }
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Lowercase SQL identifier check used for schema names.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 63
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
