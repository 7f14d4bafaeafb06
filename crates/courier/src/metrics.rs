use prometheus::{IntGaugeVec, Opts, Registry};

use crate::envelope_store::PersistedCounts;

/// Prometheus gauges for persisted envelope counts, labelled by store name.
pub struct DurabilityMetrics {
    /// Incoming envelopes waiting for or in dispatch.
    pub incoming: IntGaugeVec,
    /// Envelopes scheduled for later execution.
    pub scheduled: IntGaugeVec,
    /// Handled envelopes retained for idempotency checks.
    pub handled: IntGaugeVec,
    pub outgoing: IntGaugeVec,
    pub dead_letters: IntGaugeVec,
}

fn gauge(name: &str, help: &str) -> Result<IntGaugeVec, prometheus::Error> {
    IntGaugeVec::new(Opts::new(name, help), &["store"])
}

impl DurabilityMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.incoming.clone()))?;
        registry.register(Box::new(metrics.scheduled.clone()))?;
        registry.register(Box::new(metrics.handled.clone()))?;
        registry.register(Box::new(metrics.outgoing.clone()))?;
        registry.register(Box::new(metrics.dead_letters.clone()))?;
        Ok(metrics)
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self::build().expect("valid metric names")
    }

    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            incoming: gauge("courier_incoming_envelopes", "Persisted incoming envelopes")?,
            scheduled: gauge("courier_scheduled_envelopes", "Persisted scheduled envelopes")?,
            handled: gauge(
                "courier_handled_envelopes",
                "Handled envelopes kept for idempotency",
            )?,
            outgoing: gauge("courier_outgoing_envelopes", "Persisted outgoing envelopes")?,
            dead_letters: gauge("courier_dead_letters", "Persisted dead letters")?,
        })
    }

    pub fn record(&self, store: &str, counts: &PersistedCounts) {
        self.incoming.with_label_values(&[store]).set(counts.incoming);
        self.scheduled.with_label_values(&[store]).set(counts.scheduled);
        self.handled.with_label_values(&[store]).set(counts.handled);
        self.outgoing.with_label_values(&[store]).set(counts.outgoing);
        self.dead_letters
            .with_label_values(&[store])
            .set(counts.dead_letters);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_successfully() {
        let registry = Registry::new();
        let metrics = DurabilityMetrics::new(&registry).unwrap();
        metrics.record("main", &PersistedCounts::default());
        let families = registry.gather();
        assert_eq!(families.len(), 5);
    }

    #[test]
    fn record_sets_per_store_values() {
        let metrics = DurabilityMetrics::unregistered();
        let counts = PersistedCounts {
            incoming: 3,
            scheduled: 2,
            handled: 7,
            outgoing: 1,
            dead_letters: 4,
        };
        metrics.record("main", &counts);
        metrics.record("tenant_red", &PersistedCounts::default());

        assert_eq!(metrics.incoming.with_label_values(&["main"]).get(), 3);
        assert_eq!(metrics.handled.with_label_values(&["main"]).get(), 7);
        assert_eq!(metrics.dead_letters.with_label_values(&["main"]).get(), 4);
        assert_eq!(metrics.incoming.with_label_values(&["tenant_red"]).get(), 0);
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        let _first = DurabilityMetrics::new(&registry).unwrap();
        assert!(DurabilityMetrics::new(&registry).is_err());
    }
}
