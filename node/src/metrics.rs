//! Prometheus metrics for the payments core.
//!
//! [`PaymentsMetrics`] owns a dedicated [`Registry`] that an embedding
//! node can encode into the Prometheus text exposition format.

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, IntCounter,
    IntGauge, Opts, Registry, TextEncoder,
};

pub struct PaymentsMetrics {
    /// The Prometheus registry that owns every metric below.
    pub registry: Registry,

    // ── Counters ────────────────────────────────────────────────────────
    /// Promises received from hermes and stored.
    pub promises_received: IntCounter,
    /// Promise requests that ended in an error reported to the submitter.
    pub promise_errors: IntCounter,
    /// R values recovered from hermes and revealed again.
    pub r_recoveries: IntCounter,
    pub settlements_completed: IntCounter,
    /// Settlements that failed before or while waiting for the chain.
    pub settlement_failures: IntCounter,
    pub settlement_timeouts: IntCounter,
    /// Consumer balance cache writes.
    pub balance_updates: IntCounter,

    // ── Gauges ──────────────────────────────────────────────────────────
    /// Promise requests submitted but not yet picked up by the worker.
    pub queued_promise_requests: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    register_int_counter_with_registry!(Opts::new(name, help), registry)
}

impl PaymentsMetrics {
    /// Create a fresh set of metrics, all registered under a new [`Registry`].
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let promises_received = counter(
            &registry,
            "tollgate_promises_received_total",
            "Hermes promises received and stored",
        )?;
        let promise_errors = counter(
            &registry,
            "tollgate_promise_errors_total",
            "Promise requests that failed",
        )?;
        let r_recoveries = counter(
            &registry,
            "tollgate_r_recoveries_total",
            "R values recovered from hermes",
        )?;
        let settlements_completed = counter(
            &registry,
            "tollgate_settlements_completed_total",
            "Settlements observed on chain",
        )?;
        let settlement_failures = counter(
            &registry,
            "tollgate_settlement_failures_total",
            "Settlements that failed",
        )?;
        let settlement_timeouts = counter(
            &registry,
            "tollgate_settlement_timeouts_total",
            "Settlements not observed on chain in time",
        )?;
        let balance_updates = counter(
            &registry,
            "tollgate_balance_updates_total",
            "Consumer balance cache updates",
        )?;

        let queued_promise_requests = register_int_gauge_with_registry!(
            Opts::new(
                "tollgate_queued_promise_requests",
                "Promise requests waiting for the worker"
            ),
            registry
        )?;

        Ok(Self {
            registry,
            promises_received,
            promise_errors,
            r_recoveries,
            settlements_completed,
            settlement_failures,
            settlement_timeouts,
            balance_updates,
            queued_promise_requests,
        })
    }

    /// Encode every metric in the text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
