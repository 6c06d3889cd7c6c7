//! Metrics (SPEC_FULL §10.6): counters for the relay and worker, exposed at
//! `/metrics` in Prometheus text exposition format.
//!
//! Grounded on the teacher's own `src/metrics.rs` (`Metrics::new` building an
//! `IntCounterVec`/`Registry` set and registering each, `render` encoding via
//! `TextEncoder`), the same shape `modules/payments` and `modules/gl` pull
//! `prometheus` in for. A plain `AtomicU64` tally would duplicate work
//! `prometheus` already does and give up the standard `/metrics` exposition
//! format the teacher's own scrape endpoint uses.

use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    pub outbox_claims_total: IntCounter,
    pub outbox_published_total: IntCounter,
    pub outbox_publish_failures_total: IntCounter,
}

impl RelayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let outbox_claims_total = IntCounter::with_opts(Opts::new(
            "outbox_claims_total",
            "Outbox rows claimed by the relay (sweep + fast path)",
        ))
        .expect("metric");
        let outbox_published_total = IntCounter::with_opts(Opts::new(
            "outbox_published_total",
            "Outbox rows successfully published",
        ))
        .expect("metric");
        let outbox_publish_failures_total = IntCounter::with_opts(Opts::new(
            "outbox_publish_failures_total",
            "Outbox publish attempts that failed and were rescheduled with backoff",
        ))
        .expect("metric");

        registry.register(Box::new(outbox_claims_total.clone())).unwrap();
        registry.register(Box::new(outbox_published_total.clone())).unwrap();
        registry
            .register(Box::new(outbox_publish_failures_total.clone()))
            .unwrap();

        Self {
            registry,
            outbox_claims_total,
            outbox_published_total,
            outbox_publish_failures_total,
        }
    }

    pub fn record_claims(&self, n: usize) {
        self.outbox_claims_total.inc_by(n as u64);
    }

    pub fn record_published(&self) {
        self.outbox_published_total.inc();
    }

    pub fn record_publish_failure(&self) {
        self.outbox_publish_failures_total.inc();
    }

    pub fn render(&self) -> Result<String, String> {
        render(&self.registry)
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct WorkerMetrics {
    registry: Registry,
    pub commands_handled_total: IntCounter,
    pub commands_succeeded_total: IntCounter,
    pub commands_permanently_failed_total: IntCounter,
    pub commands_transiently_failed_total: IntCounter,
    pub leases_reclaimed_total: IntCounter,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let commands_handled_total = IntCounter::with_opts(Opts::new(
            "commands_handled_total",
            "Command deliveries the worker runtime accepted past the inbox dedup check",
        ))
        .expect("metric");
        let commands_succeeded_total = IntCounter::with_opts(Opts::new(
            "commands_succeeded_total",
            "Commands whose handler returned successfully",
        ))
        .expect("metric");
        let commands_permanently_failed_total = IntCounter::with_opts(Opts::new(
            "commands_permanently_failed_total",
            "Commands that reached FAILED (permanent failure or exhausted transient retries)",
        ))
        .expect("metric");
        let commands_transiently_failed_total = IntCounter::with_opts(Opts::new(
            "commands_transiently_failed_total",
            "Transient handler failures that were rescheduled",
        ))
        .expect("metric");
        let leases_reclaimed_total = IntCounter::with_opts(Opts::new(
            "leases_reclaimed_total",
            "Processing leases reclaimed after expiry",
        ))
        .expect("metric");

        registry.register(Box::new(commands_handled_total.clone())).unwrap();
        registry
            .register(Box::new(commands_succeeded_total.clone()))
            .unwrap();
        registry
            .register(Box::new(commands_permanently_failed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(commands_transiently_failed_total.clone()))
            .unwrap();
        registry.register(Box::new(leases_reclaimed_total.clone())).unwrap();

        Self {
            registry,
            commands_handled_total,
            commands_succeeded_total,
            commands_permanently_failed_total,
            commands_transiently_failed_total,
            leases_reclaimed_total,
        }
    }

    pub fn record_handled(&self) {
        self.commands_handled_total.inc();
    }

    pub fn record_succeeded(&self) {
        self.commands_succeeded_total.inc();
    }

    pub fn record_permanent_failure(&self) {
        self.commands_permanently_failed_total.inc();
    }

    pub fn record_transient_failure(&self) {
        self.commands_transiently_failed_total.inc();
    }

    pub fn record_lease_reclaimed(&self) {
        self.leases_reclaimed_total.inc();
    }

    pub fn render(&self) -> Result<String, String> {
        render(&self.registry)
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn render(registry: &Registry) -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buf = Vec::new();
    encoder.encode(&metric_families, &mut buf).map_err(|e| e.to_string())?;
    String::from_utf8(buf).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_metrics_accumulate_and_render() {
        let metrics = RelayMetrics::new();
        metrics.record_claims(3);
        metrics.record_published();
        metrics.record_publish_failure();

        assert_eq!(metrics.outbox_claims_total.get(), 3);
        assert_eq!(metrics.outbox_published_total.get(), 1);
        assert_eq!(metrics.outbox_publish_failures_total.get(), 1);

        let rendered = metrics.render().expect("render should succeed");
        assert!(rendered.contains("outbox_claims_total 3"));
        assert!(rendered.contains("outbox_published_total 1"));
    }

    #[test]
    fn worker_metrics_accumulate_and_render() {
        let metrics = WorkerMetrics::new();
        metrics.record_handled();
        metrics.record_succeeded();
        metrics.record_transient_failure();

        assert_eq!(metrics.commands_handled_total.get(), 1);
        assert_eq!(metrics.commands_succeeded_total.get(), 1);
        assert_eq!(metrics.commands_transiently_failed_total.get(), 1);

        let rendered = metrics.render().expect("render should succeed");
        assert!(rendered.contains("commands_handled_total 1"));
    }
}
