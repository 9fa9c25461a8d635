//! Prometheus metrics for RelayMQ
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability,
//! alongside the /health and /ready probes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use prometheus::{IntCounter, IntGauge, Opts, Registry};

mod server;

pub use server::HealthServer;

/// All RelayMQ metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Forwarding metrics (cumulative since startup, unlike the windowed
    // counters reported in the periodic log line)
    pub messages_forwarded_total: IntCounter,
    pub messages_dropped_total: IntCounter,

    // Audit metrics
    pub audit_records_total: IntCounter,
    pub audit_errors_total: IntCounter,

    // Session state
    pub source_connected: IntGauge,
    pub destination_connected: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_forwarded_total = IntCounter::with_opts(Opts::new(
            "relaymq_messages_forwarded_total",
            "Total messages forwarded to the destination broker since startup",
        ))
        .unwrap();

        let messages_dropped_total = IntCounter::with_opts(Opts::new(
            "relaymq_messages_dropped_total",
            "Total messages dropped after a failed publish since startup",
        ))
        .unwrap();

        let audit_records_total = IntCounter::with_opts(Opts::new(
            "relaymq_audit_records_total",
            "Total audit records written",
        ))
        .unwrap();

        let audit_errors_total = IntCounter::with_opts(Opts::new(
            "relaymq_audit_errors_total",
            "Total audit record write failures",
        ))
        .unwrap();

        let source_connected = IntGauge::with_opts(Opts::new(
            "relaymq_source_connected",
            "Whether the source broker session is connected (1) or not (0)",
        ))
        .unwrap();

        let destination_connected = IntGauge::with_opts(Opts::new(
            "relaymq_destination_connected",
            "Whether the destination broker session is connected (1) or not (0)",
        ))
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(messages_forwarded_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_dropped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(audit_records_total.clone()))
            .unwrap();
        registry
            .register(Box::new(audit_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(source_connected.clone()))
            .unwrap();
        registry
            .register(Box::new(destination_connected.clone()))
            .unwrap();

        Metrics {
            registry,
            messages_forwarded_total,
            messages_dropped_total,
            audit_records_total,
            audit_errors_total,
            source_connected,
            destination_connected,
        }
    }

    // Helper methods for common operations

    pub fn message_forwarded(&self) {
        self.messages_forwarded_total.inc();
    }

    pub fn message_dropped(&self) {
        self.messages_dropped_total.inc();
    }

    pub fn audit_record_written(&self) {
        self.audit_records_total.inc();
    }

    pub fn audit_record_failed(&self) {
        self.audit_errors_total.inc();
    }

    pub fn set_source_connected(&self, connected: bool) {
        self.source_connected.set(connected as i64);
    }

    pub fn set_destination_connected(&self, connected: bool) {
        self.destination_connected.set(connected as i64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared readiness flag for the /ready probe.
///
/// Set once the relay has subscribed and is forwarding, cleared when
/// shutdown begins so load balancers stop routing before teardown.
#[derive(Clone, Default)]
pub struct ReadyFlag(Arc<AtomicBool>);

impl ReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
