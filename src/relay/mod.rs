//! Forwarding Pipeline
//!
//! Subscribes to a topic filter on the source session and republishes every
//! inbound message to the destination session under its original topic,
//! after applying the forwarding policy (QoS clamp, retained-flag
//! suppression) and optionally appending an audit record.
//!
//! Delivery contract: at-most-one-attempt, no redelivery. A failed
//! destination publish is counted as dropped and the message is gone; the
//! next inbound message is processed independently. Publishes are initiated
//! in arrival order but their completion order is unconstrained; handling
//! an inbound message never waits for a previous publish to finish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditRecord, AuditSink};
use crate::config::ForwardConfig;
use crate::metrics::Metrics;
use crate::session::{Inbound, Session, SessionError, SessionEvent};

mod policy;


pub use policy::ForwardPolicy;

/// Fixed interval between throughput reports; counters reset on every report
pub const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Fatal pipeline errors, surfaced to the process boundary
#[derive(Debug)]
pub enum RelayError {
    /// The source subscription could not be established
    Subscribe(SessionError),
    /// The source session's event stream ended
    SourceClosed,
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Subscribe(e) => write!(f, "Subscribe failed: {}", e),
            RelayError::SourceClosed => write!(f, "Source session event stream closed"),
        }
    }
}

impl std::error::Error for RelayError {}

/// Rolling forwarded/dropped counters, reset on every report interval.
///
/// Mutated from the spawned publish tasks, so the fields are atomics; the
/// Prometheus counters carry the cumulative totals separately.
#[derive(Debug, Default)]
pub struct Counters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Current (forwarded, dropped) without resetting
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.forwarded.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }

    /// Take and reset both counters
    pub fn take(&self) -> (u64, u64) {
        (
            self.forwarded.swap(0, Ordering::Relaxed),
            self.dropped.swap(0, Ordering::Relaxed),
        )
    }
}

/// The forwarding pipeline
pub struct Relay {
    source: Arc<dyn Session>,
    destination: Arc<dyn Session>,
    events: mpsc::Receiver<SessionEvent>,
    policy: ForwardPolicy,
    filter: String,
    subscribe_qos: u8,
    audit: Option<Arc<AuditSink>>,
    counters: Arc<Counters>,
    metrics: Arc<Metrics>,
    subscribed: bool,
    unsubscribed: bool,
}

impl Relay {
    /// Wire up the pipeline. `events` is the source session's event stream.
    pub fn new(
        config: &ForwardConfig,
        source: Arc<dyn Session>,
        destination: Arc<dyn Session>,
        events: mpsc::Receiver<SessionEvent>,
        audit: Option<Arc<AuditSink>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            destination,
            events,
            policy: ForwardPolicy::new(config),
            filter: config.topic_filter.clone(),
            subscribe_qos: config.subscribe_qos,
            audit,
            counters: Arc::new(Counters::new()),
            metrics,
            subscribed: false,
            unsubscribed: false,
        }
    }

    /// The rolling counters, shared with the publish tasks
    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// Subscribe the source session to the topic filter.
    ///
    /// Failure here is fatal: the pipeline cannot operate without its
    /// subscription, so the error propagates to abort startup.
    pub async fn start(&mut self) -> Result<(), RelayError> {
        self.source
            .subscribe(&self.filter, self.subscribe_qos)
            .await
            .map_err(RelayError::Subscribe)?;
        self.subscribed = true;
        info!(
            filter = %self.filter,
            qos = self.subscribe_qos,
            qos_max = self.policy.qos_max,
            forward_retain = self.policy.forward_retain,
            audit = self.audit.is_some(),
            "relay subscribed"
        );
        Ok(())
    }

    /// Run the event loop until shutdown is signalled or the source event
    /// stream closes.
    ///
    /// Inbound messages are handled one at a time in arrival order; each
    /// destination publish runs in its own task so handling never blocks on
    /// a previous publish. Counters are reported and reset every
    /// [`REPORT_INTERVAL`].
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        let mut report = tokio::time::interval(REPORT_INTERVAL);
        // interval fires immediately by default; skip the startup tick
        report.reset();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as a shutdown request
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("relay shutdown requested");
                        break;
                    }
                }

                _ = report.tick() => self.report(),

                event = self.events.recv() => match event {
                    Some(SessionEvent::Message(message)) => self.handle_message(message),
                    Some(SessionEvent::Connected { session_present }) => {
                        self.metrics.set_source_connected(true);
                        // Clean-session reconnects lose broker-side state,
                        // so renew the subscription on every CONNACK
                        if self.subscribed && !self.unsubscribed {
                            debug!(session_present, "source reconnected, renewing subscription");
                            if let Err(e) = self
                                .source
                                .subscribe(&self.filter, self.subscribe_qos)
                                .await
                            {
                                error!(filter = %self.filter, error = %e, "re-subscribe failed");
                            }
                        }
                    }
                    Some(SessionEvent::Disconnected(reason)) => {
                        self.metrics.set_source_connected(false);
                        warn!(%reason, "source session offline");
                    }
                    None => {
                        self.report();
                        return Err(RelayError::SourceClosed);
                    }
                },
            }
        }

        self.report();
        Ok(())
    }

    /// Process one inbound message: evaluate the policy, append the audit
    /// record, dispatch the destination publish. Never blocks on the
    /// publish outcome.
    fn handle_message(&self, message: Inbound) {
        let (out_qos, out_retain) = self.policy.evaluate(message.qos, message.retain);

        // Audit failures are logged and swallowed; they must never touch
        // the publish path.
        if let Some(sink) = &self.audit {
            let record = AuditRecord::from_message(Utc::now(), &message);
            match sink.record(&record) {
                Ok(true) => self.metrics.audit_record_written(),
                Ok(false) => {}
                Err(e) => {
                    self.metrics.audit_record_failed();
                    warn!(topic = %message.topic, error = %e, "audit record lost");
                }
            }
        }

        let destination = self.destination.clone();
        let counters = self.counters.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let outcome = destination
                .publish(&message.topic, message.payload, out_qos, out_retain)
                .await;
            // Inspected exactly once: success counts as forwarded, failure
            // as dropped. No retry.
            match outcome {
                Ok(()) => {
                    counters.add_forwarded();
                    metrics.message_forwarded();
                }
                Err(e) => {
                    counters.add_dropped();
                    metrics.message_dropped();
                    warn!(
                        topic = %message.topic,
                        qos = out_qos,
                        retain = out_retain,
                        error = %e,
                        "destination publish failed, message dropped"
                    );
                }
            }
        });
    }

    /// Emit the rolling counters and reset them
    fn report(&self) {
        let (forwarded, dropped) = self.counters.take();
        info!(forwarded, dropped, "relay throughput");
    }

    /// Unsubscribe the source topic filter, exactly once.
    ///
    /// An unsubscribe failure is logged and does not block the rest of the
    /// shutdown sequence.
    pub async fn stop(&mut self) {
        if !self.subscribed || self.unsubscribed {
            return;
        }
        self.unsubscribed = true;
        if let Err(e) = self.source.unsubscribe(&self.filter).await {
            warn!(filter = %self.filter, error = %e, "unsubscribe failed during shutdown");
        }
    }

    /// Best-effort teardown, in order: unsubscribe, close the source
    /// session, close the destination session, flush and close the audit
    /// sink. Each step is attempted even if an earlier one failed.
    pub async fn shutdown(&mut self) {
        self.stop().await;
        if let Err(e) = self.source.end().await {
            warn!(error = %e, "error closing source session");
        }
        if let Err(e) = self.destination.end().await {
            warn!(error = %e, "error closing destination session");
        }
        if let Some(sink) = &self.audit {
            sink.close();
        }
        debug!("relay shut down");
    }
}
