//! Relay Integration Tests
//!
//! Tests that drive the full forwarding pipeline end to end with fake
//! broker sessions and a real audit file.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::{mpsc, watch};

use relaymq::config::ForwardConfig;
use relaymq::{
    AuditRecord, AuditSink, Inbound, Metrics, PayloadEncoding, Relay, Session, SessionError,
    SessionEvent,
};

/// Broker session fake that records every call into a shared log
struct FakeBroker {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    publishes: Arc<Mutex<Vec<(String, Vec<u8>, u8, bool)>>>,
    fail_publish: AtomicBool,
    unsubscribe_calls: AtomicUsize,
}

impl FakeBroker {
    fn new(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            log,
            publishes: Arc::new(Mutex::new(Vec::new())),
            fail_publish: AtomicBool::new(false),
            unsubscribe_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Session for FakeBroker {
    fn name(&self) -> &str {
        self.name
    }

    async fn subscribe(&self, filter: &str, _qos: u8) -> Result<(), SessionError> {
        self.log.lock().push(format!("{}.subscribe({})", self.name, filter));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), SessionError> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("{}.unsubscribe({})", self.name, filter));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: u8,
        retain: bool,
    ) -> Result<(), SessionError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(SessionError::ConnectionLost("broker gone".to_string()));
        }
        self.publishes
            .lock()
            .push((topic.to_string(), payload.to_vec(), qos, retain));
        Ok(())
    }

    async fn end(&self) -> Result<(), SessionError> {
        self.log.lock().push(format!("{}.end", self.name));
        Ok(())
    }
}

fn inbound(topic: &str, payload: &[u8], qos: u8, retain: bool) -> Inbound {
    Inbound {
        topic: topic.to_string(),
        payload: Bytes::copy_from_slice(payload),
        qos,
        retain,
        dup: false,
    }
}

fn read_audit_lines(path: &std::path::Path) -> Vec<AuditRecord> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_forward_with_audit_end_to_end() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let source = FakeBroker::new("source", log.clone());
    let destination = FakeBroker::new("destination", log.clone());
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.ndjson");
    let sink = Arc::new(AuditSink::new(&audit_path));

    let config = ForwardConfig {
        topic_filter: "t/#".to_string(),
        subscribe_qos: 1,
        qos_max: 1,
        forward_retain: true,
    };
    let (tx, rx) = mpsc::channel(16);
    let mut relay = Relay::new(
        &config,
        source.clone(),
        destination.clone(),
        rx,
        Some(sink),
        Arc::new(Metrics::new()),
    );
    relay.start().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let result = relay.run(shutdown_rx).await;
        (relay, result)
    });

    // Retained QoS 2 message; the relay clamps QoS to 1, keeps retain
    tx.send(SessionEvent::Message(inbound("t/1", b"hi", 2, true)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    shutdown_tx.send(true).unwrap();
    let (mut relay, result) = handle.await.unwrap();
    result.unwrap();
    relay.shutdown().await;

    // Exactly one publish, with the policy applied
    let publishes = destination.publishes.lock();
    assert_eq!(*publishes, vec![("t/1".to_string(), b"hi".to_vec(), 1, true)]);
    drop(publishes);

    // The audit record reflects the incoming message, not the outgoing one
    let records = read_audit_lines(&audit_path);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].topic, "t/1");
    assert_eq!(records[0].incoming_qos, 2);
    assert!(records[0].incoming_retain);
    assert_eq!(records[0].payload_encoding, PayloadEncoding::Utf8);
    assert_eq!(records[0].payload, "hi");
}

#[tokio::test]
async fn test_binary_payload_survives_audit_round_trip() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let source = FakeBroker::new("source", log.clone());
    let destination = FakeBroker::new("destination", log.clone());
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.ndjson");
    let sink = Arc::new(AuditSink::new(&audit_path));

    let config = ForwardConfig::default();
    let (tx, rx) = mpsc::channel(16);
    let mut relay = Relay::new(
        &config,
        source,
        destination,
        rx,
        Some(sink),
        Arc::new(Metrics::new()),
    );
    relay.start().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let result = relay.run(shutdown_rx).await;
        (relay, result)
    });

    let binary = vec![0x00, 0xff, 0xfe, 0x01];
    tx.send(SessionEvent::Message(inbound("bin/1", &binary, 0, false)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    shutdown_tx.send(true).unwrap();
    let (mut relay, result) = handle.await.unwrap();
    result.unwrap();
    relay.shutdown().await;

    let records = read_audit_lines(&audit_path);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload_encoding, PayloadEncoding::Base64);
    assert_eq!(records[0].payload_bytes().unwrap(), binary);
}

#[tokio::test]
async fn test_failed_publish_drops_without_retry() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let source = FakeBroker::new("source", log.clone());
    let destination = FakeBroker::new("destination", log.clone());
    destination.fail_publish.store(true, Ordering::SeqCst);

    let config = ForwardConfig::default();
    let (tx, rx) = mpsc::channel(16);
    let mut relay = Relay::new(
        &config,
        source,
        destination.clone(),
        rx,
        None,
        Arc::new(Metrics::new()),
    );
    relay.start().await.unwrap();
    let counters = relay.counters();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let result = relay.run(shutdown_rx).await;
        (relay, result)
    });

    for i in 0..3 {
        tx.send(SessionEvent::Message(inbound(
            "t/1",
            format!("m{}", i).as_bytes(),
            1,
            false,
        )))
        .await
        .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    shutdown_tx.send(true).unwrap();
    let (mut relay, result) = handle.await.unwrap();
    result.unwrap();
    relay.shutdown().await;

    assert!(destination.publishes.lock().is_empty());
    assert_eq!(counters.snapshot(), (0, 3));
}

#[tokio::test]
async fn test_graceful_shutdown_ordering() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let source = FakeBroker::new("source", log.clone());
    let destination = FakeBroker::new("destination", log.clone());
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.ndjson");
    let sink = Arc::new(AuditSink::new(&audit_path));

    let config = ForwardConfig {
        topic_filter: "t/#".to_string(),
        ..Default::default()
    };
    let (tx, rx) = mpsc::channel(16);
    let mut relay = Relay::new(
        &config,
        source.clone(),
        destination,
        rx,
        Some(sink.clone()),
        Arc::new(Metrics::new()),
    );
    relay.start().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let result = relay.run(shutdown_rx).await;
        (relay, result)
    });

    tx.send(SessionEvent::Message(inbound("t/1", b"hi", 0, false)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    shutdown_tx.send(true).unwrap();
    let (mut relay, result) = handle.await.unwrap();
    result.unwrap();
    relay.shutdown().await;
    // A second shutdown is a no-op: the subscription is only removed once
    relay.shutdown().await;

    assert_eq!(
        *log.lock(),
        vec![
            "source.subscribe(t/#)".to_string(),
            "source.unsubscribe(t/#)".to_string(),
            "source.end".to_string(),
            "destination.end".to_string(),
            "source.end".to_string(),
            "destination.end".to_string(),
        ]
    );
    assert_eq!(source.unsubscribe_calls.load(Ordering::SeqCst), 1);

    // The audit file was flushed before close and is readable afterwards
    let records = read_audit_lines(&audit_path);
    assert_eq!(records.len(), 1);
}
