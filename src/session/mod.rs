//! Broker Session Abstraction
//!
//! The forwarding pipeline talks to the two brokers through the [`Session`]
//! trait rather than a concrete client, so the per-message logic can be
//! exercised against in-memory fakes. [`MqttSession`] is the production
//! implementation backed by rumqttc.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;

mod mqtt;

pub use mqtt::MqttSession;

/// Error type for session operations
#[derive(Debug)]
pub enum SessionError {
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Broker rejected the operation (bad credentials, refused CONNECT)
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// QoS value outside 0..=2
    InvalidQos(u8),
    /// Other error
    Other(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            SessionError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            SessionError::Timeout => write!(f, "Operation timed out"),
            SessionError::InvalidQos(qos) => write!(f, "Invalid QoS level: {}", qos),
            SessionError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

/// One received publish event. Ephemeral: moved through the pipeline and
/// dropped once the forward has been dispatched.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Topic name assigned by the broker
    pub topic: String,
    /// Raw payload bytes (zero length permitted)
    pub payload: Bytes,
    /// Delivery QoS (0, 1, or 2)
    pub qos: u8,
    /// Retained flag as delivered
    pub retain: bool,
    /// Duplicate delivery flag; informational only
    pub dup: bool,
}

/// Lifecycle and message events emitted by a session
#[derive(Debug)]
pub enum SessionEvent {
    /// CONNACK received (initial connect or reconnect)
    Connected {
        /// Whether the broker resumed an existing session
        session_present: bool,
    },
    /// A publish arrived on a subscribed filter
    Message(Inbound),
    /// The connection dropped; the session will back off and reconnect
    Disconnected(String),
}

/// One broker session: subscribe/publish/unsubscribe plus teardown.
///
/// Implemented by [`MqttSession`] in production and by recording fakes in
/// tests. All operations resolve independently per call; `end` must be
/// safe to call even when the session is already closed.
#[async_trait]
pub trait Session: Send + Sync {
    /// Label for logs ("source" / "destination")
    fn name(&self) -> &str;

    /// Subscribe to a topic filter
    async fn subscribe(&self, filter: &str, qos: u8) -> Result<(), SessionError>;

    /// Remove a subscription
    async fn unsubscribe(&self, filter: &str) -> Result<(), SessionError>;

    /// Publish a message; resolves once handed to the session's send path
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: u8,
        retain: bool,
    ) -> Result<(), SessionError>;

    /// Close the session
    async fn end(&self) -> Result<(), SessionError>;
}

/// Convert a numeric QoS level into the client's enum
pub fn qos_from_u8(value: u8) -> Option<QoS> {
    match value {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Convert the client's QoS enum into its numeric level
pub fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}
