//! RelayMQ - MQTT broker-to-broker message relay
//!
//! Relays messages published on a topic filter of one broker session (the
//! source) onto a second, independent broker session (the destination),
//! applying a per-message forwarding policy (QoS ceiling, retained-flag
//! suppression) and optional append-only audit logging of every forwarded
//! message. Useful for bridging broker deployments that cannot trust each
//! other directly.

pub mod audit;
pub mod config;
pub mod metrics;
pub mod relay;
pub mod session;

pub use audit::{AuditRecord, AuditSink, PayloadEncoding};
pub use config::Config;
pub use metrics::{HealthServer, Metrics, ReadyFlag};
pub use relay::{ForwardPolicy, Relay, RelayError};
pub use session::{Inbound, MqttSession, Session, SessionError, SessionEvent};
