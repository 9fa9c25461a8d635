//! rumqttc-backed broker session
//!
//! Wraps an [`AsyncClient`] plus its event loop. The event loop is driven by
//! a spawned task that turns incoming publishes and connection transitions
//! into [`SessionEvent`]s on an mpsc channel; connection errors back off
//! exponentially and let the client reconnect on the next poll.

use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::SessionConfig;

use super::{qos_from_u8, qos_to_u8, Inbound, Session, SessionError, SessionEvent};

/// Capacity of the client request queue and of the outbound event channel
const CHANNEL_CAPACITY: usize = 1024;

/// MQTT broker session
pub struct MqttSession {
    name: String,
    client: AsyncClient,
    stop_tx: watch::Sender<bool>,
}

impl MqttSession {
    /// Connect to the broker described by `config`.
    ///
    /// Waits for the initial CONNACK so that unreachable brokers and
    /// rejected credentials surface here as startup errors rather than
    /// inside the reconnect loop. Returns the session handle and the
    /// receiver of its event stream.
    pub async fn connect(
        name: &str,
        config: &SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), SessionError> {
        let (host, port) = config.parse_address();
        let client_id = config.client_id();

        let mut options = MqttOptions::new(client_id.clone(), host, port);
        options.set_keep_alive(config.keepalive_duration());
        options.set_clean_session(config.clean_session);
        if let Some((username, password)) = config
            .credentials()
            .map_err(|e| SessionError::Other(format!("reading credential files: {}", e)))?
        {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);

        // Drive the event loop inline until the first CONNACK so connect
        // failures are fatal startup errors, per the session contract.
        let session_present = timeout(
            config.connect_timeout_duration(),
            Self::await_connack(&mut eventloop),
        )
        .await
        .map_err(|_| SessionError::Timeout)??;

        debug!(
            session = name,
            client_id = %client_id,
            session_present,
            "broker session established"
        );

        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(Self::drive(
            name.to_string(),
            eventloop,
            event_tx,
            stop_rx,
            config.reconnect_interval_duration(),
            config.max_reconnect_interval_duration(),
        ));

        Ok((
            Self {
                name: name.to_string(),
                client,
                stop_tx,
            },
            event_rx,
        ))
    }

    async fn await_connack(eventloop: &mut EventLoop) -> Result<bool, SessionError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Ok(ack.session_present);
                    }
                    return Err(SessionError::Rejected(format!(
                        "CONNACK refused: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => continue,
                Err(e) => return Err(SessionError::ConnectionLost(e.to_string())),
            }
        }
    }

    /// Event loop driver task. Runs until the session is ended or the
    /// event receiver goes away.
    async fn drive(
        name: String,
        mut eventloop: EventLoop,
        events: mpsc::Sender<SessionEvent>,
        mut stop: watch::Receiver<bool>,
        backoff_floor: Duration,
        backoff_ceiling: Duration,
    ) {
        let mut backoff = backoff_floor;
        loop {
            tokio::select! {
                _ = stop.changed() => break,

                result = eventloop.poll() => match result {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let message = Inbound {
                            topic: publish.topic.clone(),
                            payload: publish.payload,
                            qos: qos_to_u8(publish.qos),
                            retain: publish.retain,
                            dup: publish.dup,
                        };
                        if events.send(SessionEvent::Message(message)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        backoff = backoff_floor;
                        let event = SessionEvent::Connected {
                            session_present: ack.session_present,
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if *stop.borrow() {
                            break;
                        }
                        warn!(session = %name, error = %e, "connection error, backing off");
                        let _ = events.send(SessionEvent::Disconnected(e.to_string())).await;
                        tokio::time::sleep(backoff).await;
                        backoff = std::cmp::min(backoff * 2, backoff_ceiling);
                    }
                },
            }
        }
        debug!(session = %name, "session driver stopped");
    }

    fn map_client_error(e: rumqttc::ClientError) -> SessionError {
        SessionError::ConnectionLost(e.to_string())
    }
}

#[async_trait::async_trait]
impl Session for MqttSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, filter: &str, qos: u8) -> Result<(), SessionError> {
        let qos = qos_from_u8(qos).ok_or(SessionError::InvalidQos(qos))?;
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(Self::map_client_error)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), SessionError> {
        self.client
            .unsubscribe(filter)
            .await
            .map_err(Self::map_client_error)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: u8,
        retain: bool,
    ) -> Result<(), SessionError> {
        let qos = qos_from_u8(qos).ok_or(SessionError::InvalidQos(qos))?;
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(Self::map_client_error)
    }

    async fn end(&self) -> Result<(), SessionError> {
        // A disconnect on an already-closed session only fails because the
        // request channel is gone; that is fine during shutdown.
        if let Err(e) = self.client.disconnect().await {
            debug!(session = %self.name, error = %e, "disconnect on closed session");
        }
        let _ = self.stop_tx.send(true);
        Ok(())
    }
}
