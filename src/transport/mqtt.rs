//! rumqttc backed [`Transport`].
//!
//! `connect` builds an [`AsyncClient`] and spawns a task that drives its
//! [`EventLoop`]. The task translates protocol events into the three handler slots
//! and keeps polling after transient errors, which makes rumqttc reconnect on its
//! own. A refused connection or an unrecoverable error ends the task. A `connect`
//! that fails leaves no session behind, and dropping the transport cancels the
//! task.

use super::{
    ConnectOptions, Message, Transport, TransportError, TransportHandlers, CONNECTION_ACCEPTED,
    CONNECTION_LOST,
};
use crate::symbols::Qos;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const REQUEST_CAPACITY: usize = 64;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

struct Session {
    client: AsyncClient,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    operation_timeout: Duration,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct MqttTransport {
    client_id: String,
    reconnect_delay: Duration,
    handlers: Arc<TransportHandlers>,
    session: Mutex<Option<Session>>,
}

impl MqttTransport {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            reconnect_delay: Duration::from_secs(5),
            handlers: Arc::new(TransportHandlers::default()),
            session: Mutex::new(None),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self) -> Result<(AsyncClient, Duration), TransportError> {
        self.session()
            .as_ref()
            .filter(|session| !session.task.is_finished())
            .map(|session| (session.client.clone(), session.operation_timeout))
            .ok_or(TransportError::NotConnected)
    }

    fn mqtt_options(&self, options: &ConnectOptions) -> MqttOptions {
        let client_id = options
            .client_id
            .clone()
            .unwrap_or_else(|| self.client_id.clone());
        let mut mqtt_options = MqttOptions::new(client_id, options.host.clone(), options.port);
        mqtt_options.set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));
        if let Some(username) = &options.username {
            mqtt_options.set_credentials(
                username.clone(),
                options.password.clone().unwrap_or_default(),
            );
        }
        if let Some(will) = &options.last_will {
            mqtt_options.set_last_will(rumqttc::LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                to_rumqttc(will.qos),
                will.retain,
            ));
        }
        mqtt_options
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError> {
        if self.session().is_some() {
            return Err(TransportError::Connection("session already open".to_string()));
        }

        info!("Connecting to MQTT broker {}:{}", options.host, options.port);
        let (client, event_loop) = AsyncClient::new(self.mqtt_options(options), REQUEST_CAPACITY);
        let cancel = CancellationToken::new();
        let (first_tx, first_rx) = oneshot::channel();
        let task = tokio::spawn(drive_event_loop(
            event_loop,
            self.handlers.clone(),
            cancel.clone(),
            first_tx,
            self.reconnect_delay,
        ));

        *self.session() = Some(Session {
            client,
            cancel,
            task,
            operation_timeout: options.operation_timeout,
        });

        let outcome = match timeout(options.connect_timeout, first_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::Connection(
                "event loop ended before the broker answered".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout(format!(
                "no answer from {}:{} within {:?}",
                options.host, options.port, options.connect_timeout
            ))),
        };
        if outcome.is_err() && self.session().take().is_some() {
            debug!("Dropped the session of the failed connect");
        }
        outcome
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(mut session) = self.session().take() else {
            debug!("Disconnect without open session");
            return Ok(());
        };

        match timeout(session.operation_timeout, session.client.disconnect()).await {
            Ok(Ok(())) => {
                // let the event loop flush the DISCONNECT packet
                if timeout(session.operation_timeout, &mut session.task).await.is_err() {
                    warn!("Event loop did not finish after disconnect");
                }
            }
            Ok(Err(e)) => warn!("Error sending disconnect packet: {:?}", e),
            Err(_) => warn!("Disconnect timed out"),
        }
        session.cancel.cancel();
        info!("MQTT session closed");
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), TransportError> {
        let (client, operation_timeout) = self.client()?;
        trace!("Publishing {} bytes to {} (retain: {})", payload.len(), topic, retain);
        timeout(
            operation_timeout,
            client.publish(topic, to_rumqttc(qos), retain, payload),
        )
        .await
        .map_err(|_| TransportError::Timeout(format!("publish to {}", topic)))?
        .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        let (client, operation_timeout) = self.client()?;
        debug!("Subscribing to {}", topic);
        timeout(operation_timeout, client.subscribe(topic, to_rumqttc(qos)))
            .await
            .map_err(|_| TransportError::Timeout(format!("subscribe to {}", topic)))?
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let (client, operation_timeout) = self.client()?;
        debug!("Unsubscribing from {}", topic);
        timeout(operation_timeout, client.unsubscribe(topic))
            .await
            .map_err(|_| TransportError::Timeout(format!("unsubscribe from {}", topic)))?
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    fn handlers(&self) -> &TransportHandlers {
        &self.handlers
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    handlers: Arc<TransportHandlers>,
    cancel: CancellationToken,
    first_tx: oneshot::Sender<Result<(), TransportError>>,
    reconnect_delay: Duration,
) {
    let mut first_tx = Some(first_tx);
    let mut connected = false;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("MQTT event loop cancelled");
                break;
            }
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let code = reason_code(ack.code);
                if let Some(tx) = first_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                connected = ack.code == ConnectReturnCode::Success;
                if connected {
                    info!("Connection established successfully.");
                } else {
                    warn!("Broker answered ConnAck with reason code {}", code);
                }
                handlers.fire_connect(code);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let qos = from_rumqttc(publish.qos);
                handlers.fire_message(Message::new(
                    publish.topic.clone(),
                    publish.payload.to_vec(),
                    qos,
                    publish.retain,
                ));
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Disconnected by broker");
                if connected {
                    connected = false;
                    handlers.fire_disconnect(CONNECTION_LOST);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Disconnect sent, stopping event loop");
                if connected {
                    handlers.fire_disconnect(CONNECTION_ACCEPTED);
                }
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                let code = reason_code(code);
                error!("Broker refused the connection, reason code {}", code);
                if let Some(tx) = first_tx.take() {
                    let _ = tx.send(Err(TransportError::Refused(code)));
                }
                handlers.fire_connect(code);
                break;
            }
            Err(e) if is_fatal(&e) => {
                error!("MQTT connection failed for good: {}", e);
                if let Some(tx) = first_tx.take() {
                    let _ = tx.send(Err(TransportError::Connection(e.to_string())));
                }
                if connected {
                    handlers.fire_disconnect(CONNECTION_LOST);
                }
                break;
            }
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                if let Some(tx) = first_tx.take() {
                    let _ = tx.send(Err(TransportError::Connection(e.to_string())));
                }
                if connected {
                    connected = false;
                    handlers.fire_disconnect(CONNECTION_LOST);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {
                        debug!("Retrying MQTT connection");
                    }
                }
            }
        }
    }
}

/// Errors after which polling again cannot bring the session back.
fn is_fatal(error: &ConnectionError) -> bool {
    matches!(
        error,
        ConnectionError::RequestsDone
            | ConnectionError::NotConnAck(_)
            | ConnectionError::MqttState(_)
            | ConnectionError::Tls(_)
    )
}

fn reason_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
        #[allow(unreachable_patterns)]
        _ => CONNECTION_LOST,
    }
}

fn to_rumqttc(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_rumqttc(qos: QoS) -> Qos {
    match qos {
        QoS::AtMostOnce => Qos::AtMostOnce,
        QoS::AtLeastOnce => Qos::AtLeastOnce,
        QoS::ExactlyOnce => Qos::ExactlyOnce,
    }
}
