//! # Transport Adapter
//!
//! The boundary between a device and the MQTT broker. A device only needs five
//! operations (`connect`, `disconnect`, `publish`, `subscribe`, `unsubscribe`) and
//! three event callbacks (`on_connect`, `on_disconnect`, `on_message`); everything
//! protocol related (framing, keep alive, TLS, reconnect backoff) stays behind the
//! [`Transport`] trait.
//!
//! ## Module Layout
//!
//! ```text
//! transport/
//! ├── mod.rs     - trait, options, handler slots, blocking wrapper
//! ├── mqtt.rs    - rumqttc backed transport (real broker)
//! └── memory.rs  - in-process broker, records traffic
//! ```
//!
//! ## Callback Model
//!
//! Every transport delivers its events from exactly one loop, so handlers are never
//! invoked concurrently. Handler slots are set once; a second registration fails.
//!
//! ## Blocking and Async Forms
//!
//! The trait is async. [`BlockingTransport`] offers the same five operations to
//! plain threads by spawning them onto the runtime that drives the session and
//! parking the caller until they complete. Both forms share one session.

pub mod memory;
pub mod mqtt;

pub use memory::MemoryTransport;
pub use mqtt::MqttTransport;

use crate::bridge;
use crate::symbols::Qos;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::debug;

/// ConnAck reason code of an accepted connection.
pub const CONNECTION_ACCEPTED: u8 = 0;

/// Reason code reported for disconnects caused by I/O or protocol errors.
pub const CONNECTION_LOST: u8 = 0x80;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("Transport handler already set: {0}")]
    HandlerAlreadySet(&'static str),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection refused with reason code {0}")]
    Refused(u8),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// A message as seen on the broker, either received or published.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
    pub timestamp: NaiveDateTime,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: Qos, retain: bool) -> Self {
        Message {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n{}", self.timestamp, self.topic, self.payload_str())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let payload = self.payload_str();
        let preview: String = payload.chars().take(32).collect();
        write!(f, "{} - {} {}", self.timestamp, self.topic, preview)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("payload", &self.payload_str())
            .field("qos", &self.qos)
            .field("retain", &self.retain)
            .finish()
    }
}

/// Message the broker publishes on our behalf when the session dies unexpectedly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Falls back to the transport's own client id.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub last_will: Option<LastWill>,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "homeassistant.local".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            last_will: None,
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_last_will(mut self, will: LastWill) -> Self {
        self.last_will = Some(will);
        self
    }
}

type CodeHandler = Box<dyn Fn(u8) + Send + Sync>;
type MessageHandler = Box<dyn Fn(Message) + Send + Sync>;

/// The three callback slots of a transport. Each slot can be set once.
#[derive(Default)]
pub struct TransportHandlers {
    on_connect: OnceLock<CodeHandler>,
    on_disconnect: OnceLock<CodeHandler>,
    on_message: OnceLock<MessageHandler>,
}

impl TransportHandlers {
    pub fn set_on_connect<F>(&self, handler: F) -> Result<(), TransportError>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.on_connect
            .set(Box::new(handler))
            .map_err(|_| TransportError::HandlerAlreadySet("on_connect"))
    }

    pub fn set_on_disconnect<F>(&self, handler: F) -> Result<(), TransportError>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.on_disconnect
            .set(Box::new(handler))
            .map_err(|_| TransportError::HandlerAlreadySet("on_disconnect"))
    }

    pub fn set_on_message<F>(&self, handler: F) -> Result<(), TransportError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.on_message
            .set(Box::new(handler))
            .map_err(|_| TransportError::HandlerAlreadySet("on_message"))
    }

    pub fn fire_connect(&self, code: u8) {
        match self.on_connect.get() {
            Some(handler) => handler(code),
            None => debug!("No on_connect handler for reason code {}", code),
        }
    }

    pub fn fire_disconnect(&self, code: u8) {
        match self.on_disconnect.get() {
            Some(handler) => handler(code),
            None => debug!("No on_disconnect handler for reason code {}", code),
        }
    }

    pub fn fire_message(&self, message: Message) {
        match self.on_message.get() {
            Some(handler) => handler(message),
            None => debug!("No on_message handler, dropping message on {}", message.topic),
        }
    }
}

impl fmt::Debug for TransportHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandlers")
            .field("on_connect", &self.on_connect.get().is_some())
            .field("on_disconnect", &self.on_disconnect.get().is_some())
            .field("on_message", &self.on_message.get().is_some())
            .finish()
    }
}

/// One broker session.
///
/// `connect` returns once the broker acknowledged (accepted or refused) or the
/// connect timeout elapsed; the other operations are bounded by the operation
/// timeout of the session.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    fn handlers(&self) -> &TransportHandlers;
}

/// Blocking view of a transport for callers outside the async runtime.
///
/// Must not be used from inside an async task.
#[derive(Clone)]
pub struct BlockingTransport {
    transport: Arc<dyn Transport>,
    runtime: Handle,
}

impl BlockingTransport {
    pub fn new(transport: Arc<dyn Transport>, runtime: Handle) -> Self {
        Self { transport, runtime }
    }

    pub fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError> {
        let transport = self.transport.clone();
        let options = options.clone();
        self.block_on(async move { transport.connect(&options).await })
    }

    pub fn disconnect(&self) -> Result<(), TransportError> {
        let transport = self.transport.clone();
        self.block_on(async move { transport.disconnect().await })
    }

    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), TransportError> {
        let transport = self.transport.clone();
        let topic = topic.to_string();
        let payload = payload.into();
        self.block_on(async move { transport.publish(&topic, payload, qos, retain).await })
    }

    pub fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        let transport = self.transport.clone();
        let topic = topic.to_string();
        self.block_on(async move { transport.subscribe(&topic, qos).await })
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let transport = self.transport.clone();
        let topic = topic.to_string();
        self.block_on(async move { transport.unsubscribe(&topic).await })
    }

    pub fn handlers(&self) -> &TransportHandlers {
        self.transport.handlers()
    }

    fn block_on<F>(&self, operation: F) -> Result<(), TransportError>
    where
        F: std::future::Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        bridge::block_on(&self.runtime, operation)
            .map_err(|e| TransportError::Runtime(e.to_string()))?
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
