//! In-process [`Transport`] that plays the broker.
//!
//! Publishes are recorded in order and retained payloads are kept per topic. A
//! publish to a subscribed topic is echoed back through `on_message`, the way a
//! real broker delivers our own messages to our own subscriptions. All events are
//! delivered from one task, in the order they happened.

use super::{
    topic_matches, ConnectOptions, Message, Transport, TransportError, TransportHandlers,
    CONNECTION_ACCEPTED,
};
use crate::symbols::Qos;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

enum BrokerEvent {
    Connected(u8),
    Disconnected(u8),
    Message(Message),
}

#[derive(Default)]
struct Broker {
    connected: bool,
    connect_count: usize,
    subscriptions: Vec<String>,
    published: Vec<Message>,
    retained: HashMap<String, Vec<u8>>,
    events: Option<mpsc::UnboundedSender<BrokerEvent>>,
}

impl Broker {
    fn deliver(&self, event: BrokerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|filter| topic_matches(filter, topic))
    }
}

#[derive(Default)]
pub struct MemoryTransport {
    ack_code: u8,
    handlers: Arc<TransportHandlers>,
    broker: Mutex<Broker>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that answers every connect with `code`.
    pub fn refusing(code: u8) -> Self {
        Self {
            ack_code: code,
            ..Default::default()
        }
    }

    fn broker(&self) -> MutexGuard<'_, Broker> {
        self.broker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers a message from another client. Returns whether anyone listened.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let broker = self.broker();
        if !broker.connected || !broker.is_subscribed(topic) {
            return false;
        }
        broker.deliver(BrokerEvent::Message(Message::new(
            topic,
            payload,
            Qos::AtMostOnce,
            false,
        )));
        true
    }

    /// Drops the session as if the network failed.
    pub fn drop_connection(&self, code: u8) {
        let mut broker = self.broker();
        if broker.connected {
            broker.connected = false;
            broker.deliver(BrokerEvent::Disconnected(code));
            broker.events = None;
        }
    }

    pub fn published(&self) -> Vec<Message> {
        self.broker().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Message> {
        self.broker()
            .published
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub fn last_payload(&self, topic: &str) -> Option<String> {
        self.broker()
            .published
            .iter()
            .rev()
            .find(|message| message.topic == topic)
            .map(|message| message.payload_str().into_owned())
    }

    pub fn retained(&self, topic: &str) -> Option<String> {
        self.broker()
            .retained
            .get(topic)
            .map(|payload| String::from_utf8_lossy(payload).into_owned())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.broker().subscriptions.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.broker().connected
    }

    pub fn connect_count(&self) -> usize {
        self.broker().connect_count
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, _options: &ConnectOptions) -> Result<(), TransportError> {
        let mut broker = self.broker();
        if broker.connected {
            return Err(TransportError::Connection("session already open".to_string()));
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let handlers = self.handlers.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    BrokerEvent::Connected(code) => handlers.fire_connect(code),
                    BrokerEvent::Disconnected(code) => handlers.fire_disconnect(code),
                    BrokerEvent::Message(message) => handlers.fire_message(message),
                }
            }
            trace!("Memory broker delivery finished");
        });

        broker.connect_count += 1;
        broker.connected = self.ack_code == CONNECTION_ACCEPTED;
        broker.subscriptions.clear();
        broker.events = Some(events_tx);
        broker.deliver(BrokerEvent::Connected(self.ack_code));
        debug!("Memory broker acknowledged with code {}", self.ack_code);
        if !broker.connected {
            broker.events = None;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut broker = self.broker();
        if broker.connected {
            broker.connected = false;
            broker.deliver(BrokerEvent::Disconnected(CONNECTION_ACCEPTED));
            broker.events = None;
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), TransportError> {
        let mut broker = self.broker();
        if !broker.connected {
            return Err(TransportError::NotConnected);
        }

        let message = Message::new(topic, payload, qos, retain);
        if retain {
            if message.payload.is_empty() {
                broker.retained.remove(topic);
            } else {
                broker.retained.insert(topic.to_string(), message.payload.clone());
            }
        }
        if broker.is_subscribed(topic) {
            broker.deliver(BrokerEvent::Message(message.clone()));
        }
        broker.published.push(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: Qos) -> Result<(), TransportError> {
        let mut broker = self.broker();
        if !broker.connected {
            return Err(TransportError::NotConnected);
        }
        if !broker.subscriptions.iter().any(|filter| filter == topic) {
            broker.subscriptions.push(topic.to_string());
        }
        // new subscribers receive what is retained
        let retained: Vec<Message> = broker
            .retained
            .iter()
            .filter(|(retained_topic, _)| topic_matches(topic, retained_topic))
            .map(|(retained_topic, payload)| {
                Message::new(retained_topic.clone(), payload.clone(), Qos::AtMostOnce, true)
            })
            .collect();
        for message in retained {
            broker.deliver(BrokerEvent::Message(message));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut broker = self.broker();
        if !broker.connected {
            return Err(TransportError::NotConnected);
        }
        broker.subscriptions.retain(|filter| filter != topic);
        Ok(())
    }

    fn handlers(&self) -> &TransportHandlers {
        &self.handlers
    }
}
