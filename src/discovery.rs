//! Discovery payloads and the publish helpers built on them.
//!
//! A config payload is a JSON object published to `{base}/config`. An empty
//! payload on the same topic removes the component again.

use crate::symbols::{Availability, EntityCategory, Qos};
use crate::topics::Topics;
use crate::transport::{Transport, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Device block embedded in every discovery payload. Empty fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub manufacturer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sw_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hw_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<String>,
    /// `(type, value)` pairs, e.g. `("mac", "02:5b:26:a8:dc:12")`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub via_device: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub configuration_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub suggested_area: String,
}

/// Config payload of a device status sensor or an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub name: String,
    pub availability_topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
    pub state_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    pub object_id: String,
    pub unique_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<EntityCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub device: DeviceDescriptor,
}

impl DiscoveryPayload {
    /// Payload skeleton wired to `topics`, without command topic.
    pub fn new(
        name: impl Into<String>,
        object_id: impl Into<String>,
        topics: &Topics,
        device: DeviceDescriptor,
    ) -> Self {
        let object_id = object_id.into();
        Self {
            name: name.into(),
            availability_topic: topics.availability.clone(),
            payload_available: Availability::Online.as_str().to_string(),
            payload_not_available: Availability::Offline.as_str().to_string(),
            state_topic: topics.state.clone(),
            command_topic: None,
            unique_id: object_id.clone(),
            object_id,
            entity_category: None,
            device_class: None,
            unit_of_measurement: None,
            icon: None,
            device,
        }
    }
}

/// Publishes discovery, availability and state on one transport.
#[derive(Clone)]
pub struct Announcer {
    transport: Arc<dyn Transport>,
    qos: Qos,
    retain_config: bool,
    settle_delay: Duration,
}

impl Announcer {
    pub fn new(transport: Arc<dyn Transport>, qos: Qos, retain_config: bool, settle_delay: Duration) -> Self {
        Self {
            transport,
            qos,
            retain_config,
            settle_delay,
        }
    }

    pub async fn announce(&self, topics: &Topics, payload: &DiscoveryPayload) -> Result<(), AnnounceError> {
        let body = serde_json::to_vec(payload)?;
        debug!("Publishing discovery config to {}", topics.config);
        self.transport
            .publish(&topics.config, body, self.qos, self.retain_config)
            .await?;
        Ok(())
    }

    /// Publishes the empty config payload, the removal signal.
    pub async fn retract(&self, topics: &Topics) -> Result<(), TransportError> {
        debug!("Retracting discovery config on {}", topics.config);
        self.transport
            .publish(&topics.config, Vec::new(), self.qos, self.retain_config)
            .await
    }

    pub async fn availability(&self, topics: &Topics, availability: Availability) -> Result<(), TransportError> {
        debug!("Publishing {} to {}", availability, topics.availability);
        self.transport
            .publish(
                &topics.availability,
                availability.as_str().as_bytes().to_vec(),
                self.qos,
                true,
            )
            .await
    }

    pub async fn state(&self, topics: &Topics, value: &str, retain: bool) -> Result<(), TransportError> {
        debug!("Publishing state {:?} to {}", value, topics.state);
        self.transport
            .publish(&topics.state, value.as_bytes().to_vec(), self.qos, retain)
            .await
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.transport.subscribe(topic, self.qos).await
    }

    /// Gives the consumer time to process a config before anything depends on it.
    pub async fn settle(&self) {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnnounceError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectOptions, MemoryTransport};
    use serde_json::Value;

    fn lamp_descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            name: "Lamp".to_string(),
            manufacturer: "Acme".to_string(),
            identifiers: vec!["lamp".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn empty_descriptor_fields_are_omitted() {
        let json = serde_json::to_value(lamp_descriptor()).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 3);
        assert_eq!(object["manufacturer"], "Acme");
        assert!(!object.contains_key("model"));
        assert!(!object.contains_key("connections"));
    }

    #[test]
    fn payload_keys() {
        let topics = Topics::new("homeassistant/sensor/lamp");
        let mut payload = DiscoveryPayload::new("Status", "lamp", &topics, lamp_descriptor());
        payload.entity_category = Some(EntityCategory::Diagnostic);
        payload.icon = Some("mdi:information-outline".to_string());

        let json: Value = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["availability_topic"], "homeassistant/sensor/lamp/availability");
        assert_eq!(json["payload_available"], "online");
        assert_eq!(json["payload_not_available"], "offline");
        assert_eq!(json["state_topic"], "homeassistant/sensor/lamp/state");
        assert_eq!(json["unique_id"], "lamp");
        assert_eq!(json["entity_category"], "diagnostic");
        assert_eq!(json["device"]["name"], "Lamp");
        assert!(json.get("command_topic").is_none());
        assert!(json.get("unit_of_measurement").is_none());
    }

    #[tokio::test]
    async fn availability_is_retained() {
        let transport = Arc::new(MemoryTransport::new());
        transport.connect(&ConnectOptions::default()).await.unwrap();
        let announcer = Announcer::new(transport.clone(), Qos::AtLeastOnce, false, Duration::ZERO);
        let topics = Topics::new("homeassistant/sensor/lamp");

        announcer.availability(&topics, Availability::Online).await.unwrap();
        assert_eq!(
            transport.retained(&topics.availability).as_deref(),
            Some("online")
        );

        announcer
            .announce(&topics, &DiscoveryPayload::new("Status", "lamp", &topics, lamp_descriptor()))
            .await
            .unwrap();
        // config retain is off by default
        assert_eq!(transport.retained(&topics.config), None);
        announcer.retract(&topics).await.unwrap();
        assert_eq!(transport.last_payload(&topics.config).as_deref(), Some(""));
    }
}
