//! Entity Registry: the ordered set of entities of one device and their
//! discovery protocol. Owned by the device worker.

use super::{Entity, EntityId};
use crate::device::{CommandHandler, DeviceError};
use crate::discovery::{Announcer, DeviceDescriptor, DiscoveryPayload};
use crate::symbols::Availability;
use crate::topics::Topics;
use std::collections::BTreeMap;
use tracing::{debug, info};

struct RegisteredEntity {
    entity: Entity,
    object_id: String,
    /// Set at first discovery and kept for the lifetime of the registry.
    topics: Option<Topics>,
    state: Option<String>,
}

pub struct EntityRegistry {
    discovery_prefix: String,
    device_object_id: String,
    device: DeviceDescriptor,
    entities: BTreeMap<EntityId, RegisteredEntity>,
}

impl EntityRegistry {
    pub fn new(discovery_prefix: String, device_object_id: String, device: DeviceDescriptor) -> Self {
        Self {
            discovery_prefix,
            device_object_id,
            device,
            entities: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, id: EntityId, entity: Entity) {
        let object_id = format!("{}_{}", self.device_object_id, entity.object_id_suffix());
        debug!("Registered {} {} as {}", entity.kind, entity.name, object_id);
        self.entities.insert(
            id,
            RegisteredEntity {
                entity,
                object_id,
                topics: None,
                state: None,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn object_id(&self, id: EntityId) -> Option<&str> {
        self.entities.get(&id).map(|entry| entry.object_id.as_str())
    }

    fn entry(&self, id: EntityId) -> Result<&RegisteredEntity, DeviceError> {
        self.entities.get(&id).ok_or(DeviceError::UnknownEntity(id))
    }

    fn discovered_topics(&self, id: EntityId) -> Result<Topics, DeviceError> {
        self.entry(id)?
            .topics
            .clone()
            .ok_or(DeviceError::EntityNotDiscovered(id))
    }

    fn payload(&self, entry: &RegisteredEntity, topics: &Topics) -> DiscoveryPayload {
        let entity = &entry.entity;
        let mut payload = DiscoveryPayload::new(
            entity.name.clone(),
            entry.object_id.clone(),
            topics,
            self.device.clone(),
        );
        payload.command_topic = Some(topics.command.clone());
        payload.entity_category = entity.entity_category;
        payload.device_class = entity.device_class.clone();
        payload.unit_of_measurement = entity.unit().map(str::to_string);
        payload.icon = entity.icon.clone();
        payload
    }

    /// Publishes one entity: command subscription, config, settle, initial state,
    /// then availability.
    pub async fn discover(&mut self, id: EntityId, announcer: &Announcer) -> Result<(), DeviceError> {
        let topics = {
            let entry = self.entry(id)?;
            match &entry.topics {
                Some(topics) => topics.clone(),
                None => {
                    let base = Topics::discovery_base(
                        &self.discovery_prefix,
                        entry.entity.kind.component_type(),
                        &entry.object_id,
                    );
                    Topics::with_overrides(base, &entry.entity.topics)
                }
            }
        };

        let entry = self.entry(id)?;
        let payload = self.payload(entry, &topics);
        let has_handler = entry.entity.command_handler.is_some();
        let initial_state = entry
            .state
            .clone()
            .or_else(|| entry.entity.initial_state.clone());

        if has_handler {
            announcer.subscribe(&topics.command).await?;
        }
        announcer.announce(&topics, &payload).await?;
        if let Some(entry) = self.entities.get_mut(&id) {
            entry.topics = Some(topics.clone());
        }
        announcer.settle().await;
        if let Some(state) = &initial_state {
            announcer.state(&topics, state, true).await?;
            if let Some(entry) = self.entities.get_mut(&id) {
                entry.state = Some(state.clone());
            }
        }
        announcer.availability(&topics, Availability::Online).await?;
        info!("Discovered entity {}", payload.object_id);
        Ok(())
    }

    pub async fn discover_all(&mut self, announcer: &Announcer) -> Result<(), DeviceError> {
        for id in self.ids() {
            self.discover(id, announcer).await?;
        }
        Ok(())
    }

    pub async fn set_state(
        &mut self,
        id: EntityId,
        value: &str,
        retain: bool,
        announcer: &Announcer,
    ) -> Result<(), DeviceError> {
        let topics = self.discovered_topics(id)?;
        announcer.state(&topics, value, retain).await?;
        if let Some(entry) = self.entities.get_mut(&id) {
            entry.state = Some(value.to_string());
        }
        Ok(())
    }

    pub fn state(&self, id: EntityId) -> Result<Option<String>, DeviceError> {
        Ok(self.entry(id)?.state.clone())
    }

    pub async fn set_availability(
        &self,
        id: EntityId,
        availability: Availability,
        announcer: &Announcer,
    ) -> Result<(), DeviceError> {
        let topics = self.discovered_topics(id)?;
        announcer.availability(&topics, availability).await?;
        Ok(())
    }

    /// Publishes offline for every discovered entity, in registration order.
    pub async fn offline_all(&self, announcer: &Announcer) -> Result<(), DeviceError> {
        for entry in self.entities.values() {
            if let Some(topics) = &entry.topics {
                announcer.availability(topics, Availability::Offline).await?;
            }
        }
        Ok(())
    }

    pub async fn retract(&self, id: EntityId, announcer: &Announcer) -> Result<(), DeviceError> {
        let topics = self.discovered_topics(id)?;
        announcer.retract(&topics).await?;
        Ok(())
    }

    /// Retracts every discovered entity config, in registration order.
    pub async fn retract_all(&self, announcer: &Announcer) -> Result<(), DeviceError> {
        for (id, entry) in &self.entities {
            if entry.topics.is_some() {
                self.retract(*id, announcer).await?;
            }
        }
        Ok(())
    }

    pub fn command_handler_for(&self, topic: &str) -> Option<(EntityId, CommandHandler)> {
        self.entities.iter().find_map(|(id, entry)| {
            let topics = entry.topics.as_ref()?;
            if topics.command != topic {
                return None;
            }
            entry
                .entity
                .command_handler
                .clone()
                .map(|handler| (*id, handler))
        })
    }

    /// Records an echo seen on an entity state topic. Returns whether it matched.
    pub fn observe_state(&mut self, topic: &str, value: &str) -> bool {
        for entry in self.entities.values_mut() {
            if entry.topics.as_ref().is_some_and(|topics| topics.state == topic) {
                entry.state = Some(value.to_string());
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Handler;
    use crate::symbols::Qos;
    use crate::transport::{ConnectOptions, MemoryTransport, Transport};
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup() -> (Arc<MemoryTransport>, Announcer, EntityRegistry) {
        let transport = Arc::new(MemoryTransport::new());
        transport.connect(&ConnectOptions::default()).await.unwrap();
        let announcer = Announcer::new(transport.clone(), Qos::AtMostOnce, false, Duration::ZERO);
        let descriptor = DeviceDescriptor {
            name: "Lamp".to_string(),
            identifiers: vec!["lamp".to_string()],
            ..Default::default()
        };
        let registry = EntityRegistry::new("homeassistant".to_string(), "lamp".to_string(), descriptor);
        (transport, announcer, registry)
    }

    #[tokio::test]
    async fn discovery_sequence() {
        let (transport, announcer, mut registry) = setup().await;
        let relay = Entity::switch("Main Relay")
            .unwrap()
            .with_initial_state("OFF")
            .on_command(Handler::blocking(|_, _| {}));
        registry.insert(EntityId(0), relay);
        registry.discover_all(&announcer).await.unwrap();

        let base = "homeassistant/switch/lamp_main_relay";
        assert_eq!(registry.object_id(EntityId(0)), Some("lamp_main_relay"));
        assert_eq!(transport.subscriptions(), vec![format!("{}/command", base)]);

        let topics: Vec<String> = transport
            .published()
            .into_iter()
            .map(|message| message.topic)
            .collect();
        assert_eq!(
            topics,
            vec![
                format!("{}/config", base),
                format!("{}/state", base),
                format!("{}/availability", base),
            ]
        );

        let config: serde_json::Value =
            serde_json::from_str(&transport.last_payload(&format!("{}/config", base)).unwrap()).unwrap();
        assert_eq!(config["command_topic"], format!("{}/command", base));
        assert_eq!(config["unique_id"], "lamp_main_relay");
        assert_eq!(registry.state(EntityId(0)).unwrap().as_deref(), Some("OFF"));
        assert!(registry.command_handler_for(&format!("{}/command", base)).is_some());
    }

    #[tokio::test]
    async fn command_topic_without_handler() {
        let (transport, announcer, mut registry) = setup().await;
        registry.insert(EntityId(0), Entity::switch("Fan").unwrap());
        registry.discover_all(&announcer).await.unwrap();

        let base = "homeassistant/switch/lamp_fan";
        let config: serde_json::Value =
            serde_json::from_str(&transport.last_payload(&format!("{}/config", base)).unwrap()).unwrap();
        assert_eq!(config["command_topic"], format!("{}/command", base));
        assert!(transport.subscriptions().is_empty());
        assert!(registry.command_handler_for(&format!("{}/command", base)).is_none());
    }

    #[tokio::test]
    async fn operations_before_discovery() {
        let (_transport, announcer, mut registry) = setup().await;
        registry.insert(EntityId(0), Entity::sensor("Power").unwrap());

        assert!(matches!(
            registry.set_state(EntityId(0), "5", false, &announcer).await,
            Err(DeviceError::EntityNotDiscovered(_))
        ));
        assert!(matches!(
            registry.state(EntityId(7)),
            Err(DeviceError::UnknownEntity(_))
        ));
        assert_eq!(registry.state(EntityId(0)).unwrap(), None);
    }

    #[tokio::test]
    async fn retraction_in_registration_order() {
        let (transport, announcer, mut registry) = setup().await;
        registry.insert(EntityId(0), Entity::sensor("Power").unwrap());
        registry.insert(EntityId(1), Entity::binary_sensor("Door").unwrap());
        registry.discover_all(&announcer).await.unwrap();
        registry.retract_all(&announcer).await.unwrap();

        let retracted: Vec<String> = transport
            .published()
            .into_iter()
            .filter(|message| message.payload.is_empty())
            .map(|message| message.topic)
            .collect();
        assert_eq!(
            retracted,
            vec![
                "homeassistant/sensor/lamp_power/config".to_string(),
                "homeassistant/binary_sensor/lamp_door/config".to_string(),
            ]
        );
    }
}
