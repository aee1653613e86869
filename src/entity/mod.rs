//! Entities: the sub components a device announces next to its own status sensor.

pub mod registry;

pub use registry::EntityRegistry;

use crate::device::CommandHandler;
use crate::symbols::EntityCategory;
use crate::topics::TopicOverrides;
use crate::validate::{self, ValidationError};
use std::fmt;

/// Home Assistant MQTT component types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    AlarmControlPanel,
    BinarySensor,
    Button,
    Camera,
    Cover,
    DeviceTracker,
    DeviceTrigger,
    Fan,
    Humidifier,
    Climate,
    Light,
    Lock,
    Number,
    Scene,
    Select,
    Sensor,
    Siren,
    Switch,
    Update,
    TagScanner,
    Text,
    Vacuum,
}

impl EntityKind {
    pub fn component_type(&self) -> &'static str {
        match self {
            EntityKind::AlarmControlPanel => "alarm_control_panel",
            EntityKind::BinarySensor => "binary_sensor",
            EntityKind::Button => "button",
            EntityKind::Camera => "camera",
            EntityKind::Cover => "cover",
            EntityKind::DeviceTracker => "device_tracker",
            EntityKind::DeviceTrigger => "device_trigger",
            EntityKind::Fan => "fan",
            EntityKind::Humidifier => "humidifier",
            EntityKind::Climate => "climate",
            EntityKind::Light => "light",
            EntityKind::Lock => "lock",
            EntityKind::Number => "number",
            EntityKind::Scene => "scene",
            EntityKind::Select => "select",
            EntityKind::Sensor => "sensor",
            EntityKind::Siren => "siren",
            EntityKind::Switch => "switch",
            EntityKind::Update => "update",
            EntityKind::TagScanner => "tag_scanner",
            EntityKind::Text => "text",
            EntityKind::Vacuum => "vacuum",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.component_type())
    }
}

/// Handle to an entity registered on a device, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub(crate) usize);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Declaration of an entity. Nothing is published until the owning device
/// discovers it.
#[derive(Clone)]
pub struct Entity {
    pub name: String,
    pub slug: String,
    pub kind: EntityKind,
    pub device_class: Option<String>,
    pub entity_category: Option<EntityCategory>,
    pub unit_of_measurement: Option<String>,
    pub icon: Option<String>,
    pub initial_state: Option<String>,
    pub topics: TopicOverrides,
    pub command_handler: Option<CommandHandler>,
}

impl Entity {
    pub fn new(kind: EntityKind, name: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            name: validate::name(name)?,
            slug: validate::slug(name)?,
            kind,
            device_class: None,
            entity_category: None,
            unit_of_measurement: None,
            icon: None,
            initial_state: None,
            topics: TopicOverrides::default(),
            command_handler: None,
        })
    }

    pub fn sensor(name: &str) -> Result<Self, ValidationError> {
        Self::new(EntityKind::Sensor, name)
    }

    pub fn binary_sensor(name: &str) -> Result<Self, ValidationError> {
        Self::new(EntityKind::BinarySensor, name)
    }

    pub fn switch(name: &str) -> Result<Self, ValidationError> {
        Self::new(EntityKind::Switch, name)
    }

    pub fn button(name: &str) -> Result<Self, ValidationError> {
        Self::new(EntityKind::Button, name)
    }

    pub fn text(name: &str) -> Result<Self, ValidationError> {
        Self::new(EntityKind::Text, name)
    }

    pub fn with_device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }

    pub fn with_category(mut self, category: EntityCategory) -> Self {
        self.entity_category = Some(category);
        self
    }

    /// Only sensors carry a unit; it is ignored for other kinds.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit_of_measurement = Some(unit.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn with_initial_state(mut self, state: impl Into<String>) -> Self {
        self.initial_state = Some(state.into());
        self
    }

    /// Topic overrides must be publishable topics; empty fields keep the default.
    pub fn with_topics(mut self, overrides: TopicOverrides) -> Result<Self, ValidationError> {
        for topic in [
            &overrides.config,
            &overrides.availability,
            &overrides.state,
            &overrides.command,
        ]
        .into_iter()
        .flatten()
        .filter(|topic| !topic.is_empty())
        {
            validate::topic(topic)?;
        }
        self.topics = overrides;
        Ok(self)
    }

    pub fn on_command(mut self, handler: CommandHandler) -> Self {
        self.command_handler = Some(handler);
        self
    }

    /// Object id suffix, the slug with `_` separators.
    pub fn object_id_suffix(&self) -> String {
        self.slug.replace('-', "_")
    }

    pub fn unit(&self) -> Option<&str> {
        match self.kind {
            EntityKind::Sensor => self.unit_of_measurement.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("name", &self.name)
            .field("slug", &self.slug)
            .field("kind", &self.kind)
            .field("device_class", &self.device_class)
            .field("entity_category", &self.entity_category)
            .field("initial_state", &self.initial_state)
            .field("has_command_handler", &self.command_handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_validated() {
        let entity = Entity::switch("Kitchen Light").unwrap();
        assert_eq!(entity.slug, "kitchen-light");
        assert_eq!(entity.object_id_suffix(), "kitchen_light");
        assert!(Entity::sensor("Bad/Name").is_err());
    }

    #[test]
    fn unit_only_for_sensors() {
        let sensor = Entity::sensor("Temperature").unwrap().with_unit("°C");
        assert_eq!(sensor.unit(), Some("°C"));
        let switch = Entity::switch("Relay").unwrap().with_unit("W");
        assert_eq!(switch.unit(), None);
    }

    #[test]
    fn topic_overrides_are_checked() {
        let overrides = TopicOverrides {
            state: Some("custom/relay/state".to_string()),
            ..Default::default()
        };
        assert!(Entity::switch("Relay").unwrap().with_topics(overrides).is_ok());

        let bad = TopicOverrides {
            command: Some("relay/#".to_string()),
            ..Default::default()
        };
        assert!(Entity::switch("Relay").unwrap().with_topics(bad).is_err());
    }

    #[test]
    fn component_types() {
        assert_eq!(EntityKind::AlarmControlPanel.component_type(), "alarm_control_panel");
        assert_eq!(EntityKind::TagScanner.to_string(), "tag_scanner");
        assert_eq!(EntityKind::BinarySensor.to_string(), "binary_sensor");
    }
}
