//! # Device State Machine
//!
//! A [`Device`] owns its transport session, its entities and its scheduler. All of
//! that state lives in one worker task; [`DeviceHandle`] methods only send commands
//! to it and wait for the answer, so operations never race each other no matter
//! how many threads or tasks drive the device.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──► Connecting ──► Connected ──► DiscoveryPublished ──► Available ──► Running
//!    │             │             │                 │                  │            │
//!    └─────────────┴─────────────┴──── stop() ─────┴──────────────────┴────────────┘
//!                                         │
//!                                         ▼
//!                                     Stopping ──► Disconnected
//! ```
//!
//! Transitions only move forward. `Connected` and everything after it are driven
//! by the broker acknowledging the session, not by `connect()` returning.
//!
//! ## Blocking and Async Forms
//!
//! Every operation has an async form (`device.set_status(..).await`) and a blocking
//! form (`device.blocking_set_status(..)`). Both send the same command. The blocking
//! forms park the calling thread and must not be used inside an async task.

mod announce;
pub mod callback;
mod worker;

pub use callback::{Callback, CommandHandler, Handler};

use crate::bridge::{Bridge, BridgeError, Signals};
use crate::discovery::{AnnounceError, DeviceDescriptor, DiscoveryPayload};
use crate::entity::{Entity, EntityId};
use crate::scheduler::Interval;
use crate::symbols::{Availability, EntityCategory, Qos};
use crate::topics::Topics;
use crate::transport::{ConnectOptions, MqttTransport, Transport, TransportError};
use crate::validate::{self, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;
use worker::{BrokerEvent, DeviceCommand, Worker};

const DEVICE_COMPONENT: &str = "sensor";
const STATUS_ENTITY_NAME: &str = "Status";
const STATUS_ICON: &str = "mdi:information-outline";

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

/// Identity and metadata of a device, as written in a settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub sw_version: String,
    #[serde(default)]
    pub hw_version: String,
    #[serde(default)]
    pub identifiers: Vec<String>,
    #[serde(default)]
    pub connections: Vec<(String, String)>,
    #[serde(default)]
    pub via_device: String,
    #[serde(default)]
    pub configuration_url: String,
    #[serde(default)]
    pub suggested_area: String,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manufacturer: String::new(),
            model: String::new(),
            sw_version: String::new(),
            hw_version: String::new(),
            identifiers: Vec::new(),
            connections: Vec::new(),
            via_device: String::new(),
            configuration_url: String::new(),
            suggested_area: String::new(),
            discovery_prefix: default_discovery_prefix(),
        }
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_sw_version(mut self, version: impl Into<String>) -> Self {
        self.sw_version = version.into();
        self
    }

    pub fn with_configuration_url(mut self, url: impl Into<String>) -> Self {
        self.configuration_url = url.into();
        self
    }

    pub fn with_discovery_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.discovery_prefix = prefix.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Pause after a config publish before anything depends on it.
    pub settle_delay: Duration,
    pub qos: Qos,
    pub retain_config: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            qos: Qos::AtMostOnce,
            retain_config: false,
        }
    }
}

/// Validated identity of a device. Topics are fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    pub slug: String,
    pub object_id: String,
    pub unique_id: String,
    pub discovery_prefix: String,
    pub topics: Topics,
    pub descriptor: DeviceDescriptor,
}

impl DeviceIdentity {
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ValidationError> {
        let name = validate::name(&config.name)?;
        let object_id = validate::object_id(&name)?;
        let discovery_prefix = validate::discovery_prefix(&config.discovery_prefix)?;
        let component = validate::component_type(DEVICE_COMPONENT)?;

        let identifiers = if config.identifiers.is_empty() {
            vec![object_id.clone()]
        } else {
            config.identifiers.clone()
        };
        let descriptor = DeviceDescriptor {
            name: name.clone(),
            manufacturer: validate::optional_name(&config.manufacturer)?,
            model: validate::optional_name(&config.model)?,
            sw_version: validate::version_string(&config.sw_version)?,
            hw_version: validate::version_string(&config.hw_version)?,
            identifiers,
            connections: config.connections.clone(),
            via_device: validate::optional_object_id(&config.via_device)?,
            configuration_url: validate::url(&config.configuration_url)?,
            suggested_area: validate::optional_name(&config.suggested_area)?,
        };

        Ok(Self {
            slug: validate::slug(&name)?,
            unique_id: validate::unique_id(&name)?,
            topics: Topics::new(Topics::discovery_base(&discovery_prefix, &component, &object_id)),
            object_id,
            discovery_prefix,
            descriptor,
            name,
        })
    }

    /// Config payload of the device's own status sensor.
    pub fn discovery_payload(&self) -> DiscoveryPayload {
        let mut payload = DiscoveryPayload::new(
            STATUS_ENTITY_NAME,
            self.object_id.clone(),
            &self.topics,
            self.descriptor.clone(),
        );
        payload.unique_id = self.unique_id.clone();
        payload.entity_category = Some(EntityCategory::Diagnostic);
        payload.icon = Some(STATUS_ICON.to_string());
        payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Created,
    Connecting,
    Connected,
    DiscoveryPublished,
    Available,
    Running,
    Stopping,
    Disconnected,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Connected => "connected",
            LifecycleState::DiscoveryPublished => "discovery published",
            LifecycleState::Available => "available",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("Unknown entity {0}")]
    UnknownEntity(EntityId),

    #[error("Entity {0} has not been discovered yet")]
    EntityNotDiscovered(EntityId),

    #[error("Device worker is gone")]
    WorkerGone,
}

impl From<AnnounceError> for DeviceError {
    fn from(e: AnnounceError) -> Self {
        match e {
            AnnounceError::Serialization(e) => DeviceError::Serialization(e),
            AnnounceError::Transport(e) => DeviceError::Transport(e),
        }
    }
}

/// State visible outside the worker.
pub(crate) struct DeviceShared {
    pub(crate) identity: DeviceIdentity,
    pub(crate) signals: Signals,
    lifecycle: watch::Sender<LifecycleState>,
    available: AtomicBool,
    next_entity: AtomicUsize,
}

impl DeviceShared {
    pub(crate) fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    /// Moves the lifecycle forward; backward moves are ignored.
    pub(crate) fn advance(&self, next: LifecycleState) {
        let moved = self.lifecycle.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            info!("Device {} is {}", self.identity.name, next);
        }
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

/// Cloneable access to a running device.
#[derive(Clone)]
pub struct DeviceHandle {
    commands: mpsc::UnboundedSender<DeviceCommand>,
    shared: Arc<DeviceShared>,
}

/// Does not keep the device alive.
#[derive(Clone)]
pub struct WeakDeviceHandle {
    commands: mpsc::WeakUnboundedSender<DeviceCommand>,
    shared: Weak<DeviceShared>,
}

impl WeakDeviceHandle {
    pub fn upgrade(&self) -> Option<DeviceHandle> {
        Some(DeviceHandle {
            commands: self.commands.upgrade()?,
            shared: self.shared.upgrade()?,
        })
    }
}

impl DeviceHandle {
    pub fn downgrade(&self) -> WeakDeviceHandle {
        WeakDeviceHandle {
            commands: self.commands.downgrade(),
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn send(&self, command: DeviceCommand) -> Result<(), DeviceError> {
        self.commands
            .send(command)
            .map_err(|_| DeviceError::WorkerGone)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, DeviceError>>) -> DeviceCommand,
    ) -> Result<T, DeviceError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(command(response_tx))?;
        response_rx.await.map_err(|_| DeviceError::WorkerGone)?
    }

    fn blocking_request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, DeviceError>>) -> DeviceCommand,
    ) -> Result<T, DeviceError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(command(response_tx))?;
        response_rx
            .blocking_recv()
            .map_err(|_| DeviceError::WorkerGone)?
    }

    // --- observers ---

    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.shared.lifecycle()
    }

    pub fn watch_lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.shared.lifecycle.subscribe()
    }

    pub fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    // --- registration ---

    /// Registers an entity. It is discovered with the device, or right away when
    /// the device has already published its discovery.
    pub fn register(&self, entity: Entity) -> Result<EntityId, DeviceError> {
        let id = EntityId(self.shared.next_entity.fetch_add(1, Ordering::SeqCst));
        self.send(DeviceCommand::Register { id, entity })?;
        Ok(id)
    }

    /// Runs after every fresh announce of the device.
    pub fn on_connect(&self, callback: Callback) -> Result<(), DeviceError> {
        self.send(DeviceCommand::OnConnect(callback))
    }

    /// Receives payloads published to the device's command topic.
    pub fn on_command(&self, handler: CommandHandler) -> Result<(), DeviceError> {
        self.send(DeviceCommand::OnCommand(handler))
    }

    pub fn on_interval(&self, interval: Interval, callback: Callback) -> Result<(), DeviceError> {
        let interval = interval.validate()?;
        self.send(DeviceCommand::OnInterval { interval, callback })
    }

    // --- lifecycle ---

    /// Opens the broker session. Discovery and availability follow once the
    /// broker acknowledges; see [`DeviceHandle::wait_available`].
    pub async fn connect(&self, options: ConnectOptions) -> Result<(), DeviceError> {
        self.request(|response_tx| DeviceCommand::Connect {
            options,
            response_tx,
        })
        .await
    }

    pub fn blocking_connect(&self, options: ConnectOptions) -> Result<(), DeviceError> {
        self.blocking_request(|response_tx| DeviceCommand::Connect {
            options,
            response_tx,
        })
    }

    /// Connects and returns once the device has been stopped.
    pub async fn run(&self, options: ConnectOptions) -> Result<(), DeviceError> {
        self.connect(options).await?;
        self.shared.signals.stopped.wait().await;
        Ok(())
    }

    pub fn blocking_run(&self, options: ConnectOptions) -> Result<(), DeviceError> {
        self.blocking_connect(options)?;
        self.shared.signals.stopped.wait_blocking();
        Ok(())
    }

    /// Waits until the broker accepted the session. Discovery may still be
    /// in flight.
    pub async fn wait_connected(&self) {
        self.shared.signals.connected.wait().await
    }

    pub fn blocking_wait_connected(&self) {
        self.shared.signals.connected.wait_blocking()
    }

    pub async fn wait_available(&self) {
        self.shared.signals.available.wait().await
    }

    pub fn blocking_wait_available(&self) {
        self.shared.signals.available.wait_blocking()
    }

    /// Returns whether the device became available within `limit`.
    pub fn blocking_wait_available_timeout(&self, limit: Duration) -> bool {
        self.shared.signals.available.wait_blocking_timeout(limit)
    }

    pub async fn stop(&self) -> Result<(), DeviceError> {
        self.request(|response_tx| DeviceCommand::Stop { response_tx })
            .await
    }

    pub fn blocking_stop(&self) -> Result<(), DeviceError> {
        self.blocking_request(|response_tx| DeviceCommand::Stop { response_tx })
    }

    // --- status ---

    /// Last status published or observed on the state topic.
    pub async fn status(&self) -> Result<Option<String>, DeviceError> {
        self.request(|response_tx| DeviceCommand::Status { response_tx })
            .await
    }

    pub fn blocking_status(&self) -> Result<Option<String>, DeviceError> {
        self.blocking_request(|response_tx| DeviceCommand::Status { response_tx })
    }

    pub async fn set_status(&self, value: impl Into<String>, retain: bool) -> Result<(), DeviceError> {
        let value = value.into();
        self.request(|response_tx| DeviceCommand::SetStatus {
            value,
            retain,
            response_tx,
        })
        .await
    }

    pub fn blocking_set_status(&self, value: impl Into<String>, retain: bool) -> Result<(), DeviceError> {
        let value = value.into();
        self.blocking_request(|response_tx| DeviceCommand::SetStatus {
            value,
            retain,
            response_tx,
        })
    }

    /// Waits for the next status acknowledgement and consumes it.
    pub async fn status_set_confirm(&self) {
        self.shared.signals.status_ack.wait_and_reset().await
    }

    pub fn blocking_status_set_confirm(&self) {
        self.shared.signals.status_ack.wait_blocking_and_reset()
    }

    // --- availability ---

    pub async fn available(&self) -> Result<(), DeviceError> {
        self.request(|response_tx| DeviceCommand::Availability {
            availability: Availability::Online,
            response_tx,
        })
        .await
    }

    pub fn blocking_available(&self) -> Result<(), DeviceError> {
        self.blocking_request(|response_tx| DeviceCommand::Availability {
            availability: Availability::Online,
            response_tx,
        })
    }

    pub async fn unavailable(&self) -> Result<(), DeviceError> {
        self.request(|response_tx| DeviceCommand::Availability {
            availability: Availability::Offline,
            response_tx,
        })
        .await
    }

    pub fn blocking_unavailable(&self) -> Result<(), DeviceError> {
        self.blocking_request(|response_tx| DeviceCommand::Availability {
            availability: Availability::Offline,
            response_tx,
        })
    }

    // --- teardown ---

    /// Removes the device's own config from the consumer.
    pub async fn destroy(&self) -> Result<(), DeviceError> {
        self.request(|response_tx| DeviceCommand::Destroy { response_tx })
            .await
    }

    pub fn blocking_destroy(&self) -> Result<(), DeviceError> {
        self.blocking_request(|response_tx| DeviceCommand::Destroy { response_tx })
    }

    /// Removes every entity config, then the device config.
    pub async fn destroy_discovery(&self) -> Result<(), DeviceError> {
        self.request(|response_tx| DeviceCommand::DestroyDiscovery { response_tx })
            .await
    }

    pub fn blocking_destroy_discovery(&self) -> Result<(), DeviceError> {
        self.blocking_request(|response_tx| DeviceCommand::DestroyDiscovery { response_tx })
    }

    // --- entities ---

    pub async fn entity_state(&self, id: EntityId) -> Result<Option<String>, DeviceError> {
        self.request(|response_tx| DeviceCommand::EntityState { id, response_tx })
            .await
    }

    pub fn blocking_entity_state(&self, id: EntityId) -> Result<Option<String>, DeviceError> {
        self.blocking_request(|response_tx| DeviceCommand::EntityState { id, response_tx })
    }

    pub async fn set_entity_state(
        &self,
        id: EntityId,
        value: impl Into<String>,
        retain: bool,
    ) -> Result<(), DeviceError> {
        let value = value.into();
        self.request(|response_tx| DeviceCommand::SetEntityState {
            id,
            value,
            retain,
            response_tx,
        })
        .await
    }

    pub fn blocking_set_entity_state(
        &self,
        id: EntityId,
        value: impl Into<String>,
        retain: bool,
    ) -> Result<(), DeviceError> {
        let value = value.into();
        self.blocking_request(|response_tx| DeviceCommand::SetEntityState {
            id,
            value,
            retain,
            response_tx,
        })
    }

    pub async fn set_entity_availability(
        &self,
        id: EntityId,
        availability: Availability,
    ) -> Result<(), DeviceError> {
        self.request(|response_tx| DeviceCommand::SetEntityAvailability {
            id,
            availability,
            response_tx,
        })
        .await
    }

    pub fn blocking_set_entity_availability(
        &self,
        id: EntityId,
        availability: Availability,
    ) -> Result<(), DeviceError> {
        self.blocking_request(|response_tx| DeviceCommand::SetEntityAvailability {
            id,
            availability,
            response_tx,
        })
    }

    pub async fn destroy_entity(&self, id: EntityId) -> Result<(), DeviceError> {
        self.request(|response_tx| DeviceCommand::DestroyEntity { id, response_tx })
            .await
    }

    pub fn blocking_destroy_entity(&self, id: EntityId) -> Result<(), DeviceError> {
        self.blocking_request(|response_tx| DeviceCommand::DestroyEntity { id, response_tx })
    }
}

/// A device and the runtime its worker runs on.
///
/// Created inside a tokio runtime the device joins it; created on a plain thread
/// it starts a runtime of its own, shut down when the device is dropped.
pub struct Device {
    handle: DeviceHandle,
    bridge: Bridge,
}

impl Device {
    /// Device talking to a real broker through rumqttc.
    pub fn new(config: DeviceConfig) -> Result<Self, DeviceError> {
        Self::with_options(config, DeviceOptions::default())
    }

    pub fn with_options(config: DeviceConfig, options: DeviceOptions) -> Result<Self, DeviceError> {
        let identity = DeviceIdentity::from_config(&config)?;
        let transport = Arc::new(MqttTransport::new(identity.unique_id.clone()));
        Self::build(identity, options, transport)
    }

    pub fn with_transport(
        config: DeviceConfig,
        options: DeviceOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, DeviceError> {
        let identity = DeviceIdentity::from_config(&config)?;
        Self::build(identity, options, transport)
    }

    fn build(
        identity: DeviceIdentity,
        options: DeviceOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, DeviceError> {
        let bridge = Bridge::current_or_owned()?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(LifecycleState::Created);
        let shared = Arc::new(DeviceShared {
            identity,
            signals: Signals::default(),
            lifecycle,
            available: AtomicBool::new(false),
            next_entity: AtomicUsize::new(0),
        });

        let handlers = transport.handlers();
        let events = commands.downgrade();
        handlers.set_on_connect(move |code| {
            if let Some(events) = events.upgrade() {
                let _ = events.send(DeviceCommand::Broker(BrokerEvent::Connected(code)));
            }
        })?;
        let events = commands.downgrade();
        handlers.set_on_disconnect(move |code| {
            if let Some(events) = events.upgrade() {
                let _ = events.send(DeviceCommand::Broker(BrokerEvent::Disconnected(code)));
            }
        })?;
        let events = commands.downgrade();
        handlers.set_on_message(move |message| {
            if let Some(events) = events.upgrade() {
                let _ = events.send(DeviceCommand::Broker(BrokerEvent::Message(message)));
            }
        })?;

        let handle = DeviceHandle { commands, shared };
        let worker = Worker::new(handle.downgrade(), handle.shared.clone(), transport, &options);
        bridge.spawn(worker.run(commands_rx));
        info!("Created device {}", handle.identity().name);

        Ok(Self { handle, bridge })
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle.clone()
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }
}

impl Deref for Device {
    type Target = DeviceHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}
