//! Announce a device and its entities to Home Assistant over MQTT discovery.
//!
//! ```text
//! Device ──► worker task ──► Announcer ──► Transport ──► broker
//!   │            ▲   │
//!   │            │   ├──► EntityRegistry
//!   │   broker events└──► Scheduler ──► interval callbacks
//!   └── blocking_* / async operations
//! ```
//!
//! A [`device::Device`] is created from a validated [`device::DeviceConfig`]. It
//! connects, publishes its discovery config, announces itself online, discovers
//! its entities and runs interval jobs until it is stopped.

pub mod bridge;
pub mod config;
pub mod device;
pub mod discovery;
pub mod entity;
pub mod scheduler;
pub mod symbols;
pub mod topics;
pub mod transport;
pub mod validate;

pub use device::{Device, DeviceConfig, DeviceError, DeviceHandle, DeviceOptions, LifecycleState};
pub use entity::{Entity, EntityId, EntityKind};
pub use scheduler::Interval;
pub use symbols::{Availability, EntityCategory, Qos, SwitchState};
pub use transport::{ConnectOptions, MemoryTransport, MqttTransport, Transport};
