//! Announce sequence run when the broker accepts the session.
//!
//! ```text
//! Acknowledged ──► ConfigPublished ──► EntitiesDiscovered ──► Online ──► Scheduled
//! ```
//!
//! Each step can only be reached from the one before it, so the device is never
//! marked available before its config went out.

use super::{DeviceError, DeviceShared, LifecycleState, WeakDeviceHandle};
use crate::discovery::Announcer;
use crate::entity::EntityRegistry;
use crate::scheduler::Scheduler;
use crate::symbols::Availability;
use statum::{machine, state};
use std::sync::Arc;
use tracing::{debug, info};

#[state]
#[derive(Debug, Clone)]
pub enum AnnounceStep {
    Acknowledged,
    ConfigPublished,
    EntitiesDiscovered,
    Online,
    Scheduled,
}

#[machine]
pub struct Announcement<S: AnnounceStep> {
    announcer: Announcer,
    shared: Arc<DeviceShared>,
}

impl Announcement<Acknowledged> {
    pub(crate) fn begin(announcer: Announcer, shared: Arc<DeviceShared>) -> Self {
        shared.advance(LifecycleState::Connected);
        shared.signals.connected.signal();
        Self::new(announcer, shared)
    }

    /// Publishes the device's own config and subscribes to its topics.
    pub(crate) async fn publish_discovery(self) -> Result<Announcement<ConfigPublished>, DeviceError> {
        let identity = &self.shared.identity;
        self.announcer
            .announce(&identity.topics, &identity.discovery_payload())
            .await?;
        for topic in identity.topics.all() {
            self.announcer.subscribe(topic).await?;
        }
        self.shared.advance(LifecycleState::DiscoveryPublished);
        Ok(self.transition())
    }
}

impl Announcement<ConfigPublished> {
    pub(crate) async fn discover_entities(
        self,
        registry: &mut EntityRegistry,
    ) -> Result<Announcement<EntitiesDiscovered>, DeviceError> {
        debug!("Discovering {} entities", registry.len());
        registry.discover_all(&self.announcer).await?;
        Ok(self.transition())
    }
}

impl Announcement<EntitiesDiscovered> {
    pub(crate) async fn mark_available(self) -> Result<Announcement<Online>, DeviceError> {
        self.announcer.settle().await;
        self.announcer
            .availability(&self.shared.identity.topics, Availability::Online)
            .await?;
        self.shared.set_available(true);
        self.shared.advance(LifecycleState::Available);
        self.shared.signals.available.signal();
        Ok(self.transition())
    }
}

impl Announcement<Online> {
    pub(crate) fn start_scheduler(self, scheduler: &mut Scheduler, device: WeakDeviceHandle) -> Announcement<Scheduled> {
        scheduler.start(device);
        self.shared.advance(LifecycleState::Running);
        self.transition()
    }
}

/// Publishes everything again after the transport reconnected. The lifecycle
/// does not change.
pub(crate) async fn reannounce(
    announcer: &Announcer,
    shared: &DeviceShared,
    registry: &mut EntityRegistry,
) -> Result<(), DeviceError> {
    let identity = &shared.identity;
    announcer
        .announce(&identity.topics, &identity.discovery_payload())
        .await?;
    for topic in identity.topics.all() {
        announcer.subscribe(topic).await?;
    }
    registry.discover_all(announcer).await?;
    announcer.settle().await;
    announcer
        .availability(&identity.topics, Availability::Online)
        .await?;
    info!("Re-announced {}", identity.name);
    Ok(())
}
