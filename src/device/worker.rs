use super::announce::{self, Announcement};
use super::{
    Callback, CommandHandler, DeviceError, DeviceOptions, DeviceShared,
    LifecycleState, WeakDeviceHandle,
};
use crate::discovery::Announcer;
use crate::entity::{Entity, EntityId, EntityRegistry};
use crate::scheduler::{Interval, Scheduler};
use crate::symbols::Availability;
use crate::transport::{ConnectOptions, Message, Transport, TransportError, CONNECTION_ACCEPTED};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

type Response<T> = oneshot::Sender<Result<T, DeviceError>>;

macro_rules! respond {
    ($action:expr, $response_tx:expr) => {
        if $response_tx.send($action).is_err() {
            debug!("Caller dropped before the response was sent");
        }
    };
}

pub(crate) enum BrokerEvent {
    Connected(u8),
    Disconnected(u8),
    Message(Message),
}

pub(crate) enum DeviceCommand {
    Connect {
        options: ConnectOptions,
        response_tx: Response<()>,
    },
    Stop {
        response_tx: Response<()>,
    },
    Status {
        response_tx: Response<Option<String>>,
    },
    SetStatus {
        value: String,
        retain: bool,
        response_tx: Response<()>,
    },
    Availability {
        availability: Availability,
        response_tx: Response<()>,
    },
    Destroy {
        response_tx: Response<()>,
    },
    DestroyDiscovery {
        response_tx: Response<()>,
    },
    Register {
        id: EntityId,
        entity: Entity,
    },
    OnConnect(Callback),
    OnCommand(CommandHandler),
    OnInterval {
        interval: Interval,
        callback: Callback,
    },
    EntityState {
        id: EntityId,
        response_tx: Response<Option<String>>,
    },
    SetEntityState {
        id: EntityId,
        value: String,
        retain: bool,
        response_tx: Response<()>,
    },
    SetEntityAvailability {
        id: EntityId,
        availability: Availability,
        response_tx: Response<()>,
    },
    DestroyEntity {
        id: EntityId,
        response_tx: Response<()>,
    },
    Broker(BrokerEvent),
}

/// Owner of all mutable device state. Runs until every strong handle is gone.
pub(crate) struct Worker {
    device: WeakDeviceHandle,
    shared: Arc<DeviceShared>,
    transport: Arc<dyn Transport>,
    announcer: Announcer,
    registry: EntityRegistry,
    scheduler: Scheduler,
    on_connect: Option<Callback>,
    on_command: Option<CommandHandler>,
    status: Option<String>,
    announced: bool,
}

impl Worker {
    pub(crate) fn new(
        device: WeakDeviceHandle,
        shared: Arc<DeviceShared>,
        transport: Arc<dyn Transport>,
        options: &DeviceOptions,
    ) -> Self {
        let identity = &shared.identity;
        let registry = EntityRegistry::new(
            identity.discovery_prefix.clone(),
            identity.object_id.clone(),
            identity.descriptor.clone(),
        );
        let announcer = Announcer::new(
            transport.clone(),
            options.qos,
            options.retain_config,
            options.settle_delay,
        );
        Self {
            device,
            shared,
            transport,
            announcer,
            registry,
            scheduler: Scheduler::new(),
            on_connect: None,
            on_command: None,
            status: None,
            announced: false,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<DeviceCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        if self.state() < LifecycleState::Stopping {
            info!("Last handle of {} dropped, stopping", self.shared.identity.name);
            let _ = self.stop().await;
        }
        debug!("Device worker for {} finished", self.shared.identity.name);
    }

    fn state(&self) -> LifecycleState {
        self.shared.lifecycle()
    }

    fn require(&self, operation: &'static str, minimum: LifecycleState) -> Result<(), DeviceError> {
        let state = self.state();
        if state < minimum || state >= LifecycleState::Stopping {
            Err(DeviceError::InvalidState { operation, state })
        } else {
            Ok(())
        }
    }

    async fn handle(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::Connect {
                options,
                response_tx,
            } => {
                respond!(self.connect(options).await, response_tx);
            }
            DeviceCommand::Stop { response_tx } => {
                respond!(self.stop().await, response_tx);
            }
            DeviceCommand::Status { response_tx } => {
                respond!(Ok(self.status.clone()), response_tx);
            }
            DeviceCommand::SetStatus {
                value,
                retain,
                response_tx,
            } => {
                respond!(self.set_status(value, retain).await, response_tx);
            }
            DeviceCommand::Availability {
                availability,
                response_tx,
            } => {
                respond!(self.set_availability(availability).await, response_tx);
            }
            DeviceCommand::Destroy { response_tx } => {
                respond!(self.destroy().await, response_tx);
            }
            DeviceCommand::DestroyDiscovery { response_tx } => {
                respond!(self.destroy_discovery().await, response_tx);
            }
            DeviceCommand::Register { id, entity } => self.register(id, entity).await,
            DeviceCommand::OnConnect(callback) => self.on_connect = Some(callback),
            DeviceCommand::OnCommand(handler) => self.on_command = Some(handler),
            DeviceCommand::OnInterval { interval, callback } => {
                if let Err(e) = self.scheduler.add(interval, callback) {
                    warn!("Rejected interval job: {}", e);
                }
            }
            DeviceCommand::EntityState { id, response_tx } => {
                respond!(self.registry.state(id), response_tx);
            }
            DeviceCommand::SetEntityState {
                id,
                value,
                retain,
                response_tx,
            } => {
                respond!(
                    self.registry
                        .set_state(id, &value, retain, &self.announcer)
                        .await,
                    response_tx
                );
            }
            DeviceCommand::SetEntityAvailability {
                id,
                availability,
                response_tx,
            } => {
                respond!(
                    self.registry
                        .set_availability(id, availability, &self.announcer)
                        .await,
                    response_tx
                );
            }
            DeviceCommand::DestroyEntity { id, response_tx } => {
                respond!(self.registry.retract(id, &self.announcer).await, response_tx);
            }
            DeviceCommand::Broker(event) => self.broker_event(event).await,
        }
    }

    async fn connect(&mut self, options: ConnectOptions) -> Result<(), DeviceError> {
        let state = self.state();
        if state != LifecycleState::Created {
            return Err(DeviceError::InvalidState {
                operation: "connect",
                state,
            });
        }
        self.shared.advance(LifecycleState::Connecting);
        info!(
            "Connecting {} to {}:{}",
            self.shared.identity.name, options.host, options.port
        );
        if let Err(e) = self.transport.connect(&options).await {
            warn!("Transport connect failed: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    async fn broker_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected(code) => self.acknowledged(code).await,
            BrokerEvent::Disconnected(code) => {
                if self.state() < LifecycleState::Stopping {
                    warn!("Broker session lost, reason code {}", code);
                    self.shared.set_available(false);
                } else {
                    debug!("Broker session closed, reason code {}", code);
                }
            }
            BrokerEvent::Message(message) => self.message(message),
        }
    }

    async fn acknowledged(&mut self, code: u8) {
        if code != CONNECTION_ACCEPTED {
            error!(
                "Broker refused {} with reason code {}",
                self.shared.identity.name, code
            );
            return;
        }

        match self.state() {
            // a fresh session, or one whose announce broke off halfway
            LifecycleState::Connecting
            | LifecycleState::Connected
            | LifecycleState::DiscoveryPublished
            | LifecycleState::Available => {
                if let Err(e) = self.announce().await {
                    error!("Announcing {} failed: {}", self.shared.identity.name, e);
                }
            }
            LifecycleState::Running => {
                info!("Session re-established, announcing again");
                match announce::reannounce(&self.announcer, &self.shared, &mut self.registry).await {
                    Ok(()) => self.shared.set_available(true),
                    Err(e) => error!("Re-announcing {} failed: {}", self.shared.identity.name, e),
                }
            }
            state => debug!("Ignoring broker acknowledgement while {}", state),
        }
    }

    async fn announce(&mut self) -> Result<(), DeviceError> {
        let announcement = Announcement::begin(self.announcer.clone(), self.shared.clone());
        let announcement = announcement.publish_discovery().await?;
        self.announced = true;
        let announcement = announcement.discover_entities(&mut self.registry).await?;
        let announcement = announcement.mark_available().await?;
        announcement.start_scheduler(&mut self.scheduler, self.device.clone());

        if let (Some(callback), Some(device)) = (&self.on_connect, self.device.upgrade()) {
            callback.dispatch(device, ());
        }
        Ok(())
    }

    fn message(&mut self, message: Message) {
        let topics = &self.shared.identity.topics;
        let payload = message.payload_str().into_owned();

        if message.topic == topics.state {
            debug!("Status echo: {:?}", payload);
            self.status = Some(payload);
            self.shared.signals.status_ack.signal();
        } else if message.topic == topics.availability || message.topic == topics.config {
            // echoes of our own announcements
        } else if message.topic == topics.command {
            match (&self.on_command, self.device.upgrade()) {
                (Some(handler), Some(device)) => {
                    debug!("Device command: {:?}", payload);
                    handler.dispatch(device, payload);
                }
                _ => debug!("No handler for device command {:?}", payload),
            }
        } else if let Some((id, handler)) = self.registry.command_handler_for(&message.topic) {
            if let Some(device) = self.device.upgrade() {
                debug!("Command for {}: {:?}", id, payload);
                handler.dispatch(device, payload);
            }
        } else if !self.registry.observe_state(&message.topic, &payload) {
            debug!("Unhandled message on {}", message.topic);
        }
    }

    async fn register(&mut self, id: EntityId, entity: Entity) {
        self.registry.insert(id, entity);
        let state = self.state();
        if self.announced && state < LifecycleState::Stopping {
            if let Err(e) = self.registry.discover(id, &self.announcer).await {
                error!("Discovering {} failed: {}", id, e);
            }
        }
    }

    async fn set_status(&mut self, value: String, retain: bool) -> Result<(), DeviceError> {
        self.announcer
            .state(&self.shared.identity.topics, &value, retain)
            .await?;
        self.status = Some(value);
        self.shared.signals.status_ack.signal();
        Ok(())
    }

    async fn set_availability(&mut self, availability: Availability) -> Result<(), DeviceError> {
        let operation = match availability {
            Availability::Online => "mark available",
            Availability::Offline => "mark unavailable",
        };
        self.require(operation, LifecycleState::Connected)?;
        self.announcer
            .availability(&self.shared.identity.topics, availability)
            .await?;
        self.shared
            .set_available(availability == Availability::Online);
        Ok(())
    }

    async fn destroy(&mut self) -> Result<(), DeviceError> {
        info!("Removing {} from discovery", self.shared.identity.name);
        match self.announcer.retract(&self.shared.identity.topics).await {
            Err(TransportError::NotConnected) => {
                warn!("Not connected, {} config left as it is", self.shared.identity.name);
                Ok(())
            }
            outcome => Ok(outcome?),
        }
    }

    async fn destroy_discovery(&mut self) -> Result<(), DeviceError> {
        match self.registry.retract_all(&self.announcer).await {
            Err(DeviceError::Transport(TransportError::NotConnected)) => {
                warn!("Not connected, entity configs left as they are");
            }
            outcome => outcome?,
        }
        self.destroy().await
    }

    async fn stop(&mut self) -> Result<(), DeviceError> {
        if self.state() >= LifecycleState::Stopping {
            debug!("Device already stopped");
            return Ok(());
        }
        self.shared.advance(LifecycleState::Stopping);
        debug!("Stopping {} interval job(s)", self.scheduler.len());
        self.scheduler.stop().await;

        if self.announced {
            let offline = async {
                self.registry.offline_all(&self.announcer).await?;
                self.announcer
                    .availability(&self.shared.identity.topics, Availability::Offline)
                    .await?;
                Ok::<(), DeviceError>(())
            };
            if let Err(e) = offline.await {
                warn!("Could not publish offline availability: {}", e);
            }
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!("Transport disconnect failed: {}", e);
        }

        self.shared.set_available(false);
        self.shared.advance(LifecycleState::Disconnected);
        self.shared.signals.stopped.signal();
        Ok(())
    }
}
