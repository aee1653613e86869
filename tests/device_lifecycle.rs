use async_trait::async_trait;
use hass_device::device::{Handler, LifecycleState};
use hass_device::transport::{
    ConnectOptions, MemoryTransport, Transport, TransportError, TransportHandlers,
};
use hass_device::{Availability, Device, DeviceConfig, DeviceError, DeviceOptions, Entity, Interval, Qos};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const CONFIG: &str = "homeassistant/sensor/lamp/config";
const AVAILABILITY: &str = "homeassistant/sensor/lamp/availability";
const STATE: &str = "homeassistant/sensor/lamp/state";
const COMMAND: &str = "homeassistant/sensor/lamp/command";

fn options() -> DeviceOptions {
    DeviceOptions {
        settle_delay: Duration::ZERO,
        ..Default::default()
    }
}

fn lamp(transport: &Arc<MemoryTransport>) -> Device {
    Device::with_transport(DeviceConfig::new("Lamp"), options(), transport.clone()).unwrap()
}

async fn bring_up(device: &Device) {
    device.connect(ConnectOptions::default()).await.unwrap();
    let mut lifecycle = device.watch_lifecycle();
    timeout(
        Duration::from_secs(5),
        lifecycle.wait_for(|state| *state == LifecycleState::Running),
    )
    .await
    .expect("device did not reach running")
    .unwrap();
}

/// Memory broker whose first device config publish times out.
struct FirstConfigTimesOut {
    broker: Arc<MemoryTransport>,
    config_publishes: AtomicUsize,
}

#[async_trait]
impl Transport for FirstConfigTimesOut {
    async fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError> {
        self.broker.connect(options).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.broker.disconnect().await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), TransportError> {
        if topic == CONFIG && self.config_publishes.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(TransportError::Timeout(format!("publish to {}", topic)));
        }
        self.broker.publish(topic, payload, qos, retain).await
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        self.broker.subscribe(topic, qos).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.broker.unsubscribe(topic).await
    }

    fn handlers(&self) -> &TransportHandlers {
        self.broker.handlers()
    }
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn lamp_end_to_end() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    bring_up(&device).await;
    timeout(Duration::from_secs(1), device.wait_connected())
        .await
        .unwrap();

    let config = transport.last_payload(CONFIG).unwrap();
    assert!(config.contains("\"unique_id\":\"lamp\""));
    assert_eq!(transport.retained(AVAILABILITY).as_deref(), Some("online"));
    assert!(device.is_available());

    device.set_status("on", true).await.unwrap();
    let published = transport.published_to(STATE);
    let last = published.last().unwrap();
    assert_eq!(last.payload_str(), "on");
    assert!(last.retain);
    assert_eq!(transport.retained(STATE).as_deref(), Some("on"));
    assert_eq!(device.status().await.unwrap().as_deref(), Some("on"));

    device.destroy().await.unwrap();
    assert_eq!(transport.last_payload(CONFIG).as_deref(), Some(""));
}

#[tokio::test]
async fn config_is_published_before_availability() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    device.register(Entity::sensor("Power").unwrap()).unwrap();
    bring_up(&device).await;

    let topics: Vec<String> = transport
        .published()
        .into_iter()
        .map(|message| message.topic)
        .collect();
    let position = |topic: &str| topics.iter().position(|t| t == topic).unwrap();
    assert!(position(CONFIG) < position(AVAILABILITY));
    assert!(
        position("homeassistant/sensor/lamp_power/config")
            < position("homeassistant/sensor/lamp_power/availability")
    );
    assert!(position(CONFIG) < position("homeassistant/sensor/lamp_power/config"));
}

#[tokio::test]
async fn status_is_none_before_any_set() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    assert_eq!(device.status().await.unwrap(), None);
    bring_up(&device).await;
    assert_eq!(device.status().await.unwrap(), None);
}

#[tokio::test]
async fn status_echo_updates_cache() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    bring_up(&device).await;

    assert!(transport.inject(STATE, "42"));
    timeout(Duration::from_secs(1), device.status_set_confirm())
        .await
        .unwrap();
    assert_eq!(device.status().await.unwrap().as_deref(), Some("42"));
}

#[tokio::test]
async fn status_set_confirm_after_set() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    bring_up(&device).await;

    device.set_status("1", false).await.unwrap();
    timeout(Duration::from_secs(1), device.status_set_confirm())
        .await
        .unwrap();
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    bring_up(&device).await;

    device.destroy().await.unwrap();
    let once = (transport.retained(CONFIG), transport.last_payload(CONFIG));
    device.destroy().await.unwrap();
    let twice = (transport.retained(CONFIG), transport.last_payload(CONFIG));
    assert_eq!(once, twice);
    assert_eq!(twice, (None, Some(String::new())));
}

#[tokio::test]
async fn destroy_without_session_is_a_no_op() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    device.register(Entity::sensor("Power").unwrap()).unwrap();
    device.destroy().await.unwrap();
    device.destroy_discovery().await.unwrap();
    assert!(transport.published().is_empty());

    bring_up(&device).await;
    device.stop().await.unwrap();
    let published = transport.published().len();
    device.destroy().await.unwrap();
    device.destroy_discovery().await.unwrap();
    assert_eq!(transport.published().len(), published);
}

#[tokio::test]
async fn dropping_the_device_closes_the_session() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    let relay = Entity::switch("Relay").unwrap();
    device.register(relay).unwrap();
    bring_up(&device).await;
    assert!(transport.is_connected());

    drop(device);
    eventually(|| !transport.is_connected()).await;
    assert_eq!(transport.retained(AVAILABILITY).as_deref(), Some("offline"));
    assert_eq!(
        transport
            .retained("homeassistant/switch/lamp_relay/availability")
            .as_deref(),
        Some("offline")
    );
}

#[tokio::test]
async fn announce_resumes_after_a_failed_attempt() {
    let broker = Arc::new(MemoryTransport::new());
    let transport = Arc::new(FirstConfigTimesOut {
        broker: broker.clone(),
        config_publishes: AtomicUsize::new(0),
    });
    let device = Device::with_transport(DeviceConfig::new("Lamp"), options(), transport).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    device
        .on_connect(Handler::cooperative(move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .unwrap();

    device.connect(ConnectOptions::default()).await.unwrap();
    device.wait_connected().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(device.lifecycle(), LifecycleState::Connected);
    assert!(!device.is_available());
    assert!(broker.published_to(CONFIG).is_empty());

    // the session comes back and the broker acknowledges again
    broker.drop_connection(0x80);
    broker.connect(&ConnectOptions::default()).await.unwrap();
    let mut lifecycle = device.watch_lifecycle();
    timeout(
        Duration::from_secs(5),
        lifecycle.wait_for(|state| *state == LifecycleState::Running),
    )
    .await
    .expect("announce did not resume")
    .unwrap();

    assert_eq!(broker.published_to(CONFIG).len(), 1);
    assert_eq!(broker.retained(AVAILABILITY).as_deref(), Some("online"));
    assert!(device.is_available());
    eventually(|| calls.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn destroy_discovery_retracts_entities_first() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    device.register(Entity::switch("Relay").unwrap()).unwrap();
    device.register(Entity::binary_sensor("Door").unwrap()).unwrap();
    bring_up(&device).await;

    device.destroy_discovery().await.unwrap();
    let retracted: Vec<String> = transport
        .published()
        .into_iter()
        .filter(|message| message.payload.is_empty())
        .map(|message| message.topic)
        .collect();
    assert_eq!(
        retracted,
        vec![
            "homeassistant/switch/lamp_relay/config".to_string(),
            "homeassistant/binary_sensor/lamp_door/config".to_string(),
            CONFIG.to_string(),
        ]
    );
}

#[tokio::test]
async fn refused_connection_stays_connecting() {
    let transport = Arc::new(MemoryTransport::refusing(5));
    let device = lamp(&transport);
    device.connect(ConnectOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(device.lifecycle(), LifecycleState::Connecting);
    assert!(!device.is_available());
    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn connect_twice_is_rejected() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    bring_up(&device).await;
    assert!(matches!(
        device.connect(ConnectOptions::default()).await,
        Err(DeviceError::InvalidState {
            operation: "connect",
            state: LifecycleState::Running
        })
    ));
}

#[tokio::test]
async fn availability_requires_connection() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    assert!(matches!(
        device.available().await,
        Err(DeviceError::InvalidState { .. })
    ));

    bring_up(&device).await;
    device.unavailable().await.unwrap();
    assert!(!device.is_available());
    assert_eq!(transport.retained(AVAILABILITY).as_deref(), Some("offline"));
    device.available().await.unwrap();
    assert!(device.is_available());
}

#[tokio::test]
async fn stop_is_idempotent() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    let relay = device.register(Entity::switch("Relay").unwrap()).unwrap();
    bring_up(&device).await;

    device.stop().await.unwrap();
    device.stop().await.unwrap();
    assert_eq!(device.lifecycle(), LifecycleState::Disconnected);
    assert!(!transport.is_connected());
    assert!(!device.is_available());
    assert_eq!(transport.retained(AVAILABILITY).as_deref(), Some("offline"));
    assert_eq!(
        transport
            .retained("homeassistant/switch/lamp_relay/availability")
            .as_deref(),
        Some("offline")
    );
    assert!(matches!(
        device.set_entity_availability(relay, Availability::Online).await,
        Err(DeviceError::Transport(_))
    ));
}

#[tokio::test]
async fn run_returns_after_stop() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    let runner = device.handle();
    let run = tokio::spawn(async move { runner.run(ConnectOptions::default()).await });

    device.wait_available().await;
    device.stop().await.unwrap();
    timeout(Duration::from_secs(1), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn entity_commands_reach_their_handler() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let relay = Entity::switch("Relay")
        .unwrap()
        .with_initial_state("OFF")
        .on_command(Handler::cooperative(move |_, payload: String| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload);
            }
        }));
    let relay = device.register(relay).unwrap();
    bring_up(&device).await;

    assert_eq!(device.entity_state(relay).await.unwrap().as_deref(), Some("OFF"));
    assert!(transport.inject("homeassistant/switch/lamp_relay/command", "ON"));
    let payload = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(payload.as_deref(), Some("ON"));

    device.set_entity_state(relay, "ON", true).await.unwrap();
    assert_eq!(
        transport
            .retained("homeassistant/switch/lamp_relay/state")
            .as_deref(),
        Some("ON")
    );
}

#[tokio::test]
async fn device_command_handler_runs_blocking() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    device
        .on_command(Handler::blocking(|device, payload: String| {
            device
                .blocking_set_status(format!("got {}", payload), false)
                .unwrap();
        }))
        .unwrap();
    bring_up(&device).await;

    assert!(transport.inject(COMMAND, "ping"));
    eventually(|| transport.last_payload(STATE).as_deref() == Some("got ping")).await;
}

#[tokio::test]
async fn entity_registered_late_is_discovered() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    bring_up(&device).await;

    let power = device.register(Entity::sensor("Power").unwrap().with_unit("W")).unwrap();
    device.set_entity_state(power, "12", false).await.unwrap();

    let config = transport
        .last_payload("homeassistant/sensor/lamp_power/config")
        .unwrap();
    assert!(config.contains("\"unit_of_measurement\":\"W\""));
    assert_eq!(
        transport
            .retained("homeassistant/sensor/lamp_power/availability")
            .as_deref(),
        Some("online")
    );
}

#[tokio::test]
async fn unknown_entity_is_reported() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    let other = Device::with_transport(
        DeviceConfig::new("Other"),
        options(),
        Arc::new(MemoryTransport::new()),
    )
    .unwrap();
    let foreign = other.register(Entity::sensor("Power").unwrap()).unwrap();
    let _ = device.register(Entity::sensor("Power").unwrap()).unwrap();
    let _ = device.register(Entity::sensor("Voltage").unwrap()).unwrap();

    // ids are counted per device
    let _ = other.register(Entity::sensor("Current").unwrap()).unwrap();
    let missing = other.register(Entity::sensor("Energy").unwrap()).unwrap();
    assert!(matches!(
        device.entity_state(missing).await,
        Err(DeviceError::UnknownEntity(_))
    ));
    assert!(matches!(
        device.set_entity_state(foreign, "1", false).await,
        Err(DeviceError::EntityNotDiscovered(_))
    ));
}

#[tokio::test]
async fn on_connect_runs_once_per_announce() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    device
        .on_connect(Handler::cooperative(move |device, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = device.set_status("ready", true).await;
            }
        }))
        .unwrap();
    bring_up(&device).await;
    eventually(|| transport.retained(STATE).as_deref() == Some("ready")).await;

    // the transport reconnects on its own; the device announces again
    transport.drop_connection(0x80);
    transport.connect(&ConnectOptions::default()).await.unwrap();
    eventually(|| transport.published_to(CONFIG).len() == 2).await;
    eventually(|| transport.retained(AVAILABILITY).as_deref() == Some("online")).await;

    assert_eq!(device.lifecycle(), LifecycleState::Running);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn interval_jobs_run_while_running() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = ticks.clone();
    device
        .on_interval(
            Interval::seconds(1),
            Handler::cooperative(move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();
    assert!(matches!(
        device.on_interval(Interval::seconds(0), Handler::blocking(|_, _| {})),
        Err(DeviceError::Validation(_))
    ));

    bring_up(&device).await;
    tokio::time::sleep(Duration::from_millis(3500)).await;
    device.stop().await.unwrap();
    let fired = ticks.load(Ordering::SeqCst);
    assert!((2..=4).contains(&fired), "fired {}", fired);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), fired);
}

#[test]
fn blocking_and_async_callers_share_one_session() {
    let transport = Arc::new(MemoryTransport::new());
    let device = lamp(&transport);
    assert!(device.bridge().is_owned());

    device.blocking_connect(ConnectOptions::default()).unwrap();
    assert!(device.blocking_wait_available_timeout(Duration::from_secs(5)));

    let blocking = device.handle();
    let writer = std::thread::spawn(move || blocking.blocking_set_status("from thread", true));

    let suspending = device.handle();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime
        .block_on(async move { suspending.set_status("from task", true).await })
        .unwrap();
    writer.join().unwrap().unwrap();

    let status = device.blocking_status().unwrap().unwrap();
    assert!(status == "from thread" || status == "from task");
    let retained = transport.retained(STATE).unwrap();
    assert!(retained == "from thread" || retained == "from task");

    device.blocking_stop().unwrap();
    assert_eq!(device.lifecycle(), LifecycleState::Disconnected);
}
