use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ecoflow_bridge::error::{SinkError, SupervisorError, TransportError};
use ecoflow_bridge::message::frame::{HEADER_LEN, MAGIC};
use ecoflow_bridge::message::packet::xor_mask;
use ecoflow_bridge::supervisor::MAX_MANAGED_DEVICES;
use ecoflow_bridge::transport::EventSender;
use ecoflow_bridge::{
    ConnectionSupervisor, DeviceInfo, Reading, ScanFilter, Sink, State, SupervisorSettings,
    Transport, TransportEvent,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use uuid::Uuid;

const SERVICE: &str = "00000001-0000-1000-8000-00805f9b34fb";
const CHARACTERISTIC: &str = "00000003-0000-1000-8000-00805f9b34fb";

#[derive(Default)]
struct Script {
    events: Option<EventSender<u32>>,
    connected: bool,
    failing_connects: usize,
    connect_attempts: usize,
    disconnect_requests: usize,
    watched: Vec<u32>,
    disposed: Vec<u32>,
    power: Vec<bool>,
    subscribes: usize,
    active_subscriptions: usize,
    scanning: bool,
    missing_characteristic: bool,
    failing_resolves: usize,
    /// The device keeps the link up whatever the host asks for
    ignores_disconnect: bool,
}

/// In-memory transport whose behaviour the test scripts.
#[derive(Clone, Default)]
struct ScriptedTransport(Arc<Mutex<Script>>);

impl ScriptedTransport {
    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    fn emit(&self, event: TransportEvent<u32>) {
        self.with(|s| s.events.clone())
            .expect("scan not started")
            .send(event)
            .unwrap();
    }

    /// The device drops the link on its own.
    fn drop_link(&self) {
        self.with(|s| s.connected = false);
        self.emit(TransportEvent::Disconnected);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    type Device = u32;
    type Service = ();
    type Characteristic = ();

    async fn set_powered(&self, on: bool) -> Result<(), TransportError> {
        self.with(|s| s.power.push(on));
        Ok(())
    }

    async fn start_scan(
        &self,
        _filter: &ScanFilter,
        events: EventSender<u32>,
    ) -> Result<(), TransportError> {
        self.with(|s| {
            s.events = Some(events);
            s.scanning = true;
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.with(|s| s.scanning = false);
        Ok(())
    }

    async fn describe(&self, device: &u32) -> DeviceInfo {
        DeviceInfo {
            address: format!("AA:BB:CC:DD:EE:{device:02X}"),
            alias: format!("R331ZEB{device}"),
        }
    }

    async fn watch(&self, device: &u32, _events: EventSender<u32>) -> Result<(), TransportError> {
        self.with(|s| s.watched.push(*device));
        Ok(())
    }

    async fn connect(&self, _device: &u32) -> Result<(), TransportError> {
        let outcome = self.with(|s| {
            s.connect_attempts += 1;
            if s.failing_connects > 0 {
                s.failing_connects -= 1;
                return Err(TransportError::Connect("le-connection-abort-by-local".to_string()));
            }
            s.connected = true;
            Ok(())
        });

        if outcome.is_ok() {
            self.emit(TransportEvent::Connected);
            self.emit(TransportEvent::ServicesResolved);
        }
        outcome
    }

    async fn disconnect(&self, _device: &u32) -> Result<(), TransportError> {
        let dropped = self.with(|s| {
            s.disconnect_requests += 1;
            let dropped = s.connected && !s.ignores_disconnect;
            if dropped {
                s.connected = false;
            }
            dropped
        });

        if dropped {
            if let Some(events) = self.with(|s| s.events.clone()) {
                let _ = events.send(TransportEvent::Disconnected);
            }
        }
        Ok(())
    }

    async fn is_connected(&self, _device: &u32) -> bool {
        self.with(|s| s.connected)
    }

    async fn resolve_services(&self, _device: &u32) -> Result<Vec<Uuid>, TransportError> {
        let failing = self.with(|s| {
            let failing = s.failing_resolves > 0;
            s.failing_resolves = s.failing_resolves.saturating_sub(1);
            failing
        });
        if failing {
            return Err(TransportError::Gatt("org.bluez.Error.Failed".to_string()));
        }
        Ok(vec![Uuid::parse_str(SERVICE).unwrap()])
    }

    async fn service(&self, _device: &u32, id: Uuid) -> Result<Option<()>, TransportError> {
        Ok((id == Uuid::parse_str(SERVICE).unwrap()).then_some(()))
    }

    async fn characteristic(&self, _service: &(), _id: Uuid) -> Result<Option<()>, TransportError> {
        Ok((!self.with(|s| s.missing_characteristic)).then_some(()))
    }

    async fn subscribe(&self, _characteristic: &(), _events: EventSender<u32>) -> Result<(), TransportError> {
        self.with(|s| {
            s.subscribes += 1;
            s.active_subscriptions += 1;
        });
        Ok(())
    }

    async fn unsubscribe_all(&self) {
        self.with(|s| s.active_subscriptions = 0);
    }

    async fn dispose(&self, device: u32) {
        self.with(|s| s.disposed.push(device));
    }
}

#[derive(Clone, Default)]
struct RecordingSink {
    published: Arc<Mutex<Vec<(String, Reading)>>>,
    closed: Arc<Mutex<bool>>,
}

impl RecordingSink {
    fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn publish(&self, topic: &str, reading: &Reading) -> Result<(), SinkError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), reading.clone()));
        Ok(())
    }

    async fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
}

struct Harness {
    sink: RecordingSink,
    state: watch::Receiver<State>,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<(), SupervisorError>>,
}

impl Harness {
    fn start(transport: ScriptedTransport) -> Self {
        let sink = RecordingSink::default();
        let settings = SupervisorSettings {
            filter: ScanFilter {
                name_prefix: "R33".to_string(),
                le_only: true,
            },
            service_id: Uuid::parse_str(SERVICE).unwrap(),
            characteristic_id: Uuid::parse_str(CHARACTERISTIC).unwrap(),
            retry_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        };
        let (stop, shutdown) = watch::channel(false);
        let supervisor = ConnectionSupervisor::new(
            transport,
            sink.clone(),
            settings,
            Duration::from_secs(5),
            "ecoflow",
            shutdown,
        );
        let state = supervisor.subscribe_state();
        let task = tokio::spawn(supervisor.run());

        Self {
            sink,
            state,
            stop,
            task,
        }
    }

    async fn reach(&mut self, expected: State) {
        timeout(Duration::from_secs(120), self.state.wait_for(|s| *s == expected))
            .await
            .unwrap_or_else(|_| panic!("never reached {expected:?}"))
            .unwrap();
    }

    async fn leave(&mut self, current: State) {
        timeout(Duration::from_secs(120), self.state.wait_for(|s| *s != current))
            .await
            .unwrap_or_else(|_| panic!("stuck in {current:?}"))
            .unwrap();
    }

    async fn shutdown(self) -> Result<(), SupervisorError> {
        self.stop.send_replace(true);
        timeout(Duration::from_secs(60), self.task)
            .await
            .expect("supervisor did not stop")
            .unwrap()
    }
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

fn pd_notification(battery: u8) -> Vec<u8> {
    let mut plain = vec![0u8; 21];
    plain[12] = battery;

    let mut bytes = vec![0u8; HEADER_LEN];
    bytes[..2].copy_from_slice(&MAGIC);
    bytes[2..4].copy_from_slice(&(plain.len() as u16).to_le_bytes());
    bytes[6] = 0x11;
    bytes[12] = 2;
    bytes[14] = 32;
    bytes[15] = 2;
    bytes.extend(xor_mask(&plain, 0x11));
    bytes
}

#[tokio::test(start_paused = true)]
async fn test_discover_connect_subscribe() {
    let transport = ScriptedTransport::default();
    let mut harness = Harness::start(transport.clone());

    harness.reach(State::AwaitingFirstDevice).await;
    assert_eq!(transport.with(|s| s.power.clone()), [false, true]);
    assert!(transport.with(|s| s.scanning));

    transport.emit(TransportEvent::Discovered(1));
    harness.reach(State::Subscribed).await;

    transport.with(|s| {
        assert!(!s.scanning);
        assert_eq!(s.watched, [1]);
        assert_eq!(s.connect_attempts, 1);
        assert_eq!(s.subscribes, 1);
    });

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_keeps_the_same_device() {
    let transport = ScriptedTransport::default();
    let mut harness = Harness::start(transport.clone());

    harness.reach(State::AwaitingFirstDevice).await;
    transport.emit(TransportEvent::Discovered(1));
    harness.reach(State::Subscribed).await;

    transport.with(|s| s.failing_connects = 2);
    transport.drop_link();
    harness.leave(State::Subscribed).await;
    harness.reach(State::Subscribed).await;

    transport.with(|s| {
        assert_eq!(s.watched, [1], "a second handle was created");
        assert!(s.disposed.is_empty());
        assert_eq!(s.connect_attempts, 4);
        assert_eq!(s.subscribes, 2);
        assert_eq!(s.active_subscriptions, 1);
    });

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_second_device_is_rejected() {
    assert_eq!(MAX_MANAGED_DEVICES, 1);

    let transport = ScriptedTransport::default();
    let mut harness = Harness::start(transport.clone());

    harness.reach(State::AwaitingFirstDevice).await;
    transport.emit(TransportEvent::Discovered(1));
    transport.emit(TransportEvent::Discovered(2));
    harness.reach(State::Subscribed).await;

    let probe = transport.clone();
    eventually(move || probe.with(|s| s.disposed == [2])).await;
    transport.with(|s| assert_eq!(s.watched, [1]));
    assert_eq!(*harness.state.borrow(), State::Subscribed);

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_notifications_are_rate_limited() {
    let transport = ScriptedTransport::default();
    let mut harness = Harness::start(transport.clone());

    harness.reach(State::AwaitingFirstDevice).await;
    transport.emit(TransportEvent::Discovered(1));
    harness.reach(State::Subscribed).await;

    transport.emit(TransportEvent::Notification(pd_notification(80)));
    transport.emit(TransportEvent::Notification(pd_notification(81)));
    let sink = harness.sink.clone();
    eventually(move || sink.topics().len() == 1).await;

    sleep(Duration::from_secs(6)).await;
    transport.emit(TransportEvent::Notification(pd_notification(82)));
    let sink = harness.sink.clone();
    eventually(move || sink.topics().len() == 2).await;

    let published = harness.sink.published.lock().unwrap().clone();
    let levels: Vec<u8> = published
        .iter()
        .map(|(_, reading)| match reading {
            Reading::Pd(pd) => pd.battery,
            other => panic!("unexpected reading {other:?}"),
        })
        .collect();
    assert_eq!(levels, [80, 82]);
    assert_eq!(harness.sink.topics(), ["ecoflow_pd", "ecoflow_pd"]);

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_missing_characteristic_is_fatal() {
    let transport = ScriptedTransport::default();
    transport.with(|s| s.missing_characteristic = true);
    let mut harness = Harness::start(transport.clone());

    harness.reach(State::AwaitingFirstDevice).await;
    transport.emit(TransportEvent::Discovered(1));

    let result = timeout(Duration::from_secs(60), harness.task)
        .await
        .expect("supervisor kept running")
        .unwrap();
    let err = result.unwrap_err();
    assert!(err.is_required_capability_missing());
    assert!(matches!(err, SupervisorError::CharacteristicMissing(_)));

    assert_eq!(*harness.state.borrow(), State::ShuttingDown);
    assert!(*harness.sink.closed.lock().unwrap());
    transport.with(|s| {
        assert_eq!(s.disconnect_requests, 1);
        assert_eq!(s.disposed, [1]);
        assert_eq!(s.power, [false, true, false, true]);
        assert_eq!(s.subscribes, 0);
    });
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_connect_retry() {
    let transport = ScriptedTransport::default();
    transport.with(|s| s.failing_connects = usize::MAX);
    let mut harness = Harness::start(transport.clone());

    harness.reach(State::AwaitingFirstDevice).await;
    transport.emit(TransportEvent::Discovered(1));
    harness.reach(State::Connecting).await;

    let probe = transport.clone();
    eventually(move || probe.with(|s| s.connect_attempts >= 1)).await;

    harness.shutdown().await.unwrap();

    transport.with(|s| {
        assert_eq!(s.disconnect_requests, 0);
        assert_eq!(s.disposed, [1]);
        assert!(s.connect_attempts < 10);
    });
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_disconnects_device() {
    let transport = ScriptedTransport::default();
    let mut harness = Harness::start(transport.clone());

    harness.reach(State::AwaitingFirstDevice).await;
    transport.emit(TransportEvent::Discovered(1));
    harness.reach(State::Subscribed).await;

    let sink = harness.sink.clone();
    harness.shutdown().await.unwrap();

    assert!(*sink.closed.lock().unwrap());
    transport.with(|s| {
        assert_eq!(s.disconnect_requests, 1);
        assert!(!s.connected);
        assert_eq!(s.active_subscriptions, 0);
        assert_eq!(s.power, [false, true, false, true]);
    });
}

#[tokio::test(start_paused = true)]
async fn test_already_connected_device_is_subscribed() {
    let transport = ScriptedTransport::default();
    transport.with(|s| s.connected = true);
    let mut harness = Harness::start(transport.clone());

    harness.reach(State::AwaitingFirstDevice).await;
    transport.emit(TransportEvent::Discovered(1));
    harness.reach(State::Subscribed).await;

    transport.with(|s| {
        assert_eq!(s.connect_attempts, 0);
        assert_eq!(s.subscribes, 1);
    });

    transport.emit(TransportEvent::Notification(pd_notification(64)));
    let sink = harness.sink.clone();
    eventually(move || sink.topics() == ["ecoflow_pd"]).await;

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_service_lookup_failure_reconnects() {
    let transport = ScriptedTransport::default();
    transport.with(|s| s.failing_resolves = 1);
    let mut harness = Harness::start(transport.clone());

    harness.reach(State::AwaitingFirstDevice).await;
    transport.emit(TransportEvent::Discovered(1));
    harness.reach(State::Subscribed).await;

    transport.with(|s| {
        assert_eq!(s.failing_resolves, 0);
        assert_eq!(s.disconnect_requests, 1);
        assert_eq!(s.connect_attempts, 2);
        assert_eq!(s.subscribes, 1);
        assert_eq!(s.watched, [1]);
    });
    assert!(!harness.task.is_finished());

    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_gives_up_on_a_device_that_stays_connected() {
    let transport = ScriptedTransport::default();
    transport.with(|s| s.ignores_disconnect = true);
    let mut harness = Harness::start(transport.clone());

    harness.reach(State::AwaitingFirstDevice).await;
    transport.emit(TransportEvent::Discovered(1));
    harness.reach(State::Subscribed).await;

    let sink = harness.sink.clone();
    let started = Instant::now();
    harness.shutdown().await.unwrap();
    let waited = started.elapsed();

    assert!(waited >= Duration::from_secs(30), "gave up after {waited:?}");
    assert!(waited < Duration::from_secs(35), "gave up after {waited:?}");
    assert!(*sink.closed.lock().unwrap());
    transport.with(|s| {
        assert!(s.connected);
        assert_eq!(s.disconnect_requests, 1);
        assert_eq!(s.disposed, [1]);
        assert_eq!(s.active_subscriptions, 0);
        assert_eq!(s.power, [false, true, false, true]);
    });
}
