//! Owns the single managed device and drives it from discovery to a live
//! notification subscription, reconnecting whenever the link drops.

mod state;

pub use state::{step, Action, State, Transition, MAX_MANAGED_DEVICES};

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, SupervisorError};
use crate::rate_gate::RateGate;
use crate::sink::Sink;
use crate::transport::{
    DeviceInfo, EventReceiver, EventSender, ScanFilter, Transport, TransportEvent,
};

/// The one device this process manages.
#[derive(Debug, Clone)]
pub struct PeripheralHandle<D> {
    pub device: D,
    pub info: DeviceInfo,
    pub connected: bool,
    pub services_resolved: bool,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub filter: ScanFilter,
    pub service_id: Uuid,
    pub characteristic_id: Uuid,
    /// Pause between failed connection attempts
    pub retry_interval: Duration,
    /// Upper bound on waiting for the device to disconnect during shutdown
    pub shutdown_timeout: Duration,
}

impl SupervisorSettings {
    // Connection state is polled at this rate while waiting for a disconnect
    pub const DISCONNECT_POLL: Duration = Duration::from_secs(1);

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            filter: ScanFilter {
                name_prefix: config.device.name_prefix.clone(),
                le_only: config.device.le_only,
            },
            service_id: config.device.service_id()?,
            characteristic_id: config.device.characteristic_id()?,
            retry_interval: config.device.retry_interval(),
            shutdown_timeout: config.device.shutdown_timeout(),
        })
    }
}

pub struct ConnectionSupervisor<T: Transport, S> {
    transport: T,
    dispatcher: Dispatcher<S>,
    settings: SupervisorSettings,
    state: watch::Sender<State>,
    shutdown: watch::Receiver<bool>,
    device: Option<PeripheralHandle<T::Device>>,
    events_tx: EventSender<T::Device>,
    events_rx: EventReceiver<T::Device>,
}

impl<T: Transport, S: Sink> ConnectionSupervisor<T, S> {
    pub fn new(
        transport: T,
        sink: S,
        settings: SupervisorSettings,
        min_interval: Duration,
        topic_prefix: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(State::Idle);

        Self {
            transport,
            dispatcher: Dispatcher::new(sink, RateGate::new(min_interval), topic_prefix),
            settings,
            state,
            shutdown,
            device: None,
            events_tx,
            events_rx,
        }
    }

    /// Observe state changes, e.g. to wait until the device is subscribed.
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    fn set_state(&self, next: State) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Supervisor state {previous:?} -> {next:?}");
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until shutdown is requested or the device turns out to be unusable,
    /// then tear down the link. A missing service or characteristic is returned
    /// as an error after the teardown.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let result = match self.start().await {
            Ok(()) => self.event_loop().await,
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            error!("Supervisor stopping: {err}");
        }

        self.shutdown_link().await;
        result
    }

    async fn start(&mut self) -> Result<(), SupervisorError> {
        self.power_cycle().await?;

        self.set_state(State::Scanning);
        self.transport
            .start_scan(&self.settings.filter, self.events_tx.clone())
            .await?;
        self.set_state(State::AwaitingFirstDevice);
        Ok(())
    }

    async fn event_loop(&mut self) -> Result<(), SupervisorError> {
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => return Ok(()),
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle(event).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn handle(&mut self, event: TransportEvent<T::Device>) -> Result<(), SupervisorError> {
        let managed = usize::from(self.device.is_some());
        let transition = step(self.state(), managed, event);
        self.set_state(transition.next);

        for action in transition.actions {
            self.execute(action).await?;
        }
        Ok(())
    }

    async fn execute(&mut self, action: Action<T::Device>) -> Result<(), SupervisorError> {
        match action {
            Action::StopScan => {
                if let Err(err) = self.transport.stop_scan().await {
                    warn!("Failed to stop discovery: {err}");
                }
            }
            Action::Adopt(device) => self.adopt(device).await?,
            Action::Dispose(device) => {
                let info = self.transport.describe(&device).await;
                info!(
                    "Ignoring {} {}, already managing a device",
                    info.address, info.alias
                );
                self.transport.dispose(device).await;
            }
            Action::ConnectWithRetry => self.connect_with_retry().await,
            Action::MarkConnected => {
                if let Some(handle) = self.device.as_mut() {
                    handle.connected = true;
                    info!("Device connected: {}", handle.info.address);
                }
            }
            Action::ResolveAndSubscribe => self.resolve_and_subscribe().await?,
            Action::Dispatch(data) => {
                self.dispatcher.dispatch(&data).await;
            }
            Action::Ignore(reason) => debug!("Event ignored: {reason}"),
        }
        Ok(())
    }

    async fn adopt(&mut self, device: T::Device) -> Result<(), SupervisorError> {
        let info = self.transport.describe(&device).await;
        info!("Will use {} {}", info.address, info.alias);

        self.transport.watch(&device, self.events_tx.clone()).await?;
        self.device = Some(PeripheralHandle {
            device,
            info,
            connected: false,
            services_resolved: false,
        });
        Ok(())
    }

    /// Keep trying to connect until the device reports connected or shutdown
    /// is requested. There is no attempt limit.
    ///
    /// A link that was already up before the first attempt never produces a
    /// connection event, so the lifecycle is advanced here once the link is up.
    async fn connect_with_retry(&mut self) {
        let Some(handle) = self.device.as_mut() else {
            return;
        };
        handle.connected = false;
        handle.services_resolved = false;
        let device = handle.device.clone();

        self.set_state(State::Connecting);

        let mut attempt = 0u64;
        while !self.transport.is_connected(&device).await {
            if self.shutdown_requested() {
                return;
            }

            attempt += 1;
            warn!("Trying to connect (attempt {attempt})...");

            tokio::select! {
                result = self.transport.connect(&device) => {
                    if let Err(err) = result {
                        error!(
                            "Connection failed, will retry in {}s: {err}",
                            self.settings.retry_interval.as_secs()
                        );
                    }
                }
                _ = wait_for_shutdown(&mut self.shutdown) => return,
            }

            if self.transport.is_connected(&device).await {
                break;
            }

            tokio::select! {
                _ = sleep(self.settings.retry_interval) => {}
                _ = wait_for_shutdown(&mut self.shutdown) => return,
            }
        }

        debug!("Link to the device is up after {attempt} attempt(s)");
        // Duplicates of events the transport reports as well are ignored by `step`
        for event in [TransportEvent::Connected, TransportEvent::ServicesResolved] {
            let _ = self.events_tx.send(event);
        }
    }

    async fn resolve_and_subscribe(&mut self) -> Result<(), SupervisorError> {
        let Some(handle) = self.device.as_mut() else {
            return Ok(());
        };
        handle.services_resolved = true;
        let device = handle.device.clone();

        match self.find_and_subscribe(&device).await {
            Ok(()) => {
                self.set_state(State::Subscribed);
                info!("Subscribed to telemetry notifications");
                Ok(())
            }
            Err(err) if err.is_required_capability_missing() => Err(err),
            Err(err) => {
                // A disconnect brings us back through the connect loop
                warn!("Service resolution failed, dropping the link: {err}");
                if let Err(err) = self.transport.disconnect(&device).await {
                    warn!("Disconnect failed: {err}");
                }
                Ok(())
            }
        }
    }

    async fn find_and_subscribe(&self, device: &T::Device) -> Result<(), SupervisorError> {
        let services = self.transport.resolve_services(device).await?;
        let listed: Vec<String> = services.iter().map(Uuid::to_string).collect();
        info!("Services resolved: {}", listed.join(", "));

        let service = self
            .transport
            .service(device, self.settings.service_id)
            .await?
            .ok_or(SupervisorError::ServiceMissing(self.settings.service_id))?;

        let characteristic = self
            .transport
            .characteristic(&service, self.settings.characteristic_id)
            .await?
            .ok_or(SupervisorError::CharacteristicMissing(
                self.settings.characteristic_id,
            ))?;

        // A reconnect must not leave the previous subscription delivering duplicates
        self.transport.unsubscribe_all().await;
        self.transport
            .subscribe(&characteristic, self.events_tx.clone())
            .await?;
        Ok(())
    }

    async fn power_cycle(&self) -> Result<(), SupervisorError> {
        self.transport.set_powered(false).await?;
        self.transport.set_powered(true).await?;
        Ok(())
    }

    /// Disconnect the device if needed, reset the adapter and drop every subscription.
    async fn shutdown_link(&mut self) {
        self.set_state(State::ShuttingDown);

        if let Some(handle) = self.device.take() {
            if self.transport.is_connected(&handle.device).await {
                info!("Disconnecting from {}...", handle.info.address);
                if let Err(err) = self.transport.disconnect(&handle.device).await {
                    warn!("Disconnect request failed: {err}");
                }

                let wait = async {
                    while self.transport.is_connected(&handle.device).await {
                        sleep(SupervisorSettings::DISCONNECT_POLL).await;
                    }
                };
                if timeout(self.settings.shutdown_timeout, wait).await.is_err() {
                    warn!(
                        "Device still connected after {}s, giving up",
                        self.settings.shutdown_timeout.as_secs()
                    );
                }
            }
            self.transport.dispose(handle.device).await;
        }

        self.transport.unsubscribe_all().await;
        if let Err(err) = self.power_cycle().await {
            warn!("Failed to reset the adapter: {err}");
        }
        self.dispatcher.sink().close().await;
        info!("Shutting down...");
    }
}

/// Resolves once shutdown is requested or the requesting side has gone away.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
