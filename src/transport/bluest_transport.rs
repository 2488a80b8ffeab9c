//! [`Transport`] over the cross-platform `bluest` crate.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device, DeviceId, Service};
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{DeviceInfo, EventSender, ScanFilter, Transport, TransportEvent};
use crate::error::TransportError;

pub struct BluestTransport {
    adapter: Adapter,
    scan: Mutex<Option<JoinHandle<()>>>,
    watchers: Mutex<HashMap<DeviceId, JoinHandle<()>>>,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
}

impl BluestTransport {
    /// Open the system's default adapter.
    pub async fn new() -> anyhow::Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(anyhow!("Default adapter not found"))?;

        Ok(Self {
            adapter,
            scan: Mutex::new(None),
            watchers: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    async fn device_name(device: &Device, advertised: Option<&str>) -> String {
        match advertised {
            Some(name) => name.to_string(),
            None => device.name_async().await.unwrap_or_default(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for BluestTransport {
    type Device = Device;
    type Service = Service;
    type Characteristic = Characteristic;

    /// `bluest` cannot switch the adapter's power. Powering off is a no-op and
    /// powering on waits until the adapter is available.
    async fn set_powered(&self, on: bool) -> Result<(), TransportError> {
        if on {
            info!("Bluetooth adapter ON");
            self.adapter.wait_available().await?;
        } else {
            debug!("Bluetooth adapter OFF requested, power control not supported");
        }
        Ok(())
    }

    async fn start_scan(
        &self,
        filter: &ScanFilter,
        events: EventSender<Device>,
    ) -> Result<(), TransportError> {
        info!(
            "Discovering bluetooth devices (filter: \"{}\")...",
            filter.name_prefix
        );

        let adapter = self.adapter.clone();
        let filter = filter.clone();
        let task = tokio::spawn(async move {
            // bluest only ever scans the LE transport, so `le_only` needs no extra handling
            let mut scan = match adapter.scan(&[]).await {
                Ok(scan) => scan,
                Err(err) => {
                    error!("Failed to start discovery: {err}");
                    return;
                }
            };

            while let Some(found) = scan.next().await {
                let name = Self::device_name(&found.device, found.adv_data.local_name.as_deref()).await;
                if !filter.matches(&name) {
                    trace!("Ignoring bluetooth device {name:?}");
                    continue;
                }

                info!("Found bluetooth device: {name} ({:?})", found.device.id());
                if events.send(TransportEvent::Discovered(found.device)).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = lock(&self.scan).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        info!("Discovery stop requested");
        if let Some(task) = lock(&self.scan).take() {
            task.abort();
            info!("Discovery stopped");
        }
        Ok(())
    }

    async fn describe(&self, device: &Device) -> DeviceInfo {
        DeviceInfo {
            address: format!("{:?}", device.id()),
            alias: device.name_async().await.unwrap_or_default(),
        }
    }

    /// Returns once the connection event stream is registered, so no change
    /// made after this call is missed.
    async fn watch(&self, device: &Device, events: EventSender<Device>) -> Result<(), TransportError> {
        let adapter = self.adapter.clone();
        let watched = device.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut changes = match adapter.device_connection_events(&watched).await {
                Ok(changes) => {
                    let _ = ready_tx.send(Ok(()));
                    changes
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };

            while let Some(change) = changes.next().await {
                debug!("Device connection changed: {change:?}");
                let sent = match change {
                    // bluest resolves services on demand once connected
                    ConnectionEvent::Connected => events
                        .send(TransportEvent::Connected)
                        .and_then(|()| events.send(TransportEvent::ServicesResolved)),
                    ConnectionEvent::Disconnected => events.send(TransportEvent::Disconnected),
                };
                if sent.is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = lock(&self.watchers).insert(device.id(), task) {
            previous.abort();
        }

        match ready_rx.await {
            Ok(registered) => Ok(registered?),
            Err(_) => Err(TransportError::Gatt(
                "connection watcher stopped before it was registered".to_string(),
            )),
        }
    }

    async fn connect(&self, device: &Device) -> Result<(), TransportError> {
        self.adapter
            .connect_device(device)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))
    }

    async fn disconnect(&self, device: &Device) -> Result<(), TransportError> {
        self.adapter.disconnect_device(device).await?;
        Ok(())
    }

    async fn is_connected(&self, device: &Device) -> bool {
        device.is_connected().await
    }

    async fn resolve_services(&self, device: &Device) -> Result<Vec<Uuid>, TransportError> {
        let mut ids = Vec::new();
        for service in device.discover_services().await? {
            ids.push(service.uuid_async().await?);
        }
        Ok(ids)
    }

    async fn service(&self, device: &Device, id: Uuid) -> Result<Option<Service>, TransportError> {
        Ok(device
            .discover_services_with_uuid(id)
            .await?
            .first()
            .cloned())
    }

    async fn characteristic(
        &self,
        service: &Service,
        id: Uuid,
    ) -> Result<Option<Characteristic>, TransportError> {
        Ok(service
            .discover_characteristics_with_uuid(id)
            .await?
            .first()
            .cloned())
    }

    async fn subscribe(
        &self,
        characteristic: &Characteristic,
        events: EventSender<Device>,
    ) -> Result<(), TransportError> {
        let characteristic = characteristic.clone();
        let task = tokio::spawn(async move {
            let mut notifications = match characteristic.notify().await {
                Ok(notifications) => notifications,
                Err(err) => {
                    error!("Failed to enable notifications: {err}");
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                match notification {
                    Ok(data) => {
                        if events.send(TransportEvent::Notification(data)).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("Notification error: {err}"),
                }
            }

            debug!("End of notification stream");
        });

        lock(&self.subscriptions).push(task);
        Ok(())
    }

    async fn unsubscribe_all(&self) {
        for task in lock(&self.subscriptions).drain(..) {
            task.abort();
        }
    }

    async fn dispose(&self, device: Device) {
        if let Some(task) = lock(&self.watchers).remove(&device.id()) {
            task.abort();
        }
    }
}
