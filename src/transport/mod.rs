//! The peripheral transport boundary.
//!
//! The supervisor never talks to a Bluetooth stack directly. Everything it
//! needs is behind [`Transport`], and everything the stack reports back
//! (discoveries, connection changes, notifications) arrives as a
//! [`TransportEvent`] on one ordered channel.

mod bluest_transport;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

pub use bluest_transport::BluestTransport;

/// Discovery filter applied by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub name_prefix: String,
    pub le_only: bool,
}

impl ScanFilter {
    pub fn matches(&self, name: &str) -> bool {
        name.starts_with(&self.name_prefix)
    }
}

/// Identity of a device as reported by the stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: String,
    pub alias: String,
}

#[derive(Debug)]
pub enum TransportEvent<D> {
    /// A device matching the scan filter was found
    Discovered(D),
    Connected,
    /// GATT services of the connected device can now be looked up
    ServicesResolved,
    Disconnected,
    /// The telemetry characteristic changed
    Notification(Vec<u8>),
}

pub type EventSender<D> = mpsc::UnboundedSender<TransportEvent<D>>;
pub type EventReceiver<D> = mpsc::UnboundedReceiver<TransportEvent<D>>;

#[async_trait]
pub trait Transport: Send + Sync {
    type Device: Clone + Send + Sync + 'static;
    type Service: Send + Sync;
    type Characteristic: Send + Sync;

    async fn set_powered(&self, on: bool) -> Result<(), TransportError>;

    /// Start discovery; matching devices are reported as [`TransportEvent::Discovered`].
    async fn start_scan(
        &self,
        filter: &ScanFilter,
        events: EventSender<Self::Device>,
    ) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn describe(&self, device: &Self::Device) -> DeviceInfo;

    /// Start reporting connection changes of `device` as events.
    async fn watch(
        &self,
        device: &Self::Device,
        events: EventSender<Self::Device>,
    ) -> Result<(), TransportError>;

    async fn connect(&self, device: &Self::Device) -> Result<(), TransportError>;

    async fn disconnect(&self, device: &Self::Device) -> Result<(), TransportError>;

    async fn is_connected(&self, device: &Self::Device) -> bool;

    /// UUIDs of every service the connected device exposes.
    async fn resolve_services(&self, device: &Self::Device) -> Result<Vec<Uuid>, TransportError>;

    async fn service(
        &self,
        device: &Self::Device,
        id: Uuid,
    ) -> Result<Option<Self::Service>, TransportError>;

    async fn characteristic(
        &self,
        service: &Self::Service,
        id: Uuid,
    ) -> Result<Option<Self::Characteristic>, TransportError>;

    /// Enable notifications; each value is reported as [`TransportEvent::Notification`].
    async fn subscribe(
        &self,
        characteristic: &Self::Characteristic,
        events: EventSender<Self::Device>,
    ) -> Result<(), TransportError>;

    /// Drop all notification subscriptions.
    async fn unsubscribe_all(&self);

    /// Release a device that is not (or no longer) managed.
    async fn dispose(&self, device: Self::Device);
}

#[test]
fn test_scan_filter_prefix() {
    let filter = ScanFilter {
        name_prefix: "R33".to_string(),
        le_only: true,
    };
    assert!(filter.matches("R331ZEB4ZE123456"));
    assert!(!filter.matches("DELTA2"));
    assert!(!filter.matches("r33"));
}
