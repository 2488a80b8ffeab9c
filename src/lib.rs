//! Bridge telemetry from an EcoFlow-style portable power station over Bluetooth Low Energy to MQTT.
//!
//! Tested against a River series unit advertising with a name starting with `R33`.
//!
//! The power station pushes its status as notifications on a single GATT characteristic.
//! Each notification carries one or more frames of a proprietary protocol: an 18 byte
//! header starting with `[0xAA, 0x02]` and a payload that is XOR masked with a key
//! byte from the header. Three header bytes tell what the frame is about.
//!
//! Currently the following data is decoded:
//!
//! - Power distribution: state of charge (%), input and output power (W), remaining time (min)
//! - Battery packs: level (%), temperature, cycles, voltage (V), input and output power, remaining time
//! - Inverter: AC input and output power, voltage, current and temperature
//!
//! Readings are throttled to one per kind (and per battery pack) every few seconds and
//! published as JSON.
//!
//! # Example
//!
//! ```no_run
//! # use ecoflow_bridge::{BluestTransport, Config, ConnectionSupervisor, LogSink, SupervisorSettings};
//! #
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let (_stop, shutdown) = tokio::sync::watch::channel(false);
//!     let supervisor = ConnectionSupervisor::new(
//!         BluestTransport::new().await?,
//!         LogSink,
//!         SupervisorSettings::from_config(&config)?,
//!         config.publish.min_interval(),
//!         &config.publish.topic_prefix,
//!         shutdown,
//!     );
//!     supervisor.run().await?;
//! #   Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod rate_gate;
pub mod reading;
pub mod sink;
pub mod supervisor;
pub mod transport;

pub use config::Config;
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use error::{ConfigError, FrameError, SinkError, SupervisorError, TransportError};
pub use rate_gate::{Admission, MetricKey, RateGate};
pub use reading::{BmsReading, InverterReading, PdReading, Reading};
pub use sink::{LogSink, MqttSink, Sink};
pub use supervisor::{ConnectionSupervisor, PeripheralHandle, State, SupervisorSettings};
pub use transport::{BluestTransport, DeviceInfo, ScanFilter, Transport, TransportEvent};
