//! Bridge configuration.
//!
//! Read from a TOML file; every field has a default so an empty or missing
//! file yields a working setup for the stock device:
//!
//! ```toml
//! [device]
//! name_prefix = "R33"
//! retry_interval_secs = 5
//!
//! [mqtt]
//! host = "192.168.1.10"
//! username = "ecoflow"
//! password = "secret"
//!
//! [publish]
//! min_interval_secs = 5
//! topic_prefix = "ecoflow"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::ConfigError;

pub const CONFIG_PATH_ENV: &str = "ECOFLOW_BRIDGE_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub mqtt: MqttConfig,
    pub publish: PublishConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Only devices whose advertised name starts with this are considered
    pub name_prefix: String,
    /// Restrict discovery to the LE transport
    pub le_only: bool,
    /// Service carrying the telemetry characteristic
    pub service_uuid: String,
    /// Characteristic that notifies telemetry frames
    pub characteristic_uuid: String,
    pub retry_interval_secs: u64,
    /// Upper bound on waiting for the device to disconnect during shutdown
    pub shutdown_timeout_secs: u64,
}

impl DeviceConfig {
    pub const DEFAULT_NAME_PREFIX: &'static str = "R33";
    pub const DEFAULT_SERVICE_UUID: &'static str = "00000001-0000-1000-8000-00805f9b34fb";
    pub const DEFAULT_CHARACTERISTIC_UUID: &'static str = "00000003-0000-1000-8000-00805f9b34fb";

    pub fn service_id(&self) -> Result<Uuid, ConfigError> {
        parse_uuid("device.service_uuid", &self.service_uuid)
    }

    pub fn characteristic_id(&self) -> Result<Uuid, ConfigError> {
        parse_uuid("device.characteristic_uuid", &self.characteristic_uuid)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name_prefix: Self::DEFAULT_NAME_PREFIX.to_string(),
            le_only: true,
            service_uuid: Self::DEFAULT_SERVICE_UUID.to_string(),
            characteristic_uuid: Self::DEFAULT_CHARACTERISTIC_UUID.to_string(),
            retry_interval_secs: 5,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// When false readings are only logged
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "ecoflow".to_string(),
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Minimum seconds between two readings of the same metric class
    pub min_interval_secs: u64,
    pub topic_prefix: String,
}

impl PublishConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 5,
            topic_prefix: "ecoflow".to_string(),
        }
    }
}

impl Config {
    /// Load from `path` if given, else from `$ECOFLOW_BRIDGE_CONFIG`, else from
    /// the per-user config directory. A missing file gives the defaults.
    /// Broker settings can be overridden with `MQTT_SERVER`, `MQTT_PORT`,
    /// `MQTT_USERNAME` and `MQTT_PASSWORD`.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = path
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(Self::default_path);

        let mut config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            Self::from_file(&path)?
        } else {
            info!("No configuration at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ecoflow-bridge")
            .join("config.toml")
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(host) = var("MQTT_SERVER") {
            self.mqtt.host = host;
        }
        if let Some(port) = var("MQTT_PORT") {
            self.mqtt.port = port.parse().map_err(|_| ConfigError::Invalid {
                field: "MQTT_PORT",
                reason: format!("{port:?} is not a port number"),
            })?;
        }
        if let Some(username) = var("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = var("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.service_id()?;
        self.device.characteristic_id()?;

        if self.device.retry_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "device.retry_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.publish.topic_prefix.is_empty() {
            return Err(ConfigError::Invalid {
                field: "publish.topic_prefix",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_uuid(field: &'static str, value: &str) -> Result<Uuid, ConfigError> {
    Uuid::parse_str(value).map_err(|err| ConfigError::Invalid {
        field,
        reason: err.to_string(),
    })
}

#[test]
fn test_defaults() {
    let config = Config::from_toml("").unwrap();
    config.validate().unwrap();
    assert_eq!(config.device.name_prefix, "R33");
    assert_eq!(
        config.device.service_id().unwrap(),
        Uuid::parse_str("00000001-0000-1000-8000-00805f9b34fb").unwrap()
    );
    assert_eq!(config.device.retry_interval(), Duration::from_secs(5));
    assert_eq!(config.publish.min_interval(), Duration::from_secs(5));
    assert_eq!(config.mqtt.client_id, "ecoflow");
}

#[test]
fn test_partial_file() {
    let config = Config::from_toml(
        r#"
        [mqtt]
        host = "broker.lan"
        username = "bridge"

        [publish]
        topic_prefix = "river"
        "#,
    )
    .unwrap();
    assert_eq!(config.mqtt.host, "broker.lan");
    assert_eq!(config.mqtt.port, 1883);
    assert_eq!(config.mqtt.username.as_deref(), Some("bridge"));
    assert_eq!(config.publish.topic_prefix, "river");
    assert_eq!(config.device.shutdown_timeout_secs, 30);
}

#[test]
fn test_env_overrides() {
    let mut config = Config::default();
    config
        .apply_env(|key| match key {
            "MQTT_SERVER" => Some("10.0.0.2".to_string()),
            "MQTT_PORT" => Some("8883".to_string()),
            _ => None,
        })
        .unwrap();
    assert_eq!(config.mqtt.host, "10.0.0.2");
    assert_eq!(config.mqtt.port, 8883);
    assert_eq!(config.mqtt.username, None);

    let err = config
        .apply_env(|key| (key == "MQTT_PORT").then(|| "none".to_string()))
        .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { field: "MQTT_PORT", .. }));
}

#[test]
fn test_invalid_uuid() {
    let config = Config::from_toml("[device]\nservice_uuid = \"not-a-uuid\"").unwrap();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Invalid { field: "device.service_uuid", .. })
    ));
}
