use thiserror::Error;
use uuid::Uuid;

/// Failures while splitting or decoding a single notification.
///
/// Both variants are recovered locally by the dispatcher: a malformed frame
/// truncates the rest of its notification, a short payload drops only that
/// frame's reading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame at offset {offset}: {reason}")]
    MalformedFrame { offset: usize, reason: &'static str },

    #[error("payload too short: need {needed} bytes, got {actual}")]
    ShortPayload { needed: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bluetooth adapter not available")]
    AdapterUnavailable,

    #[error("scan failed: {0}")]
    Scan(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("GATT error: {0}")]
    Gatt(String),

    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] bluest::Error),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to encode reading: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("required service {0} not found on device")]
    ServiceMissing(Uuid),

    #[error("required characteristic {0} not found on device")]
    CharacteristicMissing(Uuid),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SupervisorError {
    /// True for errors that mean the device can never be used, as opposed to
    /// a transient transport failure.
    pub fn is_required_capability_missing(&self) -> bool {
        matches!(
            self,
            SupervisorError::ServiceMissing(_) | SupervisorError::CharacteristicMissing(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
