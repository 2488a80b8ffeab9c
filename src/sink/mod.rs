//! Destinations for admitted readings.

mod log_sink;
mod mqtt_sink;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::reading::Reading;

pub use log_sink::LogSink;
pub use mqtt_sink::MqttSink;

/// Accepts one reading per admitted emission.
///
/// Delivery is fire-and-forget from the caller's point of view: an error is
/// reported back so it can be logged, but nothing is retried or buffered.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn publish(&self, topic: &str, reading: &Reading) -> Result<(), SinkError>;

    /// Flush and disconnect. Called once during shutdown.
    async fn close(&self) {}
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for std::sync::Arc<S> {
    async fn publish(&self, topic: &str, reading: &Reading) -> Result<(), SinkError> {
        (**self).publish(topic, reading).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Box<S> {
    async fn publish(&self, topic: &str, reading: &Reading) -> Result<(), SinkError> {
        (**self).publish(topic, reading).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
