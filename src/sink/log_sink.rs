use async_trait::async_trait;
use tracing::info;

use super::Sink;
use crate::error::SinkError;
use crate::reading::Reading;

/// Writes every reading to the log as JSON. Used when no broker is configured.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn publish(&self, topic: &str, reading: &Reading) -> Result<(), SinkError> {
        let payload = reading.to_json()?;
        info!(topic, "{payload}");
        Ok(())
    }
}
