use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::Sink;
use crate::config::MqttConfig;
use crate::error::SinkError;
use crate::reading::Reading;

/// Publishes readings as JSON to an MQTT broker.
pub struct MqttSink {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

impl MqttSink {
    // How long to back off after the broker connection drops
    const RECONNECT_DELAY: Duration = Duration::from_secs(1);
    const REQUEST_CAPACITY: usize = 32;

    /// Create the client and start driving its event loop on a background task.
    ///
    /// The connection itself is established lazily by the event loop and
    /// re-established whenever it drops.
    pub fn connect(config: &MqttConfig) -> Self {
        info!(
            "Connecting to MQTT broker at {}:{}",
            config.host, config.port
        );

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }

        let (client, mut event_loop) = AsyncClient::new(options, Self::REQUEST_CAPACITY);

        let event_loop = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!("MQTT connected: {:?}", ack.code);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        info!("MQTT broker closed the connection");
                    }
                    Ok(event) => debug!("MQTT event: {event:?}"),
                    Err(err) => {
                        warn!("MQTT connection error: {err}");
                        sleep(Self::RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Self { client, event_loop }
    }
}

#[async_trait]
impl Sink for MqttSink {
    async fn publish(&self, topic: &str, reading: &Reading) -> Result<(), SinkError> {
        let payload = reading.to_json()?;
        info!(topic, "{payload}");

        // The request queue only drains while the broker is reachable
        self.client
            .try_publish(topic, QoS::ExactlyOnce, false, payload)
            .map_err(|err| SinkError::Delivery(err.to_string()))
    }

    async fn close(&self) {
        info!("Disconnecting MQTT client");
        if let Err(err) = self.client.try_disconnect() {
            warn!("MQTT disconnect failed: {err}");
        }
        self.event_loop.abort();
    }
}

#[tokio::test]
async fn test_unreachable_broker_does_not_block() {
    use chrono::Utc;
    use tokio::time::timeout;

    use crate::reading::PdReading;

    let config = MqttConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        ..Default::default()
    };
    let sink = MqttSink::connect(&config);
    let reading = Reading::Pd(PdReading {
        battery: 80,
        in_power: 0,
        out_power: 120,
        remaining_minutes: 300,
        timestamp: Utc::now(),
    });

    let mut dropped = 0;
    for _ in 0..2 * MqttSink::REQUEST_CAPACITY {
        let result = timeout(Duration::from_secs(1), sink.publish("ecoflow_pd", &reading))
            .await
            .expect("publish blocked on a full request queue");
        if let Err(err) = result {
            assert!(matches!(err, SinkError::Delivery(_)));
            dropped += 1;
        }
    }
    assert!(dropped >= MqttSink::REQUEST_CAPACITY);

    timeout(Duration::from_secs(1), sink.close())
        .await
        .expect("close blocked");
}
