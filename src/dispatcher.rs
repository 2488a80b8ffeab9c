//! Notification → frames → readings → rate gate → sink.

use chrono::Utc;
use tracing::{debug, trace, warn};

use crate::message::{self, frame, packet::DecodedPacket};
use crate::rate_gate::{Admission, RateGate};
use crate::sink::Sink;

/// What happened to the frames of one notification.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub frames: usize,
    pub published: usize,
    pub suppressed: usize,
    /// EMS and unknown packets
    pub unrouted: usize,
    pub short_payloads: usize,
    pub sink_failures: usize,
    /// Set when the notification ended in a malformed frame
    pub truncated: bool,
}

pub struct Dispatcher<S> {
    gate: RateGate,
    sink: S,
    topic_prefix: String,
}

impl<S: Sink> Dispatcher<S> {
    pub fn new(sink: S, gate: RateGate, topic_prefix: impl Into<String>) -> Self {
        Self {
            gate,
            sink,
            topic_prefix: topic_prefix.into(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Decode one notification and publish whatever the rate gate admits.
    ///
    /// Nothing in here is fatal. A malformed frame ends processing of this
    /// notification, a short payload or a failed delivery only loses that one reading.
    pub async fn dispatch(&mut self, notification: &[u8]) -> DispatchSummary {
        trace!("RX notification: 0x{}", hex::encode(notification));

        let captured_at = Utc::now();
        let mut summary = DispatchSummary::default();

        for frame in frame::split(notification) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("Discarding rest of notification: {err}");
                    summary.truncated = true;
                    break;
                }
            };
            summary.frames += 1;

            let packet = DecodedPacket::decode(&frame);
            let reading = match message::extract(&packet, captured_at) {
                Ok(Some(reading)) => reading,
                Ok(None) => {
                    trace!("Not routing {:?} packet", packet.kind);
                    summary.unrouted += 1;
                    continue;
                }
                Err(err) => {
                    warn!("Dropping {:?} packet: {err}", packet.kind);
                    summary.short_payloads += 1;
                    continue;
                }
            };

            let key = reading.metric_key();
            if self.gate.admit(key) == Admission::Suppress {
                trace!("Suppressed {key:?} reading");
                summary.suppressed += 1;
                continue;
            }

            let topic = reading.topic(&self.topic_prefix);
            match self.sink.publish(&topic, &reading).await {
                Ok(()) => {
                    debug!("Published {key:?} reading to {topic}");
                    summary.published += 1;
                }
                Err(err) => {
                    warn!("Sending to {topic} failed: {err}");
                    summary.sink_failures += 1;
                }
            }
        }

        summary
    }
}

#[cfg(test)]
#[derive(Default)]
struct RecordingSink {
    published: std::sync::Mutex<Vec<(String, crate::reading::Reading)>>,
    fail: bool,
}

#[cfg(test)]
#[async_trait::async_trait]
impl Sink for RecordingSink {
    async fn publish(
        &self,
        topic: &str,
        reading: &crate::reading::Reading,
    ) -> Result<(), crate::error::SinkError> {
        if self.fail {
            return Err(crate::error::SinkError::Delivery("broker unreachable".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), reading.clone()));
        Ok(())
    }
}

#[cfg(test)]
fn encode_frame(key: u8, discriminants: (u8, u8, u8), cell: u8, plain: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; frame::HEADER_LEN];
    bytes[..2].copy_from_slice(&frame::MAGIC);
    bytes[2..4].copy_from_slice(&(plain.len() as u16).to_le_bytes());
    bytes[6] = key;
    bytes[12] = discriminants.0;
    bytes[14] = discriminants.1;
    bytes[15] = discriminants.2;
    bytes[16] = cell;
    bytes.extend(crate::message::packet::xor_mask(plain, key));
    bytes
}

#[cfg(test)]
fn dispatcher(fail: bool) -> Dispatcher<RecordingSink> {
    let sink = RecordingSink {
        fail,
        ..Default::default()
    };
    Dispatcher::new(sink, RateGate::default(), "ecoflow")
}

#[tokio::test]
async fn test_pd_end_to_end() {
    let mut plain = vec![0u8; 21];
    plain[12] = 0x57;
    let notification = encode_frame(0x11, (2, 0x20, 0x02), 0, &plain);

    let mut dispatcher = dispatcher(false);
    let summary = dispatcher.dispatch(&notification).await;

    assert_eq!(summary.published, 1);
    let published = dispatcher.sink().published.lock().unwrap();
    assert_eq!(published[0].0, "ecoflow_pd");
    match &published[0].1 {
        crate::reading::Reading::Pd(pd) => assert_eq!(pd.battery, 0x57),
        other => panic!("unexpected reading {other:?}"),
    }
}

#[tokio::test]
async fn test_short_pd_payload_is_dropped() {
    let notification = encode_frame(0x11, (2, 0x20, 0x02), 0, &[1, 2, 3, 4, 5]);

    let mut dispatcher = dispatcher(false);
    let summary = dispatcher.dispatch(&notification).await;

    assert_eq!(summary.frames, 1);
    assert_eq!(summary.short_payloads, 1);
    assert_eq!(summary.published, 0);
}

#[tokio::test]
async fn test_short_frame_does_not_affect_siblings() {
    let mut notification = encode_frame(0x11, (2, 32, 2), 0, &[0; 4]);
    notification.extend(encode_frame(0x42, (4, 32, 2), 0, &[0; 32]));

    let mut dispatcher = dispatcher(false);
    let summary = dispatcher.dispatch(&notification).await;

    assert_eq!(summary.frames, 2);
    assert_eq!(summary.short_payloads, 1);
    assert_eq!(summary.published, 1);
}

#[tokio::test]
async fn test_two_frames_and_trailing_garbage() {
    let mut notification = encode_frame(0x11, (6, 32, 2), 0, &[0; 67]);
    notification.extend(encode_frame(0x23, (6, 32, 50), 1, &[0; 67]));
    notification.extend([0x01, 0x02, 0x03]);

    let mut dispatcher = dispatcher(false);
    let summary = dispatcher.dispatch(&notification).await;

    assert_eq!(summary.frames, 2);
    assert_eq!(summary.published, 2);
    assert!(!summary.truncated);
    let topics: Vec<_> = dispatcher
        .sink()
        .published
        .lock()
        .unwrap()
        .iter()
        .map(|(topic, _)| topic.clone())
        .collect();
    assert_eq!(topics, ["ecoflow_bms_0", "ecoflow_bms_1"]);
}

#[tokio::test]
async fn test_unrouted_and_rate_limited() {
    let mut notification = encode_frame(0x01, (3, 32, 2), 0, &[0; 10]);
    notification.extend(encode_frame(0x02, (9, 9, 9), 0, &[0; 10]));
    notification.extend(encode_frame(0x03, (4, 32, 2), 0, &[0; 40]));
    notification.extend(encode_frame(0x04, (4, 32, 2), 0, &[0; 40]));

    let mut dispatcher = dispatcher(false);
    let summary = dispatcher.dispatch(&notification).await;

    assert_eq!(summary.frames, 4);
    assert_eq!(summary.unrouted, 2);
    assert_eq!(summary.published, 1);
    assert_eq!(summary.suppressed, 1);
}

#[tokio::test]
async fn test_malformed_frame_truncates() {
    let mut notification = encode_frame(0x11, (4, 32, 2), 0, &[0; 32]);
    let mut cut = encode_frame(0x11, (2, 32, 2), 0, &[0; 21]);
    cut.truncate(frame::HEADER_LEN + 5);
    notification.extend(cut);

    let mut dispatcher = dispatcher(false);
    let summary = dispatcher.dispatch(&notification).await;

    assert_eq!(summary.frames, 1);
    assert_eq!(summary.published, 1);
    assert!(summary.truncated);
}

#[tokio::test]
async fn test_sink_failure_is_not_fatal() {
    let mut notification = encode_frame(0x11, (2, 32, 2), 0, &[0; 21]);
    notification.extend(encode_frame(0x11, (4, 32, 2), 0, &[0; 32]));

    let mut dispatcher = dispatcher(true);
    let summary = dispatcher.dispatch(&notification).await;

    assert_eq!(summary.frames, 2);
    assert_eq!(summary.sink_failures, 2);
    assert_eq!(summary.published, 0);
}
