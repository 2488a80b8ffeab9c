//! The notification protocol: framing, unmasking and the per-kind field layouts.

pub(crate) mod bms_message;
pub mod frame;
pub(crate) mod inverter_message;
pub mod packet;
pub(crate) mod pd_message;

use chrono::{DateTime, Utc};

use crate::error::FrameError;
use crate::reading::Reading;
use bms_message::BmsMessage;
use inverter_message::InverterMessage;
use packet::{DecodedPacket, PacketKind};
use pd_message::PdMessage;

/// Extract the typed reading from a decoded packet.
///
/// Returns `Ok(None)` for kinds that are recognised but not routed
/// (EMS and unknown packets).
pub fn extract(packet: &DecodedPacket, captured_at: DateTime<Utc>) -> Result<Option<Reading>, FrameError> {
    let reading = match packet.kind {
        PacketKind::PowerDistribution => {
            Reading::Pd(PdMessage::new(&packet.payload)?.into_reading(captured_at))
        }
        PacketKind::BatteryManagement => Reading::Bms(
            BmsMessage::new(&packet.header, &packet.payload)?.into_reading(captured_at),
        ),
        PacketKind::Inverter => {
            Reading::Inverter(InverterMessage::new(&packet.payload)?.into_reading(captured_at))
        }
        PacketKind::EnergyManagementSystem | PacketKind::Unknown => return Ok(None),
    };
    Ok(Some(reading))
}

/// Fails with [`FrameError::ShortPayload`] unless `data` holds at least `needed` bytes.
fn require_len(data: &[u8], needed: usize) -> Result<(), FrameError> {
    if data.len() < needed {
        return Err(FrameError::ShortPayload {
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

fn i16_at(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn i32_at(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// A fixed point value in thousandths.
fn milli_at(data: &[u8], offset: usize) -> f64 {
    i32_at(data, offset) as f64 / 1000.0
}

#[test]
fn test_extract_unrouted_kinds() {
    let now = Utc::now();
    for kind in [PacketKind::EnergyManagementSystem, PacketKind::Unknown] {
        let packet = DecodedPacket {
            kind,
            header: [0; frame::HEADER_LEN],
            payload: vec![0; 100],
        };
        assert_eq!(extract(&packet, now), Ok(None));
    }
}

#[test]
fn test_little_endian_helpers() {
    let data = hex::decode("ff3412785634120018fcffff").unwrap();
    assert_eq!(i16_at(&data, 1), 0x1234);
    assert_eq!(i32_at(&data, 3), 0x12345678);
    assert_eq!(milli_at(&data, 8), -1.0);
}
