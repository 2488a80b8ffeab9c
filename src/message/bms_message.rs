use chrono::{DateTime, Utc};

use super::{i32_at, milli_at, require_len};
use crate::error::FrameError;
use crate::reading::BmsReading;

/// Highest byte read is the last byte of `remaining_minutes`
const MIN_LEN: usize = 67;

/// The pack id travels in the header, outside the masked payload
const CELL_ID_HEADER_OFFSET: usize = 16;

/// A battery management packet for one battery pack.
pub(crate) struct BmsMessage<'a> {
    cell_id: u8,
    payload: &'a [u8],
}

impl<'a> BmsMessage<'a> {
    pub fn new(header: &[u8], payload: &'a [u8]) -> Result<Self, FrameError> {
        require_len(payload, MIN_LEN)?;
        Ok(Self {
            cell_id: header[CELL_ID_HEADER_OFFSET],
            payload,
        })
    }

    pub fn cell_id(&self) -> u8 {
        self.cell_id
    }

    pub fn level_pct(&self) -> u8 {
        self.payload[9]
    }

    pub fn voltage_v(&self) -> f64 {
        milli_at(self.payload, 10)
    }

    pub fn temperature_c(&self) -> u8 {
        self.payload[18]
    }

    pub fn cycle_count(&self) -> u8 {
        self.payload[32]
    }

    pub fn in_power_w(&self) -> i32 {
        i32_at(self.payload, 55)
    }

    pub fn out_power_w(&self) -> i32 {
        i32_at(self.payload, 59)
    }

    pub fn remaining_minutes(&self) -> i32 {
        i32_at(self.payload, 63)
    }

    pub fn into_reading(self, timestamp: DateTime<Utc>) -> BmsReading {
        BmsReading {
            cell_id: self.cell_id(),
            level: self.level_pct(),
            temperature: self.temperature_c(),
            cycle_count: self.cycle_count(),
            voltage: self.voltage_v(),
            in_power: self.in_power_w(),
            out_power: self.out_power_w(),
            remaining_minutes: self.remaining_minutes(),
            timestamp,
        }
    }
}

#[test]
fn test_bms_fields() {
    let mut header = [0u8; 18];
    header[16] = 1;
    let mut payload = vec![0u8; MIN_LEN];
    payload[9] = 64;
    payload[10..14].copy_from_slice(&52_480i32.to_le_bytes());
    payload[18] = 27;
    payload[32] = 9;
    payload[55..59].copy_from_slice(&250i32.to_le_bytes());
    payload[59..63].copy_from_slice(&(-3i32).to_le_bytes());
    payload[63..67].copy_from_slice(&95i32.to_le_bytes());

    let message = BmsMessage::new(&header, &payload).unwrap();
    assert_eq!(message.cell_id(), 1);
    assert_eq!(message.level_pct(), 64);
    assert_eq!(message.voltage_v(), 52.48);
    assert_eq!(message.temperature_c(), 27);
    assert_eq!(message.cycle_count(), 9);
    assert_eq!(message.in_power_w(), 250);
    assert_eq!(message.out_power_w(), -3);
    assert_eq!(message.remaining_minutes(), 95);
}

#[test]
fn test_bms_short_payload() {
    let header = [0u8; 18];
    let payload = vec![0u8; 66];
    assert!(matches!(
        BmsMessage::new(&header, &payload),
        Err(FrameError::ShortPayload { needed: 67, actual: 66 })
    ));
}
