use chrono::{DateTime, Utc};

use super::{i16_at, i32_at, require_len};
use crate::error::FrameError;
use crate::reading::PdReading;

/// Highest byte read is the last byte of `remaining_minutes`
const MIN_LEN: usize = 21;

/// A power distribution packet, unmasked payload.
pub(crate) struct PdMessage<'a>(&'a [u8]);

impl<'a> PdMessage<'a> {
    pub fn new(payload: &'a [u8]) -> Result<Self, FrameError> {
        require_len(payload, MIN_LEN)?;
        Ok(Self(payload))
    }

    pub fn battery_pct(&self) -> u8 {
        self.0[12]
    }

    pub fn out_power_w(&self) -> i16 {
        i16_at(self.0, 13)
    }

    pub fn in_power_w(&self) -> i16 {
        i16_at(self.0, 15)
    }

    pub fn remaining_minutes(&self) -> i32 {
        i32_at(self.0, 17)
    }

    pub fn into_reading(self, timestamp: DateTime<Utc>) -> PdReading {
        PdReading {
            battery: self.battery_pct(),
            in_power: self.in_power_w(),
            out_power: self.out_power_w(),
            remaining_minutes: self.remaining_minutes(),
            timestamp,
        }
    }
}

#[test]
fn test_pd_fields() {
    let payload = hex::decode("000000000000000000000000".to_owned() + "4b" + "2c01" + "6400" + "e8030000").unwrap();
    let message = PdMessage::new(&payload).unwrap();
    assert_eq!(message.battery_pct(), 75);
    assert_eq!(message.out_power_w(), 300);
    assert_eq!(message.in_power_w(), 100);
    assert_eq!(message.remaining_minutes(), 1000);
}

#[test]
fn test_pd_short_payload() {
    let payload = vec![0u8; MIN_LEN - 1];
    assert_eq!(
        PdMessage::new(&payload).err(),
        Some(FrameError::ShortPayload { needed: 21, actual: 20 })
    );
}
