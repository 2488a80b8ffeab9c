use chrono::{DateTime, Utc};

use super::{i16_at, milli_at, require_len};
use crate::error::FrameError;
use crate::reading::InverterReading;

/// Highest byte read is the last byte of `ac_out_temperature_c`
const MIN_LEN: usize = 32;

/// An AC inverter packet, unmasked payload.
pub(crate) struct InverterMessage<'a>(&'a [u8]);

impl<'a> InverterMessage<'a> {
    pub fn new(payload: &'a [u8]) -> Result<Self, FrameError> {
        require_len(payload, MIN_LEN)?;
        Ok(Self(payload))
    }

    pub fn ac_in_type(&self) -> u8 {
        self.0[6]
    }

    pub fn ac_in_power_w(&self) -> i16 {
        i16_at(self.0, 7)
    }

    pub fn ac_out_power_w(&self) -> i16 {
        i16_at(self.0, 9)
    }

    pub fn ac_out_voltage_v(&self) -> f64 {
        milli_at(self.0, 12)
    }

    pub fn ac_out_current_a(&self) -> f64 {
        milli_at(self.0, 16)
    }

    pub fn ac_in_voltage_v(&self) -> f64 {
        milli_at(self.0, 21)
    }

    pub fn ac_in_current_a(&self) -> f64 {
        milli_at(self.0, 25)
    }

    pub fn ac_out_temperature_c(&self) -> i16 {
        i16_at(self.0, 30)
    }

    pub fn into_reading(self, timestamp: DateTime<Utc>) -> InverterReading {
        InverterReading {
            ac_in_type: self.ac_in_type(),
            ac_in_power: self.ac_in_power_w(),
            ac_out_power: self.ac_out_power_w(),
            ac_in_voltage: self.ac_in_voltage_v(),
            ac_out_voltage: self.ac_out_voltage_v(),
            ac_in_current: self.ac_in_current_a(),
            ac_out_current: self.ac_out_current_a(),
            ac_out_temperature: self.ac_out_temperature_c(),
            timestamp,
        }
    }
}

#[test]
fn test_inverter_fields() {
    let mut payload = vec![0u8; MIN_LEN];
    payload[6] = 1;
    payload[7..9].copy_from_slice(&1200i16.to_le_bytes());
    payload[9..11].copy_from_slice(&450i16.to_le_bytes());
    payload[12..16].copy_from_slice(&230_000i32.to_le_bytes());
    payload[16..20].copy_from_slice(&1_500i32.to_le_bytes());
    payload[21..25].copy_from_slice(&229_500i32.to_le_bytes());
    payload[25..29].copy_from_slice(&5_250i32.to_le_bytes());
    payload[30..32].copy_from_slice(&41i16.to_le_bytes());

    let reading = InverterMessage::new(&payload).unwrap().into_reading(Utc::now());
    assert_eq!(reading.ac_in_type, 1);
    assert_eq!(reading.ac_in_power, 1200);
    assert_eq!(reading.ac_out_power, 450);
    assert_eq!(reading.ac_out_voltage, 230.0);
    assert_eq!(reading.ac_out_current, 1.5);
    assert_eq!(reading.ac_in_voltage, 229.5);
    assert_eq!(reading.ac_in_current, 5.25);
    assert_eq!(reading.ac_out_temperature, 41);
}

#[test]
fn test_inverter_short_payload() {
    assert!(InverterMessage::new(&[0u8; 31]).is_err());
    assert!(InverterMessage::new(&[0u8; 32]).is_ok());
}
