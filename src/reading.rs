use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::rate_gate::MetricKey;

/// Power distribution board status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PdReading {
    /// Overall state of charge in %
    pub battery: u8,
    /// Total input power in W
    pub in_power: i16,
    /// Total output power in W
    pub out_power: i16,
    /// Estimated time until full or empty, in minutes
    #[serde(rename = "remainingMins")]
    pub remaining_minutes: i32,
    pub timestamp: DateTime<Utc>,
}

/// Status of one battery pack
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BmsReading {
    /// Which pack reported. The main pack is 0, an extra battery is 1.
    pub cell_id: u8,
    /// State of charge in %
    pub level: u8,
    /// Pack temperature in °C
    #[serde(rename = "temp")]
    pub temperature: u8,
    #[serde(rename = "cycles")]
    pub cycle_count: u8,
    /// Pack voltage in V
    pub voltage: f64,
    pub in_power: i32,
    pub out_power: i32,
    #[serde(rename = "remainingMins")]
    pub remaining_minutes: i32,
    pub timestamp: DateTime<Utc>,
}

/// AC inverter status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InverterReading {
    pub ac_in_type: u8,
    /// W
    pub ac_in_power: i16,
    /// W
    pub ac_out_power: i16,
    /// V
    pub ac_in_voltage: f64,
    /// V
    pub ac_out_voltage: f64,
    /// A
    pub ac_in_current: f64,
    /// A
    pub ac_out_current: f64,
    /// °C
    #[serde(rename = "acOutTemp")]
    pub ac_out_temperature: i16,
    pub timestamp: DateTime<Utc>,
}

/// One decoded, normalised reading ready to be published.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reading {
    Pd(PdReading),
    Bms(BmsReading),
    Inverter(InverterReading),
}

impl Reading {
    /// The rate limiting class this reading belongs to.
    pub fn metric_key(&self) -> MetricKey {
        match self {
            Reading::Pd(_) => MetricKey::Pd,
            Reading::Bms(bms) => MetricKey::Bms(bms.cell_id),
            Reading::Inverter(_) => MetricKey::Inverter,
        }
    }

    /// Topic to publish on, e.g. `ecoflow_bms_1`.
    pub fn topic(&self, prefix: &str) -> String {
        match self {
            Reading::Pd(_) => format!("{prefix}_pd"),
            Reading::Bms(bms) => format!("{prefix}_bms_{}", bms.cell_id),
            Reading::Inverter(_) => format!("{prefix}_inverter"),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[test]
fn test_bms_json_keys() {
    let reading = Reading::Bms(BmsReading {
        cell_id: 1,
        level: 87,
        temperature: 24,
        cycle_count: 12,
        voltage: 52.5,
        in_power: 0,
        out_power: 120,
        remaining_minutes: 600,
        timestamp: DateTime::from_timestamp(0, 0).unwrap(),
    });

    let json: serde_json::Value = serde_json::from_str(&reading.to_json().unwrap()).unwrap();
    assert_eq!(json["cellId"], 1);
    assert_eq!(json["temp"], 24);
    assert_eq!(json["cycles"], 12);
    assert_eq!(json["voltage"], 52.5);
    assert_eq!(json["remainingMins"], 600);
    assert_eq!(json["timestamp"], "1970-01-01T00:00:00Z");
    assert_eq!(reading.topic("ecoflow"), "ecoflow_bms_1");
    assert_eq!(reading.metric_key(), MetricKey::Bms(1));
}
