//! Per metric class minimum-interval throttle.
//!
//! The device pushes status packets several times a second. Only one reading
//! per metric class is let through per interval; everything in between is
//! dropped, not queued.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

/// The rate limiting class of a reading. Battery packs are tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKey {
    Pd,
    Bms(u8),
    Inverter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Suppress,
}

pub struct RateGate {
    min_interval: Duration,
    last_emitted: HashMap<MetricKey, Instant>,
}

impl RateGate {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emitted: HashMap::new(),
        }
    }

    /// Decide on `key` at the current time.
    pub fn admit(&mut self, key: MetricKey) -> Admission {
        self.admit_at(key, Instant::now())
    }

    /// Decide on `key` as if it were `now`. Admitting records `now` for the key.
    pub fn admit_at(&mut self, key: MetricKey, now: Instant) -> Admission {
        let due = match self.last_emitted.get(&key) {
            None => true,
            Some(&last) => now.saturating_duration_since(last) > self.min_interval,
        };

        if !due {
            return Admission::Suppress;
        }

        self.last_emitted.insert(key, now);
        Admission::Admit
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

#[test]
fn test_admit_suppress_admit() {
    let mut gate = RateGate::default();
    let start = Instant::now();

    assert_eq!(gate.admit_at(MetricKey::Pd, start), Admission::Admit);
    assert_eq!(
        gate.admit_at(MetricKey::Pd, start + Duration::from_secs(1)),
        Admission::Suppress
    );
    assert_eq!(
        gate.admit_at(MetricKey::Pd, start + Duration::from_secs(6)),
        Admission::Admit
    );
}

#[test]
fn test_exact_interval_is_suppressed() {
    let mut gate = RateGate::default();
    let start = Instant::now();

    gate.admit_at(MetricKey::Inverter, start);
    assert_eq!(
        gate.admit_at(MetricKey::Inverter, start + Duration::from_secs(5)),
        Admission::Suppress
    );
}

#[test]
fn test_suppressed_reading_does_not_reset_interval() {
    let mut gate = RateGate::default();
    let start = Instant::now();

    gate.admit_at(MetricKey::Pd, start);
    gate.admit_at(MetricKey::Pd, start + Duration::from_secs(4));
    assert_eq!(
        gate.admit_at(MetricKey::Pd, start + Duration::from_millis(5_001)),
        Admission::Admit
    );
}

#[test]
fn test_keys_are_independent() {
    let mut gate = RateGate::default();
    let start = Instant::now();

    assert_eq!(gate.admit_at(MetricKey::Bms(0), start), Admission::Admit);
    assert_eq!(gate.admit_at(MetricKey::Bms(1), start), Admission::Admit);
    assert_eq!(gate.admit_at(MetricKey::Pd, start), Admission::Admit);
    assert_eq!(gate.admit_at(MetricKey::Inverter, start), Admission::Admit);
    assert_eq!(gate.admit_at(MetricKey::Bms(0), start), Admission::Suppress);
}
