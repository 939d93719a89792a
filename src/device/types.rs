use std::fmt;

use crate::device::constants::{MAX_SAMPLING_RATE_HZ, MIN_SAMPLING_RATE_HZ};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    // scanning or connecting
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        };

        write!(f, "{}", result)
    }
}

/// Sampling rate of the IMU notifications in Hz, always within
/// [`MIN_SAMPLING_RATE_HZ`, `MAX_SAMPLING_RATE_HZ`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SamplingRate(u8);

impl SamplingRate {
    pub fn new(hz: u32) -> Option<SamplingRate> {
        if (MIN_SAMPLING_RATE_HZ as u32..=MAX_SAMPLING_RATE_HZ as u32).contains(&hz) {
            Some(SamplingRate(hz as u8))
        } else {
            None
        }
    }

    pub fn hz(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for SamplingRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.0)
    }
}

/// Sensor range/filter configuration as reported by the device. The content is
/// not interpreted, it is stored, forwarded and logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorConfig {
    pub raw: Vec<u8>,
}

impl SensorConfig {
    pub fn from_raw(raw: &[u8]) -> Self {
        SensorConfig { raw: raw.to_vec() }
    }
}

/// One raw motion reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorSample {
    // capture time, milliseconds since the unix epoch
    pub timestamp_ms: u64,
    pub packet_index: u8,
    pub gyro: [i16; 3],
    pub accel: [i16; 3],
}

/// Outcome of asking the device manager to start sensor notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorListenerStatus {
    Started,
    AlreadyActive,
    Rejected,
}
