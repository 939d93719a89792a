use std::time::Duration;

use crate::device::types::{SensorConfig, SensorSample};

/// State derived from the device callbacks of the current connection. Everything is empty while
/// the session is disconnected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub device_name: Option<String>,
    pub last_config: Option<SensorConfig>,
    pub notifications_active: bool,
    pub sampling_rate_hz: Option<u8>,
    pub last_sample: Option<SensorSample>,
    // monotonic clock reading at which `last_sample` arrived
    pub last_sample_time: Option<Duration>,
    pub last_inter_sample_period: Option<Duration>,
}

impl SessionSnapshot {
    pub fn is_empty(&self) -> bool {
        *self == SessionSnapshot::default()
    }

    pub fn clear(&mut self) {
        *self = SessionSnapshot::default();
    }
}
