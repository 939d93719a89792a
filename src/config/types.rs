use serde::{Deserialize, Serialize};
use log::warn;

use crate::device::constants::{CONNECTION_TIMEOUT_MS, DEFAULT_SAMPLING_RATE_HZ};
use crate::device::types::SamplingRate;
use crate::recorder::logger::{LogFormat, DEFAULT_SEPARATOR, DEFAULT_TERMINATOR};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    // last used sampling rate, [1, 100]
    #[serde(default = "default_sampling_rate_hz")]
    pub sampling_rate_hz: u32,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default)]
    pub last_device_name: Option<String>,
    #[serde(default)]
    pub log_folder: Option<String>,
    #[serde(default = "default_log_separator")]
    pub log_separator: String,
    #[serde(default = "default_log_terminator")]
    pub log_terminator: String,
}

fn default_sampling_rate_hz() -> u32 {
    DEFAULT_SAMPLING_RATE_HZ as u32
}

fn default_connection_timeout_ms() -> u64 {
    CONNECTION_TIMEOUT_MS
}

fn default_log_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

fn default_log_terminator() -> String {
    DEFAULT_TERMINATOR.to_string()
}

impl Config {
    /// Replaces values that are out of range (e.g. edited by hand) by their defaults.
    pub fn normalize(&mut self) {
        if SamplingRate::new(self.sampling_rate_hz).is_none() {
            warn!("Ignoring invalid sampling rate {} from config, using {} Hz", self.sampling_rate_hz, DEFAULT_SAMPLING_RATE_HZ);
            self.sampling_rate_hz = default_sampling_rate_hz();
        }
        if self.connection_timeout_ms == 0 {
            self.connection_timeout_ms = default_connection_timeout_ms();
        }
        if self.log_separator.is_empty() {
            self.log_separator = default_log_separator();
        }
        if self.log_terminator.is_empty() {
            self.log_terminator = default_log_terminator();
        }
    }

    pub fn sampling_rate(&self) -> SamplingRate {
        SamplingRate::new(self.sampling_rate_hz)
            .or_else(|| SamplingRate::new(default_sampling_rate_hz()))
            .expect("Default sampling rate is out of range")
    }

    pub fn log_format(&self) -> LogFormat {
        LogFormat {
            separator: self.log_separator.clone(),
            terminator: self.log_terminator.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sampling_rate_hz: default_sampling_rate_hz(),
            connection_timeout_ms: default_connection_timeout_ms(),
            last_device_name: None,
            log_folder: None,
            log_separator: default_log_separator(),
            log_terminator: default_log_terminator(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.sampling_rate().hz(), 4);
        assert_eq!(config.log_format(), LogFormat::default());
    }

    #[test]
    fn camel_case_round_trip() {
        let config = Config {
            sampling_rate_hz: 50,
            last_device_name: Some("eSense-0123".to_string()),
            ..Config::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"samplingRateHz\":50"));
        assert!(json.contains("\"lastDeviceName\":\"eSense-0123\""));
        assert_eq!(serde_json::from_str::<Config>(&json).unwrap(), config);
    }

    #[test]
    fn out_of_range_rate_is_reset() {
        for rate in [0, 101, 5000] {
            let mut config = Config { sampling_rate_hz: rate, ..Config::default() };
            config.normalize();
            assert_eq!(config.sampling_rate_hz, 4);
        }

        for rate in [1, 100] {
            let mut config = Config { sampling_rate_hz: rate, ..Config::default() };
            config.normalize();
            assert_eq!(config.sampling_rate_hz, rate);
        }
    }
}
