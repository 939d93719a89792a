use std::any::Any;
use std::io;
use thiserror::Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,
}

impl DeviceError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, DeviceError::Btle { source: btleplug::Error::PermissionDenied })
    }
}

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Log storage is not available: {reason}")]
    StorageUnavailable { reason: String },

    #[error("Failed to open/write log file: {source}")]
    IOError { #[from] source: io::Error },
}

#[derive(Error, Debug)]
pub enum ReadinessError {
    #[error("A readiness check is already in progress")]
    AlreadyPending,

    #[error("Bluetooth LE is not supported on this host")]
    Unsupported,

    #[error("Readiness gate {gate} faulted: {message}")]
    GateFault { gate: String, message: String },

    #[error("Readiness gate {gate} failed (device): {source}")]
    Device { gate: String, source: DeviceError },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start the async runtime: {source}")]
    Runtime { #[from] source: io::Error },

    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (device): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Bluetooth is not ready: {reason}")]
    NotReady { reason: String },

    #[error("No device name given and none remembered from a previous run")]
    NoDeviceName,

    #[error("Device {name} was not found")]
    DeviceNotFound { name: String },

    #[error("Connection to device {name} was lost")]
    ConnectionLost { name: String },

    #[error("Device {name} did not start sending sensor data")]
    NotificationsFailed { name: String },

    #[error("Recording failed: {reason}")]
    RecordingFailed { reason: String },
}

pub fn readable_thread_panic_error(error: &Box<dyn Any + Send + 'static>) -> String {
    let mut stringified = String::from("???");

    if let Some(s) = error.downcast_ref::<&str>() {
        stringified = format!("{}", s);
    }
    else if let Some(s) = error.downcast_ref::<String>() {
        stringified = format!("{}", s);
    }
    let type_id = (**error).type_id();

    format!("panic from thread: [{:?}]: [{}]", type_id, stringified)
}
