//! The contract between a [`Session`](crate::session::controller::Session) and the BLE stack.
//!
//! A [`DeviceManager`] is a handle bound to one device name. Requests made on it return as soon
//! as they are dispatched; results come back later through the [`ManagerListener`] the handle
//! was created with.
//!
//! Implementations must never invoke the listener synchronously from inside one of the request
//! methods: the session may be holding its state lock while it dispatches a request.

use std::sync::Arc;

use crate::device::types::{SensorConfig, SensorListenerStatus, SensorSample};

pub trait DeviceManager: Send + Sync {
    /// Starts looking for the device and connects to it, giving up after `timeout_ms`.
    fn connect(&self, timeout_ms: u64);

    fn disconnect(&self);

    /// Requests the sensor configuration. Returns whether the request was accepted for dispatch.
    fn get_sensor_config(&self) -> bool;

    /// Requests IMU notifications at `rate_hz`. Rates outside [1, 100] are rejected.
    fn register_sensor_listener(&self, rate_hz: u8) -> SensorListenerStatus;

    /// Stops the IMU notifications. Returns whether the request was accepted for dispatch.
    fn unregister_event_listener(&self) -> bool;
}

pub trait DeviceManagerFactory: Send + Sync {
    fn create(&self, name: &str, listener: Arc<dyn ManagerListener>) -> Arc<dyn DeviceManager>;
}

/// Callbacks emitted by a [`DeviceManager`].
pub trait ManagerListener: Send + Sync {
    fn on_device_found(&self);
    fn on_device_not_found(&self);
    fn on_connected(&self);
    fn on_disconnected(&self);
    fn on_battery_read(&self, voltage: f64);
    fn on_button_event_changed(&self, pressed: bool);
    fn on_advertisement_and_connection_interval_read(
        &self,
        min_advertisement_interval: u16,
        max_advertisement_interval: u16,
        min_connection_interval: u16,
        max_connection_interval: u16,
    );
    fn on_device_name_read(&self, name: String);
    fn on_sensor_config_read(&self, config: SensorConfig);
    fn on_accelerometer_offset_read(&self, offset_x: i32, offset_y: i32, offset_z: i32);
    fn on_sensor_changed(&self, sample: SensorSample);
    /// Notifications accepted by `register_sensor_listener` could not be started after all.
    fn on_sensor_notifications_failed(&self);
}
