use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::constants::{
    make_button_uuid, make_sensor_config_uuid, make_sensor_control_uuid, make_sensor_data_uuid, sensor_command,
    CONNECT_DEADLINE, IS_CONNECTED_DEADLINE, LINK_POLL_DELAY, SCAN_POLL_DELAY, SENSOR_DATA_HEADER, SENSOR_DATA_LEN,
    WRITE_DEADLINE,
};
use crate::device::manager::{DeviceManager, DeviceManagerFactory, ManagerListener};
use crate::device::types::{SamplingRate, SensorConfig, SensorListenerStatus, SensorSample};
use crate::error::DeviceError;

/// Characteristics of a connected eSense peripheral.
#[derive(Debug, Clone)]
struct Link {
    peripheral: Peripheral,
    control_char: Characteristic,
    data_char: Characteristic,
    button_char: Option<Characteristic>,
    config_char: Option<Characteristic>,
}

pub async fn start_scanning(manager: &Manager) -> Result<Vec<Adapter>, DeviceError> {
    let adapters = manager.adapters().await?;
    if adapters.is_empty() {
        return Err(DeviceError::NoAdapter);
    }

    for adapter in &adapters {
        info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        adapter.start_scan(ScanFilter::default()).await?;
    }

    Ok(adapters)
}

async fn stop_scanning(adapters: &[Adapter]) {
    for adapter in adapters {
        if let Err(err) = adapter.stop_scan().await {
            debug!("Failed to stop scanning: {:?}", err);
        }
    }
}

async fn find_peripheral(adapters: &[Adapter], name: &str) -> Option<(Peripheral, String)> {
    for adapter in adapters {
        let peripherals = match adapter.peripherals().await {
            Ok(v) => v,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripherals: {}", err);
                continue;
            },
        };

        for peripheral in peripherals {
            match peripheral.properties().await {
                Err(err) => {
                    warn!("Could not query peripheral for properties: {:?}", err);
                },
                Ok(None) => {},
                Ok(Some(properties)) => {
                    if properties.local_name.as_deref() == Some(name) {
                        info!("Using peripheral {} {:?} {}", properties.address, properties.address_type, name);
                        return Some((peripheral, name.to_string()));
                    }
                },
            }
        }
    }

    None
}

async fn connect_peripheral(peripheral: Peripheral) -> Result<Link, DeviceError> {
    info!("Connecting to peripheral...");
    peripheral.connect().await?;

    info!("Connected; Discovering services...");
    peripheral.discover_services().await?;

    let characteristics = peripheral.characteristics();
    let find = |uuid| characteristics.iter().find(|characteristic| characteristic.uuid == uuid).cloned();

    let control_char = find(make_sensor_control_uuid()).ok_or(DeviceError::MissingCharacteristic)?;
    let data_char = find(make_sensor_data_uuid()).ok_or(DeviceError::MissingCharacteristic)?;
    let button_char = find(make_button_uuid());
    let config_char = find(make_sensor_config_uuid());

    if let Some(button_char) = &button_char {
        peripheral.subscribe(button_char).await?;
    }

    Ok(Link { peripheral, control_char, data_char, button_char, config_char })
}

/// Decodes an IMU notification: header, packet index, checksum, size, then gyroscope and
/// accelerometer axes as big endian 16 bit integers.
pub fn decode_sample(value: &[u8], timestamp_ms: u64) -> Option<SensorSample> {
    if value.len() < SENSOR_DATA_LEN || value[0] != SENSOR_DATA_HEADER {
        return None;
    }

    let axis = |offset: usize| i16::from_be_bytes([value[offset], value[offset + 1]]);

    Some(SensorSample {
        timestamp_ms,
        packet_index: value[1],
        gyro: [axis(4), axis(6), axis(8)],
        accel: [axis(10), axis(12), axis(14)],
    })
}

pub fn decode_button(value: &[u8]) -> Option<bool> {
    value.get(3).map(|state| *state != 0)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

async fn write_command(link: &Link, command: &[u8]) -> bool {
    let fut = link.peripheral.write(&link.control_char, command, WriteType::WithResponse);

    tokio::select! {
        _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
            warn!("Sending to control characteristic took too long");
            false
        }
        result = fut => match result {
            Err(err) => {
                warn!("Failed to send to control characteristic: {:?}", err);
                false
            },
            Ok(()) => true,
        }
    }
}

async fn read_notifications(cancel: CancellationToken, link: Link, listener: Arc<dyn ManagerListener>) -> Result<(), DeviceError> {
    let mut notification_stream = link.peripheral.notifications().await?;
    let data_uuid = link.data_char.uuid;
    let button_uuid = link.button_char.as_ref().map(|characteristic| characteristic.uuid);

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            notification = notification_stream.next() => {
                let Some(data) = notification else {
                    break 'mainloop;
                };

                if data.uuid == data_uuid {
                    match decode_sample(&data.value, now_ms()) {
                        Some(sample) => listener.on_sensor_changed(sample),
                        None => warn!("Failed to decode sensor notification {:?}", data.value),
                    }
                } else if Some(data.uuid) == button_uuid {
                    if let Some(pressed) = decode_button(&data.value) {
                        listener.on_button_event_changed(pressed);
                    }
                }
            }
        }
    }

    Ok(())
}

async fn watch_link(cancel: CancellationToken, link: Link, shared_link: Arc<Mutex<Option<Link>>>, listener: Arc<dyn ManagerListener>) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(Duration::from_millis(LINK_POLL_DELAY)) => {},
        }

        let connected = tokio::select! {
            _ = sleep(Duration::from_millis(IS_CONNECTED_DEADLINE)) => {
                warn!("Checking for connection status took too long");
                false
            }
            result = link.peripheral.is_connected() => match result {
                Err(err) => {
                    warn!("Error checking for connection state: {:?}", err);
                    false
                },
                Ok(connected) => connected,
            }
        };

        if !connected {
            if cancel.is_cancelled() {
                return;
            }
            warn!("Connection lost");
            shared_link.lock().expect("Failed to lock link").take();
            cancel.cancel();
            listener.on_disconnected();
            return;
        }
    }
}

async fn connect_device(
    name: String,
    timeout_ms: u64,
    cancel: CancellationToken,
    shared_link: Arc<Mutex<Option<Link>>>,
    listener: Arc<dyn ManagerListener>,
) {
    let manager = match Manager::new().await {
        Ok(manager) => manager,
        Err(err) => {
            warn!("Failed to create BLE manager: {:?}", err);
            listener.on_device_not_found();
            return;
        },
    };

    let adapters = match start_scanning(&manager).await {
        Ok(adapters) => adapters,
        Err(err) => {
            warn!("Scanning failed {:?}", err);
            listener.on_device_not_found();
            return;
        },
    };

    let search = async {
        loop {
            if let Some(found) = find_peripheral(&adapters, &name).await {
                return found;
            }
            sleep(Duration::from_millis(SCAN_POLL_DELAY)).await;
        }
    };
    let found = timeout(Duration::from_millis(timeout_ms), search).await;
    stop_scanning(&adapters).await;

    let (peripheral, local_name) = match found {
        Ok(found) => found,
        Err(_) => {
            info!("Device {} not found within {} ms", name, timeout_ms);
            listener.on_device_not_found();
            return;
        },
    };
    listener.on_device_found();

    let link = tokio::select! {
        _ = sleep(Duration::from_millis(CONNECT_DEADLINE)) => {
            warn!("Connecting to peripheral took too long");
            None
        }
        result = connect_peripheral(peripheral.clone()) => match result {
            Err(err) => {
                warn!("Connecting to peripheral failed: {:?}", err);
                None
            },
            Ok(link) => Some(link),
        }
    };

    let Some(link) = link else {
        if let Err(err) = peripheral.disconnect().await {
            debug!("Failed to disconnect after failed connection: {:?}", err);
        }
        listener.on_disconnected();
        return;
    };

    if cancel.is_cancelled() {
        // disconnect() was called while connecting and already confirmed
        if let Err(err) = link.peripheral.disconnect().await {
            debug!("Failed to disconnect superseded peripheral: {:?}", err);
        }
        return;
    }

    *shared_link.lock().expect("Failed to lock link") = Some(link.clone());
    info!("Peripheral ready");
    listener.on_connected();
    listener.on_device_name_read(local_name);

    let notifications_cancel = cancel.clone();
    let notifications_link = link.clone();
    let notifications_listener = listener.clone();
    tokio::spawn(async move {
        if let Err(err) = read_notifications(notifications_cancel, notifications_link, notifications_listener).await {
            warn!("Error during read notifications task: {:?}", err);
        }
    });

    watch_link(cancel, link, shared_link, listener).await;
}

/// [`DeviceManager`] for one eSense earable, backed by btleplug.
pub struct BtleDeviceManager {
    name: String,
    listener: Arc<dyn ManagerListener>,
    runtime: Handle,
    cancel: CancellationToken,
    link: Arc<Mutex<Option<Link>>>,
    notifications_active: Arc<AtomicBool>,
}

impl BtleDeviceManager {
    pub fn new(name: &str, listener: Arc<dyn ManagerListener>, runtime: Handle) -> Self {
        BtleDeviceManager {
            name: name.to_string(),
            listener,
            runtime,
            cancel: CancellationToken::new(),
            link: Arc::new(Mutex::new(None)),
            notifications_active: Arc::new(AtomicBool::new(false)),
        }
    }

    fn current_link(&self) -> Option<Link> {
        self.link.lock().expect("Failed to lock link").clone()
    }
}

impl DeviceManager for BtleDeviceManager {
    fn connect(&self, timeout_ms: u64) {
        let name = self.name.clone();
        let cancel = self.cancel.clone();
        let link = self.link.clone();
        let listener = self.listener.clone();

        self.runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Connection attempt to {} cancelled", name);
                },
                _ = connect_device(name.clone(), timeout_ms, cancel.clone(), link, listener) => {},
            }
        });
    }

    fn disconnect(&self) {
        self.cancel.cancel();
        self.notifications_active.store(false, Ordering::SeqCst);
        let link = self.link.lock().expect("Failed to lock link").take();
        let listener = self.listener.clone();

        self.runtime.spawn(async move {
            if let Some(link) = link {
                // stop the IMU before the link goes away
                write_command(&link, &sensor_command(None)).await;
                info!("Disconnecting peripheral");
                if let Err(err) = link.peripheral.disconnect().await {
                    warn!("Failed to disconnect peripheral: {:?}", err);
                }
            }
            listener.on_disconnected();
        });
    }

    fn get_sensor_config(&self) -> bool {
        let Some(link) = self.current_link() else {
            return false;
        };
        let Some(config_char) = link.config_char.clone() else {
            return false;
        };
        let listener = self.listener.clone();

        self.runtime.spawn(async move {
            tokio::select! {
                _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
                    warn!("Reading the sensor configuration took too long");
                }
                result = link.peripheral.read(&config_char) => match result {
                    Err(err) => warn!("Failed to read the sensor configuration: {:?}", err),
                    Ok(value) => listener.on_sensor_config_read(SensorConfig::from_raw(&value)),
                }
            }
        });
        true
    }

    fn register_sensor_listener(&self, rate_hz: u8) -> SensorListenerStatus {
        let Some(rate) = SamplingRate::new(rate_hz as u32) else {
            return SensorListenerStatus::Rejected;
        };
        let Some(link) = self.current_link() else {
            return SensorListenerStatus::Rejected;
        };
        if self.notifications_active.swap(true, Ordering::SeqCst) {
            return SensorListenerStatus::AlreadyActive;
        }
        let active = self.notifications_active.clone();
        let listener = self.listener.clone();

        self.runtime.spawn(async move {
            if let Err(err) = link.peripheral.subscribe(&link.data_char).await {
                warn!("Failed to subscribe to sensor data: {:?}", err);
                active.store(false, Ordering::SeqCst);
                listener.on_sensor_notifications_failed();
                return;
            }
            if !write_command(&link, &sensor_command(Some(rate.hz()))).await {
                active.store(false, Ordering::SeqCst);
                if let Err(err) = link.peripheral.unsubscribe(&link.data_char).await {
                    debug!("Failed to unsubscribe from sensor data: {:?}", err);
                }
                listener.on_sensor_notifications_failed();
                return;
            }
            info!("Sensor notifications requested at {}", rate);
        });
        SensorListenerStatus::Started
    }

    fn unregister_event_listener(&self) -> bool {
        let Some(link) = self.current_link() else {
            return false;
        };
        if !self.notifications_active.swap(false, Ordering::SeqCst) {
            return false;
        }

        self.runtime.spawn(async move {
            write_command(&link, &sensor_command(None)).await;
            if let Err(err) = link.peripheral.unsubscribe(&link.data_char).await {
                warn!("Failed to unsubscribe from sensor data: {:?}", err);
            }
            info!("Sensor notifications stopped");
        });
        true
    }
}

impl Drop for BtleDeviceManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct BtleDeviceManagerFactory {
    runtime: Handle,
}

impl BtleDeviceManagerFactory {
    pub fn new(runtime: Handle) -> Self {
        BtleDeviceManagerFactory { runtime }
    }
}

impl DeviceManagerFactory for BtleDeviceManagerFactory {
    fn create(&self, name: &str, listener: Arc<dyn ManagerListener>) -> Arc<dyn DeviceManager> {
        Arc::new(BtleDeviceManager::new(name, listener, self.runtime.clone()))
    }
}
