use uuid::Uuid;

/**
 * How long (milliseconds) a connection attempt (scan + connect) may take before the device is
 * reported as not found.
 */
pub const CONNECTION_TIMEOUT_MS: u64 = 1500;

/**
 * How often (milliseconds) to look for the requested peripheral while scanning.
 */
pub const SCAN_POLL_DELAY: u64 = 100;

/**
 * How long (milliseconds) connecting to a found peripheral and discovering its services may take.
 */
pub const CONNECT_DEADLINE: u64 = 10000;

/**
 * How often (milliseconds) to check whether the peripheral is still connected.
 */
pub const LINK_POLL_DELAY: u64 = 500;

/**
 * How long (milliseconds) a read of / write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) checking if the peripheral is still connected may take
 */
pub const IS_CONNECTED_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) to wait for pending device commands and the disconnect on shutdown.
 */
pub const DISCONNECT_DEADLINE: u64 = 3000;

pub const MIN_SAMPLING_RATE_HZ: u8 = 1;
pub const MAX_SAMPLING_RATE_HZ: u8 = 100;
pub const DEFAULT_SAMPLING_RATE_HZ: u8 = 4;

/**
 * The characteristic used to start and stop the IMU notifications.
 */
pub const ESENSE_SENSOR_CONTROL_CHARACTERISTIC: &str = "0000ff07-0000-1000-8000-00805f9b34fb";

/**
 * The characteristic on which IMU samples are notified.
 */
pub const ESENSE_SENSOR_DATA_CHARACTERISTIC: &str = "0000ff08-0000-1000-8000-00805f9b34fb";

/**
 * The characteristic on which push button changes are notified.
 */
pub const ESENSE_BUTTON_CHARACTERISTIC: &str = "0000ff09-0000-1000-8000-00805f9b34fb";

/**
 * The characteristic holding the IMU range and filter configuration.
 */
pub const ESENSE_SENSOR_CONFIG_CHARACTERISTIC: &str = "0000ff0e-0000-1000-8000-00805f9b34fb";

pub const COMMAND_SENSOR_HEADER: u8 = 0x53;
pub const SENSOR_DATA_HEADER: u8 = 0x55;
// header, checksum, size, 3 * gyro, 3 * accel
pub const SENSOR_DATA_LEN: usize = 16;

/**
 * Builds the command enabling (`Some(rate)`) or disabling (`None`) the IMU notifications:
 * header, checksum, payload size, enable flag, rate.
 */
pub fn sensor_command(rate_hz: Option<u8>) -> [u8; 5] {
    let (enable, rate) = match rate_hz {
        Some(rate) => (0x01_u8, rate),
        None => (0x00_u8, 0x00_u8),
    };
    let size = 0x02_u8;
    let checksum = size.wrapping_add(enable).wrapping_add(rate);

    [COMMAND_SENSOR_HEADER, checksum, size, enable, rate]
}

pub fn make_sensor_control_uuid() -> Uuid {
    Uuid::parse_str(ESENSE_SENSOR_CONTROL_CHARACTERISTIC).unwrap()
}

pub fn make_sensor_data_uuid() -> Uuid {
    Uuid::parse_str(ESENSE_SENSOR_DATA_CHARACTERISTIC).unwrap()
}

pub fn make_button_uuid() -> Uuid {
    Uuid::parse_str(ESENSE_BUTTON_CHARACTERISTIC).unwrap()
}

pub fn make_sensor_config_uuid() -> Uuid {
    Uuid::parse_str(ESENSE_SENSOR_CONFIG_CHARACTERISTIC).unwrap()
}
