use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{error, info};

use crate::device::types::{SensorConfig, SensorSample};
use crate::recorder::logger::EventLogger;
use crate::session::clock::MonotonicClock;
use crate::session::observer::SessionObserver;

pub const TAG_START: &str = "start";
pub const TAG_STOP: &str = "stop";
pub const TAG_CONNECTED: &str = "connected";
pub const TAG_DISCONNECTED: &str = "disconnected";
pub const TAG_DEVICE_NAME: &str = "device-name";
pub const TAG_CONFIG: &str = "config";
pub const TAG_SAMPLE: &str = "sample";
pub const TAG_BUTTON: &str = "button";
pub const TAG_BATTERY: &str = "battery";
pub const TAG_INTERVALS: &str = "intervals";
pub const TAG_ACCEL_OFFSET: &str = "accel-offset";
pub const TAG_NOTIFICATIONS_STARTED: &str = "notifications-started";
pub const TAG_NOTIFICATIONS_STOPPED: &str = "notifications-stopped";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingStatus {
    Idle,
    Recording,
    // a line could not be written, recording stopped
    Failed { reason: String },
}

struct RecorderState {
    logger: EventLogger,
    status: RecordingStatus,
    started_at: Duration,
}

/// Session observer that writes the events of a recording to the event log.
///
/// All writes go through one mutex, so events fanned out from different threads never interleave
/// within a line.
pub struct RecordingController {
    state: Mutex<RecorderState>,
    clock: Arc<dyn MonotonicClock>,
}

impl RecordingController {
    pub fn new(logger: EventLogger, clock: Arc<dyn MonotonicClock>) -> Self {
        RecordingController {
            state: Mutex::new(RecorderState {
                logger,
                status: RecordingStatus::Idle,
                started_at: Duration::ZERO,
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().expect("Failed to lock recorder state")
    }

    pub fn status(&self) -> RecordingStatus {
        self.lock().status.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.lock().status == RecordingStatus::Recording
    }

    pub fn current_file_name(&self) -> Option<String> {
        self.lock().logger.current_file_name().map(|name| name.to_string())
    }

    /// Starts a new log named after `base_name`. A recording in progress is stopped first.
    pub fn start_recording(&self, base_name: &str) -> bool {
        let mut state = self.lock();
        if state.status == RecordingStatus::Recording {
            self.write(&mut state, TAG_STOP, &[]);
        }

        state.logger.set_base_name(base_name);
        state.started_at = self.clock.now();
        state.status = RecordingStatus::Recording;
        self.write(&mut state, TAG_START, &[]);

        if state.status == RecordingStatus::Recording {
            info!("Recording to {}", state.logger.current_file_name().unwrap_or("?"));
            true
        } else {
            false
        }
    }

    /// Writes the stop line and closes the log. Returns false if nothing was being recorded or if
    /// the log could not be closed cleanly, the latter leaves the status `Failed`.
    pub fn stop_recording(&self) -> bool {
        let mut state = self.lock();
        if state.status != RecordingStatus::Recording {
            return false;
        }

        self.write(&mut state, TAG_STOP, &[]);
        if !state.logger.close() && state.status == RecordingStatus::Recording {
            state.status = RecordingStatus::Failed {
                reason: "unable to flush the event log".to_string(),
            };
        }
        if state.status != RecordingStatus::Recording {
            return false;
        }

        state.status = RecordingStatus::Idle;
        info!("Recording stopped");
        true
    }

    fn record(&self, tag: &str, fields: &[&dyn Display]) {
        let mut state = self.lock();
        self.write(&mut state, tag, fields);
    }

    fn write(&self, state: &mut RecorderState, tag: &str, fields: &[&dyn Display]) {
        if state.status != RecordingStatus::Recording {
            return;
        }

        let elapsed = self.clock.now().saturating_sub(state.started_at);
        if !state.logger.append(&elapsed.as_millis().to_string(), tag, fields) {
            error!("Unable to write {} to the event log, recording stopped", tag);
            state.logger.close();
            state.status = RecordingStatus::Failed {
                reason: format!("unable to write {} to the event log", tag),
            };
        }
    }
}

impl SessionObserver for RecordingController {
    fn on_connected(&self) {
        self.record(TAG_CONNECTED, &[]);
    }

    fn on_disconnected(&self) {
        self.record(TAG_DISCONNECTED, &[]);
    }

    fn on_battery_read(&self, voltage: f64) {
        self.record(TAG_BATTERY, &[&voltage]);
    }

    fn on_button_event_changed(&self, pressed: bool) {
        self.record(TAG_BUTTON, &[&u8::from(pressed)]);
    }

    fn on_advertisement_and_connection_interval_read(
        &self,
        min_advertisement_interval: u16,
        max_advertisement_interval: u16,
        min_connection_interval: u16,
        max_connection_interval: u16,
    ) {
        self.record(TAG_INTERVALS, &[
            &min_advertisement_interval,
            &max_advertisement_interval,
            &min_connection_interval,
            &max_connection_interval,
        ]);
    }

    fn on_device_name_read(&self, name: &str) {
        self.record(TAG_DEVICE_NAME, &[&name]);
    }

    fn on_sensor_config_read(&self, config: &SensorConfig) {
        let fields: Vec<&dyn Display> = config.raw.iter().map(|byte| byte as &dyn Display).collect();
        self.record(TAG_CONFIG, &fields);
    }

    fn on_accelerometer_offset_read(&self, offset_x: i32, offset_y: i32, offset_z: i32) {
        self.record(TAG_ACCEL_OFFSET, &[&offset_x, &offset_y, &offset_z]);
    }

    fn on_sensor_changed(&self, sample: &SensorSample) {
        let [gx, gy, gz] = &sample.gyro;
        let [ax, ay, az] = &sample.accel;
        self.record(TAG_SAMPLE, &[&sample.timestamp_ms, &sample.packet_index, gx, gy, gz, ax, ay, az]);
    }

    fn on_sensor_notifications_started(&self, rate_hz: u8) {
        self.record(TAG_NOTIFICATIONS_STARTED, &[&rate_hz]);
    }

    fn on_sensor_notifications_stopped(&self) {
        self.record(TAG_NOTIFICATIONS_STOPPED, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::logger::testing::MemoryStorage;
    use crate::recorder::logger::LogFormat;
    use crate::session::clock::testing::ManualClock;
    use crate::session::controller::testing::MockFactory;
    use crate::session::controller::{Session, SessionOptions};
    use std::sync::atomic::Ordering;

    fn setup() -> (Arc<RecordingController>, MemoryStorage, Arc<ManualClock>) {
        let storage = MemoryStorage::default();
        let clock = Arc::new(ManualClock::default());
        let logger = EventLogger::new(Box::new(storage.clone()), "unused", LogFormat::default());
        let controller = Arc::new(RecordingController::new(logger, clock.clone()));
        (controller, storage, clock)
    }

    #[test]
    fn records_session_events_with_elapsed_time() {
        let (controller, storage, clock) = setup();
        let factory = Arc::new(MockFactory::default());
        let session = Session::new(factory.clone(), clock.clone(), SessionOptions::default());
        session.subscribe(controller.clone());

        clock.set(Duration::from_millis(1_000));
        assert!(controller.start_recording("rec"));
        session.connect("eSense-0123");

        clock.advance(Duration::from_millis(40));
        factory.listener(0).on_connected();
        factory.listener(0).on_sensor_config_read(SensorConfig::from_raw(&[89, 6]));
        assert!(session.start_sensor_notifications(50));

        clock.advance(Duration::from_millis(20));
        factory.listener(0).on_sensor_changed(SensorSample {
            timestamp_ms: 1_700_000_000_000,
            packet_index: 3,
            gyro: [1, -2, 3],
            accel: [-4, 5, -6],
        });
        factory.listener(0).on_button_event_changed(true);

        clock.advance(Duration::from_millis(5));
        assert!(controller.stop_recording());
        assert!(!controller.stop_recording());
        assert_eq!(controller.status(), RecordingStatus::Idle);

        assert_eq!(
            storage.content("rec.txt").as_deref(),
            Some(concat!(
                "0\tstart\n",
                "40\tconnected\n",
                "40\tconfig\t89\t6\n",
                "40\tnotifications-started\t50\n",
                "60\tsample\t1700000000000\t3\t1\t-2\t3\t-4\t5\t-6\n",
                "60\tbutton\t1\n",
                "65\tstop\n",
            )),
        );
    }

    #[test]
    fn events_outside_a_recording_are_not_logged() {
        let (controller, storage, _) = setup();

        controller.on_connected();
        controller.on_battery_read(4.1);

        assert!(storage.file_names().is_empty());
        assert_eq!(controller.status(), RecordingStatus::Idle);
    }

    #[test]
    fn write_failure_stops_recording() {
        let (controller, storage, _) = setup();
        assert!(controller.start_recording("rec"));

        storage.fail_writes.store(true, Ordering::SeqCst);
        controller.on_battery_read(4.1);

        assert!(matches!(controller.status(), RecordingStatus::Failed { .. }));
        assert!(!controller.is_recording());

        // a new recording starts a fresh file
        storage.fail_writes.store(false, Ordering::SeqCst);
        assert!(controller.start_recording("rec"));
        controller.on_battery_read(3.9);
        assert_eq!(controller.current_file_name().as_deref(), Some("rec(1).txt"));
        assert_eq!(storage.content("rec(1).txt").as_deref(), Some("0\tstart\n0\tbattery\t3.9\n"));
    }

    #[test]
    fn unflushed_stop_reports_failure() {
        let (controller, storage, _) = setup();
        assert!(controller.start_recording("rec"));
        for index in 0..100 {
            controller.on_battery_read(index as f64);
        }

        storage.fail_flushes.store(true, Ordering::SeqCst);
        assert!(!controller.stop_recording());
        assert!(matches!(controller.status(), RecordingStatus::Failed { .. }));

        // every line that was accepted is complete in the file
        let content = storage.content("rec.txt").unwrap();
        assert_eq!(content.lines().count(), 101);
        assert!(content.ends_with("0\tbattery\t99\n"));
    }

    #[test]
    fn unavailable_storage_fails_start() {
        let (controller, storage, _) = setup();
        storage.unavailable.store(true, Ordering::SeqCst);

        assert!(!controller.start_recording("rec"));
        assert!(matches!(controller.status(), RecordingStatus::Failed { .. }));
    }
}
