use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, info, warn};

use crate::device::constants::CONNECTION_TIMEOUT_MS;
use crate::device::manager::{DeviceManager, DeviceManagerFactory, ManagerListener};
use crate::device::types::{ConnectionState, SensorConfig, SensorListenerStatus, SensorSample};
use crate::session::clock::{period_between, MonotonicClock};
use crate::session::observer::{fan_out, ObserverHandle, ObserverSet, SessionEvent};
use crate::session::snapshot::SessionSnapshot;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connection_timeout_ms: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions { connection_timeout_ms: CONNECTION_TIMEOUT_MS }
    }
}

struct SessionInner {
    state: ConnectionState,
    snapshot: SessionSnapshot,
    observers: ObserverSet,
    manager: Option<Arc<dyn DeviceManager>>,
    // bumped on every connect, callbacks carrying an older value come from a superseded handle
    generation: u64,
}

impl SessionInner {
    fn enter_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.snapshot.clear();
    }
}

struct SessionShared {
    inner: Mutex<SessionInner>,
    factory: Arc<dyn DeviceManagerFactory>,
    clock: Arc<dyn MonotonicClock>,
    options: SessionOptions,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("Failed to lock session state")
    }

    /// Applies `update` for a callback coming from the handle of `generation`, then fans out the
    /// event it returns. The observers are called after the lock is released.
    fn handle_callback<F>(&self, generation: u64, update: F)
    where
        F: FnOnce(&mut SessionInner, &dyn MonotonicClock) -> Option<SessionEvent>,
    {
        let (event, targets) = {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!("Ignoring callback from superseded device manager (generation {})", generation);
                return;
            }

            match update(&mut inner, self.clock.as_ref()) {
                Some(event) => (event, inner.observers.snapshot()),
                None => return,
            }
        };

        fan_out(&targets, &event);
    }
}

/// Owns the connection lifecycle of one device and the state derived from its callbacks.
///
/// `Session` is a cheap handle; clones share the same state. Public operations and device
/// callbacks may arrive from different threads.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub fn new(factory: Arc<dyn DeviceManagerFactory>, clock: Arc<dyn MonotonicClock>, options: SessionOptions) -> Self {
        let inner = SessionInner {
            state: ConnectionState::Disconnected,
            snapshot: SessionSnapshot::default(),
            observers: ObserverSet::default(),
            manager: None,
            generation: 0,
        };

        Session {
            shared: Arc::new(SessionShared {
                inner: Mutex::new(inner),
                factory,
                clock,
                options,
            }),
        }
    }

    pub fn subscribe(&self, observer: ObserverHandle) -> bool {
        let mut inner = self.shared.lock();
        let added = inner.observers.insert(observer);
        debug!("{} session observers registered", inner.observers.len());
        added
    }

    pub fn unsubscribe(&self, observer: &ObserverHandle) -> bool {
        let mut inner = self.shared.lock();
        let removed = inner.observers.remove(observer);
        if removed && inner.observers.is_empty() {
            debug!("Last session observer removed");
        }
        removed
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.lock().snapshot.clone()
    }

    pub fn device_name(&self) -> Option<String> {
        self.shared.lock().snapshot.device_name.clone()
    }

    pub fn last_config(&self) -> Option<SensorConfig> {
        self.shared.lock().snapshot.last_config.clone()
    }

    pub fn last_sample(&self) -> Option<SensorSample> {
        self.shared.lock().snapshot.last_sample.clone()
    }

    pub fn notifications_active(&self) -> bool {
        self.shared.lock().snapshot.notifications_active
    }

    pub fn sampling_rate_hz(&self) -> Option<u8> {
        self.shared.lock().snapshot.sampling_rate_hz
    }

    pub fn last_inter_sample_period(&self) -> Option<Duration> {
        self.shared.lock().snapshot.last_inter_sample_period
    }

    /// Starts connecting to the device called `name`, replacing any previous connection.
    pub fn connect(&self, name: &str) {
        let (superseded, targets, generation) = {
            let mut inner = self.shared.lock();
            let superseded = inner.manager.take();

            inner.generation += 1;
            inner.snapshot.clear();
            inner.snapshot.device_name = Some(name.to_string());
            inner.state = ConnectionState::Connecting;

            (superseded, inner.observers.snapshot(), inner.generation)
        };

        if let Some(manager) = superseded {
            info!("Disconnecting previous device before connecting to {}", name);
            manager.disconnect();
        }

        fan_out(&targets, &SessionEvent::Connecting);

        let listener = Arc::new(SessionListener {
            shared: Arc::downgrade(&self.shared),
            generation,
        });
        let manager = self.shared.factory.create(name, listener);

        let mut inner = self.shared.lock();
        // an observer may have called connect/disconnect from on_connecting
        if inner.generation != generation || inner.state != ConnectionState::Connecting {
            debug!("Connection attempt to {} was superseded before it started", name);
            return;
        }

        info!("Connecting to {} (timeout {} ms)", name, self.shared.options.connection_timeout_ms);
        manager.connect(self.shared.options.connection_timeout_ms);
        inner.manager = Some(manager);
    }

    /// Tears down the connection. The `on_disconnected` notification follows once the device
    /// manager confirms.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        if inner.state == ConnectionState::Disconnected {
            return;
        }

        inner.enter_disconnected();
        if let Some(manager) = &inner.manager {
            info!("Disconnecting");
            manager.disconnect();
        }
    }

    /// Asks the device for its sensor configuration. Returns whether the request was dispatched.
    pub fn read_config(&self) -> bool {
        let inner = self.shared.lock();
        if inner.state != ConnectionState::Connected {
            return false;
        }

        match &inner.manager {
            Some(manager) => manager.get_sensor_config(),
            None => false,
        }
    }

    /// Starts the IMU notifications at `rate_hz`. Returns true when the device manager accepted
    /// the request.
    pub fn start_sensor_notifications(&self, rate_hz: u8) -> bool {
        let targets = {
            let mut inner = self.shared.lock();
            if inner.state != ConnectionState::Connected || inner.snapshot.notifications_active {
                return false;
            }

            let status = match &inner.manager {
                Some(manager) => manager.register_sensor_listener(rate_hz),
                None => return false,
            };

            match status {
                SensorListenerStatus::Started => {},
                SensorListenerStatus::AlreadyActive => {
                    warn!("Device manager reports sensor notifications as already active");
                    return false;
                },
                SensorListenerStatus::Rejected => {
                    debug!("Sensor notifications at {} Hz rejected", rate_hz);
                    return false;
                },
            }

            inner.snapshot.notifications_active = true;
            inner.snapshot.sampling_rate_hz = Some(rate_hz);
            inner.observers.snapshot()
        };

        fan_out(&targets, &SessionEvent::SensorNotificationsStarted(rate_hz));
        true
    }

    pub fn stop_sensor_notifications(&self) -> bool {
        let targets = {
            let mut inner = self.shared.lock();
            if inner.state != ConnectionState::Connected || !inner.snapshot.notifications_active {
                return false;
            }

            let accepted = match &inner.manager {
                Some(manager) => manager.unregister_event_listener(),
                None => false,
            };
            if !accepted {
                return false;
            }

            inner.snapshot.notifications_active = false;
            inner.observers.snapshot()
        };

        fan_out(&targets, &SessionEvent::SensorNotificationsStopped);
        true
    }
}

/// Listener handed to one device manager handle.
struct SessionListener {
    shared: Weak<SessionShared>,
    generation: u64,
}

impl SessionListener {
    fn handle<F>(&self, update: F)
    where
        F: FnOnce(&mut SessionInner, &dyn MonotonicClock) -> Option<SessionEvent>,
    {
        match self.shared.upgrade() {
            Some(shared) => shared.handle_callback(self.generation, update),
            None => debug!("Session is gone, dropping device callback"),
        }
    }
}

impl ManagerListener for SessionListener {
    fn on_device_found(&self) {
        self.handle(|_, _| Some(SessionEvent::DeviceFound));
    }

    fn on_device_not_found(&self) {
        self.handle(|inner, _| {
            info!("Device not found");
            inner.enter_disconnected();
            Some(SessionEvent::DeviceNotFound)
        });
    }

    fn on_connected(&self) {
        self.handle(|inner, _| {
            if inner.state != ConnectionState::Connecting {
                debug!("Ignoring connected callback while {}", inner.state);
                return None;
            }
            info!("Connected");
            inner.state = ConnectionState::Connected;
            Some(SessionEvent::Connected)
        });
    }

    fn on_disconnected(&self) {
        self.handle(|inner, _| {
            info!("Disconnected");
            inner.enter_disconnected();
            Some(SessionEvent::Disconnected)
        });
    }

    fn on_battery_read(&self, voltage: f64) {
        self.handle(|_, _| Some(SessionEvent::BatteryRead(voltage)));
    }

    fn on_button_event_changed(&self, pressed: bool) {
        self.handle(|_, _| Some(SessionEvent::ButtonEventChanged(pressed)));
    }

    fn on_advertisement_and_connection_interval_read(
        &self,
        min_advertisement_interval: u16,
        max_advertisement_interval: u16,
        min_connection_interval: u16,
        max_connection_interval: u16,
    ) {
        self.handle(|_, _| Some(SessionEvent::AdvertisementAndConnectionIntervalRead {
            min_advertisement_interval,
            max_advertisement_interval,
            min_connection_interval,
            max_connection_interval,
        }));
    }

    fn on_device_name_read(&self, name: String) {
        self.handle(|_, _| Some(SessionEvent::DeviceNameRead(name)));
    }

    fn on_sensor_config_read(&self, config: SensorConfig) {
        self.handle(|inner, _| {
            if inner.state != ConnectionState::Disconnected {
                inner.snapshot.last_config = Some(config.clone());
            }
            Some(SessionEvent::SensorConfigRead(config))
        });
    }

    fn on_accelerometer_offset_read(&self, offset_x: i32, offset_y: i32, offset_z: i32) {
        self.handle(|_, _| Some(SessionEvent::AccelerometerOffsetRead(offset_x, offset_y, offset_z)));
    }

    fn on_sensor_notifications_failed(&self) {
        self.handle(|inner, _| {
            if inner.state != ConnectionState::Connected || !inner.snapshot.notifications_active {
                return None;
            }
            warn!("Device did not start sensor notifications");
            inner.snapshot.notifications_active = false;
            inner.snapshot.sampling_rate_hz = None;
            Some(SessionEvent::SensorNotificationsStopped)
        });
    }

    fn on_sensor_changed(&self, sample: SensorSample) {
        self.handle(|inner, clock| {
            if inner.state != ConnectionState::Disconnected {
                let now = clock.now();
                let snapshot = &mut inner.snapshot;

                snapshot.last_inter_sample_period = snapshot.last_sample_time
                    .and_then(|previous| period_between(previous, now));
                snapshot.last_sample_time = Some(now);
                snapshot.last_sample = Some(sample.clone());
            }
            Some(SessionEvent::SensorChanged(sample))
        });
    }
}
