use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use indexmap::IndexMap;
use log::{debug, warn};

use crate::device::types::{SensorConfig, SensorSample};
use crate::error::readable_thread_panic_error;

/// Listener to a [`Session`](crate::session::controller::Session).
///
/// Every callback has an empty default so that observers only implement what they care about.
/// Callbacks run on whichever thread produced the event and are never called while the session
/// holds its lock, so an observer may call back into the session.
#[allow(unused_variables)]
pub trait SessionObserver: Send + Sync {
    fn on_connecting(&self) {}
    fn on_device_found(&self) {}
    fn on_device_not_found(&self) {}
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn on_battery_read(&self, voltage: f64) {}
    fn on_button_event_changed(&self, pressed: bool) {}
    fn on_advertisement_and_connection_interval_read(
        &self,
        min_advertisement_interval: u16,
        max_advertisement_interval: u16,
        min_connection_interval: u16,
        max_connection_interval: u16,
    ) {}
    fn on_device_name_read(&self, name: &str) {}
    fn on_sensor_config_read(&self, config: &SensorConfig) {}
    fn on_accelerometer_offset_read(&self, offset_x: i32, offset_y: i32, offset_z: i32) {}
    fn on_sensor_changed(&self, sample: &SensorSample) {}
    fn on_sensor_notifications_started(&self, rate_hz: u8) {}
    fn on_sensor_notifications_stopped(&self) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connecting,
    DeviceFound,
    DeviceNotFound,
    Connected,
    Disconnected,
    BatteryRead(f64),
    ButtonEventChanged(bool),
    AdvertisementAndConnectionIntervalRead {
        min_advertisement_interval: u16,
        max_advertisement_interval: u16,
        min_connection_interval: u16,
        max_connection_interval: u16,
    },
    DeviceNameRead(String),
    SensorConfigRead(SensorConfig),
    AccelerometerOffsetRead(i32, i32, i32),
    SensorChanged(SensorSample),
    SensorNotificationsStarted(u8),
    SensorNotificationsStopped,
}

impl SessionEvent {
    pub fn deliver(&self, observer: &dyn SessionObserver) {
        match self {
            SessionEvent::Connecting => observer.on_connecting(),
            SessionEvent::DeviceFound => observer.on_device_found(),
            SessionEvent::DeviceNotFound => observer.on_device_not_found(),
            SessionEvent::Connected => observer.on_connected(),
            SessionEvent::Disconnected => observer.on_disconnected(),
            SessionEvent::BatteryRead(voltage) => observer.on_battery_read(*voltage),
            SessionEvent::ButtonEventChanged(pressed) => observer.on_button_event_changed(*pressed),
            SessionEvent::AdvertisementAndConnectionIntervalRead {
                min_advertisement_interval,
                max_advertisement_interval,
                min_connection_interval,
                max_connection_interval,
            } => observer.on_advertisement_and_connection_interval_read(
                *min_advertisement_interval,
                *max_advertisement_interval,
                *min_connection_interval,
                *max_connection_interval,
            ),
            SessionEvent::DeviceNameRead(name) => observer.on_device_name_read(name),
            SessionEvent::SensorConfigRead(config) => observer.on_sensor_config_read(config),
            SessionEvent::AccelerometerOffsetRead(x, y, z) => observer.on_accelerometer_offset_read(*x, *y, *z),
            SessionEvent::SensorChanged(sample) => observer.on_sensor_changed(sample),
            SessionEvent::SensorNotificationsStarted(rate) => observer.on_sensor_notifications_started(*rate),
            SessionEvent::SensorNotificationsStopped => observer.on_sensor_notifications_stopped(),
        }
    }
}

pub type ObserverHandle = Arc<dyn SessionObserver>;

fn identity(observer: &ObserverHandle) -> usize {
    Arc::as_ptr(observer) as *const () as usize
}

/// Registered observers, unique by identity (the allocation the `Arc` points to).
#[derive(Default)]
pub struct ObserverSet {
    observers: IndexMap<usize, ObserverHandle>,
}

impl ObserverSet {
    /// Returns false if the observer was already registered.
    pub fn insert(&mut self, observer: ObserverHandle) -> bool {
        let key = identity(&observer);
        if self.observers.contains_key(&key) {
            return false;
        }
        self.observers.insert(key, observer);
        true
    }

    pub fn remove(&mut self, observer: &ObserverHandle) -> bool {
        self.observers.shift_remove(&identity(observer)).is_some()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Point-in-time copy to iterate over once the lock protecting the set is released.
    pub fn snapshot(&self) -> Vec<ObserverHandle> {
        self.observers.values().cloned().collect()
    }
}

/// Delivers `event` to every observer in `targets`. A panicking observer is logged and skipped,
/// the others still receive the event.
pub fn fan_out(targets: &[ObserverHandle], event: &SessionEvent) {
    for observer in targets {
        let result = catch_unwind(AssertUnwindSafe(|| event.deliver(observer.as_ref())));

        if let Err(panic) = result {
            warn!("Observer failed while handling {:?}: {}", event, readable_thread_panic_error(&panic));
        }
    }
}

/// Observer that forwards every event into a futures channel, for consumers that would rather
/// await events than implement callbacks.
pub struct ChannelObserver {
    sender: UnboundedSender<SessionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<ChannelObserver>, UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = unbounded::<SessionEvent>();
        (Arc::new(ChannelObserver { sender }), receiver)
    }

    fn send(&self, event: SessionEvent) {
        if let Err(err) = self.sender.unbounded_send(event) {
            // receiver went away, nothing is listening anymore
            debug!("Dropping session event: {:?}", err.into_inner());
        }
    }
}

impl SessionObserver for ChannelObserver {
    fn on_connecting(&self) {
        self.send(SessionEvent::Connecting);
    }

    fn on_device_found(&self) {
        self.send(SessionEvent::DeviceFound);
    }

    fn on_device_not_found(&self) {
        self.send(SessionEvent::DeviceNotFound);
    }

    fn on_connected(&self) {
        self.send(SessionEvent::Connected);
    }

    fn on_disconnected(&self) {
        self.send(SessionEvent::Disconnected);
    }

    fn on_battery_read(&self, voltage: f64) {
        self.send(SessionEvent::BatteryRead(voltage));
    }

    fn on_button_event_changed(&self, pressed: bool) {
        self.send(SessionEvent::ButtonEventChanged(pressed));
    }

    fn on_advertisement_and_connection_interval_read(
        &self,
        min_advertisement_interval: u16,
        max_advertisement_interval: u16,
        min_connection_interval: u16,
        max_connection_interval: u16,
    ) {
        self.send(SessionEvent::AdvertisementAndConnectionIntervalRead {
            min_advertisement_interval,
            max_advertisement_interval,
            min_connection_interval,
            max_connection_interval,
        });
    }

    fn on_device_name_read(&self, name: &str) {
        self.send(SessionEvent::DeviceNameRead(name.to_string()));
    }

    fn on_sensor_config_read(&self, config: &SensorConfig) {
        self.send(SessionEvent::SensorConfigRead(config.clone()));
    }

    fn on_accelerometer_offset_read(&self, offset_x: i32, offset_y: i32, offset_z: i32) {
        self.send(SessionEvent::AccelerometerOffsetRead(offset_x, offset_y, offset_z));
    }

    fn on_sensor_changed(&self, sample: &SensorSample) {
        self.send(SessionEvent::SensorChanged(sample.clone()));
    }

    fn on_sensor_notifications_started(&self, rate_hz: u8) {
        self.send(SessionEvent::SensorNotificationsStarted(rate_hz));
    }

    fn on_sensor_notifications_stopped(&self) {
        self.send(SessionEvent::SensorNotificationsStopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        connected: AtomicUsize,
    }

    impl SessionObserver for Counter {
        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl SessionObserver for Panicking {
        fn on_connected(&self) {
            panic!("observer bug");
        }
    }

    #[test]
    fn set_is_unique_by_identity() {
        let mut set = ObserverSet::default();
        let a: ObserverHandle = Arc::new(Counter::default());
        let b: ObserverHandle = Arc::new(Counter::default());

        assert!(set.insert(a.clone()));
        assert!(!set.insert(a.clone()));
        assert!(set.insert(b.clone()));
        assert_eq!(set.len(), 2);

        assert!(set.remove(&a));
        assert!(!set.remove(&a));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn panicking_observer_does_not_stop_fan_out() {
        let first = Arc::new(Counter::default());
        let last = Arc::new(Counter::default());
        let targets: Vec<ObserverHandle> = vec![first.clone() as ObserverHandle, Arc::new(Panicking), last.clone()];

        fan_out(&targets, &SessionEvent::Connected);

        assert_eq!(first.connected.load(Ordering::SeqCst), 1);
        assert_eq!(last.connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_observer_forwards_events() {
        let (observer, mut receiver) = ChannelObserver::new();
        let targets: Vec<ObserverHandle> = vec![observer as ObserverHandle];

        fan_out(&targets, &SessionEvent::Connecting);
        fan_out(&targets, &SessionEvent::SensorNotificationsStarted(50));

        assert_eq!(receiver.next().await, Some(SessionEvent::Connecting));
        assert_eq!(receiver.next().await, Some(SessionEvent::SensorNotificationsStarted(50)));
    }
}
