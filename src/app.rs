use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::Parser;
use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout};

use crate::config::io::{recordings_dir, ConfigIO};
use crate::config::types::Config;
use crate::device::connection::BtleDeviceManagerFactory;
use crate::device::constants::DISCONNECT_DEADLINE;
use crate::device::readiness::{btle_readiness_check, Readiness};
use crate::device::types::{ConnectionState, SamplingRate};
use crate::error::AppRunError;
use crate::recorder::controller::{RecordingController, RecordingStatus};
use crate::recorder::logger::{log_base_name, EventLogger, FsLogStorage};
use crate::session::clock::{MonotonicClock, SystemClock};
use crate::session::controller::{Session, SessionOptions};
use crate::session::observer::{ChannelObserver, ObserverHandle, SessionEvent};

// how often (in samples) to report progress
const PROGRESS_INTERVAL: u64 = 500;

#[derive(Parser, Debug)]
#[command(name = "esense-recorder", version, about = "Records motion sensor data from an eSense earable")]
pub struct Cli {
    /// Advertised name of the earable, e.g. eSense-0123. Defaults to the last used device.
    #[arg(short, long)]
    pub device: Option<String>,

    /// Sampling rate in Hz, 1 to 100. Defaults to the last used rate.
    #[arg(short, long)]
    pub rate: Option<u32>,

    /// Stop recording after this long, e.g. "90s" or "5m".
    #[arg(long)]
    pub duration: Option<humantime::Duration>,

    /// Directory to write recordings to.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// How long to look for the device before giving up.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[arg(short, long)]
    pub verbose: bool,
}

async fn load_config(config_io: &ConfigIO) -> Config {
    match config_io.read().await {
        Ok(config) => config,
        Err(err) => {
            if err.is_file_not_found_error() {
                // this is probably the first start of the app
                info!("Config file not found, using defaults");
            } else {
                error!("Failed to load config: {:?}", &err);
            }
            Config::default()
        },
    }
}

async fn save_config(config_io: &ConfigIO, config: &Config) {
    if let Err(err) = config_io.save(config).await {
        error!("Failed to save config: {:?}", &err);
    }
}

fn apply_cli(config: &mut Config, cli: &Cli) {
    if let Some(rate) = cli.rate {
        match SamplingRate::new(rate) {
            Some(_) => config.sampling_rate_hz = rate,
            None => warn!("Sampling rate {} is outside [1, 100], using {} Hz", rate, config.sampling_rate_hz),
        }
    }

    if let Some(timeout_ms) = cli.timeout_ms {
        config.connection_timeout_ms = timeout_ms;
    }
}

/// Waits until the session confirms the disconnect, so the device commands sent while tearing
/// down are not cut off by the runtime shutting down. Returns whether it was confirmed in time.
async fn wait_for_disconnected(events: &mut UnboundedReceiver<SessionEvent>, deadline: Duration) -> bool {
    let confirmed = async {
        while let Some(event) = events.next().await {
            if event == SessionEvent::Disconnected {
                return true;
            }
        }
        false
    };

    match timeout(deadline, confirmed).await {
        Ok(true) => {
            info!("Device disconnected");
            true
        },
        Ok(false) => {
            warn!("Session events ended before the disconnect was confirmed");
            false
        },
        Err(_) => {
            warn!("Device did not confirm the disconnect within {:?}", deadline);
            false
        },
    }
}

pub async fn run_recorder(cli: Cli) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync()?;
    let mut locker = config_io.locker()?;
    let _config_lock = locker.lock()?;

    let mut config = load_config(&config_io).await;
    apply_cli(&mut config, &cli);

    let device_name = cli.device.clone()
        .or_else(|| config.last_device_name.clone())
        .ok_or(AppRunError::NoDeviceName)?;
    let directory = cli.log_dir.clone()
        .or_else(|| recordings_dir(&config))
        .ok_or_else(|| AppRunError::RecordingFailed { reason: "no directory for recordings".to_string() })?;

    match btle_readiness_check().ensure_ready().await {
        Readiness::Ready => info!("Bluetooth is ready"),
        other => return Err(AppRunError::NotReady { reason: other.to_string() }),
    }

    let clock: Arc<dyn MonotonicClock> = Arc::new(SystemClock::new());
    let session = Session::new(
        Arc::new(BtleDeviceManagerFactory::new(Handle::current())),
        clock.clone(),
        SessionOptions { connection_timeout_ms: config.connection_timeout_ms },
    );

    let base_name = log_base_name(SystemTime::now());
    let logger = EventLogger::new(Box::new(FsLogStorage::new(directory.clone())), &base_name, config.log_format());
    let recorder = Arc::new(RecordingController::new(logger, clock));
    let (channel_observer, mut events) = ChannelObserver::new();
    let recorder_handle: ObserverHandle = recorder.clone();
    let channel_handle: ObserverHandle = channel_observer;
    session.subscribe(recorder_handle.clone());
    session.subscribe(channel_handle.clone());

    if !recorder.start_recording(&base_name) {
        return Err(AppRunError::RecordingFailed {
            reason: format!("unable to create a log file in {}", directory.to_string_lossy()),
        });
    }
    session.connect(&device_name);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let duration = cli.duration;
    let deadline = async move {
        match duration {
            Some(duration) => sleep(duration.into()).await,
            None => futures::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut samples: u64 = 0;
    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping");
                break Ok(());
            },
            _ = &mut deadline => {
                info!("Recording duration reached");
                break Ok(());
            },
            event = events.next() => match event {
                None => break Ok(()),
                Some(SessionEvent::Connected) => {
                    config.last_device_name = Some(device_name.clone());
                    if !session.read_config() {
                        warn!("Unable to request the sensor configuration");
                    }
                    if !session.start_sensor_notifications(config.sampling_rate().hz()) {
                        warn!("Unable to start sensor notifications");
                    }
                },
                Some(SessionEvent::SensorNotificationsStarted(rate_hz)) => {
                    info!("Requested samples at {} Hz", rate_hz);
                },
                Some(SessionEvent::SensorNotificationsStopped) => {
                    break Err(AppRunError::NotificationsFailed { name: device_name.clone() });
                },
                Some(SessionEvent::DeviceNotFound) => {
                    break Err(AppRunError::DeviceNotFound { name: device_name.clone() });
                },
                Some(SessionEvent::Disconnected) => {
                    break Err(AppRunError::ConnectionLost { name: device_name.clone() });
                },
                Some(SessionEvent::SensorChanged(_)) => {
                    samples += 1;
                    if samples == 1 {
                        // the device delivers, remember what worked
                        if let Some(rate_hz) = session.sampling_rate_hz() {
                            info!("Recording samples at {} Hz", rate_hz);
                            config.sampling_rate_hz = rate_hz as u32;
                        }
                        save_config(&config_io, &config).await;
                    }
                    if samples % PROGRESS_INTERVAL == 0 {
                        info!("{} samples recorded, last period {:?}", samples, session.last_inter_sample_period());
                    }
                },
                Some(event) => debug!("Session event {:?}", event),
            },
        }

        if let RecordingStatus::Failed { reason } = recorder.status() {
            break Err(AppRunError::RecordingFailed { reason });
        }
    };

    session.stop_sensor_notifications();
    recorder.stop_recording();
    if session.state() != ConnectionState::Disconnected {
        session.disconnect();
        wait_for_disconnected(&mut events, Duration::from_millis(DISCONNECT_DEADLINE)).await;
    }
    session.unsubscribe(&channel_handle);
    session.unsubscribe(&recorder_handle);
    info!("{} samples recorded", samples);

    match (result, recorder.status()) {
        (Ok(()), RecordingStatus::Failed { reason }) => Err(AppRunError::RecordingFailed { reason }),
        (result, _) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::types::SensorSample;
    use crate::session::observer::SessionObserver;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("esense-recorder").chain(args.iter().copied()))
    }

    #[test]
    fn cli_overrides_config() {
        let mut config = Config::default();
        apply_cli(&mut config, &cli(&["--rate", "50", "--timeout-ms", "3000", "--duration", "90s"]));

        assert_eq!(config.sampling_rate_hz, 50);
        assert_eq!(config.connection_timeout_ms, 3000);
    }

    #[test]
    fn out_of_range_rate_keeps_config() {
        let mut config = Config { sampling_rate_hz: 25, ..Config::default() };
        apply_cli(&mut config, &cli(&["--rate", "101"]));

        assert_eq!(config.sampling_rate_hz, 25);
    }

    #[tokio::test]
    async fn waits_for_disconnect_confirmation() {
        let (observer, mut events) = ChannelObserver::new();
        observer.on_sensor_changed(&SensorSample { timestamp_ms: 1, packet_index: 0, gyro: [0; 3], accel: [0; 3] });
        observer.on_sensor_notifications_stopped();
        observer.on_disconnected();

        assert!(wait_for_disconnected(&mut events, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn gives_up_when_events_end() {
        let (observer, mut events) = ChannelObserver::new();
        observer.on_connected();
        drop(observer);

        assert!(!wait_for_disconnected(&mut events, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn gives_up_after_deadline() {
        let (_observer, mut events) = ChannelObserver::new();

        assert!(!wait_for_disconnected(&mut events, Duration::from_millis(20)).await);
    }
}
