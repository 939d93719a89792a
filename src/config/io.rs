use std::env::current_exe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use directories_next::{ProjectDirs, UserDirs};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use serde_json;
use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::OpenOptions;
use log::{info, warn};

use crate::config::types::Config;
use crate::error::ConfigError;

const RECORDINGS_FOLDER_NAME: &str = "eSenseRecorder";

// creates a path to esense-recorder.json in the same directory as the executable
// this could be useful for usb sticks
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            // F:\esense-recorder.exe => F:\esense-recorder.json
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "esense", "esense-recorder")
}

// creates a path to esense-recorder.json in an os dependent standard directory, such as %AppData% on
// windows.
fn get_local_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| {
        dirs.config_dir().join("esense-recorder.json")
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    let portable = get_portable_config_path();
    if let Some(path) = portable {
        // only use the portable file if someone put it there on purpose
        if let Ok(attr) = std::fs::metadata(&path) {
            if attr.is_file() {
                return Ok(path);
            }
        }
    }

    match get_local_config_path() {
        None => Err(ConfigError::NoConfigPath),
        Some(path) => Ok(path),
    }
}

/// Directory recordings are written to unless the config says otherwise: a folder in the user's
/// downloads, or in the application data directory when there is none.
pub fn default_recordings_dir() -> Option<PathBuf> {
    if let Some(download_dir) = UserDirs::new().as_ref().and_then(|dirs| dirs.download_dir()) {
        return Some(download_dir.join(RECORDINGS_FOLDER_NAME));
    }

    project_dirs().map(|dirs| dirs.data_dir().join("recordings"))
}

pub fn recordings_dir(config: &Config) -> Option<PathBuf> {
    match &config.log_folder {
        Some(folder) => Some(PathBuf::from(folder)),
        None => default_recordings_dir(),
    }
}

pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<std::fs::File>, ConfigError> {
        match self.rw_lock.try_write() {
            Ok(guard) => Ok(guard),
            Err(source) => Err(ConfigError::CanNotLock { source }),
        }
    }
}

struct ConfigIOInner {
    file: std::fs::File,
}

#[derive(Clone)]
pub struct ConfigIO {
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    pub fn new_sync() -> Result<Self, ConfigError> {
        let path = get_config_path()?;
        ConfigIO::open_sync(&path)
    }

    pub fn open_sync(path: &Path) -> Result<Self, ConfigError> {
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(path)?;

        let inner = ConfigIOInner {
            file,
        };
        Ok(ConfigIO { inner: Arc::new(Mutex::new(inner)) })
    }

    /// The returned locker obtains an exclusive file lock so that this config file is used by
    /// only one instance of the recorder.
    pub fn locker(&self) -> Result<ConfigIOLocker, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");

        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(inner.file.try_clone()?),
        })
    }

    // The File returned from here should never be closed!
    fn get_file(&self) -> Result<File, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");
        let file = inner.file.try_clone()?; // std File
        Ok(File::from_std(file)) // tokio File
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        let mut file = self.get_file()?;
        info!("Reading config file");

        let mut content = vec![];
        file.rewind().await?;
        file.read_to_end(&mut content).await?;

        if content.is_empty() {
            return Ok(Config::default());
        }

        let mut config: Config = serde_json::from_slice(&content)?;
        config.normalize();
        Ok(config)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;
        info!("Saving config");

        let content = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("esense-recorder-test-{}", uuid::Uuid::new_v4()))
            .join("esense-recorder.json")
    }

    #[tokio::test]
    async fn empty_file_reads_as_default() {
        let path = temp_config_path();
        let io = ConfigIO::open_sync(&path).unwrap();

        assert_eq!(io.read().await.unwrap(), Config::default());

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn save_then_read() {
        let path = temp_config_path();
        let io = ConfigIO::open_sync(&path).unwrap();
        let config = Config {
            sampling_rate_hz: 25,
            last_device_name: Some("eSense-0123".to_string()),
            ..Config::default()
        };

        io.save(&config).await.unwrap();
        assert_eq!(io.read().await.unwrap(), config);

        // shorter content must not leave a tail behind
        io.save(&Config::default()).await.unwrap();
        assert_eq!(io.read().await.unwrap(), Config::default());

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn invalid_rate_on_disk_falls_back_to_default() {
        let path = temp_config_path();
        let io = ConfigIO::open_sync(&path).unwrap();
        std::fs::write(&path, r#"{"samplingRateHz": 0}"#).unwrap();

        assert_eq!(io.read().await.unwrap().sampling_rate_hz, 4);

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn second_instance_can_not_lock() {
        let path = temp_config_path();
        let first = ConfigIO::open_sync(&path).unwrap();
        let second = ConfigIO::open_sync(&path).unwrap();

        let mut first_locker = first.locker().unwrap();
        let guard = first_locker.lock().unwrap();

        let mut second_locker = second.locker().unwrap();
        assert!(matches!(second_locker.lock(), Err(ConfigError::CanNotLock { .. })));

        drop(guard);
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
