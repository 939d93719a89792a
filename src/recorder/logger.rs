use std::fmt::{Display, Write as _};
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::SystemTime;

use log::{error, info, warn};

use crate::error::LoggerError;

pub const DEFAULT_SEPARATOR: &str = "\t";
pub const DEFAULT_TERMINATOR: &str = "\n";
pub const LOG_FILE_EXTENSION: &str = "txt";

/// Where log files end up. Path resolution and directory creation live behind this trait, the
/// logger only asks for availability and for new, uniquely named files.
pub trait LogStorage: Send {
    fn check_available(&self) -> Result<(), LoggerError>;

    fn exists(&self, file_name: &str) -> bool;

    /// Creates `file_name`, failing with `AlreadyExists` if it is already there.
    fn create(&self, file_name: &str) -> io::Result<Box<dyn Write + Send>>;
}

/// Log files in a directory of the local file system.
pub struct FsLogStorage {
    directory: PathBuf,
}

impl FsLogStorage {
    pub fn new(directory: PathBuf) -> Self {
        FsLogStorage { directory }
    }
}

impl LogStorage for FsLogStorage {
    fn check_available(&self) -> Result<(), LoggerError> {
        std::fs::create_dir_all(&self.directory)?;

        let metadata = std::fs::metadata(&self.directory)?;
        if !metadata.is_dir() {
            return Err(LoggerError::StorageUnavailable {
                reason: format!("{} is not a directory", self.directory.to_string_lossy()),
            });
        }
        Ok(())
    }

    fn exists(&self, file_name: &str) -> bool {
        self.directory.join(file_name).exists()
    }

    fn create(&self, file_name: &str) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.directory.join(file_name))?;

        Ok(Box::new(BufWriter::new(file)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFormat {
    pub separator: String,
    pub terminator: String,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat {
            separator: DEFAULT_SEPARATOR.to_string(),
            terminator: DEFAULT_TERMINATOR.to_string(),
        }
    }
}

/// `name.txt` for index 0, `name(1).txt`, `name(2).txt`, ... after that.
pub fn log_file_name(base_name: &str, index: u32) -> String {
    match index {
        0 => format!("{}.{}", base_name, LOG_FILE_EXTENSION),
        _ => format!("{}({}).{}", base_name, index, LOG_FILE_EXTENSION),
    }
}

/// Base name for a recording started at `start`, e.g. `esense-2024-05-01T13-37-00Z`.
pub fn log_base_name(start: SystemTime) -> String {
    let timestamp = humantime::format_rfc3339_seconds(start).to_string();
    format!("esense-{}", timestamp.replace(':', "-"))
}

struct OpenLog {
    file_name: String,
    writer: Box<dyn Write + Send>,
}

/// Writes delimited lines to one log file at a time.
///
/// The file is opened lazily by the first [`EventLogger::append`]. Any IO failure closes it; the
/// next append then starts a new file. There is no internal locking, callers serialise access.
pub struct EventLogger {
    storage: Box<dyn LogStorage>,
    base_name: String,
    format: LogFormat,
    current: Option<OpenLog>,
}

impl EventLogger {
    pub fn new(storage: Box<dyn LogStorage>, base_name: &str, format: LogFormat) -> Self {
        EventLogger {
            storage,
            base_name: base_name.to_string(),
            format,
            current: None,
        }
    }

    /// Closes the current file, the next append opens a file named after `base_name`.
    pub fn set_base_name(&mut self, base_name: &str) {
        if !self.close() {
            warn!("Previous log file was not closed cleanly");
        }
        self.base_name = base_name.to_string();
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_file_name(&self) -> Option<&str> {
        self.current.as_ref().map(|log| log.file_name.as_str())
    }

    /// Writes one line: the elapsed-time marker, the tag, then every field. Returns false (and
    /// closes the log) if the line could not be written.
    pub fn append(&mut self, elapsed_marker: &str, tag: &str, fields: &[&dyn Display]) -> bool {
        if self.current.is_none() {
            match self.open() {
                Ok(log) => {
                    info!("Opened log file {}", log.file_name);
                    self.current = Some(log);
                },
                Err(err) => {
                    error!("Unable to create log file for {}: {}", self.base_name, err);
                    return false;
                },
            }
        }

        let line = self.format_line(elapsed_marker, tag, fields);
        let result = match self.current.as_mut() {
            Some(log) => log.writer.write_all(line.as_bytes()),
            None => return false,
        };

        if let Err(err) = result {
            error!("Unable to write line to log file: {}", err);
            self.abandon();
            return false;
        }

        // a line only counts once it reached storage
        self.flush()
    }

    /// Pushes buffered lines to storage. A failure closes the log.
    pub fn flush(&mut self) -> bool {
        let result = match self.current.as_mut() {
            Some(log) => log.writer.flush(),
            None => return true,
        };

        if let Err(err) = result {
            error!("Unable to flush log file: {}", err);
            self.abandon();
            return false;
        }
        true
    }

    /// Flushes and releases the file. Returns false if buffered lines could not be flushed; closing
    /// an already closed log succeeds.
    pub fn close(&mut self) -> bool {
        let mut log = match self.current.take() {
            Some(log) => log,
            None => return true,
        };

        if let Err(err) = log.writer.flush() {
            error!("Unable to flush log file {} while closing: {}", log.file_name, err);
            return false;
        }
        info!("Closed log file {}", log.file_name);
        true
    }

    fn abandon(&mut self) {
        if let Some(log) = self.current.take() {
            warn!("Abandoning log file {}", log.file_name);
        }
    }

    fn open(&self) -> Result<OpenLog, LoggerError> {
        self.storage.check_available()?;

        let mut index = 0;
        loop {
            let file_name = log_file_name(&self.base_name, index);
            index += 1;

            if self.storage.exists(&file_name) {
                continue;
            }

            match self.storage.create(&file_name) {
                Ok(writer) => return Ok(OpenLog { file_name, writer }),
                // created by someone else in the meantime
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn format_line(&self, elapsed_marker: &str, tag: &str, fields: &[&dyn Display]) -> String {
        let mut line = String::new();
        line.push_str(elapsed_marker);
        line.push_str(&self.format.separator);
        line.push_str(tag);

        for field in fields {
            line.push_str(&self.format.separator);
            // writing to a String can not fail
            let _ = write!(line, "{}", field);
        }

        line.push_str(&self.format.terminator);
        line
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        if !self.close() {
            warn!("Log file was not closed cleanly");
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::BTreeMap;
    use std::io::{self, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::LogStorage;
    use crate::error::LoggerError;

    /// In-memory storage with switchable failures.
    #[derive(Clone, Default)]
    pub struct MemoryStorage {
        pub files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
        pub fail_writes: Arc<AtomicBool>,
        pub fail_flushes: Arc<AtomicBool>,
        pub unavailable: Arc<AtomicBool>,
    }

    impl MemoryStorage {
        pub fn content(&self, file_name: &str) -> Option<String> {
            self.files.lock().unwrap().get(file_name).map(|bytes| String::from_utf8_lossy(bytes).to_string())
        }

        pub fn file_names(&self) -> Vec<String> {
            self.files.lock().unwrap().keys().cloned().collect()
        }

        pub fn insert(&self, file_name: &str) {
            self.files.lock().unwrap().insert(file_name.to_string(), Vec::new());
        }
    }

    /// Buffers like a `BufWriter`: bytes only show up in `files` once flushed.
    struct MemoryWriter {
        file_name: String,
        storage: MemoryStorage,
        pending: Vec<u8>,
    }

    impl Write for MemoryWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.storage.fail_writes.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.pending.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            if self.storage.fail_flushes.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let mut files = self.storage.files.lock().unwrap();
            files.entry(self.file_name.clone()).or_default().append(&mut self.pending);
            Ok(())
        }
    }

    impl LogStorage for MemoryStorage {
        fn check_available(&self) -> Result<(), LoggerError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(LoggerError::StorageUnavailable { reason: "not mounted".to_string() });
            }
            Ok(())
        }

        fn exists(&self, file_name: &str) -> bool {
            self.files.lock().unwrap().contains_key(file_name)
        }

        fn create(&self, file_name: &str) -> io::Result<Box<dyn Write + Send>> {
            let mut files = self.files.lock().unwrap();
            if files.contains_key(file_name) {
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, file_name.to_string()));
            }
            files.insert(file_name.to_string(), Vec::new());

            Ok(Box::new(MemoryWriter { file_name: file_name.to_string(), storage: self.clone(), pending: Vec::new() }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryStorage;
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, UNIX_EPOCH};

    fn logger(storage: &MemoryStorage) -> EventLogger {
        EventLogger::new(Box::new(storage.clone()), "name", LogFormat::default())
    }

    #[test]
    fn writes_delimited_lines_in_order() {
        let storage = MemoryStorage::default();
        let mut logger = logger(&storage);

        assert!(!logger.is_open());
        assert!(logger.append("0", "start", &[]));
        assert!(logger.is_open());
        assert!(logger.append("12", "stop", &[]));
        logger.close();

        assert_eq!(storage.content("name.txt").as_deref(), Some("0\tstart\n12\tstop\n"));
    }

    #[test]
    fn fields_are_rendered_as_decimal_text() {
        let storage = MemoryStorage::default();
        let mut logger = logger(&storage);

        assert!(logger.append("250", "sample", &[&7u8, &-120i16, &3.5f64, &"x"]));

        assert_eq!(storage.content("name.txt").as_deref(), Some("250\tsample\t7\t-120\t3.5\tx\n"));
    }

    #[test]
    fn custom_separator_and_terminator() {
        let storage = MemoryStorage::default();
        let format = LogFormat { separator: ";".to_string(), terminator: "\r\n".to_string() };
        let mut logger = EventLogger::new(Box::new(storage.clone()), "name", format);

        assert!(logger.append("1", "button", &[&1]));

        assert_eq!(storage.content("name.txt").as_deref(), Some("1;button;1\r\n"));
    }

    #[test]
    fn write_failure_closes_and_next_append_starts_new_file() {
        let storage = MemoryStorage::default();
        let mut logger = logger(&storage);
        assert!(logger.append("0", "start", &[]));

        storage.fail_writes.store(true, Ordering::SeqCst);
        assert!(!logger.append("5", "sample", &[&1]));
        assert!(!logger.is_open());

        storage.fail_writes.store(false, Ordering::SeqCst);
        assert!(logger.append("9", "sample", &[&2]));

        assert_eq!(logger.current_file_name(), Some("name(1).txt"));
        assert_eq!(storage.content("name.txt").as_deref(), Some("0\tstart\n"));
        assert_eq!(storage.content("name(1).txt").as_deref(), Some("9\tsample\t2\n"));
    }

    #[test]
    fn failed_flush_fails_the_append() {
        let storage = MemoryStorage::default();
        let mut logger = logger(&storage);
        assert!(logger.append("0", "start", &[]));

        storage.fail_flushes.store(true, Ordering::SeqCst);
        assert!(!logger.append("5", "battery", &[&4.1]));
        assert!(!logger.is_open());

        // nothing but complete, flushed lines in the file
        assert_eq!(storage.content("name.txt").as_deref(), Some("0\tstart\n"));
    }

    #[test]
    fn close_reports_failed_flush() {
        let storage = MemoryStorage::default();
        let mut logger = logger(&storage);
        assert!(logger.append("0", "start", &[]));

        storage.fail_flushes.store(true, Ordering::SeqCst);
        assert!(!logger.close());
        assert!(!logger.is_open());
        assert!(logger.close());
    }

    #[test]
    fn colliding_names_get_a_counter() {
        let storage = MemoryStorage::default();
        storage.insert("name.txt");
        let mut logger = logger(&storage);

        assert!(logger.append("0", "start", &[]));
        assert_eq!(logger.current_file_name(), Some("name(1).txt"));

        logger.close();
        assert!(logger.append("0", "start", &[]));
        assert_eq!(logger.current_file_name(), Some("name(2).txt"));
        assert_eq!(storage.file_names(), vec!["name(1).txt", "name(2).txt", "name.txt"]);
    }

    #[test]
    fn unavailable_storage_reports_failure() {
        let storage = MemoryStorage::default();
        storage.unavailable.store(true, Ordering::SeqCst);
        let mut logger = logger(&storage);

        assert!(!logger.append("0", "start", &[]));
        assert!(!logger.is_open());
        assert!(storage.file_names().is_empty());
    }

    #[test]
    fn close_is_idempotent() {
        let storage = MemoryStorage::default();
        let mut logger = logger(&storage);
        logger.close();
        assert!(logger.append("0", "start", &[]));
        assert!(logger.close());
        assert!(logger.close());
        assert!(!logger.is_open());
        assert!(logger.flush());
    }

    #[test]
    fn base_name_from_start_time() {
        let start = UNIX_EPOCH + Duration::from_secs(86_400 + 3_661);
        assert_eq!(log_base_name(start), "esense-1970-01-02T01-01-01Z");
    }

    #[test]
    fn file_names() {
        assert_eq!(log_file_name("rec", 0), "rec.txt");
        assert_eq!(log_file_name("rec", 3), "rec(3).txt");
    }

    #[test]
    fn file_system_storage() {
        let directory = std::env::temp_dir().join(format!("esense-recorder-test-{}", uuid::Uuid::new_v4()));
        let storage = FsLogStorage::new(directory.clone());
        let mut logger = EventLogger::new(Box::new(storage), "rec", LogFormat::default());

        assert!(logger.append("0", "start", &[]));
        assert!(logger.append("12", "stop", &[]));
        // every reported line is already on disk before closing
        let written = std::fs::read_to_string(directory.join("rec.txt")).unwrap();
        assert_eq!(written, "0\tstart\n12\tstop\n");
        assert!(logger.close());
        assert!(logger.append("0", "start", &[]));
        assert!(logger.close());

        let first = std::fs::read_to_string(directory.join("rec.txt")).unwrap();
        assert_eq!(first, "0\tstart\n12\tstop\n");
        assert!(directory.join("rec(1).txt").exists());

        std::fs::remove_dir_all(&directory).unwrap();
    }
}
