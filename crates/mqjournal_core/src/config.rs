//! Journal configuration.

use crate::error::{CoreError, CoreResult};
use crate::file::HEADER_SIZE;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default size of a journal file (10 MiB).
pub const DEFAULT_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Default capacity of the timed write buffer (490 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 490 * 1024;

/// Default flush window of the timed write buffer.
pub const DEFAULT_BUFFER_TIMEOUT_MICROS: u64 = 2_000;

/// Default outstanding request limit of the asynchronous backend.
pub const DEFAULT_MAX_AIO: usize = 500;

/// Smallest journal file accepted.
pub const MIN_FILE_SIZE: u64 = 1024;

/// The file I/O backend a journal uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JournalType {
    /// Writes executed by an I/O thread pool with bounded outstanding requests.
    AsyncIo,
    /// Buffered writes plus explicit force on the flushing thread.
    Nio,
}

impl fmt::Display for JournalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AsyncIo => write!(f, "ASYNCIO"),
            Self::Nio => write!(f, "NIO"),
        }
    }
}

impl FromStr for JournalType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ASYNCIO" | "AIO" => Ok(Self::AsyncIo),
            "NIO" => Ok(Self::Nio),
            other => Err(CoreError::invalid_config(format!(
                "unknown journal type '{other}', expected ASYNCIO or NIO"
            ))),
        }
    }
}

/// Configuration for opening a journal.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Directory holding the journal files.
    pub journal_directory: PathBuf,

    /// Size every journal file is pre-allocated to.
    pub journal_file_size: u64,

    /// Number of pre-formatted free files kept ready.
    pub min_files: usize,

    /// Minimum number of files before compaction is considered (0 = never).
    pub compact_min_files: usize,

    /// Compaction runs when the live fraction drops below this percentage
    /// (0 = never).
    pub compact_percentage: u32,

    /// Maximum outstanding write requests of the asynchronous backend.
    pub max_aio: usize,

    /// Flush window of the timed write buffer, in microseconds.
    pub buffer_timeout_micros: u64,

    /// Capacity of the timed write buffer.
    pub buffer_size: usize,

    /// File I/O backend.
    pub journal_type: JournalType,

    /// Whether PREPARE, COMMIT and ROLLBACK honour their `sync` flag.
    pub sync_transactional: bool,

    /// Whether ADD, UPDATE and DELETE honour their `sync` flag.
    pub sync_non_transactional: bool,

    /// Whether to create the journal directory if it doesn't exist.
    pub create_journal_dir: bool,

    /// Whether a sync request flushes the buffer at once instead of waiting
    /// for the flush window.
    pub flush_on_sync: bool,

    /// Whether to log the write rate of the timed buffer.
    pub log_write_rate: bool,

    /// File name prefix of journal files.
    pub file_prefix: String,

    /// File name extension of journal files (without the dot).
    pub file_extension: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            journal_directory: PathBuf::from("data/journal"),
            journal_file_size: DEFAULT_FILE_SIZE,
            min_files: 2,
            compact_min_files: 10,
            compact_percentage: 30,
            max_aio: DEFAULT_MAX_AIO,
            buffer_timeout_micros: DEFAULT_BUFFER_TIMEOUT_MICROS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            journal_type: JournalType::AsyncIo,
            sync_transactional: true,
            sync_non_transactional: true,
            create_journal_dir: true,
            flush_on_sync: true,
            log_write_rate: false,
            file_prefix: "mqj-data".to_string(),
            file_extension: "mqj".to_string(),
        }
    }
}

impl JournalConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the journal directory.
    #[must_use]
    pub fn journal_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_directory = dir.into();
        self
    }

    /// Sets the journal file size.
    #[must_use]
    pub const fn journal_file_size(mut self, size: u64) -> Self {
        self.journal_file_size = size;
        self
    }

    /// Sets the number of free files kept ready.
    #[must_use]
    pub const fn min_files(mut self, files: usize) -> Self {
        self.min_files = files;
        self
    }

    /// Sets the compaction file threshold.
    #[must_use]
    pub const fn compact_min_files(mut self, files: usize) -> Self {
        self.compact_min_files = files;
        self
    }

    /// Sets the compaction live percentage threshold.
    #[must_use]
    pub const fn compact_percentage(mut self, percentage: u32) -> Self {
        self.compact_percentage = percentage;
        self
    }

    /// Sets the outstanding request limit of the asynchronous backend.
    #[must_use]
    pub const fn max_aio(mut self, max: usize) -> Self {
        self.max_aio = max;
        self
    }

    /// Sets the flush window in microseconds.
    #[must_use]
    pub const fn buffer_timeout_micros(mut self, micros: u64) -> Self {
        self.buffer_timeout_micros = micros;
        self
    }

    /// Sets the buffer capacity.
    #[must_use]
    pub const fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets the I/O backend.
    #[must_use]
    pub const fn journal_type(mut self, journal_type: JournalType) -> Self {
        self.journal_type = journal_type;
        self
    }

    /// Sets whether transaction boundaries honour `sync`.
    #[must_use]
    pub const fn sync_transactional(mut self, value: bool) -> Self {
        self.sync_transactional = value;
        self
    }

    /// Sets whether non-transactional appends honour `sync`.
    #[must_use]
    pub const fn sync_non_transactional(mut self, value: bool) -> Self {
        self.sync_non_transactional = value;
        self
    }

    /// Sets whether the journal directory is created when missing.
    #[must_use]
    pub const fn create_journal_dir(mut self, value: bool) -> Self {
        self.create_journal_dir = value;
        self
    }

    /// Sets whether sync requests flush the buffer immediately.
    #[must_use]
    pub const fn flush_on_sync(mut self, value: bool) -> Self {
        self.flush_on_sync = value;
        self
    }

    /// Sets whether the write rate is logged.
    #[must_use]
    pub const fn log_write_rate(mut self, value: bool) -> Self {
        self.log_write_rate = value;
        self
    }

    /// Sets the file name prefix.
    #[must_use]
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Sets the file name extension.
    #[must_use]
    pub fn file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }

    /// Returns the flush window.
    #[must_use]
    pub const fn buffer_timeout(&self) -> Duration {
        Duration::from_micros(self.buffer_timeout_micros)
    }

    /// Returns the outstanding request limit in effect for the backend.
    ///
    /// The synchronous backend always runs one request at a time.
    #[must_use]
    pub const fn effective_max_aio(&self) -> usize {
        match self.journal_type {
            JournalType::AsyncIo => self.max_aio,
            JournalType::Nio => 1,
        }
    }

    /// Returns the largest encoded record the journal accepts.
    #[must_use]
    pub fn max_record_size(&self) -> usize {
        let file_room = self.journal_file_size.saturating_sub(HEADER_SIZE as u64);
        self.buffer_size.min(usize::try_from(file_room).unwrap_or(usize::MAX))
    }

    /// Returns whether automatic compaction is enabled.
    #[must_use]
    pub const fn compaction_enabled(&self) -> bool {
        self.compact_min_files > 0 && self.compact_percentage > 0
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> CoreResult<()> {
        if self.journal_file_size < MIN_FILE_SIZE {
            return Err(CoreError::invalid_config(format!(
                "journal_file_size must be at least {MIN_FILE_SIZE} bytes, got {}",
                self.journal_file_size
            )));
        }
        if self.min_files < 2 {
            return Err(CoreError::invalid_config(format!(
                "min_files must be at least 2, got {}",
                self.min_files
            )));
        }
        if self.compact_percentage > 100 {
            return Err(CoreError::invalid_config(format!(
                "compact_percentage must be between 0 and 100, got {}",
                self.compact_percentage
            )));
        }
        if self.max_aio == 0 {
            return Err(CoreError::invalid_config("max_aio must be positive"));
        }
        if self.buffer_size == 0 {
            return Err(CoreError::invalid_config("buffer_size must be positive"));
        }
        if self.buffer_timeout_micros == 0 {
            return Err(CoreError::invalid_config(
                "buffer_timeout_micros must be positive",
            ));
        }
        if self.file_prefix.is_empty() {
            return Err(CoreError::invalid_config("file_prefix must not be empty"));
        }
        if self.file_extension.is_empty() || self.file_extension.contains('.') {
            return Err(CoreError::invalid_config(format!(
                "file_extension must be non-empty and contain no dot, got '{}'",
                self.file_extension
            )));
        }
        Ok(())
    }
}
