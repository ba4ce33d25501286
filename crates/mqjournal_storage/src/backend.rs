//! Sequential file and file factory trait definitions.

use crate::error::StorageResult;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Completion handler for an asynchronous write.
///
/// Invoked exactly once with the outcome of the write (and of the force, if
/// one was requested). Handlers run on a backend thread and must not block
/// for long.
pub type IoCallback = Box<dyn FnOnce(StorageResult<()>) + Send + 'static>;

/// The I/O strategy a factory uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Buffered writes executed on the calling thread, plus explicit force.
    Nio,
    /// Writes executed by a bounded pool of I/O threads with ordered completions.
    Aio,
    /// Volatile in-process storage.
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nio => write!(f, "NIO"),
            Self::Aio => write!(f, "ASYNCIO"),
            Self::Memory => write!(f, "MEMORY"),
        }
    }
}

/// A fixed-capacity file written at explicit offsets.
///
/// Sequential files are **opaque byte stores**: they know nothing about
/// journal headers or records. The journal owns all format interpretation.
///
/// # Invariants
///
/// - Writes submitted through [`SequentialFile::write_at`] complete (their
///   callbacks run) in submission order
/// - A write submitted with `sync = true` is durable when its callback
///   reports success, together with every earlier write to the same file
/// - [`SequentialFile::reset`] leaves the file at `capacity` bytes, all zero
pub trait SequentialFile: Send + Sync + fmt::Debug {
    /// Returns the file name, relative to the factory's directory.
    fn name(&self) -> &str;

    /// Returns the current size of the file in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends past the end of the file or an
    /// I/O error occurs.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Reads the whole file.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        self.read_at(0, size as usize)
    }

    /// Submits a write of `data` at `offset`.
    ///
    /// The callback receives the outcome. Synchronous backends run the write
    /// and the callback before returning; asynchronous backends may block
    /// here only while the outstanding request limit is reached.
    fn write_at(&self, offset: u64, data: Bytes, sync: bool, callback: IoCallback);

    /// Writes `data` at `offset` and waits for it, bypassing any queue.
    ///
    /// Used for headers and other out-of-band writes to files that have no
    /// queued writes in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or force fails.
    fn write_blocking(&self, offset: u64, data: &[u8], sync: bool) -> StorageResult<()>;

    /// Forces all written data to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the force fails.
    fn sync(&self) -> StorageResult<()>;

    /// Discards all content and re-allocates the file at `capacity` zero bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be truncated or allocated.
    fn reset(&self, capacity: u64) -> StorageResult<()>;
}

/// Creates, enumerates and removes [`SequentialFile`]s in one location.
///
/// A factory also owns the backend-wide resources, such as the I/O thread
/// pool and the outstanding request accounting of the asynchronous backend.
/// That accounting is per instance, so several journals can share a process.
pub trait SequentialFileFactory: Send + Sync + fmt::Debug {
    /// Returns the I/O strategy of this factory.
    fn kind(&self) -> BackendKind;

    /// Creates a new file pre-allocated to `capacity` zero bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file already exists or cannot be allocated.
    fn create_file(&self, name: &str, capacity: u64) -> StorageResult<Arc<dyn SequentialFile>>;

    /// Opens an existing file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotFound`] if the file does not exist.
    fn open_file(&self, name: &str) -> StorageResult<Arc<dyn SequentialFile>>;

    /// Lists the names of all files ending in `.{extension}`, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the location cannot be listed.
    fn list_files(&self, extension: &str) -> StorageResult<Vec<String>>;

    /// Deletes a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be removed.
    fn delete_file(&self, name: &str) -> StorageResult<()>;

    /// Atomically replaces the small control file `name` with `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be made durable.
    fn write_control(&self, name: &str, data: &[u8]) -> StorageResult<()>;

    /// Reads the control file `name`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    fn read_control(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Removes the control file `name` if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be removed.
    fn remove_control(&self, name: &str) -> StorageResult<()>;

    /// Maximum number of outstanding write requests.
    fn max_io(&self) -> usize {
        1
    }

    /// Number of write requests submitted but not yet completed.
    fn pending_io(&self) -> usize {
        0
    }

    /// Stops backend threads after draining queued requests.
    ///
    /// Writes submitted afterwards fail with [`crate::StorageError::Closed`].
    fn shutdown(&self) {}
}
