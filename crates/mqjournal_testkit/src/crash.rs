//! Crash and corruption simulation.
//!
//! Two kinds of damage are covered:
//!
//! 1. **Crashes while writing.** [`CrashableFactory`] wraps a backend and
//!    fails every write once a byte budget is spent. The write that crosses
//!    the budget lands partially, like a write torn by power loss.
//! 2. **Damage at rest.** The helpers below flip bytes, tear the last record
//!    or append garbage to files while no journal is running.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let factory = CrashableFactory::new(Arc::new(memory.clone()));
//! factory.crash_after(10_000);
//! // ... append until writes fail, drop the journal, reload `memory`
//! ```

use bytes::Bytes;
use mqjournal_core::{scan_journal, CoreResult, FileScan};
use mqjournal_storage::{
    BackendKind, IoCallback, SequentialFile, SequentialFileFactory, StorageError, StorageResult,
};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// OS error number reported by simulated failures (EIO).
const SIMULATED_ERRNO: i32 = 5;

fn simulated_failure() -> StorageError {
    StorageError::Io(io::Error::from_raw_os_error(SIMULATED_ERRNO))
}

#[derive(Debug)]
struct FaultState {
    crash_after_bytes: AtomicU64,
    bytes_written: AtomicU64,
    crashed: AtomicBool,
    fail_writes: AtomicBool,
    failures: AtomicU64,
}

impl FaultState {
    /// Returns how many bytes of a write of `len` bytes reach the file, and
    /// whether the write fails.
    fn admit(&self, len: usize) -> (usize, bool) {
        if self.fail_writes.load(Ordering::SeqCst) || self.crashed.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return (0, true);
        }
        let len = len as u64;
        let before = self.bytes_written.fetch_add(len, Ordering::SeqCst);
        let budget = self.crash_after_bytes.load(Ordering::SeqCst);
        if before.saturating_add(len) <= budget {
            return (len as usize, false);
        }
        self.crashed.store(true, Ordering::SeqCst);
        self.failures.fetch_add(1, Ordering::SeqCst);
        (budget.saturating_sub(before) as usize, true)
    }
}

/// A file factory that can simulate write failures and crashes.
#[derive(Clone)]
pub struct CrashableFactory {
    inner: Arc<dyn SequentialFileFactory>,
    state: Arc<FaultState>,
}

impl CrashableFactory {
    /// Wraps `inner`; writes pass through until a fault is armed.
    #[must_use]
    pub fn new(inner: Arc<dyn SequentialFileFactory>) -> Self {
        Self {
            inner,
            state: Arc::new(FaultState {
                crash_after_bytes: AtomicU64::new(u64::MAX),
                bytes_written: AtomicU64::new(0),
                crashed: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Crashes once `bytes` more bytes have been written.
    pub fn crash_after(&self, bytes: u64) {
        let written = self.state.bytes_written.load(Ordering::SeqCst);
        self.state
            .crash_after_bytes
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Makes every write fail (or succeed again) without losing data.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns whether the byte budget has been spent.
    #[must_use]
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// Returns the number of writes that failed.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.state.failures.load(Ordering::SeqCst)
    }

    fn wrap(&self, file: Arc<dyn SequentialFile>) -> Arc<dyn SequentialFile> {
        Arc::new(CrashableFile {
            inner: file,
            state: Arc::clone(&self.state),
        })
    }
}

impl fmt::Debug for CrashableFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashableFactory")
            .field("inner", &self.inner.kind())
            .field("state", &self.state)
            .finish()
    }
}

impl SequentialFileFactory for CrashableFactory {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn create_file(&self, name: &str, capacity: u64) -> StorageResult<Arc<dyn SequentialFile>> {
        Ok(self.wrap(self.inner.create_file(name, capacity)?))
    }

    fn open_file(&self, name: &str) -> StorageResult<Arc<dyn SequentialFile>> {
        Ok(self.wrap(self.inner.open_file(name)?))
    }

    fn list_files(&self, extension: &str) -> StorageResult<Vec<String>> {
        self.inner.list_files(extension)
    }

    fn delete_file(&self, name: &str) -> StorageResult<()> {
        self.inner.delete_file(name)
    }

    fn write_control(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        match self.state.admit(data.len()) {
            (_, false) => self.inner.write_control(name, data),
            (_, true) => Err(simulated_failure()),
        }
    }

    fn read_control(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.read_control(name)
    }

    fn remove_control(&self, name: &str) -> StorageResult<()> {
        self.inner.remove_control(name)
    }

    fn max_io(&self) -> usize {
        self.inner.max_io()
    }

    fn pending_io(&self) -> usize {
        self.inner.pending_io()
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }
}

#[derive(Debug)]
struct CrashableFile {
    inner: Arc<dyn SequentialFile>,
    state: Arc<FaultState>,
}

impl SequentialFile for CrashableFile {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn write_at(&self, offset: u64, data: Bytes, sync: bool, callback: IoCallback) {
        match self.state.admit(data.len()) {
            (_, false) => self.inner.write_at(offset, data, sync, callback),
            (landed, true) => {
                if landed > 0 {
                    let _ = self.inner.write_blocking(offset, &data[..landed], sync);
                }
                callback(Err(simulated_failure()));
            }
        }
    }

    fn write_blocking(&self, offset: u64, data: &[u8], sync: bool) -> StorageResult<()> {
        match self.state.admit(data.len()) {
            (_, false) => self.inner.write_blocking(offset, data, sync),
            (landed, true) => {
                if landed > 0 {
                    self.inner.write_blocking(offset, &data[..landed], sync)?;
                }
                Err(simulated_failure())
            }
        }
    }

    fn sync(&self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn reset(&self, capacity: u64) -> StorageResult<()> {
        self.inner.reset(capacity)
    }
}

/// Returns the scan of the data file with the highest file id.
///
/// # Errors
///
/// Returns an error if the files cannot be read.
pub fn newest_data_file(
    factory: &dyn SequentialFileFactory,
    prefix: &str,
    extension: &str,
) -> CoreResult<Option<FileScan>> {
    Ok(scan_journal(factory, prefix, extension)?
        .into_iter()
        .filter(|scan| scan.file_id.is_some())
        .max_by_key(|scan| scan.file_id))
}

/// Returns the scan of the data file with the lowest file id.
///
/// # Errors
///
/// Returns an error if the files cannot be read.
pub fn oldest_data_file(
    factory: &dyn SequentialFileFactory,
    prefix: &str,
    extension: &str,
) -> CoreResult<Option<FileScan>> {
    Ok(scan_journal(factory, prefix, extension)?
        .into_iter()
        .filter(|scan| scan.file_id.is_some())
        .min_by_key(|scan| scan.file_id))
}

/// Inverts the byte at `offset` of file `name`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or written.
pub fn flip_byte(factory: &dyn SequentialFileFactory, name: &str, offset: u64) -> CoreResult<()> {
    let file = factory.open_file(name)?;
    let byte = file.read_at(offset, 1)?;
    file.write_blocking(offset, &[!byte[0]], true)?;
    Ok(())
}

/// Zeroes the second half of the last record of the newest data file,
/// as a write interrupted by power loss would leave it.
///
/// Returns the name of the file and the offset of the torn record, or
/// `None` if the newest file holds no record.
///
/// # Errors
///
/// Returns an error if the files cannot be read or written.
pub fn tear_last_record(
    factory: &dyn SequentialFileFactory,
    prefix: &str,
    extension: &str,
) -> CoreResult<Option<(String, u64)>> {
    let Some(scan) = newest_data_file(factory, prefix, extension)? else {
        return Ok(None);
    };
    let Some(last) = scan.records.last() else {
        return Ok(None);
    };
    let keep = last.len / 2;
    let file = factory.open_file(&scan.name)?;
    file.write_blocking(last.offset + keep as u64, &vec![0u8; last.len - keep], true)?;
    Ok(Some((scan.name, last.offset)))
}

/// Zeroes record `index` of the newest data file and leaves the records
/// after it in place, as a lost batch overtaken by a later one would.
///
/// Returns the name of the file and the offset of the lost record, or
/// `None` if the newest file holds no such record.
///
/// # Errors
///
/// Returns an error if the files cannot be read or written.
pub fn lose_record(
    factory: &dyn SequentialFileFactory,
    prefix: &str,
    extension: &str,
    index: usize,
) -> CoreResult<Option<(String, u64)>> {
    let Some(scan) = newest_data_file(factory, prefix, extension)? else {
        return Ok(None);
    };
    let Some(lost) = scan.records.get(index) else {
        return Ok(None);
    };
    let file = factory.open_file(&scan.name)?;
    file.write_blocking(lost.offset, &vec![0u8; lost.len], true)?;
    Ok(Some((scan.name, lost.offset)))
}

/// Writes `garbage` right after the last record of the newest data file.
///
/// Returns the offset the garbage was written at.
///
/// # Errors
///
/// Returns an error if there is no data file or it has no room.
pub fn append_garbage(
    factory: &dyn SequentialFileFactory,
    prefix: &str,
    extension: &str,
    garbage: &[u8],
) -> CoreResult<u64> {
    let scan = newest_data_file(factory, prefix, extension)?.ok_or_else(|| {
        mqjournal_core::CoreError::invalid_operation("no data file to damage")
    })?;
    let file = factory.open_file(&scan.name)?;
    file.write_blocking(scan.end, garbage, true)?;
    Ok(scan.end)
}
