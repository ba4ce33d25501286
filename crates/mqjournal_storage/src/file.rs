//! File-based sequential files and the synchronous (NIO) backend.

use crate::backend::{BackendKind, IoCallback, SequentialFile, SequentialFileFactory};
use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use fs2::FileExt as _;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A pre-allocated file on disk addressed by absolute offsets.
///
/// Shared by the synchronous and asynchronous backends. Positional I/O is
/// used so that concurrent reads never disturb a shared cursor.
#[derive(Debug)]
pub(crate) struct DiskFile {
    name: String,
    file: File,
    capacity: AtomicU64,
}

impl DiskFile {
    /// Creates `name` in `dir` and reserves `capacity` bytes for it.
    pub(crate) fn create(dir: &Path, name: &str, capacity: u64) -> StorageResult<Self> {
        let path = dir.join(name);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        preallocate(&file, capacity)?;
        file.sync_all()?;
        sync_dir(dir)?;

        Ok(Self {
            name: name.to_string(),
            file,
            capacity: AtomicU64::new(capacity),
        })
    }

    /// Opens the existing file `name` in `dir`.
    pub(crate) fn open(dir: &Path, name: &str) -> StorageResult<Self> {
        let path = dir.join(name);
        if !path.exists() {
            return Err(StorageError::NotFound(name.to_string()));
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let capacity = file.metadata()?.len();

        Ok(Self {
            name: name.to_string(),
            file,
            capacity: AtomicU64::new(capacity),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn size(&self) -> StorageResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub(crate) fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        let mut buffer = vec![0u8; len];
        if len > 0 {
            read_exact_at(&self.file, &mut buffer, offset)?;
        }
        Ok(buffer)
    }

    /// Writes on the calling thread, forcing afterwards when `sync` is set.
    pub(crate) fn write_now(&self, offset: u64, data: &[u8], sync: bool) -> StorageResult<()> {
        let capacity = self.capacity.load(Ordering::Acquire);
        if offset.saturating_add(data.len() as u64) > capacity {
            return Err(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                capacity,
            });
        }

        if !data.is_empty() {
            write_all_at(&self.file, data, offset)?;
        }
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub(crate) fn sync(&self) -> StorageResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub(crate) fn reset(&self, capacity: u64) -> StorageResult<()> {
        self.file.set_len(0)?;
        preallocate(&self.file, capacity)?;
        self.file.sync_all()?;
        self.capacity.store(capacity, Ordering::Release);
        Ok(())
    }
}

/// Reserves `len` bytes of disk space, falling back to a sparse extension
/// on filesystems without allocation support.
fn preallocate(file: &File, len: u64) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }
    if file.allocate(len).is_err() {
        file.set_len(len)?;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Fsyncs a directory so that creations, renames and removals are durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> StorageResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> StorageResult<()> {
    // Directory fsync is not available; renames are durable on NTFS
    Ok(())
}

/// Lists the files in `dir` ending in `.{extension}`, sorted by name.
pub(crate) fn list_with_extension(dir: &Path, extension: &str) -> StorageResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Replaces a control file using write-then-rename.
pub(crate) fn write_control_file(dir: &Path, name: &str, data: &[u8]) -> StorageResult<()> {
    let path = dir.join(name);
    let temp_path = dir.join(format!("{name}.tmp"));

    {
        let file = File::create(&temp_path)?;
        write_all_at(&file, data, 0)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, &path)?;
    sync_dir(dir)
}

pub(crate) fn read_control_file(dir: &Path, name: &str) -> StorageResult<Option<Vec<u8>>> {
    match fs::read(dir.join(name)) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn remove_control_file(dir: &Path, name: &str) -> StorageResult<()> {
    match fs::remove_file(dir.join(name)) {
        Ok(()) => sync_dir(dir),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn delete_disk_file(dir: &Path, name: &str) -> StorageResult<()> {
    match fs::remove_file(dir.join(name)) {
        Ok(()) => sync_dir(dir),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(StorageError::NotFound(name.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// A journal file written synchronously on the submitting thread.
///
/// # Durability
///
/// - `write_at(.., sync = false, ..)` hands the bytes to the OS page cache
/// - `write_at(.., sync = true, ..)` additionally calls `sync_data`
#[derive(Debug)]
pub struct NioFile {
    disk: DiskFile,
}

impl SequentialFile for NioFile {
    fn name(&self) -> &str {
        self.disk.name()
    }

    fn size(&self) -> StorageResult<u64> {
        self.disk.size()
    }

    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.disk.read_at(offset, len)
    }

    fn write_at(&self, offset: u64, data: Bytes, sync: bool, callback: IoCallback) {
        callback(self.disk.write_now(offset, &data, sync));
    }

    fn write_blocking(&self, offset: u64, data: &[u8], sync: bool) -> StorageResult<()> {
        self.disk.write_now(offset, data, sync)
    }

    fn sync(&self) -> StorageResult<()> {
        self.disk.sync()
    }

    fn reset(&self, capacity: u64) -> StorageResult<()> {
        self.disk.reset(capacity)
    }
}

/// Factory for [`NioFile`]s inside one directory.
///
/// # Example
///
/// ```no_run
/// use mqjournal_storage::{NioFileFactory, SequentialFileFactory};
/// use std::path::Path;
///
/// let factory = NioFileFactory::open_with_create_dirs(Path::new("journal")).unwrap();
/// let file = factory.create_file("data-1.mqj", 1024 * 1024).unwrap();
/// file.write_blocking(0, b"header", true).unwrap();
/// ```
#[derive(Debug)]
pub struct NioFileFactory {
    dir: PathBuf,
}

impl NioFileFactory {
    /// Creates a factory for an existing directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the directory does not exist.
    pub fn new(dir: &Path) -> StorageResult<Self> {
        if !dir.is_dir() {
            return Err(StorageError::NotFound(dir.display().to_string()));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Creates a factory, creating the directory and its parents if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open_with_create_dirs(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        Self::new(dir)
    }

    /// Returns the directory this factory manages.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SequentialFileFactory for NioFileFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Nio
    }

    fn create_file(&self, name: &str, capacity: u64) -> StorageResult<Arc<dyn SequentialFile>> {
        let disk = DiskFile::create(&self.dir, name, capacity)?;
        Ok(Arc::new(NioFile { disk }))
    }

    fn open_file(&self, name: &str) -> StorageResult<Arc<dyn SequentialFile>> {
        let disk = DiskFile::open(&self.dir, name)?;
        Ok(Arc::new(NioFile { disk }))
    }

    fn list_files(&self, extension: &str) -> StorageResult<Vec<String>> {
        list_with_extension(&self.dir, extension)
    }

    fn delete_file(&self, name: &str) -> StorageResult<()> {
        delete_disk_file(&self.dir, name)
    }

    fn write_control(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        write_control_file(&self.dir, name, data)
    }

    fn read_control(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        read_control_file(&self.dir, name)
    }

    fn remove_control(&self, name: &str) -> StorageResult<()> {
        remove_control_file(&self.dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::tempdir;

    #[test]
    fn create_preallocates_zeroes() {
        let dir = tempdir().unwrap();
        let factory = NioFileFactory::new(dir.path()).unwrap();

        let file = factory.create_file("a-1.mqj", 4096).unwrap();
        assert_eq!(file.size().unwrap(), 4096);
        assert!(file.read_all().unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn create_existing_fails() {
        let dir = tempdir().unwrap();
        let factory = NioFileFactory::new(dir.path()).unwrap();

        factory.create_file("a-1.mqj", 128).unwrap();
        let result = factory.create_file("a-1.mqj", 128);
        assert!(matches!(result, Err(StorageError::AlreadyExists(_))));
    }

    #[test]
    fn write_at_invokes_callback_inline() {
        let dir = tempdir().unwrap();
        let factory = NioFileFactory::new(dir.path()).unwrap();
        let file = factory.create_file("a-1.mqj", 128).unwrap();

        let (tx, rx) = mpsc::channel();
        file.write_at(
            10,
            Bytes::from_static(b"hello"),
            true,
            Box::new(move |r| tx.send(r.is_ok()).unwrap()),
        );

        assert!(rx.try_recv().unwrap());
        assert_eq!(file.read_at(10, 5).unwrap(), b"hello");
    }

    #[test]
    fn write_past_capacity_fails() {
        let dir = tempdir().unwrap();
        let factory = NioFileFactory::new(dir.path()).unwrap();
        let file = factory.create_file("a-1.mqj", 16).unwrap();

        let result = file.write_blocking(12, b"too long", false);
        assert!(matches!(result, Err(StorageError::WritePastEnd { .. })));
    }

    #[test]
    fn read_past_end_fails() {
        let dir = tempdir().unwrap();
        let factory = NioFileFactory::new(dir.path()).unwrap();
        let file = factory.create_file("a-1.mqj", 16).unwrap();

        let result = file.read_at(10, 10);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn reset_zeroes_content() {
        let dir = tempdir().unwrap();
        let factory = NioFileFactory::new(dir.path()).unwrap();
        let file = factory.create_file("a-1.mqj", 64).unwrap();

        file.write_blocking(0, &[0xAB; 64], true).unwrap();
        file.reset(64).unwrap();

        assert_eq!(file.size().unwrap(), 64);
        assert!(file.read_all().unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn persistence_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let factory = NioFileFactory::new(dir.path()).unwrap();
            let file = factory.create_file("a-1.mqj", 32).unwrap();
            file.write_blocking(0, b"persistent", true).unwrap();
        }

        let factory = NioFileFactory::new(dir.path()).unwrap();
        let file = factory.open_file("a-1.mqj").unwrap();
        assert_eq!(file.read_at(0, 10).unwrap(), b"persistent");
    }

    #[test]
    fn list_filters_by_extension() {
        let dir = tempdir().unwrap();
        let factory = NioFileFactory::new(dir.path()).unwrap();
        factory.create_file("a-2.mqj", 8).unwrap();
        factory.create_file("a-1.mqj", 8).unwrap();
        factory.create_file("other.dat", 8).unwrap();

        let names = factory.list_files("mqj").unwrap();
        assert_eq!(names, vec!["a-1.mqj".to_string(), "a-2.mqj".to_string()]);
    }

    #[test]
    fn delete_missing_file_reports_not_found() {
        let dir = tempdir().unwrap();
        let factory = NioFileFactory::new(dir.path()).unwrap();

        let result = factory.delete_file("nope.mqj");
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn control_file_round_trip() {
        let dir = tempdir().unwrap();
        let factory = NioFileFactory::new(dir.path()).unwrap();

        assert!(factory.read_control("state.cmp").unwrap().is_none());
        factory.write_control("state.cmp", b"v1").unwrap();
        factory.write_control("state.cmp", b"v2").unwrap();
        assert_eq!(factory.read_control("state.cmp").unwrap().unwrap(), b"v2");

        factory.remove_control("state.cmp").unwrap();
        factory.remove_control("state.cmp").unwrap();
        assert!(factory.read_control("state.cmp").unwrap().is_none());
    }

    #[test]
    fn open_with_create_dirs_creates_nested() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        let factory = NioFileFactory::open_with_create_dirs(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(factory.dir(), nested);
    }

    #[test]
    fn new_requires_existing_dir() {
        let dir = tempdir().unwrap();
        let result = NioFileFactory::new(&dir.path().join("missing"));
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }
}
