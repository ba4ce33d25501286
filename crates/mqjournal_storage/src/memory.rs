//! In-memory backend for testing.

use crate::backend::{BackendKind, IoCallback, SequentialFile, SequentialFileFactory};
use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An in-memory sequential file.
#[derive(Debug)]
pub struct InMemoryFile {
    name: String,
    data: RwLock<Vec<u8>>,
}

impl InMemoryFile {
    fn new(name: &str, capacity: u64) -> Self {
        Self {
            name: name.to_string(),
            data: RwLock::new(vec![0u8; capacity as usize]),
        }
    }

    /// Returns a copy of the file content.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Replaces the file content.
    ///
    /// Useful for simulating torn writes and corruption in tests.
    pub fn set_data(&self, data: Vec<u8>) {
        *self.data.write() = data;
    }

    fn write(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        let capacity = data.len() as u64;
        let end = offset.saturating_add(bytes.len() as u64);
        if end > capacity {
            return Err(StorageError::WritePastEnd {
                offset,
                len: bytes.len(),
                capacity,
            });
        }
        data[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }
}

impl SequentialFile for InMemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn write_at(&self, offset: u64, data: Bytes, _sync: bool, callback: IoCallback) {
        callback(self.write(offset, &data));
    }

    fn write_blocking(&self, offset: u64, data: &[u8], _sync: bool) -> StorageResult<()> {
        self.write(offset, data)
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    fn reset(&self, capacity: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        data.clear();
        data.resize(capacity as usize, 0);
        Ok(())
    }
}

/// A volatile file factory.
///
/// Clones share the same files, so a journal re-opened with a clone of the
/// factory sees everything written before, which is how tests simulate a
/// restart without touching the disk.
///
/// # Example
///
/// ```rust
/// use mqjournal_storage::{InMemoryFileFactory, SequentialFileFactory};
///
/// let factory = InMemoryFileFactory::new();
/// let file = factory.create_file("data-1.mqj", 64).unwrap();
/// file.write_blocking(0, b"hello", false).unwrap();
///
/// let restarted = factory.clone();
/// let file = restarted.open_file("data-1.mqj").unwrap();
/// assert_eq!(file.read_at(0, 5).unwrap(), b"hello");
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryFileFactory {
    files: Arc<RwLock<BTreeMap<String, Arc<InMemoryFile>>>>,
    controls: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryFileFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the file `name`, if it exists.
    #[must_use]
    pub fn file(&self, name: &str) -> Option<Arc<InMemoryFile>> {
        self.files.read().get(name).cloned()
    }
}

impl SequentialFileFactory for InMemoryFileFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn create_file(&self, name: &str, capacity: u64) -> StorageResult<Arc<dyn SequentialFile>> {
        let mut files = self.files.write();
        if files.contains_key(name) {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        let file = Arc::new(InMemoryFile::new(name, capacity));
        files.insert(name.to_string(), Arc::clone(&file));
        Ok(file)
    }

    fn open_file(&self, name: &str) -> StorageResult<Arc<dyn SequentialFile>> {
        match self.files.read().get(name) {
            Some(file) => Ok(Arc::clone(file) as Arc<dyn SequentialFile>),
            None => Err(StorageError::NotFound(name.to_string())),
        }
    }

    fn list_files(&self, extension: &str) -> StorageResult<Vec<String>> {
        let suffix = format!(".{extension}");
        Ok(self
            .files
            .read()
            .keys()
            .filter(|name| name.ends_with(&suffix))
            .cloned()
            .collect())
    }

    fn delete_file(&self, name: &str) -> StorageResult<()> {
        match self.files.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(name.to_string())),
        }
    }

    fn write_control(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        self.controls
            .write()
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn read_control(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.controls.read().get(name).cloned())
    }

    fn remove_control(&self, name: &str) -> StorageResult<()> {
        self.controls.write().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_create_is_zeroed() {
        let factory = InMemoryFileFactory::new();
        let file = factory.create_file("a-1.mqj", 32).unwrap();
        assert_eq!(file.size().unwrap(), 32);
        assert_eq!(file.read_all().unwrap(), vec![0u8; 32]);
    }

    #[test]
    fn memory_write_and_read() {
        let factory = InMemoryFileFactory::new();
        let file = factory.create_file("a-1.mqj", 32).unwrap();

        file.write_blocking(4, b"hello", false).unwrap();
        assert_eq!(file.read_at(4, 5).unwrap(), b"hello");
    }

    #[test]
    fn memory_write_past_capacity_fails() {
        let factory = InMemoryFileFactory::new();
        let file = factory.create_file("a-1.mqj", 8).unwrap();

        let result = file.write_blocking(6, b"abc", false);
        assert!(matches!(result, Err(StorageError::WritePastEnd { .. })));
    }

    #[test]
    fn memory_read_past_end_fails() {
        let factory = InMemoryFileFactory::new();
        let file = factory.create_file("a-1.mqj", 8).unwrap();

        let result = file.read_at(4, 10);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn memory_clones_share_files() {
        let factory = InMemoryFileFactory::new();
        factory.create_file("a-1.mqj", 8).unwrap();

        let clone = factory.clone();
        assert_eq!(clone.list_files("mqj").unwrap(), vec!["a-1.mqj".to_string()]);
        clone.delete_file("a-1.mqj").unwrap();
        assert!(factory.list_files("mqj").unwrap().is_empty());
    }

    #[test]
    fn memory_reset_zeroes() {
        let factory = InMemoryFileFactory::new();
        let file = factory.create_file("a-1.mqj", 8).unwrap();
        file.write_blocking(0, &[9; 8], false).unwrap();

        file.reset(16).unwrap();
        assert_eq!(file.read_all().unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn memory_set_data_simulates_corruption() {
        let factory = InMemoryFileFactory::new();
        factory.create_file("a-1.mqj", 4).unwrap();

        factory.file("a-1.mqj").unwrap().set_data(vec![1, 2]);
        let file = factory.open_file("a-1.mqj").unwrap();
        assert_eq!(file.read_all().unwrap(), vec![1, 2]);
    }

    #[test]
    fn memory_controls() {
        let factory = InMemoryFileFactory::new();
        assert!(factory.read_control("c").unwrap().is_none());
        factory.write_control("c", b"x").unwrap();
        assert_eq!(factory.read_control("c").unwrap().unwrap(), b"x");
        factory.remove_control("c").unwrap();
        assert!(factory.read_control("c").unwrap().is_none());
    }
}
