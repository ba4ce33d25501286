//! File pool: pre-allocated free files ready to become the current file.

use crate::error::CoreResult;
use crate::file::file_name;
use crate::stats::JournalMetrics;
use mqjournal_storage::{SequentialFile, SequentialFileFactory};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Allocates, recycles and deletes journal files.
///
/// Free files are pre-sized to the journal file size and zeroed, so taking
/// one never pays for allocation on the append path. The pool has its own
/// lock; replenishing it does not hold up appenders.
pub struct FilePool {
    factory: Arc<dyn SequentialFileFactory>,
    prefix: String,
    extension: String,
    file_size: u64,
    min_files: usize,
    free: Mutex<VecDeque<Arc<dyn SequentialFile>>>,
    next_seq: AtomicU64,
    metrics: Arc<JournalMetrics>,
}

impl FilePool {
    /// Creates an empty pool that names new files from `next_seq` on.
    pub fn new(
        factory: Arc<dyn SequentialFileFactory>,
        prefix: impl Into<String>,
        extension: impl Into<String>,
        file_size: u64,
        min_files: usize,
        metrics: Arc<JournalMetrics>,
    ) -> Self {
        Self {
            factory,
            prefix: prefix.into(),
            extension: extension.into(),
            file_size,
            min_files,
            free: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(1),
            metrics,
        }
    }

    /// Returns the factory files are created through.
    #[must_use]
    pub fn factory(&self) -> &Arc<dyn SequentialFileFactory> {
        &self.factory
    }

    /// Returns the size every pooled file is allocated to.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Makes sure new names start after `seq`.
    pub fn observe_seq(&self, seq: u64) {
        self.next_seq.fetch_max(seq + 1, Ordering::SeqCst);
    }

    /// Adds an already formatted, empty file to the free list.
    pub fn add_free(&self, file: Arc<dyn SequentialFile>) {
        self.free.lock().push_back(file);
    }

    /// Returns the number of free files.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Takes a free file, creating one when the pool is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a new file cannot be created.
    pub fn allocate_file(&self) -> CoreResult<Arc<dyn SequentialFile>> {
        if let Some(file) = self.free.lock().pop_front() {
            return Ok(file);
        }
        self.create_file()
    }

    /// Creates free files until at least `min` are ready.
    ///
    /// Returns the number of files created.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be created.
    pub fn reserve_free_files(&self, min: usize) -> CoreResult<usize> {
        let mut created = 0;
        while self.free_count() < min {
            let file = self.create_file()?;
            self.add_free(file);
            created += 1;
        }
        if created > 0 {
            debug!(created, free = self.free_count(), "reserved free journal files");
        }
        Ok(created)
    }

    /// Returns a file with no live records to the pool.
    ///
    /// The file is reset to zeros and kept as a free file, or deleted when
    /// the pool already holds `min_files` free files.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be reset or deleted.
    pub fn reclaim(&self, file: Arc<dyn SequentialFile>) -> CoreResult<()> {
        self.metrics.record_reclaim();
        if self.free_count() >= self.min_files {
            return self.delete(&file);
        }
        self.reset(&file)?;
        self.add_free(file);
        Ok(())
    }

    /// Truncates a file back to an all-zero pre-allocated file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be re-allocated.
    pub fn reset(&self, file: &Arc<dyn SequentialFile>) -> CoreResult<()> {
        debug!(file = file.name(), "resetting journal file");
        file.reset(self.file_size)?;
        Ok(())
    }

    /// Deletes a file from the journal directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be deleted.
    pub fn delete(&self, file: &Arc<dyn SequentialFile>) -> CoreResult<()> {
        debug!(file = file.name(), "deleting journal file");
        self.factory.delete_file(file.name())?;
        Ok(())
    }

    fn create_file(&self) -> CoreResult<Arc<dyn SequentialFile>> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let name = file_name(&self.prefix, seq, &self.extension);
        let file = self.factory.create_file(&name, self.file_size)?;
        self.metrics.record_file_created();
        debug!(file = %name, size = self.file_size, "created journal file");
        Ok(file)
    }
}

impl std::fmt::Debug for FilePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePool")
            .field("backend", &self.factory.kind())
            .field("prefix", &self.prefix)
            .field("file_size", &self.file_size)
            .field("free", &self.free_count())
            .finish()
    }
}
