//! Journal statistics and telemetry.
//!
//! # Usage
//!
//! ```rust,ignore
//! let journal = Journal::open(config)?;
//! journal.start()?;
//! journal.load()?;
//! journal.append_add(RecordId::new(1), 0, b"msg", true)?;
//!
//! let stats = journal.stats();
//! println!("Appends: {}", stats.metrics.appends);
//! println!("Flushes: {}", stats.metrics.flushes);
//! ```

use crate::file::FileStats;
use crate::types::FileId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Journal counters.
///
/// All counters are atomic and can be read while operations are in progress.
#[derive(Debug, Default)]
pub struct JournalMetrics {
    // Append counters
    appends: AtomicU64,
    bytes_appended: AtomicU64,
    sync_appends: AtomicU64,

    // Transaction counters
    commits: AtomicU64,
    rollbacks: AtomicU64,
    prepares: AtomicU64,

    // Buffer counters
    flushes: AtomicU64,
    bytes_flushed: AtomicU64,
    write_failures: AtomicU64,

    // File counters
    rollovers: AtomicU64,
    files_created: AtomicU64,
    files_reclaimed: AtomicU64,
    compactions: AtomicU64,
}

impl JournalMetrics {
    /// Creates a new metrics instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_append(&self, bytes: usize, sync: bool) {
        self.appends.fetch_add(1, Ordering::Relaxed);
        self.bytes_appended
            .fetch_add(bytes as u64, Ordering::Relaxed);
        if sync {
            self.sync_appends.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_prepare(&self) {
        self.prepares.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, bytes: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.bytes_flushed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollover(&self) {
        self.rollovers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_file_created(&self) {
        self.files_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reclaim(&self) {
        self.files_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of physical buffer flushes.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Returns the number of failed physical writes.
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            appends: self.appends.load(Ordering::Relaxed),
            bytes_appended: self.bytes_appended.load(Ordering::Relaxed),
            sync_appends: self.sync_appends.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            prepares: self.prepares.load(Ordering::Relaxed),
            flushes: self.flushes(),
            bytes_flushed: self.bytes_flushed.load(Ordering::Relaxed),
            write_failures: self.write_failures(),
            rollovers: self.rollovers.load(Ordering::Relaxed),
            files_created: self.files_created.load(Ordering::Relaxed),
            files_reclaimed: self.files_reclaimed.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`JournalMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Records appended.
    pub appends: u64,
    /// Encoded bytes appended.
    pub bytes_appended: u64,
    /// Appends that waited for durability.
    pub sync_appends: u64,
    /// COMMIT records appended.
    pub commits: u64,
    /// ROLLBACK records appended.
    pub rollbacks: u64,
    /// PREPARE records appended.
    pub prepares: u64,
    /// Physical writes issued by the timed buffer.
    pub flushes: u64,
    /// Bytes handed to those writes.
    pub bytes_flushed: u64,
    /// Physical writes that failed.
    pub write_failures: u64,
    /// Times the current file changed.
    pub rollovers: u64,
    /// Files created by the pool.
    pub files_created: u64,
    /// Files returned to the pool or deleted.
    pub files_reclaimed: u64,
    /// Completed compactions.
    pub compactions: u64,
}

/// Snapshot of the whole journal, as returned by `Journal::stats()`.
#[derive(Debug, Clone, Default)]
pub struct JournalStats {
    /// Counters.
    pub metrics: MetricsSnapshot,
    /// Per-file counters, ascending by file id.
    pub files: Vec<FileStats>,
    /// Id of the file receiving appends.
    pub current_file: Option<FileId>,
    /// Free files waiting in the pool.
    pub free_files: usize,
    /// Live records in the index.
    pub live_records: usize,
    /// Open (started or prepared) transactions.
    pub open_transactions: usize,
    /// Write requests submitted to the backend and not yet completed.
    pub pending_io: usize,
    /// Outstanding request limit of the backend.
    pub max_io: usize,
}

impl JournalStats {
    /// Returns the fraction of used bytes that belong to live records.
    ///
    /// Returns 1.0 for a journal without data.
    #[must_use]
    pub fn live_fraction(&self) -> f64 {
        let (live, used) = self.files.iter().fold((0u64, 0u64), |(live, used), f| {
            (live + f.live_bytes, used + f.write_position)
        });
        if used == 0 {
            1.0
        } else {
            live as f64 / used as f64
        }
    }
}
