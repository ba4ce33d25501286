//! # mqjournal core
//!
//! Crash-durable, append-only message journal.
//!
//! This crate provides:
//! - Record codec with CRC32 integrity checks
//! - Fixed-size journal files recycled through a file pool
//! - A timed write buffer that groups appends into fewer forced writes
//! - Transactions with XA-style PREPARE, COMMIT and ROLLBACK markers
//! - Recovery that tolerates a torn tail write and reports prepared
//!   transactions
//! - Reclaiming of dead files and compaction of sparse ones
//!
//! ## Example
//!
//! ```rust
//! use mqjournal_core::{Journal, JournalConfig};
//! use mqjournal_storage::InMemoryFileFactory;
//! use std::sync::Arc;
//!
//! let factory = InMemoryFileFactory::new();
//! let config = JournalConfig::new().journal_file_size(64 * 1024);
//!
//! let journal = Journal::with_factory(config.clone(), Arc::new(factory.clone())).unwrap();
//! journal.start().unwrap();
//! journal.load().unwrap();
//! journal.append_add(1, 0, b"hello", true).unwrap();
//! journal.stop().unwrap();
//!
//! let journal = Journal::with_factory(config, Arc::new(factory)).unwrap();
//! journal.start().unwrap();
//! let loaded = journal.load().unwrap();
//! assert_eq!(loaded.committed_records[0].payload, b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod buffer;
mod compactor;
mod config;
mod dir;
mod error;
mod file;
mod journal;
mod ledger;
mod loader;
mod pool;
mod record;
mod stats;
mod transaction;
mod types;

pub use buffer::{Completer, Completion, FailureListener, TimedBuffer, TimedBufferObserver};
pub use compactor::{CompactionControl, CompactionReport, ControlPhase};
pub use config::{
    JournalConfig, JournalType, DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_TIMEOUT_MICROS,
    DEFAULT_FILE_SIZE, DEFAULT_MAX_AIO, MIN_FILE_SIZE,
};
pub use dir::JournalDir;
pub use error::{CoreError, CoreResult};
pub use file::{
    decode_header, encode_header, file_name, parse_file_seq, FileState, FileStats, HeaderKind,
    JournalFile, FILE_MAGIC, FORMAT_VERSION, HEADER_SIZE,
};
pub use journal::Journal;
pub use loader::{
    list_journal_files, scan_journal, FileScan, LoadMode, LoadResult, LoadStats, ScannedRecord,
    TornTail,
};
pub use pool::FilePool;
pub use record::{
    compute_checksum, DecodeError, Decoded, JournalRecord, RecordKind, BASE_HEADER_SIZE,
    CHECKSUM_SIZE, END_OF_DATA,
};
pub use stats::{JournalMetrics, JournalStats, MetricsSnapshot};
pub use transaction::{TransactionPhase, TransactionState};
pub use types::{FileId, Record, RecordId, RecordLocation, TransactionId};
