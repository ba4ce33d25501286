//! Error types for the journal core.

use crate::types::{RecordId, TransactionId};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in journal operations.
///
/// Every failure belongs to exactly one family: corruption
/// ([`CoreError::CorruptRecord`], [`CoreError::InvalidFormat`]),
/// truncation ([`CoreError::TruncatedRecord`]), write failure
/// ([`CoreError::WriteFailed`]), programmer error (unknown ids, duplicate
/// ids and transactions, oversized records, misuse of the lifecycle) or
/// configuration.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] mqjournal_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record failed validation (bad checksum, unknown kind, bad framing).
    #[error("corrupt record in {file} at offset {offset}: {message}")]
    CorruptRecord {
        /// Name of the file holding the record.
        file: String,
        /// Offset of the record within the file.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// Fewer bytes remain than a record declares.
    #[error("truncated record in {file} at offset {offset}: needed {needed} bytes, {available} available")]
    TruncatedRecord {
        /// Name of the file holding the record.
        file: String,
        /// Offset of the record within the file.
        offset: u64,
        /// Bytes the record header declares.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// Invalid journal file format or version.
    #[error("invalid journal format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// A physical write (or force) failed.
    ///
    /// One failed write resolves every append it carried, so the payload is
    /// plain data that can be cloned per append.
    #[error("write failed (code {code}): {message}")]
    WriteFailed {
        /// Backend error code (OS error number when available).
        code: i32,
        /// Description of the failure.
        message: String,
    },

    /// Update or delete of an id that is not live.
    #[error("record not found: {id}")]
    RecordNotFound {
        /// The unknown record id.
        id: RecordId,
    },

    /// Add of an id that is already live.
    #[error("duplicate record: {id}")]
    DuplicateRecord {
        /// The live record id.
        id: RecordId,
    },

    /// New work for a transaction that has already been prepared.
    #[error("duplicate transaction: {tx_id} is already prepared")]
    DuplicateTransaction {
        /// The transaction id.
        tx_id: TransactionId,
    },

    /// An encoded record does not fit the buffer or a journal file.
    #[error("record too large: {size} bytes exceeds maximum of {max}")]
    RecordTooLarge {
        /// Encoded size of the record.
        size: usize,
        /// Largest size accepted.
        max: usize,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// Another journal holds the directory lock.
    #[error("journal locked: another process has exclusive access")]
    JournalLocked,

    /// The journal has not been started.
    #[error("journal not started")]
    NotStarted,

    /// The journal has not been loaded yet.
    #[error("journal not loaded")]
    NotLoaded,

    /// Invalid operation for the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a corrupt record error.
    pub fn corrupt_record(file: impl Into<String>, offset: u64, message: impl Into<String>) -> Self {
        Self::CorruptRecord {
            file: file.into(),
            offset,
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a write failure error.
    pub fn write_failed(code: i32, message: impl Into<String>) -> Self {
        Self::WriteFailed {
            code,
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if this error is data corruption.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptRecord { .. } | Self::TruncatedRecord { .. } | Self::InvalidFormat { .. }
        )
    }

    /// Returns true if this error reports caller misuse.
    #[must_use]
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::RecordNotFound { .. }
                | Self::DuplicateRecord { .. }
                | Self::DuplicateTransaction { .. }
                | Self::RecordTooLarge { .. }
                | Self::InvalidOperation { .. }
                | Self::NotStarted
                | Self::NotLoaded
        )
    }
}

impl From<&mqjournal_storage::StorageError> for CoreError {
    fn from(err: &mqjournal_storage::StorageError) -> Self {
        Self::write_failed(err.code(), err.to_string())
    }
}
