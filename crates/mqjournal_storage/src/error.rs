//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of a file.
    #[error("read beyond end of file: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current file size.
        size: u64,
    },

    /// Attempted to write beyond the pre-allocated capacity of a file.
    #[error("write beyond file capacity: offset {offset}, len {len}, capacity {capacity}")]
    WritePastEnd {
        /// The requested write offset.
        offset: u64,
        /// The requested write length.
        len: usize,
        /// The file capacity.
        capacity: u64,
    },

    /// The named file does not exist.
    #[error("file not found: {0}")]
    NotFound(String),

    /// The named file already exists.
    #[error("file already exists: {0}")]
    AlreadyExists(String),

    /// The backend has been shut down.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Returns a numeric error code for this failure.
    ///
    /// I/O errors report the OS error number when one is available.
    /// Other variants map to small negative codes.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(-1),
            Self::ReadPastEnd { .. } => -2,
            Self::WritePastEnd { .. } => -3,
            Self::NotFound(_) => -4,
            Self::AlreadyExists(_) => -5,
            Self::Closed => -6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_code_uses_os_error() {
        let err = StorageError::Io(io::Error::from_raw_os_error(28));
        assert_eq!(err.code(), 28);
    }

    #[test]
    fn non_io_codes_are_negative() {
        assert!(StorageError::Closed.code() < 0);
        assert!(StorageError::NotFound("x".into()).code() < 0);
    }
}
