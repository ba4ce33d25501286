//! Core type definitions for the journal.

use std::fmt;

/// Caller-supplied identifier of a record.
///
/// Record ids are unique within the journal's lifetime and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub u64);

impl RecordId {
    /// Creates a new record ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec:{}", self.0)
    }
}

/// Identifier grouping transactional records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for TransactionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Sequence number of a journal file.
///
/// Assigned when a file becomes the current file; strictly increasing over
/// the journal's life. Zero is reserved for files in the free pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u64);

impl FileId {
    /// The id carried by free (unassigned) files.
    pub const UNASSIGNED: Self = Self(0);

    /// Creates a new file ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next file ID.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file:{}", self.0)
    }
}

/// A live record as returned by `load()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The record id.
    pub id: RecordId,
    /// Opaque type tag chosen by the caller.
    pub user_type: u8,
    /// The newest payload written for the id.
    pub payload: Vec<u8>,
    /// The transaction that last wrote the record, if it was transactional.
    pub tx_id: Option<TransactionId>,
}

/// Physical position of an encoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    /// File holding the record.
    pub file_id: FileId,
    /// Offset of the first byte of the record.
    pub offset: u64,
    /// Encoded length of the record.
    pub len: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_next() {
        assert_eq!(FileId::new(4).next(), FileId::new(5));
        assert_eq!(FileId::UNASSIGNED.as_u64(), 0);
    }

    #[test]
    fn ids_from_u64() {
        assert_eq!(RecordId::from(7), RecordId::new(7));
        assert_eq!(TransactionId::from(9).as_u64(), 9);
    }

    #[test]
    fn display_formats() {
        assert_eq!(RecordId::new(3).to_string(), "rec:3");
        assert_eq!(TransactionId::new(3).to_string(), "txn:3");
        assert_eq!(FileId::new(3).to_string(), "file:3");
    }

    #[test]
    fn transaction_id_ordering() {
        assert!(TransactionId::new(1) < TransactionId::new(2));
    }
}
