//! Journal files: header format, naming and per-file bookkeeping.
//!
//! Every journal file starts with a fixed header:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬──────────┬──────────┐
//! │ magic(4) │ ver(2)   │ resv(2)  │ fileID(8)│ crc32(4) │ pad(12)  │
//! └──────────┴──────────┴──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! A file whose header is all zeros (or carries fileID 0) is FREE. The
//! fileID is written when the file becomes the current file.

use crate::error::{CoreError, CoreResult};
use crate::record::compute_checksum;
use crate::types::FileId;
use mqjournal_storage::SequentialFile;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Size of the file header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Magic bytes at the start of every formatted journal file.
pub const FILE_MAGIC: [u8; 4] = *b"MQJF";

/// Current on-disk format version.
pub const FORMAT_VERSION: u16 = 1;

const CRC_OFFSET: usize = 16;

/// Lifecycle state of a journal file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    /// Receiving appends.
    Current,
    /// Full or superseded; holds records until reclaimed.
    Data,
    /// Pre-formatted and empty, waiting in the pool.
    Free,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => write!(f, "CURRENT"),
            Self::Data => write!(f, "DATA"),
            Self::Free => write!(f, "FREE"),
        }
    }
}

/// What a file header says about its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// The file holds records and has this id.
    Data(FileId),
    /// The file is free.
    Free,
}

/// Encodes the header of a file with id `file_id`.
#[must_use]
pub fn encode_header(file_id: FileId) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&FILE_MAGIC);
    header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&file_id.as_u64().to_le_bytes());
    let crc = compute_checksum(&header[..CRC_OFFSET]);
    header[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    header
}

/// Decodes a file header.
///
/// Short and all-zero headers are free files, as is a valid header
/// carrying fileID 0.
///
/// # Errors
///
/// Returns [`CoreError::InvalidFormat`] if the header holds data but is not
/// a valid header of a supported version.
pub fn decode_header(name: &str, bytes: &[u8]) -> CoreResult<HeaderKind> {
    if bytes.len() < HEADER_SIZE || bytes[..HEADER_SIZE].iter().all(|b| *b == 0) {
        return Ok(HeaderKind::Free);
    }
    if bytes[0..4] != FILE_MAGIC {
        return Err(CoreError::invalid_format(format!(
            "{name}: bad magic {:02x?}",
            &bytes[0..4]
        )));
    }
    let stored = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let computed = compute_checksum(&bytes[..CRC_OFFSET]);
    if stored != computed {
        return Err(CoreError::invalid_format(format!(
            "{name}: header checksum mismatch"
        )));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(CoreError::invalid_format(format!(
            "{name}: unsupported format version {version}"
        )));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&bytes[8..16]);
    match u64::from_le_bytes(id) {
        0 => Ok(HeaderKind::Free),
        id => Ok(HeaderKind::Data(FileId::new(id))),
    }
}

/// Builds the name of the `seq`-th file created in a journal directory.
#[must_use]
pub fn file_name(prefix: &str, seq: u64, extension: &str) -> String {
    format!("{prefix}-{seq}.{extension}")
}

/// Extracts the creation counter from a journal file name.
#[must_use]
pub fn parse_file_seq(name: &str, prefix: &str, extension: &str) -> Option<u64> {
    name.strip_prefix(prefix)?
        .strip_prefix('-')?
        .strip_suffix(extension)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

/// A journal file holding records, plus its in-memory bookkeeping.
///
/// `live_records` counts the physical records in this file that must stay
/// on disk: the current and superseded versions of live records, pending
/// transactional records and PREPARE markers of open transactions.
/// `neg_refs` lists the files holding records that records in this file
/// cancel (deletes, commits and rollbacks); this file must outlive them.
#[derive(Debug)]
pub struct JournalFile {
    id: FileId,
    file: Arc<dyn SequentialFile>,
    state: FileState,
    capacity: u64,
    write_position: u64,
    live_records: u64,
    live_bytes: u64,
    total_records: u64,
    neg_refs: BTreeMap<FileId, u32>,
}

impl JournalFile {
    /// Wraps a file whose header has been written.
    pub fn new(id: FileId, file: Arc<dyn SequentialFile>, capacity: u64) -> Self {
        Self {
            id,
            file,
            state: FileState::Data,
            capacity,
            write_position: HEADER_SIZE as u64,
            live_records: 0,
            live_bytes: 0,
            total_records: 0,
            neg_refs: BTreeMap::new(),
        }
    }

    /// Returns the file id.
    #[must_use]
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Returns the file name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.file.name()
    }

    /// Returns the underlying file.
    #[must_use]
    pub fn file(&self) -> &Arc<dyn SequentialFile> {
        &self.file
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> FileState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: FileState) {
        self.state = state;
    }

    /// Returns the file capacity.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the offset the next record will be written at.
    #[must_use]
    pub fn write_position(&self) -> u64 {
        self.write_position
    }

    pub(crate) fn set_write_position(&mut self, position: u64) {
        self.write_position = position;
    }

    /// Returns true if `len` more bytes fit in the file.
    #[must_use]
    pub fn fits(&self, len: usize) -> bool {
        self.write_position + len as u64 <= self.capacity
    }

    /// Reserves `len` bytes at the write position and returns their offset.
    pub(crate) fn reserve(&mut self, len: usize) -> u64 {
        let offset = self.write_position;
        self.write_position += len as u64;
        offset
    }

    /// Returns the number of records that keep this file alive.
    #[must_use]
    pub fn live_records(&self) -> u64 {
        self.live_records
    }

    /// Returns the encoded size of those records.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    /// Returns the number of records ever written to the file.
    #[must_use]
    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    /// Returns the files this file holds cancelling records for.
    #[must_use]
    pub fn neg_refs(&self) -> &BTreeMap<FileId, u32> {
        &self.neg_refs
    }

    pub(crate) fn count_record(&mut self) {
        self.total_records += 1;
    }

    pub(crate) fn pin(&mut self, len: u32) {
        self.live_records += 1;
        self.live_bytes += u64::from(len);
    }

    pub(crate) fn unpin(&mut self, len: u32) {
        debug_assert!(self.live_records > 0, "unpin of {} below zero", self.id);
        self.live_records = self.live_records.saturating_sub(1);
        self.live_bytes = self.live_bytes.saturating_sub(u64::from(len));
    }

    pub(crate) fn add_neg_ref(&mut self, target: FileId) {
        if target != self.id {
            *self.neg_refs.entry(target).or_insert(0) += 1;
        }
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> FileStats {
        FileStats {
            id: self.id,
            name: self.name().to_string(),
            state: self.state,
            capacity: self.capacity,
            write_position: self.write_position,
            live_records: self.live_records,
            live_bytes: self.live_bytes,
            total_records: self.total_records,
            neg_refs: self.neg_refs.keys().copied().collect(),
        }
    }
}

/// Point-in-time counters of one journal file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStats {
    /// File id.
    pub id: FileId,
    /// File name.
    pub name: String,
    /// Lifecycle state.
    pub state: FileState,
    /// Pre-allocated size.
    pub capacity: u64,
    /// Offset of the next append.
    pub write_position: u64,
    /// Records keeping the file alive.
    pub live_records: u64,
    /// Bytes of those records.
    pub live_bytes: u64,
    /// Records ever written.
    pub total_records: u64,
    /// Files this file holds cancelling records for.
    pub neg_refs: Vec<FileId>,
}
