//! Record codec: on-disk layout of journal records.
//!
//! Every record is framed as
//!
//! ```text
//! [kind:1][record_id:8][body_len:4][user_type:1]
//! [tx_id:8]               transactional kinds and boundary markers
//! [record_count:4]        PREPARE and COMMIT
//! [body:body_len]
//! [crc32:4]               over every preceding byte of the frame
//! ```
//!
//! All integers are little-endian. A zero kind byte marks the end of the
//! data in a pre-allocated file.

use crate::error::{CoreError, CoreResult};
use crate::types::{RecordId, TransactionId};
use thiserror::Error;

/// Size of the fields every record starts with.
pub const BASE_HEADER_SIZE: usize = 1 + 8 + 4 + 1;

/// Size of the trailing checksum.
pub const CHECKSUM_SIZE: usize = 4;

/// Kind byte marking unused space.
pub const END_OF_DATA: u8 = 0;

/// Kind of journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Add a record.
    Add = 11,
    /// Replace the payload of a live record.
    Update = 12,
    /// Add a record inside a transaction.
    AddTx = 13,
    /// Replace a payload inside a transaction.
    UpdateTx = 14,
    /// Delete a record inside a transaction.
    DeleteTx = 15,
    /// Delete a record.
    Delete = 16,
    /// First phase of a two-phase commit.
    Prepare = 17,
    /// Make a transaction's records visible.
    Commit = 18,
    /// Discard a transaction's records.
    Rollback = 19,
}

impl RecordKind {
    /// Converts a byte to a record kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            11 => Some(Self::Add),
            12 => Some(Self::Update),
            13 => Some(Self::AddTx),
            14 => Some(Self::UpdateTx),
            15 => Some(Self::DeleteTx),
            16 => Some(Self::Delete),
            17 => Some(Self::Prepare),
            18 => Some(Self::Commit),
            19 => Some(Self::Rollback),
            _ => None,
        }
    }

    /// Converts the record kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns true for kinds that carry a transaction id.
    #[must_use]
    pub const fn has_tx_id(self) -> bool {
        !matches!(self, Self::Add | Self::Update | Self::Delete)
    }

    /// Returns true for kinds that carry a record count.
    #[must_use]
    pub const fn has_record_count(self) -> bool {
        matches!(self, Self::Prepare | Self::Commit)
    }

    /// Returns true for PREPARE, COMMIT and ROLLBACK.
    #[must_use]
    pub const fn is_boundary(self) -> bool {
        matches!(self, Self::Prepare | Self::Commit | Self::Rollback)
    }

    /// Size of the fixed part of a record of this kind.
    #[must_use]
    pub const fn header_size(self) -> usize {
        let mut size = BASE_HEADER_SIZE;
        if self.has_tx_id() {
            size += 8;
        }
        if self.has_record_count() {
            size += 4;
        }
        size
    }

    /// Short name used in diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Update => "UPDATE",
            Self::AddTx => "ADD_TX",
            Self::UpdateTx => "UPDATE_TX",
            Self::DeleteTx => "DELETE_TX",
            Self::Delete => "DELETE",
            Self::Prepare => "PREPARE",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
        }
    }
}

/// A journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// Add a record.
    Add {
        /// Record id.
        id: RecordId,
        /// Caller type tag.
        user_type: u8,
        /// Payload bytes.
        payload: Vec<u8>,
    },

    /// Replace the payload of a live record.
    Update {
        /// Record id.
        id: RecordId,
        /// Caller type tag.
        user_type: u8,
        /// Payload bytes.
        payload: Vec<u8>,
    },

    /// Delete a record.
    Delete {
        /// Record id.
        id: RecordId,
    },

    /// Add a record inside a transaction.
    AddTx {
        /// Owning transaction.
        tx_id: TransactionId,
        /// Record id.
        id: RecordId,
        /// Caller type tag.
        user_type: u8,
        /// Payload bytes.
        payload: Vec<u8>,
    },

    /// Replace a payload inside a transaction.
    UpdateTx {
        /// Owning transaction.
        tx_id: TransactionId,
        /// Record id.
        id: RecordId,
        /// Caller type tag.
        user_type: u8,
        /// Payload bytes.
        payload: Vec<u8>,
    },

    /// Delete a record inside a transaction.
    DeleteTx {
        /// Owning transaction.
        tx_id: TransactionId,
        /// Record id.
        id: RecordId,
    },

    /// First phase of a two-phase commit.
    Prepare {
        /// Transaction being prepared.
        tx_id: TransactionId,
        /// Number of records the transaction wrote before this marker.
        record_count: u32,
        /// Opaque XA recovery data.
        extra_data: Vec<u8>,
    },

    /// Make a transaction's records visible.
    Commit {
        /// Transaction being committed.
        tx_id: TransactionId,
        /// Number of records the transaction wrote.
        record_count: u32,
    },

    /// Discard a transaction's records.
    Rollback {
        /// Transaction being rolled back.
        tx_id: TransactionId,
    },
}

impl JournalRecord {
    /// Returns the kind of this record.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Add { .. } => RecordKind::Add,
            Self::Update { .. } => RecordKind::Update,
            Self::Delete { .. } => RecordKind::Delete,
            Self::AddTx { .. } => RecordKind::AddTx,
            Self::UpdateTx { .. } => RecordKind::UpdateTx,
            Self::DeleteTx { .. } => RecordKind::DeleteTx,
            Self::Prepare { .. } => RecordKind::Prepare,
            Self::Commit { .. } => RecordKind::Commit,
            Self::Rollback { .. } => RecordKind::Rollback,
        }
    }

    /// Returns the record id, or `None` for boundary markers.
    #[must_use]
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            Self::Add { id, .. }
            | Self::Update { id, .. }
            | Self::Delete { id }
            | Self::AddTx { id, .. }
            | Self::UpdateTx { id, .. }
            | Self::DeleteTx { id, .. } => Some(*id),
            Self::Prepare { .. } | Self::Commit { .. } | Self::Rollback { .. } => None,
        }
    }

    /// Returns the transaction id, if the record has one.
    #[must_use]
    pub fn tx_id(&self) -> Option<TransactionId> {
        match self {
            Self::AddTx { tx_id, .. }
            | Self::UpdateTx { tx_id, .. }
            | Self::DeleteTx { tx_id, .. }
            | Self::Prepare { tx_id, .. }
            | Self::Commit { tx_id, .. }
            | Self::Rollback { tx_id } => Some(*tx_id),
            Self::Add { .. } | Self::Update { .. } | Self::Delete { .. } => None,
        }
    }

    /// Returns the caller's type tag, or 0 for kinds without one.
    #[must_use]
    pub fn user_type(&self) -> u8 {
        match self {
            Self::Add { user_type, .. }
            | Self::Update { user_type, .. }
            | Self::AddTx { user_type, .. }
            | Self::UpdateTx { user_type, .. } => *user_type,
            _ => 0,
        }
    }

    fn record_count(&self) -> u32 {
        match self {
            Self::Prepare { record_count, .. } | Self::Commit { record_count, .. } => *record_count,
            _ => 0,
        }
    }

    /// Returns the body bytes: the payload, PREPARE's extra data, or nothing.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        match self {
            Self::Add { payload, .. }
            | Self::Update { payload, .. }
            | Self::AddTx { payload, .. }
            | Self::UpdateTx { payload, .. } => payload,
            Self::Prepare { extra_data, .. } => extra_data,
            _ => &[],
        }
    }

    /// Returns the exact number of bytes [`JournalRecord::encode`] produces.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.kind().header_size() + self.body().len() + CHECKSUM_SIZE
    }

    /// Encodes the record into its framed on-disk form.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RecordTooLarge`] if the body does not fit the
    /// 32-bit length field.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let kind = self.kind();
        let body = self.body();
        let body_len = u32::try_from(body.len()).map_err(|_| CoreError::RecordTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        })?;

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(kind.as_byte());
        buf.extend_from_slice(&self.record_id().map_or(0, RecordId::as_u64).to_le_bytes());
        buf.extend_from_slice(&body_len.to_le_bytes());
        buf.push(self.user_type());
        if let Some(tx_id) = self.tx_id() {
            buf.extend_from_slice(&tx_id.as_u64().to_le_bytes());
        }
        if kind.has_record_count() {
            buf.extend_from_slice(&self.record_count().to_le_bytes());
        }
        buf.extend_from_slice(body);

        let crc = compute_checksum(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes the record starting at the beginning of `buf`.
    ///
    /// `buf` may extend past the record; only the framed bytes are consumed.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] when `buf` ends before the declared
    /// frame does, and [`DecodeError::Corrupt`] for an unknown kind, a
    /// checksum mismatch or an inconsistent frame.
    pub fn decode(buf: &[u8]) -> Result<Decoded, DecodeError> {
        let Some(&kind_byte) = buf.first() else {
            return Ok(Decoded::End);
        };
        if kind_byte == END_OF_DATA {
            return Ok(Decoded::End);
        }
        let kind = RecordKind::from_byte(kind_byte).ok_or_else(|| DecodeError::Corrupt {
            message: format!("unknown record kind {kind_byte}"),
            frame_len: None,
        })?;

        let header_size = kind.header_size();
        if buf.len() < header_size {
            return Err(DecodeError::Truncated {
                needed: header_size,
                available: buf.len(),
            });
        }

        let mut cursor = 1;
        let read_u64 = |cursor: &mut usize| -> u64 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[*cursor..*cursor + 8]);
            *cursor += 8;
            u64::from_le_bytes(bytes)
        };
        let id = RecordId::new(read_u64(&mut cursor));

        let read_u32 = |cursor: &mut usize| -> u32 {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&buf[*cursor..*cursor + 4]);
            *cursor += 4;
            u32::from_le_bytes(bytes)
        };
        let body_len = read_u32(&mut cursor) as usize;
        let user_type = buf[cursor];
        cursor += 1;

        let tx_id = kind
            .has_tx_id()
            .then(|| TransactionId::new(read_u64(&mut cursor)));
        let record_count = if kind.has_record_count() {
            read_u32(&mut cursor)
        } else {
            0
        };

        let frame_len = header_size
            .checked_add(body_len)
            .and_then(|n| n.checked_add(CHECKSUM_SIZE))
            .ok_or_else(|| DecodeError::Corrupt {
                message: format!("body length {body_len} overflows"),
                frame_len: None,
            })?;
        if buf.len() < frame_len {
            return Err(DecodeError::Truncated {
                needed: frame_len,
                available: buf.len(),
            });
        }

        let crc_offset = frame_len - CHECKSUM_SIZE;
        let stored = read_u32(&mut { crc_offset });
        let computed = compute_checksum(&buf[..crc_offset]);
        if stored != computed {
            return Err(DecodeError::Corrupt {
                message: format!(
                    "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
                ),
                frame_len: Some(frame_len),
            });
        }

        let body = &buf[header_size..crc_offset];
        let corrupt = |message: &str| DecodeError::Corrupt {
            message: format!("{} record {message}", kind.name()),
            frame_len: Some(frame_len),
        };
        if kind.is_boundary() && id.as_u64() != 0 {
            return Err(corrupt("carries a record id"));
        }
        let empty_body = matches!(
            kind,
            RecordKind::Delete | RecordKind::DeleteTx | RecordKind::Commit | RecordKind::Rollback
        );
        if empty_body && !body.is_empty() {
            return Err(corrupt("has a body"));
        }

        // has_tx_id() guarantees the value for these kinds
        let tx_id = tx_id.unwrap_or(TransactionId::new(0));
        let record = match kind {
            RecordKind::Add => JournalRecord::Add {
                id,
                user_type,
                payload: body.to_vec(),
            },
            RecordKind::Update => JournalRecord::Update {
                id,
                user_type,
                payload: body.to_vec(),
            },
            RecordKind::Delete => JournalRecord::Delete { id },
            RecordKind::AddTx => JournalRecord::AddTx {
                tx_id,
                id,
                user_type,
                payload: body.to_vec(),
            },
            RecordKind::UpdateTx => JournalRecord::UpdateTx {
                tx_id,
                id,
                user_type,
                payload: body.to_vec(),
            },
            RecordKind::DeleteTx => JournalRecord::DeleteTx { tx_id, id },
            RecordKind::Prepare => JournalRecord::Prepare {
                tx_id,
                record_count,
                extra_data: body.to_vec(),
            },
            RecordKind::Commit => JournalRecord::Commit {
                tx_id,
                record_count,
            },
            RecordKind::Rollback => JournalRecord::Rollback { tx_id },
        };

        Ok(Decoded::Record {
            record,
            len: frame_len,
        })
    }
}

/// Outcome of decoding at a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A valid record occupying `len` bytes.
    Record {
        /// The decoded record.
        record: JournalRecord,
        /// Encoded length of the record.
        len: usize,
    },
    /// No more records: unused (zeroed) space or the end of the buffer.
    End,
}

/// Failure to decode a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer ends before the record frame does.
    #[error("needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the frame requires.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// The frame is present but invalid.
    #[error("{message}")]
    Corrupt {
        /// Description of the problem.
        message: String,
        /// Length of the damaged frame, when its header could be read.
        frame_len: Option<usize>,
    },
}

impl DecodeError {
    /// Attaches the file and offset the failure was found at.
    #[must_use]
    pub fn at(self, file: &str, offset: u64) -> CoreError {
        match self {
            Self::Truncated { needed, available } => CoreError::TruncatedRecord {
                file: file.to_string(),
                offset,
                needed,
                available,
            },
            Self::Corrupt { message, .. } => CoreError::corrupt_record(file, offset, message),
        }
    }
}

/// Computes the CRC32 checksum used by record frames and file headers.
#[must_use]
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
