//! Transaction state.

use crate::types::{Record, RecordId, RecordLocation, TransactionId};
use std::collections::BTreeSet;
use std::fmt;

/// Phase of an open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionPhase {
    /// Records have been appended; no PREPARE yet.
    Started,
    /// PREPARE has been written; awaiting COMMIT or ROLLBACK.
    Prepared,
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "STARTED"),
            Self::Prepared => write!(f, "PREPARED"),
        }
    }
}

/// An open transaction as reported by `load()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionState {
    /// Transaction id.
    pub id: TransactionId,
    /// Phase reached before the restart.
    pub phase: TransactionPhase,
    /// Ids touched by the transaction's records.
    pub pending_record_ids: BTreeSet<RecordId>,
    /// XA recovery data from the PREPARE record.
    pub extra_data: Vec<u8>,
    /// Records the transaction adds or updates, in append order.
    pub records: Vec<Record>,
    /// Ids the transaction deletes, in append order.
    pub deletes: Vec<RecordId>,
}

/// Kind of a pending transactional record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxOpKind {
    Add,
    Update,
    Delete,
}

/// A transactional record waiting for its transaction to finish.
#[derive(Debug, Clone)]
pub(crate) struct TxOp {
    pub kind: TxOpKind,
    pub id: RecordId,
    pub user_type: u8,
    pub location: RecordLocation,
    /// Kept only while replaying, so `load()` can return prepared records.
    pub payload: Option<Vec<u8>>,
}

/// Entry of the open-transaction table.
#[derive(Debug, Clone)]
pub(crate) struct OpenTransaction {
    pub phase: TransactionPhase,
    pub ops: Vec<TxOp>,
    pub prepare: Option<RecordLocation>,
    pub extra_data: Vec<u8>,
}

impl OpenTransaction {
    pub fn new() -> Self {
        Self {
            phase: TransactionPhase::Started,
            ops: Vec::new(),
            prepare: None,
            extra_data: Vec::new(),
        }
    }

    /// Number of transactional records written so far.
    pub fn record_count(&self) -> u32 {
        u32::try_from(self.ops.len()).unwrap_or(u32::MAX)
    }

    /// Describes the transaction, moving out any replayed payloads.
    pub fn take_state(&mut self, id: TransactionId) -> TransactionState {
        let mut state = TransactionState {
            id,
            phase: self.phase,
            pending_record_ids: BTreeSet::new(),
            extra_data: self.extra_data.clone(),
            records: Vec::new(),
            deletes: Vec::new(),
        };
        for op in &mut self.ops {
            state.pending_record_ids.insert(op.id);
            let payload = op.payload.take();
            match op.kind {
                TxOpKind::Add | TxOpKind::Update => state.records.push(Record {
                    id: op.id,
                    user_type: op.user_type,
                    payload: payload.unwrap_or_default(),
                    tx_id: Some(id),
                }),
                TxOpKind::Delete => state.deletes.push(op.id),
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileId;

    fn op(kind: TxOpKind, id: u64, payload: &[u8]) -> TxOp {
        TxOp {
            kind,
            id: RecordId::new(id),
            user_type: 3,
            location: RecordLocation {
                file_id: FileId::new(1),
                offset: 32,
                len: 10,
            },
            payload: Some(payload.to_vec()),
        }
    }

    #[test]
    fn new_transaction_is_started() {
        let tx = OpenTransaction::new();
        assert_eq!(tx.phase, TransactionPhase::Started);
        assert_eq!(tx.record_count(), 0);
    }

    #[test]
    fn take_state_splits_records_and_deletes() {
        let mut tx = OpenTransaction::new();
        tx.phase = TransactionPhase::Prepared;
        tx.extra_data = b"xid".to_vec();
        tx.ops.push(op(TxOpKind::Add, 1, b"a"));
        tx.ops.push(op(TxOpKind::Update, 2, b"b"));
        tx.ops.push(op(TxOpKind::Delete, 3, b""));

        let state = tx.take_state(TransactionId::new(9));
        assert_eq!(state.phase, TransactionPhase::Prepared);
        assert_eq!(state.extra_data, b"xid");
        assert_eq!(state.pending_record_ids.len(), 3);
        assert_eq!(state.records.len(), 2);
        assert_eq!(state.records[0].payload, b"a");
        assert_eq!(state.records[1].tx_id, Some(TransactionId::new(9)));
        assert_eq!(state.deletes, vec![RecordId::new(3)]);

        // Payloads are moved out
        assert!(tx.ops.iter().all(|op| op.payload.is_none()));
    }

    #[test]
    fn phase_display() {
        assert_eq!(TransactionPhase::Prepared.to_string(), "PREPARED");
    }
}
