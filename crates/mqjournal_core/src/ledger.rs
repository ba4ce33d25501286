//! Live index, transaction table and per-file counters.
//!
//! The same bookkeeping runs for live appends and for replay, so the state
//! rebuilt by the loader is exactly the state the journal had before the
//! restart. Live appends are validated first with [`Ledger::check`];
//! replay is lenient where a reclaimed file can explain a missing record.

use crate::error::{CoreError, CoreResult};
use crate::file::{JournalFile, HEADER_SIZE};
use crate::record::JournalRecord;
use crate::transaction::{OpenTransaction, TransactionPhase, TransactionState, TxOp, TxOpKind};
use crate::types::{FileId, Record, RecordId, RecordLocation, TransactionId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Whether records are being appended or replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Live,
    Replay,
}

/// Index entry of a live record.
#[derive(Debug, Clone)]
pub(crate) struct LiveRecord {
    pub user_type: u8,
    /// Newest version.
    pub location: RecordLocation,
    /// Older versions; they stay on disk until the record is deleted or
    /// the journal is compacted.
    pub superseded: Vec<RecordLocation>,
    /// Order of the first ADD.
    pub add_seq: u64,
    pub tx_id: Option<TransactionId>,
    /// Kept only while replaying.
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub(crate) struct Ledger {
    pub files: BTreeMap<FileId, JournalFile>,
    pub records: HashMap<RecordId, LiveRecord>,
    pub transactions: HashMap<TransactionId, OpenTransaction>,
    /// Updates replayed before any ADD of their id.
    pub orphans: BTreeMap<RecordId, RecordLocation>,
    /// Commits that declared more records than were found.
    pub incomplete_commits: u64,
    next_add_seq: u64,
    live_data_bytes: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates an append against the current state.
    pub fn check(&self, record: &JournalRecord) -> CoreResult<()> {
        match record {
            JournalRecord::Add { id, .. } => {
                if self.records.contains_key(id) {
                    return Err(CoreError::DuplicateRecord { id: *id });
                }
            }
            JournalRecord::Update { id, .. } | JournalRecord::Delete { id } => {
                if !self.records.contains_key(id) {
                    return Err(CoreError::RecordNotFound { id: *id });
                }
            }
            JournalRecord::AddTx { tx_id, .. }
            | JournalRecord::UpdateTx { tx_id, .. }
            | JournalRecord::DeleteTx { tx_id, .. }
            | JournalRecord::Prepare { tx_id, .. } => {
                if self.is_prepared(*tx_id) {
                    return Err(CoreError::DuplicateTransaction { tx_id: *tx_id });
                }
            }
            JournalRecord::Commit { tx_id, .. } | JournalRecord::Rollback { tx_id } => {
                if !self.transactions.contains_key(tx_id) {
                    return Err(CoreError::invalid_operation(format!(
                        "cannot find open transaction {tx_id}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn is_prepared(&self, tx_id: TransactionId) -> bool {
        self.transactions
            .get(&tx_id)
            .is_some_and(|tx| tx.phase == TransactionPhase::Prepared)
    }

    /// Applies a record written at `loc`.
    pub fn apply(&mut self, record: JournalRecord, loc: RecordLocation, mode: Mode) -> CoreResult<()> {
        match self.files.get_mut(&loc.file_id) {
            Some(file) => file.count_record(),
            None => {
                return Err(CoreError::invalid_operation(format!(
                    "record written to unknown {}",
                    loc.file_id
                )))
            }
        }
        let keep = |payload: Vec<u8>| (mode == Mode::Replay).then_some(payload);

        match record {
            JournalRecord::Add {
                id,
                user_type,
                payload,
            } => {
                self.pin(loc);
                self.orphans.remove(&id);
                self.put(id, user_type, loc, None, keep(payload));
            }
            JournalRecord::Update {
                id,
                user_type,
                payload,
            } => {
                if !self.records.contains_key(&id) {
                    if mode == Mode::Live {
                        return Err(CoreError::RecordNotFound { id });
                    }
                    self.orphans.insert(id, loc);
                }
                self.pin(loc);
                self.put(id, user_type, loc, None, keep(payload));
            }
            JournalRecord::Delete { id } => {
                if !self.remove_record(id, loc.file_id) {
                    if mode == Mode::Live {
                        return Err(CoreError::RecordNotFound { id });
                    }
                    debug!(%id, "ignoring delete of reclaimed record");
                }
            }
            JournalRecord::AddTx {
                tx_id,
                id,
                user_type,
                payload,
            } => self.push_op(tx_id, TxOpKind::Add, id, user_type, loc, keep(payload))?,
            JournalRecord::UpdateTx {
                tx_id,
                id,
                user_type,
                payload,
            } => self.push_op(tx_id, TxOpKind::Update, id, user_type, loc, keep(payload))?,
            JournalRecord::DeleteTx { tx_id, id } => {
                self.push_op(tx_id, TxOpKind::Delete, id, 0, loc, None)?;
            }
            JournalRecord::Prepare {
                tx_id, extra_data, ..
            } => {
                let tx = self.open_tx(tx_id, loc)?;
                tx.phase = TransactionPhase::Prepared;
                tx.prepare = Some(loc);
                tx.extra_data = extra_data;
                self.pin(loc);
            }
            JournalRecord::Commit {
                tx_id,
                record_count,
            } => self.commit(tx_id, record_count, loc, mode)?,
            JournalRecord::Rollback { tx_id } => self.rollback(tx_id, loc),
        }
        Ok(())
    }

    fn open_tx(&mut self, tx_id: TransactionId, loc: RecordLocation) -> CoreResult<&mut OpenTransaction> {
        if self.is_prepared(tx_id) {
            return Err(self.corrupt(loc, format!("record for already prepared {tx_id}")));
        }
        Ok(self
            .transactions
            .entry(tx_id)
            .or_insert_with(OpenTransaction::new))
    }

    fn push_op(
        &mut self,
        tx_id: TransactionId,
        kind: TxOpKind,
        id: RecordId,
        user_type: u8,
        loc: RecordLocation,
        payload: Option<Vec<u8>>,
    ) -> CoreResult<()> {
        self.open_tx(tx_id, loc)?.ops.push(TxOp {
            kind,
            id,
            user_type,
            location: loc,
            payload,
        });
        self.pin(loc);
        Ok(())
    }

    fn commit(
        &mut self,
        tx_id: TransactionId,
        record_count: u32,
        loc: RecordLocation,
        mode: Mode,
    ) -> CoreResult<()> {
        let tx = self
            .transactions
            .remove(&tx_id)
            .unwrap_or_else(OpenTransaction::new);

        if mode == Mode::Replay {
            let found = tx.ops.len();
            let declared = record_count as usize;
            if declared < found {
                return Err(self.corrupt(
                    loc,
                    format!("COMMIT of {tx_id} declares {declared} records, {found} found"),
                ));
            }
            if declared > found {
                warn!(%tx_id, declared, found, "committing transaction with missing records");
                self.incomplete_commits += 1;
            }
        }

        for op in tx.ops {
            self.add_neg_ref(loc.file_id, op.location.file_id);
            match op.kind {
                TxOpKind::Add => {
                    self.orphans.remove(&op.id);
                    self.put(op.id, op.user_type, op.location, Some(tx_id), op.payload);
                }
                TxOpKind::Update => {
                    if self.records.contains_key(&op.id) {
                        self.put(op.id, op.user_type, op.location, Some(tx_id), op.payload);
                    } else {
                        debug!(id = %op.id, %tx_id, "skipping committed update of missing record");
                        self.unpin(op.location);
                    }
                }
                TxOpKind::Delete => {
                    self.remove_record(op.id, op.location.file_id);
                    self.unpin(op.location);
                }
            }
        }
        if let Some(prepare) = tx.prepare {
            self.unpin(prepare);
            self.add_neg_ref(loc.file_id, prepare.file_id);
        }
        Ok(())
    }

    fn rollback(&mut self, tx_id: TransactionId, loc: RecordLocation) {
        let Some(tx) = self.transactions.remove(&tx_id) else {
            return;
        };
        for op in tx.ops.iter().map(|op| op.location).chain(tx.prepare) {
            self.unpin(op);
            self.add_neg_ref(loc.file_id, op.file_id);
        }
    }

    /// Points `id` at `loc`, keeping any previous version pinned.
    fn put(
        &mut self,
        id: RecordId,
        user_type: u8,
        loc: RecordLocation,
        tx_id: Option<TransactionId>,
        payload: Option<Vec<u8>>,
    ) {
        self.live_data_bytes += u64::from(loc.len);
        if let Some(rec) = self.records.get_mut(&id) {
            self.live_data_bytes -= u64::from(rec.location.len);
            rec.superseded.push(rec.location);
            rec.location = loc;
            rec.user_type = user_type;
            rec.tx_id = tx_id;
            rec.payload = payload;
            return;
        }
        let add_seq = self.next_add_seq;
        self.next_add_seq += 1;
        self.records.insert(
            id,
            LiveRecord {
                user_type,
                location: loc,
                superseded: Vec::new(),
                add_seq,
                tx_id,
                payload,
            },
        );
    }

    /// Drops `id` from the index; `cancel_file` holds the cancelling record.
    fn remove_record(&mut self, id: RecordId, cancel_file: FileId) -> bool {
        let Some(rec) = self.records.remove(&id) else {
            return false;
        };
        self.orphans.remove(&id);
        self.live_data_bytes -= u64::from(rec.location.len);
        for loc in std::iter::once(rec.location).chain(rec.superseded) {
            self.unpin(loc);
            self.add_neg_ref(cancel_file, loc.file_id);
        }
        true
    }

    fn pin(&mut self, loc: RecordLocation) {
        if let Some(file) = self.files.get_mut(&loc.file_id) {
            file.pin(loc.len);
        }
    }

    fn unpin(&mut self, loc: RecordLocation) {
        if let Some(file) = self.files.get_mut(&loc.file_id) {
            file.unpin(loc.len);
        }
    }

    fn add_neg_ref(&mut self, from: FileId, to: FileId) {
        if let Some(file) = self.files.get_mut(&from) {
            file.add_neg_ref(to);
        }
    }

    fn corrupt(&self, loc: RecordLocation, message: String) -> CoreError {
        let name = self
            .files
            .get(&loc.file_id)
            .map_or_else(|| loc.file_id.to_string(), |f| f.name().to_string());
        CoreError::corrupt_record(name, loc.offset, message)
    }

    /// Fails if a replayed update never met its record.
    pub fn check_orphans(&self) -> CoreResult<()> {
        match self.orphans.iter().next() {
            Some((id, loc)) => Err(self.corrupt(*loc, format!("update of unknown record {id}"))),
            None => Ok(()),
        }
    }

    /// Returns the files that can be reset, in ascending order.
    ///
    /// A file qualifies when it is not `current`, keeps no records alive,
    /// and every file it holds cancelling records for is gone or qualifies
    /// too.
    pub fn reclaimable(&self, current: Option<FileId>) -> Vec<FileId> {
        let mut ready = BTreeSet::new();
        for (id, file) in &self.files {
            if Some(*id) == current || file.live_records() > 0 {
                continue;
            }
            let cancels_nothing_on_disk = file
                .neg_refs()
                .keys()
                .all(|target| !self.files.contains_key(target) || ready.contains(target));
            if cancels_nothing_on_disk {
                ready.insert(*id);
            }
        }
        ready.into_iter().collect()
    }

    /// Bytes of the newest version of every live record.
    pub fn live_data_bytes(&self) -> u64 {
        self.live_data_bytes
    }

    /// Bytes compaction would copy: live records plus open transactions.
    pub fn retained_bytes(&self) -> u64 {
        let tx_bytes: u64 = self
            .transactions
            .values()
            .flat_map(|tx| tx.ops.iter().map(|op| op.location).chain(tx.prepare))
            .map(|loc| u64::from(loc.len))
            .sum();
        self.live_data_bytes + tx_bytes
    }

    /// Bytes of records written to all files.
    pub fn used_bytes(&self) -> u64 {
        self.files
            .values()
            .map(|f| f.write_position().saturating_sub(HEADER_SIZE as u64))
            .sum()
    }

    /// Returns live records in order of their first ADD.
    pub fn records_by_age(&self) -> Vec<(RecordId, &LiveRecord)> {
        let mut records: Vec<_> = self.records.iter().map(|(id, rec)| (*id, rec)).collect();
        records.sort_by_key(|(_, rec)| rec.add_seq);
        records
    }

    /// Moves the replayed payloads of live records out, in order of their
    /// first ADD.
    pub fn take_committed(&mut self) -> Vec<Record> {
        let mut records: Vec<_> = self
            .records
            .iter_mut()
            .map(|(id, rec)| {
                (
                    rec.add_seq,
                    Record {
                        id: *id,
                        user_type: rec.user_type,
                        payload: rec.payload.take().unwrap_or_default(),
                        tx_id: rec.tx_id,
                    },
                )
            })
            .collect();
        records.sort_by_key(|(seq, _)| *seq);
        records.into_iter().map(|(_, rec)| rec).collect()
    }

    /// Describes open transactions in the given phase, ascending by id.
    pub fn take_transactions(&mut self, phase: TransactionPhase) -> Vec<TransactionState> {
        let mut states: Vec<_> = self
            .transactions
            .iter_mut()
            .filter(|(_, tx)| tx.phase == phase)
            .map(|(id, tx)| tx.take_state(*id))
            .collect();
        states.sort_by_key(|state| state.id);
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqjournal_storage::{InMemoryFileFactory, SequentialFileFactory};

    struct Harness {
        ledger: Ledger,
        factory: InMemoryFileFactory,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                ledger: Ledger::new(),
                factory: InMemoryFileFactory::new(),
            }
        }

        fn file(&mut self, id: u64) {
            let file = self
                .factory
                .create_file(&format!("t-{id}.mqj"), 4096)
                .unwrap();
            self.ledger
                .files
                .insert(FileId::new(id), JournalFile::new(FileId::new(id), file, 4096));
        }

        fn write(&mut self, file: u64, record: JournalRecord) -> CoreResult<()> {
            self.write_mode(file, record, Mode::Live)
        }

        fn write_mode(&mut self, file: u64, record: JournalRecord, mode: Mode) -> CoreResult<()> {
            let len = record.encoded_len();
            let offset = self
                .ledger
                .files
                .get_mut(&FileId::new(file))
                .unwrap()
                .reserve(len);
            let loc = RecordLocation {
                file_id: FileId::new(file),
                offset,
                len: len as u32,
            };
            if mode == Mode::Live {
                self.ledger.check(&record)?;
            }
            self.ledger.apply(record, loc, mode)
        }

        fn live(&self, file: u64) -> u64 {
            self.ledger.files[&FileId::new(file)].live_records()
        }
    }

    fn add(id: u64) -> JournalRecord {
        JournalRecord::Add {
            id: RecordId::new(id),
            user_type: 1,
            payload: vec![id as u8; 8],
        }
    }

    fn update(id: u64) -> JournalRecord {
        JournalRecord::Update {
            id: RecordId::new(id),
            user_type: 1,
            payload: vec![0xAA; 4],
        }
    }

    fn delete(id: u64) -> JournalRecord {
        JournalRecord::Delete {
            id: RecordId::new(id),
        }
    }

    fn add_tx(tx: u64, id: u64) -> JournalRecord {
        JournalRecord::AddTx {
            tx_id: TransactionId::new(tx),
            id: RecordId::new(id),
            user_type: 2,
            payload: vec![7; 4],
        }
    }

    fn ids(set: &[u64]) -> Vec<FileId> {
        set.iter().map(|id| FileId::new(*id)).collect()
    }

    #[test]
    fn add_and_delete_track_live_counts() {
        let mut h = Harness::new();
        h.file(1);
        h.write(1, add(1)).unwrap();
        h.write(1, add(2)).unwrap();
        assert_eq!(h.live(1), 2);

        h.write(1, delete(1)).unwrap();
        assert_eq!(h.live(1), 1);
        assert_eq!(h.ledger.records.len(), 1);
        assert_eq!(h.ledger.files[&FileId::new(1)].total_records(), 3);
    }

    #[test]
    fn live_validation() {
        let mut h = Harness::new();
        h.file(1);
        h.write(1, add(1)).unwrap();

        assert!(matches!(h.write(1, add(1)), Err(CoreError::DuplicateRecord { .. })));
        assert!(matches!(h.write(1, update(9)), Err(CoreError::RecordNotFound { .. })));
        assert!(matches!(h.write(1, delete(9)), Err(CoreError::RecordNotFound { .. })));
        let commit = JournalRecord::Commit {
            tx_id: TransactionId::new(8),
            record_count: 0,
        };
        assert!(h.ledger.check(&commit).is_err());
    }

    #[test]
    fn update_keeps_old_version_pinned_until_delete() {
        let mut h = Harness::new();
        h.file(1);
        h.file(2);
        h.file(3);
        h.write(1, add(1)).unwrap();
        h.write(2, update(1)).unwrap();

        assert_eq!(h.live(1), 1);
        assert_eq!(h.live(2), 1);
        assert!(h.ledger.reclaimable(Some(FileId::new(3))).is_empty());

        h.write(3, delete(1)).unwrap();
        assert_eq!(h.live(1), 0);
        assert_eq!(h.live(2), 0);
        assert_eq!(h.ledger.reclaimable(Some(FileId::new(3))), ids(&[1, 2]));
    }

    #[test]
    fn delete_file_outlives_the_files_it_cancels() {
        let mut h = Harness::new();
        h.file(1);
        h.file(2);
        h.file(3);
        h.write(1, add(1)).unwrap();
        h.write(1, add(2)).unwrap();
        h.write(2, delete(1)).unwrap();

        // File 1 still holds record 2, so the delete in file 2 must stay
        assert!(h.ledger.reclaimable(Some(FileId::new(3))).is_empty());

        h.write(3, delete(2)).unwrap();
        assert_eq!(h.ledger.reclaimable(None), ids(&[1, 2, 3]));
        assert_eq!(h.ledger.reclaimable(Some(FileId::new(3))), ids(&[1, 2]));
    }

    #[test]
    fn commit_makes_records_visible() {
        let mut h = Harness::new();
        h.file(1);
        h.write(1, add_tx(5, 1)).unwrap();
        h.write(1, add_tx(5, 2)).unwrap();
        assert!(h.ledger.records.is_empty());
        assert_eq!(h.live(1), 2);

        h.write(
            1,
            JournalRecord::Commit {
                tx_id: TransactionId::new(5),
                record_count: 2,
            },
        )
        .unwrap();
        assert_eq!(h.ledger.records.len(), 2);
        assert_eq!(
            h.ledger.records[&RecordId::new(1)].tx_id,
            Some(TransactionId::new(5))
        );
        assert!(h.ledger.transactions.is_empty());
        assert_eq!(h.live(1), 2);
    }

    #[test]
    fn rollback_discards_and_unpins() {
        let mut h = Harness::new();
        h.file(1);
        h.file(2);
        h.file(3);
        h.write(1, add_tx(5, 1)).unwrap();
        h.write(
            1,
            JournalRecord::Prepare {
                tx_id: TransactionId::new(5),
                record_count: 1,
                extra_data: b"xid".to_vec(),
            },
        )
        .unwrap();
        assert_eq!(h.live(1), 2);

        h.write(
            2,
            JournalRecord::Rollback {
                tx_id: TransactionId::new(5),
            },
        )
        .unwrap();
        assert!(h.ledger.records.is_empty());
        assert_eq!(h.live(1), 0);
        assert_eq!(h.ledger.reclaimable(Some(FileId::new(3))), ids(&[1, 2]));
    }

    #[test]
    fn prepared_transaction_rejects_new_work() {
        let mut h = Harness::new();
        h.file(1);
        h.write(1, add_tx(5, 1)).unwrap();
        h.write(
            1,
            JournalRecord::Prepare {
                tx_id: TransactionId::new(5),
                record_count: 1,
                extra_data: Vec::new(),
            },
        )
        .unwrap();

        assert!(matches!(
            h.write(1, add_tx(5, 2)),
            Err(CoreError::DuplicateTransaction { .. })
        ));
    }

    #[test]
    fn committed_delete_tx_removes_record() {
        let mut h = Harness::new();
        h.file(1);
        h.file(2);
        h.write(1, add(1)).unwrap();
        h.write(
            2,
            JournalRecord::DeleteTx {
                tx_id: TransactionId::new(3),
                id: RecordId::new(1),
            },
        )
        .unwrap();
        assert!(h.ledger.records.contains_key(&RecordId::new(1)));

        h.write(
            2,
            JournalRecord::Commit {
                tx_id: TransactionId::new(3),
                record_count: 1,
            },
        )
        .unwrap();
        assert!(h.ledger.records.is_empty());
        assert_eq!(h.live(1), 0);
        assert_eq!(h.live(2), 0);
    }

    #[test]
    fn replay_is_lenient_about_reclaimed_records() {
        let mut h = Harness::new();
        h.file(2);
        h.write_mode(2, delete(1), Mode::Replay).unwrap();
        h.write_mode(2, update(2), Mode::Replay).unwrap();
        assert!(h.ledger.check_orphans().is_err());

        h.write_mode(2, delete(2), Mode::Replay).unwrap();
        assert!(h.ledger.check_orphans().is_ok());
    }

    #[test]
    fn replay_commit_count_validation() {
        let mut h = Harness::new();
        h.file(1);
        h.write_mode(1, add_tx(1, 1), Mode::Replay).unwrap();
        h.write_mode(
            1,
            JournalRecord::Commit {
                tx_id: TransactionId::new(1),
                record_count: 3,
            },
            Mode::Replay,
        )
        .unwrap();
        assert_eq!(h.ledger.incomplete_commits, 1);

        h.write_mode(1, add_tx(2, 2), Mode::Replay).unwrap();
        h.write_mode(1, add_tx(2, 3), Mode::Replay).unwrap();
        let err = h
            .write_mode(
                1,
                JournalRecord::Commit {
                    tx_id: TransactionId::new(2),
                    record_count: 1,
                },
                Mode::Replay,
            )
            .unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn take_committed_orders_by_first_add() {
        let mut h = Harness::new();
        h.file(1);
        for id in [9, 3, 7] {
            h.write_mode(1, add(id), Mode::Replay).unwrap();
        }
        h.write_mode(1, update(9), Mode::Replay).unwrap();

        let records = h.ledger.take_committed();
        let order: Vec<u64> = records.iter().map(|r| r.id.as_u64()).collect();
        assert_eq!(order, vec![9, 3, 7]);
        assert_eq!(records[0].payload, vec![0xAA; 4]);
    }

    #[test]
    fn retained_bytes_count_open_transactions() {
        let mut h = Harness::new();
        h.file(1);
        h.write(1, add(1)).unwrap();
        let live = h.ledger.live_data_bytes();
        h.write(1, add_tx(4, 2)).unwrap();
        assert_eq!(h.ledger.live_data_bytes(), live);
        assert!(h.ledger.retained_bytes() > live);
        assert!(h.ledger.used_bytes() >= h.ledger.retained_bytes());
    }
}
