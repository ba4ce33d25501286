//! Compaction: rewriting live records into fresh files.
//!
//! Compaction runs under the journal lock after a write barrier. It copies
//! the newest version of every live record (as an ADD), then the records
//! and PREPARE markers of open transactions, into newly formatted files.
//! The index is swapped in one step and every source file is reset.
//!
//! A small control file makes the switch crash-safe:
//!
//! ```text
//! [magic "MQJC":4][phase:1][max_source_id:8][count:4]{[len:2][name]}*[crc32:4]
//! ```
//!
//! - `Started`: outputs are being written. On load, files with an id above
//!   `max_source_id` are partial outputs and are discarded.
//! - `Committed`: outputs are complete. On load, listed sources that still
//!   carry an id up to `max_source_id` are reset.

use crate::error::{CoreError, CoreResult};
use crate::file::{FileState, JournalFile, HEADER_SIZE};
use crate::journal::{JournalInner, JournalState};
use crate::ledger::{Ledger, Mode};
use crate::record::{compute_checksum, Decoded, JournalRecord};
use crate::types::{FileId, RecordLocation, TransactionId};
use mqjournal_storage::SequentialFile;
use std::sync::Arc;
use tracing::{debug, error, info};

const CONTROL_MAGIC: [u8; 4] = *b"MQJC";

/// Phase recorded in the compaction control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPhase {
    /// Output files are being written.
    Started,
    /// Output files are complete; sources may be reset.
    Committed,
}

/// Contents of the compaction control file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionControl {
    /// Progress of the compaction.
    pub phase: ControlPhase,
    /// Highest file id among the sources.
    pub max_source_id: FileId,
    /// Names of the source files.
    pub sources: Vec<String>,
}

impl CompactionControl {
    /// Returns the control file name for journals using `prefix`.
    #[must_use]
    pub fn file_name(prefix: &str) -> String {
        format!("{prefix}.cmp")
    }

    /// Encodes the control record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&CONTROL_MAGIC);
        buf.push(match self.phase {
            ControlPhase::Started => 1,
            ControlPhase::Committed => 2,
        });
        buf.extend_from_slice(&self.max_source_id.as_u64().to_le_bytes());
        buf.extend_from_slice(&(self.sources.len() as u32).to_le_bytes());
        for name in &self.sources {
            let bytes = name.as_bytes();
            buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
        let crc = compute_checksum(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a control record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] if the data is damaged.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        let bad = |what: &str| CoreError::invalid_format(format!("compaction control: {what}"));
        if data.len() < 4 + 1 + 8 + 4 + 4 {
            return Err(bad("too short"));
        }
        let (body, crc) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if stored != compute_checksum(body) {
            return Err(bad("checksum mismatch"));
        }
        if body[0..4] != CONTROL_MAGIC {
            return Err(bad("bad magic"));
        }
        let phase = match body[4] {
            1 => ControlPhase::Started,
            2 => ControlPhase::Committed,
            other => return Err(bad(&format!("unknown phase {other}"))),
        };

        let mut pos = 5;
        let id = take(body, &mut pos, 8).ok_or_else(|| bad("truncated"))?;
        let max_source_id = FileId::new(u64::from_le_bytes([
            id[0], id[1], id[2], id[3], id[4], id[5], id[6], id[7],
        ]));
        let count = take(body, &mut pos, 4).ok_or_else(|| bad("truncated"))?;
        let count = u32::from_le_bytes([count[0], count[1], count[2], count[3]]);

        let mut sources = Vec::new();
        for _ in 0..count {
            let len = take(body, &mut pos, 2).ok_or_else(|| bad("truncated"))?;
            let len = u16::from_le_bytes([len[0], len[1]]) as usize;
            let name = take(body, &mut pos, len).ok_or_else(|| bad("truncated"))?;
            let name = String::from_utf8(name.to_vec()).map_err(|_| bad("bad file name"))?;
            sources.push(name);
        }
        if pos != body.len() {
            return Err(bad("trailing bytes"));
        }

        Ok(Self {
            phase,
            max_source_id,
            sources,
        })
    }
}

fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Option<&'a [u8]> {
    let slice = data.get(*pos..*pos + n)?;
    *pos += n;
    Some(slice)
}

/// Outcome of a compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Files that were rewritten and reset.
    pub source_files: usize,
    /// Files written.
    pub output_files: usize,
    /// Live records copied.
    pub records_copied: usize,
    /// Open transactions copied.
    pub transactions_copied: usize,
    /// Record bytes in the sources.
    pub bytes_before: u64,
    /// Record bytes in the outputs.
    pub bytes_after: u64,
}

/// Returns true if the live fraction has dropped low enough to compact.
pub(crate) fn should_compact(inner: &JournalInner, state: &JournalState) -> bool {
    let config = &inner.config;
    if !config.compaction_enabled() || state.ledger.files.len() < config.compact_min_files {
        return false;
    }
    let used = state.ledger.used_bytes();
    used > 0
        && state.ledger.retained_bytes() * 100 < used * u64::from(config.compact_percentage)
}

/// Writes compaction outputs, one file at a time.
struct OutputWriter<'a> {
    inner: &'a JournalInner,
    ledger: Ledger,
    current: Option<(FileId, Arc<dyn SequentialFile>)>,
    pending: Vec<u8>,
    outputs: Vec<FileId>,
}

impl<'a> OutputWriter<'a> {
    fn new(inner: &'a JournalInner) -> Self {
        Self {
            inner,
            ledger: Ledger::new(),
            current: None,
            pending: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn write(&mut self, record: JournalRecord, next_file_id: &mut FileId) -> CoreResult<()> {
        let encoded = record.encode()?;
        let fits = self
            .current
            .as_ref()
            .and_then(|(id, _)| self.ledger.files.get(id))
            .is_some_and(|f| f.fits(encoded.len()));
        if !fits {
            self.open_next(next_file_id)?;
        }
        let Some((file_id, _)) = self.current.as_ref() else {
            return Err(CoreError::invalid_operation("no compaction output file"));
        };
        let file_id = *file_id;
        let offset = match self.ledger.files.get_mut(&file_id) {
            Some(file) => file.reserve(encoded.len()),
            None => return Err(CoreError::invalid_operation("no compaction output file")),
        };
        self.pending.extend_from_slice(&encoded);
        let loc = RecordLocation {
            file_id,
            offset,
            len: encoded.len() as u32,
        };
        self.ledger.apply(record, loc, Mode::Live)
    }

    fn open_next(&mut self, next_file_id: &mut FileId) -> CoreResult<()> {
        self.flush_current()?;
        let (id, file) = self.inner.format_file(next_file_id)?;
        self.ledger.files.insert(
            id,
            JournalFile::new(id, Arc::clone(&file), self.inner.config.journal_file_size),
        );
        self.outputs.push(id);
        self.current = Some((id, file));
        Ok(())
    }

    fn flush_current(&mut self) -> CoreResult<()> {
        if let Some((_, file)) = &self.current {
            file.write_blocking(HEADER_SIZE as u64, &self.pending, true)?;
        }
        self.pending.clear();
        Ok(())
    }

    fn files(&self) -> Vec<Arc<dyn SequentialFile>> {
        self.ledger
            .files
            .values()
            .map(|f| Arc::clone(f.file()))
            .collect()
    }
}

fn read_record(ledger: &Ledger, loc: RecordLocation) -> CoreResult<JournalRecord> {
    let file = ledger.files.get(&loc.file_id).ok_or_else(|| {
        CoreError::invalid_operation(format!("live record in unknown {}", loc.file_id))
    })?;
    let bytes = file.file().read_at(loc.offset, loc.len as usize)?;
    match JournalRecord::decode(&bytes) {
        Ok(Decoded::Record { record, .. }) => Ok(record),
        Ok(Decoded::End) => Err(CoreError::corrupt_record(
            file.name(),
            loc.offset,
            "live record location holds no record",
        )),
        Err(err) => Err(err.at(file.name(), loc.offset)),
    }
}

/// Compacts every journal file into fresh ones.
///
/// Must be called with the journal lock held.
pub(crate) fn compact(inner: &JournalInner, state: &mut JournalState) -> CoreResult<CompactionReport> {
    inner.buffer.flush_and_wait(true)?;

    let Some(max_source_id) = state.ledger.files.keys().next_back().copied() else {
        return Ok(CompactionReport::default());
    };
    let control_name = CompactionControl::file_name(&inner.config.file_prefix);
    let mut control = CompactionControl {
        phase: ControlPhase::Started,
        max_source_id,
        sources: state
            .ledger
            .files
            .values()
            .map(|f| f.name().to_string())
            .collect(),
    };
    inner.factory.write_control(&control_name, &control.encode())?;
    debug!(sources = control.sources.len(), %max_source_id, "compaction started");

    let mut writer = OutputWriter::new(inner);
    let copied = copy_live(&state.ledger, &mut writer, &mut state.next_file_id)
        .and_then(|report| writer.flush_current().map(|()| report));
    let (records_copied, transactions_copied) = match copied {
        Ok(counts) => counts,
        Err(err) => {
            abandon(inner, &control_name, writer.files());
            return Err(err);
        }
    };

    control.phase = ControlPhase::Committed;
    if let Err(err) = inner.factory.write_control(&control_name, &control.encode()) {
        abandon(inner, &control_name, writer.files());
        return Err(err.into());
    }

    let bytes_after = writer.ledger.used_bytes();
    let output_files = writer.outputs.len();
    let mut ledger = writer.ledger;
    let current = writer.outputs.last().copied();
    for file in ledger.files.values_mut() {
        file.set_state(if Some(file.id()) == current {
            FileState::Current
        } else {
            FileState::Data
        });
    }
    let old = std::mem::replace(&mut state.ledger, ledger);
    state.current = current;
    if let Some(id) = current {
        if let Some(file) = state.ledger.files.get(&id) {
            inner.install_writer(Arc::clone(file.file()), file.write_position());
        }
    }

    let report = CompactionReport {
        source_files: old.files.len(),
        output_files,
        records_copied,
        transactions_copied,
        bytes_before: old.used_bytes(),
        bytes_after,
    };
    for file in old.files.into_values() {
        inner.pool.reclaim(Arc::clone(file.file()))?;
    }
    inner.factory.remove_control(&control_name)?;
    inner.metrics.record_compaction();

    info!(
        sources = report.source_files,
        outputs = report.output_files,
        records = report.records_copied,
        bytes_before = report.bytes_before,
        bytes_after = report.bytes_after,
        "compaction complete"
    );
    Ok(report)
}

fn copy_live(
    ledger: &Ledger,
    writer: &mut OutputWriter<'_>,
    next_file_id: &mut FileId,
) -> CoreResult<(usize, usize)> {
    let records = ledger.records_by_age();
    for (id, live) in &records {
        let payload = match read_record(ledger, live.location)? {
            JournalRecord::Add { payload, .. }
            | JournalRecord::Update { payload, .. }
            | JournalRecord::AddTx { payload, .. }
            | JournalRecord::UpdateTx { payload, .. } => payload,
            other => {
                return Err(CoreError::invalid_operation(format!(
                    "live record {id} points at a {} record",
                    other.kind().name()
                )))
            }
        };
        writer.write(
            JournalRecord::Add {
                id: *id,
                user_type: live.user_type,
                payload,
            },
            next_file_id,
        )?;
    }

    // An empty journal still needs a current file
    if writer.current.is_none() {
        writer.open_next(next_file_id)?;
    }

    let mut tx_ids: Vec<TransactionId> = ledger.transactions.keys().copied().collect();
    tx_ids.sort();
    for tx_id in &tx_ids {
        let tx = &ledger.transactions[tx_id];
        for op in &tx.ops {
            let record = read_record(ledger, op.location)?;
            writer.write(record, next_file_id)?;
        }
        if let Some(prepare) = tx.prepare {
            let record = read_record(ledger, prepare)?;
            writer.write(record, next_file_id)?;
        }
    }
    Ok((records.len(), tx_ids.len()))
}

/// Undoes a failed compaction: outputs go back to the pool.
fn abandon(inner: &JournalInner, control_name: &str, outputs: Vec<Arc<dyn SequentialFile>>) {
    for file in outputs {
        if let Err(err) = inner.pool.reclaim(file) {
            error!(error = %err, "failed to release compaction output");
        }
    }
    if let Err(err) = inner.factory.remove_control(control_name) {
        error!(error = %err, "failed to remove compaction control file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_roundtrip() {
        let control = CompactionControl {
            phase: ControlPhase::Committed,
            max_source_id: FileId::new(12),
            sources: vec!["mqj-data-3.mqj".to_string(), "mqj-data-4.mqj".to_string()],
        };
        let decoded = CompactionControl::decode(&control.encode()).unwrap();
        assert_eq!(decoded, control);
    }

    #[test]
    fn damaged_control_is_rejected() {
        let control = CompactionControl {
            phase: ControlPhase::Started,
            max_source_id: FileId::new(2),
            sources: vec!["a-1.mqj".to_string()],
        };
        let mut bytes = control.encode();
        bytes[6] ^= 0xFF;
        assert!(CompactionControl::decode(&bytes).is_err());
        assert!(CompactionControl::decode(&bytes[..8]).is_err());
    }

    #[test]
    fn control_file_name() {
        assert_eq!(CompactionControl::file_name("mqj-data"), "mqj-data.cmp");
    }
}
