//! Recovery: rebuilding the journal state from its files.
//!
//! Files are classified by their header, an interrupted compaction is
//! finished or rolled back, and then every data file is replayed in
//! ascending file id order through the same bookkeeping live appends use.
//!
//! A decode failure is fatal unless it is the torn tail of the newest file,
//! where nothing valid decodes after the damaged bytes or a whole unwritten
//! batch left a zero gap. An end marker followed by data anywhere else is
//! damage too. The newest file is zero-filled past its end before appends
//! resume.

use crate::compactor::{CompactionControl, ControlPhase};
use crate::config::JournalConfig;
use crate::error::{CoreError, CoreResult};
use crate::file::{decode_header, parse_file_seq, HeaderKind, JournalFile, HEADER_SIZE};
use crate::ledger::{Ledger, Mode};
use crate::record::{DecodeError, Decoded, JournalRecord, BASE_HEADER_SIZE, CHECKSUM_SIZE};
use crate::transaction::{TransactionPhase, TransactionState};
use crate::types::{FileId, Record, RecordLocation, TransactionId};
use mqjournal_storage::{SequentialFile, SequentialFileFactory};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How `load()` treats damage it can repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Repair torn tails, finish interrupted compactions and roll back
    /// abandoned transactions.
    #[default]
    Recover,
    /// Never write to the journal files.
    ReadOnly,
}

/// Where replay of the newest file stopped at a torn write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TornTail {
    /// File holding the damaged bytes.
    pub file: String,
    /// Offset of the first damaged byte.
    pub offset: u64,
}

/// Counters describing a load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Data files replayed.
    pub files_scanned: usize,
    /// Free files found.
    pub free_files: usize,
    /// Records decoded and applied.
    pub records_replayed: u64,
    /// Torn tail found in the newest file, if any.
    pub torn_tail: Option<TornTail>,
    /// Transactions without PREPARE, COMMIT or ROLLBACK.
    pub abandoned_transactions: usize,
    /// Commits that declared more records than were found.
    pub incomplete_transactions: u64,
    /// Files dropped while finishing an interrupted compaction.
    pub discarded_files: usize,
}

/// Outcome of [`Journal::load`](crate::Journal::load).
#[derive(Debug, Clone, Default)]
pub struct LoadResult {
    /// Live records, ordered by their first ADD.
    pub committed_records: Vec<Record>,
    /// Transactions that reached PREPARE but no outcome.
    pub prepared_transactions: Vec<TransactionState>,
    /// What the loader found.
    pub stats: LoadStats,
}

/// State rebuilt from disk, handed to the journal.
#[derive(Debug)]
pub(crate) struct Recovered {
    pub ledger: Ledger,
    pub next_file_id: FileId,
    pub max_seq: u64,
    pub free: Vec<Arc<dyn SequentialFile>>,
    pub committed: Vec<Record>,
    pub prepared: Vec<TransactionState>,
    pub abandoned: Vec<TransactionId>,
    pub stats: LoadStats,
}

/// Lists the journal files of `prefix`, ascending by creation counter.
///
/// # Errors
///
/// Returns an error if the directory cannot be listed.
pub fn list_journal_files(
    factory: &dyn SequentialFileFactory,
    prefix: &str,
    extension: &str,
) -> CoreResult<Vec<(u64, String)>> {
    let mut names: Vec<(u64, String)> = factory
        .list_files(extension)?
        .into_iter()
        .filter_map(|name| parse_file_seq(&name, prefix, extension).map(|seq| (seq, name)))
        .collect();
    names.sort();
    Ok(names)
}

fn read_header(name: &str, file: &Arc<dyn SequentialFile>) -> CoreResult<(HeaderKind, u64)> {
    let size = file.size()?;
    if size < HEADER_SIZE as u64 {
        return Ok((HeaderKind::Free, size));
    }
    let header = file.read_at(0, HEADER_SIZE)?;
    Ok((decode_header(name, &header)?, size))
}

pub(crate) fn recover(
    factory: &dyn SequentialFileFactory,
    config: &JournalConfig,
    mode: LoadMode,
) -> CoreResult<Recovered> {
    let mut stats = LoadStats::default();
    let mut max_seq = 0;
    let mut free = Vec::new();
    let mut data: Vec<(FileId, Arc<dyn SequentialFile>)> = Vec::new();

    for (seq, name) in list_journal_files(factory, &config.file_prefix, &config.file_extension)? {
        max_seq = max_seq.max(seq);
        let file = factory.open_file(&name)?;
        match read_header(&name, &file)? {
            (HeaderKind::Free, size) => {
                if mode == LoadMode::Recover && size != config.journal_file_size {
                    file.reset(config.journal_file_size)?;
                }
                free.push(file);
            }
            (HeaderKind::Data(id), _) => data.push((id, file)),
        }
    }
    data.sort_by_key(|(id, _)| *id);
    if let Some(pair) = data.windows(2).find(|pair| pair[0].0 == pair[1].0) {
        return Err(CoreError::invalid_format(format!(
            "{} and {} both carry {}",
            pair[0].1.name(),
            pair[1].1.name(),
            pair[0].0
        )));
    }
    let mut next_file_id = data.last().map_or(FileId::new(1), |(id, _)| id.next());

    let control_name = CompactionControl::file_name(&config.file_prefix);
    if let Some(bytes) = factory.read_control(&control_name)? {
        let control = CompactionControl::decode(&bytes)?;
        let mut discarded = Vec::new();
        data.retain(|(id, file)| {
            let discard = match control.phase {
                ControlPhase::Started => *id > control.max_source_id,
                ControlPhase::Committed => {
                    *id <= control.max_source_id && control.sources.iter().any(|s| s == file.name())
                }
            };
            if discard {
                discarded.push(Arc::clone(file));
            }
            !discard
        });
        stats.discarded_files = discarded.len();
        if mode == LoadMode::Recover {
            for file in discarded {
                file.reset(config.journal_file_size)?;
                free.push(file);
            }
            factory.remove_control(&control_name)?;
            info!(
                phase = ?control.phase,
                discarded = stats.discarded_files,
                "finished interrupted compaction"
            );
        } else {
            warn!(phase = ?control.phase, "skipping files of an interrupted compaction");
        }
        next_file_id = next_file_id.max(control.max_source_id.next());
    }
    stats.free_files = free.len();

    let mut ledger = Ledger::new();
    let newest = data.last().map(|(id, _)| *id);
    for (id, file) in &data {
        let bytes = file.read_all()?;
        ledger
            .files
            .insert(*id, JournalFile::new(*id, Arc::clone(file), bytes.len() as u64));
        let end = replay_file(&mut ledger, *id, file.name(), &bytes, Some(*id) == newest, &mut stats)?;
        if let Some(journal_file) = ledger.files.get_mut(id) {
            journal_file.set_write_position(end as u64);
        }
        if Some(*id) == newest && mode == LoadMode::Recover {
            zero_fill(file, &bytes, end)?;
        }
        stats.files_scanned += 1;
    }
    ledger.check_orphans()?;
    stats.incomplete_transactions = ledger.incomplete_commits;

    let committed = ledger.take_committed();
    let prepared = ledger.take_transactions(TransactionPhase::Prepared);
    let abandoned: Vec<TransactionId> = ledger
        .take_transactions(TransactionPhase::Started)
        .into_iter()
        .map(|tx| tx.id)
        .collect();
    stats.abandoned_transactions = abandoned.len();
    if !abandoned.is_empty() {
        warn!(count = abandoned.len(), "discarding abandoned transactions");
    }

    Ok(Recovered {
        ledger,
        next_file_id,
        max_seq,
        free,
        committed,
        prepared,
        abandoned,
        stats,
    })
}

/// Replays one file and returns the offset replay stopped at.
fn replay_file(
    ledger: &mut Ledger,
    file_id: FileId,
    name: &str,
    bytes: &[u8],
    newest: bool,
    stats: &mut LoadStats,
) -> CoreResult<usize> {
    let mut pos = HEADER_SIZE;
    let mut replayed = 0u64;
    while pos < bytes.len() {
        match JournalRecord::decode(&bytes[pos..]) {
            Ok(Decoded::End) => {
                let Some(next) = bytes[pos..].iter().position(|b| *b != 0) else {
                    break;
                };
                let next = pos + next;
                if newest && (unwritten_gap_at(bytes, pos) || !decodes_from(bytes, next)) {
                    warn!(
                        file = name,
                        offset = pos,
                        resumes = next,
                        "unwritten gap at end of journal"
                    );
                    stats.torn_tail = Some(TornTail {
                        file: name.to_string(),
                        offset: pos as u64,
                    });
                    break;
                }
                let err = DecodeError::Corrupt {
                    message: format!("end-of-data marker followed by data at offset {next}"),
                    frame_len: None,
                };
                return Err(err.at(name, pos as u64));
            }
            Ok(Decoded::Record { record, len }) => {
                let loc = RecordLocation {
                    file_id,
                    offset: pos as u64,
                    len: len as u32,
                };
                ledger.apply(record, loc, Mode::Replay)?;
                pos += len;
                replayed += 1;
            }
            Err(err) => {
                if newest && is_torn_tail(bytes, pos, &err) {
                    warn!(file = name, offset = pos, error = %err, "torn write at end of journal");
                    stats.torn_tail = Some(TornTail {
                        file: name.to_string(),
                        offset: pos as u64,
                    });
                    break;
                }
                return Err(err.at(name, pos as u64));
            }
        }
    }
    debug!(file = name, records = replayed, end = pos, "replayed journal file");
    stats.records_replayed += replayed;
    Ok(pos)
}

fn decodes_at(bytes: &[u8], pos: usize) -> bool {
    bytes
        .get(pos..)
        .is_some_and(|rest| matches!(JournalRecord::decode(rest), Ok(Decoded::Record { .. })))
}

fn decodes_from(bytes: &[u8], from: usize) -> bool {
    (from..bytes.len()).any(|p| decodes_at(bytes, p))
}

/// Returns true if zeros as long as a whole frame start at `from` and a
/// valid frame follows them.
///
/// Batches complete out of order, so a later batch can reach the disk while
/// an earlier one is missing. Nothing after such a gap was acknowledged.
fn unwritten_gap_at(bytes: &[u8], from: usize) -> bool {
    let Some(gap) = bytes
        .get(from..)
        .and_then(|rest| rest.iter().position(|b| *b != 0))
    else {
        return false;
    };
    gap >= BASE_HEADER_SIZE + CHECKSUM_SIZE && decodes_at(bytes, from + gap)
}

/// Returns true if the damaged record at `pos` is the torn tail of a file.
///
/// Every later offset is tried, since a damaged length cannot be trusted to
/// point at the next frame.
fn is_torn_tail(bytes: &[u8], pos: usize, err: &DecodeError) -> bool {
    if !decodes_from(bytes, pos + 1) {
        return true;
    }
    match err {
        DecodeError::Corrupt {
            frame_len: Some(len),
            ..
        } => {
            let end = pos + len;
            !(pos + 1..end.min(bytes.len())).any(|p| decodes_at(bytes, p))
                && unwritten_gap_at(bytes, end)
        }
        _ => false,
    }
}

/// Zeroes the damaged bytes after `end` so later appends replay cleanly.
fn zero_fill(file: &Arc<dyn SequentialFile>, bytes: &[u8], end: usize) -> CoreResult<()> {
    let Some(last) = bytes[end..].iter().rposition(|b| *b != 0) else {
        return Ok(());
    };
    file.write_blocking(end as u64, &vec![0u8; last + 1], true)?;
    debug!(file = file.name(), offset = end, len = last + 1, "zeroed torn tail");
    Ok(())
}

/// A record found by [`scan_journal`].
#[derive(Debug, Clone)]
pub struct ScannedRecord {
    /// Offset of the record in its file.
    pub offset: u64,
    /// Encoded length.
    pub len: usize,
    /// The decoded record.
    pub record: JournalRecord,
}

/// One file as found by [`scan_journal`].
#[derive(Debug, Clone)]
pub struct FileScan {
    /// File name.
    pub name: String,
    /// Creation counter from the name.
    pub seq: u64,
    /// File id from the header, `None` for free files.
    pub file_id: Option<FileId>,
    /// File size on disk.
    pub size: u64,
    /// Records decoded before the end marker or the first failure.
    pub records: Vec<ScannedRecord>,
    /// Offset where decoding stopped.
    pub end: u64,
    /// Why decoding stopped early, if it did.
    pub error: Option<String>,
}

/// Decodes every journal file without interpreting the records.
///
/// Damaged headers and records are reported per file rather than failing
/// the scan.
///
/// # Errors
///
/// Returns an error if the files cannot be listed or read.
pub fn scan_journal(
    factory: &dyn SequentialFileFactory,
    prefix: &str,
    extension: &str,
) -> CoreResult<Vec<FileScan>> {
    let mut scans = Vec::new();
    for (seq, name) in list_journal_files(factory, prefix, extension)? {
        let file = factory.open_file(&name)?;
        let mut scan = FileScan {
            name: name.clone(),
            seq,
            file_id: None,
            size: file.size()?,
            records: Vec::new(),
            end: 0,
            error: None,
        };
        match read_header(&name, &file) {
            Ok((HeaderKind::Free, _)) => {}
            Ok((HeaderKind::Data(id), _)) => {
                scan.file_id = Some(id);
                scan_records(&file.read_all()?, &name, &mut scan);
            }
            Err(err) => scan.error = Some(err.to_string()),
        }
        scans.push(scan);
    }
    Ok(scans)
}

fn scan_records(bytes: &[u8], name: &str, scan: &mut FileScan) {
    let mut pos = HEADER_SIZE;
    while pos < bytes.len() {
        match JournalRecord::decode(&bytes[pos..]) {
            Ok(Decoded::End) => {
                if let Some(next) = bytes[pos..].iter().position(|b| *b != 0) {
                    let err = DecodeError::Corrupt {
                        message: format!(
                            "end-of-data marker followed by data at offset {}",
                            pos + next
                        ),
                        frame_len: None,
                    };
                    scan.error = Some(err.at(name, pos as u64).to_string());
                }
                break;
            }
            Ok(Decoded::Record { record, len }) => {
                scan.records.push(ScannedRecord {
                    offset: pos as u64,
                    len,
                    record,
                });
                pos += len;
            }
            Err(err) => {
                scan.error = Some(err.at(name, pos as u64).to_string());
                break;
            }
        }
    }
    scan.end = pos as u64;
}
