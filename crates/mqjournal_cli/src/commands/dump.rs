//! Dump command implementation.

use super::JournalArgs;
use mqjournal_core::{scan_journal, FileScan, ScannedRecord};
use mqjournal_storage::SequentialFileFactory;
use serde::Serialize;

/// One decoded record.
#[derive(Debug, Serialize)]
pub struct DumpedRecord {
    /// File holding the record.
    pub file: String,
    /// File id from the header.
    pub file_id: u64,
    /// Offset of the record in the file.
    pub offset: u64,
    /// Record kind.
    pub kind: &'static str,
    /// Record id, for record-level kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Transaction id, for transactional kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<u64>,
    /// User type tag.
    pub user_type: u8,
    /// Encoded length.
    pub len: usize,
    /// Body length.
    pub body_len: usize,
}

impl DumpedRecord {
    fn new(scan: &FileScan, file_id: u64, scanned: &ScannedRecord) -> Self {
        let record = &scanned.record;
        Self {
            file: scan.name.clone(),
            file_id,
            offset: scanned.offset,
            kind: record.kind().name(),
            id: record.record_id().map(|id| id.as_u64()),
            tx: record.tx_id().map(|tx| tx.as_u64()),
            user_type: record.user_type(),
            len: scanned.len,
            body_len: record.body().len(),
        }
    }
}

/// Decodes the records of every data file in file id order.
pub fn collect(
    args: &JournalArgs,
    factory: &dyn SequentialFileFactory,
    limit: Option<usize>,
) -> Result<Vec<DumpedRecord>, Box<dyn std::error::Error>> {
    let mut scans = scan_journal(factory, &args.prefix, &args.extension)?;
    scans.retain(|scan| scan.file_id.is_some());
    scans.sort_by_key(|scan| scan.file_id);

    let limit = limit.unwrap_or(usize::MAX);
    let records = scans
        .iter()
        .flat_map(|scan| {
            let file_id = scan.file_id.map_or(0, |id| id.as_u64());
            scan.records
                .iter()
                .map(move |scanned| DumpedRecord::new(scan, file_id, scanned))
        })
        .take(limit)
        .collect();
    Ok(records)
}

/// Runs the dump command.
pub fn run(
    args: &JournalArgs,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let factory = args.factory()?;
    let records = collect(args, &factory, limit)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    let mut last_file = None;
    for record in &records {
        if last_file != Some(record.file_id) {
            println!("== {} (file id {}) ==", record.file, record.file_id);
            last_file = Some(record.file_id);
        }
        let mut line = format!("{:>8} {:<10}", record.offset, record.kind);
        if let Some(id) = record.id {
            line.push_str(&format!(" id={id}"));
        }
        if let Some(tx) = record.tx {
            line.push_str(&format!(" tx={tx}"));
        }
        if record.user_type != 0 {
            line.push_str(&format!(" type={}", record.user_type));
        }
        line.push_str(&format!(" body={}B", record.body_len));
        println!("{line}");
    }
    println!();
    println!("{} records", records.len());

    Ok(())
}
