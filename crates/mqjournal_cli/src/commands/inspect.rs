//! Inspect command implementation.

use super::{format_size, JournalArgs};
use mqjournal_core::{scan_journal, CompactionControl, FileScan};
use mqjournal_storage::SequentialFileFactory;
use serde::Serialize;
use std::collections::BTreeMap;

/// Journal inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal directory.
    pub path: String,
    /// Total size of all journal files in bytes.
    pub total_size: u64,
    /// Number of data files.
    pub data_files: usize,
    /// Number of free files.
    pub free_files: usize,
    /// Whether a compaction control file is present.
    pub compaction_pending: bool,
    /// Per-file details, in file id order with free files last.
    pub files: Vec<FileInfo>,
}

/// Statistics for a single journal file.
#[derive(Debug, Serialize)]
pub struct FileInfo {
    /// File name.
    pub name: String,
    /// File id from the header (absent for free files).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<u64>,
    /// File size in bytes.
    pub size: u64,
    /// Bytes holding records.
    pub used: u64,
    /// Record count per kind.
    pub records: BTreeMap<String, usize>,
    /// Why decoding stopped early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&FileScan> for FileInfo {
    fn from(scan: &FileScan) -> Self {
        let mut records = BTreeMap::new();
        for scanned in &scan.records {
            *records
                .entry(scanned.record.kind().name().to_string())
                .or_insert(0) += 1;
        }
        Self {
            name: scan.name.clone(),
            file_id: scan.file_id.map(|id| id.as_u64()),
            size: scan.size,
            used: scan.end,
            records,
            error: scan.error.clone(),
        }
    }
}

/// Collects the inspection result.
pub fn inspect(
    args: &JournalArgs,
    factory: &dyn SequentialFileFactory,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let mut scans = scan_journal(factory, &args.prefix, &args.extension)?;
    scans.sort_by_key(|scan| (scan.file_id.is_none(), scan.file_id, scan.seq));
    let compaction_pending = factory
        .read_control(&CompactionControl::file_name(&args.prefix))?
        .is_some();

    Ok(InspectResult {
        path: args.dir.display().to_string(),
        total_size: scans.iter().map(|s| s.size).sum(),
        data_files: scans.iter().filter(|s| s.file_id.is_some()).count(),
        free_files: scans.iter().filter(|s| s.file_id.is_none()).count(),
        compaction_pending,
        files: scans.iter().map(FileInfo::from).collect(),
    })
}

/// Runs the inspect command.
pub fn run(args: &JournalArgs, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let factory = args.factory()?;
    let result = inspect(args, &factory)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Journal Inspection");
    println!("==================");
    println!();
    println!("Path: {}", result.path);
    println!("Total size: {}", format_size(result.total_size));
    println!(
        "Files: {} data, {} free",
        result.data_files, result.free_files
    );
    if result.compaction_pending {
        println!("Compaction control file present: the next load finishes or undoes it");
    }
    println!();

    for file in &result.files {
        match file.file_id {
            Some(id) => println!(
                "{} (file id {id}): {} of {} used",
                file.name,
                format_size(file.used),
                format_size(file.size)
            ),
            None => println!("{} (free): {}", file.name, format_size(file.size)),
        }
        for (kind, count) in &file.records {
            println!("  {kind:<10} {count}");
        }
        if let Some(error) = &file.error {
            println!("  stopped early: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqjournal_core::{Journal, JournalType};
    use tempfile::tempdir;

    #[test]
    fn counts_records_per_kind() {
        let temp = tempdir().unwrap();
        let args = JournalArgs {
            dir: temp.path().to_path_buf(),
            prefix: "cli".into(),
            extension: "jrn".into(),
        };
        {
            let config = args
                .config()
                .journal_file_size(64 * 1024)
                .journal_type(JournalType::Nio);
            let journal = Journal::open(config).unwrap();
            journal.start().unwrap();
            journal.load().unwrap();
            journal.append_add(1u64, 1, b"a", false).unwrap();
            journal.append_add(2u64, 1, b"b", false).unwrap();
            journal.append_delete(1u64, true).unwrap();
            journal.stop().unwrap();
        }

        let factory = args.factory().unwrap();
        let result = inspect(&args, &factory).unwrap();
        assert_eq!(result.data_files, 1);
        assert!(!result.compaction_pending);
        let data = &result.files[0];
        assert_eq!(data.records.get("ADD"), Some(&2));
        assert_eq!(data.records.get("DELETE"), Some(&1));
        assert!(data.error.is_none());
    }
}
