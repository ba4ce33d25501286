//! Perf-blast command implementation.

use super::{format_size, JournalArgs};
use mqjournal_core::{Journal, JournalType, MetricsSnapshot};
use std::time::{Duration, Instant};
use tracing::info;

/// Throughput test parameters.
#[derive(Debug, Clone)]
pub struct BlastOptions {
    /// Records to append.
    pub records: u64,
    /// Payload size in bytes.
    pub size: usize,
    /// Every Nth append waits for the disk; 0 never waits.
    pub sync_every: u64,
    /// Delete each record right after adding it.
    pub delete: bool,
    /// I/O backend.
    pub journal_type: JournalType,
    /// Journal file size in bytes.
    pub file_size: u64,
}

/// What a run measured.
#[derive(Debug, Clone)]
pub struct BlastResult {
    /// Wall time from the first append to the final flush.
    pub elapsed: Duration,
    /// Records appended, deletes included.
    pub appends: u64,
    /// Journal counters after the run.
    pub metrics: MetricsSnapshot,
}

impl BlastResult {
    /// Appends per second.
    pub fn records_per_sec(&self) -> f64 {
        self.appends as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }

    /// Megabytes written per second.
    pub fn mb_per_sec(&self) -> f64 {
        self.metrics.bytes_appended as f64
            / (1024.0 * 1024.0)
            / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

/// Appends records as fast as the journal takes them.
pub fn blast(
    args: &JournalArgs,
    options: &BlastOptions,
) -> Result<BlastResult, Box<dyn std::error::Error>> {
    let config = args
        .config()
        .create_journal_dir(true)
        .journal_type(options.journal_type)
        .journal_file_size(options.file_size);
    let journal = Journal::open(config)?;
    journal.start()?;
    let loaded = journal.load()?;
    let first_id = loaded
        .committed_records
        .iter()
        .map(|r| r.id.as_u64() + 1)
        .max()
        .unwrap_or(0);

    info!(
        records = options.records,
        size = options.size,
        journal_type = %options.journal_type,
        "starting perf blast"
    );

    let payload: Vec<u8> = (0..options.size).map(|i| (i % 251) as u8).collect();
    let start = Instant::now();
    let mut appends = 0u64;
    for i in 0..options.records {
        let id = first_id + i;
        let sync = options.sync_every > 0 && (i + 1) % options.sync_every == 0;
        if options.delete {
            journal.append_add(id, 1, &payload, false)?;
            journal.append_delete(id, sync)?;
            appends += 2;
        } else {
            journal.append_add(id, 1, &payload, sync)?;
            appends += 1;
        }
    }
    journal.flush()?;
    let elapsed = start.elapsed();

    let metrics = journal.stats().metrics;
    journal.stop()?;
    Ok(BlastResult {
        elapsed,
        appends,
        metrics,
    })
}

/// Runs the perf-blast command.
pub fn run(args: &JournalArgs, options: &BlastOptions) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "Blasting {} records of {} into {:?}",
        options.records,
        format_size(options.size as u64),
        args.dir
    );
    let result = blast(args, options)?;

    info!(
        elapsed_ms = result.elapsed.as_millis() as u64,
        records_per_sec = result.records_per_sec(),
        "perf blast finished"
    );
    println!();
    println!("Elapsed:      {:.3}s", result.elapsed.as_secs_f64());
    println!("Appends:      {}", result.appends);
    println!("Records/s:    {:.0}", result.records_per_sec());
    println!("MB/s:         {:.2}", result.mb_per_sec());
    println!("Flushes:      {}", result.metrics.flushes);
    println!("Sync appends: {}", result.metrics.sync_appends);
    println!("Rollovers:    {}", result.metrics.rollovers);
    println!(
        "Files:        {} created, {} reclaimed",
        result.metrics.files_created, result.metrics.files_reclaimed
    );
    if result.metrics.write_failures > 0 {
        println!("Write failures: {}", result.metrics.write_failures);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn blast_appends_every_record() {
        let temp = tempdir().unwrap();
        let args = JournalArgs {
            dir: temp.path().join("journal"),
            prefix: "blast".into(),
            extension: "jrn".into(),
        };
        let options = BlastOptions {
            records: 500,
            size: 100,
            sync_every: 50,
            delete: false,
            journal_type: JournalType::Nio,
            file_size: 16 * 1024,
        };
        let result = blast(&args, &options).unwrap();
        assert_eq!(result.appends, 500);
        assert_eq!(result.metrics.appends, 500);
        assert_eq!(result.metrics.write_failures, 0);
        assert!(result.metrics.rollovers > 0);

        // A second run continues after the ids already on disk.
        let again = blast(&args, &BlastOptions { delete: true, ..options }).unwrap();
        assert_eq!(again.appends, 1000);
    }
}
