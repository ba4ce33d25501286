//! Compact command implementation.

use super::{format_size, JournalArgs};
use mqjournal_core::{CompactionReport, Journal, JournalStats, LoadMode};
use tracing::info;

/// Runs the compact command.
pub fn run(args: &JournalArgs, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting journal at {:?}", args.dir);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let config = args
        .with_detected_file_size(args.config())?
        .compact_min_files(0);
    let journal = Journal::open(config)?;
    journal.start()?;

    if dry_run {
        journal.load_with_mode(LoadMode::ReadOnly)?;
        print_analysis(&journal.stats());
        journal.stop()?;
        return Ok(());
    }

    journal.load()?;
    let before = journal.stats();
    print_analysis(&before);
    let report = journal.compact()?;
    journal.flush()?;
    journal.check_reclaim()?;
    info!(
        sources = report.source_files,
        outputs = report.output_files,
        records = report.records_copied,
        "compaction finished"
    );
    print_report(&report);
    journal.stop()?;
    Ok(())
}

fn print_analysis(stats: &JournalStats) {
    let live: u64 = stats.files.iter().map(|f| f.live_bytes).sum();
    let used: u64 = stats.files.iter().map(|f| f.write_position).sum();
    println!("Compaction Analysis:");
    println!("  Data files:     {}", stats.files.len());
    println!("  Live records:   {}", stats.live_records);
    println!("  Open txs:       {}", stats.open_transactions);
    println!("  Used bytes:     {}", format_size(used));
    println!("  Live bytes:     {}", format_size(live));
    println!("  Live fraction:  {:.1}%", stats.live_fraction() * 100.0);
    println!();
}

fn print_report(report: &CompactionReport) {
    println!("Compaction Results:");
    println!("  Source files:     {}", report.source_files);
    println!("  Output files:     {}", report.output_files);
    println!("  Records copied:   {}", report.records_copied);
    println!("  Txs copied:       {}", report.transactions_copied);
    println!("  Size before:      {}", format_size(report.bytes_before));
    println!("  Size after:       {}", format_size(report.bytes_after));
    let saved = report.bytes_before.saturating_sub(report.bytes_after);
    let percent = if report.bytes_before > 0 {
        saved as f64 / report.bytes_before as f64 * 100.0
    } else {
        0.0
    };
    println!("  Space saved:      {} ({percent:.1}%)", format_size(saved));
}
