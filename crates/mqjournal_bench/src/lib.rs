//! Benchmark utilities.

use mqjournal_core::{CoreResult, Journal, JournalConfig, JournalRecord, RecordId, TransactionId};
use mqjournal_storage::InMemoryFileFactory;
use rand::Rng;
use std::sync::Arc;

/// Generate random payload data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// One record of every kind, with `payload_size` bytes of body where the
/// kind carries one.
pub fn sample_records(payload_size: usize) -> Vec<JournalRecord> {
    let payload = random_data(payload_size);
    let id = RecordId::new(42);
    let tx_id = TransactionId::new(7);
    vec![
        JournalRecord::Add {
            id,
            user_type: 1,
            payload: payload.clone(),
        },
        JournalRecord::Update {
            id,
            user_type: 1,
            payload: payload.clone(),
        },
        JournalRecord::AddTx {
            tx_id,
            id,
            user_type: 1,
            payload,
        },
        JournalRecord::Delete { id },
        JournalRecord::Commit {
            tx_id,
            record_count: 1,
        },
    ]
}

/// Configuration used by the journal benchmarks.
pub fn bench_config() -> JournalConfig {
    JournalConfig::new()
        .journal_file_size(1024 * 1024)
        .buffer_timeout_micros(100)
        .file_prefix("bench")
        .file_extension("jrn")
}

/// A started and loaded journal over in-memory files.
pub fn memory_journal(config: JournalConfig) -> CoreResult<Journal> {
    let journal = Journal::with_factory(config, Arc::new(InMemoryFileFactory::new()))?;
    journal.start()?;
    journal.load()?;
    Ok(journal)
}
