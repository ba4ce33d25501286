//! Stress runs for the journal.
//!
//! These drive a loaded journal hard enough to roll over, reclaim and
//! batch many appends per write. Record ids written by each run are
//! deterministic, so tests can check the result after a restart.

use mqjournal_core::Journal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations per thread.
    pub operations: usize,
    /// Number of appending threads.
    pub threads: usize,
    /// Payload size in bytes.
    pub record_size: usize,
    /// Whether appends wait for the disk.
    pub sync: bool,
    /// Records per transaction in transactional runs.
    pub tx_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            record_size: 256,
            sync: true,
            tx_size: 10,
        }
    }
}

/// Id of the `i`th record written by thread `t`.
#[must_use]
pub const fn stress_record_id(t: usize, i: usize) -> u64 {
    ((t as u64) << 32) | i as u64
}

/// Appends from several threads at once.
///
/// Thread `t` adds ids [`stress_record_id`]`(t, 0..operations)` in order.
pub fn stress_concurrent_appends(journal: &Journal, config: &StressConfig) -> StressTestResult {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let payload = vec![0xABu8; config.record_size];

    let start = Instant::now();
    thread::scope(|scope| {
        for t in 0..config.threads {
            let (successful, failed, payload) = (&successful, &failed, &payload);
            scope.spawn(move || {
                for i in 0..config.operations {
                    match journal.append_add(stress_record_id(t, i), 1, payload, config.sync) {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            });
        }
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Adds `operations` records, then overwrites each of them `rounds`
/// times and finally deletes every second one.
///
/// Old versions become garbage quickly, so files are reclaimed while the
/// run is in progress.
pub fn stress_update_churn(
    journal: &Journal,
    config: &StressConfig,
    rounds: usize,
) -> StressTestResult {
    let payload = vec![0xCDu8; config.record_size];
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;
    let mut tally = |result: mqjournal_core::CoreResult<()>| match result {
        Ok(()) => successful += 1,
        Err(_) => failed += 1,
    };

    for i in 0..config.operations {
        tally(journal.append_add(i as u64, 1, &payload, false));
    }
    for round in 0..rounds {
        for i in 0..config.operations {
            let user_type = (round % 200) as u8 + 2;
            tally(journal.append_update(i as u64, user_type, &payload, false));
        }
    }
    for i in (0..config.operations).step_by(2) {
        tally(journal.append_delete(i as u64, false));
    }
    tally(journal.flush());

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Writes transactions of `tx_size` records, committing two of every
/// three and rolling back the third.
///
/// Transaction `n` adds ids `n * tx_size ..`, so the committed ids are
/// those whose transaction number is not `2 mod 3`.
pub fn stress_transactions(journal: &Journal, config: &StressConfig) -> StressTestResult {
    let payload = vec![0xEFu8; config.record_size];
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    let tx_count = config.operations / config.tx_size.max(1);
    for n in 0..tx_count {
        let tx_id = n as u64 + 1;
        let result = (0..config.tx_size)
            .try_for_each(|j| {
                journal.append_add_tx(tx_id, (n * config.tx_size + j) as u64, 1, &payload)
            })
            .and_then(|()| {
                if n % 3 == 2 {
                    journal.append_rollback(tx_id, config.sync)
                } else {
                    journal.append_commit(tx_id, config.sync)
                }
            });
        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{close, small_config, Backend, TestEnv};

    #[test]
    fn concurrent_appends_all_land() {
        let env = TestEnv::new(Backend::Memory, small_config());
        let (journal, _) = env.open_loaded();
        let config = StressConfig {
            operations: 200,
            threads: 4,
            record_size: 64,
            ..StressConfig::default()
        };
        let result = stress_concurrent_appends(&journal, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(journal.id_map_size(), 800);
        close(journal);
    }

    #[test]
    fn churn_leaves_half_the_records() {
        let env = TestEnv::new(Backend::Memory, small_config());
        let (journal, _) = env.open_loaded();
        let config = StressConfig {
            operations: 100,
            record_size: 128,
            ..StressConfig::default()
        };
        let result = stress_update_churn(&journal, &config, 5);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(journal.id_map_size(), 50);
        close(journal);
    }

    #[test]
    fn transactions_commit_two_of_three() {
        let env = TestEnv::new(Backend::Memory, small_config());
        let (journal, _) = env.open_loaded();
        let config = StressConfig {
            operations: 90,
            tx_size: 10,
            record_size: 32,
            sync: false,
            ..StressConfig::default()
        };
        let result = stress_transactions(&journal, &config);
        assert_eq!(result.successful_ops, 9);
        assert_eq!(journal.id_map_size(), 60);
        assert_eq!(journal.open_transaction_count(), 0);
        close(journal);
    }
}
