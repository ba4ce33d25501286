//! Journal fixtures for tests.
//!
//! A [`TestEnv`] owns the storage of one journal (a temporary directory or
//! an in-memory factory) and opens journals on it, so a test can stop a
//! journal and load the same files again.

use mqjournal_core::{Journal, JournalConfig, JournalType, LoadMode, LoadResult};
use mqjournal_storage::{InMemoryFileFactory, NioFileFactory, SequentialFileFactory};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// How long teardown waits for outstanding I/O to drain.
const QUIESCE_TIMEOUT: Duration = Duration::from_secs(5);

/// A file backend a test runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Files on disk written by the flushing thread.
    Nio,
    /// Files on disk written by the I/O thread pool.
    Aio,
    /// In-memory files.
    Memory,
}

impl Backend {
    /// Every backend.
    pub const ALL: [Self; 3] = [Self::Nio, Self::Aio, Self::Memory];

    /// Returns true for backends with files on disk.
    #[must_use]
    pub const fn is_disk(self) -> bool {
        matches!(self, Self::Nio | Self::Aio)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nio => write!(f, "nio"),
            Self::Aio => write!(f, "aio"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Small files and a short flush window, so tests roll over quickly.
///
/// Automatic compaction is off; tests that want it call `compact()` or
/// raise the thresholds themselves.
#[must_use]
pub fn small_config() -> JournalConfig {
    JournalConfig::new()
        .journal_file_size(64 * 1024)
        .buffer_size(16 * 1024)
        .buffer_timeout_micros(500)
        .max_aio(64)
        .compact_min_files(0)
        .file_prefix("test")
        .file_extension("jrn")
}

/// Storage for journals under test.
pub struct TestEnv {
    backend: Backend,
    config: JournalConfig,
    memory: InMemoryFileFactory,
    _temp_dir: Option<TempDir>,
}

impl TestEnv {
    /// Creates empty storage for `backend`.
    ///
    /// # Panics
    ///
    /// Panics if a temporary directory cannot be created.
    #[must_use]
    pub fn new(backend: Backend, config: JournalConfig) -> Self {
        let temp_dir = backend
            .is_disk()
            .then(|| TempDir::new().expect("failed to create temp dir"));
        let mut config = config;
        if let Some(dir) = &temp_dir {
            config.journal_directory = dir.path().join("journal");
        }
        config.journal_type = match backend {
            Backend::Nio => JournalType::Nio,
            Backend::Aio | Backend::Memory => JournalType::AsyncIo,
        };
        Self {
            backend,
            config,
            memory: InMemoryFileFactory::new(),
            _temp_dir: temp_dir,
        }
    }

    /// Returns the backend.
    #[must_use]
    pub const fn backend(&self) -> Backend {
        self.backend
    }

    /// Returns the configuration journals are opened with.
    #[must_use]
    pub const fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Creates a journal without starting it.
    ///
    /// # Panics
    ///
    /// Panics if the journal cannot be opened.
    #[must_use]
    pub fn create(&self) -> Journal {
        let journal = match self.backend {
            Backend::Memory => {
                Journal::with_factory(self.config.clone(), Arc::new(self.memory.clone()))
            }
            Backend::Nio | Backend::Aio => Journal::open(self.config.clone()),
        };
        journal.unwrap_or_else(|err| panic!("failed to open {} journal: {err}", self.backend))
    }

    /// Creates and starts a journal.
    ///
    /// # Panics
    ///
    /// Panics if the journal cannot be opened or started.
    #[must_use]
    pub fn open(&self) -> Journal {
        let journal = self.create();
        journal.start().expect("failed to start journal");
        journal
    }

    /// Creates, starts and loads a journal.
    ///
    /// # Panics
    ///
    /// Panics if any step fails.
    #[must_use]
    pub fn open_loaded(&self) -> (Journal, LoadResult) {
        let journal = self.open();
        let result = journal.load().expect("failed to load journal");
        (journal, result)
    }

    /// Loads the files read-only.
    ///
    /// # Panics
    ///
    /// Panics if the journal cannot be opened or started.
    #[must_use]
    pub fn open_read_only(&self) -> (Journal, mqjournal_core::CoreResult<LoadResult>) {
        let journal = self.open();
        let result = journal.load_with_mode(LoadMode::ReadOnly);
        (journal, result)
    }

    /// Stops `journal` and loads its files into a new one.
    ///
    /// # Panics
    ///
    /// Panics if stopping or loading fails.
    #[must_use]
    pub fn restart(&self, journal: Journal) -> (Journal, LoadResult) {
        close(journal);
        self.open_loaded()
    }

    /// Returns a factory over the journal's files, for inspecting or
    /// damaging them while no journal is running.
    ///
    /// # Panics
    ///
    /// Panics if the journal directory does not exist yet.
    #[must_use]
    pub fn raw_factory(&self) -> Arc<dyn SequentialFileFactory> {
        match self.backend {
            Backend::Memory => Arc::new(self.memory.clone()),
            Backend::Nio | Backend::Aio => Arc::new(
                NioFileFactory::new(&self.config.journal_directory)
                    .expect("journal directory missing"),
            ),
        }
    }

    /// Returns the in-memory factory (empty for disk backends).
    #[must_use]
    pub const fn memory(&self) -> &InMemoryFileFactory {
        &self.memory
    }
}

impl fmt::Debug for TestEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestEnv")
            .field("backend", &self.backend)
            .field("dir", &self.config.journal_directory)
            .finish()
    }
}

/// Waits until every accepted append has been written and no I/O is
/// outstanding.
///
/// # Panics
///
/// Panics if the flush fails or I/O does not drain in time.
pub fn wait_quiescent(journal: &Journal) {
    journal.flush().expect("flush failed");
    // Completions run before the backend releases the request slot.
    let deadline = Instant::now() + QUIESCE_TIMEOUT;
    loop {
        let pending = journal.stats().pending_io;
        if pending == 0 {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{pending} I/O requests still outstanding"
        );
        thread::sleep(Duration::from_millis(1));
    }
}

/// Stops a journal after checking that no I/O is left outstanding.
///
/// # Panics
///
/// Panics if outstanding I/O does not drain or the stop fails.
pub fn close(journal: Journal) {
    wait_quiescent(&journal);
    journal.stop().expect("failed to stop journal");
    assert_eq!(journal.stats().pending_io, 0, "writes outstanding after stop");
}

/// Runs `test` once per backend, each time on fresh storage.
pub fn for_each_backend(config: &JournalConfig, mut test: impl FnMut(&TestEnv)) {
    for backend in Backend::ALL {
        let env = TestEnv::new(backend, config.clone());
        test(&env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_places_disk_journals_in_temp_dir() {
        let env = TestEnv::new(Backend::Nio, small_config());
        assert!(env.config().journal_directory.ends_with("journal"));
        assert_eq!(env.config().journal_type, JournalType::Nio);

        let env = TestEnv::new(Backend::Memory, small_config());
        assert_eq!(env.config().journal_type, JournalType::AsyncIo);
    }

    #[test]
    fn every_backend_loads_an_empty_journal() {
        for_each_backend(&small_config(), |env| {
            let (journal, result) = env.open_loaded();
            assert!(result.committed_records.is_empty(), "{}", env.backend());
            assert_eq!(journal.id_map_size(), 0);
            close(journal);
        });
    }

    #[test]
    fn restart_reopens_same_files() {
        for_each_backend(&small_config(), |env| {
            let (journal, _) = env.open_loaded();
            journal.append_add(1u64, 1, b"kept", true).unwrap();
            let (journal, result) = env.restart(journal);
            assert_eq!(result.committed_records.len(), 1, "{}", env.backend());
            assert_eq!(result.committed_records[0].payload, b"kept");
            close(journal);
        });
    }
}
