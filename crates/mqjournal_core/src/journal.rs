//! The journal: append API, lifecycle and background maintenance.

use crate::buffer::{Completer, Completion, FailureListener, TimedBuffer, TimedBufferObserver};
use crate::compactor::{self, CompactionReport};
use crate::config::{JournalConfig, JournalType};
use crate::dir::JournalDir;
use crate::error::{CoreError, CoreResult};
use crate::file::{encode_header, FileState, JournalFile, HEADER_SIZE};
use crate::ledger::{Ledger, Mode};
use crate::loader::{self, LoadMode, LoadResult};
use crate::pool::FilePool;
use crate::record::{JournalRecord, RecordKind};
use crate::stats::{JournalMetrics, JournalStats};
use crate::types::{FileId, RecordId, RecordLocation, TransactionId};
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use mqjournal_storage::{AioFileFactory, NioFileFactory, SequentialFile, SequentialFileFactory};
use parking_lot::{Mutex, RwLock};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Lifecycle of a journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Created,
    Started,
    Loaded,
    ReadOnly,
    Stopped,
}

/// State guarded by the ordering lock.
pub(crate) struct JournalState {
    pub phase: Phase,
    pub ledger: Ledger,
    /// File receiving appends.
    pub current: Option<FileId>,
    /// Id the next formatted file gets.
    pub next_file_id: FileId,
}

enum Task {
    Maintain,
    Stop,
}

/// Shared between the journal handle and its maintenance thread.
pub(crate) struct JournalInner {
    pub config: JournalConfig,
    pub factory: Arc<dyn SequentialFileFactory>,
    pub pool: FilePool,
    pub buffer: TimedBuffer,
    pub metrics: Arc<JournalMetrics>,
    state: Mutex<JournalState>,
    failure_listener: RwLock<Option<FailureListener>>,
    tasks: Sender<Task>,
    task_rx: Receiver<Task>,
    _dir: Option<JournalDir>,
}

/// Writes sealed batches to one journal file.
struct FileWriter {
    file: Arc<dyn SequentialFile>,
    position: AtomicU64,
    metrics: Arc<JournalMetrics>,
}

impl TimedBufferObserver for FileWriter {
    fn flush_buffer(&self, data: Bytes, sync: bool, completers: Vec<Completer>) {
        let offset = self.position.fetch_add(data.len() as u64, Ordering::SeqCst);
        let metrics = Arc::clone(&self.metrics);
        self.file.write_at(
            offset,
            data,
            sync,
            Box::new(move |result| match result {
                Ok(()) => completers.into_iter().for_each(|c| c.complete(Ok(()))),
                Err(err) => {
                    metrics.record_write_failure();
                    for completer in completers {
                        completer.complete(Err(CoreError::from(&err)));
                    }
                }
            }),
        );
    }
}

impl JournalInner {
    /// Takes a file from the pool and stamps it with the next file id.
    pub(crate) fn format_file(
        &self,
        next_file_id: &mut FileId,
    ) -> CoreResult<(FileId, Arc<dyn SequentialFile>)> {
        let file = self.pool.allocate_file()?;
        let id = *next_file_id;
        file.write_blocking(0, &encode_header(id), true)?;
        *next_file_id = id.next();
        debug!(file = file.name(), %id, "formatted journal file");
        Ok((id, file))
    }

    /// Points the timed buffer at `file`, starting at `position`.
    pub(crate) fn install_writer(&self, file: Arc<dyn SequentialFile>, position: u64) {
        self.buffer.set_observer(Arc::new(FileWriter {
            file,
            position: AtomicU64::new(position),
            metrics: Arc::clone(&self.metrics),
        }));
    }

    fn rollover(&self, state: &mut JournalState) -> CoreResult<()> {
        let (id, file) = self.format_file(&mut state.next_file_id)?;
        if let Some(old) = state.current.and_then(|id| state.ledger.files.get_mut(&id)) {
            old.set_state(FileState::Data);
        }
        let mut journal_file =
            JournalFile::new(id, Arc::clone(&file), self.config.journal_file_size);
        journal_file.set_state(FileState::Current);
        state.ledger.files.insert(id, journal_file);
        state.current = Some(id);
        self.install_writer(file, HEADER_SIZE as u64);
        self.metrics.record_rollover();
        debug!(%id, "moved to new journal file");
        self.request_maintenance();
        Ok(())
    }

    fn request_maintenance(&self) {
        // The receiver lives as long as `self`
        let _ = self.tasks.send(Task::Maintain);
    }

    fn detached(&self) -> Completer {
        Completer::detached(self.failure_listener.read().clone())
    }

    /// Appends the record `build` produces from the locked state.
    fn submit(
        &self,
        build: impl FnOnce(&Ledger) -> JournalRecord,
        sync: bool,
        completer: Completer,
    ) -> CoreResult<()> {
        let mut state = self.state.lock();
        let record = build(&state.ledger);
        self.append_locked(&mut state, record, sync, completer)
    }

    fn append(
        &self,
        build: impl FnOnce(&Ledger) -> JournalRecord,
        sync: bool,
    ) -> CoreResult<()> {
        if sync {
            let (completer, completion) = Completer::channel();
            self.submit(build, true, completer)?;
            completion.wait()
        } else {
            self.submit(build, false, self.detached())
        }
    }

    fn append_locked(
        &self,
        state: &mut JournalState,
        record: JournalRecord,
        sync: bool,
        completer: Completer,
    ) -> CoreResult<()> {
        match state.phase {
            Phase::Loaded => {}
            Phase::Created | Phase::Started => return Err(CoreError::NotLoaded),
            Phase::ReadOnly => {
                return Err(CoreError::invalid_operation("journal was loaded read-only"))
            }
            Phase::Stopped => return Err(CoreError::NotStarted),
        }

        let encoded = record.encode()?;
        let max = self.config.max_record_size();
        if encoded.len() > max {
            return Err(CoreError::RecordTooLarge {
                size: encoded.len(),
                max,
            });
        }
        state.ledger.check(&record)?;

        let fits = state
            .current
            .and_then(|id| state.ledger.files.get(&id))
            .is_some_and(|f| f.fits(encoded.len()));
        if !fits {
            self.rollover(state)?;
        }
        let file_id = state
            .current
            .ok_or_else(|| CoreError::invalid_operation("no current journal file"))?;
        let file = state
            .ledger
            .files
            .get_mut(&file_id)
            .ok_or_else(|| CoreError::invalid_operation("current journal file is not tracked"))?;

        let offset = file.write_position();
        self.buffer.add_bytes(&encoded, sync, completer)?;
        file.reserve(encoded.len());

        let kind = record.kind();
        let loc = RecordLocation {
            file_id,
            offset,
            len: encoded.len() as u32,
        };
        state.ledger.apply(record, loc, Mode::Live)?;

        self.metrics.record_append(encoded.len(), sync);
        match kind {
            RecordKind::Prepare => self.metrics.record_prepare(),
            RecordKind::Commit => self.metrics.record_commit(),
            RecordKind::Rollback => self.metrics.record_rollback(),
            _ => {}
        }
        Ok(())
    }

    /// Resets every file that no longer holds anything needed.
    fn reclaim(&self) -> CoreResult<usize> {
        let current = {
            let state = self.state.lock();
            if state.phase != Phase::Loaded {
                return Ok(0);
            }
            match state.current {
                Some(current) => current,
                None => return Ok(0),
            }
        };

        // Files before `current` have no writes in flight after this
        self.buffer.flush_and_wait(false)?;

        let files: Vec<JournalFile> = {
            let mut state = self.state.lock();
            let ready = state.ledger.reclaimable(state.current);
            ready
                .into_iter()
                .filter(|id| *id < current)
                .filter_map(|id| state.ledger.files.remove(&id))
                .collect()
        };
        for file in &files {
            debug!(file = file.name(), id = %file.id(), "reclaiming journal file");
            self.pool.reclaim(Arc::clone(file.file()))?;
        }
        Ok(files.len())
    }

    fn maintain(&self) {
        let result = self
            .pool
            .reserve_free_files(self.config.min_files)
            .and_then(|_| self.reclaim())
            .and_then(|_| {
                let mut state = self.state.lock();
                if state.phase == Phase::Loaded && compactor::should_compact(self, &state) {
                    compactor::compact(self, &mut state)?;
                }
                Ok(())
            });
        if let Err(err) = result {
            error!(error = %err, "journal maintenance failed");
            if let Some(listener) = self.failure_listener.read().as_ref() {
                listener(&err);
            }
        }
    }

    fn run_maintenance(&self) {
        while let Ok(task) = self.task_rx.recv() {
            // Coalesce queued requests into one pass
            let mut stop = matches!(task, Task::Stop);
            for queued in self.task_rx.try_iter() {
                stop |= matches!(queued, Task::Stop);
            }
            if stop {
                break;
            }
            self.maintain();
        }
        debug!("journal maintenance thread exiting");
    }
}

/// An append-only message journal.
///
/// Records are appended to fixed-size files through a timed write buffer
/// and replayed by [`Journal::load`] after a restart. One ordering lock
/// serializes file selection and index updates; physical I/O happens on
/// the buffer's flush thread.
///
/// # Lifecycle
///
/// ```rust,ignore
/// use mqjournal_core::{Journal, JournalConfig};
///
/// let journal = Journal::open(JournalConfig::new().journal_directory("data/journal"))?;
/// journal.start()?;
/// let loaded = journal.load()?;
///
/// journal.append_add(1, 0, b"message", true)?;
/// journal.append_add_tx(7, 2, 0, b"in a transaction")?;
/// journal.append_commit(7, true)?;
///
/// journal.stop()?;
/// ```
pub struct Journal {
    inner: Arc<JournalInner>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Journal {
    /// Opens a journal on disk, using the backend named by
    /// `config.journal_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the directory is
    /// missing (and may not be created), or another journal holds its lock.
    pub fn open(config: JournalConfig) -> CoreResult<Self> {
        config.validate()?;
        let dir = JournalDir::open(
            &config.journal_directory,
            &config.file_prefix,
            config.create_journal_dir,
        )?;
        let factory: Arc<dyn SequentialFileFactory> = match config.journal_type {
            JournalType::Nio => Arc::new(NioFileFactory::new(dir.path())?),
            JournalType::AsyncIo => {
                Arc::new(AioFileFactory::new(dir.path(), config.effective_max_aio())?)
            }
        };
        Ok(Self::build(config, factory, Some(dir)))
    }

    /// Creates a journal on an existing file factory.
    ///
    /// No directory lock is taken.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_factory(
        config: JournalConfig,
        factory: Arc<dyn SequentialFileFactory>,
    ) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self::build(config, factory, None))
    }

    fn build(
        config: JournalConfig,
        factory: Arc<dyn SequentialFileFactory>,
        dir: Option<JournalDir>,
    ) -> Self {
        let metrics = Arc::new(JournalMetrics::new());
        let pool = FilePool::new(
            Arc::clone(&factory),
            config.file_prefix.clone(),
            config.file_extension.clone(),
            config.journal_file_size,
            config.min_files,
            Arc::clone(&metrics),
        );
        let buffer = TimedBuffer::new(
            config.buffer_size,
            config.buffer_timeout(),
            config.flush_on_sync,
            config.log_write_rate,
            Arc::clone(&metrics),
        );
        let (tasks, task_rx) = channel::unbounded();
        Self {
            inner: Arc::new(JournalInner {
                config,
                factory,
                pool,
                buffer,
                metrics,
                state: Mutex::new(JournalState {
                    phase: Phase::Created,
                    ledger: Ledger::new(),
                    current: None,
                    next_file_id: FileId::new(1),
                }),
                failure_listener: RwLock::new(None),
                tasks,
                task_rx,
                _dir: dir,
            }),
            maintenance: Mutex::new(None),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &JournalConfig {
        &self.inner.config
    }

    /// Starts the flush and maintenance threads.
    ///
    /// Starting a started journal does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal was stopped or a thread cannot be
    /// spawned.
    pub fn start(&self) -> CoreResult<()> {
        let mut state = self.inner.state.lock();
        match state.phase {
            Phase::Created => {}
            Phase::Stopped => {
                return Err(CoreError::invalid_operation("a stopped journal cannot restart"))
            }
            Phase::Started | Phase::Loaded | Phase::ReadOnly => return Ok(()),
        }
        self.inner.buffer.start()?;
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("mqjournal-maintenance".to_string())
            .spawn(move || inner.run_maintenance())?;
        *self.maintenance.lock() = Some(handle);
        state.phase = Phase::Started;
        info!(
            backend = %self.inner.factory.kind(),
            file_size = self.inner.config.journal_file_size,
            "journal started"
        );
        Ok(())
    }

    /// Replays the journal files, repairing what can be repaired.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotStarted`] before [`Journal::start`], and a
    /// corruption error if a record before the tail is damaged.
    pub fn load(&self) -> CoreResult<LoadResult> {
        self.load_with_mode(LoadMode::Recover)
    }

    /// Replays the journal files.
    ///
    /// After a [`LoadMode::ReadOnly`] load the journal rejects appends.
    ///
    /// # Errors
    ///
    /// See [`Journal::load`].
    pub fn load_with_mode(&self, mode: LoadMode) -> CoreResult<LoadResult> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        match state.phase {
            Phase::Started => {}
            Phase::Created | Phase::Stopped => return Err(CoreError::NotStarted),
            Phase::Loaded | Phase::ReadOnly => {
                return Err(CoreError::invalid_operation("journal already loaded"))
            }
        }

        let recovered = loader::recover(inner.factory.as_ref(), &inner.config, mode)?;
        inner.pool.observe_seq(recovered.max_seq);
        for file in recovered.free {
            inner.pool.add_free(file);
        }
        state.ledger = recovered.ledger;
        state.next_file_id = recovered.next_file_id;
        state.current = state.ledger.files.keys().next_back().copied();

        let result = LoadResult {
            committed_records: recovered.committed,
            prepared_transactions: recovered.prepared,
            stats: recovered.stats,
        };
        if mode == LoadMode::ReadOnly {
            state.phase = Phase::ReadOnly;
            info!(
                records = result.committed_records.len(),
                prepared = result.prepared_transactions.len(),
                "journal loaded read-only"
            );
            return Ok(result);
        }

        let current = state.current.and_then(|id| state.ledger.files.get_mut(&id));
        match current {
            Some(file) => {
                file.set_state(FileState::Current);
                inner.install_writer(Arc::clone(file.file()), file.write_position());
            }
            None => inner.rollover(&mut state)?,
        }
        state.phase = Phase::Loaded;

        for tx_id in recovered.abandoned {
            let rollback = JournalRecord::Rollback { tx_id };
            inner.append_locked(&mut state, rollback, false, inner.detached())?;
        }
        let files = state.ledger.files.len();
        drop(state);

        inner.pool.reserve_free_files(inner.config.min_files)?;
        inner.request_maintenance();
        info!(
            files,
            records = result.committed_records.len(),
            prepared = result.prepared_transactions.len(),
            abandoned = result.stats.abandoned_transactions,
            "journal loaded"
        );
        Ok(result)
    }

    /// Appends a new record.
    ///
    /// With `sync` (and `sync_non_transactional`) the call returns once the
    /// record is on disk.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateRecord`] if `id` is live, or the write
    /// failure of a synchronous append.
    pub fn append_add(
        &self,
        id: impl Into<RecordId>,
        user_type: u8,
        payload: &[u8],
        sync: bool,
    ) -> CoreResult<()> {
        let record = JournalRecord::Add {
            id: id.into(),
            user_type,
            payload: payload.to_vec(),
        };
        self.inner
            .append(|_| record, sync && self.inner.config.sync_non_transactional)
    }

    /// Appends a new version of a live record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RecordNotFound`] if `id` is not live.
    pub fn append_update(
        &self,
        id: impl Into<RecordId>,
        user_type: u8,
        payload: &[u8],
        sync: bool,
    ) -> CoreResult<()> {
        let record = JournalRecord::Update {
            id: id.into(),
            user_type,
            payload: payload.to_vec(),
        };
        self.inner
            .append(|_| record, sync && self.inner.config.sync_non_transactional)
    }

    /// Deletes a live record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RecordNotFound`] if `id` is not live.
    pub fn append_delete(&self, id: impl Into<RecordId>, sync: bool) -> CoreResult<()> {
        let record = JournalRecord::Delete { id: id.into() };
        self.inner
            .append(|_| record, sync && self.inner.config.sync_non_transactional)
    }

    /// Adds a record to a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateTransaction`] if the transaction is
    /// already prepared.
    pub fn append_add_tx(
        &self,
        tx_id: impl Into<TransactionId>,
        id: impl Into<RecordId>,
        user_type: u8,
        payload: &[u8],
    ) -> CoreResult<()> {
        let record = JournalRecord::AddTx {
            tx_id: tx_id.into(),
            id: id.into(),
            user_type,
            payload: payload.to_vec(),
        };
        self.inner.append(|_| record, false)
    }

    /// Updates a record inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateTransaction`] if the transaction is
    /// already prepared.
    pub fn append_update_tx(
        &self,
        tx_id: impl Into<TransactionId>,
        id: impl Into<RecordId>,
        user_type: u8,
        payload: &[u8],
    ) -> CoreResult<()> {
        let record = JournalRecord::UpdateTx {
            tx_id: tx_id.into(),
            id: id.into(),
            user_type,
            payload: payload.to_vec(),
        };
        self.inner.append(|_| record, false)
    }

    /// Deletes a record inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateTransaction`] if the transaction is
    /// already prepared.
    pub fn append_delete_tx(
        &self,
        tx_id: impl Into<TransactionId>,
        id: impl Into<RecordId>,
    ) -> CoreResult<()> {
        let record = JournalRecord::DeleteTx {
            tx_id: tx_id.into(),
            id: id.into(),
        };
        self.inner.append(|_| record, false)
    }

    /// Writes the PREPARE marker of a transaction, with XA recovery data.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateTransaction`] if the transaction is
    /// already prepared.
    pub fn append_prepare(
        &self,
        tx_id: impl Into<TransactionId>,
        extra_data: &[u8],
        sync: bool,
    ) -> CoreResult<()> {
        let tx_id = tx_id.into();
        let extra_data = extra_data.to_vec();
        self.inner.append(
            move |ledger| JournalRecord::Prepare {
                tx_id,
                record_count: tx_record_count(ledger, tx_id),
                extra_data,
            },
            sync && self.inner.config.sync_transactional,
        )
    }

    /// Commits a transaction, making its records live.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the transaction is not
    /// open.
    pub fn append_commit(&self, tx_id: impl Into<TransactionId>, sync: bool) -> CoreResult<()> {
        let tx_id = tx_id.into();
        self.inner.append(
            move |ledger| JournalRecord::Commit {
                tx_id,
                record_count: tx_record_count(ledger, tx_id),
            },
            sync && self.inner.config.sync_transactional,
        )
    }

    /// Rolls a transaction back, discarding its records.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the transaction is not
    /// open.
    pub fn append_rollback(&self, tx_id: impl Into<TransactionId>, sync: bool) -> CoreResult<()> {
        let record = JournalRecord::Rollback {
            tx_id: tx_id.into(),
        };
        self.inner
            .append(|_| record, sync && self.inner.config.sync_transactional)
    }

    /// Appends an already built record without waiting for it.
    ///
    /// The returned [`Completion`] resolves once the record is written and
    /// forced.
    ///
    /// # Errors
    ///
    /// Returns the validation error if the record is rejected.
    pub fn append_record(&self, record: JournalRecord) -> CoreResult<Completion> {
        let (completer, completion) = Completer::channel();
        self.inner.submit(|_| record, true, completer)?;
        Ok(completion)
    }

    /// Registers the callback that receives failures of non-blocking
    /// appends.
    pub fn set_failure_listener(&self, listener: impl Fn(&CoreError) + Send + Sync + 'static) {
        *self.inner.failure_listener.write() = Some(Arc::new(listener));
    }

    /// Waits until every accepted append has been written.
    ///
    /// # Errors
    ///
    /// Returns the failure of the last write.
    pub fn flush(&self) -> CoreResult<()> {
        self.inner.buffer.flush_and_wait(true)
    }

    /// Resets every file whose records are all dead.
    ///
    /// Returns the number of files reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be reset or deleted.
    pub fn check_reclaim(&self) -> CoreResult<usize> {
        self.inner.reclaim()
    }

    /// Rewrites every live record into fresh files.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotLoaded`] before a writable load, or the I/O
    /// failure that aborted the compaction. An aborted compaction leaves
    /// the journal unchanged.
    pub fn compact(&self) -> CoreResult<CompactionReport> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Loaded {
            return Err(CoreError::NotLoaded);
        }
        compactor::compact(&self.inner, &mut state)
    }

    /// Returns the number of live records.
    #[must_use]
    pub fn id_map_size(&self) -> usize {
        self.inner.state.lock().ledger.records.len()
    }

    /// Returns the number of started or prepared transactions.
    #[must_use]
    pub fn open_transaction_count(&self) -> usize {
        self.inner.state.lock().ledger.transactions.len()
    }

    /// Returns the counters of the journal and of each file.
    #[must_use]
    pub fn stats(&self) -> JournalStats {
        let state = self.inner.state.lock();
        JournalStats {
            metrics: self.inner.metrics.snapshot(),
            files: state.ledger.files.values().map(JournalFile::stats).collect(),
            current_file: state.current,
            free_files: self.inner.pool.free_count(),
            live_records: state.ledger.records.len(),
            open_transactions: state.ledger.transactions.len(),
            pending_io: self.inner.factory.pending_io(),
            max_io: self.inner.factory.max_io(),
        }
    }

    /// Describes every file and its counters, one line each.
    #[must_use]
    pub fn debug_journal(&self) -> String {
        let stats = self.stats();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "journal: {} live records, {} open transactions, {} free files",
            stats.live_records, stats.open_transactions, stats.free_files
        );
        for file in &stats.files {
            let _ = writeln!(
                out,
                "  {} {} [{}] position={} records={} live={} live_bytes={} cancels={:?}",
                file.id,
                file.name,
                file.state,
                file.write_position,
                file.total_records,
                file.live_records,
                file.live_bytes,
                file.neg_refs.iter().map(|id| id.as_u64()).collect::<Vec<_>>()
            );
        }
        out
    }

    /// Writes everything buffered and stops the journal.
    ///
    /// Stopping a stopped journal does nothing.
    ///
    /// # Errors
    ///
    /// Returns the failure of the final write.
    pub fn stop(&self) -> CoreResult<()> {
        let previous = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut state.phase, Phase::Stopped)
        };
        if previous == Phase::Stopped {
            return Ok(());
        }

        let _ = self.inner.tasks.send(Task::Stop);
        if let Some(handle) = self.maintenance.lock().take() {
            if handle.join().is_err() {
                error!("journal maintenance thread panicked");
            }
        }
        let flushed = self.inner.buffer.flush_and_wait(true);
        self.inner.buffer.stop();
        self.inner.factory.shutdown();
        info!("journal stopped");
        flushed
    }
}

fn tx_record_count(ledger: &Ledger, tx_id: TransactionId) -> u32 {
    ledger
        .transactions
        .get(&tx_id)
        .map_or(0, |tx| tx.record_count())
}

impl Drop for Journal {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(error = %err, "failed to stop journal cleanly");
        }
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Journal")
            .field("phase", &state.phase)
            .field("files", &state.ledger.files.len())
            .field("live_records", &state.ledger.records.len())
            .field("current", &state.current)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqjournal_storage::InMemoryFileFactory;

    fn config() -> JournalConfig {
        JournalConfig::new()
            .journal_file_size(4096)
            .buffer_size(1024)
            .compact_min_files(0)
            .file_prefix("t")
    }

    fn started(factory: &InMemoryFileFactory, config: JournalConfig) -> Journal {
        let journal = Journal::with_factory(config, Arc::new(factory.clone())).unwrap();
        journal.start().unwrap();
        journal
    }

    #[test]
    fn lifecycle_order_is_enforced() {
        let factory = InMemoryFileFactory::new();
        let journal = Journal::with_factory(config(), Arc::new(factory)).unwrap();
        assert!(matches!(journal.load(), Err(CoreError::NotStarted)));

        journal.start().unwrap();
        assert!(matches!(
            journal.append_add(1, 0, b"x", false),
            Err(CoreError::NotLoaded)
        ));

        journal.load().unwrap();
        journal.append_add(1, 0, b"x", true).unwrap();
        assert!(journal.load().is_err());

        journal.stop().unwrap();
        assert!(matches!(
            journal.append_add(2, 0, b"x", false),
            Err(CoreError::NotStarted)
        ));
        assert!(journal.start().is_err());
    }

    #[test]
    fn records_survive_restart() {
        let factory = InMemoryFileFactory::new();
        let journal = started(&factory, config());
        journal.load().unwrap();
        journal.append_add(1, 3, b"one", false).unwrap();
        journal.append_add(2, 3, b"two", false).unwrap();
        journal.append_update(1, 4, b"uno", false).unwrap();
        journal.append_delete(2, true).unwrap();
        journal.stop().unwrap();

        let journal = started(&factory, config());
        let loaded = journal.load().unwrap();
        assert_eq!(loaded.committed_records.len(), 1);
        let record = &loaded.committed_records[0];
        assert_eq!(record.id, RecordId::new(1));
        assert_eq!(record.user_type, 4);
        assert_eq!(record.payload, b"uno");
        assert_eq!(journal.id_map_size(), 1);
    }

    #[test]
    fn programmer_errors_are_immediate() {
        let factory = InMemoryFileFactory::new();
        let journal = started(&factory, config());
        journal.load().unwrap();
        journal.append_add(1, 0, b"a", false).unwrap();

        assert!(matches!(
            journal.append_add(1, 0, b"a", false),
            Err(CoreError::DuplicateRecord { .. })
        ));
        assert!(matches!(
            journal.append_update(5, 0, b"a", true),
            Err(CoreError::RecordNotFound { .. })
        ));
        assert!(matches!(
            journal.append_delete(5, true),
            Err(CoreError::RecordNotFound { .. })
        ));
        assert!(matches!(
            journal.append_add(9, 0, &[0u8; 2048], false),
            Err(CoreError::RecordTooLarge { .. })
        ));
        assert!(journal.append_commit(77, true).is_err());
    }

    #[test]
    fn prepared_transaction_survives_and_resolves() {
        let factory = InMemoryFileFactory::new();
        let journal = started(&factory, config());
        journal.load().unwrap();
        journal.append_add_tx(7, 1, 0, b"a").unwrap();
        journal.append_add_tx(7, 2, 0, b"b").unwrap();
        journal.append_prepare(7, b"xid", true).unwrap();
        assert!(matches!(
            journal.append_add_tx(7, 3, 0, b"c"),
            Err(CoreError::DuplicateTransaction { .. })
        ));
        journal.stop().unwrap();

        let journal = started(&factory, config());
        let loaded = journal.load().unwrap();
        assert!(loaded.committed_records.is_empty());
        assert_eq!(loaded.prepared_transactions.len(), 1);
        assert_eq!(loaded.prepared_transactions[0].records.len(), 2);
        assert_eq!(journal.open_transaction_count(), 1);

        journal.append_commit(7, true).unwrap();
        assert_eq!(journal.id_map_size(), 2);
        assert_eq!(journal.open_transaction_count(), 0);
    }

    #[test]
    fn abandoned_transaction_is_rolled_back_on_load() {
        let factory = InMemoryFileFactory::new();
        let journal = started(&factory, config());
        journal.load().unwrap();
        for id in 0..3 {
            journal.append_add_tx(4, id, 0, b"pending").unwrap();
        }
        journal.stop().unwrap();

        let journal = started(&factory, config());
        let loaded = journal.load().unwrap();
        assert!(loaded.committed_records.is_empty());
        assert!(loaded.prepared_transactions.is_empty());
        assert_eq!(loaded.stats.abandoned_transactions, 1);
        assert_eq!(journal.open_transaction_count(), 0);
        journal.stop().unwrap();

        // The ROLLBACK written during load closes the transaction for good
        let journal = started(&factory, config());
        let loaded = journal.load().unwrap();
        assert_eq!(loaded.stats.abandoned_transactions, 0);
    }

    #[test]
    fn rollover_moves_to_new_files() {
        let factory = InMemoryFileFactory::new();
        let journal = started(&factory, config());
        journal.load().unwrap();
        for id in 0..100u64 {
            journal.append_add(id, 0, &[1u8; 100], false).unwrap();
        }
        journal.flush().unwrap();
        let stats = journal.stats();
        assert!(stats.files.len() > 1);
        assert!(stats.metrics.rollovers > 1);
        assert_eq!(stats.live_records, 100);
        journal.stop().unwrap();

        let journal = started(&factory, config());
        assert_eq!(journal.load().unwrap().committed_records.len(), 100);
    }

    #[test]
    fn deleted_files_are_reclaimed() {
        let factory = InMemoryFileFactory::new();
        let journal = started(&factory, config());
        journal.load().unwrap();
        for id in 0..100u64 {
            journal.append_add(id, 0, &[1u8; 100], false).unwrap();
        }
        for id in 0..100u64 {
            journal.append_delete(id, false).unwrap();
        }
        journal.append_add(1000, 0, b"last", true).unwrap();

        // The maintenance thread may get there first
        journal.check_reclaim().unwrap();
        let stats = journal.stats();
        assert!(stats.metrics.files_reclaimed > 0);
        assert!(stats
            .files
            .iter()
            .all(|f| f.live_records > 0 || Some(f.id) == stats.current_file));
        journal.stop().unwrap();

        let journal = started(&factory, config());
        let loaded = journal.load().unwrap();
        assert_eq!(loaded.committed_records.len(), 1);
        assert_eq!(loaded.committed_records[0].id, RecordId::new(1000));
    }

    #[test]
    fn compaction_keeps_live_records() {
        let factory = InMemoryFileFactory::new();
        let journal = started(&factory, config());
        journal.load().unwrap();
        for id in 0..60u64 {
            journal.append_add(id, 0, &[2u8; 100], false).unwrap();
        }
        for id in (0..60u64).filter(|id| id % 3 != 0) {
            journal.append_delete(id, false).unwrap();
        }
        journal.append_add_tx(9, 500, 1, b"open").unwrap();

        let report = journal.compact().unwrap();
        assert!(report.output_files < report.source_files);
        assert_eq!(report.records_copied, 20);
        assert_eq!(report.transactions_copied, 1);
        journal.append_add(61, 0, b"after", true).unwrap();
        journal.append_commit(9, true).unwrap();
        journal.stop().unwrap();

        let journal = started(&factory, config());
        let loaded = journal.load().unwrap();
        assert_eq!(loaded.committed_records.len(), 22);
        assert!(factory.read_control("t.cmp").unwrap().is_none());
    }

    #[test]
    fn failure_listener_receives_detached_failures() {
        let factory = InMemoryFileFactory::new();
        let journal = started(&factory, config());
        journal.load().unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        journal.set_failure_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Shrinking the current file makes the next write fail
        let name = journal.stats().files[0].name.clone();
        factory.file(&name).unwrap().set_data(vec![0u8; 40]);
        journal.append_add(1, 0, b"lost", false).unwrap();
        assert!(journal.flush().is_err());
        assert!(seen.load(Ordering::SeqCst) >= 1);
        assert!(journal.stats().metrics.write_failures >= 1);
    }

    #[test]
    fn read_only_load_rejects_appends() {
        let factory = InMemoryFileFactory::new();
        let journal = started(&factory, config());
        journal.load().unwrap();
        journal.append_add(1, 0, b"a", true).unwrap();
        journal.stop().unwrap();

        let journal = started(&factory, config());
        let loaded = journal.load_with_mode(LoadMode::ReadOnly).unwrap();
        assert_eq!(loaded.committed_records.len(), 1);
        assert!(journal.append_add(2, 0, b"b", false).is_err());
    }

    #[test]
    fn open_limits_outstanding_io_per_backend() {
        for (journal_type, expected) in [(JournalType::AsyncIo, 8), (JournalType::Nio, 1)] {
            let temp = tempfile::tempdir().unwrap();
            let config = config()
                .journal_directory(temp.path().join("journal"))
                .create_journal_dir(true)
                .journal_type(journal_type)
                .max_aio(8);
            assert_eq!(config.effective_max_aio(), expected);

            let journal = Journal::open(config).unwrap();
            assert_eq!(journal.stats().max_io, expected, "{journal_type}");
        }
    }

    #[test]
    fn debug_journal_lists_files() {
        let factory = InMemoryFileFactory::new();
        let journal = started(&factory, config());
        journal.load().unwrap();
        journal.append_add(1, 0, b"a", true).unwrap();
        let text = journal.debug_journal();
        assert!(text.contains("1 live records"));
        assert!(text.contains("t-"));
    }
}
