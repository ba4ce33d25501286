//! Timed write buffer.
//!
//! Appends are copied into an open batch. A dedicated flush thread hands
//! the batch to the active [`TimedBufferObserver`] as one physical write
//! when the first of these happens:
//!
//! - the batch is full (or the next append would not fit)
//! - the flush window has elapsed since the first append of the batch
//! - an append requested durability and `flush_on_sync` is set
//! - the observer changes (file rollover) or a barrier is requested
//!
//! Every append carries a [`Completer`]; the observer resolves all
//! completers of a batch, in append order, once the write has finished.

use crate::error::{CoreError, CoreResult};
use crate::stats::JournalMetrics;
use bytes::{Bytes, BytesMut};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Sealed batches waiting for the flush thread before appenders block.
const MAX_SEALED_BATCHES: usize = 2;

/// Callback invoked for failures no caller is waiting for.
pub type FailureListener = Arc<dyn Fn(&CoreError) + Send + Sync>;

/// Receives sealed batches from a [`TimedBuffer`].
pub trait TimedBufferObserver: Send + Sync {
    /// Writes `data` (forcing it when `sync` is set) and then resolves every
    /// completer, in order, with the outcome.
    fn flush_buffer(&self, data: Bytes, sync: bool, completers: Vec<Completer>);
}

enum Target {
    Channel(Sender<CoreResult<()>>),
    Callback(Box<dyn FnOnce(CoreResult<()>) + Send>),
    Detached(Option<FailureListener>),
}

/// The resolving half of an append's outcome.
pub struct Completer {
    target: Target,
}

impl Completer {
    /// Creates a completer and the [`Completion`] that observes it.
    #[must_use]
    pub fn channel() -> (Self, Completion) {
        let (tx, rx) = channel::bounded(1);
        (
            Self {
                target: Target::Channel(tx),
            },
            Completion { rx },
        )
    }

    /// Creates a completer that runs `callback` with the outcome.
    ///
    /// The callback runs on an I/O thread and must not block.
    pub fn callback(callback: impl FnOnce(CoreResult<()>) + Send + 'static) -> Self {
        Self {
            target: Target::Callback(Box::new(callback)),
        }
    }

    /// Creates a completer nobody waits on.
    ///
    /// Failures are logged and passed to `listener`.
    #[must_use]
    pub fn detached(listener: Option<FailureListener>) -> Self {
        Self {
            target: Target::Detached(listener),
        }
    }

    /// Resolves the append.
    pub fn complete(self, result: CoreResult<()>) {
        match self.target {
            Target::Channel(tx) => {
                // The waiter went away; the failure must still surface
                if let Err(unsent) = tx.send(result) {
                    if let Err(err) = unsent.into_inner() {
                        report_failure(None, &err);
                    }
                }
            }
            Target::Callback(callback) => callback(result),
            Target::Detached(listener) => {
                if let Err(err) = result {
                    report_failure(listener.as_ref(), &err);
                }
            }
        }
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.target {
            Target::Channel(_) => "channel",
            Target::Callback(_) => "callback",
            Target::Detached(_) => "detached",
        };
        f.debug_struct("Completer").field("target", &kind).finish()
    }
}

fn report_failure(listener: Option<&FailureListener>, err: &CoreError) {
    error!(error = %err, "journal write failed");
    if let Some(listener) = listener {
        listener(err);
    }
}

/// The waiting half of an append's outcome.
#[derive(Debug)]
pub struct Completion {
    rx: Receiver<CoreResult<()>>,
}

impl Completion {
    /// Blocks until the append is resolved.
    ///
    /// # Errors
    ///
    /// Returns the write failure, or [`CoreError::InvalidOperation`] if the
    /// append was dropped without being resolved.
    pub fn wait(self) -> CoreResult<()> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(dropped_completion()))
    }

    /// Blocks up to `timeout`; returns `None` if the append is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CoreResult<()>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(channel::RecvTimeoutError::Timeout) => None,
            Err(channel::RecvTimeoutError::Disconnected) => Some(Err(dropped_completion())),
        }
    }
}

fn dropped_completion() -> CoreError {
    CoreError::invalid_operation("append dropped before it was written")
}

struct Batch {
    data: Bytes,
    sync: bool,
    completers: Vec<Completer>,
    observer: Arc<dyn TimedBufferObserver>,
}

struct OpenBatch {
    data: BytesMut,
    completers: Vec<Completer>,
    sync: bool,
    opened_at: Option<Instant>,
}

impl OpenBatch {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            completers: Vec::new(),
            sync: false,
            opened_at: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty() && self.completers.is_empty()
    }
}

struct BufferState {
    open: OpenBatch,
    sealed: VecDeque<Batch>,
    observer: Option<Arc<dyn TimedBufferObserver>>,
    flush_requested: bool,
    stopped: bool,
}

struct Shared {
    state: Mutex<BufferState>,
    work: Condvar,
    space: Condvar,
    capacity: usize,
    timeout: Duration,
    flush_on_sync: bool,
    log_write_rate: bool,
    metrics: Arc<JournalMetrics>,
}

impl Shared {
    /// Moves the open batch to the sealed queue.
    ///
    /// Blocks while the queue is full.
    fn seal(&self, state: &mut MutexGuard<'_, BufferState>, force_sync: bool) {
        if state.open.is_empty() {
            return;
        }
        while state.sealed.len() >= MAX_SEALED_BATCHES {
            self.space.wait(state);
        }
        if let Some(batch) = self.take_open(state, force_sync) {
            state.sealed.push_back(batch);
            self.work.notify_one();
        }
    }

    fn take_open(&self, state: &mut BufferState, force_sync: bool) -> Option<Batch> {
        let observer = state.observer.clone()?;
        let open = std::mem::replace(&mut state.open, OpenBatch::with_capacity(self.capacity));
        Some(Batch {
            data: open.data.freeze(),
            sync: open.sync || force_sync,
            completers: open.completers,
            observer,
        })
    }

    /// Waits for the next batch to write; `None` once stopped and drained.
    fn next_batch(&self) -> Option<Batch> {
        let mut state = self.state.lock();
        loop {
            if let Some(batch) = state.sealed.pop_front() {
                self.space.notify_all();
                return Some(batch);
            }

            let deadline = state.open.opened_at.map(|at| at + self.timeout);
            if !state.open.is_empty() {
                let expired = deadline.is_some_and(|d| Instant::now() >= d);
                if state.stopped || state.flush_requested || expired || deadline.is_none() {
                    state.flush_requested = false;
                    if let Some(batch) = self.take_open(&mut state, false) {
                        return Some(batch);
                    }
                }
            }
            if state.stopped {
                return None;
            }

            match deadline {
                Some(deadline) => {
                    self.work.wait_until(&mut state, deadline);
                }
                None => {
                    state.flush_requested = false;
                    self.work.wait(&mut state);
                }
            }
        }
    }

    fn run(&self) {
        let mut rate = WriteRate::new();
        while let Some(batch) = self.next_batch() {
            let len = batch.data.len();
            batch
                .observer
                .flush_buffer(batch.data, batch.sync, batch.completers);
            self.metrics.record_flush(len);
            if self.log_write_rate {
                rate.record(len);
            }
        }
        debug!("timed buffer flush thread exiting");
    }
}

struct WriteRate {
    window_start: Instant,
    bytes: u64,
    flushes: u64,
}

impl WriteRate {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            bytes: 0,
            flushes: 0,
        }
    }

    fn record(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
        self.flushes += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let secs = elapsed.as_secs_f64();
            info!(
                bytes_per_sec = (self.bytes as f64 / secs) as u64,
                flushes_per_sec = (self.flushes as f64 / secs) as u64,
                "journal write rate"
            );
            *self = Self::new();
        }
    }
}

/// Coalesces appends into physical writes within a bounded latency.
pub struct TimedBuffer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimedBuffer {
    /// Creates a stopped buffer.
    pub fn new(
        capacity: usize,
        timeout: Duration,
        flush_on_sync: bool,
        log_write_rate: bool,
        metrics: Arc<JournalMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BufferState {
                    open: OpenBatch::with_capacity(capacity),
                    sealed: VecDeque::new(),
                    observer: None,
                    flush_requested: false,
                    stopped: false,
                }),
                work: Condvar::new(),
                space: Condvar::new(),
                capacity,
                timeout,
                flush_on_sync,
                log_write_rate,
                metrics,
            }),
            thread: Mutex::new(None),
        }
    }

    /// Returns the batch capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Starts the flush thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(&self) -> CoreResult<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("mqjournal-flush".to_string())
            .spawn(move || shared.run())?;
        *thread = Some(handle);
        Ok(())
    }

    /// Directs future batches to `observer`.
    ///
    /// Bytes already buffered are sealed, with a force, for the previous
    /// observer first.
    pub fn set_observer(&self, observer: Arc<dyn TimedBufferObserver>) {
        let mut state = self.shared.state.lock();
        if state.observer.is_some() {
            self.shared.seal(&mut state, true);
        }
        state.observer = Some(observer);
    }

    /// Makes room for `len` bytes, sealing the open batch if they would not
    /// fit in what remains.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RecordTooLarge`] if `len` exceeds the capacity.
    pub fn check_size(&self, len: usize) -> CoreResult<()> {
        let mut state = self.shared.state.lock();
        self.check_size_locked(&mut state, len)
    }

    fn check_size_locked(
        &self,
        state: &mut MutexGuard<'_, BufferState>,
        len: usize,
    ) -> CoreResult<()> {
        if len > self.shared.capacity {
            return Err(CoreError::RecordTooLarge {
                size: len,
                max: self.shared.capacity,
            });
        }
        if len > self.shared.capacity - state.open.data.len() {
            self.shared.seal(state, false);
        }
        Ok(())
    }

    /// Appends `bytes` to the open batch.
    ///
    /// `completer` is resolved after the batch holding the bytes has been
    /// written, and forced when `sync` is set.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotStarted`] after [`TimedBuffer::stop`], and
    /// [`CoreError::InvalidOperation`] before an observer is set.
    pub fn add_bytes(&self, bytes: &[u8], sync: bool, completer: Completer) -> CoreResult<()> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(CoreError::NotStarted);
        }
        if state.observer.is_none() {
            return Err(CoreError::invalid_operation("timed buffer has no observer"));
        }
        self.check_size_locked(&mut state, bytes.len())?;

        if state.open.opened_at.is_none() {
            state.open.opened_at = Some(Instant::now());
            self.shared.work.notify_one();
        }
        state.open.data.extend_from_slice(bytes);
        state.open.completers.push(completer);
        if sync {
            state.open.sync = true;
            if self.shared.flush_on_sync {
                state.flush_requested = true;
                self.shared.work.notify_one();
            }
        }
        if state.open.data.len() == self.shared.capacity {
            self.shared.seal(&mut state, false);
        }
        Ok(())
    }

    /// Seals the open batch and waits until it and every batch before it
    /// have been written.
    ///
    /// # Errors
    ///
    /// Returns the write failure of the barrier batch.
    pub fn flush_and_wait(&self, sync: bool) -> CoreResult<()> {
        let (completer, completion) = Completer::channel();
        {
            let mut state = self.shared.state.lock();
            if state.stopped || state.observer.is_none() {
                return Ok(());
            }
            state.open.completers.push(completer);
            state.open.sync |= sync;
            self.shared.seal(&mut state, false);
        }
        completion.wait()
    }

    /// Writes everything buffered and stops the flush thread.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            self.shared.work.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("timed buffer flush thread panicked");
            }
        }
    }
}

impl Drop for TimedBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TimedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedBuffer")
            .field("capacity", &self.shared.capacity)
            .field("timeout", &self.shared.timeout)
            .field("flush_on_sync", &self.shared.flush_on_sync)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        flushes: Mutex<Vec<(Vec<u8>, bool)>>,
        fail: bool,
    }

    impl TimedBufferObserver for Recorder {
        fn flush_buffer(&self, data: Bytes, sync: bool, completers: Vec<Completer>) {
            self.flushes.lock().push((data.to_vec(), sync));
            for completer in completers {
                let result = if self.fail {
                    Err(CoreError::write_failed(5, "disk on fire"))
                } else {
                    Ok(())
                };
                completer.complete(result);
            }
        }
    }

    impl Recorder {
        fn data_flushes(&self) -> Vec<(Vec<u8>, bool)> {
            self.flushes
                .lock()
                .iter()
                .filter(|(data, _)| !data.is_empty())
                .cloned()
                .collect()
        }
    }

    fn buffer(capacity: usize, timeout: Duration, flush_on_sync: bool) -> TimedBuffer {
        let buffer = TimedBuffer::new(
            capacity,
            timeout,
            flush_on_sync,
            false,
            Arc::new(JournalMetrics::new()),
        );
        buffer.start().unwrap();
        buffer
    }

    #[test]
    fn full_buffer_flushes_once_in_order() {
        let recorder = Arc::new(Recorder::default());
        let buffer = buffer(100, Duration::from_secs(60), true);
        buffer.set_observer(recorder.clone());

        let mut expected = Vec::new();
        let mut completions = Vec::new();
        for i in 0..10u8 {
            let chunk = [i; 10];
            expected.extend_from_slice(&chunk);
            let (completer, completion) = Completer::channel();
            buffer.add_bytes(&chunk, false, completer).unwrap();
            completions.push(completion);
        }
        for completion in completions {
            completion.wait().unwrap();
        }

        let flushes = recorder.flushes.lock().clone();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].0, expected);
        assert!(!flushes[0].1);
    }

    #[test]
    fn timeout_flushes_partial_batch() {
        let recorder = Arc::new(Recorder::default());
        let buffer = buffer(1000, Duration::from_millis(5), false);
        buffer.set_observer(recorder.clone());

        let start = Instant::now();
        let (completer, completion) = Completer::channel();
        buffer.add_bytes(b"abc", false, completer).unwrap();
        completion.wait().unwrap();

        assert!(start.elapsed() >= Duration::from_millis(5));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(recorder.data_flushes(), vec![(b"abc".to_vec(), false)]);
    }

    #[test]
    fn sync_request_flushes_without_waiting_for_window() {
        let recorder = Arc::new(Recorder::default());
        let buffer = buffer(1000, Duration::from_secs(60), true);
        buffer.set_observer(recorder.clone());

        let (completer, completion) = Completer::channel();
        buffer.add_bytes(b"sync", true, completer).unwrap();
        assert!(completion.wait_timeout(Duration::from_secs(10)).is_some());
        assert_eq!(recorder.data_flushes(), vec![(b"sync".to_vec(), true)]);
    }

    #[test]
    fn sync_waits_for_window_without_flush_on_sync() {
        let recorder = Arc::new(Recorder::default());
        let buffer = buffer(1000, Duration::from_millis(200), false);
        buffer.set_observer(recorder.clone());

        let (c1, w1) = Completer::channel();
        let (c2, w2) = Completer::channel();
        buffer.add_bytes(b"a", true, c1).unwrap();
        buffer.add_bytes(b"b", true, c2).unwrap();
        w1.wait().unwrap();
        w2.wait().unwrap();

        // Both sync appends share one forced write
        assert_eq!(recorder.data_flushes(), vec![(b"ab".to_vec(), true)]);
    }

    #[test]
    fn check_size_seals_when_append_would_not_fit() {
        let recorder = Arc::new(Recorder::default());
        let buffer = buffer(100, Duration::from_secs(60), true);
        buffer.set_observer(recorder.clone());

        buffer
            .add_bytes(&[1; 60], false, Completer::detached(None))
            .unwrap();
        buffer.check_size(50).unwrap();
        buffer
            .add_bytes(&[2; 50], false, Completer::detached(None))
            .unwrap();
        buffer.flush_and_wait(false).unwrap();

        let flushes = recorder.data_flushes();
        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[0].0, vec![1; 60]);
        assert_eq!(flushes[1].0, vec![2; 50]);
    }

    #[test]
    fn oversized_append_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let buffer = buffer(16, Duration::from_secs(60), true);
        buffer.set_observer(recorder);

        let err = buffer
            .add_bytes(&[0; 17], false, Completer::detached(None))
            .unwrap_err();
        assert!(matches!(err, CoreError::RecordTooLarge { size: 17, max: 16 }));
    }

    #[test]
    fn failure_reaches_every_completer() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let buffer = buffer(1000, Duration::from_secs(60), true);
        buffer.set_observer(recorder);

        let (c1, w1) = Completer::channel();
        let (c2, w2) = Completer::channel();
        buffer.add_bytes(b"one", false, c1).unwrap();
        buffer.add_bytes(b"two", true, c2).unwrap();

        assert!(matches!(w1.wait(), Err(CoreError::WriteFailed { code: 5, .. })));
        assert!(matches!(w2.wait(), Err(CoreError::WriteFailed { code: 5, .. })));
    }

    #[test]
    fn detached_failure_goes_to_listener() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let buffer = buffer(1000, Duration::from_secs(60), true);
        buffer.set_observer(recorder);

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        let listener: FailureListener = Arc::new(move |_err| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        buffer
            .add_bytes(b"lost", false, Completer::detached(Some(listener)))
            .unwrap();
        let _ = buffer.flush_and_wait(false);

        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_completer_runs() {
        let recorder = Arc::new(Recorder::default());
        let buffer = buffer(1000, Duration::from_secs(60), true);
        buffer.set_observer(recorder);

        let (tx, rx) = channel::bounded(1);
        let completer = Completer::callback(move |result| {
            tx.send(result.is_ok()).unwrap();
        });
        buffer.add_bytes(b"cb", true, completer).unwrap();
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn observer_change_seals_previous_batch_with_force() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let buffer = buffer(1000, Duration::from_secs(60), false);
        buffer.set_observer(first.clone());

        buffer
            .add_bytes(b"old", false, Completer::detached(None))
            .unwrap();
        buffer.set_observer(second.clone());
        buffer
            .add_bytes(b"new", false, Completer::detached(None))
            .unwrap();
        buffer.flush_and_wait(false).unwrap();

        assert_eq!(first.data_flushes(), vec![(b"old".to_vec(), true)]);
        assert_eq!(second.data_flushes(), vec![(b"new".to_vec(), false)]);
    }

    #[test]
    fn stop_drains_and_rejects_new_appends() {
        let recorder = Arc::new(Recorder::default());
        let buffer = buffer(1000, Duration::from_secs(60), false);
        buffer.set_observer(recorder.clone());

        let (completer, completion) = Completer::channel();
        buffer.add_bytes(b"tail", false, completer).unwrap();
        buffer.stop();

        completion.wait().unwrap();
        assert_eq!(recorder.data_flushes(), vec![(b"tail".to_vec(), false)]);
        assert!(matches!(
            buffer.add_bytes(b"late", false, Completer::detached(None)),
            Err(CoreError::NotStarted)
        ));
    }

    #[test]
    fn dropped_completer_reports_error() {
        let (completer, completion) = Completer::channel();
        drop(completer);
        assert!(completion.wait().is_err());
    }
}
