//! Asynchronous (AIO) backend.
//!
//! Writes are executed by a small pool of I/O threads. At most `max_io`
//! requests may be outstanding per factory; submitting beyond that blocks
//! the submitter until a completion frees a slot, which throttles
//! appenders without turning exhaustion into an error.
//!
//! Completions are delivered in submission order by a single completion
//! thread. A request submitted with `sync = true` is forced on that thread
//! once every earlier request has been written, so its successful callback
//! implies every earlier write to the same file is durable too.

use crate::backend::{BackendKind, IoCallback, SequentialFile, SequentialFileFactory};
use crate::error::{StorageError, StorageResult};
use crate::file::{
    delete_disk_file, list_with_extension, read_control_file, remove_control_file,
    write_control_file, DiskFile,
};
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Upper bound on I/O worker threads per factory.
const MAX_IO_THREADS: usize = 4;

struct WriteRequest {
    seq: u64,
    file: Arc<DiskFile>,
    offset: u64,
    data: Bytes,
    sync: bool,
    callback: IoCallback,
}

struct Completed {
    request: WriteRequest,
    result: StorageResult<()>,
}

/// Outstanding request accounting shared with the completion thread.
#[derive(Debug, Default)]
struct Slots {
    outstanding: Mutex<usize>,
    freed: Condvar,
}

impl Slots {
    fn acquire(&self, max: usize) {
        let mut outstanding = self.outstanding.lock();
        while *outstanding >= max {
            self.freed.wait(&mut outstanding);
        }
        *outstanding += 1;
    }

    fn release(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        self.freed.notify_one();
    }

    fn current(&self) -> usize {
        *self.outstanding.lock()
    }
}

struct Submitter {
    next_seq: u64,
    sender: Option<Sender<WriteRequest>>,
}

/// The I/O thread pool behind an [`AioFileFactory`].
pub(crate) struct AioExecutor {
    max_io: usize,
    slots: Arc<Slots>,
    submitter: Mutex<Submitter>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for AioExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AioExecutor")
            .field("max_io", &self.max_io)
            .field("outstanding", &self.slots.current())
            .finish()
    }
}

impl AioExecutor {
    fn start(max_io: usize) -> StorageResult<Self> {
        let max_io = max_io.max(1);
        let (request_tx, request_rx) = channel::unbounded::<WriteRequest>();
        let (done_tx, done_rx) = channel::unbounded::<Completed>();
        let slots = Arc::new(Slots::default());

        let mut threads = Vec::new();
        for i in 0..max_io.min(MAX_IO_THREADS) {
            let rx = request_rx.clone();
            let tx = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("mqj-aio-worker-{i}"))
                .spawn(move || worker_loop(&rx, &tx))?;
            threads.push(handle);
        }
        drop(done_tx);

        let completion_slots = Arc::clone(&slots);
        let handle = thread::Builder::new()
            .name("mqj-aio-completion".to_string())
            .spawn(move || completion_loop(&done_rx, &completion_slots))?;
        threads.push(handle);

        tracing::debug!(max_io, "started AIO executor");

        Ok(Self {
            max_io,
            slots,
            submitter: Mutex::new(Submitter {
                next_seq: 0,
                sender: Some(request_tx),
            }),
            threads: Mutex::new(threads),
        })
    }

    fn submit(
        &self,
        file: Arc<DiskFile>,
        offset: u64,
        data: Bytes,
        sync: bool,
        callback: IoCallback,
    ) {
        self.slots.acquire(self.max_io);

        let mut submitter = self.submitter.lock();
        let seq = submitter.next_seq;
        let Some(sender) = submitter.sender.as_ref() else {
            drop(submitter);
            self.slots.release();
            callback(Err(StorageError::Closed));
            return;
        };

        let request = WriteRequest {
            seq,
            file,
            offset,
            data,
            sync,
            callback,
        };
        match sender.send(request) {
            Ok(()) => submitter.next_seq += 1,
            Err(err) => {
                drop(submitter);
                self.slots.release();
                (err.into_inner().callback)(Err(StorageError::Closed));
            }
        }
    }

    fn outstanding(&self) -> usize {
        self.slots.current()
    }

    fn shutdown(&self) {
        // Dropping the sender lets the workers drain and exit
        self.submitter.lock().sender = None;

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(requests: &Receiver<WriteRequest>, done: &Sender<Completed>) {
    for request in requests.iter() {
        let result = request.file.write_now(request.offset, &request.data, false);
        if done.send(Completed { request, result }).is_err() {
            break;
        }
    }
}

fn completion_loop(done: &Receiver<Completed>, slots: &Slots) {
    let mut reorder: BTreeMap<u64, Completed> = BTreeMap::new();
    let mut next_seq = 0u64;

    for completed in done.iter() {
        reorder.insert(completed.request.seq, completed);

        while let Some(Completed { request, result }) = reorder.remove(&next_seq) {
            next_seq += 1;
            let result = match result {
                Ok(()) if request.sync => request.file.sync(),
                other => other,
            };
            if let Err(e) = &result {
                tracing::error!(file = request.file.name(), offset = request.offset, error = %e, "AIO write failed");
            }
            (request.callback)(result);
            slots.release();
        }
    }
}

/// A journal file whose writes are executed by an [`AioExecutor`].
#[derive(Debug)]
pub struct AioFile {
    disk: Arc<DiskFile>,
    executor: Arc<AioExecutor>,
}

impl SequentialFile for AioFile {
    fn name(&self) -> &str {
        self.disk.name()
    }

    fn size(&self) -> StorageResult<u64> {
        self.disk.size()
    }

    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.disk.read_at(offset, len)
    }

    fn write_at(&self, offset: u64, data: Bytes, sync: bool, callback: IoCallback) {
        self.executor
            .submit(Arc::clone(&self.disk), offset, data, sync, callback);
    }

    fn write_blocking(&self, offset: u64, data: &[u8], sync: bool) -> StorageResult<()> {
        self.disk.write_now(offset, data, sync)
    }

    fn sync(&self) -> StorageResult<()> {
        self.disk.sync()
    }

    fn reset(&self, capacity: u64) -> StorageResult<()> {
        self.disk.reset(capacity)
    }
}

/// Factory for [`AioFile`]s inside one directory.
///
/// Owns the I/O threads and the outstanding request counter; both are
/// released by [`SequentialFileFactory::shutdown`] or on drop.
#[derive(Debug)]
pub struct AioFileFactory {
    dir: PathBuf,
    executor: Arc<AioExecutor>,
}

impl AioFileFactory {
    /// Creates a factory for an existing directory with at most `max_io`
    /// outstanding writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not exist or the I/O threads
    /// cannot be spawned.
    pub fn new(dir: &Path, max_io: usize) -> StorageResult<Self> {
        if !dir.is_dir() {
            return Err(StorageError::NotFound(dir.display().to_string()));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            executor: Arc::new(AioExecutor::start(max_io)?),
        })
    }

    /// Creates a factory, creating the directory and its parents if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the I/O
    /// threads cannot be spawned.
    pub fn open_with_create_dirs(dir: &Path, max_io: usize) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        Self::new(dir, max_io)
    }

    /// Returns the directory this factory manages.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SequentialFileFactory for AioFileFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Aio
    }

    fn create_file(&self, name: &str, capacity: u64) -> StorageResult<Arc<dyn SequentialFile>> {
        let disk = DiskFile::create(&self.dir, name, capacity)?;
        Ok(Arc::new(AioFile {
            disk: Arc::new(disk),
            executor: Arc::clone(&self.executor),
        }))
    }

    fn open_file(&self, name: &str) -> StorageResult<Arc<dyn SequentialFile>> {
        let disk = DiskFile::open(&self.dir, name)?;
        Ok(Arc::new(AioFile {
            disk: Arc::new(disk),
            executor: Arc::clone(&self.executor),
        }))
    }

    fn list_files(&self, extension: &str) -> StorageResult<Vec<String>> {
        list_with_extension(&self.dir, extension)
    }

    fn delete_file(&self, name: &str) -> StorageResult<()> {
        delete_disk_file(&self.dir, name)
    }

    fn write_control(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        write_control_file(&self.dir, name, data)
    }

    fn read_control(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        read_control_file(&self.dir, name)
    }

    fn remove_control(&self, name: &str) -> StorageResult<()> {
        remove_control_file(&self.dir, name)
    }

    fn max_io(&self) -> usize {
        self.executor.max_io
    }

    fn pending_io(&self) -> usize {
        self.executor.outstanding()
    }

    fn shutdown(&self) {
        self.executor.shutdown();
    }
}

impl Drop for AioFileFactory {
    fn drop(&mut self) {
        self.executor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn completions_arrive_in_submission_order() {
        let dir = tempdir().unwrap();
        let factory = AioFileFactory::new(dir.path(), 8).unwrap();
        let file = factory.create_file("a-1.mqj", 64 * 1024).unwrap();

        let (tx, rx) = mpsc::channel();
        for i in 0..200u64 {
            let tx = tx.clone();
            file.write_at(
                i * 16,
                Bytes::from(vec![i as u8; 16]),
                i % 50 == 0,
                Box::new(move |r| tx.send((i, r.is_ok())).unwrap()),
            );
        }

        let order: Vec<_> = (0..200).map(|_| rx.recv().unwrap()).collect();
        assert!(order.iter().all(|(_, ok)| *ok));
        let ids: Vec<u64> = order.iter().map(|(i, _)| *i).collect();
        assert_eq!(ids, (0..200).collect::<Vec<_>>());
        assert_eq!(file.read_at(16 * 7, 16).unwrap(), vec![7u8; 16]);
    }

    #[test]
    fn outstanding_requests_never_exceed_max_io() {
        let dir = tempdir().unwrap();
        let factory = Arc::new(AioFileFactory::new(dir.path(), 2).unwrap());
        let file = factory.create_file("a-1.mqj", 1024 * 1024).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let monitor = {
            let factory = Arc::clone(&factory);
            let done = Arc::clone(&done);
            let max_seen = Arc::clone(&max_seen);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    max_seen.fetch_max(factory.pending_io(), Ordering::AcqRel);
                    thread::yield_now();
                }
            })
        };

        let (tx, rx) = mpsc::channel();
        for i in 0..500u64 {
            let tx = tx.clone();
            file.write_at(
                i * 512,
                Bytes::from(vec![1u8; 512]),
                false,
                Box::new(move |_| tx.send(()).unwrap()),
            );
        }
        for _ in 0..500 {
            rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        done.store(true, Ordering::Release);
        monitor.join().unwrap();

        assert!(max_seen.load(Ordering::Acquire) <= 2);
        assert_eq!(factory.pending_io(), 0);
    }

    #[test]
    fn write_after_shutdown_fails_closed() {
        let dir = tempdir().unwrap();
        let factory = AioFileFactory::new(dir.path(), 4).unwrap();
        let file = factory.create_file("a-1.mqj", 128).unwrap();

        factory.shutdown();

        let (tx, rx) = mpsc::channel();
        file.write_at(
            0,
            Bytes::from_static(b"x"),
            true,
            Box::new(move |r| tx.send(r).unwrap()),
        );
        assert!(matches!(rx.recv().unwrap(), Err(StorageError::Closed)));
        assert_eq!(factory.pending_io(), 0);
    }

    #[test]
    fn failed_write_reports_error() {
        let dir = tempdir().unwrap();
        let factory = AioFileFactory::new(dir.path(), 4).unwrap();
        let file = factory.create_file("a-1.mqj", 8).unwrap();

        let (tx, rx) = mpsc::channel();
        file.write_at(
            4,
            Bytes::from_static(b"overflowing"),
            false,
            Box::new(move |r| tx.send(r).unwrap()),
        );
        assert!(matches!(
            rx.recv().unwrap(),
            Err(StorageError::WritePastEnd { .. })
        ));
    }

    #[test]
    fn shutdown_drains_queued_writes() {
        let dir = tempdir().unwrap();
        let factory = AioFileFactory::new(dir.path(), 16).unwrap();
        let file = factory.create_file("a-1.mqj", 4096).unwrap();

        let completed = Arc::new(AtomicUsize::new(0));
        for i in 0..64u64 {
            let completed = Arc::clone(&completed);
            file.write_at(
                i * 8,
                Bytes::from(vec![2u8; 8]),
                false,
                Box::new(move |r| {
                    assert!(r.is_ok());
                    completed.fetch_add(1, Ordering::AcqRel);
                }),
            );
        }
        factory.shutdown();

        assert_eq!(completed.load(Ordering::Acquire), 64);
        assert_eq!(file.read_at(0, 512).unwrap(), vec![2u8; 512]);
    }
}
