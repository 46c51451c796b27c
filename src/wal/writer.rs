//! Background WAL writer: drains a bounded channel of pending entries and
//! batches them into the log.
//!
//! One writer per DB, lazily started at the first async commit and stopped by
//! `wait_async_commit`/`close`. A full channel blocks the committing thread;
//! that is the backpressure mechanism, not a bug.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::changeset::WalData;
use crate::error::{DbError, Result};
use crate::wal::{Wal, WalBatch};

/// One queued commit.
#[derive(Debug)]
pub(crate) struct WalEntry {
    pub index: u64,
    pub data: WalData,
}

/// Serialize `entry` into `batch`, unless the log already covers its index.
///
/// Replays at startup can re-submit an index the log has seen; those are
/// dropped with a warning instead of corrupting the sequence.
pub(crate) fn append_entry(batch: &mut WalBatch, last_index: u64, entry: &WalEntry) -> Result<()> {
    if entry.index <= last_index {
        warn!(
            last_index,
            index = entry.index,
            "commit old version idempotently"
        );
        return Ok(());
    }
    batch.write(entry.index, bincode::serialize(&entry.data)?);
    Ok(())
}

/// Highest WAL index the writer has durably handed to the log.
///
/// The rewrite reap blocks on this instead of busy-waiting for the drain.
#[derive(Debug)]
pub(crate) struct Watermark {
    index: Mutex<u64>,
    cond: Condvar,
}

impl Watermark {
    fn new(index: u64) -> Self {
        Self {
            index: Mutex::new(index),
            cond: Condvar::new(),
        }
    }

    fn advance(&self, index: u64) {
        let mut current = self.index.lock();
        if index > *current {
            *current = index;
            self.cond.notify_all();
        }
    }

    pub(crate) fn wait_for(&self, index: u64) {
        let mut current = self.index.lock();
        while *current < index {
            self.cond.wait(&mut current);
        }
    }
}

pub(crate) struct AsyncWriter {
    work_tx: Sender<WalEntry>,
    quit_rx: Receiver<DbError>,
    watermark: Arc<Watermark>,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for AsyncWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncWriter").finish_non_exhaustive()
    }
}

impl AsyncWriter {
    /// Spawn the writer task. `buffer` is the channel capacity; 0 makes every
    /// send rendezvous with the writer.
    pub(crate) fn spawn(wal: Arc<Wal>, buffer: usize) -> Result<AsyncWriter> {
        let (work_tx, work_rx) = bounded::<WalEntry>(buffer);
        let (quit_tx, quit_rx) = bounded::<DbError>(1);
        let watermark = Arc::new(Watermark::new(wal.last_index()));
        let mark = watermark.clone();

        let handle = std::thread::Builder::new()
            .name("snapdb-wal-writer".to_string())
            .spawn(move || {
                let mut batch = WalBatch::default();
                loop {
                    // Block for one entry, then drain whatever else is queued
                    // so the batch size adapts to producer pressure.
                    let Ok(first) = work_rx.recv() else {
                        return; // channel closed, clean exit
                    };
                    let mut entries = vec![first];
                    while let Ok(more) = work_rx.try_recv() {
                        entries.push(more);
                    }

                    let last_index = wal.last_index();
                    batch.clear();
                    let mut max_index = last_index;
                    for entry in &entries {
                        if let Err(err) = append_entry(&mut batch, last_index, entry) {
                            let _ = quit_tx.send(err);
                            return;
                        }
                        max_index = max_index.max(entry.index);
                    }
                    if let Err(err) = wal.write_batch(&batch) {
                        let _ = quit_tx.send(err);
                        return;
                    }
                    mark.advance(max_index);
                }
            })?;

        Ok(AsyncWriter {
            work_tx,
            quit_rx,
            watermark,
            handle,
        })
    }

    /// Submit one entry, blocking while the buffer is full.
    ///
    /// Fails only when the writer already died; the caller should surface the
    /// terminal error from [`AsyncWriter::check`] or [`AsyncWriter::close`].
    pub(crate) fn send(&self, entry: WalEntry) -> std::result::Result<(), WalEntry> {
        self.work_tx.send(entry).map_err(|err| err.0)
    }

    pub(crate) fn watermark(&self) -> &Arc<Watermark> {
        &self.watermark
    }

    /// Non-blocking health check: surfaces the writer's terminal error.
    pub(crate) fn check(&self) -> Result<()> {
        match self.quit_rx.try_recv() {
            Ok(err) => Err(DbError::AsyncWalFailed(Box::new(err))),
            Err(TryRecvError::Empty) => Ok(()),
            Err(TryRecvError::Disconnected) => Err(DbError::AsyncWalFailed(Box::new(
                DbError::wal("writer thread terminated unexpectedly"),
            ))),
        }
    }

    /// Close the work channel, wait for the writer to drain and exit, and
    /// surface its terminal error if any.
    pub(crate) fn close(self) -> Result<()> {
        drop(self.work_tx);
        let result = match self.quit_rx.recv() {
            Ok(err) => Err(DbError::AsyncWalFailed(Box::new(err))),
            Err(_) => Ok(()), // clean exit
        };
        if self.handle.join().is_err() {
            return Err(DbError::AsyncWalFailed(Box::new(DbError::wal(
                "writer thread panicked",
            ))));
        }
        result
    }
}
