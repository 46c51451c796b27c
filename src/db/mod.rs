//! The DB coordinator: commit sequencing, async WAL writing, background
//! snapshot rewriting, retention, rollback, and the exclusive-writer lock.
//!
//! Concurrency model:
//! - All public operations serialize on one mutex; the committing thread is
//!   the sole entry point for tree mutation.
//! - Two background activities exist per instance: the async WAL writer
//!   (long-lived, see [`crate::wal::writer`]) and at most one snapshot
//!   rewriter (one thread per rewrite). Their results are polled
//!   non-blockingly from the commit path.
//! - Snapshot pruning runs on short-lived threads serialized by a dedicated
//!   lock so commits never wait on filesystem removal.

mod options;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use parking_lot::Mutex;
use tracing::{error, info};

pub use options::{Options, StateSyncExport};
pub(crate) use options::DEFAULT_SNAPSHOT_WRITER_LIMIT;

use crate::changeset::{ChangeSet, NamedChangeSet, TreeNameUpgrade, WalData};
use crate::error::{DbError, Result};
use crate::lock::FileLock;
use crate::path::{
    atomic_remove_dir, current_path, current_version, first_snapshot_version, remove_tmp_dirs,
    seek_snapshot, snapshot_name, traverse_snapshots, update_current_symlink, wal_path,
    LOCK_FILE_NAME, METADATA_FILE_NAME, TMP_SUFFIX,
};
use crate::tree::multi::{read_metadata, CommitInfo, MultiTree};
use crate::tree::Tree;
use crate::wal::writer::{AsyncWriter, WalEntry};
use crate::wal::{wal_index, wal_version, Wal, WalBatch, WalOptions};

/// Versioned multi-tree database over one directory.
///
/// Created by [`Db::load`]; at most one writer per directory, any number of
/// read-only handles.
pub struct Db {
    inner: Mutex<DbInner>,
}

struct DbInner {
    dir: PathBuf,
    mtree: MultiTree,
    file_lock: Option<FileLock>,
    read_only: bool,
    closed: bool,

    wal: Option<Arc<Wal>>,
    /// Async queue capacity; negative forces synchronous writes.
    wal_buffer: isize,
    writer: Option<AsyncWriter>,
    /// Reusable batch for the synchronous write path.
    wbatch: WalBatch,

    /// In-flight background rewrite, at most one.
    rewrite: Option<RewriteTask>,

    snapshot_keep_recent: u32,
    snapshot_interval: u32,
    trigger_state_sync_export: Option<StateSyncExport>,

    /// Uncommitted changes for the version being built.
    pending_log: WalData,

    /// Serializes prune runs with each other and with close.
    prune_lock: Arc<Mutex<()>>,
    prune_handles: Vec<JoinHandle<()>>,

    pool: Arc<rayon::ThreadPool>,
    zero_copy: bool,
    cache_size: usize,
}

struct RewriteTask {
    result_rx: Receiver<Result<MultiTree>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Db {
    /// Open the database at `dir`.
    pub fn load(dir: impl AsRef<Path>, mut opts: Options) -> Result<Db> {
        let dir = dir.as_ref().to_path_buf();
        opts.validate()?;
        opts.fill_defaults();

        if opts.create_if_missing {
            create_db_if_not_exist(&dir, opts.initial_version)?;
        }

        let mut file_lock = None;
        if !opts.read_only {
            file_lock = Some(FileLock::lock(dir.join(LOCK_FILE_NAME))?);
            // leftovers from an interrupted rewrite or symlink swap
            remove_tmp_dirs(&dir)?;
        }

        let snapshot = if opts.target_version == 0 {
            "current".to_string()
        } else {
            snapshot_name(seek_snapshot(&dir, opts.target_version)?)
        };

        let mut mtree = MultiTree::load(&dir.join(&snapshot), opts.zero_copy, opts.cache_size)?;
        let wal = Arc::new(Wal::open(wal_path(&dir), WalOptions::default())?);

        if opts.target_version == 0 || opts.target_version > mtree.version() {
            mtree.catchup_wal(&wal, opts.target_version)?;
        }

        if opts.load_for_overwriting && opts.target_version > 0 {
            let current = std::fs::read_link(current_path(&dir))?;
            if current.as_os_str() != snapshot.as_str() {
                info!(snapshot = %snapshot, "downgrade current link");
                update_current_symlink(&dir, &snapshot)?;
            }

            info!(version = opts.target_version, "truncate wal from back");
            wal.truncate_back(wal_index(opts.target_version, mtree.initial_version()))?;

            let target = opts.target_version;
            traverse_snapshots(&dir, false, |version| {
                if version <= target {
                    return Ok(true);
                }
                match atomic_remove_dir(&dir.join(snapshot_name(version))) {
                    Ok(()) => info!(version, "prune snapshot"),
                    Err(err) => error!(version, error = %err, "fail to prune snapshot"),
                }
                Ok(false)
            })?;
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(opts.snapshot_writer_limit)
            .build()
            .map_err(|err| DbError::invalid(err.to_string()))?;

        let db = Db {
            inner: Mutex::new(DbInner {
                dir,
                mtree,
                file_lock,
                read_only: opts.read_only,
                closed: false,
                wal: Some(wal),
                wal_buffer: opts.async_commit_buffer,
                writer: None,
                wbatch: WalBatch::default(),
                rewrite: None,
                snapshot_keep_recent: opts.snapshot_keep_recent,
                snapshot_interval: opts.snapshot_interval,
                trigger_state_sync_export: opts.trigger_state_sync_export.clone(),
                pending_log: WalData::default(),
                prune_lock: Arc::new(Mutex::new(())),
                prune_handles: Vec::new(),
                pool: Arc::new(pool),
                zero_copy: opts.zero_copy,
                cache_size: opts.cache_size,
            }),
        };

        if !opts.read_only && db.version() == 0 && !opts.initial_stores.is_empty() {
            let upgrades: Vec<TreeNameUpgrade> = opts
                .initial_stores
                .iter()
                .map(|name| TreeNameUpgrade::add(name.as_str()))
                .collect();
            if let Err(err) = db.apply_upgrades(&upgrades) {
                let _ = db.close();
                return Err(err);
            }
        }

        Ok(db)
    }

    pub fn read_only(&self) -> bool {
        self.inner.lock().read_only
    }

    /// Record tree add/rename/delete upgrades in this block.
    pub fn apply_upgrades(&self, upgrades: &[TreeNameUpgrade]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_mutable()?;
        inner.mtree.apply_upgrades(upgrades)?;
        inner.pending_log.upgrades.extend_from_slice(upgrades);
        Ok(())
    }

    /// Apply changesets for this block; merged into the pending log per
    /// store. Empty changesets are no-ops.
    pub fn apply_change_sets(&self, changesets: &[NamedChangeSet]) -> Result<()> {
        if changesets.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.check_mutable()?;
        for cs in changesets {
            inner.apply_change_set(&cs.name, &cs.changeset)?;
        }
        Ok(())
    }

    pub fn apply_change_set(&self, name: &str, changeset: ChangeSet) -> Result<()> {
        if changeset.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.check_mutable()?;
        inner.apply_change_set(name, &changeset)
    }

    /// Set the version the first commit will carry.
    ///
    /// Rewrites the empty on-disk snapshot synchronously: the WAL cannot
    /// record this change because the version-to-index mapping depends on it.
    pub fn set_initial_version(&self, initial_version: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_mutable()?;
        if inner.mtree.last_commit_info().version > 0 {
            return Err(DbError::AlreadyCommitted);
        }
        inner.mtree.set_initial_version(initial_version)?;
        init_empty_db(&inner.dir, initial_version)
    }

    /// Commit the accumulated changes as the next version.
    pub fn commit(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.check_mutable()?;

        let version = inner.mtree.save_version(true);

        if let Some(wal) = inner.wal.clone() {
            let index = wal_index(version, inner.mtree.initial_version());
            if inner.wal_buffer >= 0 && inner.writer.is_none() {
                inner.writer = Some(AsyncWriter::spawn(wal.clone(), inner.wal_buffer as usize)?);
            }
            let data = std::mem::take(&mut inner.pending_log);

            if inner.wal_buffer >= 0 {
                // blocks while the buffer is full: intended backpressure
                let sent = inner
                    .writer
                    .as_ref()
                    .expect("writer started")
                    .send(WalEntry { index, data });
                if let Err(entry) = sent {
                    // send only fails when the writer died; surface its error
                    let err = inner
                        .writer
                        .as_ref()
                        .expect("writer started")
                        .check()
                        .err()
                        .unwrap_or_else(|| {
                            DbError::AsyncWalFailed(Box::new(DbError::wal(
                                "writer rejected entry",
                            )))
                        });
                    inner.pending_log = entry.data;
                    return Err(err);
                }
            } else {
                let last_index = wal.last_index();
                inner.wbatch.clear();
                let entry = WalEntry { index, data };
                if let Err(err) =
                    crate::wal::writer::append_entry(&mut inner.wbatch, last_index, &entry)
                {
                    inner.pending_log = entry.data;
                    return Err(err);
                }
                if let Err(err) = wal.write_batch(&inner.wbatch) {
                    inner.pending_log = entry.data;
                    return Err(err);
                }
            }
        } else {
            inner.pending_log = WalData::default();
        }

        inner.check_async_tasks()?;
        inner.rewrite_if_applicable(version);

        Ok(version)
    }

    /// Drain the async writer and surface any terminal error. The next async
    /// commit starts a fresh writer.
    pub fn wait_async_commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.wait_async_commit()
    }

    /// Rewrite the current version into a snapshot synchronously and swap the
    /// `current` symlink.
    pub fn rewrite_snapshot(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.check_mutable()?;
        write_snapshot_and_swap(
            &inner.dir,
            &inner.mtree,
            &inner.pool,
            &Arc::new(AtomicBool::new(false)),
        )
    }

    /// Start a background snapshot rewrite; the next commit (or close)
    /// observes completion and swaps to the rewritten snapshot.
    pub fn rewrite_snapshot_background(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_mutable()?;
        inner.rewrite_snapshot_background()
    }

    /// Rebind the in-memory state from the `current` snapshot, preserving
    /// uncommitted changes.
    pub fn reload(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let mtree = MultiTree::load(
            &current_path(&inner.dir),
            inner.zero_copy,
            inner.cache_size,
        )?;
        inner.reload_multitree(mtree)
    }

    /// Detached clone of the in-memory state: no WAL, no file lock. Suitable
    /// as an immutable query handle or rewriter input.
    pub fn copy(&self) -> Db {
        let inner = self.inner.lock();
        let cache_size = inner.cache_size;
        Db {
            inner: Mutex::new(DbInner {
                dir: inner.dir.clone(),
                mtree: inner.mtree.copy(cache_size),
                file_lock: None,
                read_only: inner.read_only,
                closed: false,
                wal: None,
                wal_buffer: -1,
                writer: None,
                wbatch: WalBatch::default(),
                rewrite: None,
                snapshot_keep_recent: inner.snapshot_keep_recent,
                snapshot_interval: inner.snapshot_interval,
                trigger_state_sync_export: None,
                pending_log: WalData::default(),
                prune_lock: Arc::new(Mutex::new(())),
                prune_handles: Vec::new(),
                pool: inner.pool.clone(),
                zero_copy: inner.zero_copy,
                cache_size,
            }),
        }
    }

    /// Shut down: drain the writer, settle any rewrite, close the WAL, and
    /// release the file lock. Returns the first error, logging the rest.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.close()
    }

    // read accessors

    pub fn tree_by_name(&self, name: &str) -> Option<Tree> {
        let inner = self.inner.lock();
        inner
            .mtree
            .tree_by_name(name)
            .map(|tree| tree.copy(inner.cache_size))
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().mtree.version()
    }

    pub fn last_commit_info(&self) -> CommitInfo {
        self.inner.lock().mtree.last_commit_info().clone()
    }

    pub fn working_commit_info(&self) -> CommitInfo {
        self.inner.lock().mtree.working_commit_info()
    }

    /// Root hash of the last committed version.
    pub fn root_hash(&self) -> [u8; 32] {
        self.inner.lock().mtree.root_hash()
    }

    /// Version of the base snapshot backing the in-memory state.
    pub fn snapshot_version(&self) -> u64 {
        self.inner.lock().mtree.snapshot_version()
    }

    /// Latest version recorded in the WAL, or the snapshot version when the
    /// WAL is empty.
    pub fn committed_version(&self) -> Result<u64> {
        let inner = self.inner.lock();
        inner.committed_version()
    }

    /// Advance the version without touching the WAL; for state machines that
    /// manage commit info themselves.
    pub fn save_version(&self, update_commit_info: bool) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.check_mutable()?;
        Ok(inner.mtree.save_version(update_commit_info))
    }

    pub fn update_commit_info(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_mutable()?;
        inner.mtree.update_commit_info();
        Ok(())
    }

    /// Export the committed state into an arbitrary directory.
    pub fn write_snapshot(&self, dir: impl AsRef<Path>) -> Result<()> {
        let inner = self.inner.lock();
        inner.mtree.write_snapshot(
            dir.as_ref(),
            &inner.pool,
            &Arc::new(AtomicBool::new(false)),
        )
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            if let Err(err) = inner.close() {
                error!(error = %err, "error closing db on drop");
            }
        }
    }
}

impl DbInner {
    fn check_mutable(&self) -> Result<()> {
        if self.read_only {
            return Err(DbError::ReadOnly);
        }
        if self.closed {
            return Err(DbError::invalid("db is closed"));
        }
        Ok(())
    }

    fn apply_change_set(&mut self, name: &str, changeset: &ChangeSet) -> Result<()> {
        if changeset.is_empty() {
            return Ok(());
        }
        self.mtree.apply_change_set(name, changeset)?;
        self.pending_log.merge_changeset(name, changeset.clone());
        Ok(())
    }

    fn committed_version(&self) -> Result<u64> {
        let Some(wal) = &self.wal else {
            return Ok(self.mtree.snapshot_version());
        };
        let last_index = wal.last_index();
        if last_index == 0 {
            return Ok(self.mtree.snapshot_version());
        }
        Ok(wal_version(last_index, self.mtree.initial_version()))
    }

    /// Non-blocking poll of both background activities.
    fn check_async_tasks(&mut self) -> Result<()> {
        self.check_async_commit()?;
        self.check_background_snapshot_rewrite()
    }

    fn check_async_commit(&self) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.check(),
            None => Ok(()),
        }
    }

    fn check_background_snapshot_rewrite(&mut self) -> Result<()> {
        let Some(task) = &self.rewrite else {
            return Ok(());
        };
        match task.result_rx.try_recv() {
            Err(TryRecvError::Empty) => Ok(()),
            Err(TryRecvError::Disconnected) => {
                // rewrite failed or was cancelled without a result; the
                // previous snapshot stays in service
                self.clear_rewrite();
                Ok(())
            }
            Ok(Err(err)) => {
                self.clear_rewrite();
                Err(err)
            }
            Ok(Ok(fresh)) => {
                self.clear_rewrite();
                self.finish_rewrite(fresh)
            }
        }
    }

    fn clear_rewrite(&mut self) {
        if let Some(mut task) = self.rewrite.take() {
            if let Some(handle) = task.handle.take() {
                let _ = handle.join();
            }
        }
    }

    /// Bring the freshly rewritten tree up to the live version and swap it in.
    fn finish_rewrite(&mut self, mut fresh: MultiTree) -> Result<()> {
        // barrier: the async writer must have drained up to the live version
        // before the fresh tree can catch up to the same point
        if let Some(writer) = &self.writer {
            let version = self.mtree.version();
            if version > 0 {
                writer
                    .watermark()
                    .wait_for(wal_index(version, self.mtree.initial_version()));
            }
        }

        let wal = self
            .wal
            .clone()
            .ok_or_else(|| DbError::invalid("wal is closed"))?;
        fresh.catchup_wal(&wal, 0)?;
        self.reload_multitree(fresh)?;
        info!(version = self.mtree.version(), "switched to new snapshot");

        self.prune_snapshots();

        if let Some(callback) = &self.trigger_state_sync_export {
            callback(self.mtree.snapshot_version());
        }
        Ok(())
    }

    fn reload_multitree(&mut self, mtree: MultiTree) -> Result<()> {
        self.mtree = mtree;
        // restore uncommitted in-flight work
        self.mtree.apply_wal_data(&self.pending_log)
    }

    fn rewrite_if_applicable(&mut self, version: u64) {
        if version % self.snapshot_interval as u64 != 0 {
            return;
        }
        if let Err(err) = self.rewrite_snapshot_background() {
            error!(error = %err, "failed to rewrite snapshot in background");
        }
    }

    fn rewrite_snapshot_background(&mut self) -> Result<()> {
        if self.rewrite.is_some() {
            return Err(DbError::RewriteInProgress);
        }
        let Some(wal) = self.wal.clone() else {
            return Err(DbError::invalid("wal is closed"));
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = bounded::<Result<MultiTree>>(1);

        let cloned = self.mtree.copy(0);
        let dir = self.dir.clone();
        let pool = self.pool.clone();
        let zero_copy = self.zero_copy;
        let thread_cancel = cancel.clone();

        let handle = std::thread::Builder::new()
            .name("snapdb-rewrite".to_string())
            .spawn(move || {
                let version = cloned.version();
                info!(version, "start rewriting snapshot");
                if let Err(err) = write_snapshot_and_swap(&dir, &cloned, &pool, &thread_cancel) {
                    // not fatal: the db keeps operating from the previous
                    // snapshot plus the wal
                    error!(error = %err, "failed to rewrite snapshot");
                    return;
                }
                info!(version, "finished rewriting snapshot");

                let mut fresh = match MultiTree::load(&current_path(&dir), zero_copy, 0) {
                    Ok(mtree) => mtree,
                    Err(err) => {
                        let _ = result_tx.send(Err(err));
                        return;
                    }
                };
                // best effort; the final catchup happens on the commit thread
                if let Err(err) = fresh.catchup_wal(&wal, 0) {
                    let _ = result_tx.send(Err(err));
                    return;
                }
                info!(
                    live = version,
                    fresh = fresh.version(),
                    "finished best-effort wal catchup"
                );
                let _ = result_tx.send(Ok(fresh));
            })?;

        self.rewrite = Some(RewriteTask {
            result_rx,
            cancel,
            handle: Some(handle),
        });
        Ok(())
    }

    /// Remove old snapshots and truncate the WAL prefix, asynchronously.
    fn prune_snapshots(&mut self) {
        self.prune_handles.retain(|handle| !handle.is_finished());

        let dir = self.dir.clone();
        let keep_recent = self.snapshot_keep_recent;
        let wal = self.wal.clone();
        let initial_version = self.mtree.initial_version();
        let lock = self.prune_lock.clone();

        let spawned = std::thread::Builder::new()
            .name("snapdb-prune".to_string())
            .spawn(move || {
                let _guard = lock.lock();

                let current = match current_version(&dir) {
                    Ok(version) => version,
                    Err(err) => {
                        error!(error = %err, "failed to read current snapshot version");
                        return;
                    }
                };

                let mut counter = keep_recent;
                let walk = traverse_snapshots(&dir, false, |version| {
                    if version >= current {
                        // newer directories can belong to an ongoing rewrite
                        return Ok(false);
                    }
                    if counter > 0 {
                        counter -= 1;
                        return Ok(false);
                    }
                    let name = snapshot_name(version);
                    info!(name = %name, "prune snapshot");
                    if let Err(err) = atomic_remove_dir(&dir.join(&name)) {
                        error!(error = %err, "failed to prune snapshot");
                    }
                    Ok(false)
                });
                if let Err(err) = walk {
                    error!(error = %err, "fail to prune snapshots");
                    return;
                }

                // entries preceding the earliest surviving snapshot are never
                // needed for catchup
                let earliest = match first_snapshot_version(&dir) {
                    Ok(version) => version,
                    Err(err) => {
                        error!(error = %err, "failed to find first snapshot");
                        return;
                    }
                };
                if let Some(wal) = wal {
                    if let Err(err) = wal.truncate_front(wal_index(earliest + 1, initial_version))
                    {
                        error!(error = %err, version = earliest + 1, "failed to truncate wal");
                    }
                }
            });

        match spawned {
            Ok(handle) => self.prune_handles.push(handle),
            Err(err) => error!(error = %err, "failed to spawn prune thread"),
        }
    }

    fn wait_async_commit(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(writer) => writer.close(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut errs: Vec<DbError> = Vec::new();

        if let Err(err) = self.wait_async_commit() {
            errs.push(err);
        }

        if let Some(task) = self.rewrite.take() {
            match task.result_rx.try_recv() {
                Ok(Ok(fresh)) => {
                    // completed but not yet reaped; finish the swap so the
                    // on-disk retention state settles
                    if let Err(err) = self.finish_rewrite(fresh) {
                        errs.push(err);
                    }
                }
                Ok(Err(err)) => errs.push(err),
                Err(TryRecvError::Empty) => {
                    task.cancel.store(true, Ordering::Relaxed);
                    let _ = task.result_rx.recv();
                }
                Err(TryRecvError::Disconnected) => {}
            }
            if let Some(handle) = task.handle {
                let _ = handle.join();
            }
        }

        // let in-flight prunes settle before the wal goes away
        for handle in self.prune_handles.drain(..) {
            let _ = handle.join();
        }

        if let Some(wal) = self.wal.take() {
            if let Err(err) = wal.close() {
                errs.push(err);
            }
        }

        if let Some(file_lock) = self.file_lock.take() {
            if let Err(err) = file_lock.unlock() {
                errs.push(err);
            }
            if let Err(err) = file_lock.destroy() {
                errs.push(err);
            }
        }

        self.closed = true;

        let mut iter = errs.into_iter();
        match iter.next() {
            None => Ok(()),
            Some(first) => {
                for err in iter {
                    error!(error = %err, "additional error during close");
                }
                Err(first)
            }
        }
    }
}

/// Write `mtree` into `snapshot-<version>` via a tmp directory, then swap the
/// `current` symlink. The tmp directory is removed on failure.
fn write_snapshot_and_swap(
    dir: &Path,
    mtree: &MultiTree,
    pool: &rayon::ThreadPool,
    cancel: &Arc<AtomicBool>,
) -> Result<()> {
    let snapshot = snapshot_name(mtree.version());
    let tmp = dir.join(format!("{snapshot}{TMP_SUFFIX}"));
    if let Err(err) = mtree.write_snapshot(&tmp, pool, cancel) {
        let _ = std::fs::remove_dir_all(&tmp);
        return Err(err);
    }
    std::fs::rename(&tmp, dir.join(&snapshot))?;
    update_current_symlink(dir, &snapshot)
}

/// Initialize the empty db image: `snapshot-0` plus the `current` symlink.
fn init_empty_db(dir: &Path, initial_version: u64) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mtree = MultiTree::empty(initial_version, 0);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(DEFAULT_SNAPSHOT_WRITER_LIMIT)
        .build()
        .map_err(|err| DbError::invalid(err.to_string()))?;

    let snapshot = snapshot_name(0);
    mtree.write_snapshot(
        &dir.join(&snapshot),
        &pool,
        &Arc::new(AtomicBool::new(false)),
    )?;
    update_current_symlink(dir, &snapshot)
}

/// Detect a missing db and initialize an empty one.
fn create_db_if_not_exist(dir: &Path, initial_version: u64) -> Result<()> {
    if dir.join("current").join(METADATA_FILE_NAME).exists() {
        return Ok(());
    }
    init_empty_db(dir, initial_version)
}

/// Latest version of the db at `dir` without loading it: the WAL tail, or
/// the metadata version when the WAL is empty. Returns 0 when no db exists.
///
/// Takes no lock and never mutates, so external tooling can inspect a
/// directory while a writer owns it.
pub fn get_latest_version(dir: impl AsRef<Path>) -> Result<u64> {
    let dir = dir.as_ref();
    let metadata = match read_metadata(&current_path(dir)) {
        Ok(metadata) => metadata,
        Err(DbError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    let wal = Wal::open(wal_path(dir), WalOptions::default())?;
    let last_index = wal.last_index();
    if last_index == 0 {
        return Ok(metadata.commit_info.version);
    }
    Ok(wal_version(last_index, metadata.initial_version))
}
