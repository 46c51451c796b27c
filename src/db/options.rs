use std::sync::Arc;

use crate::error::{DbError, Result};

pub(crate) const DEFAULT_SNAPSHOT_INTERVAL: u32 = 1000;
pub(crate) const DEFAULT_SNAPSHOT_WRITER_LIMIT: usize = 4;

/// Callback fired after a successful background snapshot swap, with the new
/// base snapshot's version.
pub type StateSyncExport = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Options {
    /// Initialize an empty db when the directory has none.
    pub create_if_missing: bool,
    /// Version assigned to the empty state at first create.
    pub initial_version: u64,
    /// Disable all mutators; the file lock is not taken.
    pub read_only: bool,
    /// Tree names materialized at first create.
    pub initial_stores: Vec<String>,
    /// Older snapshots retained after a prune (the current one is always kept).
    pub snapshot_keep_recent: u32,
    /// Rewrite cadence in versions; 0 means the default of 1000.
    pub snapshot_interval: u32,
    pub trigger_state_sync_export: Option<StateSyncExport>,
    /// Load this version instead of the latest; 0 means latest.
    pub target_version: u64,
    /// Async commit queue capacity; -1 forces synchronous WAL writes.
    pub async_commit_buffer: isize,
    /// Tree reads may be served from mmapped snapshot files.
    pub zero_copy: bool,
    /// Per-tree read cache capacity; 0 disables the cache.
    pub cache_size: usize,
    /// Rollback mode: truncate everything after `target_version`. Does
    /// nothing when `target_version` is 0.
    pub load_for_overwriting: bool,
    /// Snapshot writer pool size; 0 means the default of 4.
    pub snapshot_writer_limit: usize,
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("create_if_missing", &self.create_if_missing)
            .field("initial_version", &self.initial_version)
            .field("read_only", &self.read_only)
            .field("initial_stores", &self.initial_stores)
            .field("snapshot_keep_recent", &self.snapshot_keep_recent)
            .field("snapshot_interval", &self.snapshot_interval)
            .field(
                "trigger_state_sync_export",
                &self.trigger_state_sync_export.is_some(),
            )
            .field("target_version", &self.target_version)
            .field("async_commit_buffer", &self.async_commit_buffer)
            .field("zero_copy", &self.zero_copy)
            .field("cache_size", &self.cache_size)
            .field("load_for_overwriting", &self.load_for_overwriting)
            .field("snapshot_writer_limit", &self.snapshot_writer_limit)
            .finish()
    }
}

impl Options {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.read_only && self.create_if_missing {
            return Err(DbError::InvalidOptions(
                "can't create db in read-only mode".to_string(),
            ));
        }
        if self.read_only && self.load_for_overwriting {
            return Err(DbError::InvalidOptions(
                "can't rollback db in read-only mode".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn fill_defaults(&mut self) {
        if self.snapshot_interval == 0 {
            self.snapshot_interval = DEFAULT_SNAPSHOT_INTERVAL;
        }
        if self.snapshot_writer_limit == 0 {
            self.snapshot_writer_limit = DEFAULT_SNAPSHOT_WRITER_LIMIT;
        }
    }
}
