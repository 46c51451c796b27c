//! Ordered collection of named trees committed together as one version.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::changeset::{ChangeSet, NamedChangeSet, TreeNameUpgrade, WalData};
use crate::error::{DbError, Result};
use crate::path::METADATA_FILE_NAME;
use crate::tree::reader::{TableReader, KVS_FILE_NAME};
use crate::tree::Tree;
use crate::wal::{wal_index, wal_version, Wal};

/// Per-store commit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub name: String,
    pub version: u64,
    pub root_hash: [u8; 32],
}

/// Commit record for one version across all stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub version: u64,
    pub store_infos: Vec<StoreInfo>,
}

impl CommitInfo {
    /// Hash over the store hashes: the app-level root hash of this version.
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for info in &self.store_infos {
            hasher.update(&(info.name.len() as u32).to_le_bytes());
            hasher.update(info.name.as_bytes());
            hasher.update(&info.root_hash);
        }
        *hasher.finalize().as_bytes()
    }
}

/// Payload of a snapshot's `metadata` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotMetadata {
    pub initial_version: u64,
    pub commit_info: CommitInfo,
}

pub(crate) fn read_metadata(snapshot_dir: &Path) -> Result<SnapshotMetadata> {
    let raw = std::fs::read(snapshot_dir.join(METADATA_FILE_NAME))?;
    Ok(bincode::deserialize(&raw)?)
}

pub struct MultiTree {
    /// Sorted by name; binary-search access.
    trees: Vec<(String, Tree)>,
    initial_version: u64,
    last_commit_info: CommitInfo,
    /// Version of the on-disk snapshot this instance was loaded from.
    snapshot_version: u64,
    zero_copy: bool,
    cache_size: usize,
}

impl std::fmt::Debug for MultiTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTree")
            .field("version", &self.last_commit_info.version)
            .field("trees", &self.trees.len())
            .finish()
    }
}

impl MultiTree {
    pub(crate) fn empty(initial_version: u64, cache_size: usize) -> Self {
        Self {
            trees: Vec::new(),
            initial_version,
            last_commit_info: CommitInfo::default(),
            snapshot_version: 0,
            zero_copy: false,
            cache_size,
        }
    }

    /// Load from a snapshot directory written by [`MultiTree::write_snapshot`].
    pub(crate) fn load(snapshot_dir: &Path, zero_copy: bool, cache_size: usize) -> Result<Self> {
        let metadata = read_metadata(snapshot_dir)?;
        let snapshot_version = metadata.commit_info.version;
        let mut trees = Vec::with_capacity(metadata.commit_info.store_infos.len());
        for info in &metadata.commit_info.store_infos {
            let table = TableReader::open(
                &snapshot_dir.join(&info.name).join(KVS_FILE_NAME),
                zero_copy,
            )?;
            trees.push((
                info.name.clone(),
                Tree::from_table(table, info.version, info.root_hash, cache_size),
            ));
        }
        Ok(Self {
            trees,
            initial_version: metadata.initial_version,
            last_commit_info: metadata.commit_info,
            snapshot_version,
            zero_copy,
            cache_size,
        })
    }

    /// Cheap structural copy; tables are shared, overlays clone.
    pub(crate) fn copy(&self, cache_size: usize) -> Self {
        Self {
            trees: self
                .trees
                .iter()
                .map(|(name, tree)| (name.clone(), tree.copy(cache_size)))
                .collect(),
            initial_version: self.initial_version,
            last_commit_info: self.last_commit_info.clone(),
            snapshot_version: self.snapshot_version,
            zero_copy: self.zero_copy,
            cache_size,
        }
    }

    pub fn version(&self) -> u64 {
        self.last_commit_info.version
    }

    pub fn initial_version(&self) -> u64 {
        self.initial_version
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    pub fn last_commit_info(&self) -> &CommitInfo {
        &self.last_commit_info
    }

    pub fn tree_by_name(&self, name: &str) -> Option<&Tree> {
        self.trees
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|pos| &self.trees[pos].1)
    }

    fn tree_mut(&mut self, name: &str) -> Option<&mut Tree> {
        self.trees
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|pos| &mut self.trees[pos].1)
    }

    /// Only valid before the first commit: the WAL index mapping is derived
    /// from it, so it cannot change once entries exist.
    pub(crate) fn set_initial_version(&mut self, initial_version: u64) -> Result<()> {
        if self.last_commit_info.version > 0 {
            return Err(DbError::AlreadyCommitted);
        }
        self.initial_version = initial_version;
        Ok(())
    }

    pub(crate) fn apply_upgrades(&mut self, upgrades: &[TreeNameUpgrade]) -> Result<()> {
        for upgrade in upgrades {
            if upgrade.delete {
                let pos = self
                    .trees
                    .binary_search_by(|(n, _)| n.as_str().cmp(upgrade.name.as_str()))
                    .map_err(|_| {
                        DbError::invalid(format!("unknown tree to delete: {}", upgrade.name))
                    })?;
                self.trees.remove(pos);
            } else if let Some(from) = &upgrade.rename_from {
                let pos = self
                    .trees
                    .binary_search_by(|(n, _)| n.as_str().cmp(from.as_str()))
                    .map_err(|_| {
                        DbError::invalid(format!("unknown tree to rename: {from}"))
                    })?;
                let (_, tree) = self.trees.remove(pos);
                self.insert_tree(&upgrade.name, tree)?;
            } else {
                self.insert_tree(&upgrade.name, Tree::empty(self.cache_size))?;
            }
        }
        Ok(())
    }

    fn insert_tree(&mut self, name: &str, tree: Tree) -> Result<()> {
        match self
            .trees
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
        {
            Ok(_) => Err(DbError::invalid(format!("tree already exists: {name}"))),
            Err(pos) => {
                self.trees.insert(pos, (name.to_string(), tree));
                Ok(())
            }
        }
    }

    pub(crate) fn apply_change_set(&mut self, name: &str, changeset: &ChangeSet) -> Result<()> {
        let tree = self
            .tree_mut(name)
            .ok_or_else(|| DbError::invalid(format!("unknown store: {name}")))?;
        tree.apply_change_set(changeset);
        Ok(())
    }

    pub(crate) fn apply_change_sets(&mut self, changesets: &[NamedChangeSet]) -> Result<()> {
        for cs in changesets {
            self.apply_change_set(&cs.name, &cs.changeset)?;
        }
        Ok(())
    }

    /// Apply one WAL payload without saving a version; used for catchup and
    /// for replaying the pending log after a snapshot swap.
    pub(crate) fn apply_wal_data(&mut self, data: &WalData) -> Result<()> {
        self.apply_upgrades(&data.upgrades)?;
        self.apply_change_sets(&data.changesets)
    }

    fn next_version(&self) -> u64 {
        let version = self.last_commit_info.version;
        if version == 0 && self.initial_version > 1 {
            self.initial_version
        } else {
            version + 1
        }
    }

    /// Persist the working state as the next version.
    pub(crate) fn save_version(&mut self, update_commit_info: bool) -> u64 {
        let version = self.next_version();
        for (_, tree) in &mut self.trees {
            tree.save_version(version);
        }
        self.last_commit_info.version = version;
        if update_commit_info {
            self.update_commit_info();
        }
        version
    }

    /// Refresh the store infos from the saved trees.
    pub(crate) fn update_commit_info(&mut self) {
        self.last_commit_info.store_infos = self
            .trees
            .iter()
            .map(|(name, tree)| StoreInfo {
                name: name.clone(),
                version: tree.version(),
                root_hash: tree.root_hash(),
            })
            .collect();
    }

    /// Commit info the next save would produce.
    pub fn working_commit_info(&self) -> CommitInfo {
        let version = self.next_version();
        CommitInfo {
            version,
            store_infos: self
                .trees
                .iter()
                .map(|(name, tree)| StoreInfo {
                    name: name.clone(),
                    version,
                    root_hash: tree.working_hash(),
                })
                .collect(),
        }
    }

    /// Replay WAL entries on top of the loaded state.
    ///
    /// `target_version == 0` replays to the end of the log. Errors when the
    /// log cannot supply the contiguous range this tree needs.
    pub(crate) fn catchup_wal(&mut self, wal: &Wal, target_version: u64) -> Result<()> {
        let last_index = wal.last_index();
        if last_index == 0 {
            return Ok(()); // empty log, nothing to replay
        }

        let start = wal_index(self.next_version(), self.initial_version);
        let end = if target_version == 0 {
            last_index
        } else {
            wal_index(target_version, self.initial_version)
        };
        if end > last_index {
            return Err(DbError::wal(format!(
                "target version {target_version} is beyond the log"
            )));
        }
        if start > end {
            return Ok(()); // already caught up past the target
        }
        let first_index = wal.first_index();
        if start < first_index {
            return Err(DbError::wal(format!(
                "wal entries before index {first_index} were pruned, need {start}"
            )));
        }

        for index in start..=end {
            let payload = wal.read(index)?;
            let data: WalData = bincode::deserialize(&payload)?;
            self.apply_wal_data(&data)?;
            let version = self.save_version(false);
            let expected = wal_version(index, self.initial_version);
            if version != expected {
                return Err(DbError::Corrupt(format!(
                    "wal replay produced version {version}, expected {expected}"
                )));
            }
        }
        self.update_commit_info();
        Ok(())
    }

    /// Write the committed state into `dir`: one subdirectory per tree,
    /// emitted in parallel on `pool`, then the metadata file.
    ///
    /// `cancel` is checked before each tree; a cancelled write returns
    /// [`DbError::Cancelled`] and leaves `dir` for the caller to clean up.
    pub(crate) fn write_snapshot(
        &self,
        dir: &Path,
        pool: &rayon::ThreadPool,
        cancel: &Arc<AtomicBool>,
    ) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        pool.install(|| {
            self.trees.par_iter().try_for_each(|(name, tree)| {
                if cancel.load(Ordering::Relaxed) {
                    return Err(DbError::Cancelled);
                }
                let tree_dir = dir.join(name);
                std::fs::create_dir_all(&tree_dir)?;
                tree.write_table(&tree_dir.join(KVS_FILE_NAME))
            })
        })?;

        if cancel.load(Ordering::Relaxed) {
            return Err(DbError::Cancelled);
        }

        let metadata = SnapshotMetadata {
            initial_version: self.initial_version,
            commit_info: self.last_commit_info.clone(),
        };
        let path = dir.join(METADATA_FILE_NAME);
        std::fs::write(&path, bincode::serialize(&metadata)?)?;
        std::fs::File::open(&path)?.sync_all()?;
        std::fs::File::open(dir)?.sync_all()?;
        Ok(())
    }

    /// App-level root hash of the last committed version.
    pub fn root_hash(&self) -> [u8; 32] {
        self.last_commit_info.hash()
    }
}
