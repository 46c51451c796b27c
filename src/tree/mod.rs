//! A single named store: an immutable snapshot table plus an in-memory
//! overlay of every change applied since that snapshot was taken.
//!
//! The overlay grows until the DB swaps in a freshly rewritten snapshot, at
//! which point the tree is reloaded with an empty overlay. Copies are cheap:
//! the table is `Arc`-shared and only the overlay clones.

pub mod multi;
pub mod reader;

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use crate::changeset::ChangeSet;
use crate::error::Result;
use self::reader::TableReader;

pub struct Tree {
    table: TableReader,
    /// Key -> value, `None` is a tombstone shadowing the table.
    overlay: BTreeMap<Bytes, Option<Bytes>>,
    /// Point-lookup cache over table reads; disabled when capacity is 0.
    cache: Option<Mutex<LruCache<Bytes, Option<Bytes>>>>,
    version: u64,
    root_hash: [u8; 32],
    dirty: bool,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("version", &self.version)
            .field("table_len", &self.table.len())
            .field("overlay_len", &self.overlay.len())
            .finish()
    }
}

fn new_cache(cache_size: usize) -> Option<Mutex<LruCache<Bytes, Option<Bytes>>>> {
    NonZeroUsize::new(cache_size).map(|cap| Mutex::new(LruCache::new(cap)))
}

impl Tree {
    pub(crate) fn empty(cache_size: usize) -> Self {
        Self {
            table: TableReader::empty(),
            overlay: BTreeMap::new(),
            cache: new_cache(cache_size),
            version: 0,
            root_hash: empty_hash(),
            dirty: false,
        }
    }

    pub(crate) fn from_table(
        table: TableReader,
        version: u64,
        root_hash: [u8; 32],
        cache_size: usize,
    ) -> Self {
        Self {
            table,
            overlay: BTreeMap::new(),
            cache: new_cache(cache_size),
            version,
            root_hash,
            dirty: false,
        }
    }

    /// Cheap structural copy; the fresh tree gets its own cache.
    pub(crate) fn copy(&self, cache_size: usize) -> Self {
        Self {
            table: self.table.clone(),
            overlay: self.overlay.clone(),
            cache: new_cache(cache_size),
            version: self.version,
            root_hash: self.root_hash,
            dirty: self.dirty,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn root_hash(&self) -> [u8; 32] {
        self.root_hash
    }

    /// Look up a key: overlay first, then cache, then the snapshot table.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        if let Some(entry) = self.overlay.get(key) {
            return entry.clone();
        }
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().get(key) {
                return hit.clone();
            }
        }
        let found = self.table.get(key).map(Bytes::copy_from_slice);
        if let Some(cache) = &self.cache {
            cache
                .lock()
                .put(Bytes::copy_from_slice(key), found.clone());
        }
        found
    }

    /// Borrowed lookup that bypasses the cache; with a zero-copy table the
    /// returned slice points into the mmapped snapshot file.
    pub fn get_ref(&self, key: &[u8]) -> Option<&[u8]> {
        if let Some(entry) = self.overlay.get(key) {
            return entry.as_deref();
        }
        self.table.get(key)
    }

    pub(crate) fn apply_change_set(&mut self, changeset: &ChangeSet) {
        for pair in &changeset.pairs {
            let value = if pair.delete {
                None
            } else {
                Some(pair.value.clone())
            };
            self.overlay.insert(pair.key.clone(), value);
        }
        if !changeset.pairs.is_empty() {
            self.dirty = true;
        }
    }

    /// Advance to `version`, refreshing the root hash only when the contents
    /// changed since the last save.
    pub(crate) fn save_version(&mut self, version: u64) {
        if self.dirty {
            self.root_hash = self.compute_hash();
            self.dirty = false;
        }
        self.version = version;
    }

    /// Root hash the next save would produce.
    pub(crate) fn working_hash(&self) -> [u8; 32] {
        if self.dirty {
            self.compute_hash()
        } else {
            self.root_hash
        }
    }

    fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for (key, value) in self.iter() {
            hasher.update(&(key.len() as u32).to_le_bytes());
            hasher.update(key);
            hasher.update(&(value.len() as u32).to_le_bytes());
            hasher.update(value);
        }
        *hasher.finalize().as_bytes()
    }

    /// Ordered merge of the snapshot table and the overlay; tombstoned keys
    /// are skipped, overlay entries shadow table entries.
    pub fn iter(&self) -> MergeIter<'_> {
        MergeIter {
            table: self.table.iter().peekable(),
            overlay: self.overlay.iter().peekable(),
        }
    }

    pub(crate) fn merged_len(&self) -> usize {
        self.iter().count()
    }

    /// Write the merged contents as a snapshot table file.
    pub(crate) fn write_table(&self, path: &std::path::Path) -> Result<()> {
        reader::write_table(path, self.merged_len(), self.iter())
    }
}

pub(crate) fn empty_hash() -> [u8; 32] {
    *blake3::Hasher::new().finalize().as_bytes()
}

pub struct MergeIter<'a> {
    table: std::iter::Peekable<reader::TableIter<'a>>,
    overlay: std::iter::Peekable<std::collections::btree_map::Iter<'a, Bytes, Option<Bytes>>>,
}

impl<'a> Iterator for MergeIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let take_overlay = match (self.table.peek(), self.overlay.peek()) {
                (None, None) => return None,
                (Some(_), None) => false,
                (None, Some(_)) => true,
                (Some((tk, _)), Some((ok, _))) => match ok.as_ref().cmp(*tk) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Greater => false,
                    std::cmp::Ordering::Equal => {
                        // Overlay shadows the table entry.
                        self.table.next();
                        true
                    }
                },
            };

            if take_overlay {
                let (key, value) = self.overlay.next().expect("peeked");
                match value {
                    Some(value) => return Some((key.as_ref(), value.as_ref())),
                    None => continue, // tombstone
                }
            } else {
                return self.table.next();
            }
        }
    }
}
