//! `snapdb` is a versioned, multi-tree key-value store.
//!
//! State lives in memory as a set of named, content-hashed trees; durability
//! comes from on-disk snapshots plus a write-ahead log:
//! - A block of changes is accumulated with `apply_change_set(s)` /
//!   `apply_upgrades`, then committed atomically as the next version.
//! - Every commit lands in the WAL (synchronously or through a background
//!   writer); snapshots are rewritten in the background on a configurable
//!   cadence and swapped in atomically via the `current` symlink.
//! - Old snapshots are pruned and the WAL prefix truncated once it is no
//!   longer needed for catchup.
//! - One writer per directory, enforced with a file lock; read-only opens
//!   never take it.

pub mod changeset;
pub mod db;
pub mod error;
pub mod lock;
pub(crate) mod path;
pub mod tree;
pub mod wal;

pub use changeset::{ChangeSet, KvPair, NamedChangeSet, TreeNameUpgrade, WalData};
pub use db::{get_latest_version, Db, Options, StateSyncExport};
pub use error::{DbError, Result};
pub use tree::multi::{CommitInfo, MultiTree, StoreInfo};
pub use tree::Tree;
pub use wal::{Wal, WalBatch, WalOptions};
