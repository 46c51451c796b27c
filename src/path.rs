//! Directory layout: snapshot naming, traversal, and atomic filesystem ops.
//!
//! A db directory holds `snapshot-<20-digit version>` directories, a `current`
//! symlink naming the base snapshot, and a `wal/` subdirectory. The 20-digit
//! zero padding makes lexicographic order equal numeric order, which the
//! traversal below relies on.

use std::path::{Path, PathBuf};

use crate::error::{DbError, Result};

pub(crate) const SNAPSHOT_PREFIX: &str = "snapshot-";
pub(crate) const SNAPSHOT_DIR_LEN: usize = SNAPSHOT_PREFIX.len() + 20;
pub(crate) const TMP_SUFFIX: &str = "-tmp";
pub(crate) const LOCK_FILE_NAME: &str = "LOCK";
pub(crate) const METADATA_FILE_NAME: &str = "metadata";

pub(crate) fn snapshot_name(version: u64) -> String {
    format!("{SNAPSHOT_PREFIX}{version:020}")
}

pub(crate) fn is_snapshot_name(name: &str) -> bool {
    name.len() == SNAPSHOT_DIR_LEN
        && name.starts_with(SNAPSHOT_PREFIX)
        && name[SNAPSHOT_PREFIX.len()..].bytes().all(|b| b.is_ascii_digit())
}

pub(crate) fn parse_version(name: &str) -> Result<u64> {
    if !is_snapshot_name(name) {
        return Err(DbError::invalid(format!("invalid snapshot name {name}")));
    }
    name[SNAPSHOT_PREFIX.len()..]
        .parse::<u64>()
        .map_err(|err| DbError::invalid(format!("snapshot version overflows: {err}")))
}

pub(crate) fn current_path(root: &Path) -> PathBuf {
    root.join("current")
}

pub(crate) fn current_tmp_path(root: &Path) -> PathBuf {
    root.join("current-tmp")
}

pub(crate) fn wal_path(root: &Path) -> PathBuf {
    root.join("wal")
}

/// Version named by the `current` symlink.
pub(crate) fn current_version(root: &Path) -> Result<u64> {
    let target = std::fs::read_link(current_path(root))?;
    let name = target
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| DbError::invalid("current symlink target is not a snapshot name"))?;
    parse_version(name)
}

/// Create or replace the `current` symlink atomically.
///
/// A transient `current-tmp` symlink is renamed onto `current`; rename is
/// atomic on the same filesystem.
pub(crate) fn update_current_symlink(root: &Path, snapshot: &str) -> Result<()> {
    let tmp = current_tmp_path(root);
    let _ = std::fs::remove_file(&tmp);
    std::os::unix::fs::symlink(snapshot, &tmp)?;
    std::fs::rename(&tmp, current_path(root))?;
    Ok(())
}

/// Visit snapshot versions in ascending or descending order.
///
/// The callback returns `Ok(true)` to stop early.
pub(crate) fn traverse_snapshots(
    root: &Path,
    ascending: bool,
    mut callback: impl FnMut(u64) -> Result<bool>,
) -> Result<()> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if entry.file_type()?.is_dir() && is_snapshot_name(name) {
            names.push(name.to_string());
        }
    }
    // read_dir order is unspecified; zero padding makes this numeric order.
    names.sort_unstable();

    let run = |name: &str, callback: &mut dyn FnMut(u64) -> Result<bool>| -> Result<bool> {
        callback(parse_version(name)?)
    };

    if ascending {
        for name in &names {
            if run(name, &mut callback)? {
                return Ok(());
            }
        }
    } else {
        for name in names.iter().rev() {
            if run(name, &mut callback)? {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Greatest snapshot version that is <= `target_version`.
pub(crate) fn seek_snapshot(root: &Path, target_version: u64) -> Result<u64> {
    let mut found = None;
    traverse_snapshots(root, false, |version| {
        if version <= target_version {
            found = Some(version);
            return Ok(true);
        }
        Ok(false)
    })?;
    found.ok_or(DbError::TargetPruned(target_version))
}

/// Earliest snapshot version on disk.
pub(crate) fn first_snapshot_version(root: &Path) -> Result<u64> {
    let mut found = None;
    traverse_snapshots(root, true, |version| {
        found = Some(version);
        Ok(true)
    })?;
    found.ok_or_else(|| DbError::invalid("no snapshots on disk"))
}

/// `mv dir dir-tmp && rm -r dir-tmp`, so a crash never leaves a half-deleted
/// snapshot discoverable by the traversal.
pub(crate) fn atomic_remove_dir(path: &Path) -> Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);
    std::fs::rename(path, &tmp)?;
    std::fs::remove_dir_all(&tmp)?;
    Ok(())
}

/// Remove `*-tmp` directories and symlinks left over from an interrupted
/// rewrite or swap.
pub(crate) fn remove_tmp_dirs(root: &Path) -> Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.ends_with(TMP_SUFFIX) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_names_round_trip() {
        let name = snapshot_name(42);
        assert_eq!(name, "snapshot-00000000000000000042");
        assert_eq!(name.len(), SNAPSHOT_DIR_LEN);
        assert!(is_snapshot_name(&name));
        assert_eq!(parse_version(&name).expect("parse"), 42);
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(!is_snapshot_name("snapshot-42"));
        assert!(!is_snapshot_name("snapshot-0000000000000000004x"));
        assert!(!is_snapshot_name("snap-00000000000000000042"));
        assert!(parse_version("current").is_err());
    }

    #[test]
    fn traversal_orders_numerically() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        for v in [3u64, 10, 7] {
            std::fs::create_dir(dir.path().join(snapshot_name(v))).expect("mkdir");
        }
        std::fs::create_dir(dir.path().join("wal")).expect("mkdir wal");

        let mut seen = Vec::new();
        traverse_snapshots(dir.path(), true, |v| {
            seen.push(v);
            Ok(false)
        })
        .expect("traverse");
        assert_eq!(seen, vec![3, 7, 10]);

        seen.clear();
        traverse_snapshots(dir.path(), false, |v| {
            seen.push(v);
            Ok(false)
        })
        .expect("traverse");
        assert_eq!(seen, vec![10, 7, 3]);

        assert_eq!(seek_snapshot(dir.path(), 8).expect("seek"), 7);
        assert_eq!(seek_snapshot(dir.path(), 3).expect("seek"), 3);
        assert!(matches!(
            seek_snapshot(dir.path(), 2),
            Err(DbError::TargetPruned(2))
        ));
        assert_eq!(first_snapshot_version(dir.path()).expect("first"), 3);
    }

    #[test]
    fn tmp_cleanup_spares_real_snapshots() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let keep = dir.path().join(snapshot_name(5));
        let stale = dir.path().join(format!("{}{}", snapshot_name(6), TMP_SUFFIX));
        std::fs::create_dir(&keep).expect("mkdir");
        std::fs::create_dir(&stale).expect("mkdir");

        remove_tmp_dirs(dir.path()).expect("cleanup");
        assert!(keep.exists());
        assert!(!stale.exists());
    }
}
