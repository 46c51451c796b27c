use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{DbError, Result};

/// Whole-directory advisory lock held by the single writer.
///
/// Readers never take it, so one writer and any number of read-only opens can
/// share a directory.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Create (if needed) and exclusively lock the sentinel file at `path`.
    pub fn lock(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            DbError::invalid(format!(
                "failed to lock {}: held by another writer",
                path.display()
            ))
        })?;
        Ok(Self { file, path })
    }

    pub fn unlock(&self) -> Result<()> {
        FileExt::unlock(&self.file)?;
        Ok(())
    }

    /// Remove the sentinel file. Call after [`FileLock::unlock`].
    pub fn destroy(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}
