//! Journal directory management.
//!
//! ```text
//! <journal_dir>/
//! ├─ mqj-data.lock     # Advisory lock for single-writer
//! ├─ mqj-data.cmp      # Compaction control (only while compacting)
//! ├─ mqj-data-1.mqj    # Journal files
//! └─ mqj-data-2.mqj
//! ```
//!
//! The lock file ensures only one journal writes to a set of files at a time.
//! It is named after the file prefix, so journals with different prefixes
//! can share a directory.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Holds the exclusive lock on a journal directory.
#[derive(Debug)]
pub struct JournalDir {
    path: PathBuf,
    _lock_file: File,
}

impl JournalDir {
    /// Opens (or creates) a journal directory and locks it for `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another journal holds the lock (returns `JournalLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, prefix: &str, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_config(format!(
                    "journal directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_config(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(format!("{prefix}.lock")))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::JournalLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the journal directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("journal");

        let dir = JournalDir::open(&path, "mqj", true).unwrap();
        assert!(path.is_dir());
        assert!(path.join("mqj.lock").exists());
        assert_eq!(dir.path(), path);
    }

    #[test]
    fn open_fails_if_not_exists_and_no_create() {
        let temp = tempdir().unwrap();
        let result = JournalDir::open(&temp.path().join("missing"), "mqj", false);
        assert!(matches!(result, Err(CoreError::InvalidConfig { .. })));
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _dir = JournalDir::open(temp.path(), "mqj", true).unwrap();

        let result = JournalDir::open(temp.path(), "mqj", true);
        assert!(matches!(result, Err(CoreError::JournalLocked)));

        // A different prefix is a different journal
        assert!(JournalDir::open(temp.path(), "other", true).is_ok());
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        {
            let _dir = JournalDir::open(temp.path(), "mqj", true).unwrap();
        }
        let _again = JournalDir::open(temp.path(), "mqj", true).unwrap();
    }
}
