//! Temporary directories holding test stores.

// Test utilities are expected to panic on failure
#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};

use sealdb_store::FileLog;
use tempfile::TempDir;

/// File name used by [`TestDir::store_path`].
pub const STORE_FILE_NAME: &str = "store.sdb";

/// A temporary directory for one test's store files, removed on drop.
///
/// # Example
///
/// ```
/// use sealdb_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// let path = dir.store_path();
/// assert_eq!(dir.log_path(), dir.join("store.sdb-wal"));
/// # let _ = path;
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: TempDir::new().expect("failed to create temp directory") }
    }

    /// Returns the directory itself.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Returns `name` inside the directory.
    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, name: P) -> PathBuf {
        self.inner.path().join(name)
    }

    /// Returns the default store file path.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.join(STORE_FILE_NAME)
    }

    /// Returns the write-ahead log that belongs to [`TestDir::store_path`].
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        FileLog::path_for(&self.store_path())
    }

    /// Names of the files currently in the directory, sorted.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be listed.
    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.path())
            .expect("failed to list temp directory")
            .map(|entry| entry.expect("failed to read entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
