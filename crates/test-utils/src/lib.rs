//! Shared test utilities for sealdb crates.
//!
//! This crate provides common test helpers to reduce boilerplate across test modules:
//!
//! - [`TestDir`] - Managed temporary directory with path helpers
//! - [`test_store_config`] - Store configuration with a fast key derivation
//! - [`CrashingLog`] - Write-ahead log backend that simulates a crash
//! - [`tamper`] - Byte-level damage to store files
//! - [`strategies`] - Proptest generators for keys, records and operations

#![deny(unsafe_code)]

mod test_dir;
pub use test_dir::{STORE_FILE_NAME, TestDir};

mod config;
pub use config::{FAST_KDF, TEST_PASSPHRASE, small_page_config, test_store_config};

mod crash_injector;
pub use crash_injector::{CrashInjector, CrashPoint, CrashingLog, WriteOutcome};

pub mod strategies;
pub mod tamper;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use sealdb_store::Database;

    use super::*;

    // ============================================
    // TestDir tests
    // ============================================

    #[test]
    fn test_dir_creates_temp_directory() {
        let dir = TestDir::new();
        assert!(dir.path().exists(), "temp directory should exist");
        assert!(dir.path().is_dir(), "should be a directory");
    }

    #[test]
    fn test_dir_join_creates_subdirectory_path() {
        let dir = TestDir::new();
        let subpath = dir.join("subdir/nested");
        assert!(subpath.starts_with(dir.path()));
        assert!(subpath.ends_with("subdir/nested"));
    }

    #[test]
    fn test_dir_lists_store_files() {
        let dir = TestDir::new();
        assert!(dir.file_names().is_empty());

        let db = Database::open(dir.store_path(), TEST_PASSPHRASE, test_store_config()).unwrap();
        db.close().unwrap();
        assert_eq!(dir.file_names(), vec![STORE_FILE_NAME.to_string(), format!("{STORE_FILE_NAME}-wal")]);
        assert!(dir.log_path().exists());
    }

    #[test]
    fn test_dir_cleanup_on_drop() {
        let path = {
            let dir = TestDir::new();
            let p = dir.path().to_path_buf();
            std::fs::write(p.join("file.txt"), "data").expect("write file");
            assert!(p.exists());
            p
        };
        assert!(!path.exists(), "temp directory should be cleaned up on drop");
    }

    // ============================================
    // Config helper tests
    // ============================================

    #[test]
    fn test_store_config_is_valid() {
        test_store_config().validate().unwrap();
        let small = small_page_config();
        small.validate().unwrap();
        assert_eq!(small.page_size, 512);
    }

    #[test]
    fn test_store_config_opens_store() {
        let db = Database::open_in_memory(TEST_PASSPHRASE, test_store_config()).unwrap();
        assert_eq!(db.commit_seq(), 0);
    }

    // ============================================
    // Tamper helper tests
    // ============================================

    #[test]
    fn test_flip_byte_round_trip() {
        let dir = TestDir::new();
        let path = dir.join("bytes");
        std::fs::write(&path, [0u8; 16]).unwrap();
        tamper::flip_byte(&path, 3, 0xFF);
        assert_eq!(std::fs::read(&path).unwrap()[3], 0xFF);
        tamper::flip_byte(&path, 3, 0xFF);
        assert_eq!(std::fs::read(&path).unwrap(), vec![0u8; 16]);

        tamper::truncate_tail(&path, 6);
        assert_eq!(std::fs::read(&path).unwrap().len(), 10);
    }

    #[test]
    fn test_page_offset() {
        assert_eq!(tamper::page_offset(4096, 0), 512);
        assert_eq!(tamper::page_offset(4096, 2), 512 + 8192);
    }
}
