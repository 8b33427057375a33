//! File-based storage backend using position-based I/O (`pread`/`pwrite`).
//!
//! On Unix, reads are completely lock-free via [`std::os::unix::fs::FileExt`]:
//! `read_exact_at()` takes `&self` and never touches the file cursor, allowing
//! concurrent reads from multiple threads with zero synchronization.
//!
//! Writes are serialized via a lightweight [`parking_lot::Mutex`] guard (not
//! wrapping the `File`, just a unit `()` sentinel) to prevent concurrent
//! file extensions and torn writes. Only checkpoints write to the main file.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

use super::{FileHeader, HEADER_SIZE, StorageBackend};
use crate::error::{Error, PageId, Result};

/// File-based storage backend.
///
/// Uses position-based I/O (`pread`/`pwrite`) for page access. Durability
/// requires the caller to invoke [`sync`](StorageBackend::sync) after writes.
pub struct FileBackend {
    /// The underlying file handle.
    file: File,
    /// Serializes writes and file extension operations.
    write_lock: Mutex<()>,
    /// Page size in bytes.
    page_size: usize,
    /// Location of the database file; the rekey path renames over it.
    path: PathBuf,
    read_only: bool,
}

impl FileBackend {
    /// Opens an existing database file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened or the header cannot be read.
    /// Returns [`Error::InvalidMagic`] if the file is not a sealdb database.
    /// Returns [`Error::Corrupted`] if the header is malformed.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(!read_only).open(&path)?;

        let len = file.metadata()?.len();
        if len < HEADER_SIZE as u64 {
            return Err(Error::InvalidMagic);
        }

        let mut header_buf = vec![0u8; HEADER_SIZE];
        read_exact_at_offset(&file, &mut header_buf, 0)?;
        let header = FileHeader::from_bytes(&header_buf)?;

        Ok(Self { file, write_lock: Mutex::new(()), page_size: header.page_size(), path, read_only })
    }

    /// Creates a new database file containing only `header`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file already exists or cannot be written.
    pub fn create(path: impl AsRef<Path>, header: &FileHeader) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file =
            OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;

        // Exclusively owned at this point, so the cursor-based Write is fine.
        file.write_all(&header.to_bytes())?;
        file.sync_all()?;

        Ok(Self {
            file,
            write_lock: Mutex::new(()),
            page_size: header.page_size(),
            path,
            read_only: false,
        })
    }

    /// Returns the path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".rekey");
        PathBuf::from(name)
    }
}

impl StorageBackend for FileBackend {
    fn read_header(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; HEADER_SIZE];
        read_exact_at_offset(&self.file, &mut buf, 0)?;
        Ok(buf)
    }

    fn write_header(&self, header: &[u8]) -> Result<()> {
        if header.len() != HEADER_SIZE {
            return Err(Error::Corrupted {
                reason: format!("Invalid header size: {} (expected {})", header.len(), HEADER_SIZE),
            });
        }

        let _guard = self.write_lock.lock();
        write_all_at_offset(&self.file, header, 0)?;
        Ok(())
    }

    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let offset = self.page_offset(page_id);

        let file_len = self.file.metadata()?.len();
        if offset + self.page_size as u64 > file_len {
            return Ok(vec![0u8; self.page_size]);
        }

        let mut buf = vec![0u8; self.page_size];
        read_exact_at_offset(&self.file, &mut buf, offset)?;
        Ok(buf)
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(Error::Corrupted {
                reason: format!(
                    "Invalid page data size: {} (expected {})",
                    data.len(),
                    self.page_size
                ),
            });
        }

        let offset = self.page_offset(page_id);

        let _guard = self.write_lock.lock();

        let file_len = self.file.metadata()?.len();
        let required_len = offset + self.page_size as u64;
        if file_len < required_len {
            self.file.set_len(required_len)?;
        }

        write_all_at_offset(&self.file, data, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if !self.read_only {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn extend(&self, new_size: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.file.metadata()?.len() < new_size {
            self.file.set_len(new_size)?;
        }
        Ok(())
    }

    fn replace_all(
        &mut self,
        header: &[u8],
        page_count: u64,
        page: &mut dyn FnMut(PageId, Vec<u8>) -> Result<Vec<u8>>,
    ) -> Result<()> {
        let staging = self.staging_path();
        let result = (|| {
            let staged =
                OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&staging)?;
            write_all_at_offset(&staged, header, 0)?;
            for page_id in 0..page_count {
                let data = page(page_id, self.read_page(page_id)?)?;
                write_all_at_offset(&staged, &data, self.page_offset(page_id))?;
            }
            staged.sync_all()?;
            Ok::<_, Error>(staged)
        })();
        let staged = match result {
            Ok(staged) => staged,
            Err(e) => {
                let _ = fs::remove_file(&staging);
                return Err(e);
            },
        };

        let _guard = self.write_lock.lock();
        fs::rename(&staging, &self.path)?;
        // The staged handle now names the live file.
        self.file = staged;
        sync_parent_dir(&self.path).map_err(|e| {
            tracing::error!(error = %e, path = %self.path.display(), "Replaced file but could not sync its directory");
            Error::corrupted(format!("replaced {} but its directory could not be synced: {e}", self.path.display()))
        })
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Platform-specific position-based I/O helpers
// ---------------------------------------------------------------------------

/// Reads exactly `buf.len()` bytes from `file` at the given byte `offset`.
///
/// Unix uses `pread(2)`, which leaves the cursor alone. Windows falls back
/// to `seek_read()`, which moves it.
#[cfg(unix)]
pub(crate) fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

#[cfg(windows)]
pub(crate) fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of file during seek_read",
            )
            .into());
        }
        pos += n;
    }
    Ok(())
}

/// Writes all of `data` to `file` at the given byte `offset`.
#[cfg(unix)]
pub(crate) fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
pub(crate) fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::{
        backend::{DEFAULT_PAGE_SIZE, DEFAULT_PAGE_SIZE_POWER},
        cipher::{KEY_CHECK_SIZE, KdfParams, SALT_SIZE},
    };

    fn header() -> FileHeader {
        FileHeader::new(
            DEFAULT_PAGE_SIZE_POWER,
            KdfParams { memory_kib: 64, iterations: 1, parallelism: 1 },
            [1u8; SALT_SIZE],
            [2u8; KEY_CHECK_SIZE],
        )
    }

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let backend = FileBackend::create(&path, &header()).unwrap();
            let parsed = FileHeader::from_bytes(&backend.read_header().unwrap()).unwrap();
            assert_eq!(parsed, header());
        }

        {
            let backend = FileBackend::open(&path, false).unwrap();
            assert_eq!(backend.page_size(), DEFAULT_PAGE_SIZE);
        }
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        FileBackend::create(&path, &header()).unwrap();
        assert!(matches!(FileBackend::create(&path, &header()), Err(Error::Io { .. })));
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();
        assert!(matches!(FileBackend::open(&path, true), Err(Error::InvalidMagic)));

        let short = dir.path().join("short.db");
        std::fs::write(&short, b"tiny").unwrap();
        assert!(matches!(FileBackend::open(&short, true), Err(Error::InvalidMagic)));
    }

    #[test]
    fn test_page_read_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let backend = FileBackend::create(&path, &header()).unwrap();

        let mut data = vec![0u8; DEFAULT_PAGE_SIZE];
        data[0] = 0xDE;
        data[1] = 0xAD;
        data[DEFAULT_PAGE_SIZE - 1] = 0xBE;

        backend.write_page(0, &data).unwrap();
        backend.sync().unwrap();

        let read_data = backend.read_page(0).unwrap();
        assert_eq!(read_data, data);
    }

    #[test]
    fn test_write_rejects_wrong_size() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(dir.path().join("test.db"), &header()).unwrap();
        assert!(matches!(backend.write_page(0, &[0u8; 100]), Err(Error::Corrupted { .. })));
    }

    /// Concurrent read + write: one thread writes page X while another reads
    /// page Y. Both complete and neither sees the other's bytes.
    #[test]
    fn test_concurrent_read_write_different_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let backend = Arc::new(FileBackend::create(&path, &header()).unwrap());

        let mut page1_data = vec![0xAAu8; DEFAULT_PAGE_SIZE];
        page1_data[0] = 0x11;
        backend.write_page(1, &page1_data).unwrap();
        backend.sync().unwrap();

        let b_write = Arc::clone(&backend);
        let b_read = Arc::clone(&backend);

        let writer = std::thread::spawn(move || {
            for i in 0u8..50 {
                let mut data = vec![i; DEFAULT_PAGE_SIZE];
                data[0] = 0xFF;
                b_write.write_page(5, &data).unwrap();
            }
        });

        let reader = std::thread::spawn(move || {
            for _ in 0..50 {
                let data = b_read.read_page(1).unwrap();
                assert_eq!(data[0], 0x11, "page 1 corrupted during concurrent write to page 5");
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();

        let final_page5 = backend.read_page(5).unwrap();
        assert_eq!(final_page5[0], 0xFF);
        assert_eq!(final_page5[1], 49);
    }

    #[test]
    fn test_read_beyond_file_returns_zeros() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(dir.path().join("test.db"), &header()).unwrap();

        let data = backend.read_page(999).unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_file_size_and_extend() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(dir.path().join("test.db"), &header()).unwrap();

        assert_eq!(backend.file_size().unwrap(), HEADER_SIZE as u64);

        let target = HEADER_SIZE as u64 + 10 * DEFAULT_PAGE_SIZE as u64;
        backend.extend(target).unwrap();
        assert_eq!(backend.file_size().unwrap(), target);

        // Never shrinks.
        backend.extend(HEADER_SIZE as u64).unwrap();
        assert_eq!(backend.file_size().unwrap(), target);
    }

    #[test]
    fn test_replace_all_swaps_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut backend = FileBackend::create(&path, &header()).unwrap();
        backend.write_page(0, &vec![1u8; DEFAULT_PAGE_SIZE]).unwrap();
        backend.write_page(1, &vec![2u8; DEFAULT_PAGE_SIZE]).unwrap();

        let mut new_header = header();
        new_header.salt = [5u8; SALT_SIZE];
        backend
            .replace_all(&new_header.to_bytes(), 2, &mut |id, old| {
                assert_eq!(old[0], id as u8 + 1);
                Ok(vec![0x40 + id as u8; DEFAULT_PAGE_SIZE])
            })
            .unwrap();

        assert_eq!(backend.read_page(0).unwrap()[0], 0x40);
        assert_eq!(backend.read_page(1).unwrap()[0], 0x41);
        let parsed = FileHeader::from_bytes(&backend.read_header().unwrap()).unwrap();
        assert_eq!(parsed.salt, [5u8; SALT_SIZE]);
        assert!(!backend.staging_path().exists());

        let reopened = FileBackend::open(&path, true).unwrap();
        assert_eq!(reopened.read_page(1).unwrap()[0], 0x41);
    }

    #[test]
    fn test_replace_all_failure_keeps_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut backend = FileBackend::create(&path, &header()).unwrap();
        backend.write_page(0, &vec![7u8; DEFAULT_PAGE_SIZE]).unwrap();

        let result = backend.replace_all(&header().to_bytes(), 3, &mut |id, _| {
            if id == 2 { Err(Error::corrupted("boom")) } else { Ok(vec![0u8; DEFAULT_PAGE_SIZE]) }
        });
        assert!(result.is_err());
        assert_eq!(backend.read_page(0).unwrap()[0], 7);
        assert!(!backend.staging_path().exists());
    }
}
