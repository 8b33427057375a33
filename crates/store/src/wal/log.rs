//! Byte-level storage for the write-ahead log.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use parking_lot::{Mutex, RwLock};

use crate::{
    backend::{read_exact_at_offset, write_all_at_offset},
    error::Result,
};

/// Append-mostly byte store holding the log.
///
/// Positional reads and writes; the WAL tracks its own tail. Implementations
/// must be safe to read concurrently with a single writer appending past
/// the region being read.
pub trait LogBackend: Send + Sync {
    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the range is not fully present or the read fails.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` at `offset`, extending the log if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current length in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the length cannot be read.
    fn len(&self) -> Result<u64>;

    /// Truncates the log to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the truncation fails.
    fn truncate(&self, len: u64) -> Result<()>;

    /// Flushes written bytes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    fn sync(&self) -> Result<()>;
}

impl<L: LogBackend + ?Sized> LogBackend for Box<L> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write_at(offset, data)
    }

    fn len(&self) -> Result<u64> {
        (**self).len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        (**self).truncate(len)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Log stored in the sibling file `<db path>-wal`.
pub struct FileLog {
    file: File,
    path: PathBuf,
    /// Serializes length changes against writes.
    resize_lock: Mutex<()>,
}

impl FileLog {
    /// Opens or creates the log file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file =
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?;
        Ok(Self { file, path, resize_lock: Mutex::new(()) })
    }

    /// Opens an existing log without write access.
    ///
    /// Returns `Ok(None)` if there is no log file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file exists but cannot be opened.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        match File::open(&path) {
            Ok(file) => Ok(Some(Self { file, path, resize_lock: Mutex::new(()) })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Log path for the database at `db_path`.
    pub fn path_for(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_owned();
        name.push("-wal");
        PathBuf::from(name)
    }

    /// Returns the log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogBackend for FileLog {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_exact_at_offset(&self.file, buf, offset)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let _guard = self.resize_lock.lock();
        write_all_at_offset(&self.file, data, offset)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let _guard = self.resize_lock.lock();
        self.file.set_len(len)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory log for in-memory stores and tests.
#[derive(Default)]
pub struct MemoryLog {
    data: RwLock<Vec<u8>>,
}

impl MemoryLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out the current log bytes.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Builds a log from raw bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { data: RwLock::new(bytes) }
    }
}

impl LogBackend for MemoryLog {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("log read {start}..{end} past end {}", data.len()),
            )
            .into());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.data.write().truncate(len as usize);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
