//! Storage backend abstraction for the store engine.
//!
//! The backend trait abstracts the underlying storage mechanism,
//! allowing both file-based (production) and in-memory (testing) implementations.
//! Backends move opaque fixed-size buffers: every page they see is already
//! encrypted by [`crate::cipher::PageCipher`].
//!
//! # File layout
//!
//! ```text
//! [ header: 512 bytes, plaintext ][ page 0 (meta) ][ page 1 ][ page 2 ] ...
//! ```
//!
//! The header is written once at creation (and again by a rekey, which
//! replaces the whole file). Durability of page writes is provided by the
//! write-ahead log in [`crate::wal`], not by this backend.

mod file;
mod memory;

pub use file::FileBackend;
pub(crate) use file::{read_exact_at_offset, write_all_at_offset};
pub use memory::InMemoryBackend;

use crate::{
    cipher::{KEY_CHECK_SIZE, KdfParams, SALT_SIZE},
    error::{Error, PageId, Result},
};

/// Default page size power: 12 (meaning 2^12 = 4KB).
pub const DEFAULT_PAGE_SIZE_POWER: u8 = 12;
/// Default page size: 4KB (4096 bytes).
pub const DEFAULT_PAGE_SIZE: usize = 1 << DEFAULT_PAGE_SIZE_POWER;
/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;
/// Largest supported page size (node offsets are 16-bit).
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// Database header size.
pub const HEADER_SIZE: usize = 512;

/// Magic number for sealdb files.
pub const MAGIC: &[u8; 8] = b"SEALDBv1";

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

/// KDF identifier for Argon2id.
const KDF_ARGON2ID: u8 = 1;

/// Storage backend trait for abstracting file I/O.
pub trait StorageBackend: Send + Sync {
    /// Reads the database header ([`HEADER_SIZE`] bytes).
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_header(&self) -> Result<Vec<u8>>;

    /// Writes the database header.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails.
    /// Returns `Error::Corrupted` if the header size is incorrect.
    fn write_header(&self, header: &[u8]) -> Result<()>;

    /// Reads a page by its ID. Pages past the end of the file read as zeros.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>>;

    /// Writes a page at the given ID, growing the file if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails.
    /// Returns `Error::Corrupted` if the data size does not match the page size.
    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()>;

    /// Flushes all writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    fn sync(&self) -> Result<()>;

    /// Returns the current file size in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the metadata query fails.
    fn file_size(&self) -> Result<u64>;

    /// Extends the file to the given size.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be extended.
    fn extend(&self, new_size: u64) -> Result<()>;

    /// Atomically replaces the whole file: new header plus `page_count` pages,
    /// each produced by `page` from the current image of the same page.
    /// Readers observe either the old or the new file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the replacement cannot be written, and
    /// propagates errors returned by `page`; the old file stays in place.
    /// Once the new file is in place the backend serves it, and a later
    /// failure is `Error::Corrupted`.
    fn replace_all(
        &mut self,
        header: &[u8],
        page_count: u64,
        page: &mut dyn FnMut(PageId, Vec<u8>) -> Result<Vec<u8>>,
    ) -> Result<()>;

    /// Returns the page size for this backend.
    fn page_size(&self) -> usize;

    /// Calculates the byte offset for a page ID.
    fn page_offset(&self, page_id: PageId) -> u64 {
        HEADER_SIZE as u64 + (page_id * self.page_size() as u64)
    }
}

/// Checks that `page_size` is a supported power of two.
pub(crate) fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(Error::InvalidConfig {
            reason: format!(
                "page size {page_size} must be a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}"
            ),
        });
    }
    Ok(())
}

/// The plaintext file header.
///
/// # Layout (512 bytes)
///
/// - Bytes 0-7: magic `SEALDBv1`
/// - Bytes 8-9: format version
/// - Byte 10: page size as a power of two
/// - Byte 11: KDF identifier (1 = Argon2id)
/// - Bytes 12-23: KDF memory (KiB), iterations, parallelism
/// - Bytes 24-39: KDF salt
/// - Bytes 40-111: key-check block (nonce, ciphertext, tag)
/// - Bytes 112-119: XXH3-64 checksum of bytes 0-111
/// - Bytes 120-511: reserved (zero)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version.
    pub version: u16,
    /// Page size as power of 2.
    pub page_size_power: u8,
    /// Parameters the passphrase was stretched with.
    pub kdf: KdfParams,
    /// Per-file KDF salt.
    pub salt: [u8; SALT_SIZE],
    /// Sealed known plaintext used to reject a wrong passphrase up front.
    pub key_check: [u8; KEY_CHECK_SIZE],
}

impl FileHeader {
    /// Total header size on disk.
    pub const SIZE: usize = HEADER_SIZE;

    const CHECKSUM_OFFSET: usize = 40 + KEY_CHECK_SIZE;

    /// Creates a header for a new file.
    pub fn new(
        page_size_power: u8,
        kdf: KdfParams,
        salt: [u8; SALT_SIZE],
        key_check: [u8; KEY_CHECK_SIZE],
    ) -> Self {
        Self { version: FORMAT_VERSION, page_size_power, kdf, salt, key_check }
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> usize {
        1 << self.page_size_power
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        buf[0..8].copy_from_slice(MAGIC);
        buf[8..10].copy_from_slice(&self.version.to_le_bytes());
        buf[10] = self.page_size_power;
        buf[11] = KDF_ARGON2ID;
        buf[12..16].copy_from_slice(&self.kdf.memory_kib.to_le_bytes());
        buf[16..20].copy_from_slice(&self.kdf.iterations.to_le_bytes());
        buf[20..24].copy_from_slice(&self.kdf.parallelism.to_le_bytes());
        buf[24..40].copy_from_slice(&self.salt);
        buf[40..Self::CHECKSUM_OFFSET].copy_from_slice(&self.key_check);

        let checksum = xxhash_rust::xxh3::xxh3_64(&buf[0..Self::CHECKSUM_OFFSET]);
        buf[Self::CHECKSUM_OFFSET..Self::CHECKSUM_OFFSET + 8]
            .copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    /// Deserializes from bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the buffer is too short or a field is out of range.
    /// Returns `Error::InvalidMagic` if the magic number does not match.
    /// Returns `Error::UnsupportedVersion` if the format version is unsupported.
    /// Returns `Error::HeaderChecksumMismatch` if the checksum does not verify.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Corrupted { reason: "Header too short".to_string() });
        }

        if &buf[0..8] != MAGIC {
            return Err(Error::InvalidMagic);
        }

        let version = u16::from_le_bytes([buf[8], buf[9]]);
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }

        let stored = read_u64(buf, Self::CHECKSUM_OFFSET);
        let computed = xxhash_rust::xxh3::xxh3_64(&buf[0..Self::CHECKSUM_OFFSET]);
        if stored != computed {
            return Err(Error::HeaderChecksumMismatch);
        }

        let page_size_power = buf[10];
        if page_size_power >= usize::BITS as u8 {
            return Err(Error::corrupted(format!("Invalid page size power: {page_size_power}")));
        }
        validate_page_size(1usize << page_size_power)
            .map_err(|_| Error::corrupted(format!("Invalid page size power: {page_size_power}")))?;

        if buf[11] != KDF_ARGON2ID {
            return Err(Error::corrupted(format!("Unknown KDF identifier: {}", buf[11])));
        }

        let kdf = KdfParams {
            memory_kib: read_u32(buf, 12),
            iterations: read_u32(buf, 16),
            parallelism: read_u32(buf, 20),
        };

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&buf[24..40]);
        let mut key_check = [0u8; KEY_CHECK_SIZE];
        key_check.copy_from_slice(&buf[40..Self::CHECKSUM_OFFSET]);

        Ok(Self { version, page_size_power, kdf, salt, key_check })
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
