//! Error types for the sealdb storage engine.

use std::io;

use snafu::Snafu;

/// Page identifier type.
pub type PageId = u64;

/// Result type alias for store operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur during store operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// I/O error from the underlying storage backend or log.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The passphrase did not unlock the store.
    #[snafu(display("Wrong passphrase or not a sealdb file"))]
    WrongPassphrase,

    /// A page failed AEAD tag verification.
    #[snafu(display("Page {page_id} failed authentication"))]
    Authentication {
        /// The page whose tag did not verify.
        page_id: PageId,
    },

    /// Database file is corrupted or has invalid format.
    #[snafu(display("Corrupted database: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// Database header checksum verification failed.
    #[snafu(display("Header checksum mismatch"))]
    HeaderChecksumMismatch,

    /// Invalid magic number in database header.
    #[snafu(display("Invalid database magic number"))]
    InvalidMagic,

    /// Unsupported database format version.
    #[snafu(display("Unsupported format version: {version}"))]
    UnsupportedVersion {
        /// The unsupported version number.
        version: u16,
    },

    /// Page type mismatch (expected different type).
    #[snafu(display("Page {page_id} type mismatch: expected {expected:?}, found {found:?}"))]
    PageTypeMismatch {
        /// The page that was read.
        page_id: PageId,
        /// The expected page type.
        expected: PageType,
        /// The actual page type found.
        found: PageType,
    },

    /// A committed WAL frame failed its checksum.
    #[snafu(display("WAL frame at offset {offset} checksum mismatch"))]
    WalChecksumMismatch {
        /// Byte offset of the frame within the log.
        offset: u64,
    },

    /// Writes are refused because corruption was observed earlier.
    #[snafu(display("Writes disabled after corruption was detected"))]
    WritesDisabled,

    /// Key not found.
    #[snafu(display("Key not found"))]
    KeyNotFound,

    /// Key exceeds the per-cell budget.
    #[snafu(display("Key too large: {size} bytes (max {max})"))]
    KeyTooLarge {
        /// Actual size of the key in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// Encoded record exceeds the maximum value length.
    #[snafu(display("Value too large: {size} bytes (max {max})"))]
    ValueTooLarge {
        /// Actual size of the value in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// Record contains a type tag this version does not understand.
    #[snafu(display("Unsupported value type tag: {tag:#04x}"))]
    UnsupportedType {
        /// The unknown tag byte.
        tag: u8,
    },

    /// The store cannot perform the operation while other work holds it.
    #[snafu(display("Store busy: {reason}"))]
    StoreBusy {
        /// What is holding the store.
        reason: &'static str,
    },

    /// Database is read-only.
    #[snafu(display("Database is read-only"))]
    ReadOnly,

    /// Database has been closed.
    #[snafu(display("Database is closed"))]
    Closed,

    /// Configuration rejected at open time.
    #[snafu(display("Invalid configuration: {reason}"))]
    InvalidConfig {
        /// Which setting was rejected and why.
        reason: String,
    },
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

/// Coarse classification of an [`Error`].
///
/// Callers branch on the kind rather than on individual variants, e.g. to
/// tell "wrong password" apart from "corrupt file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transient I/O failure; the operation may be retried.
    Io,
    /// Wrong passphrase or tampered page.
    Authentication,
    /// Checksum or structural violation.
    Corruption,
    /// Key absent where presence was required.
    KeyNotFound,
    /// Store held by a transaction or another writer.
    Busy,
    /// Unknown record type tag.
    UnsupportedType,
    /// Caller supplied an oversized key/value or a bad configuration.
    InvalidInput,
    /// Write attempted on a read-only store.
    ReadOnly,
    /// Store already closed.
    Closed,
}

impl Error {
    /// Returns the taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { .. } => ErrorKind::Io,
            Error::WrongPassphrase | Error::Authentication { .. } => ErrorKind::Authentication,
            Error::Corrupted { .. }
            | Error::HeaderChecksumMismatch
            | Error::InvalidMagic
            | Error::UnsupportedVersion { .. }
            | Error::PageTypeMismatch { .. }
            | Error::WalChecksumMismatch { .. }
            | Error::WritesDisabled => ErrorKind::Corruption,
            Error::KeyNotFound => ErrorKind::KeyNotFound,
            Error::StoreBusy { .. } => ErrorKind::Busy,
            Error::UnsupportedType { .. } => ErrorKind::UnsupportedType,
            Error::KeyTooLarge { .. } | Error::ValueTooLarge { .. } | Error::InvalidConfig { .. } => {
                ErrorKind::InvalidInput
            },
            Error::ReadOnly => ErrorKind::ReadOnly,
            Error::Closed => ErrorKind::Closed,
        }
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Io | ErrorKind::Busy)
    }

    /// Whether this error means the on-disk state can no longer be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self.kind(), ErrorKind::Corruption | ErrorKind::Authentication)
            && !matches!(self, Error::WrongPassphrase)
    }

    pub(crate) fn corrupted(reason: impl Into<String>) -> Self {
        Error::Corrupted { reason: reason.into() }
    }
}

/// Page types in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Free page, linked into the free list. Never-written pages also read as free.
    Free = 0,
    /// B-tree branch (interior) node.
    BTreeBranch = 1,
    /// B-tree leaf node.
    BTreeLeaf = 2,
    /// Overflow page holding the tail of a large value.
    Overflow = 3,
    /// Store metadata (root, free list, counters).
    Meta = 4,
}

impl TryFrom<u8> for PageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Free),
            1 => Ok(Self::BTreeBranch),
            2 => Ok(Self::BTreeLeaf),
            3 => Ok(Self::Overflow),
            4 => Ok(Self::Meta),
            _ => Err(Error::Corrupted { reason: format!("Invalid page type: {}", value) }),
        }
    }
}
