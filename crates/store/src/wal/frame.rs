//! On-disk encoding of the log header and frames.
//!
//! ```text
//! [ log header: 32 ][ frame 0 ][ frame 1 ] ...
//! frame = [ frame header: 48 ][ payload: physical page size ]
//! ```
//!
//! Frames have a fixed size so a damaged frame never hides the position of
//! the frames after it.

use crate::error::{Error, PageId, Result};

/// Log file magic.
pub const WAL_MAGIC: &[u8; 4] = b"SWAL";
/// Log format version.
pub const WAL_VERSION: u16 = 1;
/// Size of the log header.
pub const WAL_HEADER_SIZE: usize = 32;
/// Size of a frame header.
pub const FRAME_HEADER_SIZE: usize = 48;

const FRAME_CHECKSUM_OFFSET: usize = 40;
const HEADER_CHECKSUM_OFFSET: usize = 24;

/// Log header.
///
/// # Layout
///
/// - Bytes 0-3: magic `SWAL`
/// - Bytes 4-5: version
/// - Byte 6: page size as a power of two
/// - Byte 7: reserved
/// - Bytes 8-15: generation (bumped by every checkpoint)
/// - Bytes 16-23: database id (ties the log to one main file and key)
/// - Bytes 24-31: XXH3-64 of bytes 0-23
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    /// Page size power shared with the main file.
    pub page_size_power: u8,
    /// Frames from other generations are stale.
    pub generation: u64,
    /// Identifier derived from the main file's salt.
    pub db_id: u64,
}

impl WalHeader {
    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        buf[0..4].copy_from_slice(WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_VERSION.to_le_bytes());
        buf[6] = self.page_size_power;
        buf[8..16].copy_from_slice(&self.generation.to_le_bytes());
        buf[16..24].copy_from_slice(&self.db_id.to_le_bytes());
        let checksum = xxhash_rust::xxh3::xxh3_64(&buf[..HEADER_CHECKSUM_OFFSET]);
        buf[HEADER_CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parses the header.
    ///
    /// Returns `Ok(None)` when the bytes do not form a valid header (torn
    /// write during a reset).
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedVersion`] for a well-formed header of a
    /// different format version.
    pub fn from_bytes(buf: &[u8; WAL_HEADER_SIZE]) -> Result<Option<Self>> {
        let stored = read_u64(buf, HEADER_CHECKSUM_OFFSET);
        if &buf[0..4] != WAL_MAGIC
            || stored != xxhash_rust::xxh3::xxh3_64(&buf[..HEADER_CHECKSUM_OFFSET])
        {
            return Ok(None);
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != WAL_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }
        Ok(Some(Self {
            page_size_power: buf[6],
            generation: read_u64(buf, 8),
            db_id: read_u64(buf, 16),
        }))
    }
}

/// Frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Carries one encrypted page image.
    Page = 1,
    /// Seals every page frame of its commit sequence.
    Commit = 2,
}

/// Decoded frame header.
///
/// # Layout
///
/// - Byte 0: kind
/// - Bytes 1-7: reserved
/// - Bytes 8-15: page id (number of page frames, for commit frames)
/// - Bytes 16-23: commit sequence
/// - Bytes 24-31: log generation
/// - Bytes 32-39: database id
/// - Bytes 40-47: XXH3-64 of bytes 0-39 and the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame kind.
    pub kind: FrameKind,
    /// Target page, or the page-frame count for a commit frame.
    pub page_id: PageId,
    /// Commit sequence the frame belongs to.
    pub commit_seq: u64,
    /// Log generation the frame was written in.
    pub generation: u64,
    /// Database the frame belongs to.
    pub db_id: u64,
}

impl FrameHeader {
    /// Encodes a whole frame: header followed by `payload`.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; FRAME_HEADER_SIZE + payload.len()];
        frame[0] = self.kind as u8;
        frame[8..16].copy_from_slice(&self.page_id.to_le_bytes());
        frame[16..24].copy_from_slice(&self.commit_seq.to_le_bytes());
        frame[24..32].copy_from_slice(&self.generation.to_le_bytes());
        frame[32..40].copy_from_slice(&self.db_id.to_le_bytes());
        frame[FRAME_HEADER_SIZE..].copy_from_slice(payload);

        let checksum = frame_checksum(&frame);
        frame[FRAME_CHECKSUM_OFFSET..FRAME_HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
        frame
    }

    /// Decodes a frame, returning `None` if its checksum or kind is invalid.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() < FRAME_HEADER_SIZE {
            return None;
        }
        if read_u64(frame, FRAME_CHECKSUM_OFFSET) != frame_checksum(frame) {
            return None;
        }
        let kind = match frame[0] {
            1 => FrameKind::Page,
            2 => FrameKind::Commit,
            _ => return None,
        };
        Some(Self {
            kind,
            page_id: read_u64(frame, 8),
            commit_seq: read_u64(frame, 16),
            generation: read_u64(frame, 24),
            db_id: read_u64(frame, 32),
        })
    }
}

fn frame_checksum(frame: &[u8]) -> u64 {
    let mut hasher = xxhash_rust::xxh3::Xxh3::new();
    hasher.update(&frame[..FRAME_CHECKSUM_OFFSET]);
    hasher.update(&frame[FRAME_HEADER_SIZE..]);
    hasher.digest()
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
