//! Page management for the store engine.
//!
//! This module handles:
//! - Logical page layout (the plaintext view of a page)
//! - Page allocation and the persistent free list
//! - Page caching (clock eviction)
//! - The encrypted page store over a [`StorageBackend`](crate::backend::StorageBackend)
//! - The meta page that anchors every commit

mod allocator;
mod cache;
mod meta;
mod store;

pub use allocator::{FreeListPage, PageAllocator};
pub use cache::{CacheStats, PageCache};
pub use meta::MetaPage;
pub use store::PageStore;

use crate::error::{Error, PageId, PageType, Result};

/// Page header size in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// The meta page lives at a fixed slot.
pub const META_PAGE_ID: PageId = 0;

/// First page id handed out by the allocator.
pub const FIRST_DATA_PAGE: PageId = 1;

/// Page header structure (16 bytes).
///
/// ```text
/// Offset  Size   Field
/// ------  ----   -----
/// 0       1      Page type (PageType enum)
/// 1       1      Flags (reserved)
/// 2       2      Item count (cells in B-tree pages)
/// 4       4      Reserved
/// 8       8      Commit sequence that wrote this page
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    /// Page type.
    pub page_type: PageType,
    /// Flags (reserved for future use).
    pub flags: u8,
    /// Number of items in this page (for B-tree pages).
    pub item_count: u16,
    /// Commit sequence number of the transaction that wrote this page.
    pub commit_seq: u64,
}

impl PageHeader {
    /// Creates a new page header.
    pub fn new(page_type: PageType, commit_seq: u64) -> Self {
        Self { page_type, flags: 0, item_count: 0, commit_seq }
    }

    /// Serializes header to bytes.
    pub fn to_bytes(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        buf[0] = self.page_type as u8;
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.item_count.to_le_bytes());
        buf[8..16].copy_from_slice(&self.commit_seq.to_le_bytes());
        buf
    }

    /// Deserializes header from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the buffer is shorter than [`PAGE_HEADER_SIZE`]
    /// or the page type byte is invalid.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(Error::Corrupted { reason: "Page header too short".to_string() });
        }

        Ok(Self {
            page_type: PageType::try_from(buf[0])?,
            flags: buf[1],
            item_count: read_u16(buf, 2),
            commit_seq: read_u64(buf, 8),
        })
    }
}

/// A decrypted page: header plus content.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    /// Page ID (position in file).
    pub id: PageId,
    /// Plaintext page bytes including the header.
    pub data: Vec<u8>,
}

impl Page {
    /// Creates a new empty page of the given logical size.
    pub fn new(id: PageId, page_size: usize, page_type: PageType, commit_seq: u64) -> Self {
        let mut data = vec![0u8; page_size];
        let header = PageHeader::new(page_type, commit_seq);
        data[..PAGE_HEADER_SIZE].copy_from_slice(&header.to_bytes());

        Self { id, data }
    }

    /// Wraps plaintext bytes read from storage.
    pub fn from_bytes(id: PageId, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// Returns the page header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header bytes are corrupted or the page type is invalid.
    pub fn header(&self) -> Result<PageHeader> {
        PageHeader::from_bytes(&self.data)
    }

    /// Returns the page type.
    ///
    /// # Errors
    ///
    /// Returns an error if the page type byte is invalid.
    pub fn page_type(&self) -> Result<PageType> {
        Ok(self.header()?.page_type)
    }

    /// Fails with [`Error::PageTypeMismatch`] unless the page has the expected type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] or a header decoding error.
    pub fn expect_type(&self, expected: PageType) -> Result<()> {
        let found = self.page_type()?;
        if found != expected {
            return Err(Error::PageTypeMismatch { page_id: self.id, expected, found });
        }
        Ok(())
    }

    /// Returns the item count.
    pub fn item_count(&self) -> u16 {
        read_u16(&self.data, 2)
    }

    /// Sets the item count.
    pub fn set_item_count(&mut self, count: u16) {
        self.data[2..4].copy_from_slice(&count.to_le_bytes());
    }

    /// Returns the commit sequence stamped into the header.
    pub fn commit_seq(&self) -> u64 {
        read_u64(&self.data, 8)
    }

    /// Returns the content portion of the page (after header).
    pub fn content(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    /// Returns mutable content portion.
    pub fn content_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    /// Returns the logical page size.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("size", &self.data.len())
            .field("header", &self.header())
            .finish()
    }
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_page_header_round_trip() {
        let header =
            PageHeader { page_type: PageType::BTreeLeaf, flags: 0, item_count: 42, commit_seq: 12345 };

        let bytes = header.to_bytes();
        let recovered = PageHeader::from_bytes(&bytes).unwrap();

        assert_eq!(header.page_type, recovered.page_type);
        assert_eq!(header.item_count, recovered.item_count);
        assert_eq!(header.commit_seq, recovered.commit_seq);
    }

    #[test]
    fn test_new_page_is_stamped() {
        let page = Page::new(9, 1024, PageType::Overflow, 77);
        assert_eq!(page.size(), 1024);
        assert_eq!(page.page_type().unwrap(), PageType::Overflow);
        assert_eq!(page.commit_seq(), 77);
        assert_eq!(page.item_count(), 0);
        assert_eq!(page.content().len(), 1024 - PAGE_HEADER_SIZE);
    }

    #[test]
    fn test_expect_type() {
        let page = Page::new(5, 512, PageType::BTreeBranch, 1);
        page.expect_type(PageType::BTreeBranch).unwrap();
        let err = page.expect_type(PageType::BTreeLeaf).unwrap_err();
        assert!(matches!(
            err,
            Error::PageTypeMismatch {
                page_id: 5,
                expected: PageType::BTreeLeaf,
                found: PageType::BTreeBranch
            }
        ));
    }

    #[test]
    fn test_zeroed_page_reads_as_free() {
        let page = Page::from_bytes(3, vec![0u8; 512]);
        assert_eq!(page.page_type().unwrap(), PageType::Free);
    }

    #[test]
    fn test_invalid_type_byte_is_corruption() {
        let mut page = Page::new(1, 512, PageType::BTreeLeaf, 1);
        page.data[0] = 0xEE;
        assert!(matches!(page.page_type(), Err(Error::Corrupted { .. })));
    }
}
