//! The meta page: the root of every committed state.

use super::{PAGE_HEADER_SIZE, Page, META_PAGE_ID, read_u64};
use crate::error::{PageId, PageType, Result};

/// Decoded contents of the meta page.
///
/// # Layout (after the 16-byte page header)
///
/// ```text
/// Offset  Size  Field
/// 16      8     B-tree root page (0 = empty tree)
/// 24      8     Free-list head page (0 = empty list)
/// 32      8     Free-list length
/// 40      8     Next unallocated page id
/// 48      8     Last commit sequence
/// 56      8     Pages freed but not yet linked into the free list
/// 64      8     Live entry count
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaPage {
    /// Root page of the B-tree, 0 if empty.
    pub root: PageId,
    /// Head of the on-disk free list, 0 if empty.
    pub free_head: PageId,
    /// Number of pages on the free list.
    pub free_count: u64,
    /// One past the highest allocated page.
    pub next_page: PageId,
    /// Sequence number of the last committed transaction.
    pub commit_seq: u64,
    /// Pages released by commits but still awaiting reader drain.
    pub pending_free_count: u64,
    /// Number of keys in the tree.
    pub entry_count: u64,
}

impl MetaPage {
    /// Meta for a freshly created store.
    pub fn empty() -> Self {
        Self { next_page: super::FIRST_DATA_PAGE, ..Self::default() }
    }

    /// Encodes into a logical page of `page_size` bytes.
    pub fn to_page(&self, page_size: usize) -> Page {
        let mut page = Page::new(META_PAGE_ID, page_size, PageType::Meta, self.commit_seq);
        let fields = [
            self.root,
            self.free_head,
            self.free_count,
            self.next_page,
            self.commit_seq,
            self.pending_free_count,
            self.entry_count,
        ];
        for (i, value) in fields.iter().enumerate() {
            let offset = PAGE_HEADER_SIZE + i * 8;
            page.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        }
        page
    }

    /// Decodes from the logical meta page.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PageTypeMismatch`] if the page is not a meta page
    /// and [`crate::Error::Corrupted`] if the counters are inconsistent.
    pub fn from_page(page: &Page) -> Result<Self> {
        page.expect_type(PageType::Meta)?;
        let field = |i: usize| read_u64(&page.data, PAGE_HEADER_SIZE + i * 8);
        let meta = Self {
            root: field(0),
            free_head: field(1),
            free_count: field(2),
            next_page: field(3),
            commit_seq: field(4),
            pending_free_count: field(5),
            entry_count: field(6),
        };

        if meta.next_page < super::FIRST_DATA_PAGE
            || meta.root >= meta.next_page
            || meta.free_head >= meta.next_page
            || meta.free_count >= meta.next_page
        {
            return Err(crate::Error::corrupted(format!(
                "Inconsistent meta page: root={} free_head={} free_count={} next_page={}",
                meta.root, meta.free_head, meta.free_count, meta.next_page
            )));
        }
        Ok(meta)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_meta_round_trip() {
        let meta = MetaPage {
            root: 12,
            free_head: 7,
            free_count: 3,
            next_page: 40,
            commit_seq: 99,
            pending_free_count: 2,
            entry_count: 1234,
        };
        let page = meta.to_page(4056);
        assert_eq!(page.commit_seq(), 99);
        assert_eq!(MetaPage::from_page(&page).unwrap(), meta);
    }

    #[test]
    fn test_empty_meta() {
        let meta = MetaPage::empty();
        assert_eq!(meta.root, 0);
        assert_eq!(meta.next_page, 1);
        assert_eq!(MetaPage::from_page(&meta.to_page(472)).unwrap(), meta);
    }

    #[test]
    fn test_root_beyond_next_page_is_corrupt() {
        let meta = MetaPage { root: 50, next_page: 10, ..MetaPage::empty() };
        assert!(matches!(MetaPage::from_page(&meta.to_page(472)), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_wrong_page_type_rejected() {
        let page = Page::new(META_PAGE_ID, 472, PageType::BTreeLeaf, 1);
        assert!(matches!(MetaPage::from_page(&page), Err(Error::PageTypeMismatch { .. })));
    }
}
