//! Free-list page allocator.
//!
//! The list lives in the file: every free page stores the id of the next
//! free page, and the meta page records the head and length. The allocator
//! keeps an in-memory mirror (`free`, head last) so popping never reads the
//! file.

use super::{PAGE_HEADER_SIZE, Page, read_u64};
use crate::error::{Error, PageId, PageType, Result};

/// On-page format of a free-list link.
///
/// ```text
/// [ page header: type = Free ][ next: u64 (0 = end of list) ]
/// ```
pub struct FreeListPage;

impl FreeListPage {
    /// Builds the image for `page_id` linking to `next`.
    pub fn build(page_id: PageId, page_size: usize, next: PageId, commit_seq: u64) -> Page {
        let mut page = Page::new(page_id, page_size, PageType::Free, commit_seq);
        page.data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 8].copy_from_slice(&next.to_le_bytes());
        page
    }

    /// Reads the next pointer from a free page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] if the page is not free.
    pub fn next(page: &Page) -> Result<PageId> {
        page.expect_type(PageType::Free)?;
        Ok(read_u64(&page.data, PAGE_HEADER_SIZE))
    }
}

/// Free-list based page allocator.
///
/// Pages are allocated from the free list. When the free list is empty,
/// new pages are allocated by extending the file. Mutated only by the
/// writer; the database keeps it behind a mutex.
#[derive(Debug, Clone)]
pub struct PageAllocator {
    /// Free pages available for reuse; the last element is the list head.
    free: Vec<PageId>,
    /// Next page ID to allocate if free list is empty.
    next_page: PageId,
}

impl PageAllocator {
    /// Creates an allocator with an empty free list.
    pub fn new(next_page: PageId) -> Self {
        Self { free: Vec::new(), next_page }
    }

    /// Loads the free list by walking it from `head`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the chain is longer or shorter than
    /// `count`, loops, or points outside the file.
    pub fn load(
        head: PageId,
        count: u64,
        next_page: PageId,
        mut read: impl FnMut(PageId) -> Result<Page>,
    ) -> Result<Self> {
        let mut chain = Vec::with_capacity(count as usize);
        let mut current = head;
        while current != 0 {
            if chain.len() as u64 >= count {
                return Err(Error::corrupted(format!(
                    "free list longer than its recorded length {count}"
                )));
            }
            if current >= next_page {
                return Err(Error::corrupted(format!(
                    "free list entry {current} beyond page count {next_page}"
                )));
            }
            chain.push(current);
            current = FreeListPage::next(&read(current)?)?;
        }
        if chain.len() as u64 != count {
            return Err(Error::corrupted(format!(
                "free list holds {} pages, meta records {count}",
                chain.len()
            )));
        }

        chain.reverse();
        Ok(Self { free: chain, next_page })
    }

    /// Takes a page from the free list, if any.
    pub fn pop_free(&mut self) -> Option<PageId> {
        self.free.pop()
    }

    /// Allocates a page id past the end of the file.
    pub fn allocate_new(&mut self) -> PageId {
        let page_id = self.next_page;
        self.next_page += 1;
        page_id
    }

    /// Pushes `page_id` onto the free list, returning the page image that
    /// must be written for the link to be durable.
    pub fn push_free(&mut self, page_id: PageId, page_size: usize, commit_seq: u64) -> Page {
        let next = self.head();
        self.free.push(page_id);
        FreeListPage::build(page_id, page_size, next, commit_seq)
    }

    /// Undoes a transaction's effect: drops the `pushed` most recent
    /// links, puts back `popped` pages (in pop order) and resets the
    /// high-water mark.
    pub fn restore(&mut self, popped: &[PageId], pushed: usize, next_page: PageId) {
        let keep = self.free.len().saturating_sub(pushed);
        self.free.truncate(keep);
        self.free.extend(popped.iter().rev());
        self.next_page = next_page;
    }

    /// Empties the free list before a recovery rebuild.
    pub fn clear(&mut self) {
        self.free.clear();
    }

    /// Current head of the free list (0 if empty).
    pub fn head(&self) -> PageId {
        self.free.last().copied().unwrap_or(0)
    }

    /// Returns the number of free pages in the free list.
    pub fn free_count(&self) -> u64 {
        self.free.len() as u64
    }

    /// Free pages, head last.
    pub fn free_pages(&self) -> &[PageId] {
        &self.free
    }

    /// Returns the next page ID that would be allocated past the free list.
    pub fn next_page(&self) -> PageId {
        self.next_page
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const PAGE: usize = 472;

    #[test]
    fn test_allocate_new_pages() {
        let mut allocator = PageAllocator::new(1);

        assert_eq!(allocator.pop_free(), None);
        assert_eq!(allocator.allocate_new(), 1);
        assert_eq!(allocator.allocate_new(), 2);
        assert_eq!(allocator.next_page(), 3);
    }

    #[test]
    fn test_push_links_to_previous_head() {
        let mut allocator = PageAllocator::new(10);

        let first = allocator.push_free(4, PAGE, 1);
        let second = allocator.push_free(7, PAGE, 1);

        assert_eq!(FreeListPage::next(&first).unwrap(), 0);
        assert_eq!(FreeListPage::next(&second).unwrap(), 4);
        assert_eq!(allocator.head(), 7);
        assert_eq!(allocator.free_count(), 2);

        // LIFO reuse
        assert_eq!(allocator.pop_free(), Some(7));
        assert_eq!(allocator.head(), 4);
    }

    #[test]
    fn test_load_walks_chain() {
        let mut allocator = PageAllocator::new(10);
        let pages: HashMap<PageId, Page> =
            [2, 5, 8].iter().map(|&id| (id, allocator.push_free(id, PAGE, 1))).collect();

        let loaded = PageAllocator::load(8, 3, 10, |id| Ok(pages[&id].clone())).unwrap();
        assert_eq!(loaded.free_pages(), &[2, 5, 8]);
        assert_eq!(loaded.head(), 8);
    }

    #[test]
    fn test_load_rejects_count_mismatch() {
        let mut allocator = PageAllocator::new(10);
        let pages: HashMap<PageId, Page> =
            [2, 5].iter().map(|&id| (id, allocator.push_free(id, PAGE, 1))).collect();

        let short = PageAllocator::load(5, 3, 10, |id| Ok(pages[&id].clone()));
        assert!(matches!(short, Err(Error::Corrupted { .. })));

        let long = PageAllocator::load(5, 1, 10, |id| Ok(pages[&id].clone()));
        assert!(matches!(long, Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_load_detects_cycle() {
        let a = FreeListPage::build(3, PAGE, 4, 1);
        let b = FreeListPage::build(4, PAGE, 3, 1);
        let result = PageAllocator::load(3, 2, 10, |id| Ok(if id == 3 { a.clone() } else { b.clone() }));
        assert!(matches!(result, Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_load_rejects_non_free_page() {
        let leaf = Page::new(3, PAGE, PageType::BTreeLeaf, 1);
        let result = PageAllocator::load(3, 1, 10, |_| Ok(leaf.clone()));
        assert!(matches!(result, Err(Error::PageTypeMismatch { .. })));
    }

    #[test]
    fn test_restore_undoes_transaction() {
        let mut allocator = PageAllocator::new(10);
        for id in [2, 3, 4] {
            allocator.push_free(id, PAGE, 1);
        }
        let before = allocator.clone();

        let popped = vec![allocator.pop_free().unwrap(), allocator.pop_free().unwrap()];
        allocator.allocate_new();
        allocator.push_free(9, PAGE, 2);

        allocator.restore(&popped, 1, 10);
        assert_eq!(allocator.free_pages(), before.free_pages());
        assert_eq!(allocator.next_page(), 10);
    }
}
