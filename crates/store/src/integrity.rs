//! Integrity scrubber for detecting silent data corruption.
//!
//! Walks every page reachable from a committed root and checks:
//! - Page authentication (each read decrypts and verifies the page tag)
//! - Page types (branches hold branches or leaves, chains hold overflow pages)
//! - Key ordering inside every node and separator bounds across levels
//! - Child and overflow pointers stay inside the file
//! - Every page is used exactly once: by the tree, the free list, or a
//!   deferred free

use std::collections::HashSet;

use crate::{
    btree::{
        MAX_DEPTH, PageProvider,
        node::{BranchNodeRef, LeafNodeRef},
        overflow,
    },
    error::{Error, ErrorKind, PageId, PageType, Result},
    page::{FIRST_DATA_PAGE, FreeListPage},
};

/// Result of an integrity scrub.
#[derive(Debug, Clone, Default)]
pub struct ScrubResult {
    /// Number of pages checked.
    pub pages_checked: u64,
    /// Pages that failed decryption or authentication.
    pub authentication_errors: u64,
    /// Number of structural errors detected (key ordering, invalid page types).
    pub structural_errors: u64,
    /// Pages leaked, double-used or out of range.
    pub accounting_errors: u64,
    /// Detailed error descriptions.
    pub errors: Vec<ScrubError>,
}

impl ScrubResult {
    /// True when no problem was found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Total problems found.
    pub fn error_count(&self) -> u64 {
        self.authentication_errors + self.structural_errors + self.accounting_errors
    }

    fn structural(&mut self, page_id: PageId, description: String) {
        self.structural_errors += 1;
        self.errors.push(ScrubError { page_id, description });
    }

    fn accounting(&mut self, page_id: PageId, description: String) {
        self.accounting_errors += 1;
        self.errors.push(ScrubError { page_id, description });
    }

    fn read_failed(&mut self, page_id: PageId, error: &Error) {
        if error.kind() == ErrorKind::Authentication {
            self.authentication_errors += 1;
        } else {
            self.structural_errors += 1;
        }
        self.errors.push(ScrubError { page_id, description: format!("Failed to read page {page_id}: {error}") });
    }
}

/// A single integrity error detected during scrubbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubError {
    /// The page where the error was detected.
    pub page_id: PageId,
    /// Human-readable description of the error.
    pub description: String,
}

/// Key interval a subtree must stay inside: `[lower, upper)`.
#[derive(Clone, Copy)]
struct KeyBounds<'k> {
    lower: Option<&'k [u8]>,
    upper: Option<&'k [u8]>,
}

impl KeyBounds<'_> {
    fn contains(&self, key: &[u8]) -> bool {
        self.lower.is_none_or(|lower| key >= lower) && self.upper.is_none_or(|upper| key < upper)
    }
}

/// Integrity scrubber over one committed snapshot.
///
/// Reads go through the provider, so every page is decrypted and
/// authenticated on the way.
pub struct IntegrityScrubber<'a, P: PageProvider> {
    provider: &'a P,
    root: PageId,
}

impl<'a, P: PageProvider> IntegrityScrubber<'a, P> {
    /// Creates a scrubber for the tree rooted at `root`.
    pub fn new(provider: &'a P, root: PageId) -> Self {
        Self { provider, root }
    }

    /// Runs every check.
    ///
    /// `free_pages` is the free list (head last) and `pending` the pages
    /// released by commits but not yet linked into it. Together with the
    /// tree they must cover `[1, page_limit)` exactly once.
    pub fn run(&self, free_pages: &[PageId], pending: &[PageId]) -> ScrubResult {
        let mut result = ScrubResult::default();
        let mut seen = HashSet::new();
        let mut leaf_depth = None;

        if self.root != 0 {
            let bounds = KeyBounds { lower: None, upper: None };
            self.verify_subtree(self.root, 1, bounds, &mut leaf_depth, &mut seen, &mut result);
        }
        self.verify_free_list(free_pages, &mut seen, &mut result);

        for &page_id in pending {
            self.claim(page_id, "pending free", &mut seen, &mut result);
        }

        for page_id in FIRST_DATA_PAGE..self.provider.page_limit() {
            if !seen.contains(&page_id) {
                result.accounting(page_id, format!("Page {page_id} is neither in use nor free"));
            }
        }
        result
    }

    /// Records `page_id` as used, reporting pointers outside the file and
    /// pages used twice. Returns false if the page must not be visited.
    fn claim(&self, page_id: PageId, owner: &str, seen: &mut HashSet<PageId>, result: &mut ScrubResult) -> bool {
        if page_id < FIRST_DATA_PAGE || page_id >= self.provider.page_limit() {
            result.accounting(page_id, format!("{owner} page {page_id} is outside the file"));
            return false;
        }
        if !seen.insert(page_id) {
            result.accounting(page_id, format!("{owner} page {page_id} is already in use"));
            return false;
        }
        true
    }

    fn verify_subtree(
        &self,
        page_id: PageId,
        depth: usize,
        bounds: KeyBounds<'_>,
        leaf_depth: &mut Option<usize>,
        seen: &mut HashSet<PageId>,
        result: &mut ScrubResult,
    ) {
        if depth > MAX_DEPTH {
            result.structural(page_id, format!("Tree deeper than {MAX_DEPTH} levels at page {page_id}"));
            return;
        }
        if !self.claim(page_id, "Tree", seen, result) {
            return;
        }
        let page = match self.provider.read_page(page_id) {
            Ok(page) => page,
            Err(e) => {
                result.read_failed(page_id, &e);
                return;
            },
        };
        result.pages_checked += 1;

        match page.page_type() {
            Ok(PageType::BTreeLeaf) => match LeafNodeRef::from_page(&page) {
                Ok(leaf) => {
                    if *leaf_depth.get_or_insert(depth) != depth {
                        result.structural(page_id, format!("Leaf page {page_id} at depth {depth}"));
                    }
                    self.verify_leaf(page_id, &leaf, bounds, seen, result);
                },
                Err(e) => result.structural(page_id, e.to_string()),
            },
            Ok(PageType::BTreeBranch) => match BranchNodeRef::from_page(&page) {
                Ok(branch) => self.verify_branch(page_id, &branch, depth, bounds, leaf_depth, seen, result),
                Err(e) => result.structural(page_id, e.to_string()),
            },
            Ok(other) => {
                result.structural(page_id, format!("Tree page {page_id} has type {other:?}"));
            },
            Err(e) => result.structural(page_id, e.to_string()),
        }
    }

    fn verify_leaf(
        &self,
        page_id: PageId,
        leaf: &LeafNodeRef<'_>,
        bounds: KeyBounds<'_>,
        seen: &mut HashSet<PageId>,
        result: &mut ScrubResult,
    ) {
        for i in 0..leaf.cell_count() {
            let key = leaf.key(i);
            if i > 0 && leaf.key(i - 1) >= key {
                result.structural(page_id, format!("Leaf page {page_id}: key {i} out of order"));
            }
            if !bounds.contains(key) {
                result.structural(page_id, format!("Leaf page {page_id}: key {i} outside parent separators"));
            }
            match overflow::chain_pages(self.provider, leaf.value_cell(i)) {
                Ok(chain) => {
                    for overflow_page in chain {
                        if self.claim(overflow_page, "Overflow", seen, result) {
                            result.pages_checked += 1;
                        }
                    }
                },
                Err(e) => result.structural(page_id, format!("Leaf page {page_id}: value {i}: {e}")),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_branch(
        &self,
        page_id: PageId,
        branch: &BranchNodeRef<'_>,
        depth: usize,
        bounds: KeyBounds<'_>,
        leaf_depth: &mut Option<usize>,
        seen: &mut HashSet<PageId>,
        result: &mut ScrubResult,
    ) {
        for i in 0..branch.cell_count() {
            let key = branch.key(i);
            if i > 0 && branch.key(i - 1) >= key {
                result.structural(page_id, format!("Branch page {page_id}: separator {i} out of order"));
            }
            if !bounds.contains(key) {
                result.structural(page_id, format!("Branch page {page_id}: separator {i} outside parent bounds"));
            }
        }
        for i in 0..branch.child_count() {
            let child_bounds = KeyBounds {
                lower: if i == 0 { bounds.lower } else { Some(branch.key(i - 1)) },
                upper: if i == branch.cell_count() { bounds.upper } else { Some(branch.key(i)) },
            };
            self.verify_subtree(branch.child(i), depth + 1, child_bounds, leaf_depth, seen, result);
        }
    }

    /// Walks the free list from its head, checking each link.
    fn verify_free_list(&self, free_pages: &[PageId], seen: &mut HashSet<PageId>, result: &mut ScrubResult) {
        let mut chain = free_pages.iter().rev().peekable();
        while let Some(&page_id) = chain.next() {
            if !self.claim(page_id, "Free", seen, result) {
                continue;
            }
            let expected_next = chain.peek().map_or(0, |&&next| next);
            let link = self.provider.read_page(page_id).and_then(|page| FreeListPage::next(&page));
            result.pages_checked += 1;
            match link {
                Ok(next) if next == expected_next => {},
                Ok(next) => result.structural(
                    page_id,
                    format!("Free page {page_id} links to {next}, expected {expected_next}"),
                ),
                Err(e) => result.read_failed(page_id, &e),
            }
        }
    }
}

/// Collects every page the tree rooted at `root` uses, overflow chains
/// included.
///
/// # Errors
///
/// Returns the first read error, or [`Error::Corrupted`] if a page is
/// reachable twice or the tree is too deep.
pub(crate) fn reachable_pages<P: PageProvider>(provider: &P, root: PageId) -> Result<HashSet<PageId>> {
    let mut seen = HashSet::new();
    if root == 0 {
        return Ok(seen);
    }
    let mut stack = vec![(root, 1usize)];
    while let Some((page_id, depth)) = stack.pop() {
        if depth > MAX_DEPTH {
            return Err(Error::corrupted(format!("tree deeper than {MAX_DEPTH} levels")));
        }
        if page_id < FIRST_DATA_PAGE || page_id >= provider.page_limit() || !seen.insert(page_id) {
            return Err(Error::corrupted(format!("tree page {page_id} out of range or reachable twice")));
        }
        let page = provider.read_page(page_id)?;
        if page.page_type()? == PageType::BTreeLeaf {
            let leaf = LeafNodeRef::from_page(&page)?;
            for i in 0..leaf.cell_count() {
                for overflow_page in overflow::chain_pages(provider, leaf.value_cell(i))? {
                    if !seen.insert(overflow_page) {
                        return Err(Error::corrupted(format!("overflow page {overflow_page} reachable twice")));
                    }
                }
            }
        } else {
            let branch = BranchNodeRef::from_page(&page)?;
            stack.extend((0..branch.child_count()).map(|i| (branch.child(i), depth + 1)));
        }
    }
    Ok(seen)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        btree::{BTree, InsertMode, PageProviderMut, tests::MemProvider},
        page::Page,
    };

    const PAGE_SIZE: usize = 472;

    /// Builds a multi-level tree, sealing between inserts so copy-on-write
    /// frees pages.
    fn build_tree(count: u32) -> (MemProvider, PageId) {
        let mut provider = MemProvider::new(PAGE_SIZE);
        let mut root = 0;
        for batch in (0..count).collect::<Vec<_>>().chunks(10) {
            let mut tree = BTree::new(root, provider);
            for &i in batch {
                let value = if i % 50 == 0 { vec![i as u8; 1500] } else { vec![i as u8; 20] };
                tree.insert(&i.to_be_bytes(), &value, InsertMode::Upsert).unwrap();
            }
            root = tree.root_page();
            provider = tree.into_provider();
            provider.seal();
        }
        (provider, root)
    }

    /// Provider whose reads of one page fail authentication.
    struct Tampered {
        inner: MemProvider,
        bad: PageId,
    }

    impl PageProvider for Tampered {
        fn read_page(&self, page_id: PageId) -> Result<Page> {
            if page_id == self.bad {
                return Err(Error::Authentication { page_id });
            }
            self.inner.read_page(page_id)
        }

        fn usable_size(&self) -> usize {
            self.inner.usable_size()
        }

        fn page_limit(&self) -> PageId {
            self.inner.page_limit()
        }
    }

    #[test]
    fn test_scrub_empty_tree() {
        let provider = MemProvider::new(PAGE_SIZE);
        let result = IntegrityScrubber::new(&provider, 0).run(&[], &[]);
        assert!(result.is_ok());
        assert_eq!(result.pages_checked, 0);
    }

    #[test]
    fn test_scrub_valid_tree() {
        let (provider, root) = build_tree(400);
        let result = IntegrityScrubber::new(&provider, root).run(&[], &provider.freed);
        assert!(result.is_ok(), "{:?}", result.errors);
        assert!(result.pages_checked > 10);
        assert_eq!(result.error_count(), 0);
    }

    #[test]
    fn test_reachable_pages_match_scrub() {
        let (provider, root) = build_tree(400);
        let reachable = reachable_pages(&provider, root).unwrap();
        let freed: HashSet<PageId> = provider.freed.iter().copied().collect();
        assert!(reachable.is_disjoint(&freed));
        assert_eq!(reachable.len() + freed.len(), (provider.page_limit() - FIRST_DATA_PAGE) as usize);
    }

    #[test]
    fn test_scrub_detects_leaked_pages() {
        let (provider, root) = build_tree(400);
        assert!(!provider.freed.is_empty());
        let result = IntegrityScrubber::new(&provider, root).run(&[], &[]);
        assert_eq!(result.accounting_errors, provider.freed.len() as u64);
        assert_eq!(result.structural_errors, 0);
    }

    #[test]
    fn test_scrub_detects_double_use() {
        let (provider, root) = build_tree(100);
        let mut pending = provider.freed.clone();
        pending.push(root);
        let result = IntegrityScrubber::new(&provider, root).run(&[], &pending);
        assert_eq!(result.accounting_errors, 1);
        assert_eq!(result.errors[0].page_id, root);
    }

    #[test]
    fn test_scrub_detects_authentication_failure() {
        let (provider, root) = build_tree(400);
        let freed = provider.freed.clone();
        let tampered = Tampered { inner: provider, bad: root };
        let result = IntegrityScrubber::new(&tampered, root).run(&[], &freed);
        assert_eq!(result.authentication_errors, 1);
        assert!(!result.is_ok());
        assert!(reachable_pages(&tampered, root).is_err());
    }

    #[test]
    fn test_scrub_detects_wrong_page_type() {
        let (mut provider, root) = build_tree(400);
        let leaf = reachable_pages(&provider, root)
            .unwrap()
            .into_iter()
            .find(|&id| provider.pages[&id].page_type().unwrap() == PageType::BTreeLeaf)
            .unwrap();
        provider.pages.insert(leaf, FreeListPage::build(leaf, PAGE_SIZE, 0, 1));
        let result = IntegrityScrubber::new(&provider, root).run(&[], &provider.freed);
        assert!(result.structural_errors >= 1);
    }

    #[test]
    fn test_scrub_checks_free_list_links() {
        let mut tree = BTree::new(0, MemProvider::new(PAGE_SIZE));
        tree.insert(b"a", b"1", InsertMode::Upsert).unwrap();
        let root = tree.root_page();
        let mut provider = tree.into_provider();
        for id in [2, 3] {
            provider.allocate_page().unwrap();
            provider.pages.insert(id, FreeListPage::build(id, PAGE_SIZE, 0, 1));
        }
        // head is last; page 3 should link to 2
        let result = IntegrityScrubber::new(&provider, root).run(&[2, 3], &[]);
        assert_eq!(result.structural_errors, 1);

        provider.pages.insert(3, FreeListPage::build(3, PAGE_SIZE, 2, 1));
        let result = IntegrityScrubber::new(&provider, root).run(&[2, 3], &[]);
        assert!(result.is_ok(), "{:?}", result.errors);
    }
}
