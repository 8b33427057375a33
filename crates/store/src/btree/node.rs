//! B-tree node structure and operations.
//!
//! ## Leaf Node Layout
//! ```text
//! [Page Header: 16 bytes]           item_count = cell count
//! [Free Space Start: 2 bytes]
//! [Free Space End: 2 bytes]
//! [Cell Pointers: 2 bytes each, in key order]
//! ... free space ...
//! [Cells: (key_len:2, cell_len:2, key_bytes, value_cell)]
//! ```
//!
//! ## Branch Node Layout
//! ```text
//! [Page Header: 16 bytes]           item_count = separator count
//! [Free Space Start: 2 bytes]
//! [Free Space End: 2 bytes]
//! [Rightmost Child: 8 bytes]
//! [Cell Pointers: 2 bytes each]
//! ... free space ...
//! [Cells: (key_len:2, child_page:8, key_bytes)]
//! ```
//!
//! Cell `i` of a branch holds separator `i` and the child to its left: every
//! key in that child is `< separator i`. The rightmost child holds keys
//! `>=` the last separator.
//!
//! Readers use the zero-copy [`LeafNodeRef`] / [`BranchNodeRef`] views, which
//! validate every pointer once so corrupted pages surface as errors instead
//! of panics. Writers decode into owned [`LeafNode`] / [`BranchNode`] values,
//! edit them, and rebuild the page from scratch, so pages never carry dead
//! cell space.

use std::cmp::Ordering;

use crate::{
    error::{Error, PageId, PageType, Result},
    page::{PAGE_HEADER_SIZE, Page, read_u16, read_u64},
};

const FREE_START_OFFSET: usize = PAGE_HEADER_SIZE;
const FREE_END_OFFSET: usize = PAGE_HEADER_SIZE + 2;
const RIGHTMOST_CHILD_OFFSET: usize = PAGE_HEADER_SIZE + 4;

/// Offset where cell pointers begin in leaf nodes.
pub const LEAF_HEADER_SIZE: usize = PAGE_HEADER_SIZE + 4;
/// Offset where cell pointers begin in branch nodes (after rightmost child).
pub const BRANCH_HEADER_SIZE: usize = PAGE_HEADER_SIZE + 4 + 8;

/// Size of a cell pointer.
const CELL_PTR_SIZE: usize = 2;
pub(crate) const LEAF_CELL_OVERHEAD: usize = CELL_PTR_SIZE + 2 + 2;
const BRANCH_CELL_OVERHEAD: usize = CELL_PTR_SIZE + 2 + 8;

/// A search result for finding a key in a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Key was found at this index.
    Found(usize),
    /// Key was not found; this is where it would be inserted.
    NotFound(usize),
}

impl SearchResult {
    /// Get the index, whether found or not.
    pub fn index(&self) -> usize {
        match self {
            SearchResult::Found(i) | SearchResult::NotFound(i) => *i,
        }
    }

    /// Returns true if the key was found.
    pub fn is_found(&self) -> bool {
        matches!(self, SearchResult::Found(_))
    }
}

fn binary_search<'k>(count: usize, key: &[u8], key_at: impl Fn(usize) -> &'k [u8]) -> SearchResult {
    let mut lo = 0;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match key.cmp(key_at(mid)) {
            Ordering::Equal => return SearchResult::Found(mid),
            Ordering::Less => hi = mid,
            Ordering::Greater => lo = mid + 1,
        }
    }
    SearchResult::NotFound(lo)
}

/// Byte capacity available to leaf cells and pointers.
pub fn leaf_capacity(page_size: usize) -> usize {
    page_size - LEAF_HEADER_SIZE
}

/// Byte capacity available to branch cells and pointers.
pub fn branch_capacity(page_size: usize) -> usize {
    page_size - BRANCH_HEADER_SIZE
}

/// Largest leaf entry (pointer included) a node accepts: a quarter of the
/// leaf capacity, so a split always leaves both halves within capacity.
pub fn cell_budget(page_size: usize) -> usize {
    leaf_capacity(page_size) / 4
}

/// Largest key accepted for `page_size`.
pub fn max_key_len(page_size: usize) -> usize {
    cell_budget(page_size) - 64
}

fn corrupt(page_id: PageId, what: &str) -> Error {
    Error::corrupted(format!("node page {page_id}: {what}"))
}

/// Validates the free-space markers and returns the cell count.
fn check_layout(page: &Page, header_size: usize, per_cell_min: usize) -> Result<usize> {
    let count = page.item_count() as usize;
    let free_start = read_u16(&page.data, FREE_START_OFFSET) as usize;
    let free_end = read_u16(&page.data, FREE_END_OFFSET) as usize;
    if free_start != header_size + count * CELL_PTR_SIZE
        || free_end < free_start
        || free_end > page.size()
        || count * per_cell_min > page.size()
    {
        return Err(corrupt(page.id, "inconsistent free-space markers"));
    }
    Ok(count)
}

// ============================================================================
// Read-only node accessors
// ============================================================================

/// Read-only accessor for leaf node data.
///
/// Construction checks every cell pointer and length, so the accessors
/// below never index out of bounds.
pub struct LeafNodeRef<'a> {
    data: &'a [u8],
    count: usize,
}

impl<'a> LeafNodeRef<'a> {
    /// Create a read-only view of a leaf node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] if the page is not a leaf and
    /// [`Error::Corrupted`] if any cell lies outside the page.
    pub fn from_page(page: &'a Page) -> Result<Self> {
        page.expect_type(PageType::BTreeLeaf)?;
        let count = check_layout(page, LEAF_HEADER_SIZE, LEAF_CELL_OVERHEAD)?;
        let node = Self { data: &page.data, count };
        for i in 0..count {
            let offset = node.cell_ptr(i);
            if offset < LEAF_HEADER_SIZE + count * CELL_PTR_SIZE || offset + 4 > page.size() {
                return Err(corrupt(page.id, "cell pointer out of bounds"));
            }
            let key_len = read_u16(node.data, offset) as usize;
            let cell_len = read_u16(node.data, offset + 2) as usize;
            if offset + 4 + key_len + cell_len > page.size() {
                return Err(corrupt(page.id, "cell extends past page end"));
            }
        }
        Ok(node)
    }

    /// Get the number of cells.
    pub fn cell_count(&self) -> usize {
        self.count
    }

    fn cell_ptr(&self, index: usize) -> usize {
        read_u16(self.data, LEAF_HEADER_SIZE + index * CELL_PTR_SIZE) as usize
    }

    /// Get the key at a given index.
    pub fn key(&self, index: usize) -> &'a [u8] {
        let offset = self.cell_ptr(index);
        let key_len = read_u16(self.data, offset) as usize;
        &self.data[offset + 4..offset + 4 + key_len]
    }

    /// Get the encoded value cell at a given index.
    pub fn value_cell(&self, index: usize) -> &'a [u8] {
        let offset = self.cell_ptr(index);
        let key_len = read_u16(self.data, offset) as usize;
        let cell_len = read_u16(self.data, offset + 2) as usize;
        &self.data[offset + 4 + key_len..offset + 4 + key_len + cell_len]
    }

    /// Binary search for a key.
    pub fn search(&self, key: &[u8]) -> SearchResult {
        binary_search(self.count, key, |i| self.key(i))
    }
}

/// Read-only accessor for branch node data.
pub struct BranchNodeRef<'a> {
    data: &'a [u8],
    count: usize,
}

impl<'a> BranchNodeRef<'a> {
    /// Create a read-only view of a branch node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] if the page is not a branch and
    /// [`Error::Corrupted`] if any cell lies outside the page.
    pub fn from_page(page: &'a Page) -> Result<Self> {
        page.expect_type(PageType::BTreeBranch)?;
        let count = check_layout(page, BRANCH_HEADER_SIZE, BRANCH_CELL_OVERHEAD)?;
        let node = Self { data: &page.data, count };
        for i in 0..count {
            let offset = node.cell_ptr(i);
            if offset < BRANCH_HEADER_SIZE + count * CELL_PTR_SIZE || offset + 10 > page.size() {
                return Err(corrupt(page.id, "cell pointer out of bounds"));
            }
            let key_len = read_u16(node.data, offset) as usize;
            if offset + 10 + key_len > page.size() {
                return Err(corrupt(page.id, "cell extends past page end"));
            }
        }
        Ok(node)
    }

    /// Get the number of separator keys.
    pub fn cell_count(&self) -> usize {
        self.count
    }

    /// Number of children (separators plus the rightmost child).
    pub fn child_count(&self) -> usize {
        self.count + 1
    }

    fn cell_ptr(&self, index: usize) -> usize {
        read_u16(self.data, BRANCH_HEADER_SIZE + index * CELL_PTR_SIZE) as usize
    }

    /// Get the separator key at a given index.
    pub fn key(&self, index: usize) -> &'a [u8] {
        let offset = self.cell_ptr(index);
        let key_len = read_u16(self.data, offset) as usize;
        &self.data[offset + 10..offset + 10 + key_len]
    }

    /// Child at `index`; `index == cell_count()` is the rightmost child.
    pub fn child(&self, index: usize) -> PageId {
        if index == self.count {
            return self.rightmost_child();
        }
        read_u64(self.data, self.cell_ptr(index) + 2)
    }

    /// Get the rightmost child.
    pub fn rightmost_child(&self) -> PageId {
        read_u64(self.data, RIGHTMOST_CHILD_OFFSET)
    }

    /// Index of the child whose subtree may contain `key`.
    pub fn child_index_for(&self, key: &[u8]) -> usize {
        match binary_search(self.count, key, |i| self.key(i)) {
            // key == separator i lives right of it
            SearchResult::Found(i) => i + 1,
            SearchResult::NotFound(i) => i,
        }
    }
}

// ============================================================================
// Owned nodes (write path)
// ============================================================================

/// One leaf entry: key plus encoded value cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    /// Entry key.
    pub key: Vec<u8>,
    /// Encoded value cell (see [`super::overflow::ValueCell`]).
    pub cell: Vec<u8>,
}

impl LeafEntry {
    /// Bytes this entry occupies in a leaf, pointer included.
    pub fn size(&self) -> usize {
        LEAF_CELL_OVERHEAD + self.key.len() + self.cell.len()
    }
}

/// Decoded leaf node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    /// Entries in key order.
    pub entries: Vec<LeafEntry>,
}

impl LeafNode {
    /// Decodes a leaf page.
    ///
    /// # Errors
    ///
    /// See [`LeafNodeRef::from_page`].
    pub fn from_page(page: &Page) -> Result<Self> {
        let node = LeafNodeRef::from_page(page)?;
        let entries = (0..node.cell_count())
            .map(|i| LeafEntry { key: node.key(i).to_vec(), cell: node.value_cell(i).to_vec() })
            .collect();
        Ok(Self { entries })
    }

    /// Binary search for a key.
    pub fn search(&self, key: &[u8]) -> SearchResult {
        binary_search(self.entries.len(), key, |i| self.entries[i].key.as_slice())
    }

    /// Bytes used by live entries.
    pub fn used_bytes(&self) -> usize {
        self.entries.iter().map(LeafEntry::size).sum()
    }

    /// Whether the entries fit in one page of `page_size`.
    pub fn fits(&self, page_size: usize) -> bool {
        self.used_bytes() <= leaf_capacity(page_size)
    }

    /// Encodes into a fresh leaf page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the entries do not fit.
    pub fn to_page(&self, page_id: PageId, page_size: usize, commit_seq: u64) -> Result<Page> {
        if !self.fits(page_size) {
            return Err(corrupt(page_id, "leaf entries exceed page capacity"));
        }
        let mut page = Page::new(page_id, page_size, PageType::BTreeLeaf, commit_seq);
        let mut free_end = page_size;
        for (i, entry) in self.entries.iter().enumerate() {
            let cell_len = 4 + entry.key.len() + entry.cell.len();
            free_end -= cell_len;
            let data = &mut page.data[free_end..free_end + cell_len];
            data[0..2].copy_from_slice(&(entry.key.len() as u16).to_le_bytes());
            data[2..4].copy_from_slice(&(entry.cell.len() as u16).to_le_bytes());
            data[4..4 + entry.key.len()].copy_from_slice(&entry.key);
            data[4 + entry.key.len()..].copy_from_slice(&entry.cell);

            let ptr = LEAF_HEADER_SIZE + i * CELL_PTR_SIZE;
            page.data[ptr..ptr + 2].copy_from_slice(&(free_end as u16).to_le_bytes());
        }
        finish_layout(&mut page, LEAF_HEADER_SIZE, self.entries.len(), free_end);
        Ok(page)
    }
}

/// Decoded branch node: `children.len() == keys.len() + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchNode {
    /// Separator keys in order.
    pub keys: Vec<Vec<u8>>,
    /// Child pages; `children[i]` holds keys below `keys[i]`.
    pub children: Vec<PageId>,
}

impl BranchNode {
    /// A branch with one separator and two children (new root after a split).
    pub fn new_root(left: PageId, separator: Vec<u8>, right: PageId) -> Self {
        Self { keys: vec![separator], children: vec![left, right] }
    }

    /// Decodes a branch page.
    ///
    /// # Errors
    ///
    /// See [`BranchNodeRef::from_page`].
    pub fn from_page(page: &Page) -> Result<Self> {
        let node = BranchNodeRef::from_page(page)?;
        Ok(Self {
            keys: (0..node.cell_count()).map(|i| node.key(i).to_vec()).collect(),
            children: (0..node.child_count()).map(|i| node.child(i)).collect(),
        })
    }

    /// Index of the child whose subtree may contain `key`.
    pub fn child_index_for(&self, key: &[u8]) -> usize {
        match binary_search(self.keys.len(), key, |i| self.keys[i].as_slice()) {
            SearchResult::Found(i) => i + 1,
            SearchResult::NotFound(i) => i,
        }
    }

    /// Bytes a separator occupies, pointer included.
    pub fn key_size(key: &[u8]) -> usize {
        BRANCH_CELL_OVERHEAD + key.len()
    }

    /// Bytes used by separators.
    pub fn used_bytes(&self) -> usize {
        self.keys.iter().map(|k| Self::key_size(k)).sum()
    }

    /// Whether the separators fit in one page of `page_size`.
    pub fn fits(&self, page_size: usize) -> bool {
        self.used_bytes() <= branch_capacity(page_size)
    }

    /// Encodes into a fresh branch page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the node is malformed or does not fit.
    pub fn to_page(&self, page_id: PageId, page_size: usize, commit_seq: u64) -> Result<Page> {
        if self.children.len() != self.keys.len() + 1 {
            return Err(corrupt(page_id, "branch child count does not match separators"));
        }
        if !self.fits(page_size) {
            return Err(corrupt(page_id, "branch separators exceed page capacity"));
        }
        let mut page = Page::new(page_id, page_size, PageType::BTreeBranch, commit_seq);
        let mut free_end = page_size;
        for (i, key) in self.keys.iter().enumerate() {
            let cell_len = 10 + key.len();
            free_end -= cell_len;
            let data = &mut page.data[free_end..free_end + cell_len];
            data[0..2].copy_from_slice(&(key.len() as u16).to_le_bytes());
            data[2..10].copy_from_slice(&self.children[i].to_le_bytes());
            data[10..].copy_from_slice(key);

            let ptr = BRANCH_HEADER_SIZE + i * CELL_PTR_SIZE;
            page.data[ptr..ptr + 2].copy_from_slice(&(free_end as u16).to_le_bytes());
        }
        let rightmost = self.children[self.keys.len()];
        page.data[RIGHTMOST_CHILD_OFFSET..RIGHTMOST_CHILD_OFFSET + 8]
            .copy_from_slice(&rightmost.to_le_bytes());
        finish_layout(&mut page, BRANCH_HEADER_SIZE, self.keys.len(), free_end);
        Ok(page)
    }
}

fn finish_layout(page: &mut Page, header_size: usize, count: usize, free_end: usize) {
    let free_start = header_size + count * CELL_PTR_SIZE;
    page.set_item_count(count as u16);
    page.data[FREE_START_OFFSET..FREE_START_OFFSET + 2]
        .copy_from_slice(&(free_start as u16).to_le_bytes());
    page.data[FREE_END_OFFSET..FREE_END_OFFSET + 2]
        .copy_from_slice(&(free_end as u16).to_le_bytes());
}
