//! B+ tree implementation for the store engine.
//!
//! The implementation is designed for:
//! - Single-writer, multiple-reader access
//! - Copy-on-write: a page reachable from a committed root is never modified; the writer copies
//!   it to a fresh page and frees the old one once no snapshot can reach it
//! - Range scans through a root-to-leaf cursor
//!
//! ## Structure
//!
//! - `node.rs`: Slotted leaf and branch page layout
//! - `overflow.rs`: Value cells and overflow chains for large values
//! - `split.rs`: Byte-balanced splitting, merging and redistribution
//! - `cursor.rs`: Iterator and range query support

/// Cursor and range query support for B+ tree iteration.
pub mod cursor;
/// Low-level leaf and branch node operations on pages.
pub mod node;
/// Value cells and overflow page chains.
pub mod overflow;
/// Node splitting and rebalancing.
pub mod split;

use cursor::{BTreeIterator, Range};
use node::{BranchNode, BranchNodeRef, LeafEntry, LeafNode, LeafNodeRef, SearchResult, max_key_len};
use split::{
    Rebalance, branch_underflows, leaf_underflows, rebalance_branches, rebalance_leaves, split_branch,
    split_leaf,
};

use crate::{
    error::{Error, PageId, PageType, Result},
    page::{FIRST_DATA_PAGE, Page},
};

/// Maximum number of levels a traversal follows before declaring a cycle.
pub const MAX_DEPTH: usize = 32;

/// Read access to tree pages.
///
/// Read transactions resolve pages against a committed snapshot; write
/// transactions overlay their own dirty pages.
pub trait PageProvider {
    /// Reads a page by ID.
    fn read_page(&self, page_id: PageId) -> Result<Page>;

    /// Returns the logical (plaintext) page size.
    fn usable_size(&self) -> usize;

    /// Page ids at or above this bound are invalid.
    fn page_limit(&self) -> PageId;
}

/// Write access for a transaction modifying the tree.
pub trait PageProviderMut: PageProvider {
    /// Stages a page write.
    fn write_page(&mut self, page: Page);

    /// Allocates a page id for a new page.
    ///
    /// # Errors
    ///
    /// Returns an error if the free list cannot supply a page.
    fn allocate_page(&mut self) -> Result<PageId>;

    /// Releases a page. Pages visible to committed snapshots are kept until
    /// no reader can reach them.
    fn free_page(&mut self, page_id: PageId);

    /// Whether `page_id` was allocated by the current transaction and may be
    /// modified in place.
    fn owns(&self, page_id: PageId) -> bool;

    /// Commit sequence stamped into written pages.
    fn commit_seq(&self) -> u64;
}

impl<P: PageProvider + ?Sized> PageProvider for &P {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        (**self).read_page(page_id)
    }

    fn usable_size(&self) -> usize {
        (**self).usable_size()
    }

    fn page_limit(&self) -> PageId {
        (**self).page_limit()
    }
}

/// Reads a tree page after checking the id is in range.
pub(crate) fn load_node<P: PageProvider>(provider: &P, page_id: PageId) -> Result<Page> {
    if page_id < FIRST_DATA_PAGE || page_id >= provider.page_limit() {
        return Err(Error::corrupted(format!("tree pointer {page_id} out of range")));
    }
    provider.read_page(page_id)
}

fn unexpected_type(page_id: PageId, found: PageType) -> Error {
    Error::PageTypeMismatch { page_id, expected: PageType::BTreeLeaf, found }
}

fn too_deep() -> Error {
    Error::corrupted(format!("tree deeper than {MAX_DEPTH} levels"))
}

/// How [`BTree::insert`] treats the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Insert the key or replace its value.
    Upsert,
    /// Replace the value of an existing key; fails with
    /// [`Error::KeyNotFound`] otherwise.
    UpdateOnly,
}

struct InsertResult {
    page_id: PageId,
    split: Option<(Vec<u8>, PageId)>,
    replaced: Option<Vec<u8>>,
}

struct DeleteResult {
    page_id: PageId,
    underflow: bool,
    items: usize,
    is_leaf: bool,
    removed: Vec<u8>,
}

/// B+ tree over a page provider.
///
/// The root id changes on every modification; callers read it back with
/// [`BTree::root_page`] and persist it.
pub struct BTree<P: PageProvider> {
    /// Page provider for reading/writing pages.
    provider: P,
    /// Root page ID (0 = empty tree).
    root_page: PageId,
    /// Number of page splits performed during this BTree's lifetime.
    split_count: u64,
    /// Number of page merges performed during this BTree's lifetime.
    merge_count: u64,
}

impl<P: PageProvider> BTree<P> {
    /// Creates a new B-tree accessor.
    pub fn new(root_page: PageId, provider: P) -> Self {
        Self { provider, root_page, split_count: 0, merge_count: 0 }
    }

    /// Returns the number of page splits performed during operations on this BTree instance.
    pub fn split_count(&self) -> u64 {
        self.split_count
    }

    /// Returns the number of page merges performed during operations on this BTree instance.
    pub fn merge_count(&self) -> u64 {
        self.merge_count
    }

    /// Checks if the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.root_page == 0
    }

    /// Returns the root page ID.
    pub fn root_page(&self) -> PageId {
        self.root_page
    }

    /// Returns the page provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Consumes the tree, returning the page provider.
    pub fn into_provider(self) -> P {
        self.provider
    }

    /// Computes the depth of the B-tree (0 = empty, 1 = root is leaf, 2+ = branches + leaf).
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a non-B-tree page type is encountered.
    pub fn depth(&self) -> Result<usize> {
        if self.root_page == 0 {
            return Ok(0);
        }
        let mut page_id = self.root_page;
        for depth in 1..=MAX_DEPTH {
            let page = load_node(&self.provider, page_id)?;
            match page.page_type()? {
                PageType::BTreeLeaf => return Ok(depth),
                PageType::BTreeBranch => page_id = BranchNodeRef::from_page(&page)?.child(0),
                other => return Err(unexpected_type(page_id, other)),
            }
        }
        Err(too_deep())
    }

    /// Returns the encoded value cell stored under `key`.
    fn find_cell(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root_page == 0 {
            return Ok(None);
        }
        let mut page_id = self.root_page;
        for _ in 0..MAX_DEPTH {
            let page = load_node(&self.provider, page_id)?;
            match page.page_type()? {
                PageType::BTreeLeaf => {
                    let leaf = LeafNodeRef::from_page(&page)?;
                    return Ok(match leaf.search(key) {
                        SearchResult::Found(idx) => Some(leaf.value_cell(idx).to_vec()),
                        SearchResult::NotFound(_) => None,
                    });
                },
                PageType::BTreeBranch => {
                    let branch = BranchNodeRef::from_page(&page)?;
                    page_id = branch.child(branch.child_index_for(key));
                },
                other => return Err(unexpected_type(page_id, other)),
            }
        }
        Err(too_deep())
    }

    /// Returns the value associated with `key`, or `None` if the key does
    /// not exist in the tree.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a page is malformed.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.find_cell(key)? {
            Some(cell) => overflow::read_value(&self.provider, &cell).map(Some),
            None => Ok(None),
        }
    }

    /// Returns true if `key` is present.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a page is malformed.
    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.find_cell(key)?.is_some())
    }

    /// Iterates over every entry in key order.
    pub fn iter(&self) -> BTreeIterator<'_, P> {
        BTreeIterator::new(&self.provider, self.root_page, Range::all())
    }

    /// Iterates over the entries inside `range` in key order.
    pub fn range<'a>(&'a self, range: Range<'a>) -> BTreeIterator<'a, P> {
        BTreeIterator::new(&self.provider, self.root_page, range)
    }

    /// Returns the smallest entry.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a page is malformed.
    pub fn first(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.iter().next_entry()
    }
}

impl<P: PageProviderMut> BTree<P> {
    /// Returns the id to write a modified copy of `page_id` under: the same
    /// id if this transaction allocated it, otherwise a fresh page (the old
    /// one is freed).
    fn cow(&mut self, page_id: PageId) -> Result<PageId> {
        if self.provider.owns(page_id) {
            return Ok(page_id);
        }
        let new_id = self.provider.allocate_page()?;
        self.provider.free_page(page_id);
        Ok(new_id)
    }

    fn write_leaf(&mut self, page_id: PageId, node: &LeafNode) -> Result<()> {
        let page = node.to_page(page_id, self.provider.usable_size(), self.provider.commit_seq())?;
        self.provider.write_page(page);
        Ok(())
    }

    fn write_branch(&mut self, page_id: PageId, node: &BranchNode) -> Result<()> {
        let page = node.to_page(page_id, self.provider.usable_size(), self.provider.commit_seq())?;
        self.provider.write_page(page);
        Ok(())
    }

    /// Inserts a key-value pair into the B-tree.
    ///
    /// Returns true if the key already existed and its value was replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTooLarge`] / [`Error::ValueTooLarge`] for
    /// oversized input and [`Error::KeyNotFound`] for an
    /// [`InsertMode::UpdateOnly`] insert of an absent key. These checks run
    /// before any page is touched.
    pub fn insert(&mut self, key: &[u8], value: &[u8], mode: InsertMode) -> Result<bool> {
        let max = max_key_len(self.provider.usable_size());
        if key.len() > max {
            return Err(Error::KeyTooLarge { size: key.len(), max });
        }
        if u32::try_from(value.len()).is_err() {
            return Err(Error::ValueTooLarge { size: value.len(), max: u32::MAX as usize });
        }
        if mode == InsertMode::UpdateOnly && !self.contains_key(key)? {
            return Err(Error::KeyNotFound);
        }

        let cell = overflow::build_cell(&mut self.provider, key.len(), value)?;

        if self.root_page == 0 {
            let page_id = self.provider.allocate_page()?;
            let entry = LeafEntry { key: key.to_vec(), cell };
            self.write_leaf(page_id, &LeafNode { entries: vec![entry] })?;
            self.root_page = page_id;
            return Ok(false);
        }

        let result = self.insert_at(self.root_page, key, cell, 1)?;
        let mut root = result.page_id;
        if let Some((separator, right)) = result.split {
            let new_root = self.provider.allocate_page()?;
            self.write_branch(new_root, &BranchNode::new_root(root, separator, right))?;
            root = new_root;
        }
        self.root_page = root;

        match result.replaced {
            Some(old) => {
                overflow::free_chain(&mut self.provider, &old)?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    fn insert_at(&mut self, page_id: PageId, key: &[u8], cell: Vec<u8>, depth: usize) -> Result<InsertResult> {
        if depth > MAX_DEPTH {
            return Err(too_deep());
        }
        let page_size = self.provider.usable_size();
        let page = load_node(&self.provider, page_id)?;

        match page.page_type()? {
            PageType::BTreeLeaf => {
                let mut node = LeafNode::from_page(&page)?;
                let replaced = match node.search(key) {
                    SearchResult::Found(idx) => Some(std::mem::replace(&mut node.entries[idx].cell, cell)),
                    SearchResult::NotFound(idx) => {
                        node.entries.insert(idx, LeafEntry { key: key.to_vec(), cell });
                        None
                    },
                };

                let new_id = self.cow(page_id)?;
                if node.fits(page_size) {
                    self.write_leaf(new_id, &node)?;
                    return Ok(InsertResult { page_id: new_id, split: None, replaced });
                }

                let split = split_leaf(node);
                let right_id = self.provider.allocate_page()?;
                self.write_leaf(new_id, &split.left)?;
                self.write_leaf(right_id, &split.right)?;
                self.split_count += 1;
                Ok(InsertResult { page_id: new_id, split: Some((split.separator_key, right_id)), replaced })
            },
            PageType::BTreeBranch => {
                let mut node = BranchNode::from_page(&page)?;
                let idx = node.child_index_for(key);
                let child = node.children[idx];
                let result = self.insert_at(child, key, cell, depth + 1)?;
                if result.page_id == child && result.split.is_none() {
                    return Ok(InsertResult { page_id, split: None, replaced: result.replaced });
                }

                node.children[idx] = result.page_id;
                if let Some((separator, right)) = result.split {
                    node.keys.insert(idx, separator);
                    node.children.insert(idx + 1, right);
                }

                let new_id = self.cow(page_id)?;
                if node.fits(page_size) {
                    self.write_branch(new_id, &node)?;
                    return Ok(InsertResult { page_id: new_id, split: None, replaced: result.replaced });
                }

                let split = split_branch(node);
                let right_id = self.provider.allocate_page()?;
                self.write_branch(new_id, &split.left)?;
                self.write_branch(right_id, &split.right)?;
                self.split_count += 1;
                Ok(InsertResult {
                    page_id: new_id,
                    split: Some((split.separator_key, right_id)),
                    replaced: result.replaced,
                })
            },
            other => Err(unexpected_type(page_id, other)),
        }
    }

    /// Removes `key` from the tree. Returns false if it was absent.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a page is malformed.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if self.root_page == 0 {
            return Ok(false);
        }
        let Some(result) = self.delete_at(self.root_page, key, 1)? else {
            return Ok(false);
        };

        let mut root = result.page_id;
        if result.items == 0 {
            if result.is_leaf {
                self.provider.free_page(root);
                root = 0;
            } else {
                // a root branch left with a single child hands the root to it
                let page = load_node(&self.provider, root)?;
                let only_child = BranchNodeRef::from_page(&page)?.child(0);
                self.provider.free_page(root);
                root = only_child;
            }
        }
        self.root_page = root;
        overflow::free_chain(&mut self.provider, &result.removed)?;
        Ok(true)
    }

    fn delete_at(&mut self, page_id: PageId, key: &[u8], depth: usize) -> Result<Option<DeleteResult>> {
        if depth > MAX_DEPTH {
            return Err(too_deep());
        }
        let page_size = self.provider.usable_size();
        let page = load_node(&self.provider, page_id)?;

        match page.page_type()? {
            PageType::BTreeLeaf => {
                let mut node = LeafNode::from_page(&page)?;
                let SearchResult::Found(idx) = node.search(key) else {
                    return Ok(None);
                };
                let removed = node.entries.remove(idx).cell;
                let new_id = self.cow(page_id)?;
                self.write_leaf(new_id, &node)?;
                Ok(Some(DeleteResult {
                    page_id: new_id,
                    underflow: leaf_underflows(&node, page_size),
                    items: node.entries.len(),
                    is_leaf: true,
                    removed,
                }))
            },
            PageType::BTreeBranch => {
                let mut node = BranchNode::from_page(&page)?;
                let idx = node.child_index_for(key);
                let child = node.children[idx];
                let Some(result) = self.delete_at(child, key, depth + 1)? else {
                    return Ok(None);
                };

                let needs_rebalance = result.underflow && node.children.len() > 1;
                if result.page_id == child && !needs_rebalance {
                    return Ok(Some(DeleteResult {
                        page_id,
                        underflow: false,
                        items: node.keys.len(),
                        is_leaf: false,
                        removed: result.removed,
                    }));
                }

                node.children[idx] = result.page_id;
                if needs_rebalance {
                    self.rebalance_child(&mut node, idx, result.is_leaf)?;
                }
                let new_id = self.cow(page_id)?;
                self.write_branch(new_id, &node)?;
                Ok(Some(DeleteResult {
                    page_id: new_id,
                    underflow: branch_underflows(&node, page_size),
                    items: node.keys.len(),
                    is_leaf: false,
                    removed: result.removed,
                }))
            },
            other => Err(unexpected_type(page_id, other)),
        }
    }

    /// Merges or redistributes the underflowing child at `idx` with an
    /// adjacent sibling, updating `parent` in place.
    fn rebalance_child(&mut self, parent: &mut BranchNode, idx: usize, is_leaf: bool) -> Result<()> {
        let page_size = self.provider.usable_size();
        let left_idx = idx.saturating_sub(1).min(parent.children.len() - 2);
        let left_id = parent.children[left_idx];
        let right_id = parent.children[left_idx + 1];
        let left_page = load_node(&self.provider, left_id)?;
        let right_page = load_node(&self.provider, right_id)?;

        if is_leaf {
            let left = LeafNode::from_page(&left_page)?;
            let right = LeafNode::from_page(&right_page)?;
            match rebalance_leaves(left, right, page_size) {
                Rebalance::Merged(merged) => {
                    let new_id = self.cow(left_id)?;
                    self.write_leaf(new_id, &merged)?;
                    self.provider.free_page(right_id);
                    self.merged(parent, left_idx, new_id);
                },
                Rebalance::Redistributed { left, separator_key, right } => {
                    let new_left = self.cow(left_id)?;
                    let new_right = self.cow(right_id)?;
                    self.write_leaf(new_left, &left)?;
                    self.write_leaf(new_right, &right)?;
                    Self::redistributed(parent, left_idx, new_left, separator_key, new_right);
                },
            }
        } else {
            let left = BranchNode::from_page(&left_page)?;
            let right = BranchNode::from_page(&right_page)?;
            let separator = parent.keys[left_idx].clone();
            match rebalance_branches(left, separator, right, page_size) {
                Rebalance::Merged(merged) => {
                    let new_id = self.cow(left_id)?;
                    self.write_branch(new_id, &merged)?;
                    self.provider.free_page(right_id);
                    self.merged(parent, left_idx, new_id);
                },
                Rebalance::Redistributed { left, separator_key, right } => {
                    let new_left = self.cow(left_id)?;
                    let new_right = self.cow(right_id)?;
                    self.write_branch(new_left, &left)?;
                    self.write_branch(new_right, &right)?;
                    Self::redistributed(parent, left_idx, new_left, separator_key, new_right);
                },
            }
        }
        Ok(())
    }

    fn merged(&mut self, parent: &mut BranchNode, left_idx: usize, new_id: PageId) {
        parent.keys.remove(left_idx);
        parent.children.remove(left_idx + 1);
        parent.children[left_idx] = new_id;
        self.merge_count += 1;
    }

    fn redistributed(parent: &mut BranchNode, left_idx: usize, left: PageId, separator: Vec<u8>, right: PageId) {
        parent.children[left_idx] = left;
        parent.children[left_idx + 1] = right;
        parent.keys[left_idx] = separator;
    }
}
