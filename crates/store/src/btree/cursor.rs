//! B-tree cursor for iteration and range scans.
//!
//! Leaves carry no sibling pointers (copy-on-write would have to rewrite the
//! neighbour on every change), so the cursor keeps the path from the root:
//! one stack entry per branch with the index of the child it descended
//! into. Advancing past the end of a leaf pops back up to the nearest
//! branch with a further child and descends to that child's leftmost leaf.

use super::{
    MAX_DEPTH, PageProvider, load_node,
    node::{BranchNode, LeafNode},
    overflow,
};
use crate::error::{Error, PageId, PageType, Result};

/// Stack entry for tracking position during tree traversal.
#[derive(Debug, Clone)]
pub struct StackEntry {
    /// Children of the branch.
    pub children: Vec<PageId>,
    /// Index of the child currently descended into.
    pub child_index: usize,
}

/// Cursor position within a B-tree.
#[derive(Debug, Clone, Default)]
pub struct CursorPosition {
    /// Branch positions, root first.
    pub stack: Vec<StackEntry>,
    /// Decoded current leaf.
    pub leaf: Option<LeafNode>,
    /// Current index within the leaf.
    pub leaf_index: usize,
}

impl CursorPosition {
    /// Creates a new empty cursor position.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks if cursor is valid (positioned on an entry).
    pub fn is_valid(&self) -> bool {
        self.leaf.as_ref().is_some_and(|leaf| self.leaf_index < leaf.entries.len())
    }

    /// Invalidates the cursor.
    pub fn invalidate(&mut self) {
        self.stack.clear();
        self.leaf = None;
        self.leaf_index = 0;
    }
}

/// One end of a key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound<'a> {
    /// No bound (unbounded).
    Unbounded,
    /// Inclusive bound.
    Included(&'a [u8]),
    /// Exclusive bound.
    Excluded(&'a [u8]),
}

/// A key range for tree iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range<'a> {
    /// Lower bound.
    pub start: Bound<'a>,
    /// Upper bound.
    pub end: Bound<'a>,
}

impl<'a> Range<'a> {
    /// Creates a range covering all keys.
    pub fn all() -> Self {
        Self { start: Bound::Unbounded, end: Bound::Unbounded }
    }

    /// Creates a range from start (inclusive) to end (exclusive).
    pub fn new(start: &'a [u8], end: &'a [u8]) -> Self {
        Self { start: Bound::Included(start), end: Bound::Excluded(end) }
    }

    /// Creates a range starting from a key (inclusive).
    pub fn from(start: &'a [u8]) -> Self {
        Self { start: Bound::Included(start), end: Bound::Unbounded }
    }

    /// Checks if a key is within this range.
    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Unbounded => true,
            Bound::Included(start) => key >= *start,
            Bound::Excluded(start) => key > *start,
        };
        after_start && self.should_continue(key)
    }

    /// Checks if iteration should continue based on current key.
    pub fn should_continue(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Unbounded => true,
            Bound::Included(end) => key <= *end,
            Bound::Excluded(end) => key < *end,
        }
    }
}

/// Result of a cursor seek operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekResult {
    /// Found the exact key.
    Found,
    /// Key not found, positioned at next greater key.
    NotFound,
    /// No more entries (past end of tree).
    EndOfTree,
}

/// Iterator over a key range of a B-tree, yielding `(key, value)` pairs in
/// key order with overflow values reassembled.
pub struct BTreeIterator<'a, P: PageProvider> {
    provider: &'a P,
    range: Range<'a>,
    position: CursorPosition,
    started: bool,
    root: PageId,
    done: bool,
}

impl<'a, P: PageProvider> BTreeIterator<'a, P> {
    pub(crate) fn new(provider: &'a P, root: PageId, range: Range<'a>) -> Self {
        Self { provider, range, position: CursorPosition::new(), started: false, root, done: root == 0 }
    }

    /// Descends from `page_id` to a leaf, choosing children with `pick`.
    fn descend(&mut self, mut page_id: PageId, pick: impl Fn(&BranchNode) -> usize) -> Result<()> {
        loop {
            if self.position.stack.len() >= MAX_DEPTH {
                return Err(Error::corrupted(format!("tree deeper than {MAX_DEPTH} levels")));
            }
            let page = load_node(self.provider, page_id)?;
            if page.page_type()? == PageType::BTreeLeaf {
                self.position.leaf = Some(LeafNode::from_page(&page)?);
                self.position.leaf_index = 0;
                return Ok(());
            }
            let branch = BranchNode::from_page(&page)?;
            let child_index = pick(&branch);
            page_id = branch.children[child_index];
            self.position.stack.push(StackEntry { children: branch.children, child_index });
        }
    }

    /// Positions the cursor at the first entry inside the range start.
    fn seek(&mut self) -> Result<SeekResult> {
        let start = self.range.start;
        let target = match start {
            Bound::Unbounded => None,
            Bound::Included(key) | Bound::Excluded(key) => Some(key),
        };
        self.descend(self.root, |branch| target.map_or(0, |key| branch.child_index_for(key)))?;

        let Some(key) = target else {
            return Ok(if self.position.is_valid() { SeekResult::Found } else { SeekResult::EndOfTree });
        };
        let Some(leaf) = &self.position.leaf else {
            return Ok(SeekResult::EndOfTree);
        };
        let result = leaf.search(key);
        self.position.leaf_index = match (result.is_found(), start) {
            (true, Bound::Excluded(_)) => result.index() + 1,
            _ => result.index(),
        };
        Ok(match (result.is_found(), self.position.is_valid()) {
            (true, true) if matches!(start, Bound::Included(_)) => SeekResult::Found,
            (_, true) => SeekResult::NotFound,
            (_, false) => SeekResult::EndOfTree,
        })
    }

    /// Moves to the next leaf once the current one is exhausted.
    /// Returns false at the end of the tree.
    fn next_leaf(&mut self) -> Result<bool> {
        while !self.position.is_valid() {
            let Some(top) = self.position.stack.last_mut() else {
                return Ok(false);
            };
            if top.child_index + 1 < top.children.len() {
                top.child_index += 1;
                let child = top.children[top.child_index];
                self.descend(child, |_| 0)?;
            } else {
                self.position.stack.pop();
            }
        }
        Ok(true)
    }

    /// Returns the next entry, or `None` past the end of the range.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read or is malformed.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        if !self.started {
            self.started = true;
            self.seek()?;
        }
        if !self.next_leaf()? {
            self.done = true;
            return Ok(None);
        }
        let Some(leaf) = &self.position.leaf else {
            self.done = true;
            return Ok(None);
        };
        let entry = &leaf.entries[self.position.leaf_index];
        if !self.range.should_continue(&entry.key) {
            self.done = true;
            return Ok(None);
        }
        let key = entry.key.clone();
        let value = overflow::read_value(self.provider, &entry.cell)?;
        self.position.leaf_index += 1;
        Ok(Some((key, value)))
    }
}

impl<P: PageProvider> Iterator for BTreeIterator<'_, P> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}
