//! Node splitting, merging and redistribution for the B+ tree.
//!
//! # Algorithm Overview
//!
//! ## Splitting (insertion path)
//!
//! When a node no longer fits its page it is split at the *byte* midpoint,
//! not the entry midpoint, so a few large entries cannot leave one half
//! overfull:
//!
//! 1. **Leaf split**: the first key of the right leaf is copied up to the parent as the
//!    separator.
//! 2. **Branch split**: the separator at the split point moves up to the parent and is removed
//!    from both halves.
//!
//! Every entry is bounded to a quarter of the node capacity, so both halves
//! of a split always fit.
//!
//! ## Rebalancing (deletion path)
//!
//! A non-root node underflows when its live bytes drop below a quarter of
//! capacity. It is combined with an adjacent sibling: if everything fits in
//! one node the two merge, otherwise the entries are redistributed across
//! both at the byte midpoint. Branch merges pull the parent separator down
//! between the two halves.
//!
//! All functions here work on decoded nodes; page allocation and
//! copy-on-write are handled by the caller.

use super::node::{BranchNode, LeafNode, branch_capacity, leaf_capacity};

/// Result of splitting a leaf node.
#[derive(Debug)]
pub struct LeafSplitResult {
    /// Lower half.
    pub left: LeafNode,
    /// The separator key to promote to the parent: first key of `right`.
    pub separator_key: Vec<u8>,
    /// Upper half.
    pub right: LeafNode,
}

/// Result of splitting a branch node.
#[derive(Debug)]
pub struct BranchSplitResult {
    /// Lower half.
    pub left: BranchNode,
    /// The separator key to promote to the parent.
    pub separator_key: Vec<u8>,
    /// Upper half.
    pub right: BranchNode,
}

/// Outcome of rebalancing two siblings.
#[derive(Debug)]
pub enum Rebalance<N> {
    /// Everything fit into one node; the right sibling goes away.
    Merged(N),
    /// Entries were spread over both siblings under a new separator.
    Redistributed {
        /// Lower sibling.
        left: N,
        /// New separator for the parent.
        separator_key: Vec<u8>,
        /// Upper sibling.
        right: N,
    },
}

/// Index splitting `sizes` so the prefix holds about half the bytes,
/// clamped to `[lo, hi]`.
fn byte_midpoint(sizes: &[usize], lo: usize, hi: usize) -> usize {
    let total: usize = sizes.iter().sum();
    let mut acc = 0;
    let mut split = sizes.len();
    for (i, size) in sizes.iter().enumerate() {
        acc += size;
        if acc * 2 >= total {
            split = i + 1;
            break;
        }
    }
    split.clamp(lo, hi)
}

/// Splits an overfull leaf at its byte midpoint.
///
/// The leaf must hold at least two entries.
pub fn split_leaf(mut node: LeafNode) -> LeafSplitResult {
    let sizes: Vec<usize> = node.entries.iter().map(|e| e.size()).collect();
    let len = sizes.len();
    let mid = byte_midpoint(&sizes, 1, len.saturating_sub(1).max(1));
    let right = LeafNode { entries: node.entries.split_off(mid) };
    let separator_key = right.entries.first().map(|e| e.key.clone()).unwrap_or_default();
    LeafSplitResult { left: node, separator_key, right }
}

/// Splits an overfull branch, promoting the separator at the byte midpoint.
///
/// The branch must hold at least two separators.
pub fn split_branch(mut node: BranchNode) -> BranchSplitResult {
    let sizes: Vec<usize> = node.keys.iter().map(|k| BranchNode::key_size(k)).collect();
    let len = sizes.len();
    // keep at least one separator on each side when there are enough
    let hi = if len >= 3 { len - 2 } else { len.saturating_sub(1) };
    let mid = byte_midpoint(&sizes, 1.min(hi), hi);

    let mut right_keys = node.keys.split_off(mid);
    let right_children = node.children.split_off(mid + 1);
    let separator_key = if right_keys.is_empty() { Vec::new() } else { right_keys.remove(0) };
    BranchSplitResult {
        left: node,
        separator_key,
        right: BranchNode { keys: right_keys, children: right_children },
    }
}

/// Returns true if a non-root leaf holds too few bytes.
pub fn leaf_underflows(node: &LeafNode, page_size: usize) -> bool {
    node.used_bytes() < leaf_capacity(page_size) / 4
}

/// Returns true if a non-root branch holds too few bytes.
pub fn branch_underflows(node: &BranchNode, page_size: usize) -> bool {
    node.used_bytes() < branch_capacity(page_size) / 4
}

/// Merges or redistributes two adjacent leaves.
pub fn rebalance_leaves(mut left: LeafNode, right: LeafNode, page_size: usize) -> Rebalance<LeafNode> {
    left.entries.extend(right.entries);
    if left.fits(page_size) {
        return Rebalance::Merged(left);
    }
    let split = split_leaf(left);
    Rebalance::Redistributed { left: split.left, separator_key: split.separator_key, right: split.right }
}

/// Merges or redistributes two adjacent branches separated by `separator`.
pub fn rebalance_branches(
    mut left: BranchNode,
    separator: Vec<u8>,
    right: BranchNode,
    page_size: usize,
) -> Rebalance<BranchNode> {
    left.keys.push(separator);
    left.keys.extend(right.keys);
    left.children.extend(right.children);
    if left.fits(page_size) {
        return Rebalance::Merged(left);
    }
    let split = split_branch(left);
    Rebalance::Redistributed { left: split.left, separator_key: split.separator_key, right: split.right }
}
