//! Transaction tracking and snapshot management for copy-on-write.
//!
//! - [`SnapshotId`]: the commit sequence a reader is pinned to
//! - [`CommittedState`]: what a snapshot sees (root, counters)
//! - [`TransactionTracker`]: live readers and the single writer
//! - [`PendingFrees`]: pages released by commits but still visible to an
//!   older snapshot

use std::{collections::BTreeMap, sync::Arc};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::PageId;

/// Identifier of a committed database state.
///
/// Equal to the sequence number of the commit that produced it; a fresh
/// store starts at 0.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    /// Create a new snapshot ID with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The snapshot the next commit will produce.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// The committed state that readers snapshot.
///
/// Swapped atomically on every commit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommittedState {
    /// Root page of the tree (0 means empty).
    pub root: PageId,
    /// The commit that produced this state.
    pub snapshot_id: SnapshotId,
    /// Live entries in the tree.
    pub entry_count: u64,
    /// One past the highest page id reachable in this state.
    pub next_page: PageId,
    /// Pages on the free list after this commit.
    pub free_pages: u64,
}

/// Lifecycle of a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Accepting reads and writes.
    Active,
    /// Staging frames and writing the commit marker.
    Committing,
    /// Durable and published.
    Committed,
    /// Discarding staged pages.
    Aborting,
    /// Rolled back; nothing was published.
    Aborted,
}

impl TransactionState {
    /// Whether the transaction has finished either way.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// Tracks live transactions so that pages are only reused once no reader
/// can reach them.
///
/// ```text
/// Time    Action                          live readers
/// ----    ------                          ------------
/// T1      Commit 1                        {}
/// T2      Read starts (snapshot 1)        {1: 1}
/// T3      Commit 2 frees pages            {1: 1}
/// T4      Read starts (snapshot 2)        {1: 1, 2: 1}
/// T5      First read ends                 {2: 1}
/// T6      Pages freed by commit 2 reused  {2: 1}
/// ```
pub struct TransactionTracker {
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    /// Reference count of read transactions per snapshot.
    live_read_transactions: BTreeMap<SnapshotId, u64>,
}

impl TransactionTracker {
    /// Create a new transaction tracker.
    pub fn new() -> Self {
        Self { state: Mutex::new(TrackerState::default()) }
    }

    /// Loads the published state and registers a reader on it.
    ///
    /// Both happen under the tracker lock, so a committer computing the
    /// oldest reader never misses a reader that loaded an older state.
    pub fn begin_read(&self, published: &ArcSwap<CommittedState>) -> Arc<CommittedState> {
        let mut state = self.state.lock();
        let snapshot = published.load_full();
        *state.live_read_transactions.entry(snapshot.snapshot_id).or_insert(0) += 1;
        snapshot
    }

    /// Unregister a read transaction.
    pub fn unregister_read_transaction(&self, snapshot_id: SnapshotId) {
        let mut state = self.state.lock();
        if let Some(count) = state.live_read_transactions.get_mut(&snapshot_id) {
            *count -= 1;
            if *count == 0 {
                state.live_read_transactions.remove(&snapshot_id);
            }
        }
    }

    /// Oldest snapshot still held by a reader.
    pub fn oldest_live_read_transaction(&self) -> Option<SnapshotId> {
        self.state.lock().live_read_transactions.keys().next().copied()
    }

    /// Whether any reader is active.
    pub fn has_active_readers(&self) -> bool {
        !self.state.lock().live_read_transactions.is_empty()
    }

    /// Number of live read transactions.
    pub fn active_reader_count(&self) -> u64 {
        self.state.lock().live_read_transactions.values().sum()
    }
}

impl Default for TransactionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Pages released by committed transactions that an older snapshot may
/// still reference.
///
/// Pages released by commit `C` are unreachable from every snapshot at or
/// after `C`, so they become reusable once the oldest live reader is at
/// `C` or later.
#[derive(Default)]
pub struct PendingFrees {
    freed_by_snapshot: BTreeMap<SnapshotId, Vec<PageId>>,
}

impl PendingFrees {
    /// Create an empty set of pending frees.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record pages released by the commit that produced `snapshot_id`.
    pub fn record_freed_pages(&mut self, snapshot_id: SnapshotId, pages: Vec<PageId>) {
        if !pages.is_empty() {
            self.freed_by_snapshot.entry(snapshot_id).or_default().extend(pages);
        }
    }

    /// Removes and returns the batches no live reader can reach.
    ///
    /// With no readers every batch is released.
    pub fn drain_freeable(&mut self, oldest_reader: Option<SnapshotId>) -> Vec<(SnapshotId, Vec<PageId>)> {
        let Some(cutoff) = oldest_reader else {
            return std::mem::take(&mut self.freed_by_snapshot).into_iter().collect();
        };
        let keep = match cutoff.0.checked_add(1) {
            Some(after) => self.freed_by_snapshot.split_off(&SnapshotId(after)),
            None => BTreeMap::new(),
        };
        std::mem::replace(&mut self.freed_by_snapshot, keep).into_iter().collect()
    }

    /// Puts back batches returned by [`Self::drain_freeable`] when the
    /// commit that drained them fails.
    pub fn restore(&mut self, batches: Vec<(SnapshotId, Vec<PageId>)>) {
        for (snapshot_id, pages) in batches {
            self.record_freed_pages(snapshot_id, pages);
        }
    }

    /// Check if there are any pending frees.
    pub fn is_empty(&self) -> bool {
        self.freed_by_snapshot.is_empty()
    }

    /// Every page waiting to be freed, oldest batch first.
    pub fn pages(&self) -> impl Iterator<Item = PageId> + '_ {
        self.freed_by_snapshot.values().flatten().copied()
    }

    /// Total number of pages waiting to be freed.
    pub fn pending_count(&self) -> u64 {
        self.freed_by_snapshot.values().map(|pages| pages.len() as u64).sum()
    }
}
