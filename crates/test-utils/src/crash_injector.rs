//! Crash injection utilities for testing crash recovery.
//!
//! Provides a [`CrashInjector`] that counts log operations and triggers a
//! simulated crash at a configured point, and [`CrashingLog`], a
//! [`LogBackend`] wrapper that consults it. Once crashed, every further log
//! operation fails, so whatever bytes reached the log stay there exactly as
//! a power loss would leave them.
//!
//! # Crash Points
//!
//! A commit writes page frames, syncs, writes the commit frame and syncs:
//!
//! ```text
//! Page frames → Sync → Commit frame → Sync
//!      ↑          ↑          ↑
//! DuringPageFrame  BeforeCommitFrame / TornCommitFrame
//!            BeforeFirstSync
//! ```
//!
//! A checkpoint copies pages into the main file and then truncates the log;
//! [`CrashPoint::BeforeLogReset`] fails that truncation and
//! [`CrashPoint::SyncAfterLogReset`] fails the sync that follows it.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use sealdb_store::{
    Error, LogBackend, Result,
    wal::{FrameHeader, FrameKind},
};

/// Points in the commit protocol where a crash can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Crash while writing a page frame: the frame after `threshold` page
    /// frames is written halfway.
    ///
    /// On-disk state: a torn frame and no commit frame. Recovery discards
    /// the whole transaction.
    DuringPageFrame,

    /// Crash on the sync that precedes the commit frame.
    ///
    /// On-disk state: complete page frames without a commit frame.
    BeforeFirstSync,

    /// Crash before any byte of the commit frame is written.
    BeforeCommitFrame,

    /// Crash halfway through the commit frame.
    ///
    /// On-disk state: every page frame plus a torn commit frame, which must
    /// not count as a commit.
    TornCommitFrame,

    /// Crash when a checkpoint resets the log.
    ///
    /// On-disk state: the main file already holds every logged page and the
    /// log is intact; replaying it again must be harmless.
    BeforeLogReset,

    /// The first sync after the log is truncated to zero fails once.
    ///
    /// Unlike the other points this is a transient I/O error: operations
    /// after it succeed again. On-disk state: the main file holds every
    /// page and the log is empty apart from a possibly unsynced header.
    SyncAfterLogReset,
}

/// Outcome of a log write under injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Write normally.
    Proceed,
    /// Write the first half of the data, then fail.
    Torn,
    /// Fail without writing.
    Fail,
}

/// Tracks crash injection state for deterministic crash simulation.
///
/// # Thread Safety
///
/// All state is atomic, making `CrashInjector` safe to share across threads.
#[derive(Debug)]
pub struct CrashInjector {
    /// The crash point to trigger.
    crash_point: CrashPoint,
    /// Page frames written since arming after which `DuringPageFrame` fires.
    threshold: u32,
    /// Number of sync calls observed.
    sync_count: AtomicU32,
    /// Number of page frame writes observed.
    page_frame_count: AtomicU32,
    /// Whether the log has been truncated to zero since arming.
    reset_seen: AtomicBool,
    /// Whether the crash has been triggered.
    crashed: AtomicBool,
    /// Whether injection is armed (enabled).
    armed: AtomicBool,
}

impl CrashInjector {
    /// Creates a new crash injector targeting the specified crash point.
    pub fn new(crash_point: CrashPoint) -> Arc<Self> {
        Self::with_threshold(crash_point, 0)
    }

    /// Creates an injector for [`CrashPoint::DuringPageFrame`] that lets
    /// `threshold` page frames through first.
    pub fn with_threshold(crash_point: CrashPoint, threshold: u32) -> Arc<Self> {
        Arc::new(Self {
            crash_point,
            threshold,
            sync_count: AtomicU32::new(0),
            page_frame_count: AtomicU32::new(0),
            reset_seen: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        })
    }

    /// Arms the injector so it will trigger on the next matching operation.
    ///
    /// The injector starts disarmed to allow initial setup operations
    /// (creating the store, writing initial data) without interference.
    pub fn arm(&self) {
        self.sync_count.store(0, Ordering::SeqCst);
        self.page_frame_count.store(0, Ordering::SeqCst);
        self.reset_seen.store(false, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Disarms the injector.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Checks if the crash has been triggered.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Whether every further operation fails.
    fn is_dead(&self) -> bool {
        self.has_crashed() && self.crash_point != CrashPoint::SyncAfterLogReset
    }

    fn active(&self) -> bool {
        self.armed.load(Ordering::SeqCst) && !self.crashed.load(Ordering::SeqCst)
    }

    fn trigger(&self, should_crash: bool) -> bool {
        if should_crash {
            self.crashed.store(true, Ordering::SeqCst);
        }
        should_crash
    }

    /// Records a write of `data` to the log and decides its outcome.
    pub fn on_write(&self, data: &[u8]) -> WriteOutcome {
        if self.is_dead() {
            return WriteOutcome::Fail;
        }
        if !self.active() {
            return WriteOutcome::Proceed;
        }
        let outcome = match FrameHeader::decode(data).map(|frame| frame.kind) {
            Some(FrameKind::Page) => {
                let count = self.page_frame_count.fetch_add(1, Ordering::SeqCst);
                match self.crash_point {
                    CrashPoint::DuringPageFrame if count >= self.threshold => WriteOutcome::Torn,
                    _ => WriteOutcome::Proceed,
                }
            },
            Some(FrameKind::Commit) => match self.crash_point {
                CrashPoint::BeforeCommitFrame => WriteOutcome::Fail,
                CrashPoint::TornCommitFrame => WriteOutcome::Torn,
                _ => WriteOutcome::Proceed,
            },
            None => WriteOutcome::Proceed,
        };
        self.trigger(outcome != WriteOutcome::Proceed);
        outcome
    }

    /// Records a sync operation and checks if a crash should occur.
    ///
    /// Returns `true` if the crash should be triggered at this point.
    pub fn on_sync(&self) -> bool {
        if self.is_dead() {
            return true;
        }
        if !self.active() {
            return false;
        }
        let count = self.sync_count.fetch_add(1, Ordering::SeqCst);
        self.trigger(match self.crash_point {
            CrashPoint::BeforeFirstSync => count == 0,
            CrashPoint::SyncAfterLogReset => self.reset_seen.load(Ordering::SeqCst),
            _ => false,
        })
    }

    /// Records a truncation to `len` bytes and checks if a crash should
    /// occur.
    pub fn on_truncate(&self, len: u64) -> bool {
        if self.is_dead() {
            return true;
        }
        if !self.active() {
            return false;
        }
        if len == 0 {
            self.reset_seen.store(true, Ordering::SeqCst);
        }
        self.trigger(self.crash_point == CrashPoint::BeforeLogReset && len == 0)
    }

    /// Returns the configured crash point.
    pub fn crash_point(&self) -> CrashPoint {
        self.crash_point
    }

    /// Returns the number of sync operations observed.
    pub fn sync_count(&self) -> u32 {
        self.sync_count.load(Ordering::SeqCst)
    }

    /// Returns the number of page frame writes observed.
    pub fn page_frame_count(&self) -> u32 {
        self.page_frame_count.load(Ordering::SeqCst)
    }
}

fn crashed() -> Error {
    Error::Io { source: std::io::Error::other("simulated crash") }
}

/// A log that fails at the injector's crash point and, for every point but
/// [`CrashPoint::SyncAfterLogReset`], on every operation after it.
pub struct CrashingLog<L: LogBackend> {
    inner: L,
    injector: Arc<CrashInjector>,
}

impl<L: LogBackend> CrashingLog<L> {
    /// Wraps `inner`.
    pub fn new(inner: L, injector: Arc<CrashInjector>) -> Self {
        Self { inner, injector }
    }

    /// Returns the wrapped log.
    pub fn into_inner(self) -> L {
        self.inner
    }
}

impl<L: LogBackend> LogBackend for CrashingLog<L> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.injector.is_dead() {
            return Err(crashed());
        }
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        match self.injector.on_write(data) {
            WriteOutcome::Proceed => self.inner.write_at(offset, data),
            WriteOutcome::Torn => {
                self.inner.write_at(offset, &data[..data.len() / 2])?;
                Err(crashed())
            },
            WriteOutcome::Fail => Err(crashed()),
        }
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        if self.injector.on_truncate(len) {
            return Err(crashed());
        }
        self.inner.truncate(len)
    }

    fn sync(&self) -> Result<()> {
        if self.injector.on_sync() {
            return Err(crashed());
        }
        self.inner.sync()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use sealdb_store::MemoryLog;

    use super::*;

    fn frame(kind: FrameKind) -> Vec<u8> {
        FrameHeader { kind, page_id: 1, commit_seq: 1, generation: 1, db_id: 7 }.encode(&[0u8; 64])
    }

    #[test]
    fn test_crash_injector_starts_disarmed() {
        let injector = CrashInjector::new(CrashPoint::BeforeFirstSync);
        assert!(!injector.has_crashed());
        // Should not crash when disarmed
        assert!(!injector.on_sync());
        assert_eq!(injector.on_write(&frame(FrameKind::Commit)), WriteOutcome::Proceed);
        assert!(!injector.has_crashed());
    }

    #[test]
    fn test_crash_before_first_sync() {
        let injector = CrashInjector::new(CrashPoint::BeforeFirstSync);
        injector.arm();

        assert!(injector.on_sync());
        assert!(injector.has_crashed());

        // everything fails after the crash
        assert!(injector.on_sync());
        assert_eq!(injector.on_write(&frame(FrameKind::Page)), WriteOutcome::Fail);
    }

    #[test]
    fn test_crash_during_page_frame() {
        let injector = CrashInjector::with_threshold(CrashPoint::DuringPageFrame, 2);
        injector.arm();

        assert_eq!(injector.on_write(&frame(FrameKind::Page)), WriteOutcome::Proceed);
        assert_eq!(injector.on_write(&frame(FrameKind::Page)), WriteOutcome::Proceed);
        assert_eq!(injector.on_write(&frame(FrameKind::Page)), WriteOutcome::Torn);
        assert!(injector.has_crashed());
        assert_eq!(injector.page_frame_count(), 3);
    }

    #[test]
    fn test_commit_frame_points() {
        let before = CrashInjector::new(CrashPoint::BeforeCommitFrame);
        before.arm();
        assert_eq!(before.on_write(&frame(FrameKind::Page)), WriteOutcome::Proceed);
        assert!(!before.on_sync());
        assert_eq!(before.on_write(&frame(FrameKind::Commit)), WriteOutcome::Fail);

        let torn = CrashInjector::new(CrashPoint::TornCommitFrame);
        torn.arm();
        assert_eq!(torn.on_write(&frame(FrameKind::Commit)), WriteOutcome::Torn);
    }

    #[test]
    fn test_log_reset_point_ignores_tail_truncation() {
        let injector = CrashInjector::new(CrashPoint::BeforeLogReset);
        injector.arm();
        assert!(!injector.on_truncate(4096));
        assert!(injector.on_truncate(0));
    }

    #[test]
    fn test_sync_after_log_reset_is_transient() {
        let injector = CrashInjector::new(CrashPoint::SyncAfterLogReset);
        injector.arm();
        // syncs before the reset pass
        assert!(!injector.on_sync());
        assert!(!injector.on_truncate(4096));
        assert!(!injector.on_sync());

        assert!(!injector.on_truncate(0));
        assert!(injector.on_sync());
        assert!(injector.has_crashed());

        // the log keeps working afterwards
        assert!(!injector.on_sync());
        assert_eq!(injector.on_write(&frame(FrameKind::Page)), WriteOutcome::Proceed);
    }

    #[test]
    fn test_crashing_log_leaves_torn_bytes() {
        let injector = CrashInjector::new(CrashPoint::TornCommitFrame);
        let log = CrashingLog::new(MemoryLog::new(), Arc::clone(&injector));
        log.write_at(0, &frame(FrameKind::Page)).unwrap();
        injector.arm();

        let commit = frame(FrameKind::Commit);
        assert!(log.write_at(commit.len() as u64, &commit).is_err());
        let inner = log.into_inner();
        assert_eq!(inner.len().unwrap(), (commit.len() + commit.len() / 2) as u64);
    }

    #[test]
    fn test_arm_resets_state() {
        let injector = CrashInjector::new(CrashPoint::BeforeFirstSync);
        injector.arm();
        assert!(injector.on_sync());
        assert!(injector.has_crashed());

        // Re-arming resets everything
        injector.arm();
        assert!(!injector.has_crashed());
        assert_eq!(injector.sync_count(), 0);
    }

    #[test]
    fn test_disarm_prevents_crash() {
        let injector = CrashInjector::new(CrashPoint::BeforeFirstSync);
        injector.arm();
        injector.disarm();

        assert!(!injector.on_sync());
        assert!(!injector.has_crashed());
    }
}
