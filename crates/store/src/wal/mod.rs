//! Write-ahead log.
//!
//! Commits never touch the main file. A writer appends one frame per
//! modified page (carrying the encrypted page image), then a commit frame
//! that seals them; the commit is durable once that frame is synced. Readers
//! consult the log index before the main file. A checkpoint copies the
//! newest image of every logged page into the main file, syncs it, and
//! starts a fresh log generation.
//!
//! Replay at open rebuilds the index from the frames of complete commits and
//! ignores whatever follows the last one (torn or uncommitted frames).

mod frame;
mod log;

use std::collections::HashMap;

pub use frame::{FRAME_HEADER_SIZE, FrameHeader, FrameKind, WAL_HEADER_SIZE, WalHeader};
pub use log::{FileLog, LogBackend, MemoryLog};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, PageId, Result};

/// Outcome of replaying the log at open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Complete commits found.
    pub commits: u64,
    /// Page frames made visible by those commits.
    pub page_frames: u64,
    /// Highest commit sequence in the log (0 if none).
    pub last_seq: u64,
    /// Bytes discarded after the last complete commit.
    pub discarded_bytes: u64,
}

/// Outcome of a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Distinct pages copied into the main file.
    pub pages: u64,
    /// Generation of the fresh log.
    pub generation: u64,
}

/// Committed, reader-visible part of the log.
struct CommittedLog {
    header: WalHeader,
    /// Newest committed frame offset for each logged page.
    index: HashMap<PageId, u64>,
    /// Offset just past the last commit frame.
    tail: u64,
    /// Frames (page and commit) since the last checkpoint.
    frames: u64,
    last_seq: u64,
}

/// Frames appended by the in-flight commit.
#[derive(Default)]
struct PendingCommit {
    seq: Option<u64>,
    frames: Vec<(PageId, u64)>,
    tail: u64,
}

/// The write-ahead log.
pub struct Wal {
    log: Box<dyn LogBackend>,
    /// Physical page size (frame payload size).
    page_size: usize,
    read_only: bool,
    committed: RwLock<CommittedLog>,
    pending: Mutex<PendingCommit>,
}

impl Wal {
    /// Opens the log and replays it.
    ///
    /// A missing, empty or torn header starts a fresh log, as does a log
    /// written for a different database id (left behind by an interrupted
    /// rekey). A writable log is trimmed to its last complete commit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WalChecksumMismatch`] if a damaged frame precedes a
    /// valid commit frame, [`Error::Corrupted`] for structural violations
    /// (page size mismatch, commit frames sealing the wrong frame count) and
    /// [`Error::Io`] if the log cannot be read.
    pub fn open(
        log: Box<dyn LogBackend>,
        page_size_power: u8,
        db_id: u64,
        read_only: bool,
    ) -> Result<(Self, ReplayStats)> {
        let page_size = 1usize << page_size_power;
        let fresh = WalHeader { page_size_power, generation: 1, db_id };

        let len = log.len()?;
        let existing = if len >= WAL_HEADER_SIZE as u64 {
            let mut buf = [0u8; WAL_HEADER_SIZE];
            log.read_at(0, &mut buf)?;
            WalHeader::from_bytes(&buf)?
        } else {
            None
        };

        let header = match existing {
            Some(header) if header.page_size_power != page_size_power => {
                return Err(Error::corrupted(format!(
                    "log page size 2^{} does not match database page size 2^{page_size_power}",
                    header.page_size_power
                )));
            },
            Some(header) if header.db_id != db_id => {
                tracing::warn!(
                    log_db_id = header.db_id,
                    db_id,
                    "Ignoring write-ahead log that belongs to a different database"
                );
                None
            },
            other => other,
        };

        let mut wal = Self {
            log,
            page_size,
            read_only,
            committed: RwLock::new(CommittedLog {
                header: header.unwrap_or(fresh),
                index: HashMap::new(),
                tail: WAL_HEADER_SIZE as u64,
                frames: 0,
                last_seq: 0,
            }),
            pending: Mutex::new(PendingCommit::default()),
        };

        let Some(header) = header else {
            if len > 0 {
                tracing::warn!(len, "Discarding write-ahead log without a valid header");
            }
            if !read_only {
                Self::reset_log(wal.log.as_ref(), wal.committed.get_mut(), fresh)?;
            }
            return Ok((wal, ReplayStats::default()));
        };

        let stats = wal.replay(header, len)?;
        if stats.discarded_bytes > 0 && !read_only {
            let tail = wal.committed.get_mut().tail;
            wal.log.truncate(tail)?;
            wal.log.sync()?;
        }
        Ok((wal, stats))
    }

    fn frame_size(&self) -> u64 {
        (FRAME_HEADER_SIZE + self.page_size) as u64
    }

    fn replay(&mut self, header: WalHeader, len: u64) -> Result<ReplayStats> {
        let frame_size = self.frame_size();
        let mut buf = vec![0u8; frame_size as usize];
        let mut stats = ReplayStats::default();
        let mut index = HashMap::new();
        let mut pending: Vec<(PageId, u64)> = Vec::new();
        let mut pending_seq = None;
        let mut tail = WAL_HEADER_SIZE as u64;
        let mut offset = tail;

        while offset + frame_size <= len {
            self.log.read_at(offset, &mut buf)?;
            let frame = FrameHeader::decode(&buf)
                .filter(|f| f.generation == header.generation && f.db_id == header.db_id)
                .filter(|f| f.commit_seq > stats.last_seq);

            let Some(frame) = frame else {
                if self.commit_follows(offset + frame_size, len, header, stats.last_seq)? {
                    tracing::error!(offset, "Damaged write-ahead log frame precedes a commit");
                    return Err(Error::WalChecksumMismatch { offset });
                }
                break;
            };

            match frame.kind {
                FrameKind::Page => {
                    if pending_seq != Some(frame.commit_seq) {
                        pending.clear();
                        pending_seq = Some(frame.commit_seq);
                    }
                    pending.push((frame.page_id, offset));
                },
                FrameKind::Commit => {
                    if pending_seq != Some(frame.commit_seq) || pending.len() as u64 != frame.page_id
                    {
                        return Err(Error::corrupted(format!(
                            "commit {} at log offset {offset} seals {} frames, found {}",
                            frame.commit_seq,
                            frame.page_id,
                            if pending_seq == Some(frame.commit_seq) { pending.len() } else { 0 }
                        )));
                    }
                    stats.page_frames += pending.len() as u64;
                    index.extend(pending.drain(..));
                    pending_seq = None;
                    stats.commits += 1;
                    stats.last_seq = frame.commit_seq;
                    tail = offset + frame_size;
                },
            }
            offset += frame_size;
        }

        stats.discarded_bytes = len - tail;
        if stats.discarded_bytes > 0 {
            tracing::warn!(
                discarded_bytes = stats.discarded_bytes,
                uncommitted_frames = pending.len(),
                "Discarding write-ahead log tail after last commit"
            );
        }

        let committed = self.committed.get_mut();
        committed.header = header;
        committed.index = index;
        committed.tail = tail;
        committed.frames = (tail - WAL_HEADER_SIZE as u64) / frame_size;
        committed.last_seq = stats.last_seq;
        Ok(stats)
    }

    /// Whether a valid commit frame newer than `last_seq` exists at or after `from`.
    fn commit_follows(&self, from: u64, len: u64, header: WalHeader, last_seq: u64) -> Result<bool> {
        let frame_size = self.frame_size();
        let mut buf = vec![0u8; frame_size as usize];
        let mut offset = from;
        while offset + frame_size <= len {
            self.log.read_at(offset, &mut buf)?;
            if let Some(frame) = FrameHeader::decode(&buf) {
                if frame.kind == FrameKind::Commit
                    && frame.generation == header.generation
                    && frame.db_id == header.db_id
                    && frame.commit_seq > last_seq
                {
                    return Ok(true);
                }
            }
            offset += frame_size;
        }
        Ok(false)
    }

    /// Appends the image of `page_id` to the commit `seq` in progress.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] on a read-only log, [`Error::Corrupted`] if
    /// the image has the wrong size, and [`Error::Io`] if the write fails.
    pub fn append(&self, seq: u64, page_id: PageId, image: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if image.len() != self.page_size {
            return Err(Error::corrupted(format!(
                "log image for page {page_id} is {} bytes, expected {}",
                image.len(),
                self.page_size
            )));
        }

        let (header, committed_tail, last_seq) = {
            let committed = self.committed.read();
            (committed.header, committed.tail, committed.last_seq)
        };
        if seq <= last_seq {
            return Err(Error::corrupted(format!(
                "commit sequence {seq} does not follow {last_seq}"
            )));
        }

        let mut pending = self.pending.lock();
        if pending.seq != Some(seq) {
            pending.seq = Some(seq);
            pending.frames.clear();
            pending.tail = committed_tail;
        }

        let frame = FrameHeader {
            kind: FrameKind::Page,
            page_id,
            commit_seq: seq,
            generation: header.generation,
            db_id: header.db_id,
        }
        .encode(image);
        let offset = pending.tail;
        self.log.write_at(offset, &frame)?;
        pending.frames.push((page_id, offset));
        pending.tail += self.frame_size();
        Ok(())
    }

    /// Seals the frames appended for `seq` and publishes them to readers.
    ///
    /// With `sync`, the page frames are synced before the commit frame is
    /// written and the commit frame is synced before returning. On failure
    /// the appended frames are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if writing or syncing fails, and
    /// [`Error::Corrupted`] if nothing was appended for `seq` or the failed
    /// tail could not be removed.
    pub fn commit(&self, seq: u64, sync: bool) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.seq != Some(seq) || pending.frames.is_empty() {
            return Err(Error::corrupted(format!("commit {seq} has no appended frames")));
        }

        let header = self.committed.read().header;
        let marker = FrameHeader {
            kind: FrameKind::Commit,
            page_id: pending.frames.len() as u64,
            commit_seq: seq,
            generation: header.generation,
            db_id: header.db_id,
        }
        .encode(&vec![0u8; self.page_size]);

        let written = (|| -> Result<()> {
            if sync {
                self.log.sync()?;
            }
            self.log.write_at(pending.tail, &marker)?;
            if sync {
                self.log.sync()?;
            }
            Ok(())
        })();
        if let Err(e) = written {
            self.discard(&mut pending)?;
            return Err(e);
        }

        let mut committed = self.committed.write();
        committed.frames += pending.frames.len() as u64 + 1;
        committed.index.extend(pending.frames.drain(..));
        committed.tail = pending.tail + self.frame_size();
        committed.last_seq = seq;
        pending.seq = None;
        Ok(())
    }

    /// Drops frames appended for a commit that will not happen.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the log tail cannot be truncated.
    pub fn abort(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        self.discard(&mut pending)
    }

    fn discard(&self, pending: &mut PendingCommit) -> Result<()> {
        let had_frames = pending.seq.take().is_some();
        pending.frames.clear();
        if !had_frames || self.read_only {
            return Ok(());
        }
        let tail = self.committed.read().tail;
        self.log.truncate(tail).map_err(|e| {
            tracing::error!(error = %e, tail, "Failed to discard uncommitted log frames");
            Error::corrupted(format!("log tail past offset {tail} could not be discarded: {e}"))
        })
    }

    /// Returns the newest committed image of `page_id`, if logged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the frame cannot be read.
    pub fn read_image(&self, page_id: PageId) -> Result<Option<Vec<u8>>> {
        let committed = self.committed.read();
        let Some(&offset) = committed.index.get(&page_id) else {
            return Ok(None);
        };
        let mut image = vec![0u8; self.page_size];
        self.log.read_at(offset + FRAME_HEADER_SIZE as u64, &mut image)?;
        Ok(Some(image))
    }

    /// Copies every logged page into the main file and starts a new
    /// generation.
    ///
    /// `apply` receives each page's newest image in commit order;
    /// `sync_main` must make them durable before the log is truncated.
    /// The caller keeps writers out for the duration.
    ///
    /// # Errors
    ///
    /// Propagates errors from `apply`, `sync_main` and the log. If the copy
    /// fails, the log is left intact and will be replayed again. Once the
    /// log has been truncated, a failure to write or sync its fresh header
    /// is [`Error::Corrupted`].
    pub fn checkpoint(
        &self,
        apply: &mut dyn FnMut(PageId, &[u8]) -> Result<()>,
        sync_main: &mut dyn FnMut() -> Result<()>,
    ) -> Result<CheckpointStats> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let _pending = self.pending.lock();
        let mut committed = self.committed.write();

        let mut entries: Vec<(u64, PageId)> =
            committed.index.iter().map(|(&page_id, &offset)| (offset, page_id)).collect();
        entries.sort_unstable();

        let mut image = vec![0u8; self.page_size];
        for &(offset, page_id) in &entries {
            self.log.read_at(offset + FRAME_HEADER_SIZE as u64, &mut image)?;
            apply(page_id, &image)?;
        }
        sync_main()?;

        let header = WalHeader { generation: committed.header.generation + 1, ..committed.header };
        Self::reset_log(self.log.as_ref(), &mut committed, header)?;
        Ok(CheckpointStats { pages: entries.len() as u64, generation: header.generation })
    }

    /// Rebinds an empty log to a new database id (after a rekey).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the log still holds frames or the
    /// new header cannot be made durable after truncation, and
    /// [`Error::Io`] if the truncation itself fails.
    pub fn rebind(&self, db_id: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let _pending = self.pending.lock();
        let mut committed = self.committed.write();
        if !committed.index.is_empty() {
            return Err(Error::corrupted("log must be checkpointed before it is rebound"));
        }
        let header =
            WalHeader { generation: committed.header.generation + 1, db_id, ..committed.header };
        Self::reset_log(self.log.as_ref(), &mut committed, header)
    }

    fn reset_log(
        log: &dyn LogBackend,
        committed: &mut CommittedLog,
        header: WalHeader,
    ) -> Result<()> {
        log.truncate(0)?;
        // The frames are gone from the file; the in-memory view follows it
        // even if writing the new header fails.
        committed.header = header;
        committed.index.clear();
        committed.tail = WAL_HEADER_SIZE as u64;
        committed.frames = 0;

        log.write_at(0, &header.to_bytes()).and_then(|()| log.sync()).map_err(|e| {
            tracing::error!(error = %e, generation = header.generation, "Failed to write fresh log header");
            Error::corrupted(format!("log header for generation {} could not be written: {e}", header.generation))
        })
    }

    /// Frames (page and commit) written since the last checkpoint.
    pub fn frame_count(&self) -> u64 {
        self.committed.read().frames
    }

    /// Highest commit sequence written to the log since it was opened.
    pub fn last_seq(&self) -> u64 {
        self.committed.read().last_seq
    }

    /// Current log generation.
    pub fn generation(&self) -> u64 {
        self.committed.read().header.generation
    }
}
