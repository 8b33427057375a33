//! Store handle and transactions.
//!
//! A single writer and any number of readers share one store. Readers pin
//! the committed state visible when they start; the writer builds a new
//! state out of copied pages and publishes it by swapping one pointer after
//! its commit frame is durable in the write-ahead log.
//!
//! # Example
//!
//! ```no_run
//! use sealdb_store::{Database, KeyRange, Record, StoreConfig, Value};
//!
//! let db = Database::open("app.sdb", b"correct horse", StoreConfig::default())?;
//!
//! let mut txn = db.begin()?;
//! txn.put("user:1", &Record::new(vec![Value::Integer(1), Value::Text("ada".into())]))?;
//! txn.commit()?;
//!
//! let txn = db.read()?;
//! let record = txn.get("user:1")?;
//! for entry in txn.scan(KeyRange::from("user:"))? {
//!     let (key, record) = entry?;
//! }
//! # Ok::<(), sealdb_store::Error>(())
//! ```

use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    ops::Bound as StdBound,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::{
    backend::{
        DEFAULT_PAGE_SIZE, FileBackend, FileHeader, InMemoryBackend, StorageBackend,
        validate_page_size,
    },
    btree::{
        BTree, InsertMode, PageProvider, PageProviderMut,
        cursor::{Bound, Range},
    },
    cipher::{KdfParams, PageCipher, SALT_SIZE, generate_salt},
    error::{Error, PageId, Result},
    integrity::{self, IntegrityScrubber, ScrubResult},
    key::Key,
    page::{FIRST_DATA_PAGE, META_PAGE_ID, MetaPage, Page, PageAllocator, PageCache, PageStore},
    record::Record,
    transaction::{CommittedState, PendingFrees, SnapshotId, TransactionState, TransactionTracker},
    wal::{CheckpointStats, FileLog, LogBackend, MemoryLog, Wal},
};

/// Default number of log frames that triggers an automatic checkpoint.
pub const DEFAULT_CHECKPOINT_THRESHOLD: u64 = 1000;

/// Default number of entries to buffer per refill in a scan.
const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Store configuration options.
#[derive(Debug, Clone, bon::Builder)]
pub struct StoreConfig {
    /// Page size in bytes (power of two, 512..=32768). Only used when the
    /// store is created; an existing file keeps its own page size.
    #[builder(default = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,
    /// Open without write access.
    #[builder(default = false)]
    pub read_only: bool,
    /// Log frames after which a commit checkpoints the log.
    #[builder(default = DEFAULT_CHECKPOINT_THRESHOLD)]
    pub checkpoint_threshold: u64,
    /// Maximum decrypted pages held in memory.
    #[builder(default = 1024)]
    pub cache_size: usize,
    /// Whether to sync the log on every commit (default true for durability).
    #[builder(default = true)]
    pub sync_on_commit: bool,
    /// How long [`Database::begin`] waits for the write lock. `None` waits
    /// indefinitely.
    pub busy_timeout: Option<Duration>,
    /// Create the file when it does not exist.
    #[builder(default = true)]
    pub create_if_missing: bool,
    /// Key derivation cost for newly created stores.
    #[builder(default)]
    pub kdf: KdfParams,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            read_only: false,
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
            cache_size: 1024, // ~4MB with 4KB pages
            sync_on_commit: true,
            busy_timeout: None,
            create_if_missing: true,
            kdf: KdfParams::default(),
        }
    }
}

impl StoreConfig {
    /// Checks every setting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first rejected setting.
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.checkpoint_threshold == 0 {
            return Err(Error::InvalidConfig {
                reason: "checkpoint_threshold must be at least 1".to_string(),
            });
        }
        self.kdf.validate()
    }
}

/// Database statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Physical page size in bytes.
    pub page_size: usize,
    /// Plaintext bytes available per page.
    pub usable_page_size: usize,
    /// Pages allocated in the file (including the meta page).
    pub total_pages: u64,
    /// Pages on the free list.
    pub free_pages: u64,
    /// Pages currently in cache.
    pub cached_pages: usize,
    /// Total page cache hits since open.
    pub cache_hits: u64,
    /// Total page cache misses since open.
    pub cache_misses: u64,
    /// Frames in the write-ahead log since the last checkpoint.
    pub wal_frames: u64,
    /// Current log generation.
    pub wal_generation: u64,
    /// Sequence number of the last commit.
    pub commit_seq: u64,
    /// Live entries.
    pub entry_count: u64,
    /// Levels in the tree (0 when empty).
    pub tree_depth: usize,
    /// Total B-tree page splits since open.
    pub page_splits: u64,
    /// Total B-tree merges since open.
    pub page_merges: u64,
    /// Live read transactions.
    pub active_readers: u64,
}

/// State owned by whoever holds the write lock.
pub(crate) struct WriterState {
    pub(crate) allocator: PageAllocator,
    pub(crate) pending_frees: PendingFrees,
}

/// The main database handle.
///
/// Generic over [`StorageBackend`]: use [`Database<FileBackend>`] for
/// production and [`Database<InMemoryBackend>`] for testing.
///
/// Thread-safe with interior mutability. Supports concurrent reads and
/// exclusive writes (single-writer model).
///
/// # Transaction Isolation (Copy-on-Write)
///
/// - Read transactions capture an immutable snapshot at start (no locks held)
/// - Write transactions modify copies of pages with new page IDs
/// - Atomic pointer swap makes commits visible instantly
/// - Old pages are reused only when no reader references them
pub struct Database<B: StorageBackend> {
    /// Encrypted page store over the main file. Written only by checkpoints
    /// and rekey.
    store: RwLock<PageStore<B>>,
    /// Write-ahead log holding every commit since the last checkpoint.
    wal: Wal,
    /// Decrypted committed pages shared across all transactions.
    cache: PageCache,
    /// Write lock guarding the allocator and deferred frees.
    writer: Mutex<WriterState>,
    /// Current committed state (atomically swapped on commit).
    committed_state: ArcSwap<CommittedState>,
    /// Transaction tracker for safe page reuse.
    tracker: TransactionTracker,
    config: StoreConfig,
    page_size: usize,
    usable_size: usize,
    /// Set once corruption is observed; writes are refused afterwards.
    poisoned: AtomicBool,
    closed: AtomicBool,
    page_splits: AtomicU64,
    page_merges: AtomicU64,
}

impl Database<FileBackend> {
    /// Opens the store at `path`, creating it if missing (unless
    /// `create_if_missing` is off or the store is read-only).
    ///
    /// The write-ahead log lives next to the file as `<path>-wal` and is
    /// replayed and checkpointed before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPassphrase`] if the passphrase does not unlock
    /// the file, a corruption error ([`Error::InvalidMagic`],
    /// [`Error::HeaderChecksumMismatch`], [`Error::Corrupted`], ...) if the
    /// file or log is damaged, and [`Error::Io`] if it cannot be read.
    ///
    /// ```no_run
    /// use sealdb_store::{Database, StoreConfig};
    ///
    /// let db = Database::open("/var/lib/app/store.sdb", b"secret", StoreConfig::default())?;
    /// let txn = db.read()?;
    /// # Ok::<(), sealdb_store::Error>(())
    /// ```
    pub fn open(path: impl AsRef<Path>, passphrase: &[u8], config: StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        let log_path = FileLog::path_for(path);
        let log: Box<dyn LogBackend> = if config.read_only {
            match FileLog::open_read_only(&log_path)? {
                Some(log) => Box::new(log),
                None => Box::new(MemoryLog::new()),
            }
        } else {
            Box::new(FileLog::open(&log_path)?)
        };
        Self::open_with_log(path, passphrase, config, log)
    }

    /// Opens the store at `path` over a caller-supplied log backend.
    ///
    /// # Errors
    ///
    /// See [`Database::open`].
    pub fn open_with_log(
        path: impl AsRef<Path>,
        passphrase: &[u8],
        config: StoreConfig,
        log: Box<dyn LogBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();

        if path.exists() {
            let backend = FileBackend::open(path, config.read_only)?;
            let header = FileHeader::from_bytes(&backend.read_header()?)?;
            if header.page_size() != config.page_size {
                tracing::debug!(
                    file_page_size = header.page_size(),
                    configured = config.page_size,
                    "Using the page size recorded in the file"
                );
            }
            let cipher = unlock(&header, passphrase)?;
            return Self::from_store(PageStore::new(backend, cipher, header), log, config);
        }

        if config.read_only || !config.create_if_missing {
            return Err(Error::Io {
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} does not exist", path.display()),
                ),
            });
        }

        let (header, cipher) = new_header(passphrase, &config)?;
        let backend = FileBackend::create(path, &header)?;
        tracing::info!(path = %path.display(), page_size = header.page_size(), "Created store");
        Self::from_store(PageStore::new(backend, cipher, header), log, config)
    }
}

impl Database<InMemoryBackend> {
    /// Creates an in-memory store.
    ///
    /// Pages are still encrypted and committed through a log; everything is
    /// lost when the handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid or read-only config.
    ///
    /// ```no_run
    /// use sealdb_store::{Database, StoreConfig};
    ///
    /// let db = Database::open_in_memory(b"secret", StoreConfig::default())?;
    /// # Ok::<(), sealdb_store::Error>(())
    /// ```
    pub fn open_in_memory(passphrase: &[u8], config: StoreConfig) -> Result<Self> {
        config.validate()?;
        if config.read_only {
            return Err(Error::InvalidConfig {
                reason: "an in-memory store cannot be read-only".to_string(),
            });
        }
        let (header, cipher) = new_header(passphrase, &config)?;
        let backend = InMemoryBackend::new(&header);
        Self::from_store(PageStore::new(backend, cipher, header), Box::new(MemoryLog::new()), config)
    }
}

/// Log binding id for a file: the first eight salt bytes. A rekey draws a
/// new salt, so logs written under the old key stop matching.
fn db_id(salt: &[u8; SALT_SIZE]) -> u64 {
    let mut id = [0u8; 8];
    id.copy_from_slice(&salt[..8]);
    u64::from_le_bytes(id)
}

fn unlock(header: &FileHeader, passphrase: &[u8]) -> Result<PageCipher> {
    let cipher = PageCipher::derive(passphrase, &header.salt, &header.kdf)?;
    cipher.verify_key_check(&header.key_check)?;
    Ok(cipher)
}

fn new_header(passphrase: &[u8], config: &StoreConfig) -> Result<(FileHeader, PageCipher)> {
    let salt = generate_salt()?;
    let cipher = PageCipher::derive(passphrase, &salt, &config.kdf)?;
    let page_size_power = config.page_size.trailing_zeros() as u8;
    let header = FileHeader::new(page_size_power, config.kdf, salt, cipher.seal_key_check()?);
    Ok((header, cipher))
}

/// Reads the newest committed image of a page: the log first, then the
/// main file. `next_page` is the committed allocation high-water mark.
fn read_committed<B: StorageBackend>(
    store: &PageStore<B>,
    wal: &Wal,
    page_id: PageId,
    next_page: PageId,
) -> Result<Page> {
    match wal.read_image(page_id)? {
        Some(image) => store.decrypt(page_id, &image),
        None => store.read(page_id, next_page),
    }
}

impl<B: StorageBackend> Database<B> {
    fn from_store(store: PageStore<B>, log: Box<dyn LogBackend>, config: StoreConfig) -> Result<Self> {
        let header = store.header().clone();
        let usable_size = store.usable_size();
        let (wal, replay) =
            Wal::open(log, header.page_size_power, db_id(&header.salt), config.read_only)?;

        let fresh = store.page_count()? == 0 && wal.read_image(META_PAGE_ID)?.is_none();
        let meta = if fresh {
            let meta = MetaPage::empty();
            if !config.read_only {
                store.write(&meta.to_page(usable_size))?;
                store.sync()?;
            }
            meta
        } else {
            MetaPage::from_page(&read_committed(&store, &wal, META_PAGE_ID, FIRST_DATA_PAGE)?)?
        };

        let allocator = PageAllocator::load(meta.free_head, meta.free_count, meta.next_page, |id| {
            read_committed(&store, &wal, id, meta.next_page)
        })?;

        let db = Self {
            cache: PageCache::new(config.cache_size),
            writer: Mutex::new(WriterState { allocator, pending_frees: PendingFrees::new() }),
            committed_state: ArcSwap::from_pointee(CommittedState {
                root: meta.root,
                snapshot_id: SnapshotId::new(meta.commit_seq),
                entry_count: meta.entry_count,
                next_page: meta.next_page,
                free_pages: meta.free_count,
            }),
            tracker: TransactionTracker::new(),
            page_size: header.page_size(),
            usable_size,
            poisoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            page_splits: AtomicU64::new(0),
            page_merges: AtomicU64::new(0),
            store: RwLock::new(store),
            wal,
            config,
        };

        tracing::info!(
            page_size = db.page_size,
            commit_seq = meta.commit_seq,
            entries = meta.entry_count,
            replayed_commits = replay.commits,
            replayed_frames = replay.page_frames,
            read_only = db.config.read_only,
            "Opened store"
        );

        if !db.config.read_only {
            if meta.pending_free_count > 0 {
                db.recover_leaked_pages()?;
            }
            if db.wal.frame_count() > 0 {
                let writer = db.writer.lock();
                db.checkpoint_locked(&writer)?;
            }
        }
        Ok(db)
    }

    /// Returns the pages an interrupted session freed but never linked into
    /// the free list.
    fn recover_leaked_pages(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        let state = self.committed_state.load_full();
        let view = ReadView { db: self, state: Arc::clone(&state) };

        let mut in_use: HashSet<PageId> = integrity::reachable_pages(&view, state.root)?;
        in_use.extend(writer.allocator.free_pages().iter().copied());
        let leaked: Vec<PageId> =
            (FIRST_DATA_PAGE..state.next_page).filter(|id| !in_use.contains(id)).collect();

        tracing::warn!(pages = leaked.len(), "Recovering pages leaked by an interrupted session");
        writer.pending_frees.record_freed_pages(state.snapshot_id, leaked);
        self.begin_locked(writer).commit_inner(true)?;
        Ok(())
    }

    /// Begins a read transaction pinned to the latest commit.
    ///
    /// Never blocks on the writer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`Database::close`].
    pub fn read(&self) -> Result<ReadTransaction<'_, B>> {
        self.ensure_open()?;
        let state = self.tracker.begin_read(&self.committed_state);
        Ok(ReadTransaction { view: ReadView { db: self, state } })
    }

    /// Begins the write transaction.
    ///
    /// Waits for the current writer to finish, at most `busy_timeout` when
    /// configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreBusy`] if the timeout expires,
    /// [`Error::ReadOnly`] / [`Error::WritesDisabled`] / [`Error::Closed`]
    /// if the store does not accept writes.
    pub fn begin(&self) -> Result<WriteTransaction<'_, B>> {
        self.ensure_open()?;
        self.ensure_mutable()?;
        let writer = self.lock_writer()?;
        self.ensure_open()?;
        self.ensure_mutable()?;
        Ok(self.begin_locked(writer))
    }

    fn begin_locked<'db>(&'db self, writer: MutexGuard<'db, WriterState>) -> WriteTransaction<'db, B> {
        let base = self.committed_state.load_full();
        WriteTransaction {
            db: self,
            next_page_at_begin: writer.allocator.next_page(),
            writer,
            seq: base.snapshot_id.next().raw(),
            root: base.root,
            entry_count: base.entry_count,
            base,
            pages: TxnPages::default(),
            state: TransactionState::Active,
        }
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, WriterState>> {
        match self.config.busy_timeout {
            Some(timeout) => self
                .writer
                .try_lock_for(timeout)
                .ok_or(Error::StoreBusy { reason: "another write transaction is active" }),
            None => Ok(self.writer.lock()),
        }
    }

    /// Reads the record stored under `key` at the latest commit.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read or the record is malformed.
    pub fn get<K: Key + ?Sized>(&self, key: &K) -> Result<Option<Record>> {
        self.read()?.get(key)
    }

    /// Inserts or replaces `key` in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`WriteTransaction::put`] and [`WriteTransaction::commit`].
    pub fn put<K: Key + ?Sized>(&self, key: &K, record: &Record) -> Result<()> {
        let mut txn = self.begin()?;
        txn.put(key, record)?;
        txn.commit()?;
        Ok(())
    }

    /// Deletes `key` in its own transaction, returning whether it existed.
    ///
    /// # Errors
    ///
    /// See [`WriteTransaction::delete`] and [`WriteTransaction::commit`].
    pub fn delete<K: Key + ?Sized>(&self, key: &K) -> Result<bool> {
        let mut txn = self.begin()?;
        let existed = txn.delete(key)?;
        txn.commit()?;
        Ok(existed)
    }

    /// Scans `range` at the latest commit. The scan keeps its snapshot
    /// pinned until dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`Database::close`].
    pub fn scan(&self, range: KeyRange) -> Result<Scan<ReadTransaction<'_, B>>> {
        let txn = self.read()?;
        let root = txn.view.state.root;
        Ok(Scan::new(txn, root, range))
    }

    /// Copies every logged page into the main file and truncates the log.
    ///
    /// Waits for the active writer like [`Database::begin`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] on a read-only store,
    /// [`Error::StoreBusy`] if the write lock cannot be taken in time and
    /// [`Error::Io`] if the copy fails (the log is kept and replayed later).
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        self.ensure_open()?;
        self.ensure_mutable()?;
        let writer = self.lock_writer()?;
        self.checkpoint_locked(&writer)
    }

    /// Checkpoint body; the caller holds the write lock.
    fn checkpoint_locked(&self, _writer: &WriterState) -> Result<CheckpointStats> {
        let store = self.store.read();
        let next_page = self.committed_state.load().next_page;
        if store.page_count()? < next_page {
            store.grow(next_page)?;
        }
        let stats = self
            .wal
            .checkpoint(&mut |page_id, image| store.write_physical(page_id, image), &mut || store.sync())
            .inspect_err(|e| self.observe(e))?;
        tracing::info!(pages = stats.pages, generation = stats.generation, "Checkpointed write-ahead log");
        Ok(stats)
    }

    /// Flushes the store and refuses further use.
    ///
    /// Deferred page frees are linked into the free list and the log is
    /// checkpointed. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreBusy`] while any transaction is active, or the
    /// error of the final commit or checkpoint.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let busy = Error::StoreBusy { reason: "transactions are still active" };
        let writer = self.writer.try_lock().ok_or(Error::StoreBusy {
            reason: "a write transaction is active",
        })?;
        if self.tracker.has_active_readers() {
            return Err(busy);
        }
        self.closed.store(true, Ordering::Release);

        if !self.config.read_only && !self.poisoned.load(Ordering::Acquire) {
            let writer = if writer.pending_frees.is_empty() {
                writer
            } else {
                self.begin_locked(writer).commit_inner(true)?;
                self.writer.lock()
            };
            self.checkpoint_locked(&writer)?;
        }
        tracing::info!(commit_seq = self.commit_seq(), "Closed store");
        Ok(())
    }

    /// Re-encrypts the store under `new_passphrase`.
    ///
    /// Checkpoints, re-encrypts every page under a key derived from a fresh
    /// salt and atomically replaces the file. Afterwards only the new
    /// passphrase opens it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreBusy`] while readers are active or the write
    /// lock cannot be taken, and [`Error::Io`] / [`Error::Authentication`]
    /// if the copy fails (the old file and key stay in place). A failure
    /// after the file has been replaced is [`Error::Corrupted`] and
    /// disables writes.
    pub fn rekey(&self, new_passphrase: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.ensure_mutable()?;
        let writer = self.lock_writer()?;
        if self.tracker.has_active_readers() {
            return Err(Error::StoreBusy { reason: "read transactions are active" });
        }
        self.checkpoint_locked(&writer)?;

        let mut store = self.store.write();
        let current = store.header().clone();
        let salt = generate_salt()?;
        let cipher = PageCipher::derive(new_passphrase, &salt, &current.kdf)?;
        let header = FileHeader::new(current.page_size_power, current.kdf, salt, cipher.seal_key_check()?);
        let page_count = self.committed_state.load().next_page;

        store.reencrypt(header, cipher, page_count).inspect_err(|e| self.observe(e))?;
        // The file now carries the new id; a log still bound to the old one
        // would be ignored on the next open.
        self.wal
            .rebind(db_id(&salt))
            .map_err(|e| match e {
                Error::Corrupted { .. } => e,
                other => Error::corrupted(format!("log could not be rebound after rekey: {other}")),
            })
            .inspect_err(|e| self.observe(e))?;
        tracing::info!(pages = page_count, "Rekeyed store");
        Ok(())
    }

    /// Returns database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree depth cannot be read.
    pub fn stats(&self) -> Result<StoreStats> {
        let txn = self.read()?;
        let state = Arc::clone(&txn.view.state);
        let tree_depth = BTree::new(state.root, &txn).depth()?;
        let cache = self.cache.stats();

        Ok(StoreStats {
            page_size: self.page_size,
            usable_page_size: self.usable_size,
            total_pages: state.next_page,
            free_pages: state.free_pages,
            cached_pages: cache.size,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            wal_frames: self.wal.frame_count(),
            wal_generation: self.wal.generation(),
            commit_seq: state.snapshot_id.raw(),
            entry_count: state.entry_count,
            tree_depth,
            page_splits: self.page_splits.load(Ordering::Relaxed),
            page_merges: self.page_merges.load(Ordering::Relaxed),
            // minus the snapshot pinned by this call
            active_readers: self.tracker.active_reader_count().saturating_sub(1),
        })
    }

    /// Walks the tree and free list, checking page types, key order,
    /// separator bounds, pointers and that every page is accounted for
    /// exactly once.
    ///
    /// Runs between write transactions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreBusy`] if the write lock cannot be taken in
    /// time. Problems found in the file are reported in the result.
    pub fn check_integrity(&self) -> Result<ScrubResult> {
        self.ensure_open()?;
        let writer = self.lock_writer()?;
        let state = self.committed_state.load_full();
        let view = ReadView { db: self, state };
        let pending: Vec<PageId> = writer.pending_frees.pages().collect();
        Ok(IntegrityScrubber::new(&view, view.state().root).run(writer.allocator.free_pages(), &pending))
    }

    /// Sequence number of the last commit.
    pub fn commit_seq(&self) -> u64 {
        self.committed_state.load().snapshot_id.raw()
    }

    /// Live entries at the last commit.
    pub fn entry_count(&self) -> u64 {
        self.committed_state.load().entry_count
    }

    /// Physical page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether the store was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// Whether writes are refused because corruption was observed.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::WritesDisabled);
        }
        Ok(())
    }

    /// Disables writes if `error` means the file can no longer be trusted.
    fn observe(&self, error: &Error) {
        if error.is_corruption() && !self.poisoned.swap(true, Ordering::AcqRel) {
            tracing::error!(error = %error, "Corruption detected; refusing further writes");
        }
    }

    /// Reads a committed page through the cache.
    pub(crate) fn read_page(&self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.cache.get(page_id) {
            return Ok(page);
        }
        let page = {
            let next_page = self.committed_state.load().next_page;
            let store = self.store.read();
            read_committed(&store, &self.wal, page_id, next_page).inspect_err(|e| self.observe(e))?
        };
        self.cache.insert(page.clone());
        Ok(page)
    }

    /// Encrypts `pages` into the log as commit `seq` and seals it.
    fn write_commit(&self, seq: u64, pages: &HashMap<PageId, Page>) -> Result<()> {
        let store = self.store.read();
        let mut ordered: Vec<&Page> = pages.values().collect();
        ordered.sort_unstable_by_key(|page| page.id);
        for page in ordered {
            let appended = store.encrypt(page).and_then(|image| self.wal.append(seq, page.id, &image));
            if let Err(e) = appended {
                self.wal.abort()?;
                return Err(e);
            }
        }
        self.wal.commit(seq, self.config.sync_on_commit)
    }
}

/// Pages of one committed snapshot.
pub(crate) struct ReadView<'db, B: StorageBackend> {
    db: &'db Database<B>,
    state: Arc<CommittedState>,
}

impl<B: StorageBackend> ReadView<'_, B> {
    pub(crate) fn state(&self) -> &CommittedState {
        &self.state
    }
}

impl<B: StorageBackend> PageProvider for ReadView<'_, B> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        self.db.read_page(page_id)
    }

    fn usable_size(&self) -> usize {
        self.db.usable_size
    }

    fn page_limit(&self) -> PageId {
        self.state.next_page
    }
}

/// A read-only transaction.
///
/// Sees the store exactly as of the commit that was current when it began,
/// however many commits follow. Pages it can reach are not reused until it
/// is dropped.
pub struct ReadTransaction<'db, B: StorageBackend> {
    view: ReadView<'db, B>,
}

impl<'db, B: StorageBackend> ReadTransaction<'db, B> {
    /// Returns the record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or the record is malformed.
    pub fn get<K: Key + ?Sized>(&self, key: &K) -> Result<Option<Record>> {
        let tree = BTree::new(self.view.state.root, &self.view);
        tree.get(&key.to_key_bytes())?.map(|value| Record::decode(&value)).transpose()
    }

    /// Checks if a key exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails during the lookup.
    pub fn contains_key<K: Key + ?Sized>(&self, key: &K) -> Result<bool> {
        BTree::new(self.view.state.root, &self.view).contains_key(&key.to_key_bytes())
    }

    /// Iterates over `range` in key order.
    ///
    /// # Errors
    ///
    /// Currently infallible; page errors surface from the iterator.
    pub fn scan(&self, range: KeyRange) -> Result<Scan<&Self>> {
        Ok(Scan::new(self, self.view.state.root, range))
    }

    /// The commit this transaction sees.
    pub fn snapshot_id(&self) -> u64 {
        self.view.state.snapshot_id.raw()
    }

    /// Live entries in this snapshot.
    pub fn entry_count(&self) -> u64 {
        self.view.state.entry_count
    }
}

impl<B: StorageBackend> PageProvider for ReadTransaction<'_, B> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        self.view.read_page(page_id)
    }

    fn usable_size(&self) -> usize {
        self.view.usable_size()
    }

    fn page_limit(&self) -> PageId {
        self.view.page_limit()
    }
}

impl<B: StorageBackend> Drop for ReadTransaction<'_, B> {
    fn drop(&mut self) {
        self.view.db.tracker.unregister_read_transaction(self.view.state.snapshot_id);
    }
}

/// Pages touched by a write transaction.
#[derive(Default)]
struct TxnPages {
    /// New page images, not visible to anyone else until commit.
    dirty: HashMap<PageId, Page>,
    /// Pages allocated by this transaction (safe to modify in place).
    owned: HashSet<PageId>,
    /// Committed pages this transaction stopped referencing.
    pages_to_free: Vec<PageId>,
    /// Allocated pages that ended up unused.
    reusable: Vec<PageId>,
    /// Pages taken from the free list, in pop order.
    popped: Vec<PageId>,
}

impl TxnPages {
    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// A write transaction.
///
/// Holds the write lock from [`Database::begin`] until it commits, rolls
/// back or is dropped. Reads inside the transaction see its own writes.
///
/// A failed `put`, `update` or `delete` leaves the transaction as it was
/// before the call; it can continue or roll back.
///
/// # Invariants
///
/// **Lock ordering:** the write lock is acquired first and held for the
/// whole transaction. The store, log and cache locks are taken inside
/// individual operations and released before returning.
///
/// **Drop behavior:** dropping an active transaction rolls it back.
pub struct WriteTransaction<'db, B: StorageBackend> {
    db: &'db Database<B>,
    writer: MutexGuard<'db, WriterState>,
    /// Committed state this transaction started from.
    base: Arc<CommittedState>,
    /// Sequence this transaction commits as.
    seq: u64,
    root: PageId,
    entry_count: u64,
    next_page_at_begin: PageId,
    pages: TxnPages,
    state: TransactionState,
}

impl<'db, B: StorageBackend> WriteTransaction<'db, B> {
    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// The commit this transaction started from.
    pub fn snapshot_id(&self) -> u64 {
        self.base.snapshot_id.raw()
    }

    /// Inserts `key` or replaces its record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTooLarge`] / [`Error::ValueTooLarge`] for
    /// oversized input, or an error if a page cannot be read.
    pub fn put<K: Key + ?Sized>(&mut self, key: &K, record: &Record) -> Result<()> {
        let key = key.to_key_bytes();
        let value = record.encode();
        let replaced = self.apply(|tree| tree.insert(&key, &value, InsertMode::Upsert))?;
        if !replaced {
            self.entry_count += 1;
        }
        Ok(())
    }

    /// Replaces the record of an existing key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if `key` is absent, plus the errors of
    /// [`Self::put`].
    pub fn update<K: Key + ?Sized>(&mut self, key: &K, record: &Record) -> Result<()> {
        let key = key.to_key_bytes();
        let value = record.encode();
        self.apply(|tree| tree.insert(&key, &value, InsertMode::UpdateOnly))?;
        Ok(())
    }

    /// Deletes `key`, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read or written.
    pub fn delete<K: Key + ?Sized>(&mut self, key: &K) -> Result<bool> {
        let key = key.to_key_bytes();
        let removed = self.apply(|tree| tree.delete(&key))?;
        if removed {
            self.entry_count = self.entry_count.saturating_sub(1);
        }
        Ok(removed)
    }

    /// Returns the record under `key`, including this transaction's writes.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or the record is malformed.
    pub fn get<K: Key + ?Sized>(&self, key: &K) -> Result<Option<Record>> {
        let tree = BTree::new(self.root, self.view());
        tree.get(&key.to_key_bytes())?.map(|value| Record::decode(&value)).transpose()
    }

    /// Iterates over `range` including this transaction's writes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the transaction already finished.
    pub fn scan(&self, range: KeyRange) -> Result<Scan<WriteView<'_, 'db, B>>> {
        self.ensure_active()?;
        Ok(Scan::new(self.view(), self.root, range))
    }

    /// Live entries including this transaction's writes.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn view(&self) -> WriteView<'_, 'db, B> {
        WriteView { db: self.db, dirty: &self.pages.dirty, page_limit: self.writer.allocator.next_page() }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Runs one tree operation against a scratch overlay, keeping its pages
    /// only if it succeeds.
    fn apply<T>(&mut self, op: impl FnOnce(&mut BTree<TxnProvider<'_, 'db, B>>) -> Result<T>) -> Result<T> {
        self.ensure_active()?;
        self.db.ensure_mutable()?;

        let provider = TxnProvider {
            db: self.db,
            pages: &mut self.pages,
            allocator: &mut self.writer.allocator,
            seq: self.seq,
            overlay: HashMap::new(),
            op_allocated: Vec::new(),
            op_freed: Vec::new(),
        };
        let mut tree = BTree::new(self.root, provider);
        let result = op(&mut tree);
        let root = tree.root_page();
        let (splits, merges) = (tree.split_count(), tree.merge_count());
        let provider = tree.into_provider();

        match result {
            Ok(value) => {
                provider.keep();
                self.root = root;
                self.db.page_splits.fetch_add(splits, Ordering::Relaxed);
                self.db.page_merges.fetch_add(merges, Ordering::Relaxed);
                Ok(value)
            },
            Err(e) => {
                provider.discard();
                self.db.observe(&e);
                Err(e)
            },
        }
    }

    /// Commits the transaction, returning its commit sequence number.
    ///
    /// 1. Pages freed by earlier commits that no reader can reach are linked into the free list
    /// 2. Every dirty page plus the new meta page is encrypted into the log
    /// 3. The commit frame is written (and synced with `sync_on_commit`)
    /// 4. The new state is published to readers
    /// 5. The log is checkpointed once it reaches `checkpoint_threshold` frames
    ///
    /// A transaction that changed nothing returns the sequence it started
    /// from without writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the log cannot be written; the transaction
    /// is then rolled back and nothing becomes visible. Returns
    /// [`Error::WritesDisabled`] once corruption has been observed.
    pub fn commit(self) -> Result<u64> {
        self.commit_inner(false)
    }

    fn commit_inner(mut self, force: bool) -> Result<u64> {
        self.ensure_active()?;
        if !force && self.pages.dirty.is_empty() && self.pages.pages_to_free.is_empty() {
            self.release_pages();
            self.state = TransactionState::Committed;
            return Ok(self.base.snapshot_id.raw());
        }
        self.db.ensure_mutable()?;
        self.state = TransactionState::Committing;

        let db = self.db;
        let seq = self.seq;
        let writer = &mut *self.writer;

        let drained = writer.pending_frees.drain_freeable(db.tracker.oldest_live_read_transaction());
        let mut to_link: Vec<PageId> = drained.iter().flat_map(|(_, pages)| pages.iter().copied()).collect();
        to_link.append(&mut self.pages.reusable);
        for &page_id in &to_link {
            let page = writer.allocator.push_free(page_id, db.usable_size, seq);
            self.pages.dirty.insert(page_id, page);
        }

        let meta = MetaPage {
            root: self.root,
            free_head: writer.allocator.head(),
            free_count: writer.allocator.free_count(),
            next_page: writer.allocator.next_page(),
            commit_seq: seq,
            pending_free_count: writer.pending_frees.pending_count() + self.pages.pages_to_free.len() as u64,
            entry_count: self.entry_count,
        };
        self.pages.dirty.insert(META_PAGE_ID, meta.to_page(db.usable_size));

        if let Err(e) = db.write_commit(seq, &self.pages.dirty) {
            writer.allocator.restore(&self.pages.popped, to_link.len(), self.next_page_at_begin);
            writer.pending_frees.restore(drained);
            self.pages.clear();
            self.state = TransactionState::Aborted;
            db.observe(&e);
            tracing::warn!(seq, error = %e, "Commit failed; transaction rolled back");
            return Err(e);
        }

        let page_count = self.pages.dirty.len();
        for (_, page) in self.pages.dirty.drain() {
            db.cache.insert(page);
        }
        writer
            .pending_frees
            .record_freed_pages(SnapshotId::new(seq), std::mem::take(&mut self.pages.pages_to_free));
        db.committed_state.store(Arc::new(CommittedState {
            root: self.root,
            snapshot_id: SnapshotId::new(seq),
            entry_count: self.entry_count,
            next_page: meta.next_page,
            free_pages: meta.free_count,
        }));
        self.state = TransactionState::Committed;
        tracing::debug!(seq, pages = page_count, linked_free = to_link.len(), "Committed transaction");

        if db.wal.frame_count() >= db.config.checkpoint_threshold {
            if let Err(e) = db.checkpoint_locked(writer) {
                tracing::warn!(error = %e, "Automatic checkpoint failed; the log will be replayed");
            }
        }
        Ok(seq)
    }

    /// Discards every change.
    pub fn rollback(mut self) {
        if self.state == TransactionState::Active {
            self.abort_inner();
        }
    }

    fn abort_inner(&mut self) {
        self.state = TransactionState::Aborting;
        self.release_pages();
        self.state = TransactionState::Aborted;
    }

    /// Returns allocated pages to the allocator and drops staged writes.
    fn release_pages(&mut self) {
        self.writer.allocator.restore(&self.pages.popped, 0, self.next_page_at_begin);
        self.pages.clear();
    }
}

impl<B: StorageBackend> Drop for WriteTransaction<'_, B> {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            tracing::debug!(
                snapshot_id = self.base.snapshot_id.raw(),
                "Rolling back write transaction dropped while active"
            );
            self.abort_inner();
        }
    }
}

/// Read-only view of a write transaction's pages.
pub struct WriteView<'t, 'db, B: StorageBackend> {
    db: &'db Database<B>,
    dirty: &'t HashMap<PageId, Page>,
    page_limit: PageId,
}

impl<B: StorageBackend> PageProvider for WriteView<'_, '_, B> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        match self.dirty.get(&page_id) {
            Some(page) => Ok(page.clone()),
            None => self.db.read_page(page_id),
        }
    }

    fn usable_size(&self) -> usize {
        self.db.usable_size
    }

    fn page_limit(&self) -> PageId {
        self.page_limit
    }
}

/// Page provider for one tree operation inside a write transaction.
///
/// Writes, allocations and frees are journaled per operation: on success
/// they are folded into the transaction, on failure they are undone so the
/// transaction is unchanged.
struct TxnProvider<'t, 'db, B: StorageBackend> {
    db: &'db Database<B>,
    pages: &'t mut TxnPages,
    allocator: &'t mut PageAllocator,
    seq: u64,
    overlay: HashMap<PageId, Page>,
    op_allocated: Vec<PageId>,
    op_freed: Vec<PageId>,
}

impl<B: StorageBackend> TxnProvider<'_, '_, B> {
    fn keep(self) {
        self.pages.dirty.extend(self.overlay);
        for page_id in self.op_freed {
            if self.pages.owned.remove(&page_id) {
                self.pages.dirty.remove(&page_id);
                self.pages.reusable.push(page_id);
            } else {
                self.pages.pages_to_free.push(page_id);
            }
        }
    }

    fn discard(self) {
        for page_id in self.op_allocated {
            self.pages.owned.remove(&page_id);
            self.pages.reusable.push(page_id);
        }
    }
}

impl<B: StorageBackend> PageProvider for TxnProvider<'_, '_, B> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.overlay.get(&page_id).or_else(|| self.pages.dirty.get(&page_id)) {
            return Ok(page.clone());
        }
        self.db.read_page(page_id)
    }

    fn usable_size(&self) -> usize {
        self.db.usable_size
    }

    fn page_limit(&self) -> PageId {
        self.allocator.next_page()
    }
}

impl<B: StorageBackend> PageProviderMut for TxnProvider<'_, '_, B> {
    fn write_page(&mut self, page: Page) {
        self.overlay.insert(page.id, page);
    }

    fn allocate_page(&mut self) -> Result<PageId> {
        let page_id = if let Some(page_id) = self.pages.reusable.pop() {
            page_id
        } else if let Some(page_id) = self.allocator.pop_free() {
            self.pages.popped.push(page_id);
            page_id
        } else {
            self.allocator.allocate_new()
        };
        self.pages.owned.insert(page_id);
        self.op_allocated.push(page_id);
        Ok(page_id)
    }

    fn free_page(&mut self, page_id: PageId) {
        self.op_freed.push(page_id);
    }

    fn owns(&self, page_id: PageId) -> bool {
        self.pages.owned.contains(&page_id)
    }

    fn commit_seq(&self) -> u64 {
        self.seq
    }
}

// ============================================================================
// Scans
// ============================================================================

/// An owned key range for scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Lower bound.
    pub start: StdBound<Vec<u8>>,
    /// Upper bound.
    pub end: StdBound<Vec<u8>>,
}

impl KeyRange {
    /// Every key.
    pub fn all() -> Self {
        Self { start: StdBound::Unbounded, end: StdBound::Unbounded }
    }

    /// Keys at or after `start`.
    pub fn from<K: Key + ?Sized>(start: &K) -> Self {
        Self { start: StdBound::Included(start.to_key_bytes()), end: StdBound::Unbounded }
    }

    /// Keys strictly after `start`.
    pub fn after<K: Key + ?Sized>(start: &K) -> Self {
        Self { start: StdBound::Excluded(start.to_key_bytes()), end: StdBound::Unbounded }
    }

    /// Keys in `[start, end)`.
    pub fn between<K: Key + ?Sized>(start: &K, end: &K) -> Self {
        Self {
            start: StdBound::Included(start.to_key_bytes()),
            end: StdBound::Excluded(end.to_key_bytes()),
        }
    }

    /// Keys in `[start, end]`.
    pub fn inclusive<K: Key + ?Sized>(start: &K, end: &K) -> Self {
        Self {
            start: StdBound::Included(start.to_key_bytes()),
            end: StdBound::Included(end.to_key_bytes()),
        }
    }

    /// Keys before `end`.
    pub fn before<K: Key + ?Sized>(end: &K) -> Self {
        Self { start: StdBound::Unbounded, end: StdBound::Excluded(end.to_key_bytes()) }
    }

    /// Checks if a key is within this range.
    pub fn contains(&self, key: &[u8]) -> bool {
        Range { start: cursor_bound(&self.start), end: cursor_bound(&self.end) }.contains(key)
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

fn cursor_bound(bound: &StdBound<Vec<u8>>) -> Bound<'_> {
    match bound {
        StdBound::Unbounded => Bound::Unbounded,
        StdBound::Included(key) => Bound::Included(key),
        StdBound::Excluded(key) => Bound::Excluded(key),
    }
}

/// Streaming iterator over a key range.
///
/// Yields `(key, record)` pairs in key order from an internal buffer that
/// is lazily refilled from the tree, resuming just past the last key
/// returned. Memory stays at `O(buffer_size)` regardless of range size.
///
/// The scan reads one snapshot throughout: commits that happen while it
/// runs are not observed.
pub struct Scan<P: PageProvider> {
    provider: P,
    root: PageId,
    range: KeyRange,
    /// Buffered entries awaiting consumption.
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    /// The last key returned, used to resume scanning after the buffer drains.
    last_key: Option<Vec<u8>>,
    /// True once the range has been fully consumed.
    exhausted: bool,
    /// Maximum entries to fetch per refill.
    buffer_size: usize,
}

impl<P: PageProvider> Scan<P> {
    fn new(provider: P, root: PageId, range: KeyRange) -> Self {
        Self {
            provider,
            root,
            range,
            buffer: VecDeque::new(),
            last_key: None,
            exhausted: root == 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Sets the number of entries fetched per refill.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// The last key returned; a new scan from
    /// [`KeyRange::after`] this key continues where this one stopped.
    pub fn resume_key(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }

    /// Fill the internal buffer with the next batch of entries.
    fn refill_buffer(&mut self) -> Result<()> {
        if self.exhausted {
            return Ok(());
        }
        let start = match &self.last_key {
            Some(last) => Bound::Excluded(last.as_slice()),
            None => cursor_bound(&self.range.start),
        };
        let range = Range { start, end: cursor_bound(&self.range.end) };
        let tree = BTree::new(self.root, &self.provider);
        let mut iter = tree.range(range);

        while self.buffer.len() < self.buffer_size {
            match iter.next_entry()? {
                Some(entry) => self.buffer.push_back(entry),
                None => {
                    self.exhausted = true;
                    break;
                },
            }
        }
        Ok(())
    }

    /// Returns the next raw `(key, encoded record)` pair.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails while refilling the buffer.
    pub fn next_raw(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.buffer.is_empty() {
            self.refill_buffer()?;
        }
        let Some((key, value)) = self.buffer.pop_front() else {
            return Ok(None);
        };
        self.last_key = Some(key.clone());
        Ok(Some((key, value)))
    }

    /// Returns the next entry.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a record is malformed.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Record)>> {
        match self.next_raw()? {
            Some((key, value)) => Ok(Some((key, Record::decode(&value)?))),
            None => Ok(None),
        }
    }

    /// Collects all remaining entries.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered.
    pub fn collect_entries(mut self) -> Result<Vec<(Vec<u8>, Record)>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl<P: PageProvider> Iterator for Scan<P> {
    type Item = Result<(Vec<u8>, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.exhausted = true;
                self.buffer.clear();
                Some(Err(e))
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::{error::ErrorKind, record::Value};

    const PASS: &[u8] = b"test passphrase";

    fn config() -> StoreConfig {
        StoreConfig::builder().kdf(KdfParams::new(64, 1, 1)).build()
    }

    fn small_pages() -> StoreConfig {
        StoreConfig::builder().kdf(KdfParams::new(64, 1, 1)).page_size(512).build()
    }

    fn memory_db() -> Database<InMemoryBackend> {
        Database::open_in_memory(PASS, config()).unwrap()
    }

    fn rec(n: i64) -> Record {
        Record::new(vec![Value::Integer(n)])
    }

    #[test]
    fn test_store_config_builder() {
        let config = StoreConfig::builder()
            .page_size(8192)
            .cache_size(512)
            .sync_on_commit(false)
            .busy_timeout(Duration::from_millis(50))
            .build();

        assert_eq!(config.page_size, 8192);
        assert_eq!(config.cache_size, 512);
        assert!(!config.sync_on_commit);
        assert_eq!(config.busy_timeout, Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_store_config_builder_defaults() {
        let built = StoreConfig::builder().build();
        let default = StoreConfig::default();
        assert_eq!(built.page_size, default.page_size);
        assert_eq!(built.checkpoint_threshold, DEFAULT_CHECKPOINT_THRESHOLD);
        assert!(built.sync_on_commit);
        assert!(built.create_if_missing);
        assert!(!built.read_only);
        assert_eq!(built.busy_timeout, None);
    }

    #[test]
    fn test_store_config_validate() {
        assert!(config().validate().is_ok());
        let bad_page = StoreConfig::builder().page_size(3000).build();
        assert!(matches!(bad_page.validate(), Err(Error::InvalidConfig { .. })));
        let bad_threshold = StoreConfig::builder().checkpoint_threshold(0).build();
        assert!(matches!(bad_threshold.validate(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_write_and_read() {
        let db = memory_db();
        let mut txn = db.begin().unwrap();
        txn.put("alpha", &rec(1)).unwrap();
        txn.put("beta", &rec(2)).unwrap();
        assert_eq!(txn.state(), TransactionState::Active);
        let seq = txn.commit().unwrap();
        assert_eq!(seq, 1);

        let txn = db.read().unwrap();
        assert_eq!(txn.get("alpha").unwrap(), Some(rec(1)));
        assert_eq!(txn.get("beta").unwrap(), Some(rec(2)));
        assert_eq!(txn.get("gamma").unwrap(), None);
        assert_eq!(txn.entry_count(), 2);
        assert_eq!(txn.snapshot_id(), 1);
    }

    #[test]
    fn test_autocommit_helpers() {
        let db = memory_db();
        db.put(&7u64, &rec(7)).unwrap();
        assert_eq!(db.get(&7u64).unwrap(), Some(rec(7)));
        assert!(db.delete(&7u64).unwrap());
        assert!(!db.delete(&7u64).unwrap());
        assert_eq!(db.get(&7u64).unwrap(), None);
        assert_eq!(db.entry_count(), 0);
    }

    #[test]
    fn test_update_requires_existing_key() {
        let db = memory_db();
        let mut txn = db.begin().unwrap();
        let err = txn.update("missing", &rec(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);

        // the failed call left the transaction usable
        txn.put("present", &rec(1)).unwrap();
        txn.update("present", &rec(2)).unwrap();
        assert_eq!(txn.entry_count(), 1);
        txn.commit().unwrap();
        assert_eq!(db.get("present").unwrap(), Some(rec(2)));
    }

    #[test]
    fn test_rollback_discards_changes() {
        let db = memory_db();
        db.put("kept", &rec(1)).unwrap();

        let mut txn = db.begin().unwrap();
        txn.put("discarded", &rec(2)).unwrap();
        txn.delete("kept").unwrap();
        assert_eq!(txn.get("discarded").unwrap(), Some(rec(2)));
        txn.rollback();

        assert_eq!(db.get("kept").unwrap(), Some(rec(1)));
        assert_eq!(db.get("discarded").unwrap(), None);
        assert_eq!(db.commit_seq(), 1);
    }

    #[test]
    fn test_drop_rolls_back() {
        let db = memory_db();
        {
            let mut txn = db.begin().unwrap();
            txn.put("a", &rec(1)).unwrap();
        }
        assert_eq!(db.get("a").unwrap(), None);
        // the write lock was released
        db.put("b", &rec(2)).unwrap();
    }

    #[test]
    fn test_empty_commit_is_noop() {
        let db = memory_db();
        db.put("a", &rec(1)).unwrap();
        let txn = db.begin().unwrap();
        assert_eq!(txn.commit().unwrap(), 1);
        assert_eq!(db.commit_seq(), 1);
    }

    #[test]
    fn test_write_transaction_scan_sees_own_writes() {
        let db = memory_db();
        db.put(&1u64, &rec(1)).unwrap();
        let mut txn = db.begin().unwrap();
        txn.put(&2u64, &rec(2)).unwrap();
        let keys: Vec<Vec<u8>> =
            txn.scan(KeyRange::all()).unwrap().map(|e| e.unwrap().0).collect();
        assert_eq!(keys, vec![1u64.to_key_bytes(), 2u64.to_key_bytes()]);
    }

    #[test]
    fn test_snapshot_isolation() {
        let db = memory_db();
        db.put("a", &rec(1)).unwrap();

        let reader = db.read().unwrap();
        let mut txn = db.begin().unwrap();
        txn.put("a", &rec(100)).unwrap();
        txn.put("b", &rec(2)).unwrap();
        txn.commit().unwrap();

        assert_eq!(reader.get("a").unwrap(), Some(rec(1)));
        assert_eq!(reader.get("b").unwrap(), None);
        assert_eq!(db.get("a").unwrap(), Some(rec(100)));
    }

    #[test]
    fn test_scan_does_not_observe_concurrent_commit() {
        let db = Database::open_in_memory(PASS, small_pages()).unwrap();
        for i in 0..500u64 {
            db.put(&(i * 2), &rec(i as i64)).unwrap();
        }

        let mut scan = db.scan(KeyRange::all()).unwrap().with_buffer_size(16);
        let mut seen = Vec::new();
        for _ in 0..100 {
            seen.push(scan.next().unwrap().unwrap().0);
        }

        let mut txn = db.begin().unwrap();
        for i in 0..500u64 {
            txn.put(&(i * 2 + 1), &rec(0)).unwrap();
        }
        txn.commit().unwrap();

        for entry in scan {
            seen.push(entry.unwrap().0);
        }
        let expected: Vec<Vec<u8>> = (0..500u64).map(|i| (i * 2).to_key_bytes()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_scan_ranges() {
        let db = memory_db();
        let mut txn = db.begin().unwrap();
        for i in 0..50u64 {
            txn.put(&i, &rec(i as i64)).unwrap();
        }
        txn.commit().unwrap();

        let count = |range: KeyRange| db.scan(range).unwrap().count();
        assert_eq!(count(KeyRange::all()), 50);
        assert_eq!(count(KeyRange::from(&10u64)), 40);
        assert_eq!(count(KeyRange::after(&10u64)), 39);
        assert_eq!(count(KeyRange::between(&10u64, &20u64)), 10);
        assert_eq!(count(KeyRange::inclusive(&10u64, &20u64)), 11);
        assert_eq!(count(KeyRange::before(&5u64)), 5);
        assert_eq!(count(KeyRange::between(&60u64, &70u64)), 0);
    }

    #[test]
    fn test_scan_buffer_refill_and_resume() {
        let db = memory_db();
        let mut txn = db.begin().unwrap();
        for i in 0..2500u64 {
            txn.put(&i, &rec(i as i64)).unwrap();
        }
        txn.commit().unwrap();

        let mut scan = db.scan(KeyRange::all()).unwrap();
        let mut n = 0u64;
        while let Some((key, record)) = scan.next_entry().unwrap() {
            assert_eq!(key, n.to_key_bytes());
            assert_eq!(record, rec(n as i64));
            n += 1;
            if n == 1200 {
                break;
            }
        }
        let resume = scan.resume_key().unwrap().to_vec();
        drop(scan);

        let rest = db.scan(KeyRange::after(resume.as_slice())).unwrap().collect_entries().unwrap();
        assert_eq!(rest.len(), 1300);
        assert_eq!(rest[0].0, 1200u64.to_key_bytes());
    }

    #[test]
    fn test_empty_store_scan() {
        let db = memory_db();
        assert_eq!(db.scan(KeyRange::all()).unwrap().count(), 0);
        assert_eq!(db.stats().unwrap().tree_depth, 0);
    }

    #[test]
    fn test_freed_pages_reused_after_reader_ends() {
        let db = Database::open_in_memory(PASS, small_pages()).unwrap();
        for i in 0..200u64 {
            db.put(&i, &rec(i as i64)).unwrap();
        }
        let reader = db.read().unwrap();
        for i in 0..200u64 {
            db.delete(&i).unwrap();
        }
        // the reader pins every page of the old tree
        assert_eq!(reader.get(&5u64).unwrap(), Some(rec(5)));
        let pinned = db.stats().unwrap().free_pages;
        drop(reader);

        db.put(&1000u64, &rec(0)).unwrap();
        let stats = db.stats().unwrap();
        assert!(stats.free_pages > pinned, "{} <= {pinned}", stats.free_pages);
        assert!(db.check_integrity().unwrap().is_ok());
    }

    #[test]
    fn test_busy_timeout() {
        let db = Database::open_in_memory(
            PASS,
            StoreConfig::builder()
                .kdf(KdfParams::new(64, 1, 1))
                .busy_timeout(Duration::from_millis(20))
                .build(),
        )
        .unwrap();
        let txn = db.begin().unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                let err = db.begin().err().unwrap();
                assert_eq!(err.kind(), ErrorKind::Busy);
            });
        });
        drop(txn);
        assert!(db.begin().is_ok());
    }

    #[test]
    fn test_concurrent_writes_from_threads() {
        let db = Arc::new(memory_db());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let db = Arc::clone(&db);
                thread::spawn(move || {
                    for i in 0..50u64 {
                        db.put(&(t * 1000 + i), &rec(i as i64)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(db.entry_count(), 200);
        assert_eq!(db.commit_seq(), 200);
    }

    #[test]
    fn test_close_rules() {
        let db = memory_db();
        db.put("a", &rec(1)).unwrap();
        {
            let _reader = db.read().unwrap();
            assert_eq!(db.close().unwrap_err().kind(), ErrorKind::Busy);
        }
        {
            let _writer = db.begin().unwrap();
            assert_eq!(db.close().unwrap_err().kind(), ErrorKind::Busy);
        }
        db.close().unwrap();
        db.close().unwrap();
        assert!(matches!(db.get("a"), Err(Error::Closed)));
        assert!(matches!(db.begin(), Err(Error::Closed)));
    }

    #[test]
    fn test_file_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sdb");
        {
            let db = Database::open(&path, PASS, config()).unwrap();
            for i in 0..300u64 {
                db.put(&i, &rec(i as i64)).unwrap();
            }
            db.close().unwrap();
        }
        let db = Database::open(&path, PASS, config()).unwrap();
        assert_eq!(db.entry_count(), 300);
        assert_eq!(db.get(&299u64).unwrap(), Some(rec(299)));
        assert_eq!(db.scan(KeyRange::all()).unwrap().count(), 300);
    }

    #[test]
    fn test_reopen_without_close_replays_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sdb");
        {
            let db = Database::open(&path, PASS, config()).unwrap();
            db.put("a", &rec(1)).unwrap();
            assert!(db.stats().unwrap().wal_frames > 0);
        }
        let db = Database::open(&path, PASS, config()).unwrap();
        assert_eq!(db.get("a").unwrap(), Some(rec(1)));
        assert_eq!(db.stats().unwrap().wal_frames, 0);
    }

    #[test]
    fn test_wrong_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sdb");
        Database::open(&path, PASS, config()).unwrap().close().unwrap();

        let err = Database::open(&path, b"wrong", config()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn test_missing_file_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::builder().kdf(KdfParams::new(64, 1, 1)).create_if_missing(false).build();
        let err = Database::open(dir.path().join("absent.sdb"), PASS, config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sdb");
        {
            let db = Database::open(&path, PASS, config()).unwrap();
            db.put("a", &rec(1)).unwrap();
            db.close().unwrap();
        }
        let read_only = StoreConfig::builder().kdf(KdfParams::new(64, 1, 1)).read_only(true).build();
        let db = Database::open(&path, PASS, read_only).unwrap();
        assert!(db.is_read_only());
        assert_eq!(db.get("a").unwrap(), Some(rec(1)));
        assert!(matches!(db.begin(), Err(Error::ReadOnly)));
        assert!(matches!(db.checkpoint(), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_rekey() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sdb");
        {
            let db = Database::open(&path, PASS, config()).unwrap();
            db.put("a", &rec(1)).unwrap();
            {
                let _reader = db.read().unwrap();
                assert_eq!(db.rekey(b"new").unwrap_err().kind(), ErrorKind::Busy);
            }
            db.rekey(b"new").unwrap();
            db.put("b", &rec(2)).unwrap();
            db.close().unwrap();
        }
        let err = Database::open(&path, PASS, config()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let db = Database::open(&path, b"new", config()).unwrap();
        assert_eq!(db.get("a").unwrap(), Some(rec(1)));
        assert_eq!(db.get("b").unwrap(), Some(rec(2)));
    }

    /// Lets `resets` truncations to zero through, then fails the next one.
    struct LimitedResetLog {
        inner: FileLog,
        resets: std::sync::atomic::AtomicU32,
    }

    impl LogBackend for LimitedResetLog {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.inner.read_at(offset, buf)
        }
        fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
            self.inner.write_at(offset, data)
        }
        fn len(&self) -> Result<u64> {
            self.inner.len()
        }
        fn truncate(&self, len: u64) -> Result<()> {
            if len == 0
                && self
                    .resets
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_err()
            {
                return Err(Error::Io { source: std::io::Error::other("truncate failed") });
            }
            self.inner.truncate(len)
        }
        fn sync(&self) -> Result<()> {
            self.inner.sync()
        }
    }

    #[test]
    fn test_rekey_with_unbindable_log_disables_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sdb");
        {
            // resets for the fresh log and the checkpoint inside rekey, none
            // for the rebind
            let log = LimitedResetLog {
                inner: FileLog::open(FileLog::path_for(&path)).unwrap(),
                resets: std::sync::atomic::AtomicU32::new(2),
            };
            let db = Database::open_with_log(&path, PASS, config(), Box::new(log)).unwrap();
            db.put("a", &rec(1)).unwrap();

            let err = db.rekey(b"new").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Corruption);
            assert!(db.is_poisoned());
            assert_eq!(db.put("b", &rec(2)).unwrap_err().kind(), ErrorKind::Corruption);
            // reads go through the replaced file and the new key
            assert_eq!(db.get("a").unwrap(), Some(rec(1)));
        }

        assert_eq!(Database::open(&path, PASS, config()).err().unwrap().kind(), ErrorKind::Authentication);
        let db = Database::open(&path, b"new", config()).unwrap();
        assert_eq!(db.get("a").unwrap(), Some(rec(1)));
        assert_eq!(db.get("b").unwrap(), None);
    }

    #[test]
    fn test_stats() {
        let db = Database::open_in_memory(PASS, small_pages()).unwrap();
        for i in 0..500u64 {
            db.put(&i, &rec(i as i64)).unwrap();
        }
        let stats = db.stats().unwrap();
        assert_eq!(stats.page_size, 512);
        assert_eq!(stats.usable_page_size, 472);
        assert_eq!(stats.entry_count, 500);
        assert_eq!(stats.commit_seq, 500);
        assert!(stats.tree_depth >= 2);
        assert!(stats.page_splits > 0);
        assert!(stats.total_pages > 2);
        assert_eq!(stats.active_readers, 0);
    }

    #[test]
    fn test_automatic_checkpoint() {
        let db = Database::open_in_memory(
            PASS,
            StoreConfig::builder().kdf(KdfParams::new(64, 1, 1)).checkpoint_threshold(10).build(),
        )
        .unwrap();
        for i in 0..20u64 {
            db.put(&i, &rec(0)).unwrap();
            assert!(db.stats().unwrap().wal_frames < 10);
        }
        assert_eq!(db.scan(KeyRange::all()).unwrap().count(), 20);
    }

    #[test]
    fn test_large_values_round_trip() {
        let db = memory_db();
        let blob = vec![0xAB; 50_000];
        db.put("big", &Record::new(vec![Value::Blob(blob.clone())])).unwrap();
        assert_eq!(db.get("big").unwrap(), Some(Record::new(vec![Value::Blob(blob)])));
        db.put("big", &rec(1)).unwrap();
        assert_eq!(db.get("big").unwrap(), Some(rec(1)));
        assert!(db.check_integrity().unwrap().is_ok());
    }

    #[test]
    fn test_key_too_large_leaves_transaction_usable() {
        let db = memory_db();
        let mut txn = db.begin().unwrap();
        txn.put("ok", &rec(1)).unwrap();
        let err = txn.put(vec![0u8; 5000].as_slice(), &rec(1)).unwrap_err();
        assert!(matches!(err, Error::KeyTooLarge { .. }));
        txn.commit().unwrap();
        assert_eq!(db.get("ok").unwrap(), Some(rec(1)));
        assert!(!db.is_poisoned());
    }
}
