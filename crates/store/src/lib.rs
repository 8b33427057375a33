//! sealdb-store: an embedded single-file encrypted storage engine.
//!
//! One store is one file plus a write-ahead log next to it. Every page is
//! sealed with XChaCha20-Poly1305 under a key stretched from a passphrase,
//! so the file reveals nothing but its size and a tampered page fails to
//! open instead of returning wrong data.
//!
//! - **Ordered keys**: a copy-on-write B+ tree with overflow chains for large values
//! - **Typed records**: a row of null, integer, float, text or blob values per key
//! - **Single writer, many readers**: readers pin a snapshot and never block
//! - **Durable commits**: frames go to the write-ahead log and are checkpointed later
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                Database API                  │
//! │  (open, get, put, delete, scan, checkpoint) │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │             Transaction Layer                │
//! │  (ReadTxn: snapshot, WriteTxn: COW+commit)  │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │              B+ Tree Layer                   │
//! │    (get, insert, delete, range, overflow)   │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │          Page Layer + Write-Ahead Log        │
//! │   (allocator, cache, cipher, wal frames)    │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │            Storage Backend                   │
//! │      (FileBackend / InMemoryBackend)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use sealdb_store::{Database, KeyRange, Record, StoreConfig, Value};
//!
//! // Create an in-memory store
//! let db = Database::open_in_memory(b"passphrase", StoreConfig::default())?;
//!
//! // Write transaction
//! let mut txn = db.begin()?;
//! txn.put(&42u64, &Record::new(vec![Value::Text("answer".into())]))?;
//! txn.commit()?;
//!
//! // Read transaction
//! let txn = db.read()?;
//! let record = txn.get(&42u64)?;
//! let all = txn.scan(KeyRange::all())?.collect_entries()?;
//! # Ok::<(), sealdb_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
// B+ tree operations use complex return types for split propagation
#![allow(clippy::type_complexity)]
// Low-level page arithmetic uses explicit bounds checking for clarity
#![allow(clippy::manual_range_contains)]

pub mod backend;
pub mod btree;
pub mod cipher;
pub mod db;
pub mod error;
pub mod integrity;
pub mod key;
pub mod page;
pub mod record;
pub mod transaction;
pub mod wal;

// Re-export commonly used types
pub use backend::{DEFAULT_PAGE_SIZE, FileBackend, FileHeader, HEADER_SIZE, InMemoryBackend, MAGIC, StorageBackend};
pub use btree::{BTree, InsertMode, PageProvider};
pub use cipher::{KdfParams, PageCipher};
pub use db::{
    DEFAULT_CHECKPOINT_THRESHOLD, Database, KeyRange, ReadTransaction, Scan, StoreConfig, StoreStats,
    WriteTransaction, WriteView,
};
pub use error::{Error, ErrorKind, PageId, PageType, Result};
pub use integrity::{IntegrityScrubber, ScrubError, ScrubResult};
pub use key::{DecodeKey, Key};
pub use page::{PAGE_HEADER_SIZE, Page, PageAllocator, PageCache};
pub use record::{Record, Value};
pub use transaction::{SnapshotId, TransactionState};
pub use wal::{CheckpointStats, FileLog, LogBackend, MemoryLog, ReplayStats};

/// Store format version.
pub const VERSION: u16 = backend::FORMAT_VERSION;
