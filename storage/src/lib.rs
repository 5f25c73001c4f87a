//! Storage core for PageDB.
//!
//! This crate provides the low-level paginated record store: a fixed-size
//! slotted page operating on a caller-provided buffer, coupled to a
//! write-ahead log sink so that every byte-level mutation is recoverable.
//! File I/O, page caching and multi-page transactions live in the layers
//! above.

pub mod buffer;
pub mod page;
pub mod version;
pub mod wal;

pub use buffer::{PageBuffer, PAGE_SIZE, PAGE_SIZE_KIB};
pub use page::{replay, SlottedPage, MAX_RECORD_SIZE, NO_PAGE};
pub use version::RecordVersion;
pub use wal::{Lsn, MemoryWal, WalRecord, WalSink};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Not enough free bytes in the page for the requested record.
    /// Non-fatal: the caller retries on a different page.
    #[error("page is full: requested {requested} bytes, {available} available")]
    PageFull { requested: usize, available: usize },

    #[error("buffer access out of bounds: offset {offset}, len {len}")]
    OutOfBounds { offset: usize, len: usize },

    #[error("page buffer must be {PAGE_SIZE} bytes, got {0}")]
    InvalidBufferLength(usize),

    /// The WAL sink failed to append. The in-memory page that emitted the
    /// record may be inconsistent and must be discarded.
    #[error("wal append failed: {0}")]
    Wal(#[from] std::io::Error),

    /// Page bytes violate a structural invariant; indicates prior
    /// corruption.
    #[error("page corrupted: {0}")]
    Corrupted(&'static str),
}

pub type Result<T> = std::result::Result<T, StorageError>;
