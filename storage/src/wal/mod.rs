// storage/src/wal/mod.rs

use bytes::Bytes;
use parking_lot::Mutex;

use crate::Result;

/// Log sequence number assigned by a [`WalSink`].
///
/// Ordering is lexicographic on `(segment, position)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Lsn {
    pub segment: u64,
    pub position: u32,
}

impl Lsn {
    /// The LSN of a page that never went through an atomic update.
    pub const ZERO: Lsn = Lsn {
        segment: 0,
        position: 0,
    };
}

/// One write-ahead log record.
///
/// `SetPageData` carries enough to reapply the write verbatim: the exact
/// bytes, their target offset, and the page identity. The other kinds carry
/// the page identity only.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WalRecord {
    StartAtomicUpdate {
        page_index: u64,
        file_name: String,
    },
    EndAtomicUpdate {
        page_index: u64,
        file_name: String,
    },
    AddNewPage {
        page_index: u64,
        file_name: String,
    },
    SetPageData {
        bytes: Bytes,
        offset: u32,
        page_index: u64,
        file_name: String,
    },
}

impl WalRecord {
    pub fn page_index(&self) -> u64 {
        match self {
            WalRecord::StartAtomicUpdate { page_index, .. }
            | WalRecord::EndAtomicUpdate { page_index, .. }
            | WalRecord::AddNewPage { page_index, .. }
            | WalRecord::SetPageData { page_index, .. } => *page_index,
        }
    }

    pub fn file_name(&self) -> &str {
        match self {
            WalRecord::StartAtomicUpdate { file_name, .. }
            | WalRecord::EndAtomicUpdate { file_name, .. }
            | WalRecord::AddNewPage { file_name, .. }
            | WalRecord::SetPageData { file_name, .. } => file_name,
        }
    }
}

/// An append-only log producing monotonically non-decreasing LSNs.
///
/// Sinks are shared by `&` reference and supply their own interior
/// mutability. A failing append leaves the page that emitted the record in
/// an unknown in-memory state; the caller must discard that page.
pub trait WalSink {
    /// Append one record and return its assigned LSN.
    fn log(&self, record: WalRecord) -> Result<Lsn>;
}

struct MemoryWalState {
    records: Vec<(Lsn, WalRecord)>,
    next: Lsn,
    segment_capacity: u32,
}

/// In-memory WAL sink that retains every record together with its LSN.
///
/// Used by recovery tests and anywhere a real log file is not wired up yet.
pub struct MemoryWal {
    inner: Mutex<MemoryWalState>,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self::with_segment_capacity(u32::MAX)
    }

    /// A sink whose segment part rolls over after `capacity` records, for
    /// exercising the lexicographic LSN order.
    pub fn with_segment_capacity(capacity: u32) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(MemoryWalState {
                records: Vec::new(),
                next: Lsn {
                    segment: 0,
                    position: 1,
                },
                segment_capacity: capacity,
            }),
        }
    }

    /// Snapshot of everything logged so far, in append order.
    pub fn records(&self) -> Vec<(Lsn, WalRecord)> {
        self.inner.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

impl WalSink for MemoryWal {
    fn log(&self, record: WalRecord) -> Result<Lsn> {
        let mut state = self.inner.lock();
        let lsn = state.next;
        state.records.push((lsn, record));
        if lsn.position >= state.segment_capacity {
            state.next = Lsn {
                segment: lsn.segment + 1,
                position: 1,
            };
        } else {
            state.next = Lsn {
                segment: lsn.segment,
                position: lsn.position + 1,
            };
        }
        Ok(lsn)
    }
}
