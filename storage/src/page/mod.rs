// storage/src/page/mod.rs

//! Fixed-size slotted page holding variable-length records.
//!
//! A page is a single header followed by a forward-growing slot directory
//! and a backward-growing record heap inside one `PAGE_SIZE` buffer:
//!
//! +--------+---------------------+--------------+---------------------+
//! | HEADER | SLOT DIRECTORY (->) | ... FREE ... | (<-) RECORD HEAP    |
//! +--------+---------------------+--------------+---------------------+
//!          ^ SLOT_OFFSET                        ^ free position
//!
//! Header fields (number denotes width in bytes):
//! +-----------+---------+-----------------+------------------+
//! | MAGIC (8) | CRC (4) | WAL SEGMENT (8) | WAL POSITION (4) |
//! +-----------+---------+-----------------+------------------+
//! +---------------+---------------+-------------------+-------------------+
//! | NEXT PAGE (8) | PREV PAGE (8) | FREELIST HEAD (4) | FREE POSITION (4) |
//! +---------------+---------------+-------------------+-------------------+
//! +----------------+-------------------+----------------+---------+
//! | FREE SPACE (4) | ENTRIES COUNT (4) | SLOT COUNT (4) | pad (4) |
//! +----------------+-------------------+----------------+---------+
//!
//! Each slot is a 4-byte pointer word plus a version stamp. Bits 0-15 of
//! the word hold the entry position; bit 16 marks a tombstone. Tombstoned
//! slots overload the position bits as an intrusive LIFO freelist link
//! (`0` terminates, `k` points at slot `k - 1`), which is what pins
//! `PAGE_SIZE` to at most 64 KiB. Each heap entry is a 4-byte size word
//! (negated while the entry is a reclaimable hole), the 4-byte owning slot
//! index, and the payload.
//!
//! Every mutating operation is bracketed by `StartAtomicUpdate` /
//! `EndAtomicUpdate` WAL records, and each byte-level write inside the
//! bracket is preceded by a `SetPageData` record carrying the exact bytes,
//! so redo recovery can reapply the operation verbatim. The `End` record's
//! LSN is stamped into the header directly, outside the logged path;
//! [`replay`] restores it from the `End` record itself.
//!
//! A page is not internally thread-safe. Callers serialize access through
//! the surrounding latching layer; in particular the read accessors
//! (`free_space`, `records_count`, `record`, ...) read header bytes without
//! any framing and are only safe under an external latch.

use bytes::Bytes;
use log::{debug, trace};

use crate::buffer::{PageBuffer, PAGE_SIZE};
use crate::version::RecordVersion;
use crate::wal::{Lsn, WalRecord, WalSink};
use crate::{Result, StorageError};

// Header field offsets. All integers little-endian.
const MAGIC_OFFSET: usize = 0;
const CRC_OFFSET: usize = 8;
const WAL_SEGMENT_OFFSET: usize = 12;
const WAL_POSITION_OFFSET: usize = 20;
const NEXT_PAGE_OFFSET: usize = 24;
const PREV_PAGE_OFFSET: usize = 32;
const FREELIST_HEAD_OFFSET: usize = 40;
const FREE_POSITION_OFFSET: usize = 44;
const FREE_SPACE_OFFSET: usize = 48;
const ENTRIES_COUNT_OFFSET: usize = 52;
const SLOT_COUNT_OFFSET: usize = 56;

/// Start of the slot directory; the header is padded up to this boundary.
pub const SLOT_OFFSET: usize = 64;

/// Slot directory entry width: 4-byte pointer word plus the version stamp.
pub const SLOT_SIZE: usize = 4 + RecordVersion::SIZE;

/// Heap entry header: 4-byte size word plus 4-byte owning slot index.
const ENTRY_HEADER_SIZE: usize = 8;

const POSITION_MASK: u32 = 0xFFFF;
const TOMBSTONE_FLAG: u32 = 1 << 16;

/// Largest heap entry a page can hold.
pub const MAX_ENTRY_SIZE: usize = PAGE_SIZE - SLOT_OFFSET - SLOT_SIZE;

/// Largest record payload a page can hold.
pub const MAX_RECORD_SIZE: usize = MAX_ENTRY_SIZE - ENTRY_HEADER_SIZE;

/// Sibling pointer value meaning "no sibling".
pub const NO_PAGE: i64 = -1;

// Entry positions must fit the 16 position bits of the slot word.
const _: () = assert!(PAGE_SIZE <= 1 << 16);

/// A slotted page bound to a caller-provided buffer and an optional WAL
/// sink.
///
/// With the sink absent every WAL emission is suppressed and only the
/// direct buffer mutation happens; recovery uses this mode while replaying
/// writes that are already in the log.
pub struct SlottedPage<'a> {
    buf: PageBuffer<'a>,
    wal: Option<&'a dyn WalSink>,
    page_index: u64,
    file_name: String,
}

impl<'a> SlottedPage<'a> {
    /// Format a brand-new page in `data` and announce it to the WAL with an
    /// `AddNewPage` record.
    pub fn format(
        data: &'a mut [u8],
        wal: Option<&'a dyn WalSink>,
        page_index: u64,
        file_name: impl Into<String>,
    ) -> Result<Self> {
        let file_name = file_name.into();
        if let Some(wal) = wal {
            wal.log(WalRecord::AddNewPage {
                page_index,
                file_name: file_name.clone(),
            })?;
        }
        let mut buf = PageBuffer::new(data)?;
        initialize(&mut buf)?;
        Ok(Self {
            buf,
            wal,
            page_index,
            file_name,
        })
    }

    /// Wrap an already-initialized page buffer read back from disk or
    /// cache.
    pub fn attach(
        data: &'a mut [u8],
        wal: Option<&'a dyn WalSink>,
        page_index: u64,
        file_name: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            buf: PageBuffer::new(data)?,
            wal,
            page_index,
            file_name: file_name.into(),
        })
    }

    /// Append a record with the supplied version, returning its slot id.
    /// Slot ids are stable for the record's lifetime.
    ///
    /// Returns [`StorageError::PageFull`] when the page cannot hold the
    /// record; that is non-fatal, the atomic frame still closes cleanly and
    /// the caller retries on a different page.
    pub fn append_record(&mut self, version: RecordVersion, payload: &[u8]) -> Result<u32> {
        self.with_atomic_update(|page| page.append_inner(version, payload))
    }

    /// Tombstone a record and push its slot onto the freelist.
    ///
    /// Deleting a slot that does not exist or is already tombstoned is not
    /// an error: the page is untouched and `false` comes back.
    pub fn delete_record(&mut self, slot: u32) -> Result<bool> {
        self.with_atomic_update(|page| page.delete_inner(slot as usize))
    }

    pub fn set_next_page(&mut self, page: i64) -> Result<()> {
        self.with_atomic_update(|p| p.write_i64(NEXT_PAGE_OFFSET, page))
    }

    pub fn set_prev_page(&mut self, page: i64) -> Result<()> {
        self.with_atomic_update(|p| p.write_i64(PREV_PAGE_OFFSET, page))
    }

    /// The payload of a live record, borrowed from the page buffer. `None`
    /// for tombstoned or never-allocated slots.
    pub fn record(&self, slot: u32) -> Option<&[u8]> {
        let word = self.live_slot_word(slot)?;
        let position = (word & POSITION_MASK) as usize;
        let size = self.buf.i32_at(position).ok()?;
        let len = (size as usize).checked_sub(ENTRY_HEADER_SIZE)?;
        self.buf.bytes_at(position + ENTRY_HEADER_SIZE, len).ok()
    }

    /// Payload length of a live record.
    pub fn record_size(&self, slot: u32) -> Option<usize> {
        self.record(slot).map(|payload| payload.len())
    }

    /// Version stamp of a live record. Tombstoned slots keep their last
    /// version for the reuse merge, but it is not observable here.
    pub fn record_version(&self, slot: u32) -> Option<RecordVersion> {
        self.live_slot_word(slot)?;
        self.slot_version(slot as usize).ok()
    }

    /// Whether `slot` exists and is tombstoned.
    pub fn is_deleted(&self, slot: u32) -> bool {
        slot < self.slots_count()
            && self
                .slot_word(slot as usize)
                .map(|word| (word & TOMBSTONE_FLAG) != 0)
                .unwrap_or(false)
    }

    /// First tombstoned slot at or after `from`, scanning ascending.
    pub fn find_first_deleted(&self, from: u32) -> Option<u32> {
        (from..self.slots_count()).find(|&slot| self.is_deleted(slot))
    }

    /// First live slot at or after `from`, scanning ascending.
    pub fn find_first_live(&self, from: u32) -> Option<u32> {
        (from..self.slots_count()).find(|&slot| !self.is_deleted(slot))
    }

    /// Last live slot at or before `at_or_before`, scanning descending.
    pub fn find_last_live(&self, at_or_before: u32) -> Option<u32> {
        let count = self.slots_count();
        if count == 0 {
            return None;
        }
        let start = at_or_before.min(count - 1);
        (0..=start).rev().find(|&slot| !self.is_deleted(slot))
    }

    /// Iterate live records as `(slot, payload)` pairs in slot order.
    pub fn records(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        (0..self.slots_count())
            .filter_map(move |slot| self.record(slot).map(|payload| (slot, payload)))
    }

    /// Bytes currently available for a new slot and entry.
    pub fn free_space(&self) -> usize {
        self.header_u32(FREE_SPACE_OFFSET) as usize
    }

    /// Number of live (non-tombstoned) records.
    pub fn records_count(&self) -> u32 {
        self.header_u32(ENTRIES_COUNT_OFFSET)
    }

    /// Number of slot-directory entries ever allocated, live or tombstoned.
    /// The directory never shrinks.
    pub fn slots_count(&self) -> u32 {
        self.header_u32(SLOT_COUNT_OFFSET)
    }

    pub fn next_page(&self) -> i64 {
        self.header_i64(NEXT_PAGE_OFFSET)
    }

    pub fn prev_page(&self) -> i64 {
        self.header_i64(PREV_PAGE_OFFSET)
    }

    /// LSN of the last atomic update applied to this page.
    pub fn lsn(&self) -> Lsn {
        Lsn {
            segment: self.header_u64(WAL_SEGMENT_OFFSET),
            position: self.header_u32(WAL_POSITION_OFFSET),
        }
    }

    /// Whether the page holds no entries at all. A page whose slots are all
    /// tombstoned still pays for its slot directory and is NOT empty.
    pub fn is_empty(&self) -> bool {
        self.free_space() == PAGE_SIZE - SLOT_OFFSET
    }

    /// Largest payload the next append can take without failing.
    pub fn max_record_size(&self) -> usize {
        let overhead = if self.header_u32(FREELIST_HEAD_OFFSET) > 0 {
            ENTRY_HEADER_SIZE
        } else {
            ENTRY_HEADER_SIZE + SLOT_SIZE
        };
        self.free_space().saturating_sub(overhead)
    }

    /// The magic word reserved for page typing. Written by the layer above.
    pub fn magic(&self) -> u64 {
        self.header_u64(MAGIC_OFFSET)
    }

    /// Flush-time helper: set the page-typing magic word. Written directly,
    /// never framed or logged.
    pub fn set_magic(&mut self, magic: u64) {
        self.header_put_u64(MAGIC_OFFSET, magic);
    }

    /// Flush-time helper: recompute the page CRC over everything but the
    /// CRC field itself. Written directly, never framed or logged.
    pub fn update_checksum(&mut self) {
        let crc = self.compute_checksum();
        self.header_put_u32(CRC_OFFSET, crc);
    }

    pub fn verify_checksum(&self) -> bool {
        self.header_u32(CRC_OFFSET) == self.compute_checksum()
    }

    /// The raw page image, e.g. for writing out at flush.
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.buf.as_slice();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..CRC_OFFSET]);
        hasher.update(&bytes[CRC_OFFSET + 4..]);
        hasher.finalize()
    }

    fn append_inner(&mut self, version: RecordVersion, payload: &[u8]) -> Result<u32> {
        let entry_size = payload.len() + ENTRY_HEADER_SIZE;
        let free_space = self.free_space();
        let freelist_head = self.header_u32(FREELIST_HEAD_OFFSET);
        let reuse = freelist_head > 0;
        let required = if reuse {
            entry_size
        } else {
            entry_size + SLOT_SIZE
        };
        if free_space < required {
            return Err(StorageError::PageFull {
                requested: payload.len(),
                available: self.max_record_size(),
            });
        }

        let slot_count = self.slots_count() as usize;
        let directory_end = SLOT_OFFSET + (slot_count + usize::from(!reuse)) * SLOT_SIZE;
        let mut free_position = self.header_u32(FREE_POSITION_OFFSET) as usize;
        if free_position < directory_end + entry_size {
            self.defragment()?;
            free_position = self.header_u32(FREE_POSITION_OFFSET) as usize;
        }
        free_position -= entry_size;

        let slot = if reuse {
            let slot = (freelist_head - 1) as usize;
            let word = self.slot_word(slot)?;
            if (word & TOMBSTONE_FLAG) == 0 {
                return Err(StorageError::Corrupted(
                    "freelist head points at a live slot",
                ));
            }
            self.write_u32(FREELIST_HEAD_OFFSET, word & POSITION_MASK)?;
            self.write_u32(slot_word_offset(slot), free_position as u32)?;
            let stored = self.slot_version(slot)?;
            let merged = if stored < version {
                version
            } else {
                stored.next()
            };
            self.write_bytes(slot_version_offset(slot), &merged.to_bytes())?;
            self.write_u32(FREE_SPACE_OFFSET, (free_space - entry_size) as u32)?;
            slot
        } else {
            let slot = slot_count;
            self.write_u32(SLOT_COUNT_OFFSET, (slot_count + 1) as u32)?;
            self.write_u32(FREE_SPACE_OFFSET, (free_space - entry_size - SLOT_SIZE) as u32)?;
            self.write_u32(slot_word_offset(slot), free_position as u32)?;
            self.write_bytes(slot_version_offset(slot), &version.to_bytes())?;
            slot
        };

        self.write_i32(free_position, entry_size as i32)?;
        self.write_u32(free_position + 4, slot as u32)?;
        self.write_bytes(free_position + ENTRY_HEADER_SIZE, payload)?;
        self.write_u32(FREE_POSITION_OFFSET, free_position as u32)?;
        let entries = self.records_count();
        self.write_u32(ENTRIES_COUNT_OFFSET, entries + 1)?;

        trace!(
            "page {}: appended {} byte record into slot {}",
            self.page_index,
            payload.len(),
            slot
        );
        Ok(slot as u32)
    }

    fn delete_inner(&mut self, slot: usize) -> Result<bool> {
        if slot >= self.slots_count() as usize {
            return Ok(false);
        }
        let word = self.slot_word(slot)?;
        if (word & TOMBSTONE_FLAG) != 0 {
            return Ok(false);
        }
        let entry_position = (word & POSITION_MASK) as usize;

        // Thread the slot onto the freelist: the header field already holds
        // the head in link encoding (0 empty, else head id + 1).
        let freelist_head = self.header_u32(FREELIST_HEAD_OFFSET);
        self.write_u32(slot_word_offset(slot), freelist_head | TOMBSTONE_FLAG)?;
        self.write_u32(FREELIST_HEAD_OFFSET, (slot + 1) as u32)?;

        let entry_size = self.buf.i32_at(entry_position)?;
        if entry_size <= 0 {
            return Err(StorageError::Corrupted("live slot points at a dead entry"));
        }
        self.write_i32(entry_position, -entry_size)?;

        let free_space = self.free_space();
        self.write_u32(FREE_SPACE_OFFSET, (free_space + entry_size as usize) as u32)?;
        let entries = self.records_count();
        self.write_u32(ENTRIES_COUNT_OFFSET, entries - 1)?;

        trace!("page {}: deleted record in slot {}", self.page_index, slot);
        Ok(true)
    }

    /// Slide live entries toward the page tail so every dead hole ends up
    /// coalesced next to the slot directory. Walks the heap once from the
    /// free position upward; whenever a hole is consumed, everything
    /// already walked moves up by the hole width and the owning slots are
    /// adjusted. `free_space` is untouched since holes were already counted
    /// as free.
    fn defragment(&mut self) -> Result<()> {
        let old_free_position = self.header_u32(FREE_POSITION_OFFSET) as usize;
        let mut cursor = old_free_position;
        let mut new_free_position = old_free_position;
        let mut live_seen: Vec<usize> = Vec::new();

        while cursor < PAGE_SIZE {
            let size = self.buf.i32_at(cursor)?;
            if size > 0 {
                live_seen.push(self.buf.u32_at(cursor + 4)? as usize);
                cursor += size as usize;
            } else if size < 0 {
                let hole = -size as usize;
                self.shift_bytes(
                    new_free_position,
                    new_free_position + hole,
                    cursor - new_free_position,
                )?;
                for &owner in &live_seen {
                    let word = self.slot_word(owner)?;
                    self.write_u32(slot_word_offset(owner), word + hole as u32)?;
                }
                new_free_position += hole;
                cursor += hole;
            } else {
                return Err(StorageError::Corrupted("zero-size entry in heap"));
            }
        }

        self.write_u32(FREE_POSITION_OFFSET, new_free_position as u32)?;
        debug!(
            "page {}: defragmented, free position {} -> {}",
            self.page_index, old_free_position, new_free_position
        );
        Ok(())
    }

    fn begin_atomic_update(&mut self) -> Result<()> {
        if let Some(wal) = self.wal {
            wal.log(WalRecord::StartAtomicUpdate {
                page_index: self.page_index,
                file_name: self.file_name.clone(),
            })?;
        }
        Ok(())
    }

    // Closes the frame and stamps the End record's LSN into the header. The
    // stamp bypasses SetPageData; replay restores it from the End record.
    fn end_atomic_update(&mut self) -> Result<()> {
        if let Some(wal) = self.wal {
            let lsn = wal.log(WalRecord::EndAtomicUpdate {
                page_index: self.page_index,
                file_name: self.file_name.clone(),
            })?;
            stamp_lsn(&mut self.buf, lsn)?;
        }
        Ok(())
    }

    // The End record must go out on every exit path on which Start went
    // out, including failures inside `op`.
    fn with_atomic_update<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.begin_atomic_update()?;
        let outcome = op(self);
        let closed = self.end_atomic_update();
        let value = outcome?;
        closed?;
        Ok(value)
    }

    // Logged writes: with a WAL attached, a SetPageData record carrying the
    // exact bytes goes out before the in-memory mutation.
    fn log_write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if let Some(wal) = self.wal {
            wal.log(WalRecord::SetPageData {
                bytes: Bytes::copy_from_slice(bytes),
                offset: offset as u32,
                page_index: self.page_index,
                file_name: self.file_name.clone(),
            })?;
        }
        Ok(())
    }

    fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.log_write(offset, &value.to_le_bytes())?;
        self.buf.put_u32(offset, value)
    }

    fn write_i32(&mut self, offset: usize, value: i32) -> Result<()> {
        self.log_write(offset, &value.to_le_bytes())?;
        self.buf.put_i32(offset, value)
    }

    fn write_i64(&mut self, offset: usize, value: i64) -> Result<()> {
        self.log_write(offset, &value.to_le_bytes())?;
        self.buf.put_i64(offset, value)
    }

    fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.log_write(offset, bytes)?;
        self.buf.put_bytes(offset, bytes)
    }

    // Heap move, logged as a plain byte write of the destination range.
    fn shift_bytes(&mut self, src: usize, dst: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if self.wal.is_some() {
            let moved = self.buf.bytes_at(src, len)?.to_vec();
            self.log_write(dst, &moved)?;
        }
        self.buf.shift(src, dst, len)
    }

    fn slot_word(&self, slot: usize) -> Result<u32> {
        self.buf.u32_at(slot_word_offset(slot))
    }

    fn slot_version(&self, slot: usize) -> Result<RecordVersion> {
        let bytes: [u8; RecordVersion::SIZE] = self
            .buf
            .bytes_at(slot_version_offset(slot), RecordVersion::SIZE)?
            .try_into()
            .unwrap();
        Ok(RecordVersion::from_bytes(bytes))
    }

    fn live_slot_word(&self, slot: u32) -> Option<u32> {
        if slot >= self.slots_count() {
            return None;
        }
        let word = self.slot_word(slot as usize).ok()?;
        if (word & TOMBSTONE_FLAG) != 0 {
            None
        } else {
            Some(word)
        }
    }

    // Header offsets are compile-time constants well inside the page, so
    // these accesses cannot go out of bounds.
    fn header_u32(&self, offset: usize) -> u32 {
        self.buf.u32_at(offset).expect("header offset in bounds")
    }

    fn header_u64(&self, offset: usize) -> u64 {
        self.buf.u64_at(offset).expect("header offset in bounds")
    }

    fn header_i64(&self, offset: usize) -> i64 {
        self.buf.i64_at(offset).expect("header offset in bounds")
    }

    fn header_put_u32(&mut self, offset: usize, value: u32) {
        self.buf
            .put_u32(offset, value)
            .expect("header offset in bounds")
    }

    fn header_put_u64(&mut self, offset: usize, value: u64) {
        self.buf
            .put_u64(offset, value)
            .expect("header offset in bounds")
    }
}

const fn slot_word_offset(slot: usize) -> usize {
    SLOT_OFFSET + slot * SLOT_SIZE
}

const fn slot_version_offset(slot: usize) -> usize {
    slot_word_offset(slot) + 4
}

fn initialize(buf: &mut PageBuffer<'_>) -> Result<()> {
    buf.put_u64(MAGIC_OFFSET, 0)?;
    buf.put_u32(CRC_OFFSET, 0)?;
    stamp_lsn(buf, Lsn::ZERO)?;
    buf.put_i64(NEXT_PAGE_OFFSET, NO_PAGE)?;
    buf.put_i64(PREV_PAGE_OFFSET, NO_PAGE)?;
    buf.put_u32(FREELIST_HEAD_OFFSET, 0)?;
    buf.put_u32(FREE_POSITION_OFFSET, PAGE_SIZE as u32)?;
    buf.put_u32(FREE_SPACE_OFFSET, (PAGE_SIZE - SLOT_OFFSET) as u32)?;
    buf.put_u32(ENTRIES_COUNT_OFFSET, 0)?;
    buf.put_u32(SLOT_COUNT_OFFSET, 0)
}

fn stamp_lsn(buf: &mut PageBuffer<'_>, lsn: Lsn) -> Result<()> {
    buf.put_u64(WAL_SEGMENT_OFFSET, lsn.segment)?;
    buf.put_u32(WAL_POSITION_OFFSET, lsn.position)
}

/// Redo the WAL records targeting one page onto its buffer.
///
/// `SetPageData` is reapplied verbatim, `AddNewPage` re-initializes the
/// header, and each `EndAtomicUpdate` stamps its own LSN (the stamp is not
/// logged as page data). Records addressed to other pages are skipped.
pub fn replay(
    records: &[(Lsn, WalRecord)],
    data: &mut [u8],
    page_index: u64,
    file_name: &str,
) -> Result<()> {
    let mut buf = PageBuffer::new(data)?;
    for (lsn, record) in records {
        if record.page_index() != page_index || record.file_name() != file_name {
            continue;
        }
        match record {
            WalRecord::SetPageData { bytes, offset, .. } => {
                buf.put_bytes(*offset as usize, bytes)?;
            }
            WalRecord::AddNewPage { .. } => initialize(&mut buf)?,
            WalRecord::EndAtomicUpdate { .. } => stamp_lsn(&mut buf, *lsn)?,
            WalRecord::StartAtomicUpdate { .. } => {}
        }
    }
    Ok(())
}
