//! Text data ring: variable-sized blocks addressed by logical position.
//!
//! Every block starts with the ID of the descriptor owning it. Before the tail
//! moves over a block, the owning descriptor is made reusable; a reader that
//! later finds a different ID (or a recycled descriptor) knows its copy is
//! stale.
//!
//! A block that would cross the physical end of the array wraps: its ID is
//! written at the original position, marking the unused remainder as part
//! of the block, and the data is stored at offset 0 of the next wrap.
//!
//! ```text
//!  lpos:  ...| wrap N                         | wrap N+1              |...
//!  block:       [id|...text...][id|  skipped  ][id|...text...]
//!                                ^begin                       ^next
//! ```

use crate::desc_ring::{AtomicBlkLpos, BlkLpos};
use crate::layout::{BLK_HEADER, EMPTY_LINE_LPOS, ID_ALIGN, blk0_lpos, to_blk_size};
use crate::ringbuffer::PrintkRingbuffer;
use crate::state::DescState;
use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering, fence};
use tracing::warn;

pub(crate) struct DataRing {
    size_bits: u32,
    data: Box<[UnsafeCell<u64>]>,
    pub(crate) head_lpos: AtomicU64,
    pub(crate) tail_lpos: AtomicU64,
}

impl DataRing {
    pub(crate) fn new(size_bits: u32, text: Box<[u64]>) -> Self {
        Self {
            size_bits,
            data: text.into_vec().into_iter().map(UnsafeCell::new).collect(),
            head_lpos: AtomicU64::new(blk0_lpos(size_bits)),
            tail_lpos: AtomicU64::new(blk0_lpos(size_bits)),
        }
    }

    #[inline(always)]
    pub(crate) fn size(&self) -> u64 {
        1u64 << self.size_bits
    }

    #[inline(always)]
    fn index(&self, lpos: u64) -> usize {
        (lpos & (self.size() - 1)) as usize
    }

    /// How many times the ring has been wrapped to reach `lpos`.
    #[inline(always)]
    fn wraps(&self, lpos: u64) -> u64 {
        lpos >> self.size_bits
    }

    #[inline(always)]
    fn this_wrap_start(&self, lpos: u64) -> u64 {
        lpos & !(self.size() - 1)
    }

    /// Whether a record of `size` text bytes could ever be stored. The largest
    /// block must still leave room for the ID of the next one.
    pub(crate) fn check_size(&self, size: u64) -> bool {
        if size == 0 {
            return true;
        }
        to_blk_size(size) <= self.size() - BLK_HEADER
    }

    /// Logical position following a block of `blk_size` bytes placed at
    /// `begin`. A block that does not fit in the current wrap is moved to the
    /// start of the next one; the skipped bytes count as part of it.
    pub(crate) fn next_lpos(&self, begin: u64, blk_size: u64) -> u64 {
        let next = begin.wrapping_add(blk_size);
        if self.wraps(begin) == self.wraps(next.wrapping_sub(1)) {
            return next;
        }
        self.this_wrap_start(next.wrapping_sub(1)).wrapping_add(blk_size)
    }

    #[inline(always)]
    fn is_wrapping(&self, blk: BlkLpos) -> bool {
        self.wraps(blk.begin) != self.wraps(blk.next.wrapping_sub(1))
    }

    #[inline(always)]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.data.as_ptr()) as *mut u8
    }

    /// The ID word at the start of the block at `lpos`.
    #[inline(always)]
    pub(crate) fn block_id(&self, lpos: u64) -> &AtomicU64 {
        debug_assert_eq!(lpos % ID_ALIGN, 0);
        let word = &self.data[self.index(lpos) / ID_ALIGN as usize];
        // SAFETY: the word is 8-aligned, lives as long as `self`, and is only
        // ever accessed atomically while it serves as a block ID.
        unsafe { AtomicU64::from_ptr(word.get()) }
    }

    /// Pointer to the text area of the block at `lpos`.
    #[inline(always)]
    pub(crate) fn block_data(&self, lpos: u64) -> *mut u8 {
        // SAFETY: index + header stays inside the array because every block
        // (including its header) fits before the physical end.
        unsafe { self.base().add(self.index(lpos) + BLK_HEADER as usize) }
    }

    /// Text area and its size (padding included) of a block.
    ///
    /// Returns `None` for records whose data was lost and for descriptors
    /// carrying a corrupted block position.
    pub(crate) fn get_data(&self, blk: BlkLpos) -> Option<(*const u8, usize)> {
        if blk.is_dataless() {
            if blk.begin == EMPTY_LINE_LPOS {
                return Some((NonNull::<u8>::dangling().as_ptr(), 0));
            }
            return None;
        }

        let span = blk.next.wrapping_sub(blk.begin);
        let data_lpos = if !self.is_wrapping(blk) && span <= self.size() {
            blk.begin
        } else if self.wraps(blk.begin.wrapping_add(self.size()))
            == self.wraps(blk.next.wrapping_sub(1))
        {
            self.this_wrap_start(blk.next.wrapping_sub(1))
        } else {
            warn!(begin = blk.begin, next = blk.next, "illegal data block position");
            return None;
        };

        if blk.begin % ID_ALIGN != 0 || blk.next % ID_ALIGN != 0 {
            warn!(begin = blk.begin, next = blk.next, "misaligned data block");
            return None;
        }
        let len = blk.next.wrapping_sub(data_lpos);
        if len < BLK_HEADER {
            warn!(begin = blk.begin, next = blk.next, "data block without ID");
            return None;
        }
        Some((self.block_data(data_lpos), (len - BLK_HEADER) as usize))
    }

    /// Bytes of the ring consumed by a block, skipped wrap space included.
    pub(crate) fn space_used(&self, blk: BlkLpos) -> u64 {
        if blk.is_dataless() {
            return 0;
        }
        blk.next.wrapping_sub(blk.begin)
    }
}

impl PrintkRingbuffer {
    /// Makes the descriptors owning the blocks in `[lpos_begin, lpos_end)`
    /// reusable. Returns the lpos where the walk stopped, which is
    /// `lpos_end` or beyond (the last block may extend past it).
    fn data_make_reusable(&self, mut lpos_begin: u64, lpos_end: u64) -> Option<u64> {
        let data_ring = &self.text_data_ring;
        let desc_ring = &self.desc_ring;

        while lpos_end.wrapping_sub(lpos_begin).wrapping_sub(1) < data_ring.size() {
            let id = data_ring.block_id(lpos_begin).load(Ordering::Relaxed);
            let (state, desc) = desc_ring.desc_read(id);

            match state {
                // In use, or the block was already recycled under us.
                DescState::Miss | DescState::Reserved | DescState::Committed => return None,
                DescState::Finalized => {
                    if desc.blk.begin != lpos_begin {
                        return None;
                    }
                    desc_ring.desc_make_reusable(id);
                }
                DescState::Reusable => {
                    if desc.blk.begin != lpos_begin {
                        return None;
                    }
                }
            }
            lpos_begin = desc.blk.next;
        }
        Some(lpos_begin)
    }

    /// Advances the data tail so that it is at least `lpos`, recycling every
    /// descriptor whose block is passed. Fails if a block on the way belongs
    /// to a record that is still being written or can still be reopened.
    pub(crate) fn data_push_tail(&self, lpos: u64) -> bool {
        let data_ring = &self.text_data_ring;

        if BlkLpos::lpos_dataless(lpos) {
            return true;
        }

        let mut tail_lpos = data_ring.tail_lpos.load(Ordering::Acquire);
        loop {
            // Already pushed far enough?
            if lpos.wrapping_sub(tail_lpos).wrapping_sub(1) >= data_ring.size() {
                return true;
            }

            let Some(next_lpos) = self.data_make_reusable(tail_lpos, lpos) else {
                // Either a record is in the way, or another writer recycled the
                // blocks and moved the tail already.
                fence(Ordering::Acquire);
                let tail_lpos_new = data_ring.tail_lpos.load(Ordering::Relaxed);
                if tail_lpos_new == tail_lpos {
                    return false;
                }
                tail_lpos = tail_lpos_new;
                continue;
            };

            match data_ring.tail_lpos.compare_exchange(
                tail_lpos,
                next_lpos,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => tail_lpos = current,
            }
        }
    }

    /// Allocates a block for `size` text bytes owned by descriptor `id` and
    /// records its position in `blk_lpos`. On failure the descriptor is
    /// marked as having lost its data.
    pub(crate) fn data_alloc(&self, size: u64, blk_lpos: &AtomicBlkLpos, id: u64) -> Option<*mut u8> {
        let data_ring = &self.text_data_ring;

        if size == 0 {
            blk_lpos.store(BlkLpos::EMPTY_LINE);
            return Some(NonNull::<u8>::dangling().as_ptr());
        }

        let blk_size = to_blk_size(size);
        let mut begin_lpos = data_ring.head_lpos.load(Ordering::Relaxed);
        let next_lpos = loop {
            let next_lpos = data_ring.next_lpos(begin_lpos, blk_size);

            if !self.data_push_tail(next_lpos.wrapping_sub(data_ring.size())) {
                blk_lpos.store(BlkLpos::FAILED);
                return None;
            }

            match data_ring.head_lpos.compare_exchange(
                begin_lpos,
                next_lpos,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break next_lpos,
                Err(current) => begin_lpos = current,
            }
        };

        let blk = BlkLpos {
            begin: begin_lpos,
            next: next_lpos,
        };
        data_ring.block_id(begin_lpos).store(id, Ordering::Relaxed);

        let mut data_lpos = begin_lpos;
        if data_ring.is_wrapping(blk) {
            data_lpos = data_ring.this_wrap_start(next_lpos.wrapping_sub(1));
            data_ring.block_id(data_lpos).store(id, Ordering::Relaxed);
        }

        blk_lpos.store(blk);
        Some(data_ring.block_data(data_lpos))
    }

    /// Grows the newest block (owned by the reopened descriptor `id`) so it
    /// holds `size` text bytes. Blocks never shrink. If growing makes the
    /// block wrap, the existing text is moved to the start of the next wrap.
    pub(crate) fn data_realloc(&self, size: u64, blk_lpos: &AtomicBlkLpos, id: u64) -> Option<*mut u8> {
        let data_ring = &self.text_data_ring;
        let cur = blk_lpos.load();

        let head_lpos = data_ring.head_lpos.load(Ordering::Relaxed);
        if head_lpos != cur.next {
            // Not the newest block.
            return None;
        }

        let wrapped = data_ring.is_wrapping(cur);
        let blk_size = to_blk_size(size);
        let next_lpos = data_ring.next_lpos(cur.begin, blk_size);

        // Already large enough: the text stays where it is.
        if head_lpos.wrapping_sub(next_lpos) < data_ring.size() {
            let data_lpos = if wrapped {
                data_ring.this_wrap_start(cur.next.wrapping_sub(1))
            } else {
                cur.begin
            };
            return Some(data_ring.block_data(data_lpos));
        }

        if !self.data_push_tail(next_lpos.wrapping_sub(data_ring.size())) {
            return None;
        }

        if data_ring
            .head_lpos
            .compare_exchange(head_lpos, next_lpos, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        let grown = BlkLpos {
            begin: cur.begin,
            next: next_lpos,
        };
        let mut data_lpos = cur.begin;
        if data_ring.is_wrapping(grown) {
            data_lpos = data_ring.this_wrap_start(next_lpos.wrapping_sub(1));
            data_ring.block_id(data_lpos).store(id, Ordering::Relaxed);
            if !wrapped {
                let old_len = (cur.next.wrapping_sub(cur.begin) - BLK_HEADER) as usize;
                // SAFETY: both areas lie inside the array; the tail push above
                // guarantees the new area does not hold live data. `copy`
                // tolerates overlap.
                unsafe {
                    ptr::copy(
                        data_ring.block_data(cur.begin),
                        data_ring.block_data(data_lpos),
                        old_len,
                    );
                }
            }
        }

        blk_lpos.store(grown);
        Some(data_ring.block_data(data_lpos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(size_bits: u32) -> DataRing {
        DataRing::new(size_bits, vec![0u64; (1 << size_bits) / 8].into_boxed_slice())
    }

    #[test]
    fn size_check_leaves_room_for_next_id() {
        let r = ring(6); // 64 bytes
        assert!(r.check_size(0));
        assert!(r.check_size(48)); // 56 byte block + 8 byte ID
        assert!(!r.check_size(49));
    }

    #[test]
    fn next_lpos_within_wrap() {
        let r = ring(6);
        assert_eq!(r.next_lpos(0, 16), 16);
        // Ending exactly at the physical end does not wrap.
        assert_eq!(r.next_lpos(48, 16), 64);
    }

    #[test]
    fn next_lpos_wraps_to_next_start() {
        let r = ring(6);
        // 24 byte block at 48 does not fit in [48, 64): stored at [64, 88).
        assert_eq!(r.next_lpos(48, 24), 88);
        assert_eq!(r.space_used(BlkLpos { begin: 48, next: 88 }), 40);
    }

    #[test]
    fn next_lpos_across_u64_overflow() {
        let r = ring(6);
        let begin = blk0_lpos(6) + 48;
        let next = r.next_lpos(begin, 24);
        assert_eq!(next, 24);
        let (ptr, len) = r.get_data(BlkLpos { begin, next }).unwrap();
        assert_eq!(ptr as usize, r.block_data(0) as usize);
        assert_eq!(len, 16);
    }

    #[test]
    fn get_data_regular_and_dataless() {
        let r = ring(6);
        let (ptr, len) = r.get_data(BlkLpos { begin: 16, next: 40 }).unwrap();
        assert_eq!(ptr as usize, r.block_data(16) as usize);
        assert_eq!(len, 16);

        assert_eq!(r.get_data(BlkLpos::EMPTY_LINE).map(|(_, l)| l), Some(0));
        assert!(r.get_data(BlkLpos::FAILED).is_none());
        assert_eq!(r.space_used(BlkLpos::FAILED), 0);
    }

    #[test]
    fn get_data_rejects_corrupt_positions() {
        let r = ring(6);
        assert!(r.get_data(BlkLpos { begin: 16, next: 20 }).is_none());
        assert!(r.get_data(BlkLpos { begin: 0, next: 256 }).is_none());
    }
}
