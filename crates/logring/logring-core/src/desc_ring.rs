//! Descriptor ring: fixed slots whose lifecycle is driven by one atomic state
//! word each.
//!
//! Descriptor IDs grow monotonically and map to slots with `id & (count - 1)`.
//! Sequence numbers map to the same slots (`seq & (count - 1)`), which is how
//! readers find a record without walking the ring.

use crate::layout::{EMPTY_LINE_LPOS, FAILED_LPOS};
use crate::ringbuffer::PrintkRingbuffer;
use crate::state::{DescState, desc_id, desc_sv, get_desc_state};
use logring_record::{CallerId, PrintkInfo};
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering, fence};
use tracing::warn;

/// Logical span `[begin, next)` of a record's data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct BlkLpos {
    pub(crate) begin: u64,
    pub(crate) next: u64,
}

impl BlkLpos {
    pub(crate) const FAILED: BlkLpos = BlkLpos {
        begin: FAILED_LPOS,
        next: FAILED_LPOS,
    };

    pub(crate) const EMPTY_LINE: BlkLpos = BlkLpos {
        begin: EMPTY_LINE_LPOS,
        next: EMPTY_LINE_LPOS,
    };

    #[inline(always)]
    pub(crate) fn lpos_dataless(lpos: u64) -> bool {
        lpos & 1 != 0
    }

    #[inline(always)]
    pub(crate) fn is_dataless(&self) -> bool {
        Self::lpos_dataless(self.begin) && self.begin == self.next
    }
}

/// Block position as stored in a descriptor. Only the owning writer stores
/// it; readers copy it and validate the copy against the state word.
#[derive(Debug, Default)]
pub(crate) struct AtomicBlkLpos {
    begin: AtomicU64,
    next: AtomicU64,
}

impl AtomicBlkLpos {
    #[inline(always)]
    pub(crate) fn load(&self) -> BlkLpos {
        BlkLpos {
            begin: self.begin.load(Ordering::Relaxed),
            next: self.next.load(Ordering::Relaxed),
        }
    }

    #[inline(always)]
    pub(crate) fn store(&self, blk: BlkLpos) {
        self.begin.store(blk.begin, Ordering::Relaxed);
        self.next.store(blk.next, Ordering::Relaxed);
    }
}

/// A descriptor: the state word plus the position of the record's text.
#[derive(Debug, Default)]
pub struct Desc {
    pub(crate) state_var: AtomicU64,
    pub(crate) text_blk_lpos: AtomicBlkLpos,
}

/// Local copy of a descriptor, taken by [`DescRing::desc_read`].
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DescSnapshot {
    pub(crate) state_val: u64,
    pub(crate) blk: BlkLpos,
    pub(crate) seq: u64,
    pub(crate) caller_id: CallerId,
}

pub(crate) struct DescRing {
    count_bits: u32,
    descs: Box<[Desc]>,
    infos: Box<[UnsafeCell<PrintkInfo>]>,
    pub(crate) head_id: AtomicU64,
    pub(crate) tail_id: AtomicU64,
    pub(crate) last_finalized_seq: AtomicU64,
}

impl DescRing {
    /// Takes over the arrays and installs the bootstrap state:
    ///
    /// - The last slot is the initial head and tail. It is reusable and
    ///   dataless, so readers see an empty ring rather than garbage and the
    ///   first reservation (head + 1) lands in slot 0.
    /// - Slot 0 starts at `seq = -count`, so the first reservation assigns 0.
    /// - The bootstrap tail reports `seq = 0` as the first sequence number
    ///   until the tail is pushed for the first time.
    pub(crate) fn new(count_bits: u32, descs: Box<[Desc]>, infos: Box<[PrintkInfo]>) -> Self {
        let count = 1u64 << count_bits;
        let last = (count - 1) as usize;
        let desc0_id = desc0_id(count_bits);

        for desc in descs.iter() {
            desc.state_var.store(0, Ordering::Relaxed);
            desc.text_blk_lpos.store(BlkLpos::default());
        }
        descs[last]
            .state_var
            .store(desc_sv(desc0_id, DescState::Reusable), Ordering::Relaxed);
        descs[last].text_blk_lpos.store(BlkLpos::FAILED);

        let mut infos = infos;
        infos.fill(PrintkInfo::default());
        infos[0].seq = count.wrapping_neg();
        infos[last].seq = 0;

        Self {
            count_bits,
            descs,
            infos: infos.into_vec().into_iter().map(UnsafeCell::new).collect(),
            head_id: AtomicU64::new(desc0_id),
            tail_id: AtomicU64::new(desc0_id),
            last_finalized_seq: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub(crate) fn count(&self) -> u64 {
        1u64 << self.count_bits
    }

    #[inline(always)]
    pub(crate) fn index(&self, id_or_seq: u64) -> usize {
        (id_or_seq & (self.count() - 1)) as usize
    }

    /// The ID that used the same slot one wrap earlier.
    #[inline(always)]
    pub(crate) fn id_prev_wrap(&self, id: u64) -> u64 {
        desc_id(id.wrapping_sub(self.count()))
    }

    #[inline(always)]
    pub(crate) fn desc0_id(&self) -> u64 {
        desc0_id(self.count_bits)
    }

    #[inline(always)]
    pub(crate) fn desc(&self, id_or_seq: u64) -> &Desc {
        &self.descs[self.index(id_or_seq)]
    }

    #[inline(always)]
    pub(crate) fn info_ptr(&self, id_or_seq: u64) -> *mut PrintkInfo {
        self.infos[self.index(id_or_seq)].get()
    }

    /// Copies a complete info record. The copy may be torn; callers validate
    /// the descriptor state afterwards.
    pub(crate) fn read_info(&self, id: u64) -> PrintkInfo {
        // SAFETY: the pointer is valid and aligned; concurrent writers can only
        // produce a torn value, which the caller discards after re-validation.
        unsafe { ptr::read_volatile(self.info_ptr(id)) }
    }

    /// Reads the descriptor `id` into a local copy, seqlock style.
    ///
    /// The state is loaded before and after copying; the returned state is the
    /// second one, so the copy is only trustworthy if that state still names
    /// `id` and is past `Reserved`. Nothing is copied for `Miss` or `Reserved`,
    /// but `state_val` is always filled in.
    pub(crate) fn desc_read(&self, id: u64) -> (DescState, DescSnapshot) {
        let desc = self.desc(id);
        let mut out = DescSnapshot::default();

        let mut state_val = desc.state_var.load(Ordering::Acquire);
        let mut d_state = get_desc_state(id, state_val);
        if d_state != DescState::Miss && d_state != DescState::Reserved {
            out.blk = desc.text_blk_lpos.load();
            let info = self.info_ptr(id);
            // SAFETY: see `read_info`.
            unsafe {
                out.seq = ptr::read_volatile(ptr::addr_of!((*info).seq));
                out.caller_id = ptr::read_volatile(ptr::addr_of!((*info).caller_id));
            }

            fence(Ordering::Acquire);
            state_val = desc.state_var.load(Ordering::Relaxed);
            d_state = get_desc_state(id, state_val);
        }

        out.state_val = state_val;
        (d_state, out)
    }

    pub(crate) fn desc_make_reusable(&self, id: u64) {
        let _ = self.desc(id).state_var.compare_exchange(
            desc_sv(id, DescState::Finalized),
            desc_sv(id, DescState::Reusable),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}

/// Initial `head_id`/`tail_id`: the last slot, overflowing on the second wrap.
#[inline]
pub(crate) fn desc0_id(count_bits: u32) -> u64 {
    desc_id(((1u64 << count_bits) + 1).wrapping_neg())
}

impl PrintkRingbuffer {
    /// Moves the descriptor tail off `tail_id`, recycling it and its data.
    ///
    /// Returns `true` if the tail is no longer `tail_id`, whoever moved it.
    pub(crate) fn desc_push_tail(&self, tail_id: u64) -> bool {
        let desc_ring = &self.desc_ring;
        let (d_state, desc) = desc_ring.desc_read(tail_id);

        match d_state {
            DescState::Miss => {
                // One wrap behind means the slot is being reserved by another
                // writer right now; anything else means it was recycled and the
                // tail has moved on.
                return desc_id(desc.state_val) != desc_ring.id_prev_wrap(tail_id);
            }
            DescState::Reserved | DescState::Committed => return false,
            DescState::Finalized => desc_ring.desc_make_reusable(tail_id),
            DescState::Reusable => {}
        }

        // Data must be invalidated while the descriptor still identifies it.
        if !self.data_push_tail(desc.blk.next) {
            return false;
        }

        let next_id = desc_id(tail_id.wrapping_add(1));
        let (mut next_state, _) = desc_ring.desc_read(next_id);
        if next_state == DescState::Committed {
            // The head is about to move past it, so it can no longer be
            // reopened anyway.
            self.desc_make_final(next_id);
            next_state = desc_ring.desc_read(next_id).0;
        }

        if next_state == DescState::Finalized || next_state == DescState::Reusable {
            let _ = desc_ring.tail_id.compare_exchange(
                tail_id,
                next_id,
                Ordering::SeqCst,
                Ordering::Relaxed,
            );
        } else {
            // The next descriptor is not a valid tail. That only matters if
            // nobody else has moved the tail in the meantime.
            fence(Ordering::Acquire);
            if desc_ring.tail_id.load(Ordering::Relaxed) == tail_id {
                return false;
            }
        }
        true
    }

    /// Claims the next descriptor ID, pushing the tail first if the ring is
    /// full. The descriptor is returned in the `Reserved` state.
    pub(crate) fn desc_reserve(&self) -> Option<u64> {
        let desc_ring = &self.desc_ring;

        let mut head_id = desc_ring.head_id.load(Ordering::Relaxed);
        let (id, id_prev_wrap) = loop {
            let id = desc_id(head_id.wrapping_add(1));
            let id_prev_wrap = desc_ring.id_prev_wrap(id);

            if id_prev_wrap == desc_ring.tail_id.load(Ordering::Acquire)
                && !self.desc_push_tail(id_prev_wrap)
            {
                return None;
            }

            match desc_ring.head_id.compare_exchange(
                head_id,
                id,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break (id, id_prev_wrap),
                Err(current) => head_id = current,
            }
        };

        let desc = desc_ring.desc(id);
        let prev_state_val = desc.state_var.load(Ordering::Relaxed);

        // A never used slot holds 0, anything else must be the reusable
        // descriptor of the previous wrap.
        if prev_state_val != 0
            && get_desc_state(id_prev_wrap, prev_state_val) != DescState::Reusable
        {
            warn!(id, prev_state_val, "descriptor slot is not reusable, skipping it");
            return None;
        }

        if desc
            .state_var
            .compare_exchange(
                prev_state_val,
                desc_sv(id, DescState::Reserved),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            warn!(id, "descriptor slot changed during reservation, skipping it");
            return None;
        }

        // Order the state change before the writer's stores to info and lpos.
        fence(Ordering::Release);
        Some(id)
    }

    /// Moves the head descriptor back from `Committed` to `Reserved` if it was
    /// written by `caller_id`.
    pub(crate) fn desc_reopen_last(&self, caller_id: CallerId) -> Option<u64> {
        let desc_ring = &self.desc_ring;

        let id = desc_ring.head_id.load(Ordering::Relaxed);
        let (d_state, desc) = desc_ring.desc_read(id);
        if d_state != DescState::Committed || desc.caller_id != caller_id {
            return None;
        }

        desc_ring
            .desc(id)
            .state_var
            .compare_exchange(
                desc_sv(id, DescState::Committed),
                desc_sv(id, DescState::Reserved),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()?;
        fence(Ordering::Release);
        Some(id)
    }

    /// `Committed -> Finalized`. A no-op in any other state.
    pub(crate) fn desc_make_final(&self, id: u64) {
        let finalized = self
            .desc_ring
            .desc(id)
            .state_var
            .compare_exchange(
                desc_sv(id, DescState::Committed),
                desc_sv(id, DescState::Finalized),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok();
        if finalized {
            self.desc_update_last_finalized();
        }
    }
}
