//! Multi-producer, multi-consumer lock-free ring buffer for log records.
//!
//! A record is a [`PrintkInfo`] plus a variable-length text. Records live in
//! two rings:
//! - the **descriptor ring** (`desc_ring`), one slot per record, holding the
//!   metadata and a logical position into the data ring
//! - the **text data ring** (`text_data_ring`), holding the text blocks
//!
//! # Design
//! - **Writers** reserve a descriptor, then a text block, fill both in and
//!   commit. Any number of writers may run concurrently; when the ring is
//!   full the oldest finalized records are overwritten.
//! - **Readers** never block writers. They copy a record and then check the
//!   descriptor state again; a record that changed under them is reported as
//!   not available.
//!
//! Every record gets the next sequence number, including records whose text
//! could not be stored, so readers can tell exactly how many were lost.
//!
//! # Thread Safety
//! - `PrintkRingbuffer` is `Send + Sync` and is shared by reference.
//! - [`ReservedEntry`] is neither: the reserve/commit window belongs to the
//!   reserving thread.

use crate::data_ring::DataRing;
use crate::desc_ring::DescRing;
use crate::entry::ReservedEntry;
use crate::error::{LayoutError, ReopenError, ReserveError};
use crate::layout::{RingConfig, RingStorage};
use crate::state::{DescState, desc_id, desc_sv};
use logring_record::{CallerId, PrintkInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

pub struct PrintkRingbuffer {
    pub(crate) desc_ring: DescRing,
    pub(crate) text_data_ring: DataRing,
    /// Number of failed descriptor reservations.
    fail: AtomicU64,
}

// SAFETY: all shared mutable state is either atomic or only written by the
// writer holding the descriptor in the reserved state. Readers copy racy data
// and validate it against the descriptor state before using it.
unsafe impl Sync for PrintkRingbuffer {}

impl PrintkRingbuffer {
    /// Takes ownership of caller-provided arrays and bootstraps the ring.
    ///
    /// # Errors
    /// Fails if the array sizes are not powers of two, if `infos` does not
    /// match `descs`, or if the text ring is too small.
    pub fn init(storage: RingStorage) -> Result<Self, LayoutError> {
        let (count_bits, text_bits) = storage.validate()?;
        let RingStorage { text, descs, infos } = storage;

        debug!(
            descs = 1u64 << count_bits,
            text_bytes = 1u64 << text_bits,
            "ring buffer initialized"
        );
        Ok(Self {
            desc_ring: DescRing::new(count_bits, descs, infos),
            text_data_ring: DataRing::new(text_bits, text),
            fail: AtomicU64::new(0),
        })
    }

    /// Allocates storage for `cfg` and bootstraps the ring.
    pub fn new(cfg: RingConfig) -> Result<Self, LayoutError> {
        Self::init(RingStorage::new(cfg))
    }

    #[inline]
    pub fn desc_count(&self) -> usize {
        self.desc_ring.count() as usize
    }

    #[inline]
    pub fn text_size(&self) -> usize {
        self.text_data_ring.size() as usize
    }

    /// Failed descriptor reservations so far. Text allocation failures are
    /// not counted here; they show up as records without data.
    #[inline]
    pub fn fail_count(&self) -> u64 {
        self.fail.load(Ordering::Relaxed)
    }

    /// Reserves a new record with room for `text_size` bytes of text.
    ///
    /// The previous record is finalized, so it can no longer be extended by
    /// [`reserve_in_last`](Self::reserve_in_last).
    ///
    /// # Errors
    /// - [`ReserveError::TooLarge`] if the text can never fit.
    /// - [`ReserveError::NoDescriptor`] if the oldest descriptor is still in
    ///   use and cannot be recycled.
    /// - [`ReserveError::NoTextSpace`] if the descriptor was reserved but no
    ///   text block could be allocated. The sequence number is then used up
    ///   by a committed record without data.
    pub fn reserve(&self, text_size: usize) -> Result<ReservedEntry<'_>, ReserveError> {
        if text_size > u16::MAX as usize || !self.text_data_ring.check_size(text_size as u64) {
            return Err(ReserveError::TooLarge { size: text_size });
        }

        let Some(id) = self.desc_reserve() else {
            let fails = self.fail.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(fails, "descriptor reservation failed");
            return Err(ReserveError::NoDescriptor);
        };

        let desc_ring = &self.desc_ring;
        let info = desc_ring.info_ptr(id);

        // Only seq survives from the previous use of the slot.
        // SAFETY: the descriptor is reserved, so this writer has exclusive
        // write access to its info.
        let seq = unsafe {
            let prev = (*info).seq;
            let seq = if prev == 0 && desc_ring.index(id) != 0 {
                desc_ring.index(id) as u64
            } else {
                prev.wrapping_add(desc_ring.count())
            };
            let mut fresh = PrintkInfo::default();
            fresh.seq = seq;
            info.write(fresh);
            seq
        };

        if seq > 0 {
            self.desc_make_final(desc_id(id.wrapping_sub(1)));
        }

        let blk_lpos = &desc_ring.desc(id).text_blk_lpos;
        let Some(text) = self.data_alloc(text_size as u64, blk_lpos, id) else {
            self.commit(id);
            debug!(seq, size = text_size, "no text space, committed record without data");
            return Err(ReserveError::NoTextSpace { seq });
        };

        let text_space = self.text_data_ring.space_used(blk_lpos.load());
        Ok(ReservedEntry::new(self, id, seq, info, text, text_size, text_space))
    }

    /// Reopens the newest record to append `text_size` more bytes.
    ///
    /// Only succeeds if the newest record was committed (not finalized) by
    /// `caller_id`. The existing text is kept; the entry's text length still
    /// holds its length, so writes continue where the old text ended.
    ///
    /// # Errors
    /// [`ReopenError::NotReopenable`] if the newest record is not open for
    /// this caller, otherwise the record is committed again unchanged and the
    /// cause is returned.
    pub fn reserve_in_last(
        &self,
        text_size: usize,
        caller_id: CallerId,
        max_size: usize,
    ) -> Result<ReservedEntry<'_>, ReopenError> {
        let id = self
            .desc_reopen_last(caller_id)
            .ok_or(ReopenError::NotReopenable)?;

        match self.extend_reopened(id, text_size, caller_id, max_size) {
            Ok(entry) => Ok(entry),
            Err(err) => {
                self.commit(id);
                Err(err)
            }
        }
    }

    fn extend_reopened(
        &self,
        id: u64,
        text_size: usize,
        caller_id: CallerId,
        max_size: usize,
    ) -> Result<ReservedEntry<'_>, ReopenError> {
        let desc_ring = &self.desc_ring;
        let data_ring = &self.text_data_ring;
        let info = desc_ring.info_ptr(id);
        let blk_lpos = &desc_ring.desc(id).text_blk_lpos;
        let cur = blk_lpos.load();

        // SAFETY: the descriptor is reserved again, this writer owns the info.
        let info_ref = unsafe { &mut *info };

        // The reopen check ran before exclusive access was gained.
        if info_ref.caller_id != caller_id {
            return Err(ReopenError::NotReopenable);
        }

        let (size, text) = if cur.is_dataless() {
            if info_ref.text_len != 0 {
                warn!(id, text_len = info_ref.text_len, "text length set on record without data");
                info_ref.text_len = 0;
            }
            check_reopen_size(data_ring, text_size, max_size)?;
            let text = self.data_alloc(text_size as u64, blk_lpos, id);
            (text_size, text)
        } else {
            let Some((_, data_size)) = data_ring.get_data(cur) else {
                return Err(ReopenError::NoTextSpace);
            };
            if info_ref.text_len as usize > data_size {
                warn!(id, text_len = info_ref.text_len, data_size, "text length exceeds data block");
                info_ref.text_len = data_size as u16;
            }
            let size = text_size + info_ref.text_len as usize;
            check_reopen_size(data_ring, size, max_size)?;
            (size, self.data_realloc(size as u64, blk_lpos, id))
        };

        let text = text.ok_or(ReopenError::NoTextSpace)?;
        let text_space = data_ring.space_used(blk_lpos.load());
        let seq = info_ref.seq;
        Ok(ReservedEntry::new(self, id, seq, info, text, size, text_space))
    }

    /// `Reserved -> state`. Anything else means the entry was already
    /// committed (or its slot corrupted) and is left alone.
    fn commit_state(&self, id: u64, state: DescState) {
        if self
            .desc_ring
            .desc(id)
            .state_var
            .compare_exchange(
                desc_sv(id, DescState::Reserved),
                desc_sv(id, state),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
        {
            warn!(id, ?state, "commit of a descriptor that is not reserved");
        }
    }

    /// Commits a reserved record, leaving it reopenable as long as it is the
    /// newest one.
    pub(crate) fn commit(&self, id: u64) {
        self.commit_state(id, DescState::Committed);

        // A newer reservation already happened: nobody can extend this one.
        // Either this load sees the new head or that writer's finalize sees
        // the committed state.
        if self.desc_ring.head_id.load(Ordering::SeqCst) != id {
            self.desc_make_final(id);
        }
    }

    /// Commits a reserved record and makes it readable right away.
    pub(crate) fn final_commit(&self, id: u64) {
        self.commit_state(id, DescState::Finalized);
        self.desc_update_last_finalized();
    }
}

fn check_reopen_size(data_ring: &DataRing, size: usize, max_size: usize) -> Result<(), ReopenError> {
    if size > u16::MAX as usize || size > max_size || !data_ring.check_size(size as u64) {
        return Err(ReopenError::TooLarge { max: max_size });
    }
    Ok(())
}

impl std::fmt::Debug for PrintkRingbuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrintkRingbuffer")
            .field("desc_count", &self.desc_count())
            .field("text_size", &self.text_size())
            .field("head_id", &self.desc_ring.head_id.load(Ordering::Relaxed))
            .field("tail_id", &self.desc_ring.tail_id.load(Ordering::Relaxed))
            .field("fail", &self.fail_count())
            .finish()
    }
}
