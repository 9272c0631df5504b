//! Descriptor state words: a descriptor ID and a 2-bit state packed into one
//! atomic `u64`.
//!
//! Packing both into a single word is what lets every transition be one
//! compare-and-swap: a reader can never observe a state from one ID combined
//! with another ID.
//!
//! # Encoding
//!
//! ```text
//!  63 62 61                                                      0
//! ┌─────┬─────────────────────────────────────────────────────────┐
//! │state│                       descriptor ID                      │
//! └─────┴─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!            reserve            commit             finalize
//! reusable ───────► reserved ───────► committed ───────► finalized
//!    ▲                  ▲                 │                   │
//!    │                  └─── reopen ──────┘                   │
//!    └──────────────────────── reclaim ──────────────────────┘
//! ```
//!
//! A state query names the ID it expects. When the word holds another ID the
//! answer is [`DescState::Miss`]: the slot was recycled or not yet reused.

pub(crate) const SV_BITS: u32 = u64::BITS;
pub(crate) const FLAGS_SHIFT: u32 = SV_BITS - 2;
pub(crate) const FLAGS_MASK: u64 = 3 << FLAGS_SHIFT;
pub(crate) const ID_MASK: u64 = !FLAGS_MASK;

#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescState {
    /// ID mismatch (pseudo state).
    Miss = -1,
    /// In use by a writer.
    Reserved = 0x0,
    /// Committed by the writer, may still be reopened.
    Committed = 0x1,
    /// Committed, no further modification allowed.
    Finalized = 0x2,
    /// Free, not in use by any writer.
    Reusable = 0x3,
}

impl DescState {
    #[inline(always)]
    fn from_bits(bits: u64) -> Self {
        match bits & 3 {
            0 => DescState::Reserved,
            1 => DescState::Committed,
            2 => DescState::Finalized,
            _ => DescState::Reusable,
        }
    }
}

/// Masks a counter value down to the ID space.
#[inline(always)]
pub(crate) fn desc_id(sv: u64) -> u64 {
    sv & ID_MASK
}

/// Builds a state word. `state` must not be [`DescState::Miss`].
#[inline(always)]
pub(crate) fn desc_sv(id: u64, state: DescState) -> u64 {
    debug_assert!(state != DescState::Miss);
    ((state as u64 & 3) << FLAGS_SHIFT) | desc_id(id)
}

/// State of the descriptor `id` as seen in the word `sv`.
#[inline(always)]
pub(crate) fn get_desc_state(id: u64, sv: u64) -> DescState {
    if desc_id(id) != desc_id(sv) {
        return DescState::Miss;
    }
    DescState::from_bits(sv >> FLAGS_SHIFT)
}
