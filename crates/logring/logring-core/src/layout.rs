//! Ring geometry and the bootstrap values of the logical counters.
//!
//! Both descriptor IDs and data logical positions (lpos) grow without bound and
//! are mapped to array indexes with a mask. The initial values are chosen so
//! that they map to the right indexes but overflow soon, which keeps the
//! overflow paths exercised early in the life of every ring.
//!
//! # Memory Layout
//!
//! ```text
//! descs:  [ Desc 0 | Desc 1 | ... | Desc count-1 (bootstrap head/tail) ]
//! infos:  [ Info 0 | Info 1 | ... | Info count-1 ]          (parallel)
//! text:   [ id | text ... pad | id | text ... pad | ... ]   (2^size_bits bytes)
//! ```

use crate::desc_ring::Desc;
use crate::error::LayoutError;
use logring_record::PrintkInfo;
use std::mem::size_of;

/// Data blocks start with the owning descriptor ID and are aligned to it.
pub const ID_ALIGN: u64 = size_of::<u64>() as u64;

/// Size of the ID header in front of every data block.
pub(crate) const BLK_HEADER: u64 = size_of::<u64>() as u64;

/// Block lpos of a record whose data block could not be allocated. Bit 0 marks
/// dataless blocks; real lpos values are always `ID_ALIGN` aligned.
pub const FAILED_LPOS: u64 = 0x1;

/// Block lpos of a record that intentionally has no text.
pub const EMPTY_LINE_LPOS: u64 = 0x3;

pub const MIN_DESC_COUNT_BITS: u32 = 1;
pub const MAX_DESC_COUNT_BITS: u32 = 24;
pub const MIN_TEXT_SIZE_BITS: u32 = 4;
pub const MAX_TEXT_SIZE_BITS: u32 = 32;

/// Geometry of a ring buffer.
///
/// `2^desc_count_bits` descriptors share a text ring of
/// `2^(desc_count_bits + avg_text_bits)` bytes, i.e. each record gets
/// `2^avg_text_bits` bytes on average.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingConfig {
    pub desc_count_bits: u32,
    pub avg_text_bits: u32,
}

impl RingConfig {
    /// Validates the geometry.
    ///
    /// # Example
    /// ```
    /// use logring_core::RingConfig;
    /// let cfg = RingConfig::new(4, 5).unwrap();
    /// assert_eq!(cfg.desc_count(), 16);
    /// assert_eq!(cfg.text_size(), 512);
    /// assert!(RingConfig::new(0, 5).is_err());
    /// ```
    pub fn new(desc_count_bits: u32, avg_text_bits: u32) -> Result<Self, LayoutError> {
        let text_bits = desc_count_bits.saturating_add(avg_text_bits);
        if !(MIN_DESC_COUNT_BITS..=MAX_DESC_COUNT_BITS).contains(&desc_count_bits)
            || !(MIN_TEXT_SIZE_BITS..=MAX_TEXT_SIZE_BITS).contains(&text_bits)
        {
            return Err(LayoutError::Bits {
                desc_count_bits,
                text_bits,
            });
        }
        Ok(Self {
            desc_count_bits,
            avg_text_bits,
        })
    }

    #[inline]
    pub fn desc_count(&self) -> usize {
        1usize << self.desc_count_bits
    }

    #[inline]
    pub fn text_size_bits(&self) -> u32 {
        self.desc_count_bits + self.avg_text_bits
    }

    #[inline]
    pub fn text_size(&self) -> usize {
        1usize << self.text_size_bits()
    }
}

/// Backing arrays for a ring buffer.
///
/// Callers may build these themselves (e.g. to reuse memory); the ring buffer
/// takes ownership in [`crate::PrintkRingbuffer::init`] and resets every
/// value the bootstrap depends on, so the previous contents do not matter.
pub struct RingStorage {
    /// Text data ring. Word-sized elements keep block IDs naturally aligned;
    /// `text.len() * 8` must be a power of two.
    pub text: Box<[u64]>,
    pub descs: Box<[Desc]>,
    pub infos: Box<[PrintkInfo]>,
}

impl RingStorage {
    /// Allocates zeroed arrays for the given geometry.
    pub fn new(cfg: RingConfig) -> Self {
        let count = cfg.desc_count();
        let words = cfg.text_size() / size_of::<u64>();
        Self {
            text: vec![0u64; words].into_boxed_slice(),
            descs: (0..count).map(|_| Desc::default()).collect(),
            infos: vec![PrintkInfo::default(); count].into_boxed_slice(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(u32, u32), LayoutError> {
        let count = self.descs.len();
        if count < 2 || !count.is_power_of_two() || count > (1 << MAX_DESC_COUNT_BITS) {
            return Err(LayoutError::DescCount(count));
        }
        if self.infos.len() != count {
            return Err(LayoutError::InfoCount {
                descs: count,
                infos: self.infos.len(),
            });
        }
        let bytes = self.text.len() * size_of::<u64>();
        if !bytes.is_power_of_two()
            || bytes < (1 << MIN_TEXT_SIZE_BITS)
            || (bytes as u64) > (1u64 << MAX_TEXT_SIZE_BITS)
        {
            return Err(LayoutError::TextSize(bytes));
        }
        Ok((count.trailing_zeros(), bytes.trailing_zeros()))
    }
}

/// Size of a data block holding `size` text bytes: ID header plus padding.
#[inline]
pub(crate) fn to_blk_size(size: u64) -> u64 {
    (size + BLK_HEADER + ID_ALIGN - 1) & !(ID_ALIGN - 1)
}

/// Initial `head_lpos`/`tail_lpos`: index 0, overflows on the first wrap.
#[inline]
pub(crate) fn blk0_lpos(size_bits: u32) -> u64 {
    (1u64 << size_bits).wrapping_neg()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_bounds() {
        assert!(RingConfig::new(1, 3).is_ok());
        assert!(RingConfig::new(0, 8).is_err());
        assert!(RingConfig::new(25, 0).is_err());
        assert!(RingConfig::new(2, 1).is_err(), "8 byte text ring is too small");
        assert!(RingConfig::new(20, 13).is_err());
    }

    #[test]
    fn blk_size_includes_header_and_padding() {
        assert_eq!(to_blk_size(0), 8);
        assert_eq!(to_blk_size(1), 16);
        assert_eq!(to_blk_size(8), 16);
        assert_eq!(to_blk_size(9), 24);
    }

    #[test]
    fn blk0_lpos_maps_to_index_zero() {
        let bits = 10;
        let lpos = blk0_lpos(bits);
        assert_eq!(lpos & ((1 << bits) - 1), 0);
        assert_eq!(lpos.wrapping_add(1 << bits), 0);
    }

    #[test]
    fn storage_validation() {
        let cfg = RingConfig::new(3, 4).unwrap();
        let storage = RingStorage::new(cfg);
        assert_eq!(storage.validate(), Ok((3, 7)));

        let mut bad = RingStorage::new(cfg);
        bad.infos = vec![PrintkInfo::default(); 4].into_boxed_slice();
        assert_eq!(
            bad.validate(),
            Err(LayoutError::InfoCount { descs: 8, infos: 4 })
        );

        let mut bad = RingStorage::new(cfg);
        bad.text = vec![0u64; 3].into_boxed_slice();
        assert_eq!(bad.validate(), Err(LayoutError::TextSize(24)));
    }
}
