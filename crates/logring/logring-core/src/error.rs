#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("descriptor count must be a power of two of at least 2, got {0}")]
    DescCount(usize),

    #[error("info array has {infos} entries but there are {descs} descriptors")]
    InfoCount { descs: usize, infos: usize },

    #[error("text ring of {0} bytes must be a power of two of at least 16 bytes")]
    TextSize(usize),

    #[error("ring geometry out of range ({desc_count_bits} descriptor bits, {text_bits} text bits)")]
    Bits { desc_count_bits: u32, text_bits: u32 },
}

/// Why [`crate::PrintkRingbuffer::reserve`] did not hand out an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReserveError {
    /// The text can never fit in this ring, no matter how much is reclaimed.
    #[error("record of {size} bytes cannot fit in the text ring")]
    TooLarge { size: usize },

    /// Not even a descriptor could be reserved. Counted in `fail_count()`.
    #[error("no descriptor available")]
    NoDescriptor,

    /// A descriptor was reserved but no text space. A dataless record with
    /// this sequence number was committed in its place.
    #[error("no text space available, record {seq} committed without data")]
    NoTextSpace { seq: u64 },
}

/// Why the last record could not be reopened. Callers fall back to a new
/// reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReopenError {
    #[error("last record is not open for this caller")]
    NotReopenable,

    #[error("extended record would exceed {max} bytes")]
    TooLarge { max: usize },

    #[error("no text space to extend the last record")]
    NoTextSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// The record was overwritten; readers continue from `first_seq`.
    #[error("record reclaimed, oldest available is {first_seq}")]
    Reclaimed { first_seq: u64 },

    /// The record was not produced or not finalized yet.
    #[error("record not available yet")]
    NotAvailable,

    /// The record exists but its text was lost.
    #[error("record text lost")]
    DataLost,
}
