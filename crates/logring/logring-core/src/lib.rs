mod data_ring;
mod desc_ring;
mod entry;
mod error;
mod layout;
mod reader;
mod ringbuffer;
mod state;

pub use desc_ring::Desc;
pub use entry::ReservedEntry;
pub use error::{LayoutError, ReadError, ReopenError, ReserveError};
pub use layout::{
    EMPTY_LINE_LPOS, FAILED_LPOS, ID_ALIGN, MAX_DESC_COUNT_BITS, MAX_TEXT_SIZE_BITS,
    MIN_DESC_COUNT_BITS, MIN_TEXT_SIZE_BITS, RingConfig, RingStorage,
};
pub use reader::{Infos, Reader, Record, RecordBuf, Records};
pub use ringbuffer::PrintkRingbuffer;
pub use state::DescState;

pub use logring_record::{CallerId, DevInfo, Level, PrintkInfo, RECORD_MAX, RecordFlags};
