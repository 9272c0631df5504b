pub mod printk_info;
pub use printk_info::{CallerId, DevInfo, Level, PrintkInfo, RecordFlags};

// Longest text a single record may hold, including continuation chunks.
pub const RECORD_MAX: usize = 1024;
