#![forbid(unsafe_code)]

use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::fmt;

pub const DEV_INFO_SUBSYSTEM_LEN: usize = 16;
pub const DEV_INFO_DEVICE_LEN: usize = 48;

// Identifies who produced a record: a task (thread id) or, with the top bit
// set, a CPU. Continuation lines are only merged for the same caller.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CallerId(pub u32);

impl CallerId {
    const CPU_BIT: u32 = 0x8000_0000;

    #[inline]
    pub fn task(pid: u32) -> Self {
        Self(pid & !Self::CPU_BIT)
    }

    #[inline]
    pub fn cpu(cpu: u32) -> Self {
        Self(Self::CPU_BIT | cpu)
    }

    #[inline]
    pub fn is_cpu(&self) -> bool {
        self.0 & Self::CPU_BIT != 0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_cpu() {
            write!(f, "C{}", self.0 & !Self::CPU_BIT)
        } else {
            write!(f, "T{}", self.0)
        }
    }
}

/// Syslog severity. Stored in 3 bits of the record, so there are exactly 8.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Level {
    Emerg = 0,
    Alert = 1,
    Crit = 2,
    Err = 3,
    Warning = 4,
    Notice = 5,
    #[default]
    Info = 6,
    Debug = 7,
}

impl Level {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x7 {
            0 => Level::Emerg,
            1 => Level::Alert,
            2 => Level::Crit,
            3 => Level::Err,
            4 => Level::Warning,
            5 => Level::Notice,
            6 => Level::Info,
            _ => Level::Debug,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Emerg => "emerg",
            Level::Alert => "alert",
            Level::Crit => "crit",
            Level::Err => "err",
            Level::Warning => "warning",
            Level::Notice => "notice",
            Level::Info => "info",
            Level::Debug => "debug",
        }
    }
}

/// Internal record flags, 5 bits wide.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct RecordFlags(u8);

impl RecordFlags {
    pub const MASK: u8 = 0x1f;
    /// The text ended with a newline; the record cannot be continued.
    pub const NEWLINE: RecordFlags = RecordFlags(0x02);
    /// The text was produced as a continuation of an earlier line.
    pub const CONT: RecordFlags = RecordFlags(0x08);

    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }

    #[inline]
    pub fn bits(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn contains(&self, other: RecordFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: RecordFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for RecordFlags {
    type Output = RecordFlags;

    fn bitor(self, rhs: RecordFlags) -> RecordFlags {
        RecordFlags(self.0 | rhs.0)
    }
}

/// Opaque device metadata attached to a record. The ring buffer stores it
/// verbatim and never looks inside.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevInfo {
    pub subsystem: [u8; DEV_INFO_SUBSYSTEM_LEN],
    pub device: [u8; DEV_INFO_DEVICE_LEN],
}

impl Default for DevInfo {
    fn default() -> Self {
        Self {
            subsystem: [0; DEV_INFO_SUBSYSTEM_LEN],
            device: [0; DEV_INFO_DEVICE_LEN],
        }
    }
}

impl DevInfo {
    /// Builds device info from strings, truncating each to its field size.
    pub fn new(subsystem: &str, device: &str) -> Self {
        let mut info = DevInfo::default();
        copy_truncated(&mut info.subsystem, subsystem.as_bytes());
        copy_truncated(&mut info.device, device.as_bytes());
        info
    }

    pub fn is_empty(&self) -> bool {
        self.subsystem[0] == 0 && self.device[0] == 0
    }

    pub fn subsystem_str(&self) -> String {
        nul_terminated(&self.subsystem)
    }

    pub fn device_str(&self) -> String {
        nul_terminated(&self.device)
    }
}

fn copy_truncated(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl Serialize for DevInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("DevInfo", 2)?;
        s.serialize_field("subsystem", &self.subsystem_str())?;
        s.serialize_field("device", &self.device_str())?;
        s.end()
    }
}

// Meta information about each stored record. Everything except `seq` is
// filled in by the writer; `seq` belongs to the ring buffer.
// POD, fixed size, lives in a pre-allocated array parallel to the descriptors.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrintkInfo {
    pub seq: u64,
    pub ts_nsec: u64,
    pub text_len: u16,
    pub facility: u8,
    // low 5 bits flags, high 3 bits level
    level_flags: u8,
    pub caller_id: CallerId,
    pub dev_info: DevInfo,
}

impl PrintkInfo {
    #[inline]
    pub fn level(&self) -> Level {
        Level::from_bits(self.level_flags >> 5)
    }

    #[inline]
    pub fn set_level(&mut self, level: Level) {
        self.level_flags = (self.level_flags & RecordFlags::MASK) | ((level as u8) << 5);
    }

    #[inline]
    pub fn flags(&self) -> RecordFlags {
        RecordFlags::from_bits(self.level_flags)
    }

    #[inline]
    pub fn set_flags(&mut self, flags: RecordFlags) {
        self.level_flags = (self.level_flags & !RecordFlags::MASK) | flags.bits();
    }
}

impl Serialize for PrintkInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("PrintkInfo", 8)?;
        s.serialize_field("seq", &self.seq)?;
        s.serialize_field("ts_nsec", &self.ts_nsec)?;
        s.serialize_field("text_len", &self.text_len)?;
        s.serialize_field("facility", &self.facility)?;
        s.serialize_field("level", self.level().as_str())?;
        s.serialize_field("flags", &self.flags().bits())?;
        s.serialize_field("caller", &self.caller_id.to_string())?;
        s.serialize_field("dev_info", &self.dev_info)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    /// The info array is sized `count * size_of::<PrintkInfo>()` up front, so
    /// the layout is pinned: 24 bytes of fields plus 64 bytes of device info.
    #[test]
    fn printk_info_layout_is_stable() {
        assert_eq!(size_of::<DevInfo>(), 64);
        assert_eq!(size_of::<PrintkInfo>(), 88, "PrintkInfo layout changed");
        assert_eq!(align_of::<PrintkInfo>(), 8);
    }

    #[test]
    fn caller_id_is_pod() {
        assert_eq!(size_of::<CallerId>(), 4);
        assert!(CallerId::cpu(3).is_cpu());
        assert!(!CallerId::task(42).is_cpu());
        assert_eq!(CallerId::cpu(3).to_string(), "C3");
        assert_eq!(CallerId::task(42).to_string(), "T42");
    }

    #[test]
    fn level_and_flags_share_a_byte() {
        let mut info = PrintkInfo::default();
        info.set_level(Level::Warning);
        info.set_flags(RecordFlags::NEWLINE | RecordFlags::CONT);
        assert_eq!(info.level(), Level::Warning);
        assert!(info.flags().contains(RecordFlags::NEWLINE));
        assert!(info.flags().contains(RecordFlags::CONT));

        info.set_level(Level::Debug);
        assert_eq!(info.flags().bits(), 0x0a);
        info.set_flags(RecordFlags::default());
        assert_eq!(info.level(), Level::Debug);
    }

    #[test]
    fn dev_info_truncates_and_serializes() {
        let long = "x".repeat(100);
        let dev = DevInfo::new("usb", &long);
        assert_eq!(dev.subsystem_str(), "usb");
        assert_eq!(dev.device_str().len(), DEV_INFO_DEVICE_LEN);

        let json = serde_json::to_string(&DevInfo::new("pci", "0000:00:1f.2")).unwrap();
        assert_eq!(json, r#"{"subsystem":"pci","device":"0000:00:1f.2"}"#);
    }
}
