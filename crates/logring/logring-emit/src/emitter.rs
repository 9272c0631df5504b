//! printk-style front end for writers.
//!
//! A message ending in `\n` completes a line and is made readable right away.
//! A message without one leaves its record open, and a following
//! [`LogLevel::Cont`] message from the same caller is appended to it.

use crate::clock::{current_caller, now_ns};
use logring_core::{
    CallerId, Level, PrintkRingbuffer, RECORD_MAX, RecordFlags, ReserveError, ReservedEntry,
};
use tracing::{debug, trace};

/// Appended to messages that had to be cut to fit.
pub const TRUNC_MSG: &[u8] = b"<truncated>";

/// At most this fraction of the text ring is taken by a truncated message.
const MAX_TAKE_PART: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Level(Level),
    /// Continues the caller's previous line if it is still open.
    Cont,
}

/// Where a message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emitted {
    pub seq: u64,
    /// Message bytes stored, not counting a truncation marker.
    pub len: usize,
    /// Appended to an existing record instead of starting a new one.
    pub appended: bool,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    #[error("message could not be stored")]
    Reserve(#[from] ReserveError),
}

pub struct Emitter<'a> {
    rb: &'a PrintkRingbuffer,
    default_level: Level,
}

impl<'a> Emitter<'a> {
    pub fn new(rb: &'a PrintkRingbuffer) -> Self {
        Self {
            rb,
            default_level: Level::default(),
        }
    }

    /// Level given to continuation messages that have to start a new record.
    pub fn with_default_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    /// Emits `text` as the calling thread with facility 0 (kernel).
    pub fn log(&self, level: LogLevel, text: &str) -> Result<Emitted, EmitError> {
        self.emit(current_caller(), level, 0, text.as_bytes())
    }

    pub fn emit(
        &self,
        caller: CallerId,
        level: LogLevel,
        facility: u8,
        text: &[u8],
    ) -> Result<Emitted, EmitError> {
        let (text, newline) = match text.strip_suffix(b"\n") {
            Some(line) => (line, true),
            None => (text, false),
        };

        if level == LogLevel::Cont {
            match self.rb.reserve_in_last(text.len(), caller, RECORD_MAX) {
                Ok(mut entry) => {
                    let seq = entry.seq();
                    let len = entry.write(text);
                    if newline {
                        let mut flags = entry.flags();
                        flags.insert(RecordFlags::NEWLINE);
                        entry.set_flags(flags);
                    }
                    finish(entry, newline);
                    return Ok(Emitted {
                        seq,
                        len,
                        appended: true,
                        truncated: false,
                    });
                }
                Err(err) => trace!(%caller, %err, "continuation starts a new record"),
            }
        }

        let mut flags = RecordFlags::default();
        if newline {
            flags.insert(RecordFlags::NEWLINE);
        }
        let level = match level {
            LogLevel::Level(level) => level,
            LogLevel::Cont => {
                flags.insert(RecordFlags::CONT);
                self.default_level
            }
        };

        let (mut entry, keep, truncated) = match self.rb.reserve(text.len()) {
            Ok(entry) => (entry, text.len(), false),
            Err(err @ ReserveError::NoDescriptor) => return Err(err.into()),
            Err(err) => {
                let (keep, marker) = truncate(text.len(), self.rb.text_size());
                debug!(%err, len = text.len(), keep, "retrying with truncated message");
                let entry = self.rb.reserve(keep + marker)?;
                (entry, keep, true)
            }
        };

        let len = entry.write(&text[..keep]);
        if truncated {
            entry.write(TRUNC_MSG);
        }
        entry.set_ts_nsec(now_ns());
        entry.set_level(level);
        entry.set_flags(flags);
        entry.set_facility(facility);
        entry.set_caller_id(caller);

        let seq = entry.seq();
        finish(entry, newline);
        Ok(Emitted {
            seq,
            len,
            appended: false,
            truncated,
        })
    }
}

/// A complete line can no longer be extended, so it is finalized.
fn finish(entry: ReservedEntry<'_>, newline: bool) {
    if newline {
        entry.final_commit();
    } else {
        entry.commit();
    }
}

/// Bytes of the message to keep and the length of the marker that follows
/// them, so that together they fit in a fraction of the text ring.
fn truncate(text_len: usize, text_size: usize) -> (usize, usize) {
    let max = (text_size / MAX_TAKE_PART).min(u16::MAX as usize);
    let keep = text_len.min(max);
    if keep >= TRUNC_MSG.len() {
        (keep - TRUNC_MSG.len(), TRUNC_MSG.len())
    } else {
        (keep, 0)
    }
}
