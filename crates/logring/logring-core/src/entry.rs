use crate::ringbuffer::PrintkRingbuffer;
use logring_record::{CallerId, DevInfo, Level, PrintkInfo, RecordFlags};
use std::ptr;

/// A record in the reserved state, owned by the writer that reserved it.
///
/// The text and metadata are filled in through this handle, then the record
/// is handed over with [`commit`](Self::commit) or
/// [`final_commit`](Self::final_commit). Dropping the handle commits it.
///
/// Not `Send`: the reservation must be committed on the reserving thread.
pub struct ReservedEntry<'a> {
    rb: &'a PrintkRingbuffer,
    id: u64,
    seq: u64,
    info: *mut PrintkInfo,
    text: *mut u8,
    text_cap: usize,
    text_space: u64,
    done: bool,
}

impl<'a> ReservedEntry<'a> {
    pub(crate) fn new(
        rb: &'a PrintkRingbuffer,
        id: u64,
        seq: u64,
        info: *mut PrintkInfo,
        text: *mut u8,
        text_cap: usize,
        text_space: u64,
    ) -> Self {
        Self {
            rb,
            id,
            seq,
            info,
            text,
            text_cap,
            text_space,
            done: false,
        }
    }

    #[inline(always)]
    fn info(&self) -> &PrintkInfo {
        // SAFETY: the descriptor is reserved, only this handle writes the info.
        unsafe { &*self.info }
    }

    #[inline(always)]
    fn info_mut(&mut self) -> &mut PrintkInfo {
        // SAFETY: as in `info`.
        unsafe { &mut *self.info }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Bytes of the text ring used by this record, padding and skipped wrap
    /// space included.
    #[inline]
    pub fn text_space(&self) -> u64 {
        self.text_space
    }

    /// Bytes of text the record can hold.
    #[inline]
    pub fn text_capacity(&self) -> usize {
        self.text_cap
    }

    #[inline]
    pub fn text_len(&self) -> usize {
        self.info().text_len as usize
    }

    /// Appends `bytes` after the current text, truncating at the capacity.
    /// Returns the number of bytes written.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let len = self.text_len();
        let n = bytes.len().min(self.text_cap.saturating_sub(len));
        if n == 0 {
            return 0;
        }
        // SAFETY: `text` points to at least `text_cap` writable bytes owned by
        // this reservation, and `len + n <= text_cap`.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.text.add(len), n) };
        self.info_mut().text_len = (len + n) as u16;
        n
    }

    /// The whole text area, for callers formatting in place. The text length
    /// must be set with [`set_text_len`](Self::set_text_len) afterwards.
    pub fn text_mut(&mut self) -> &mut [u8] {
        if self.text_cap == 0 {
            return &mut [];
        }
        // SAFETY: see `write`.
        unsafe { std::slice::from_raw_parts_mut(self.text, self.text_cap) }
    }

    pub fn set_text_len(&mut self, len: usize) {
        let len = len.min(self.text_cap);
        self.info_mut().text_len = len as u16;
    }

    pub fn set_ts_nsec(&mut self, ts_nsec: u64) {
        self.info_mut().ts_nsec = ts_nsec;
    }

    pub fn set_level(&mut self, level: Level) {
        self.info_mut().set_level(level);
    }

    pub fn set_flags(&mut self, flags: RecordFlags) {
        self.info_mut().set_flags(flags);
    }

    pub fn flags(&self) -> RecordFlags {
        self.info().flags()
    }

    pub fn set_facility(&mut self, facility: u8) {
        self.info_mut().facility = facility;
    }

    pub fn set_caller_id(&mut self, caller_id: CallerId) {
        self.info_mut().caller_id = caller_id;
    }

    pub fn set_dev_info(&mut self, dev_info: DevInfo) {
        self.info_mut().dev_info = dev_info;
    }

    /// Commits the record. It stays reopenable by its caller until another
    /// record is reserved.
    pub fn commit(mut self) {
        self.done = true;
        self.rb.commit(self.id);
    }

    /// Commits and finalizes the record; readers see it right away.
    pub fn final_commit(mut self) {
        self.done = true;
        self.rb.final_commit(self.id);
    }
}

impl Drop for ReservedEntry<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.rb.commit(self.id);
        }
    }
}

impl std::fmt::Debug for ReservedEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedEntry")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("text_len", &self.text_len())
            .field("text_cap", &self.text_cap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{PrintkRingbuffer, RecordBuf, RingConfig};
    use logring_record::{CallerId, Level, RecordFlags};

    #[test]
    fn write_truncates_at_capacity() {
        let rb = PrintkRingbuffer::new(RingConfig::new(3, 5).unwrap()).unwrap();
        let mut e = rb.reserve(4).unwrap();
        assert_eq!(e.write(b"ab"), 2);
        assert_eq!(e.write(b"cdef"), 2);
        assert_eq!(e.write(b"g"), 0);
        assert_eq!(e.text_len(), 4);
        e.final_commit();

        let mut buf = RecordBuf::new(16);
        rb.read(0, &mut buf).unwrap();
        assert_eq!(buf.text(), b"abcd");
    }

    #[test]
    fn metadata_reaches_the_reader() {
        let rb = PrintkRingbuffer::new(RingConfig::new(3, 5).unwrap()).unwrap();
        let mut e = rb.reserve(8).unwrap();
        let text = e.text_mut();
        text[..3].copy_from_slice(b"xyz");
        e.set_text_len(3);
        e.set_ts_nsec(42);
        e.set_level(Level::Warning);
        e.set_flags(RecordFlags::NEWLINE);
        e.set_facility(3);
        e.set_caller_id(CallerId::cpu(1));
        e.final_commit();

        let mut buf = RecordBuf::new(16);
        rb.read(0, &mut buf).unwrap();
        let info = buf.info();
        assert_eq!(info.seq, 0);
        assert_eq!(info.ts_nsec, 42);
        assert_eq!(info.level(), Level::Warning);
        assert!(info.flags().contains(RecordFlags::NEWLINE));
        assert_eq!(info.facility, 3);
        assert_eq!(info.caller_id, CallerId::cpu(1));
        assert_eq!(buf.text(), b"xyz");
    }
}
