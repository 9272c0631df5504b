//! Lockless readers.
//!
//! A read copies the record and then checks that the descriptor is still
//! finalized with the same sequence number. Readers never write to the ring,
//! so any number of them can run alongside the writers.

use crate::data_ring::DataRing;
use crate::desc_ring::{BlkLpos, DescRing, DescSnapshot};
use crate::error::ReadError;
use crate::ringbuffer::PrintkRingbuffer;
use crate::state::{DescState, desc_id};
use logring_record::PrintkInfo;
use std::ptr;
use std::sync::atomic::{Ordering, fence};

/// Why a single record could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMiss {
    /// Does not exist (yet), or is not finalized.
    Invalid,
    /// Exists, but its text is gone.
    NoData,
}

impl DescRing {
    /// Reads descriptor `id` and checks that it holds the finalized record
    /// `seq`.
    fn desc_read_finalized_seq(&self, id: u64, seq: u64) -> Result<DescSnapshot, ReadMiss> {
        let (d_state, desc) = self.desc_read(id);
        match d_state {
            DescState::Miss | DescState::Reserved | DescState::Committed => {
                return Err(ReadMiss::Invalid);
            }
            _ if desc.seq != seq => return Err(ReadMiss::Invalid),
            DescState::Reusable => return Err(ReadMiss::NoData),
            DescState::Finalized => {}
        }
        if desc.blk == BlkLpos::FAILED {
            return Err(ReadMiss::NoData);
        }
        Ok(desc)
    }
}

/// Where a read puts what it finds. Every part is optional; with nothing
/// requested a read only checks that the record exists.
struct ReadTarget<'b> {
    info: Option<&'b mut PrintkInfo>,
    text: Option<&'b mut [u8]>,
    line_count: Option<&'b mut usize>,
}

/// Copies the text of a block into `target`. Fails if the block is gone or
/// does not hold `len` bytes.
fn copy_data(data_ring: &DataRing, blk: BlkLpos, len: u16, target: &mut ReadTarget<'_>) -> bool {
    let wants_text = target.text.as_ref().is_some_and(|t| !t.is_empty());
    if !wants_text && target.line_count.is_none() {
        return true;
    }

    let Some((data, data_size)) = data_ring.get_data(blk) else {
        return false;
    };
    // The length was read racily; the padded block is never shorter.
    let len = len as usize;
    if data_size < len {
        return false;
    }

    if let Some(line_count) = target.line_count.as_deref_mut() {
        *line_count = count_lines(data, len);
    }
    if let Some(text) = target.text.as_deref_mut() {
        let n = text.len().min(len);
        // SAFETY: `data` points to at least `len` bytes inside the ring. The
        // bytes may be overwritten concurrently; the caller re-validates the
        // descriptor before trusting the copy.
        unsafe { ptr::copy_nonoverlapping(data, text.as_mut_ptr(), n) };
    }
    true
}

fn count_lines(data: *const u8, len: usize) -> usize {
    let mut lines = 1;
    for i in 0..len {
        // SAFETY: as in `copy_data`.
        if unsafe { ptr::read_volatile(data.add(i)) } == b'\n' {
            lines += 1;
        }
    }
    lines
}

/// Reusable buffer for one record: the metadata and up to `capacity` bytes
/// of text.
#[derive(Debug, Clone)]
pub struct RecordBuf {
    info: PrintkInfo,
    text: Box<[u8]>,
}

impl RecordBuf {
    pub fn new(capacity: usize) -> Self {
        Self {
            info: PrintkInfo::default(),
            text: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn info(&self) -> &PrintkInfo {
        &self.info
    }

    /// The text that was read, cut at the buffer capacity.
    #[inline]
    pub fn text(&self) -> &[u8] {
        let len = (self.info.text_len as usize).min(self.text.len());
        &self.text[..len]
    }

    /// Whether the record held more text than the buffer could take.
    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.info.text_len as usize > self.text.len()
    }

    pub fn to_record(&self) -> Record {
        Record {
            info: self.info,
            text: self.text().to_vec(),
        }
    }
}

/// An owned copy of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub info: PrintkInfo,
    pub text: Vec<u8>,
}

impl PrintkRingbuffer {
    /// Copies record `seq` into `target` if it is finalized.
    fn prb_read(&self, seq: u64, target: Option<&mut ReadTarget<'_>>) -> Result<(), ReadMiss> {
        let desc_ring = &self.desc_ring;

        // The slot for `seq` names the descriptor to check.
        let id = desc_id(desc_ring.desc(seq).state_var.load(Ordering::Relaxed));

        let desc = desc_ring.desc_read_finalized_seq(id, seq)?;
        let Some(target) = target else {
            return Ok(());
        };

        let info = desc_ring.read_info(id);
        if let Some(out) = target.info.as_deref_mut() {
            *out = info;
        }

        if !copy_data(&self.text_data_ring, desc.blk, info.text_len, target) {
            return Err(ReadMiss::NoData);
        }

        // Everything copied must still belong to `seq`.
        fence(Ordering::Acquire);
        desc_ring.desc_read_finalized_seq(id, seq).map(|_| ())
    }

    /// Reads the first readable record at or after `*seq`, skipping records
    /// that were lost and catching up if `*seq` was overwritten. On success
    /// `*seq` is the sequence number that was read.
    fn read_valid_inner(&self, seq: &mut u64, mut target: Option<&mut ReadTarget<'_>>) -> bool {
        loop {
            let err = match self.prb_read(*seq, target.as_deref_mut()) {
                Ok(()) => return true,
                Err(err) => err,
            };

            let tail_seq = self.first_seq();
            if *seq < tail_seq {
                *seq = tail_seq;
            } else if err == ReadMiss::NoData {
                *seq += 1;
            } else {
                return false;
            }
        }
    }

    /// Reads record `seq` into `buf`.
    ///
    /// # Errors
    /// - [`ReadError::Reclaimed`] if the record was overwritten.
    /// - [`ReadError::NotAvailable`] if it is not finalized yet.
    /// - [`ReadError::DataLost`] if it exists without its text.
    pub fn read(&self, seq: u64, buf: &mut RecordBuf) -> Result<(), ReadError> {
        let mut target = ReadTarget {
            info: Some(&mut buf.info),
            text: Some(&mut buf.text[..]),
            line_count: None,
        };
        let Err(err) = self.prb_read(seq, Some(&mut target)) else {
            return Ok(());
        };

        let first_seq = self.first_seq();
        if seq < first_seq {
            return Err(ReadError::Reclaimed { first_seq });
        }
        Err(match err {
            ReadMiss::Invalid => ReadError::NotAvailable,
            ReadMiss::NoData => ReadError::DataLost,
        })
    }

    /// Reads the next readable record at or after `*seq` into `buf` and
    /// sets `*seq` to its sequence number. Returns `false` if there is none.
    pub fn read_valid(&self, seq: &mut u64, buf: &mut RecordBuf) -> bool {
        let mut target = ReadTarget {
            info: Some(&mut buf.info),
            text: Some(&mut buf.text[..]),
            line_count: None,
        };
        self.read_valid_inner(seq, Some(&mut target))
    }

    /// Like [`read_valid`](Self::read_valid) but only copies the metadata
    /// and counts the lines of the text.
    pub fn read_valid_info(&self, seq: &mut u64, info: &mut PrintkInfo, line_count: &mut usize) -> bool {
        let mut target = ReadTarget {
            info: Some(info),
            text: None,
            line_count: Some(line_count),
        };
        self.read_valid_inner(seq, Some(&mut target))
    }

    /// Sequence number of the oldest record still in the ring, which may
    /// have lost its data.
    pub fn first_seq(&self) -> u64 {
        let desc_ring = &self.desc_ring;
        loop {
            let id = desc_ring.tail_id.load(Ordering::Acquire);
            let (d_state, desc) = desc_ring.desc_read(id);

            // The tail is always finalized or reusable unless it moved
            // while being read.
            if matches!(d_state, DescState::Finalized | DescState::Reusable) {
                return desc.seq;
            }
            fence(Ordering::Acquire);
        }
    }

    /// Sequence number of the oldest record that can actually be read, or
    /// [`next_seq`](Self::next_seq) if there is none.
    pub fn first_valid_seq(&self) -> u64 {
        let mut seq = 0;
        if !self.read_valid_inner(&mut seq, None) {
            return self.next_seq();
        }
        seq
    }

    /// Sequence number following the last readable record. Records beyond
    /// it may exist but are not finalized yet.
    pub fn next_seq(&self) -> u64 {
        let mut seq = self.desc_ring.last_finalized_seq.load(Ordering::Acquire);

        // 0 is ambiguous: nothing finalized yet, or record 0 finalized.
        if seq != 0 {
            seq += 1;
        }
        while self.read_valid_inner(&mut seq, None) {
            seq += 1;
        }
        seq
    }

    /// Sequence number the next reservation will get.
    pub fn next_reserve_seq(&self) -> u64 {
        let desc_ring = &self.desc_ring;
        loop {
            let last_finalized_seq = desc_ring.last_finalized_seq.load(Ordering::Acquire);
            let head_id = desc_ring.head_id.load(Ordering::Acquire);

            let mut last_finalized_id =
                desc_id(desc_ring.desc(last_finalized_seq).state_var.load(Ordering::Relaxed));

            if desc_ring
                .desc_read_finalized_seq(last_finalized_id, last_finalized_seq)
                .is_err_and(|e| e == ReadMiss::Invalid)
            {
                if last_finalized_seq != 0 {
                    // Overwritten in the meantime.
                    continue;
                }
                if head_id == desc_ring.desc0_id() {
                    return 0;
                }
                // Records are reserved but none is finalized: count from the
                // first one.
                last_finalized_id = desc_id(desc_ring.desc0_id().wrapping_add(1));
            }

            let diff = desc_id(head_id.wrapping_sub(last_finalized_id));
            return last_finalized_seq + diff + 1;
        }
    }

    /// Iterates over readable records starting at `from`, copying up to
    /// `text_cap` bytes of text each. Lost records are skipped.
    pub fn records(&self, from: u64, text_cap: usize) -> Records<'_> {
        Records {
            rb: self,
            seq: from,
            buf: RecordBuf::new(text_cap),
        }
    }

    /// Iterates over the metadata and line counts of readable records
    /// starting at `from`.
    pub fn infos(&self, from: u64) -> Infos<'_> {
        Infos { rb: self, seq: from }
    }

    /// Updates `last_finalized_seq` past every consecutive readable record.
    pub(crate) fn desc_update_last_finalized(&self) {
        let desc_ring = &self.desc_ring;
        let mut old_seq = desc_ring.last_finalized_seq.load(Ordering::Acquire);

        loop {
            let mut finalized_seq = old_seq;
            let mut try_seq = finalized_seq + 1;
            while self.read_valid_inner(&mut try_seq, None) {
                finalized_seq = try_seq;
                try_seq += 1;
            }

            if finalized_seq == old_seq {
                return;
            }

            match desc_ring.last_finalized_seq.compare_exchange(
                old_seq,
                finalized_seq,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => old_seq = current,
            }
        }
    }
}

pub struct Records<'a> {
    rb: &'a PrintkRingbuffer,
    seq: u64,
    buf: RecordBuf,
}

impl Iterator for Records<'_> {
    type Item = (u64, Record);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.rb.read_valid(&mut self.seq, &mut self.buf) {
            return None;
        }
        let seq = self.seq;
        self.seq += 1;
        Some((seq, self.buf.to_record()))
    }
}

pub struct Infos<'a> {
    rb: &'a PrintkRingbuffer,
    seq: u64,
}

impl Iterator for Infos<'_> {
    type Item = (PrintkInfo, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let mut info = PrintkInfo::default();
        let mut lines = 0;
        if !self.rb.read_valid_info(&mut self.seq, &mut info, &mut lines) {
            return None;
        }
        self.seq += 1;
        Some((info, lines))
    }
}

/// A cursor that follows the ring, like a `tail -f`.
///
/// Keeps its own position; records that were overwritten before it got to
/// them are counted in [`dropped`](Self::dropped).
pub struct Reader<'a> {
    rb: &'a PrintkRingbuffer,
    next_seq: u64,
    dropped: u64,
    buf: RecordBuf,
}

impl<'a> Reader<'a> {
    /// Starts at the oldest readable record.
    pub fn new(rb: &'a PrintkRingbuffer, text_cap: usize) -> Self {
        Self::from_seq(rb, rb.first_valid_seq(), text_cap)
    }

    /// Starts after the newest readable record, so only records finalized
    /// from now on are seen.
    pub fn tail_follow(rb: &'a PrintkRingbuffer, text_cap: usize) -> Self {
        Self::from_seq(rb, rb.next_seq(), text_cap)
    }

    pub fn from_seq(rb: &'a PrintkRingbuffer, seq: u64, text_cap: usize) -> Self {
        Self {
            rb,
            next_seq: seq,
            dropped: 0,
            buf: RecordBuf::new(text_cap),
        }
    }

    /// Reads the next record, if one is ready. Gaps (overwritten or lost
    /// records) are added to [`dropped`](Self::dropped).
    pub fn try_read(&mut self) -> Option<&RecordBuf> {
        let mut seq = self.next_seq;
        if !self.rb.read_valid(&mut seq, &mut self.buf) {
            return None;
        }
        self.dropped += seq - self.next_seq;
        self.next_seq = seq + 1;
        Some(&self.buf)
    }

    #[inline]
    pub fn ringbuffer(&self) -> &'a PrintkRingbuffer {
        self.rb
    }

    /// Sequence number of the next record to read.
    #[inline]
    pub fn position(&self) -> u64 {
        self.next_seq
    }

    /// Records skipped so far.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
