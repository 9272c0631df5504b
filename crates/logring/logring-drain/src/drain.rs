use logring_core::{PrintkInfo, PrintkRingbuffer, Reader, RecordBuf};
use serde::Serialize;
use std::borrow::Cow;
use std::io::{self, Write};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// `[    5.000123] text`, like a kernel console.
    #[default]
    Text,
    /// One JSON object per record.
    Json,
}

#[derive(Serialize)]
struct JsonRecord<'r> {
    #[serde(flatten)]
    info: &'r PrintkInfo,
    text: Cow<'r, str>,
    truncated: bool,
}

/// Console-like consumer: follows the ring and writes every record it can
/// still read to `out`.
pub struct Drain<'a, W: Write> {
    reader: Reader<'a>,
    out: W,
    format: Format,
    /// Most records written per [`poll`](Drain::poll).
    batch: usize,
    dropped: u64,
}

impl<'a, W: Write> Drain<'a, W> {
    /// Starts at the oldest record still in the ring.
    pub fn new(rb: &'a PrintkRingbuffer, out: W, format: Format) -> Self {
        Self::with_reader(Reader::new(rb, logring_core::RECORD_MAX), out, format)
    }

    /// Polls write at most one ring's worth of descriptors at a time.
    pub fn with_reader(reader: Reader<'a>, out: W, format: Format) -> Self {
        let batch = reader.ringbuffer().desc_count();
        Self {
            reader,
            out,
            format,
            batch,
            dropped: 0,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Writes up to one batch of the records that became readable since the
    /// last poll, then flushes. Returns how many were written.
    pub fn poll(&mut self) -> io::Result<usize> {
        let mut count = 0usize;
        while count < self.batch {
            let expected = self.reader.position();
            let Some(record) = self.reader.try_read() else {
                break;
            };

            let missed = record.info().seq - expected;
            if missed > 0 {
                debug!(missed, at = expected, "records overwritten before drain");
                self.dropped += missed;
                writeln!(self.out, "** {missed} printk messages dropped **")?;
            }
            write_record(&mut self.out, self.format, record)?;
            count += 1;
        }
        self.out.flush()?;
        Ok(count)
    }

    /// Records that were overwritten or lost before they could be written.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn write_record<W: Write>(out: &mut W, format: Format, record: &RecordBuf) -> io::Result<()> {
    let info = record.info();
    let text = String::from_utf8_lossy(record.text());
    match format {
        Format::Text => {
            let secs = info.ts_nsec / 1_000_000_000;
            let usecs = (info.ts_nsec % 1_000_000_000) / 1_000;
            writeln!(out, "[{secs:5}.{usecs:06}] {text}")
        }
        Format::Json => {
            let json = JsonRecord {
                info,
                text,
                truncated: record.is_truncated(),
            };
            serde_json::to_writer(&mut *out, &json)?;
            writeln!(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logring_core::{CallerId, RingConfig};

    fn put(rb: &PrintkRingbuffer, ts: u64, text: &str) {
        let mut e = rb.reserve(text.len()).unwrap();
        e.write(text.as_bytes());
        e.set_ts_nsec(ts);
        e.set_caller_id(CallerId::task(5));
        e.final_commit();
    }

    #[test]
    fn text_format_has_console_timestamps() {
        let rb = PrintkRingbuffer::new(RingConfig::new(4, 5).unwrap()).unwrap();
        put(&rb, 5_000_123_456, "booted");
        put(&rb, 12_345_678_901_234, "later");

        let mut drain = Drain::new(&rb, Vec::new(), Format::Text);
        assert_eq!(drain.poll().unwrap(), 2);
        assert_eq!(drain.poll().unwrap(), 0);
        let out = String::from_utf8(drain.into_inner()).unwrap();
        assert_eq!(out, "[    5.000123] booted\n[12345.678901] later\n");
    }

    #[test]
    fn json_format_is_one_object_per_line() {
        let rb = PrintkRingbuffer::new(RingConfig::new(4, 5).unwrap()).unwrap();
        put(&rb, 1, "a \"quoted\" line");

        let mut drain = Drain::new(&rb, Vec::new(), Format::Json);
        drain.poll().unwrap();
        let out = String::from_utf8(drain.into_inner()).unwrap();
        let v: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(v["seq"], 0);
        assert_eq!(v["text"], "a \"quoted\" line");
        assert_eq!(v["truncated"], false);
    }

    #[test]
    fn overwritten_records_are_reported() {
        let rb = PrintkRingbuffer::new(RingConfig::new(2, 5).unwrap()).unwrap();
        let mut drain = Drain::new(&rb, Vec::new(), Format::Text);
        assert_eq!(drain.poll().unwrap(), 0);

        for i in 0..10 {
            put(&rb, 0, &format!("line {i}"));
        }
        assert_eq!(drain.poll().unwrap(), 4);
        assert_eq!(drain.dropped(), 6);
        let out = String::from_utf8(drain.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "** 6 printk messages dropped **");
        assert_eq!(lines[1], "[    0.000000] line 6");
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn poll_stops_after_a_batch() {
        let rb = PrintkRingbuffer::new(RingConfig::new(3, 5).unwrap()).unwrap();
        for i in 0..5 {
            put(&rb, 0, &format!("line {i}"));
        }

        let mut drain = Drain::new(&rb, Vec::new(), Format::Text).with_batch(2);
        assert_eq!(drain.poll().unwrap(), 2);
        assert_eq!(drain.poll().unwrap(), 2);
        assert_eq!(drain.poll().unwrap(), 1);
        assert_eq!(drain.poll().unwrap(), 0);
        let out = String::from_utf8(drain.into_inner()).unwrap();
        assert_eq!(out.lines().count(), 5);
        assert!(out.ends_with("line 4\n"));
    }
}
