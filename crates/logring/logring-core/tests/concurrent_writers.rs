//! Concurrent writers and a live reader sharing one ring buffer.
//!
//! Writers race for descriptors and text space on a deliberately small ring,
//! so the tail is pushed constantly and blocks wrap many times. Every writer
//! stamps its text with the sequence number it was given, which lets the
//! reader verify that a validated record really is the record it claims to
//! be.
//!
//! ```bash
//! cargo test -p logring-core --test concurrent_writers -- --nocapture
//! ```

use logring_core::{
    CallerId, PrintkRingbuffer, Reader, RecordBuf, ReserveError, RingConfig,
};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const WRITERS: u32 = 4;
const RECORDS_PER_WRITER: u64 = 20_000;

/// 64 descriptors sharing 2 KiB of text.
const DESC_BITS: u32 = 6;
const AVG_TEXT_BITS: u32 = 5;

/// What one writer saw: every sequence number it was handed, and how often
/// it could not get a descriptor at all.
struct WriterLog {
    seqs: Vec<u64>,
    no_desc: u64,
    no_text: u64,
}

fn stamp(seq: u64, writer: u32, i: u64) -> String {
    // Variable length so blocks wrap at different offsets.
    let pad = (i % 23) as usize;
    format!("{seq}:{writer}:{i}:{}", "x".repeat(pad))
}

fn parse_stamp(text: &[u8]) -> Option<(u64, u32, u64)> {
    let text = std::str::from_utf8(text).ok()?;
    let mut parts = text.split(':');
    let seq = parts.next()?.parse().ok()?;
    let writer = parts.next()?.parse().ok()?;
    let i = parts.next()?.parse().ok()?;
    Some((seq, writer, i))
}

fn run_writer(rb: &PrintkRingbuffer, writer: u32) -> WriterLog {
    let mut log = WriterLog {
        seqs: Vec::with_capacity(RECORDS_PER_WRITER as usize),
        no_desc: 0,
        no_text: 0,
    };
    let mut i = 0;
    while i < RECORDS_PER_WRITER {
        // The seq is not known before reserving, reserve for the longest stamp.
        let cap = stamp(u64::MAX, writer, i).len();
        match rb.reserve(cap) {
            Ok(mut e) => {
                let text = stamp(e.seq(), writer, i);
                e.write(text.as_bytes());
                e.set_caller_id(CallerId::task(writer));
                log.seqs.push(e.seq());
                e.final_commit();
                i += 1;
            }
            Err(ReserveError::NoTextSpace { seq }) => {
                log.seqs.push(seq);
                log.no_text += 1;
            }
            Err(ReserveError::NoDescriptor) => {
                log.no_desc += 1;
                thread::yield_now();
            }
            Err(e) => panic!("writer {writer}: unexpected reserve error: {e}"),
        }
    }
    log
}

#[test]
fn concurrent_writers_get_unique_gapless_sequence_numbers() {
    let rb = PrintkRingbuffer::new(RingConfig::new(DESC_BITS, AVG_TEXT_BITS).unwrap()).unwrap();
    let start = Instant::now();

    let logs: Vec<WriterLog> = thread::scope(|s| {
        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let rb = &rb;
                s.spawn(move || run_writer(rb, w))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seqs: Vec<u64> = logs.iter().flat_map(|l| l.seqs.iter().copied()).collect();
    seqs.sort_unstable();
    let total = seqs.len() as u64;
    for (expected, seq) in seqs.iter().enumerate() {
        assert_eq!(*seq, expected as u64, "sequence numbers must be unique and gapless");
    }

    // Every writer's own sequence numbers only grow.
    for log in &logs {
        assert!(log.seqs.windows(2).all(|w| w[0] < w[1]));
    }

    assert_eq!(rb.next_reserve_seq(), total);
    assert_eq!(rb.next_seq(), total);
    assert_eq!(rb.fail_count(), logs.iter().map(|l| l.no_desc).sum::<u64>());

    log!(
        "[TEST] {total} seqs in {:?} ({} without text, {} descriptor failures)",
        start.elapsed(),
        logs.iter().map(|l| l.no_text).sum::<u64>(),
        rb.fail_count()
    );
}

#[test]
fn live_reader_only_sees_consistent_records() {
    let rb = PrintkRingbuffer::new(RingConfig::new(DESC_BITS, AVG_TEXT_BITS).unwrap()).unwrap();
    let done = AtomicBool::new(false);

    let (read, dropped) = thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut reader = Reader::new(&rb, 64);
            let mut last_seq = None;
            let mut read = 0u64;
            let deadline = Instant::now() + Duration::from_secs(30);

            loop {
                let finished = done.load(Ordering::Acquire);
                let Some(record) = reader.try_read() else {
                    if finished {
                        break;
                    }
                    assert!(Instant::now() < deadline, "reader timed out");
                    thread::yield_now();
                    continue;
                };

                let info = record.info();
                let (seq, writer, _) = parse_stamp(record.text())
                    .unwrap_or_else(|| panic!("torn record {:?}", record.text()));
                assert_eq!(seq, info.seq, "text belongs to another record");
                assert_eq!(info.caller_id, CallerId::task(writer));
                if let Some(last) = last_seq {
                    assert!(info.seq > last, "sequence went backwards");
                }
                last_seq = Some(info.seq);
                read += 1;
            }
            (read, reader.dropped())
        });

        for w in 0..WRITERS {
            let rb = &rb;
            s.spawn(move || run_writer(rb, w));
        }
        // Writers are joined when the scope ends; signal the reader from a
        // thread that waits for them.
        s.spawn(|| {
            while rb.next_reserve_seq() < WRITERS as u64 * RECORDS_PER_WRITER {
                thread::yield_now();
            }
            done.store(true, Ordering::Release);
        });

        reader.join().unwrap()
    });

    log!("[TEST] reader saw {read} records, {dropped} skipped");
    assert!(read > 0);

    // Whatever is still in the ring reads back consistently.
    let mut buf = RecordBuf::new(64);
    let mut seq = rb.first_valid_seq();
    while rb.read_valid(&mut seq, &mut buf) {
        let (stamped, _, _) = parse_stamp(buf.text()).unwrap();
        assert_eq!(stamped, seq);
        seq += 1;
    }
    assert_eq!(seq, rb.next_seq());
}
