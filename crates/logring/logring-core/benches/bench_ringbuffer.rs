use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use logring_core::{CallerId, PrintkRingbuffer, Reader, RecordBuf, RingConfig};

const LINE: &[u8] = b"usb 1-1: new high-speed USB device number 2 using xhci_hcd";

fn ring(desc_bits: u32) -> PrintkRingbuffer {
    PrintkRingbuffer::new(RingConfig::new(desc_bits, 5).expect("bad geometry"))
        .expect("failed to create ring")
}

fn bench_reserve_commit(c: &mut Criterion) {
    let rb = ring(15);

    let mut group = c.benchmark_group("ringbuffer");
    group.throughput(Throughput::Elements(1));

    group.bench_function("reserve + final_commit", |b| {
        b.iter(|| {
            let mut e = rb.reserve(LINE.len()).expect("reserve failed");
            e.write(black_box(LINE));
            e.final_commit();
        });
    });

    group.bench_function("reserve_in_last (cont)", |b| {
        let caller = CallerId::task(1);
        b.iter(|| {
            let mut e = match rb.reserve_in_last(8, caller, 1024) {
                Ok(e) => e,
                Err(_) => {
                    let mut e = rb.reserve(8).expect("reserve failed");
                    e.set_caller_id(caller);
                    e
                }
            };
            e.write(black_box(b"cont ..."));
            e.commit();
        });
    });

    group.finish();
}

fn bench_read_valid(c: &mut Criterion) {
    let rb = ring(15);
    let mut buf = RecordBuf::new(1024);

    let mut group = c.benchmark_group("ringbuffer");
    group.throughput(Throughput::Elements(1));

    group.bench_function("read_valid (data)", |b| {
        b.iter_custom(|iters| {
            let mut seq = rb.next_seq();
            for _ in 0..iters {
                let mut e = rb.reserve(LINE.len()).expect("reserve failed");
                e.write(LINE);
                e.final_commit();
            }
            let start = std::time::Instant::now();
            for _ in 0..iters {
                black_box(rb.read_valid(&mut seq, &mut buf));
                seq += 1;
            }
            start.elapsed()
        });
    });

    group.bench_function("read_valid (empty)", |b| {
        b.iter(|| {
            let mut seq = rb.next_reserve_seq();
            black_box(rb.read_valid(&mut seq, &mut buf))
        });
    });

    group.finish();
}

fn bench_round_trip_capacities(c: &mut Criterion) {
    let mut group = c.benchmark_group("ringbuffer_capacity");
    group.throughput(Throughput::Elements(1));

    for &bits in &[8u32, 12, 16] {
        let rb = ring(bits);
        let mut reader = Reader::tail_follow(&rb, 1024);

        group.bench_function(format!("round_trip_descs_{}", 1u32 << bits), |b| {
            b.iter(|| {
                let mut e = rb.reserve(LINE.len()).expect("reserve failed");
                e.write(LINE);
                e.final_commit();
                black_box(reader.try_read().map(|r| r.info().seq));
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_reserve_commit,
    bench_read_valid,
    bench_round_trip_capacities,
);
criterion_main!(benches);
