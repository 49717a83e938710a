use basalt_buf::AtomicBuffer;
use basalt_rings::descriptor::{broadcast_buffer, ring_buffer};
use basalt_rings::{BroadcastReceiver, BroadcastTransmitter, ManyToOneRingBuffer, OneToOneRingBuffer};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

const MSG_TYPE_ID: i32 = 7;
const CAPACITY: usize = 1 << 16;
const PAYLOAD: [u8; 32] = [0xA5; 32];

fn bench_spsc_cycle(c: &mut Criterion) {
    let buffer = AtomicBuffer::allocate(CAPACITY + ring_buffer::TRAILER_LENGTH).unwrap();
    let ring = OneToOneRingBuffer::new(buffer).unwrap();

    let mut group = c.benchmark_group("spsc");
    group.throughput(Throughput::Elements(1));

    group.bench_function("write_read_cycle", |b| {
        b.iter(|| {
            assert!(ring.write(MSG_TYPE_ID, black_box(&PAYLOAD)).unwrap());
            let count = ring.read(|_, buffer, index, _| {
                black_box(buffer.get_i64(index));
            });
            black_box(count)
        });
    });

    group.bench_function("try_claim_commit_cycle", |b| {
        b.iter(|| {
            let index = ring.try_claim(MSG_TYPE_ID, 32).unwrap().unwrap();
            ring.buffer().put_i64(index, 42);
            ring.commit(index).unwrap();
            let count = ring.read(|_, buffer, index, _| {
                black_box(buffer.get_i64(index));
            });
            black_box(count)
        });
    });

    group.finish();
}

fn bench_mpsc_cycle(c: &mut Criterion) {
    let buffer = AtomicBuffer::allocate(CAPACITY + ring_buffer::TRAILER_LENGTH).unwrap();
    let ring = ManyToOneRingBuffer::new(buffer).unwrap();

    let mut group = c.benchmark_group("mpsc");
    group.throughput(Throughput::Elements(1));

    group.bench_function("write_read_cycle", |b| {
        b.iter(|| {
            assert!(ring.write(MSG_TYPE_ID, black_box(&PAYLOAD)).unwrap());
            let count = ring.read(|_, buffer, index, _| {
                black_box(buffer.get_i64(index));
            });
            black_box(count)
        });
    });

    group.finish();
}

fn bench_broadcast(c: &mut Criterion) {
    let path = format!("/tmp/basalt_bench_bcast_{}", std::process::id());
    let tx_buffer =
        AtomicBuffer::map_create(&path, CAPACITY + broadcast_buffer::TRAILER_LENGTH).unwrap();
    let rx_buffer = AtomicBuffer::map_open(&path).unwrap();

    let mut transmitter = BroadcastTransmitter::new(tx_buffer).unwrap();
    let mut receiver = BroadcastReceiver::new(rx_buffer).unwrap();

    let mut group = c.benchmark_group("broadcast");
    group.throughput(Throughput::Elements(1));

    group.bench_function("transmit", |b| {
        b.iter(|| transmitter.transmit(MSG_TYPE_ID, black_box(&PAYLOAD)).unwrap());
    });

    group.bench_function("transmit_receive_cycle", |b| {
        b.iter(|| {
            transmitter.transmit(MSG_TYPE_ID, black_box(&PAYLOAD)).unwrap();
            while receiver.receive_next() {
                black_box(receiver.length());
            }
        });
    });

    group.finish();

    drop(transmitter);
    drop(receiver);
    let _ = std::fs::remove_file(&path);
}

criterion_group!(benches, bench_spsc_cycle, bench_mpsc_cycle, bench_broadcast);
criterion_main!(benches);
