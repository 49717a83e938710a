//! End-to-end two-process integration test for the many-to-one ring
//! buffer over a memory-mapped file.
//!
//! The same test executable is re-invoked with an environment-variable
//! role switch so a producer process and a consumer process run
//! **concurrently** against one mapped region:
//!
//! ```text
//!                     Time -->
//!
//! [PRODUCER] --[create region]--[write messages...]----------[done]
//!                    |               |   |   |
//!                    v               v   v   v
//!               [mmap file]      (concurrent drain)
//!                    |               ^   ^   ^
//!                    v               |   |   |
//! [CONSUMER] -------[open]-------[read messages...]----------[done]
//! ```
//!
//! Running both sides in separate OS processes (not threads) exercises
//! the layout as a real shared-memory contract: the consumer sees only
//! what the release stores publish into the mapping.
//!
//! ```bash
//! cargo test -p basalt-rings --test e2e_mmap -- --nocapture
//! ```

use basalt_buf::AtomicBuffer;
use basalt_rings::descriptor::ring_buffer::TRAILER_LENGTH;
use basalt_rings::ManyToOneRingBuffer;
use std::env;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Writes to stderr with immediate flush to bypass test output capture.
macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const ENV_ROLE: &str = "BASALT_E2E_ROLE";
const ENV_PATH: &str = "BASALT_E2E_PATH";

const ROLE_PRODUCER: &str = "producer";
const ROLE_CONSUMER: &str = "consumer";

const MSG_TYPE_ID: i32 = 7;
const MESSAGE_COUNT: i64 = 100_000;

/// Data-region capacity. Small enough that the producer regularly runs
/// out of space and has to wait on the consumer, exercising the head
/// cache refresh and wrap paths.
const RING_CAPACITY: usize = 1 << 14;

fn test_path() -> String {
    format!("/tmp/basalt_e2e_ring_{}", std::process::id())
}

/// Producer child process: creates the region and writes sequenced
/// messages, spinning whenever the ring is full.
fn run_producer(path: &str) {
    log!("[PRODUCER] Creating ring at {path} (capacity {RING_CAPACITY})");

    let buffer = AtomicBuffer::map_create(path, RING_CAPACITY + TRAILER_LENGTH)
        .expect("producer: failed to create region");
    let ring = ManyToOneRingBuffer::new(buffer).expect("producer: invalid region");

    let start = Instant::now();
    let mut full_spins = 0u64;

    for sequence in 0..MESSAGE_COUNT {
        loop {
            if ring
                .write(MSG_TYPE_ID, &sequence.to_ne_bytes())
                .expect("producer: write failed")
            {
                break;
            }

            full_spins += 1;
            std::hint::spin_loop();
        }
    }

    let elapsed = start.elapsed();
    let rate = MESSAGE_COUNT as f64 / elapsed.as_secs_f64();
    log!("[PRODUCER] Done: {MESSAGE_COUNT} messages in {elapsed:?} ({rate:.0} msg/s)");
    log!("[PRODUCER] Ring-full spins: {full_spins}");
}

/// Consumer child process: opens the region once the producer has
/// created it and drains until every message has arrived in order.
fn run_consumer(path: &str) {
    log!("[CONSUMER] Waiting for ring at {path}");

    let open_deadline = Instant::now() + Duration::from_secs(5);
    let ring = loop {
        // The file may not exist yet, or may be mapped before the
        // producer has sized it; both resolve on retry.
        let attempt = AtomicBuffer::map_open(path)
            .ok()
            .and_then(|buffer| ManyToOneRingBuffer::new(buffer).ok());

        match attempt {
            Some(ring) => break ring,
            None if Instant::now() < open_deadline => {
                std::thread::sleep(Duration::from_millis(1));
            }
            None => panic!("[CONSUMER] failed to open ring at {path}"),
        }
    };

    log!("[CONSUMER] Ring opened, draining...");

    let read_deadline = Instant::now() + Duration::from_secs(30);
    let start = Instant::now();
    let mut expected = 0i64;

    while expected < MESSAGE_COUNT {
        assert!(
            Instant::now() < read_deadline,
            "[CONSUMER] timed out at sequence {expected}"
        );

        let count = ring.read(|type_id, buffer, index, length| {
            assert_eq!(type_id, MSG_TYPE_ID);
            assert_eq!(length, 8);
            // One producer process: arrival order is write order.
            assert_eq!(buffer.get_i64(index), expected);
            expected += 1;
        });

        if count == 0 {
            std::hint::spin_loop();
        } else if expected % 25_000 < count as i64 {
            let rate = expected as f64 / start.elapsed().as_secs_f64();
            log!("[CONSUMER] Progress: {expected}/{MESSAGE_COUNT} ({rate:.0} msg/s)");
        }
    }

    assert_eq!(ring.read(|_, _, _, _| panic!("phantom message")), 0);
    assert_eq!(ring.consumer_position(), ring.producer_position());

    let elapsed = start.elapsed();
    log!("[CONSUMER] Done: {expected} messages in {elapsed:?}");
}

/// Two-process concurrent end-to-end test over a mapped region.
///
/// Validates that the record layout, trailer counters and release/acquire
/// protocol hold up as a cross-process contract, not just between
/// threads.
#[test]
fn e2e_two_process_mmap_ring() {
    if let Ok(role) = env::var(ENV_ROLE) {
        let path = env::var(ENV_PATH).expect("role set without path");
        match role.as_str() {
            ROLE_PRODUCER => run_producer(&path),
            ROLE_CONSUMER => run_consumer(&path),
            other => panic!("unknown role: {other}"),
        }
        return;
    }

    let path = test_path();
    let exe = env::current_exe().expect("current executable path");

    log!("[ORCHESTRATOR] Spawning producer and consumer for {path}");

    let mut producer = Command::new(&exe)
        .arg("--exact")
        .arg("e2e_two_process_mmap_ring")
        .env(ENV_ROLE, ROLE_PRODUCER)
        .env(ENV_PATH, &path)
        .stderr(Stdio::inherit())
        .spawn()
        .expect("spawn producer");

    // The consumer retries until the producer has created the file.
    std::thread::sleep(Duration::from_millis(5));

    let mut consumer = Command::new(&exe)
        .arg("--exact")
        .arg("e2e_two_process_mmap_ring")
        .env(ENV_ROLE, ROLE_CONSUMER)
        .env(ENV_PATH, &path)
        .stderr(Stdio::inherit())
        .spawn()
        .expect("spawn consumer");

    let producer_status = producer.wait().expect("wait for producer");
    let consumer_status = consumer.wait().expect("wait for consumer");

    let _ = std::fs::remove_file(&path);

    assert!(producer_status.success(), "producer failed: {producer_status}");
    assert!(consumer_status.success(), "consumer failed: {consumer_status}");

    log!("[ORCHESTRATOR] Two-process ring test passed");
}
