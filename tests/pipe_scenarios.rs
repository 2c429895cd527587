//! End-to-end pipe scenarios: publication batching, retraction, sleep
//! signalling, chunk churn, and a concurrent stress run.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use chunkpipe::{Pipe, blocking};
use rand::Rng;

// ============================================================================
// Batching and retraction
// ============================================================================

#[test]
fn unwrite_retracts_everything_unflushed() {
    let (mut tx, mut rx) = Pipe::<i32>::new();

    for i in 0..1024 {
        tx.write(i, true);
    }
    // Nothing published, nothing visible.
    assert_eq!(rx.read(), None);

    // The incomplete tail comes back in reverse write order.
    for expected in (512..1024).rev() {
        assert_eq!(tx.unwrite(), Some(expected));
        assert_eq!(rx.read(), None);
    }

    // The survivors publish together with the write that completes them.
    tx.write(-1, false);
    tx.flush();
    for expected in 0..512 {
        assert_eq!(rx.read(), Some(expected));
    }
    assert_eq!(rx.read(), Some(-1));
    assert_eq!(rx.read(), None);
}

#[test]
fn retracted_value_is_never_observed() {
    let (mut tx, mut rx) = Pipe::<char>::new();

    tx.write('X', false);
    tx.flush();
    tx.write('Y', true);
    assert_eq!(tx.unwrite(), Some('Y'));
    assert!(tx.flush(), "nothing new since Y was retracted");

    assert_eq!(rx.read(), Some('X'));
    assert_eq!(rx.read(), None);
}

// ============================================================================
// Sleep signalling
// ============================================================================

#[test]
fn flush_reports_sleeping_reader() {
    let (mut tx, mut rx) = Pipe::<&str>::new();

    tx.write("A", false);
    assert!(tx.flush(), "reader has not polled yet");
    assert_eq!(rx.read(), Some("A"));
    assert_eq!(rx.read(), None); // reader sleeps here

    tx.write("B", false);
    assert!(!tx.flush(), "reader slept since the previous flush");
    assert_eq!(rx.read(), Some("B"));
}

#[test]
fn every_sleep_is_reported_exactly_once() {
    let (mut tx, mut rx) = Pipe::<u32>::new();

    for round in 0..100 {
        tx.write(round, false);
        let awake = tx.flush();
        if round == 0 {
            assert!(awake, "reader never slept before the first flush");
        } else {
            assert!(!awake, "reader drained and slept after round {round}");
        }
        assert_eq!(rx.read(), Some(round));
        assert_eq!(rx.read(), None);
    }
}

// ============================================================================
// Chunk churn
// ============================================================================

#[test]
fn small_chunks_recycle_through_the_pool() {
    let (mut tx, mut rx) = Pipe::<u32, 4, 2>::new();

    for i in 0..10 {
        tx.write(i, false);
        tx.flush();
    }
    for i in 0..10 {
        assert_eq!(rx.read(), Some(i));
    }
    assert_eq!(rx.read(), None);

    // 10 writes on 4-slot chunks grew the list twice past the initial
    // chunk, and the consumer retired the first chunk along the way.
    let stats = rx.pool_stats();
    assert_eq!(stats.hits + stats.misses, 3, "three chunks ever existed");
    assert_eq!(stats.spills, 0, "retired chunks fit the cache");

    // Steady-state churn after warm-up is pure reuse.
    let before = rx.pool_stats();
    for i in 0..40 {
        tx.write(i, false);
        tx.flush();
        assert_eq!(rx.read(), Some(i));
    }
    assert_eq!(rx.pool_stats().misses, before.misses);
}

#[test]
fn frontier_tokens_survive_chunk_growth() {
    // Flush only once at the end: the frontier recorded at the first
    // write must still be meaningful after the list grew many chunks.
    let (mut tx, mut rx) = Pipe::<u64, 4, 2>::new();
    for i in 0..64 {
        tx.write(i, false);
    }
    tx.flush();
    for i in 0..64 {
        assert_eq!(rx.read(), Some(i));
    }
    assert_eq!(rx.read(), None);
}

// ============================================================================
// Pool cache-size branches
// ============================================================================

#[test]
fn uncached_pool_still_serves_the_pipe() {
    let (mut tx, mut rx) = Pipe::<u32, 2, 0>::new();
    for i in 0..50 {
        tx.write(i, false);
        tx.flush();
        assert_eq!(rx.read(), Some(i));
    }
    let stats = rx.pool_stats();
    assert_eq!(stats.hits, 0, "S = 0 never caches");
    assert_eq!(stats.misses, stats.spills + 1, "all but the live chunk spilled");
}

#[test]
fn large_cache_absorbs_deep_backlogs() {
    let (mut tx, mut rx) = Pipe::<u32, 2, 64>::new();
    for i in 0..100 {
        tx.write(i, false);
    }
    tx.flush();
    for i in 0..100 {
        assert_eq!(rx.read(), Some(i));
    }
    // 50 chunks retired into a 64-slot cache: nothing spilled, and a
    // second backlog is served entirely from cache.
    assert_eq!(rx.pool_stats().spills, 0);
    let misses_after_first = rx.pool_stats().misses;
    for i in 0..100 {
        tx.write(i, false);
    }
    tx.flush();
    for i in 0..100 {
        assert_eq!(rx.read(), Some(i));
    }
    assert_eq!(rx.pool_stats().misses, misses_after_first);
}

// ============================================================================
// Concurrent stress
// ============================================================================

#[test]
fn concurrent_fifo_with_random_stalls() {
    const COUNT: u64 = 1_000_000;
    let (mut tx, mut rx) = Pipe::<u64, 128, 2>::new();

    let producer = thread::spawn(move || {
        let mut rng = rand::rng();
        let mut next = 0u64;
        while next < COUNT {
            let burst = rng.random_range(1..=64).min(COUNT - next);
            for _ in 0..burst {
                tx.write(next, false);
                next += 1;
            }
            tx.flush();
            if rng.random_range(0..1000) == 0 {
                thread::sleep(Duration::from_micros(rng.random_range(1..50)));
            }
        }
    });

    let consumer = thread::spawn(move || {
        let mut rng = rand::rng();
        let mut expected = 0u64;
        while expected < COUNT {
            match rx.read() {
                Some(value) => {
                    assert_eq!(value, expected, "values must arrive in write order");
                    expected += 1;
                }
                None => {
                    if rng.random_range(0..100) == 0 {
                        thread::sleep(Duration::from_micros(rng.random_range(1..20)));
                    } else {
                        thread::yield_now();
                    }
                }
            }
        }
        assert_eq!(rx.read(), None);
    });

    producer.join().unwrap();
    consumer.join().unwrap();
}

#[test]
fn concurrent_blocking_channel_delivers_everything() {
    const COUNT: u32 = 200_000;
    let (mut tx, mut rx) = blocking::channel::<u32, 64, 2>();

    let producer = thread::spawn(move || {
        for i in 0..COUNT {
            tx.send(i).unwrap();
        }
    });

    let mut received = 0u32;
    while let Some(value) = rx.recv() {
        assert_eq!(value, received);
        received += 1;
    }
    assert_eq!(received, COUNT);
    producer.join().unwrap();
}

// ============================================================================
// Teardown accounting
// ============================================================================

#[test]
fn dropping_the_pipe_drops_every_live_element() {
    let live = Arc::new(AtomicUsize::new(0));

    struct Tracked(Arc<AtomicUsize>);
    impl Tracked {
        fn new(live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::Relaxed);
            Self(Arc::clone(live))
        }
    }
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::Relaxed);
        }
    }

    {
        let (mut tx, mut rx) = Pipe::<Tracked, 8, 1>::new();
        for _ in 0..20 {
            tx.write(Tracked::new(&live), false);
        }
        tx.flush();
        for _ in 0..5 {
            tx.write(Tracked::new(&live), true); // never published
        }
        for _ in 0..7 {
            assert!(rx.read().is_some());
        }
        assert_eq!(live.load(Ordering::Relaxed), 18);
    }
    assert_eq!(live.load(Ordering::Relaxed), 0, "teardown leaked elements");
}
