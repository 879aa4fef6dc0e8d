//! Stress tests: linearizability under contention, shutdown draining and
//! reclamation progress across the strategies.

use petek::Reclaim;
use petek_queue::MpmcQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Producers push `(producer_id, seq)` and the last one to finish closes
/// the queue; consumers drain until they observe closed-and-empty.
///
/// Returns every consumer's view in consumption order.
fn run_stress<R: Reclaim + 'static>(
    producers: usize,
    consumers: usize,
    items_per_producer: usize,
    quiescent_every: Option<usize>,
) -> Vec<Vec<(usize, usize)>> {
    let queue: Arc<MpmcQueue<(usize, usize), R>> = Arc::new(MpmcQueue::new());
    let finished = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    for producer in 0..producers {
        let queue = queue.clone();
        let finished = finished.clone();
        handles.push(thread::spawn(move || {
            for seq in 0..items_per_producer {
                assert!(queue.enqueue((producer, seq)), "closed before all writes");
            }
            if finished.fetch_add(1, Ordering::AcqRel) + 1 == producers {
                queue.close();
            }
        }));
    }

    let mut consumer_handles = vec![];
    for _ in 0..consumers {
        let queue = queue.clone();
        consumer_handles.push(thread::spawn(move || {
            let mut seen = Vec::new();
            let mut ops = 0usize;
            loop {
                match queue.try_dequeue() {
                    Some(item) => {
                        seen.push(item);
                        ops += 1;
                        if let Some(interval) = quiescent_every {
                            if ops % interval == 0 {
                                queue.quiescent();
                            }
                        }
                    }
                    None => {
                        if queue.is_closed() {
                            // A failed dequeue races the close; only an
                            // empty observation made after seeing closed
                            // proves the queue is drained.
                            match queue.try_dequeue() {
                                Some(item) => seen.push(item),
                                None => break,
                            }
                        } else {
                            thread::yield_now();
                        }
                    }
                }
            }
            queue.quiescent();
            seen
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
    consumer_handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect()
}

/// Exactly-once delivery and per-producer FIFO over all consumer views.
fn verify(views: &[Vec<(usize, usize)>], producers: usize, items_per_producer: usize) {
    let total: usize = views.iter().map(Vec::len).sum();
    assert_eq!(
        total,
        producers * items_per_producer,
        "lost or duplicated items"
    );

    let mut seen = vec![vec![false; items_per_producer]; producers];
    for view in views {
        let mut last_seq = vec![None::<usize>; producers];
        for &(producer, seq) in view {
            // Per-producer order within one consumer is strictly increasing.
            if let Some(last) = last_seq[producer] {
                assert!(
                    seq > last,
                    "producer {producer} reordered: {seq} after {last}"
                );
            }
            last_seq[producer] = Some(seq);
            assert!(!seen[producer][seq], "duplicate ({producer}, {seq})");
            seen[producer][seq] = true;
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_linearizability_hazard() {
    const P: usize = 8;
    const C: usize = 8;
    const K: usize = 25_000;

    let views = run_stress::<petek::Hazard>(P, C, K, None);
    verify(&views, P, K);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_linearizability_epoch() {
    const P: usize = 8;
    const C: usize = 8;
    const K: usize = 25_000;

    let views = run_stress::<petek::Epoch>(P, C, K, Some(64));
    verify(&views, P, K);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_linearizability_leak() {
    const P: usize = 4;
    const C: usize = 4;
    const K: usize = 10_000;

    let views = run_stress::<petek::Leak>(P, C, K, None);
    verify(&views, P, K);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_oversubscribed_producers() {
    let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let producers = cores * 2;
    const K: usize = 5_000;

    let views = run_stress::<petek::Hazard>(producers, 2, K, None);
    verify(&views, producers, K);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_epoch_reclamation_makes_progress() {
    const K: usize = 200_000;
    const QUIESCENT_EVERY: usize = 64;

    let queue: Arc<MpmcQueue<(usize, usize), petek::Epoch>> = Arc::new(MpmcQueue::new());

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            for seq in 0..K {
                queue.enqueue((0, seq));
            }
            queue.close();
        })
    };

    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || {
            let mut ops = 0usize;
            let mut max_pending = 0usize;
            let mut count = 0usize;
            loop {
                match queue.try_dequeue() {
                    Some(_) => {
                        count += 1;
                        ops += 1;
                        if ops % QUIESCENT_EVERY == 0 {
                            queue.quiescent();
                            max_pending = max_pending.max(petek::stats::epoch_pending());
                        }
                    }
                    None => {
                        if queue.is_closed() {
                            // Authoritative only after observing closed.
                            match queue.try_dequeue() {
                                Some(_) => count += 1,
                                None => break,
                            }
                        } else {
                            thread::yield_now();
                        }
                    }
                }
            }
            // Retired buckets must stay bounded, not track the op count.
            assert!(
                max_pending < 16_384,
                "epoch reclamation stalled: {max_pending} pending"
            );
            // After the producer is gone, a few rounds drain the rest.
            for _ in 0..64 {
                queue.quiescent();
                if petek::stats::epoch_pending() == 0 {
                    break;
                }
                thread::yield_now();
            }
            assert!(petek::stats::epoch_pending() < 4_096);
            count
        })
    };

    producer.join().unwrap();
    assert_eq!(consumer.join().unwrap(), K);
}

#[test]
fn test_immediate_drop_without_concurrency() {
    // The negative-control strategy frees at retirement; with a single
    // thread there is no reader to be hurt and the queue behaves normally.
    let queue: MpmcQueue<u64, petek::ImmediateDrop> = MpmcQueue::new();
    for i in 0..1_000 {
        queue.enqueue(i);
    }
    for i in 0..1_000 {
        assert_eq!(queue.try_dequeue(), Some(i));
    }
    assert_eq!(queue.try_dequeue(), None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_close_race_loses_nothing() {
    // Producers race close(): enqueues may fail, but everything that
    // reported success must come out.
    const P: usize = 4;
    const K: usize = 10_000;

    let queue: Arc<MpmcQueue<usize, petek::Hazard>> = Arc::new(MpmcQueue::new());
    let accepted = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    for producer in 0..P {
        let queue = queue.clone();
        let accepted = accepted.clone();
        handles.push(thread::spawn(move || {
            for seq in 0..K {
                if producer == 0 && seq == K / 2 {
                    queue.close();
                }
                if queue.enqueue(producer * K + seq) {
                    accepted.fetch_add(1, Ordering::AcqRel);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut drained = 0usize;
    while queue.try_dequeue().is_some() {
        drained += 1;
    }
    assert_eq!(drained, accepted.load(Ordering::Acquire));
}
