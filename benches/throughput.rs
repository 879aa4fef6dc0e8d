//! Throughput benchmarks for the reclamation strategies.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use petek::{Epoch, Hazard, Leak, Reclaim};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use std::thread;

struct Node {
    value: usize,
}

impl Node {
    fn new(value: usize) -> *mut Self {
        Box::into_raw(Box::new(Self { value }))
    }

    unsafe fn reclaim(ptr: *mut ()) {
        unsafe { drop(Box::from_raw(ptr as *mut Node)) };
    }
}

fn bench_enter_exit(c: &mut Criterion) {
    let mut group = c.benchmark_group("enter_exit");

    group.bench_function("hazard", |b| {
        b.iter(|| {
            let guard = Hazard::enter();
            black_box(&guard);
        });
    });

    group.bench_function("epoch", |b| {
        b.iter(|| {
            let guard = Epoch::enter();
            black_box(&guard);
        });
    });

    group.bench_function("leak", |b| {
        b.iter(|| {
            let guard = Leak::enter();
            black_box(&guard);
        });
    });

    group.finish();
}

fn bench_protect(c: &mut Criterion) {
    let mut group = c.benchmark_group("protect");
    let target = Node::new(42);

    group.bench_function("hazard", |b| {
        let guard = Hazard::enter();
        b.iter(|| {
            Hazard::protect(&guard, 0, black_box(target.cast()));
        });
    });

    group.bench_function("epoch", |b| {
        let guard = Epoch::enter();
        b.iter(|| {
            Epoch::protect(&guard, 0, black_box(target.cast()));
        });
    });

    group.finish();
    unsafe { drop(Box::from_raw(target)) };
}

fn bench_retire<R: Reclaim>(group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>, name: &str) {
    for batch in [64usize, 256, 1024] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new(name, batch), &batch, |b, &batch| {
            b.iter(|| {
                for i in 0..batch {
                    let node = Node::new(i);
                    unsafe { R::retire(node.cast(), Node::reclaim) };
                }
                R::quiescent();
            });
        });
    }
}

fn bench_retire_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("retire");
    bench_retire::<Hazard>(&mut group, "hazard");
    bench_retire::<Epoch>(&mut group, "epoch");
    group.finish();
}

fn bench_protected_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("protected_read");

    fn read<R: Reclaim>(slot: &AtomicPtr<Node>) -> usize {
        let guard = R::enter();
        loop {
            let ptr = slot.load(Ordering::Acquire);
            R::protect(&guard, 0, ptr.cast());
            if slot.load(Ordering::Acquire) != ptr {
                continue;
            }
            return unsafe { (*ptr).value };
        }
    }

    for threads in [1usize, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("hazard", threads),
            &threads,
            |b, &threads| {
                let slot = Arc::new(AtomicPtr::new(Node::new(1)));
                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let slot = slot.clone();
                            thread::spawn(move || {
                                for _ in 0..1_000 {
                                    black_box(read::<Hazard>(&slot));
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
                let old = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
                unsafe { drop(Box::from_raw(old)) };
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enter_exit,
    bench_protect,
    bench_retire_all,
    bench_protected_read
);
criterion_main!(benches);
