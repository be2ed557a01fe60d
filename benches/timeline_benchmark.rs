use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use qnetsim::simulation::{EventPayload, Timeline, SECOND};

fn benchmark_event_scheduling(c: &mut Criterion) {
    let mut group = c.benchmark_group("Timeline");

    for size in [100, 1_000, 10_000, 100_000].iter() {
        group.bench_with_input(BenchmarkId::new("Insert", size), size, |b, &size| {
            b.iter(|| {
                let mut tl = Timeline::new(SECOND, 0);
                for i in 0..size {
                    let id = tl.schedule(
                        (i as u64) * 1_000,
                        EventPayload::MemoryExpire {
                            node: i % 10,
                            index: i % 4,
                        },
                    );
                    black_box(id);
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("Insert+Drain", size), size, |b, &size| {
            b.iter(|| {
                let mut tl = Timeline::new(SECOND, 0);
                for i in 0..size {
                    tl.schedule(
                        (i as u64) * 1_000,
                        EventPayload::MemoryExpire {
                            node: i % 10,
                            index: i % 4,
                        },
                    );
                }
                while let Some(event) = tl.pop_next() {
                    tl.advance_to(event.time);
                    black_box(event);
                }
            });
        });

        group.bench_with_input(
            BenchmarkId::new("Insert+CancelHalf+Drain", size),
            size,
            |b, &size| {
                b.iter(|| {
                    let mut tl = Timeline::new(SECOND, 0);
                    let mut ids = Vec::with_capacity(size);
                    for i in 0..size {
                        ids.push(tl.schedule(
                            (i as u64) * 1_000,
                            EventPayload::MemoryExpire {
                                node: i % 10,
                                index: i % 4,
                            },
                        ));
                    }
                    for id in ids.iter().step_by(2) {
                        tl.cancel(*id);
                    }
                    while let Some(event) = tl.pop_next() {
                        tl.advance_to(event.time);
                        black_box(event);
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_event_scheduling);
criterion_main!(benches);
