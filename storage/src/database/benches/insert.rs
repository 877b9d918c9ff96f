use super::{get_database, get_random_kvs};
use criterion::{criterion_group, Criterion};
use std::time::{Duration, Instant};

/// Number of items inserted per iteration.
const ITEMS: usize = 10_000;

fn bench_insert(c: &mut Criterion) {
    let kvs = get_random_kvs(ITEMS);
    for batch in [1, 16, 256, ITEMS] {
        c.bench_function(
            &format!("{}/items={} batch={}", module_path!(), ITEMS, batch),
            |b| {
                b.iter_custom(|iters| {
                    let mut duration = Duration::ZERO;
                    for _ in 0..iters {
                        let database = get_database();
                        let start = Instant::now();
                        for chunk in kvs.chunks(batch) {
                            database.insert_range(chunk).unwrap();
                        }
                        duration += start.elapsed();
                        database.close().unwrap();
                    }
                    duration
                });
            },
        );
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_insert
}
