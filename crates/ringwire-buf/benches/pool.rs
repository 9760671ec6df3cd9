//! Pool acquire/release hot-path benchmarks.

use criterion::{criterion_group, criterion_main, Criterion};
use ringwire_buf::{BlockingPool, BufPool};

fn bench_lockfree_cycle(c: &mut Criterion) {
    let pool = BufPool::new(1024, 4096).unwrap();
    c.bench_function("lockfree_acquire_release", |b| {
        b.iter(|| {
            let buf = pool.acquire().unwrap().unwrap();
            pool.release(buf).unwrap();
        })
    });
}

fn bench_blocking_cycle(c: &mut Criterion) {
    let pool = BlockingPool::new(1024, 4096).unwrap();
    c.bench_function("blocking_acquire_release", |b| {
        b.iter(|| {
            let buf = pool.acquire().unwrap();
            pool.release(buf).unwrap();
        })
    });
}

fn bench_retain_release(c: &mut Criterion) {
    let pool = BufPool::new(1024, 4096).unwrap();
    let buf = pool.acquire().unwrap().unwrap();
    c.bench_function("retain_release", |b| {
        b.iter(|| {
            let r = pool.retain(&buf);
            pool.release_retained(r).unwrap();
        })
    });
    pool.release(buf).unwrap();
}

criterion_group!(
    benches,
    bench_lockfree_cycle,
    bench_blocking_cycle,
    bench_retain_release
);
criterion_main!(benches);
