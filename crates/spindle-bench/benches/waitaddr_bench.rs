//! Wait-address hot-path benchmarks.
//!
//! Measures the two operations that sit on every cancellation and wake
//! path: the no-sleep fast return when the value already changed, and a
//! notify with no waiters parked.

use core::sync::atomic::AtomicU32;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use spindle_core::waitaddr;

fn bench_wait_value_already_changed(c: &mut Criterion) {
    let word = AtomicU32::new(1);
    c.bench_function("wait_value_already_changed", |b| {
        b.iter(|| {
            criterion::black_box(waitaddr::wait_timeout(
                &word,
                0u32,
                Some(Duration::from_secs(1)),
            ))
        });
    });
}

fn bench_notify_all_no_waiters(c: &mut Criterion) {
    let word = AtomicU32::new(0);
    c.bench_function("notify_all_no_waiters", |b| {
        b.iter(|| {
            waitaddr::notify_all(criterion::black_box(&word));
        });
    });
}

fn bench_notify_one_no_waiters(c: &mut Criterion) {
    let word = AtomicU32::new(0);
    c.bench_function("notify_one_no_waiters", |b| {
        b.iter(|| {
            waitaddr::notify_one(criterion::black_box(&word));
        });
    });
}

criterion_group!(
    benches,
    bench_wait_value_already_changed,
    bench_notify_all_no_waiters,
    bench_notify_one_no_waiters
);
criterion_main!(benches);
