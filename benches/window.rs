#![deny(warnings)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use circuitry::{SlidingWindow, State};

fn window() -> SlidingWindow {
    SlidingWindow::new(
        Arc::from("bench"),
        10,
        Duration::from_millis(100),
        Duration::from_secs(1),
        Duration::from_millis(50),
        Arc::new(|| State::Closed),
    )
}

#[allow(clippy::unit_arg)]
fn record_success(c: &mut Criterion) {
    let window = window();

    c.bench_function("record_success", |b| {
        b.iter(|| black_box(window.record_success(Duration::from_millis(5))))
    });
}

#[allow(clippy::unit_arg)]
fn record_and_rotate(c: &mut Criterion) {
    let window = window();

    circuitry::clock::freeze(|time| {
        c.bench_function("record_and_rotate", |b| {
            b.iter(|| {
                time.advance(Duration::from_millis(10));
                black_box(window.record_success(Duration::from_millis(5)));
            })
        })
    });
}

fn snapshot(c: &mut Criterion) {
    let window = window();
    for _ in 0..50 {
        window.record_success(Duration::from_millis(5));
    }

    c.bench_function("snapshot", |b| b.iter(|| black_box(window.snapshot())));
}

criterion_group!(benches, record_success, record_and_rotate, snapshot);
criterion_main!(benches);
