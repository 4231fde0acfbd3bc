//! Benchmarks for brightness measurement and the bisection search
//!
//! Run with: cargo bench

use crabcontrol::config::Bounds;
use crabcontrol::photometry::{calc_brightness, BrightnessSearch};
use crabcontrol::testing::synthetic_frame;
use crabcontrol::ImageEncoding;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_calc_brightness(c: &mut Criterion) {
    let mut group = c.benchmark_group("Brightness");

    let resolutions = [(640, 480, "480p"), (1280, 720, "720p"), (1920, 1080, "1080p")];
    for (width, height, name) in resolutions {
        for encoding in [ImageEncoding::Mono8, ImageEncoding::Rgb8, ImageEncoding::Mono16] {
            let frame = synthetic_frame(1, width, height, encoding, 117.0);
            group.throughput(Throughput::Bytes(frame.data.len() as u64));
            group.bench_with_input(
                BenchmarkId::new(name, encoding),
                &frame,
                |b, frame| b.iter(|| calc_brightness(black_box(frame))),
            );
        }
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    c.bench_function("bisection_linear_model", |b| {
        b.iter(|| {
            let mut search =
                BrightnessSearch::new(Bounds::new(10.0, 100_000.0), black_box(37.0), 1.0, 10, 1.0);
            while let Some(x) = search.next_probe() {
                search.observe(x, (x * 0.01).min(255.0));
            }
            search.best()
        })
    });
}

criterion_group!(benches, bench_calc_brightness, bench_search);
criterion_main!(benches);
