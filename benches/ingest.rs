use std::time::Instant;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use geowatch::geo::{point_in_circle, point_in_polygon};
use geowatch::{Channel, EntityId, FenceGeometry, FenceTemplate, GeoPoint, GeowatchEngine, SubscriberId};

#[allow(clippy::cast_precision_loss)]
fn ring(vertices: usize) -> Vec<GeoPoint> {
    (0..vertices)
        .map(|i| {
            let theta = std::f64::consts::TAU * i as f64 / vertices as f64;
            GeoPoint::new(theta.sin(), theta.cos()).unwrap()
        })
        .collect()
}

fn bench_geometry(c: &mut Criterion) {
    let mut group = c.benchmark_group("geometry");
    let center = GeoPoint::new(0.0, 0.0).unwrap();
    let point = GeoPoint::new(0.3, 0.4).unwrap();

    group.bench_function("point_in_circle", |b| {
        b.iter(|| point_in_circle(black_box(&point), black_box(&center), black_box(1_000.0)));
    });

    for vertices in [4usize, 64, 1024] {
        let polygon = ring(vertices);
        group.throughput(Throughput::Elements(vertices as u64));
        group.bench_with_input(BenchmarkId::new("point_in_polygon", vertices), &polygon, |b, polygon| {
            b.iter(|| point_in_polygon(black_box(&point), black_box(polygon)));
        });
    }
    group.finish();
}

fn bench_submit_location(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");
    group.throughput(Throughput::Elements(1));

    group.bench_function("submit_no_violation", |b| {
        // Fresh engine per sample; exclude setup from timing.
        b.iter_custom(|iters| {
            let engine = GeowatchEngine::in_memory().unwrap();
            let e = EntityId::new();
            let center = GeoPoint::new(0.0, 0.0).unwrap();
            for radius in [1_000.0, 2_000.0, 5_000.0] {
                let template = FenceTemplate::new(FenceGeometry::circle(center, radius).unwrap());
                engine.create_fence(e, &template).unwrap();
            }

            let start = Instant::now();
            for _ in 0..iters {
                engine.submit_location(e, 0.001, 0.001, Utc::now()).unwrap();
            }
            start.elapsed()
        });
    });

    group.bench_function("submit_violation_fanout_16", |b| {
        b.iter_custom(|iters| {
            let engine = GeowatchEngine::in_memory().unwrap();
            let e = EntityId::new();
            let template = FenceTemplate::new(FenceGeometry::polygon(ring(32)).unwrap());
            engine.create_fence(e, &template).unwrap();
            let streams: Vec<_> = (0..16)
                .map(|_| engine.subscribe(SubscriberId::new(), Channel::Entity(e)))
                .collect();

            let start = Instant::now();
            for _ in 0..iters {
                engine.submit_location(e, 5.0, 5.0, Utc::now()).unwrap();
                for stream in &streams {
                    black_box(stream.try_recv());
                }
            }
            start.elapsed()
        });
    });

    group.finish();
}

criterion_group!(ingest, bench_geometry, bench_submit_location);
criterion_main!(ingest);
