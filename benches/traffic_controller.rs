use criterion::{black_box, criterion_group, criterion_main, Criterion};
use traffic_control::config::{BucketConfig, TrafficControlConfig};
use traffic_control::telemetry::NullSink;
use traffic_control::{Outcome, TrafficController};

use std::sync::Arc;
use std::thread;

// Buckets large enough that the benchmark measures bookkeeping, not refusals.
fn controller() -> Arc<TrafficController> {
    let mut config = TrafficControlConfig::default();
    config.global.max_requests_per_minute_global = None;
    config.outbound_default.bucket = BucketConfig::new(u32::MAX, 1_000_000.0);
    Arc::new(
        TrafficController::builder(config)
            .telemetry_sink(Arc::new(NullSink))
            .build()
            .unwrap(),
    )
}

fn check_outbound_hot_path(c: &mut Criterion) {
    let controller = controller();
    controller.check_outbound("bench", 1).unwrap();

    c.bench_function("check_outbound_existing_scope", |b| {
        b.iter(|| {
            let _ = black_box(controller.check_outbound(black_box("bench"), 1));
        });
    });

    c.bench_function("check_and_record_outbound", |b| {
        b.iter(|| {
            let _ = controller.check_outbound(black_box("bench"), 1);
            controller.record_outbound_response(black_box("bench"), Outcome::Status(200));
        });
    });
}

fn check_outbound_refused(c: &mut Criterion) {
    let mut config = TrafficControlConfig::default();
    config.outbound_default.bucket = BucketConfig::new(1, 0.0);
    let controller = TrafficController::builder(config)
        .telemetry_sink(Arc::new(NullSink))
        .build()
        .unwrap();
    let _ = controller.check_outbound("empty", 1);

    c.bench_function("check_outbound_rate_limited", |b| {
        b.iter(|| {
            let _ = black_box(controller.check_outbound(black_box("empty"), 1));
        });
    });
}

fn check_outbound_contended(c: &mut Criterion) {
    let controller = controller();
    controller.check_outbound("shared", 1).unwrap();

    c.bench_function("check_outbound_4_threads_one_scope", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let controller = controller.clone();
                    thread::spawn(move || {
                        for _ in 0..256 {
                            let _ = black_box(controller.check_outbound("shared", 1));
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    check_outbound_hot_path,
    check_outbound_refused,
    check_outbound_contended
);
criterion_main!(benches);
