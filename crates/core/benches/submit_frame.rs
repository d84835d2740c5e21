use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pageflip_core::backend::ManualBackend;
use pageflip_core::{BackendContext, Presenter, PresenterConfig, SurfaceId, VsyncDelivery};

/// Presenter whose backend completes every flip inside `present`.
fn presenter(delivery: VsyncDelivery, buffers: usize) -> Presenter {
    let backend = Arc::new(ManualBackend::synchronous());
    let config = PresenterConfig {
        buffer_count: buffers,
        vsync_delivery: delivery,
        ..Default::default()
    };
    Presenter::new(BackendContext::from_arc(backend), config).unwrap()
}

fn bench_submit_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_frame");

    for &(width, height) in [(320u32, 240u32), (640, 480), (1280, 720)].iter() {
        let pitch = width as usize * 4;
        let pixels = vec![0x5Au8; pitch * height as usize];
        group.bench_with_input(
            BenchmarkId::new("polled", format!("{}x{}", width, height)),
            &pixels,
            |b, pixels| {
                let mut presenter = presenter(VsyncDelivery::Polled, 3);
                b.iter(|| {
                    presenter
                        .submit_frame(SurfaceId::Main, black_box(pixels), width, height, pitch)
                        .unwrap();
                });
            },
        );
    }

    group.finish();
}

fn bench_delivery_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("vsync_delivery");
    let pixels = vec![0u8; 256 * 224 * 4];

    for (name, delivery) in [
        ("threaded", VsyncDelivery::Threaded),
        ("polled", VsyncDelivery::Polled),
    ] {
        group.bench_function(name, |b| {
            let mut presenter = presenter(delivery, 2);
            b.iter(|| {
                presenter
                    .submit_frame(SurfaceId::Main, &pixels, 256, 224, 256 * 4)
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn bench_surface_open(c: &mut Criterion) {
    c.bench_function("open_and_teardown", |b| {
        let mut presenter = presenter(VsyncDelivery::Polled, 3);
        b.iter(|| {
            presenter.open_surface(SurfaceId::Menu, 320, 240).unwrap();
            presenter.teardown(SurfaceId::Menu).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_submit_frame,
    bench_delivery_modes,
    bench_surface_open
);
criterion_main!(benches);
