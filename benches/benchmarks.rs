// benches/benchmarks.rs -- Per-stage and per-estimator benchmarks.
//
//   cargo bench
//
// Every input is synthetic: a translating three-component plaid, the same
// pattern the integration tests check accuracy on, so the timings below
// belong to inputs the estimators are known to handle.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use denseflow::estimator::Estimator;
use denseflow::fleet::{FleetJepson, FleetJepsonParams};
use denseflow::flow::FlowField;
use denseflow::image::Image;
use denseflow::kernel::{Axis, Kernel1D};
use denseflow::lucas::{GradientMethod, LucasKanade, LucasKanadeParams};
use denseflow::singh::{Singh, SinghParams};
use denseflow::uras::{Uras, UrasParams};
use denseflow::volume::Volume;

// ============================================================
// Helpers
// ============================================================

/// `frames` 8-bit frames of a plaid moving at (0.6, 0.3) px/frame.
fn make_sequence(w: usize, h: usize, frames: usize) -> Vec<Image<u8>> {
    let components = [(6.0f32, 10.0f32), (7.0, 70.0), (8.0, 130.0)];
    (0..frames)
        .map(|t| {
            let (ox, oy) = (0.6 * t as f32, 0.3 * t as f32);
            Image::from_fn(w, h, |x, y| {
                let (x, y) = (x as f32 - ox, y as f32 - oy);
                let mut v = 128.0;
                for (lambda, deg) in components {
                    let (s, c) = deg.to_radians().sin_cos();
                    v += 30.0 * (std::f32::consts::TAU / lambda * (c * x + s * y)).sin();
                }
                v.round().clamp(0.0, 255.0) as u8
            })
        })
        .collect()
}

// ============================================================
// Per-stage benchmarks
// ============================================================

fn bench_volume(c: &mut Criterion) {
    let seq = make_sequence(316, 252, 15);
    let g = Kernel1D::gaussian(1.5);
    let cd = Kernel1D::central_difference();

    let mut group = c.benchmark_group("volume");
    group.bench_function("smooth_t_then_xy_316x252x5", |b| {
        b.iter(|| {
            let mut v = Volume::new(316, 252, 5);
            v.convolve_t_from_stack(&seq, 7, &g).unwrap();
            v.convolve_xy(&g);
            v
        })
    });

    let mut smoothed = Volume::new(316, 252, 5);
    smoothed.convolve_t_from_stack(&seq, 7, &g).unwrap();
    smoothed.convolve_xy(&g);
    for (name, axis) in [("dx", Axis::X), ("dt", Axis::T)] {
        group.bench_function(BenchmarkId::new("central_difference", name), |b| {
            b.iter(|| {
                let mut out = Volume::new(316, 252, 1);
                out.convolve_1d(&smoothed, axis, &cd);
                out
            })
        });
    }
    group.finish();
}

fn bench_burkitt(c: &mut Criterion) {
    let field = FlowField::rotation(316, 252, 158.0, 126.0, 0.01, None);
    let mut bytes = Vec::new();
    field.write_burkitt(&mut bytes).unwrap();

    let mut group = c.benchmark_group("burkitt");
    group.bench_function("write_316x252", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(bytes.len());
            field.write_burkitt(&mut out).unwrap();
            out
        })
    });
    group.bench_function("read_316x252", |b| {
        b.iter(|| FlowField::read_burkitt(&bytes[..]).unwrap())
    });
    group.finish();
}

// ============================================================
// Estimators
// ============================================================

fn bench_lucas(c: &mut Criterion) {
    let methods = [
        ("central_difference", GradientMethod::CentralDifference { sigma_s: 1.5, sigma_t: 1.5 }),
        ("sobel_3d", GradientMethod::Sobel3D { sigma_s: 1.5, sigma_t: 1.0 }),
        ("gaussian_derivative", GradientMethod::GaussianDerivative { sigma_s: 1.5, sigma_t: 1.0 }),
        ("frame_difference", GradientMethod::FrameDifference { sigma_s: 1.5 }),
    ];
    let seq = make_sequence(128, 128, 15);

    let mut group = c.benchmark_group("lucas_kanade");
    for (name, gradient) in methods {
        let lk = LucasKanade::new(LucasKanadeParams {
            gradient,
            ..Default::default()
        })
        .unwrap();
        let center = gradient.support().saturating_sub(1) / 2;
        group.bench_function(BenchmarkId::new(name, "128x128"), |b| {
            b.iter(|| lk.estimate(&seq, center).unwrap())
        });
    }
    group.finish();
}

fn bench_uras(c: &mut Criterion) {
    let uras = Uras::new(UrasParams::default()).unwrap();
    let seq = make_sequence(128, 128, uras.support());
    let center = uras.support() / 2;

    let mut group = c.benchmark_group("uras");
    group.bench_function("default_128x128", |b| {
        b.iter(|| uras.estimate(&seq, center).unwrap())
    });
    group.finish();
}

fn bench_singh(c: &mut Criterion) {
    let singh = Singh::new(SinghParams::default()).unwrap();
    let seq = make_sequence(96, 96, 3);

    let mut group = c.benchmark_group("singh");
    group.sample_size(10);
    group.bench_function("default_96x96", |b| {
        b.iter(|| singh.estimate(&seq, 1).unwrap())
    });
    group.finish();
}

fn bench_fleet(c: &mut Criterion) {
    let fj = FleetJepson::new(FleetJepsonParams::default()).unwrap();
    let seq = make_sequence(64, 64, fj.support());
    let center = fj.support() / 2;

    let mut group = c.benchmark_group("fleet_jepson");
    group.sample_size(10);
    group.bench_function("filter_22ch_64x64", |b| {
        b.iter(|| fj.filter(&seq, center).unwrap())
    });
    let filtered = fj.filter(&seq, center).unwrap();
    group.bench_function("normals_and_fit_64x64", |b| {
        b.iter(|| filtered.clone().compute_full())
    });
    group.finish();
}

// ============================================================
// Register
// ============================================================

criterion_group!(
    benches,
    bench_volume,
    bench_burkitt,
    bench_lucas,
    bench_uras,
    bench_singh,
    bench_fleet,
);
criterion_main!(benches);
