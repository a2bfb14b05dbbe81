// tests/common/mod.rs — Synthetic sequences with known motion.
//
// Every generator samples a continuous pattern p(x, y) translated by a
// constant velocity in image axes (y down):
//
//     frame t (x, y) = p(x - vx·t, y - vy·t)
//
// The ground truth in FlowField axes (y up) is therefore (vx, -vy).

#![allow(dead_code)]

use std::sync::OnceLock;

use denseflow::image::Image;
use tracing_subscriber::EnvFilter;

static TRACING: OnceLock<()> = OnceLock::new();

/// Route estimator logs to the test harness. Honors `RUST_LOG`, quiet by
/// default.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Sum of three sinusoidal gratings at different orientations and
/// wavelengths: textured everywhere, no aperture problem.
pub fn plaid(x: f32, y: f32) -> f32 {
    const COMPONENTS: [(f32, f32, f32); 3] = [
        // (wavelength px, orientation deg, phase)
        (6.0, 10.0, 0.3),
        (7.0, 70.0, 1.1),
        (8.0, 130.0, 2.0),
    ];
    let mut v = 128.0;
    for (lambda, deg, phase) in COMPONENTS {
        let (s, c) = deg.to_radians().sin_cos();
        let omega = std::f32::consts::TAU / lambda;
        v += 30.0 * (omega * (c * x + s * y) + phase).sin();
    }
    v
}

/// A single vertical grating: intensity varies along x only.
pub fn grating(x: f32, _y: f32) -> f32 {
    128.0 + 40.0 * (std::f32::consts::TAU / 8.0 * x).sin()
}

/// `frames` images of `pattern` moving at (vx, vy) in image axes.
pub fn translating(
    width: usize,
    height: usize,
    frames: usize,
    (vx, vy): (f32, f32),
    pattern: fn(f32, f32) -> f32,
) -> Vec<Image<f32>> {
    (0..frames)
        .map(|t| {
            let t = t as f32;
            Image::from_fn(width, height, |x, y| pattern(x as f32 - vx * t, y as f32 - vy * t))
        })
        .collect()
}

/// The same sequence quantized to 8 bits.
pub fn translating_u8(
    width: usize,
    height: usize,
    frames: usize,
    velocity: (f32, f32),
    pattern: fn(f32, f32) -> f32,
) -> Vec<Image<u8>> {
    translating(width, height, frames, velocity, pattern)
        .iter()
        .map(|f| Image::from_fn(width, height, |x, y| f.get(x, y).round().clamp(0.0, 255.0) as u8))
        .collect()
}

/// Constant-intensity sequence.
pub fn flat(width: usize, height: usize, frames: usize) -> Vec<Image<f32>> {
    (0..frames).map(|_| Image::from_fn(width, height, |_, _| 100.0)).collect()
}

/// Fraction of Full cells of `field` within `tolerance` of (vx, vy), and
/// their count.
pub fn accuracy(field: &denseflow::FlowField, expected: (f32, f32), tolerance: f32) -> (f32, usize) {
    let mut full = 0;
    let mut good = 0;
    for (_, _, v) in field.iter() {
        if let Some((vx, vy)) = v.full_components() {
            full += 1;
            if (vx - expected.0).abs() < tolerance && (vy - expected.1).abs() < tolerance {
                good += 1;
            }
        }
    }
    if full == 0 {
        (0.0, 0)
    } else {
        (good as f32 / full as f32, full)
    }
}
