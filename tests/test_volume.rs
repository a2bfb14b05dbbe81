// tests/test_volume.rs — Kernels and volume margins through the public API.

use denseflow::image::Image;
use denseflow::kernel::{Axis, Kernel, Kernel1D, Kernel2D};
use denseflow::volume::Volume;

fn stack(n: usize, w: usize, h: usize, f: impl Fn(usize, usize, usize) -> f32) -> Vec<Image<f32>> {
    (0..n).map(|t| Image::from_fn(w, h, |x, y| f(x, y, t))).collect()
}

// ===== Kernel invariants =====

#[test]
fn derivative_kernels_return_the_slope_of_a_ramp() {
    for k in [
        Kernel1D::central_difference(),
        Kernel1D::gaussian_derivative(1.0),
        Kernel1D::gaussian_derivative(2.0),
    ] {
        let h = k.halfwidth() as isize;
        let slope: f32 = (-h..=h).map(|q| k.at(q) * (3.0 * q as f32 + 7.0)).sum();
        assert!((slope - 3.0).abs() < 1e-4, "{k:?} gives {slope}");
    }
}

#[test]
fn smoothing_kernels_preserve_constants() {
    for k in [Kernel1D::gaussian(0.8), Kernel1D::gaussian(2.5), Kernel1D::binomial5()] {
        assert!((k.sum() - 1.0).abs() < 1e-5);
    }
    let g = Kernel2D::gaussian(1.0);
    let h = g.halfwidth() as isize;
    let total: f32 = (-h..=h).flat_map(|a| (-h..=h).map(move |b| (a, b))).map(|(a, b)| g.at(a, b)).sum();
    assert!((total - 1.0).abs() < 1e-5);
}

// ===== Margins =====

#[test]
fn margin_grows_monotonically_with_each_pass() {
    let frames = stack(1, 40, 40, |x, y, _| (x * y) as f32);
    let mut v = Volume::new(40, 40, 1);
    v.load(&frames, 0).unwrap();

    let mut last = v.edge();
    for k in [Kernel1D::gaussian(0.5), Kernel1D::gaussian(1.0), Kernel1D::central_difference()] {
        let mut along_x = Volume::new(40, 40, 1);
        along_x.convolve_1d(&v, Axis::X, &k);
        v.convolve_1d(&along_x, Axis::Y, &k);
        assert_eq!(v.edge(), last + k.halfwidth());
        last = v.edge();
    }
    for y in 0..40 {
        for x in 0..40 {
            if !v.valid(x, y) {
                assert_eq!(v.get(x, y, 0), 0.0);
            }
        }
    }
}

#[test]
fn temporal_passes_shrink_depth_not_margin() {
    let frames = stack(9, 10, 10, |_, _, t| (t * t) as f32);
    let mut v = Volume::new(10, 10, 5);
    v.convolve_t_from_stack(&frames, 4, &Kernel1D::identity()).unwrap();

    let mut dt = Volume::new(10, 10, 1);
    dt.convolve(&v, Axis::T, &Kernel::from(Kernel1D::central_difference()));
    assert_eq!(dt.edge(), 0);
    // d/dt t² at the center frame t = 4.
    assert!((dt.get(5, 5, 0) - 8.0).abs() < 1e-3);
}

#[test]
fn margin_wider_than_the_image_leaves_it_empty() {
    let frames = stack(1, 6, 6, |_, _, _| 1.0);
    let mut v = Volume::new(6, 6, 1);
    v.load(&frames, 0).unwrap();
    v.convolve_xy(&Kernel1D::gaussian(2.0));
    assert_eq!(v.edge(), 6);
    assert_eq!(v.max_abs_valid(0), 0.0);
    assert!(v.plane(0).iter().all(|&s| s == 0.0));
}
