// kernel.rs — Discrete 1D / 2D / 3D filter kernels.
//
// Every kernel is odd-length and centered: a kernel with halfwidth h has
// support 2h + 1 and is indexed by offsets q in [-h, h].
//
// CONVENTION: kernels are applied as *correlation*,
//
//     out(p) = Σ_q k(q) · in(p + q)
//
// so a derivative kernel must be positive on the +q side to measure an
// intensity increasing along the axis. Every derivative kernel here is
// normalized so that Σ q·k(q) = 1: applied to a ramp `a·x` it returns `a`.
// This keeps dx, dy and dt on the same scale, which the structure-tensor
// solves in lucas.rs and uras.rs depend on.
//
// Multi-dimensional kernels are stored dense. Their first index runs along
// the axis the kernel is applied to (the derivative axis for Sobel), the
// remaining indices run across the other axes (see volume.rs for the exact
// axis assignment).
//
//   Kernel2D Sobel, applied along X:
//        b = -1   0    1        (across: y)
//   a=-1 [ -1/8 -2/8 -1/8 ]
//   a= 0 [  0    0    0   ]     (along: x)
//   a= 1 [  1/8  2/8  1/8 ]

use serde::{Deserialize, Serialize};

// Barron et al. 4-point central difference, correlation order.
const CENTRAL_DIFFERENCE: [f32; 5] = [1.0 / 12.0, -8.0 / 12.0, 0.0, 8.0 / 12.0, -1.0 / 12.0];
const SOBEL_DERIV: [f32; 3] = [-0.5, 0.0, 0.5];
const SOBEL_SMOOTH: [f32; 3] = [0.25, 0.5, 0.25];
// Barron et al. reference spatial weighting for Lucas-Kanade.
const BINOMIAL_5: [f32; 5] = [0.0625, 0.25, 0.375, 0.25, 0.0625];

/// Axis of a spatiotemporal volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    T,
}

// ---------------------------------------------------------------------------
// Kernel1D
// ---------------------------------------------------------------------------

/// A centered, odd-length 1D kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel1D {
    weights: Vec<f32>,
    halfwidth: usize,
}

impl Kernel1D {
    /// Wrap raw weights.
    ///
    /// # Panics
    /// Panics if `weights` is empty or has even length.
    pub fn from_weights(weights: Vec<f32>) -> Self {
        assert!(
            weights.len() % 2 == 1,
            "kernel length must be odd (got {})",
            weights.len()
        );
        let halfwidth = weights.len() / 2;
        Kernel1D { weights, halfwidth }
    }

    /// The single-tap kernel `[1]`.
    pub fn identity() -> Self {
        Kernel1D::from_weights(vec![1.0])
    }

    /// Normalized Gaussian with halfwidth `ceil(3σ)`.
    ///
    /// A non-positive `sigma` means "no smoothing" and returns the identity,
    /// which lets every smoothing stage be switched off without an Option.
    pub fn gaussian(sigma: f32) -> Self {
        if sigma <= 0.0 {
            return Kernel1D::identity();
        }
        let halfwidth = gaussian_halfwidth(sigma);
        let mut weights: Vec<f32> = offsets(halfwidth)
            .map(|q| (-(q * q) / (2.0 * sigma * sigma)).exp())
            .collect();
        let sum: f32 = weights.iter().sum();
        for w in &mut weights {
            *w /= sum;
        }
        Kernel1D { weights, halfwidth }
    }

    /// First derivative of a Gaussian, normalized so `Σ q·k(q) = 1`.
    ///
    /// # Panics
    /// Panics if `sigma <= 0`.
    pub fn gaussian_derivative(sigma: f32) -> Self {
        assert!(sigma > 0.0, "derivative sigma must be positive (got {sigma})");
        let halfwidth = gaussian_halfwidth(sigma);
        let mut weights: Vec<f32> = offsets(halfwidth)
            .map(|q| q * (-(q * q) / (2.0 * sigma * sigma)).exp())
            .collect();
        let moment: f32 = offsets(halfwidth).zip(&weights).map(|(q, w)| q * w).sum();
        for w in &mut weights {
            *w /= moment;
        }
        Kernel1D { weights, halfwidth }
    }

    /// 4-point central difference `[1, -8, 0, 8, -1] / 12`.
    pub fn central_difference() -> Self {
        Kernel1D::from_weights(CENTRAL_DIFFERENCE.to_vec())
    }

    /// Second difference `[1, -2, 1]` (one axis of the discrete Laplacian).
    pub fn second_difference() -> Self {
        Kernel1D::from_weights(vec![1.0, -2.0, 1.0])
    }

    /// Fixed 5-tap binomial `[1, 4, 6, 4, 1] / 16`.
    pub fn binomial5() -> Self {
        Kernel1D::from_weights(BINOMIAL_5.to_vec())
    }

    /// Gaussian-windowed cosine `g(q)·cos(freq·q)`.
    pub fn gabor_cos(sigma: f32, freq: f32) -> Self {
        Kernel1D::gaussian(sigma).modulated(|q| (freq * q).cos())
    }

    /// Gaussian-windowed sine `g(q)·sin(freq·q)`.
    pub fn gabor_sin(sigma: f32, freq: f32) -> Self {
        Kernel1D::gaussian(sigma).modulated(|q| (freq * q).sin())
    }

    fn modulated(&self, f: impl Fn(f32) -> f32) -> Self {
        let weights = offsets(self.halfwidth)
            .zip(&self.weights)
            .map(|(q, w)| w * f(q))
            .collect();
        Kernel1D {
            weights,
            halfwidth: self.halfwidth,
        }
    }

    #[inline]
    pub fn halfwidth(&self) -> usize {
        self.halfwidth
    }

    #[inline]
    pub fn support(&self) -> usize {
        2 * self.halfwidth + 1
    }

    /// Weights in offset order, `weights()[i]` is the tap at `q = i - halfwidth`.
    #[inline]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Tap at signed offset `q`.
    ///
    /// # Panics
    /// Panics if `|q| > halfwidth`.
    #[inline]
    pub fn at(&self, q: isize) -> f32 {
        self.weights[(q + self.halfwidth as isize) as usize]
    }

    pub fn sum(&self) -> f32 {
        self.weights.iter().sum()
    }
}

fn gaussian_halfwidth(sigma: f32) -> usize {
    ((3.0 * sigma).ceil() as usize).max(1)
}

fn offsets(halfwidth: usize) -> impl Iterator<Item = f32> {
    let h = halfwidth as isize;
    (-h..=h).map(|q| q as f32)
}

// ---------------------------------------------------------------------------
// Kernel2D / Kernel3D
// ---------------------------------------------------------------------------

/// Dense square 2D kernel, `w[a][b]` with `a` along the applied axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel2D {
    weights: Vec<f32>,
    halfwidth: usize,
}

impl Kernel2D {
    /// Outer product `along[a] * across[b]` of two equal-length kernels.
    ///
    /// # Panics
    /// Panics if the kernels differ in length.
    pub fn outer(along: &Kernel1D, across: &Kernel1D) -> Self {
        assert_eq!(along.support(), across.support(), "outer product needs equal supports");
        let mut weights = Vec::with_capacity(along.support() * across.support());
        for &a in along.weights() {
            for &b in across.weights() {
                weights.push(a * b);
            }
        }
        Kernel2D {
            weights,
            halfwidth: along.halfwidth(),
        }
    }

    /// Sobel derivative along the applied axis, [1 2 1] smoothing across.
    pub fn sobel() -> Self {
        Kernel2D::outer(
            &Kernel1D::from_weights(SOBEL_DERIV.to_vec()),
            &Kernel1D::from_weights(SOBEL_SMOOTH.to_vec()),
        )
    }

    /// Isotropic 2D Gaussian.
    pub fn gaussian(sigma: f32) -> Self {
        let g = Kernel1D::gaussian(sigma);
        Kernel2D::outer(&g, &g)
    }

    #[inline]
    pub fn halfwidth(&self) -> usize {
        self.halfwidth
    }

    #[inline]
    pub fn support(&self) -> usize {
        2 * self.halfwidth + 1
    }

    #[inline]
    pub fn at(&self, a: isize, b: isize) -> f32 {
        let h = self.halfwidth as isize;
        let n = self.support();
        self.weights[(a + h) as usize * n + (b + h) as usize]
    }
}

/// Dense cubic 3D kernel, `w[a][b][c]` with `a` along the applied axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel3D {
    weights: Vec<f32>,
    halfwidth: usize,
}

impl Kernel3D {
    /// 3D Sobel: derivative along the applied axis, [1 2 1] across both others.
    pub fn sobel() -> Self {
        let mut weights = Vec::with_capacity(27);
        for &a in &SOBEL_DERIV {
            for &b in &SOBEL_SMOOTH {
                for &c in &SOBEL_SMOOTH {
                    weights.push(a * b * c);
                }
            }
        }
        Kernel3D {
            weights,
            halfwidth: 1,
        }
    }

    #[inline]
    pub fn halfwidth(&self) -> usize {
        self.halfwidth
    }

    #[inline]
    pub fn support(&self) -> usize {
        2 * self.halfwidth + 1
    }

    #[inline]
    pub fn at(&self, a: isize, b: isize, c: isize) -> f32 {
        let h = self.halfwidth as isize;
        let n = self.support();
        let (a, b, c) = ((a + h) as usize, (b + h) as usize, (c + h) as usize);
        self.weights[(a * n + b) * n + c]
    }
}

/// Any of the three kernel shapes, for `Volume::convolve`.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    Dim1(Kernel1D),
    Dim2(Kernel2D),
    Dim3(Kernel3D),
}

impl Kernel {
    pub fn halfwidth(&self) -> usize {
        match self {
            Kernel::Dim1(k) => k.halfwidth(),
            Kernel::Dim2(k) => k.halfwidth(),
            Kernel::Dim3(k) => k.halfwidth(),
        }
    }

    pub fn support(&self) -> usize {
        2 * self.halfwidth() + 1
    }
}

impl From<Kernel1D> for Kernel {
    fn from(k: Kernel1D) -> Self {
        Kernel::Dim1(k)
    }
}

impl From<Kernel2D> for Kernel {
    fn from(k: Kernel2D) -> Self {
        Kernel::Dim2(k)
    }
}

impl From<Kernel3D> for Kernel {
    fn from(k: Kernel3D) -> Self {
        Kernel::Dim3(k)
    }
}

// ---------------------------------------------------------------------------
// Complex kernels
// ---------------------------------------------------------------------------
// A velocity-tuned Gabor channel correlates the volume with
//   g(q) · e^{-i k q}
// along each axis. For a signal e^{i ω q} the response is e^{i ω p} · ĝ(ω - k):
// the phase of the response follows the signal, and the channel passes
// frequencies near +k.

/// A complex 1D kernel held as its real and imaginary parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexKernel {
    pub re: Kernel1D,
    pub im: Kernel1D,
}

impl ComplexKernel {
    /// Gabor pair `g(q)·cos(kq) - i·g(q)·sin(kq)`.
    pub fn gabor(sigma: f32, freq: f32) -> Self {
        let mut im = Kernel1D::gabor_sin(sigma, freq);
        for w in &mut im.weights {
            *w = -*w;
        }
        ComplexKernel {
            re: Kernel1D::gabor_cos(sigma, freq),
            im,
        }
    }

    /// Central difference demodulated by `e^{-ikq}`, see fleet.rs.
    pub fn demodulation(freq: f32) -> Self {
        let d = Kernel1D::central_difference();
        ComplexKernel {
            re: d.modulated(|q| (freq * q).cos()),
            im: d.modulated(|q| -(freq * q).sin()),
        }
    }

    #[inline]
    pub fn halfwidth(&self) -> usize {
        self.re.halfwidth()
    }

    /// Response of the kernel to a constant signal of value 1.
    ///
    /// The imaginary part cancels for a symmetric envelope, leaving `Σ re`.
    pub fn dc_response(&self) -> f32 {
        self.re.sum()
    }
}
