// lucas.rs — Dense Lucas-Kanade flow with eigenvalue confidence.
//
// For every pixel the brightness-constancy constraint
//
//     Ix·u + Iy·v + It = 0
//
// is summed over a weighted neighborhood, giving the 2×2 system
//
//     M · (u, v) = -b      M = | Σxx  Σxy |     b = | Σxt |
//                              | Σxy  Σyy |         | Σyt |
//
// M is the structure tensor. Its eigenvalues λ0 <= λ1 classify the pixel:
//
//   λ0 >= τ (and det M > 0)  textured, both components known → Full
//   λ1 >= τ > λ0             oriented edge, aperture problem  → Normal
//   λ1 < τ                   flat, nothing known              → Invalid
//
// The normal velocity is the raw solve projected onto the dominant
// eigenvector e1. Written through the eigenpair it reads
// -(e1·b / λ1)·e1, which stays finite when M is (nearly) singular.
//
// Derivatives come from one of five gradient methods (GradientMethod), each
// with its own frame support; the structure-tensor products are weighted by
// one of three kernels (Regularization).

use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};

use crate::error::Result;
use crate::estimator::{
    check_support, require_non_negative, require_positive, Estimate, Estimator, Progress,
};
use crate::flow::{FlowField, FlowVector};
use crate::image::{Image, Pixel};
use crate::kernel::{Axis, Kernel, Kernel1D, Kernel2D, Kernel3D};
use crate::linalg::{det2, inverse2, jacobi, mat_vec};
use crate::report::{PassReport, Rejection};
use crate::volume::Volume;

/// How dx, dy and dt are computed. Each variant carries its own smoothing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GradientMethod {
    /// Gaussian pre-smoothing, then the 4-point central difference on x, y, t.
    CentralDifference { sigma_s: f32, sigma_t: f32 },
    /// Gaussian pre-smoothing, then a 3×3 Sobel on x, y, t.
    #[serde(rename = "sobel_2d")]
    Sobel2D { sigma_s: f32, sigma_t: f32 },
    /// Gaussian pre-smoothing, then a 3×3×3 Sobel on x, y, t.
    #[serde(rename = "sobel_3d")]
    Sobel3D { sigma_s: f32, sigma_t: f32 },
    /// Separable derivative-of-Gaussian filters (no pre-smoothing).
    GaussianDerivative { sigma_s: f32, sigma_t: f32 },
    /// Two frames: Gaussian-derivative space gradients, frame difference in time.
    FrameDifference { sigma_s: f32 },
}

impl GradientMethod {
    /// Number of frames the method reads around the center.
    pub fn support(&self) -> usize {
        match *self {
            GradientMethod::CentralDifference { sigma_t, .. } => {
                Kernel1D::gaussian(sigma_t).support() + Kernel1D::central_difference().support() - 1
            }
            GradientMethod::Sobel2D { sigma_t, .. } | GradientMethod::Sobel3D { sigma_t, .. } => {
                Kernel1D::gaussian(sigma_t).support() + Kernel2D::sobel().support() - 1
            }
            GradientMethod::GaussianDerivative { sigma_t, .. } => {
                Kernel1D::gaussian_derivative(sigma_t).support()
            }
            GradientMethod::FrameDifference { .. } => 2,
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            GradientMethod::CentralDifference { sigma_s, sigma_t }
            | GradientMethod::Sobel2D { sigma_s, sigma_t }
            | GradientMethod::Sobel3D { sigma_s, sigma_t } => {
                require_non_negative("sigma_s", sigma_s)?;
                require_non_negative("sigma_t", sigma_t)
            }
            GradientMethod::GaussianDerivative { sigma_s, sigma_t } => {
                require_positive("sigma_s", sigma_s)?;
                require_positive("sigma_t", sigma_t)
            }
            GradientMethod::FrameDifference { sigma_s } => require_positive("sigma_s", sigma_s),
        }
    }
}

/// Neighborhood weighting of the structure-tensor products.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Regularization {
    /// Full (non-separated) 2D Gaussian.
    #[serde(rename = "gaussian_2d")]
    Gaussian2D { sigma_w: f32 },
    /// Separable 1D Gaussian along x then y.
    #[serde(rename = "gaussian_1d")]
    Gaussian1D { sigma_w: f32 },
    /// The fixed 5-tap binomial window of Barron et al.
    Reference,
}

impl Regularization {
    fn weigh(&self, src: &Volume) -> Volume {
        let mut out = Volume::new(src.width(), src.height(), src.depth());
        match *self {
            Regularization::Gaussian2D { sigma_w } => {
                out.convolve(src, Axis::X, &Kernel::Dim2(Kernel2D::gaussian(sigma_w)));
            }
            Regularization::Gaussian1D { sigma_w } => {
                let g = Kernel1D::gaussian(sigma_w);
                let mut along_x = Volume::new(src.width(), src.height(), src.depth());
                along_x.convolve_1d(src, Axis::X, &g);
                out.convolve_1d(&along_x, Axis::Y, &g);
            }
            Regularization::Reference => {
                let b = Kernel1D::binomial5();
                let mut along_x = Volume::new(src.width(), src.height(), src.depth());
                along_x.convolve_1d(src, Axis::X, &b);
                out.convolve_1d(&along_x, Axis::Y, &b);
            }
        }
        out
    }
}

/// Lucas-Kanade configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LucasKanadeParams {
    pub gradient: GradientMethod,
    pub regularization: Regularization,
    /// Eigenvalue floor, in squared intensity units.
    pub tau: f32,
    /// Keep Normal vectors on edges instead of marking them Invalid.
    pub normals: bool,
}

impl Default for LucasKanadeParams {
    fn default() -> Self {
        LucasKanadeParams {
            gradient: GradientMethod::CentralDifference {
                sigma_s: 1.5,
                sigma_t: 1.5,
            },
            regularization: Regularization::Gaussian1D { sigma_w: 2.0 },
            tau: 1.0,
            normals: false,
        }
    }
}

/// Dense Lucas-Kanade estimator.
#[derive(Debug, Clone)]
pub struct LucasKanade {
    params: LucasKanadeParams,
}

impl LucasKanade {
    pub fn new(params: LucasKanadeParams) -> Result<Self> {
        params.gradient.validate()?;
        match params.regularization {
            Regularization::Gaussian2D { sigma_w } | Regularization::Gaussian1D { sigma_w } => {
                require_positive("sigma_w", sigma_w)?
            }
            Regularization::Reference => {}
        }
        require_non_negative("tau", params.tau)?;
        Ok(LucasKanade { params })
    }

    pub fn params(&self) -> &LucasKanadeParams {
        &self.params
    }

    /// Compute dx, dy, dt at frame `center`.
    ///
    /// Fails before any filtering if the stack cannot cover the method's support.
    pub fn filter<T: Pixel>(&self, stack: &[Image<T>], center: usize) -> Result<LucasKanadeFiltered> {
        let support = self.params.gradient.support();
        let (w, h) = check_support(stack, center, support)?;
        debug!(gradient = ?self.params.gradient, support, center, "lucas-kanade filtering");

        let (dx, dy, dt) = match self.params.gradient {
            GradientMethod::CentralDifference { sigma_s, sigma_t } => {
                smoothed_gradients(stack, center, sigma_s, sigma_t, Kernel1D::central_difference().into())?
            }
            GradientMethod::Sobel2D { sigma_s, sigma_t } => {
                smoothed_gradients(stack, center, sigma_s, sigma_t, Kernel2D::sobel().into())?
            }
            GradientMethod::Sobel3D { sigma_s, sigma_t } => {
                smoothed_gradients(stack, center, sigma_s, sigma_t, Kernel3D::sobel().into())?
            }
            GradientMethod::GaussianDerivative { sigma_s, sigma_t } => {
                gaussian_derivative_gradients(stack, center, sigma_s, sigma_t, (w, h))?
            }
            GradientMethod::FrameDifference { sigma_s } => {
                let mut v = Volume::new(w, h, 2);
                v.load(stack, center)?;
                let mut diff = Volume::new(w, h, 1);
                diff.frame_difference(&v);
                let g = Kernel1D::gaussian(sigma_s);
                let gd = Kernel1D::gaussian_derivative(sigma_s);
                // Depth 1 from depth 2 reads plane 0, the center frame.
                let dx = separable(&v, &gd, &g);
                let dy = separable(&v, &g, &gd);
                let dt = separable(&diff, &g, &g);
                (dx, dy, dt)
            }
        };

        Ok(LucasKanadeFiltered {
            dx,
            dy,
            dt,
            params: self.params.clone(),
        })
    }
}

/// Pre-smooth with Gaussians, then apply `grad` along x, y and t.
fn smoothed_gradients<T: Pixel>(
    stack: &[Image<T>],
    center: usize,
    sigma_s: f32,
    sigma_t: f32,
    grad: Kernel,
) -> Result<(Volume, Volume, Volume)> {
    let (w, h) = stack[center].dimensions();
    let mut v = Volume::new(w, h, grad.support());
    v.convolve_t_from_stack(stack, center, &Kernel1D::gaussian(sigma_t))?;
    v.convolve_xy(&Kernel1D::gaussian(sigma_s));

    let [dx, dy, dt] = [Axis::X, Axis::Y, Axis::T].map(|axis| {
        let mut d = Volume::new(w, h, 1);
        d.convolve(&v, axis, &grad);
        d
    });
    Ok((dx, dy, dt))
}

/// Heeger-style separable derivative-of-Gaussian filtering.
fn gaussian_derivative_gradients<T: Pixel>(
    stack: &[Image<T>],
    center: usize,
    sigma_s: f32,
    sigma_t: f32,
    (w, h): (usize, usize),
) -> Result<(Volume, Volume, Volume)> {
    let g_s = Kernel1D::gaussian(sigma_s);
    let gd_s = Kernel1D::gaussian_derivative(sigma_s);

    let mut smooth_t = Volume::new(w, h, 1);
    smooth_t.convolve_t_from_stack(stack, center, &Kernel1D::gaussian(sigma_t))?;
    let mut deriv_t = Volume::new(w, h, 1);
    deriv_t.convolve_t_from_stack(stack, center, &Kernel1D::gaussian_derivative(sigma_t))?;

    let dx = separable(&smooth_t, &gd_s, &g_s);
    let dy = separable(&smooth_t, &g_s, &gd_s);
    let dt = separable(&deriv_t, &g_s, &g_s);
    Ok((dx, dy, dt))
}

/// `kx` along x then `ky` along y, into a single plane.
fn separable(src: &Volume, kx: &Kernel1D, ky: &Kernel1D) -> Volume {
    let mut along_x = Volume::new(src.width(), src.height(), 1);
    along_x.convolve_1d(src, Axis::X, kx);
    let mut out = Volume::new(src.width(), src.height(), 1);
    out.convolve_1d(&along_x, Axis::Y, ky);
    out
}

/// Derivative volumes of one Lucas-Kanade pass.
#[derive(Debug, Clone)]
pub struct LucasKanadeFiltered {
    pub dx: Volume,
    pub dy: Volume,
    pub dt: Volume,
    params: LucasKanadeParams,
}

impl LucasKanadeFiltered {
    pub fn compute_full(self) -> Estimate {
        self.compute_full_with_progress(&mut |_| {})
    }

    /// Weight the products, solve every valid pixel, classify by eigenvalues.
    pub fn compute_full_with_progress(self, progress: &mut dyn FnMut(f32)) -> Estimate {
        let mut progress = Progress::new(progress);
        let LucasKanadeParams {
            regularization,
            tau,
            normals,
            ..
        } = self.params;
        let tau = tau as f64;

        let products = [
            (&self.dx, &self.dx),
            (&self.dx, &self.dy),
            (&self.dy, &self.dy),
            (&self.dx, &self.dt),
            (&self.dy, &self.dt),
        ]
        .map(|(a, b)| regularization.weigh(&Volume::product(a, b)));
        let [xx, xy, yy, xt, yt] = &products;

        let (w, h) = (xx.width(), xx.height());
        let mut field = FlowField::new(w, h);
        field.set_edge(products.iter().map(Volume::edge).max().unwrap_or(0));
        let mut report = PassReport::new("lucas-kanade");

        for y in 0..h {
            for x in 0..w {
                if field.in_margin(x, y) {
                    continue;
                }
                let m = [
                    [xx.get(x, y, 0) as f64, xy.get(x, y, 0) as f64],
                    [xy.get(x, y, 0) as f64, yy.get(x, y, 0) as f64],
                ];
                let b = [xt.get(x, y, 0) as f64, yt.get(x, y, 0) as f64];
                match classify(m, b, tau, normals) {
                    Ok(v) => field.set(x, y, v),
                    Err(reason) => report.reject(reason),
                }
            }
            progress.stage(0.0, 1.0, y + 1, h);
        }

        report.finish(&field);
        progress.done();
        Estimate { field, report }
    }
}

/// Classify one structure tensor; returns the vector in field axes (y up).
fn classify(m: [[f64; 2]; 2], b: [f64; 2], tau: f64, normals: bool) -> std::result::Result<FlowVector, Rejection> {
    let mut eig = jacobi(m).map_err(|_| Rejection::Singular)?;
    eig.sort();
    let (l0, l1) = (eig.values[0], eig.values[1]);

    if l0 >= tau && det2(m) > 0.0 {
        let inv = inverse2(m).ok_or(Rejection::Singular)?;
        // v = -M⁻¹b in image axes; flip y for the field.
        let s = mat_vec(&inv, &b);
        return Ok(FlowVector::full(-s[0] as f32, s[1] as f32));
    }
    // The normal projection divides by l1 only, so a singular M needs no
    // determinant guard here.
    if normals && l1 >= tau && l1 > 0.0 {
        let e = eig.vector(1);
        let k = -(e[0] * b[0] + e[1] * b[1]) / l1;
        return Ok(FlowVector::normal((k * e[0]) as f32, -(k * e[1]) as f32));
    }
    Err(Rejection::LowConfidence)
}

impl<T: Pixel> Estimator<T> for LucasKanade {
    fn name(&self) -> &'static str {
        "lucas-kanade"
    }

    fn support(&self) -> usize {
        self.params.gradient.support()
    }

    fn estimate_with_progress(
        &self,
        stack: &[Image<T>],
        center: usize,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Estimate> {
        let _span = info_span!("lucas_kanade", center).entered();
        let filtered = self.filter(stack, center)?;
        Ok(filtered.compute_full_with_progress(progress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;

    #[test]
    fn supports_follow_kernel_sizes() {
        let cd = GradientMethod::CentralDifference { sigma_s: 1.5, sigma_t: 1.5 };
        assert_eq!(cd.support(), 11 + 5 - 1);
        let sobel = GradientMethod::Sobel3D { sigma_s: 1.0, sigma_t: 0.0 };
        assert_eq!(sobel.support(), 3);
        let gd = GradientMethod::GaussianDerivative { sigma_s: 1.0, sigma_t: 1.0 };
        assert_eq!(gd.support(), 7);
        assert_eq!(GradientMethod::FrameDifference { sigma_s: 1.0 }.support(), 2);
    }

    #[test]
    fn classify_textured_tensor_is_full() {
        // M = diag(10, 10), b = -M·(1, 2)  →  v = (1, 2) in image axes.
        let v = classify([[10.0, 0.0], [0.0, 10.0]], [-10.0, -20.0], 1.0, false).unwrap();
        assert_eq!(v, FlowVector::full(1.0, -2.0));
    }

    #[test]
    fn classify_edge_tensor_is_normal_or_invalid() {
        // Pure x-gradient: M = diag(10, 0), motion u = 0.5.
        let m = [[10.0, 0.0], [0.0, 0.0]];
        let b = [-5.0, 0.0];
        match classify(m, b, 1.0, true).unwrap() {
            FlowVector::Normal { vx, vy } => {
                assert!((vx - 0.5).abs() < 1e-6);
                assert!(vy.abs() < 1e-6);
            }
            other => panic!("expected Normal, got {other:?}"),
        }
        assert_eq!(classify(m, b, 1.0, false), Err(Rejection::LowConfidence));
    }

    #[test]
    fn classify_flat_tensor_is_invalid() {
        assert_eq!(
            classify([[0.0, 0.0], [0.0, 0.0]], [0.0, 0.0], 1.0, true),
            Err(Rejection::LowConfidence)
        );
    }

    #[test]
    fn negative_sigma_for_derivative_method_is_rejected() {
        let params = LucasKanadeParams {
            gradient: GradientMethod::GaussianDerivative { sigma_s: 0.0, sigma_t: 1.0 },
            ..Default::default()
        };
        assert!(matches!(LucasKanade::new(params), Err(FlowError::InvalidParameter(_))));
    }
}
