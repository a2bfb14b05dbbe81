// singh.rs — Two-stage correlation flow after Singh (1991).
//
// Stage 1, conservation information. Three Laplacian-filtered frames
// L₋, L₀, L₊ are compared by sum of squared differences over a
// (2n+1)² window, for every integer displacement d in a (2N+1)² search
// area, in both directions:
//
//     SSD(d) = Σ_w (L₀(p+w) - L₊(p+w+d))² + (L₀(p+w) - L₋(p+w-d))²
//
// Around the best match d₀ the SSD surface becomes a response distribution
// R(d) = exp(-k·(SSD(d) - SSD(d₀))). k is set from the mean excess over the
// sub-window, so a quadratic bowl turns into a Gaussian of about half a
// pixel variance whatever the image contrast. The mean of R is the velocity
// estimate u_c, and its covariance S_c says how well determined it is. A
// flat or one-dimensional surface leaves R uniform along some direction,
// with variance near 2 there.
//
// Stage 2, neighborhood information. Each pixel's estimate is pulled toward
// the Gaussian-weighted mean ū of its neighbors, weighted by the inverse
// covariances:
//
//     u = (S_c⁻¹ + S_n⁻¹)⁻¹ · (S_c⁻¹ u_c + S_n⁻¹ ū)
//
// iterated (reading the previous sweep, writing a fresh buffer) until the
// largest change is below epsilon.
//
// Confidence is the smaller eigenvalue of the inverse covariance, so a
// smeared response (flat image, aperture problem) scores low.

use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, trace};

use crate::error::{FlowError, Result};
use crate::estimator::{
    check_support, require_non_negative, require_positive, Estimate, Estimator, Progress,
};
use crate::flow::{FlowField, FlowVector};
use crate::image::{Image, Pixel};
use crate::kernel::{Axis, Kernel1D};
use crate::linalg::{inverse2, jacobi, mat_add, mat_vec};
use crate::report::{PassReport, Rejection};
use crate::volume::Volume;

/// Mean SSD excess below which the surface counts as flat.
const SSD_EPSILON: f64 = 1e-6;

/// Singh configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinghParams {
    /// Gaussian pre-smoothing before the Laplacian.
    pub sigma_s: f32,
    /// SSD window halfwidth (n).
    pub window: usize,
    /// Search halfwidth (N).
    pub search: usize,
    /// Response sub-window halfwidth around the peak (m).
    pub subwindow: usize,
    /// Stage 2 neighborhood halfwidth (w).
    pub neighborhood: usize,
    /// Stage 1 floor on the smaller eigenvalue of S_c⁻¹. A uniform response
    /// over the default sub-window scores just under 0.5.
    pub tau1: f32,
    /// Stage 2 floor on the smaller eigenvalue of S_c⁻¹ + S_n⁻¹.
    pub tau2: f32,
    /// Stage 2 stops once no estimate moves by this much.
    pub epsilon: f32,
    pub max_iterations: usize,
    /// Added to every covariance before inversion.
    pub covariance_floor: f32,
}

impl Default for SinghParams {
    fn default() -> Self {
        SinghParams {
            sigma_s: 1.0,
            window: 2,
            search: 4,
            subwindow: 2,
            neighborhood: 1,
            tau1: 0.6,
            tau2: 1.0,
            epsilon: 0.01,
            max_iterations: 10,
            covariance_floor: 0.01,
        }
    }
}

/// Two-stage correlation estimator.
#[derive(Debug, Clone)]
pub struct Singh {
    params: SinghParams,
}

impl Singh {
    pub fn new(params: SinghParams) -> Result<Self> {
        require_non_negative("sigma_s", params.sigma_s)?;
        require_non_negative("tau1", params.tau1)?;
        require_non_negative("tau2", params.tau2)?;
        require_positive("epsilon", params.epsilon)?;
        require_positive("covariance_floor", params.covariance_floor)?;
        if params.search == 0 || params.subwindow > params.search {
            return Err(FlowError::InvalidParameter(format!(
                "need 0 < search and subwindow <= search, got search {} subwindow {}",
                params.search, params.subwindow
            )));
        }
        if params.neighborhood == 0 {
            return Err(FlowError::InvalidParameter("neighborhood must be at least 1".into()));
        }
        Ok(Singh { params })
    }

    pub fn params(&self) -> &SinghParams {
        &self.params
    }

    /// Laplacian-filter frames `center - 1`, `center` and `center + 1`.
    pub fn filter<T: Pixel>(&self, stack: &[Image<T>], center: usize) -> Result<SinghFiltered> {
        let (w, h) = check_support(stack, center, SUPPORT)?;
        debug!(params = ?self.params, center, "singh filtering");

        let mut v = Volume::new(w, h, SUPPORT);
        v.load(stack, center - 1)?;
        v.convolve_xy(&Kernel1D::gaussian(self.params.sigma_s));

        let second = Kernel1D::second_difference();
        let mut laplacian = Volume::new(w, h, SUPPORT);
        laplacian.convolve_1d(&v, Axis::X, &second);
        let mut along_y = Volume::new(w, h, SUPPORT);
        along_y.convolve_1d(&v, Axis::Y, &second);
        laplacian.add(&along_y);

        Ok(SinghFiltered {
            laplacian,
            params: self.params.clone(),
        })
    }
}

const SUPPORT: usize = 3;

/// Laplacian planes of one Singh pass (previous, center, next).
#[derive(Debug, Clone)]
pub struct SinghFiltered {
    pub laplacian: Volume,
    params: SinghParams,
}

/// Stage 1 output for one pixel, image axes.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Belief {
    mean: [f64; 2],
    inv_cov: [[f64; 2]; 2],
}

impl SinghFiltered {
    pub fn compute_full(self) -> Estimate {
        self.compute_full_with_progress(&mut |_| {})
    }

    pub fn compute_full_with_progress(self, progress: &mut dyn FnMut(f32)) -> Estimate {
        let mut progress = Progress::new(progress);
        let p = &self.params;
        let (w, h) = (self.laplacian.width(), self.laplacian.height());
        let mut field = FlowField::new(w, h);
        field.set_edge(self.laplacian.edge() + p.window + p.search);
        let mut report = PassReport::new("singh");

        // Stage 1
        let order = peak_order(p.search - p.subwindow);
        let mut beliefs: Vec<Option<Belief>> = vec![None; w * h];
        for y in 0..h {
            for x in 0..w {
                if field.in_margin(x, y) {
                    continue;
                }
                match self.conservation(x, y, &order) {
                    Ok(b) => beliefs[y * w + x] = Some(b),
                    Err(reason) => report.reject(reason),
                }
            }
            progress.stage(0.0, 0.6, y + 1, h);
        }

        // Stage 2
        let (estimates, confidence) = self.neighborhood(&beliefs, w, h, &mut progress);
        for (i, (u, conf)) in estimates.iter().zip(&confidence).enumerate() {
            if beliefs[i].is_none() {
                continue;
            }
            match conf {
                Some(c) if *c >= p.tau2 as f64 => {
                    field.set(i % w, i / w, FlowVector::full(u[0] as f32, -u[1] as f32));
                }
                Some(_) => report.reject(Rejection::LowConfidence),
                None => report.reject(Rejection::Singular),
            }
        }

        report.finish(&field);
        progress.done();
        Estimate { field, report }
    }

    /// SSD surface, response distribution and its moments at (x, y).
    fn conservation(
        &self,
        x: usize,
        y: usize,
        order: &[(isize, isize)],
    ) -> std::result::Result<Belief, Rejection> {
        let p = &self.params;
        let big_n = p.search as isize;
        let side = 2 * p.search + 1;
        let ssd = self.ssd_surface(x, y);
        let at = |dx: isize, dy: isize| ssd[((dy + big_n) as usize) * side + (dx + big_n) as usize];

        // Scan outward from zero displacement; only a strictly lower value moves the peak.
        let mut peak = (0isize, 0isize);
        let mut best = f64::INFINITY;
        for &(dx, dy) in order {
            let s = at(dx, dy);
            if s < best {
                best = s;
                peak = (dx, dy);
            }
        }

        let m = p.subwindow as isize;
        let window: Vec<(isize, isize)> = (peak.1 - m..=peak.1 + m)
            .flat_map(|dy| (peak.0 - m..=peak.0 + m).map(move |dx| (dx, dy)))
            .collect();
        let excess = window.iter().map(|&(dx, dy)| at(dx, dy) - best).sum::<f64>()
            / window.len() as f64;
        // k maps the mean excess to the mean squared offset of the sub-window.
        // A flat surface gets k = 0, a uniform response.
        let k = if excess > SSD_EPSILON {
            mean_squared_offset(p.subwindow) / excess
        } else {
            0.0
        };

        let mut total = 0.0;
        let mut mean = [0.0f64; 2];
        let mut samples = Vec::with_capacity(window.len());
        for (dx, dy) in window {
            let r = (-k * (at(dx, dy) - best)).exp();
            total += r;
            mean[0] += r * dx as f64;
            mean[1] += r * dy as f64;
            samples.push((dx as f64, dy as f64, r));
        }
        if total <= 0.0 || !total.is_finite() {
            return Err(Rejection::Singular);
        }
        mean = [mean[0] / total, mean[1] / total];

        let floor = p.covariance_floor as f64;
        let mut cov = [[floor, 0.0], [0.0, floor]];
        for (dx, dy, r) in samples {
            let (ex, ey) = (dx - mean[0], dy - mean[1]);
            cov[0][0] += r * ex * ex / total;
            cov[0][1] += r * ex * ey / total;
            cov[1][1] += r * ey * ey / total;
        }
        cov[1][0] = cov[0][1];

        let inv_cov = inverse2(cov).ok_or(Rejection::Singular)?;
        if smaller_eigenvalue(inv_cov)? < p.tau1 as f64 {
            return Err(Rejection::LowConfidence);
        }
        Ok(Belief { mean, inv_cov })
    }

    /// Two-sided SSD for every displacement, row-major over `[-N, N]²`.
    fn ssd_surface(&self, x: usize, y: usize) -> Vec<f64> {
        let p = &self.params;
        let (n, big_n) = (p.window as isize, p.search as isize);
        let l = &self.laplacian;
        let (x, y) = (x as isize, y as isize);
        let sample = |x: isize, y: isize, t: usize| l.get(x as usize, y as usize, t) as f64;

        let mut out = Vec::with_capacity((2 * p.search + 1).pow(2));
        for dy in -big_n..=big_n {
            for dx in -big_n..=big_n {
                let mut s = 0.0;
                for wy in -n..=n {
                    for wx in -n..=n {
                        let (px, py) = (x + wx, y + wy);
                        let l0 = sample(px, py, 1);
                        let fwd = l0 - sample(px + dx, py + dy, 2);
                        let bwd = l0 - sample(px - dx, py - dy, 0);
                        s += fwd * fwd + bwd * bwd;
                    }
                }
                out.push(s);
            }
        }
        out
    }

    /// Stage 2 iteration. Returns the final estimates and, per pixel, the
    /// smaller eigenvalue of the combined inverse covariance.
    fn neighborhood(
        &self,
        beliefs: &[Option<Belief>],
        w: usize,
        h: usize,
        progress: &mut Progress<'_>,
    ) -> (Vec<[f64; 2]>, Vec<Option<f64>>) {
        let p = &self.params;
        let r = p.neighborhood as isize;
        let sigma = p.neighborhood as f64 / 2.0;
        let floor = p.covariance_floor as f64;
        let weights: Vec<(isize, isize, f64)> = (-r..=r)
            .flat_map(|dy| (-r..=r).map(move |dx| (dx, dy)))
            .map(|(dx, dy)| (dx, dy, (-((dx * dx + dy * dy) as f64) / (2.0 * sigma * sigma)).exp()))
            .collect();

        let mut current: Vec<[f64; 2]> =
            beliefs.iter().map(|b| b.map_or([0.0; 2], |b| b.mean)).collect();
        let mut next = current.clone();
        // Without a sweep the stage 1 belief stands on its own.
        let mut confidence: Vec<Option<f64>> = beliefs
            .iter()
            .map(|b| b.and_then(|b| smaller_eigenvalue(b.inv_cov).ok()))
            .collect();

        for iteration in 0..p.max_iterations {
            let mut max_delta = 0.0f64;
            for y in 0..h {
                for x in 0..w {
                    let i = y * w + x;
                    let Some(belief) = beliefs[i] else { continue };

                    let mut total = 0.0;
                    let mut mean = [0.0f64; 2];
                    let mut members = Vec::with_capacity(weights.len());
                    for &(dx, dy, g) in &weights {
                        let (nx, ny) = (x as isize + dx, y as isize + dy);
                        if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                            continue;
                        }
                        let j = ny as usize * w + nx as usize;
                        if beliefs[j].is_none() {
                            continue;
                        }
                        total += g;
                        mean[0] += g * current[j][0];
                        mean[1] += g * current[j][1];
                        members.push((current[j], g));
                    }
                    mean = [mean[0] / total, mean[1] / total];
                    let mut cov = [[floor, 0.0], [0.0, floor]];
                    for (u, g) in members {
                        let (ex, ey) = (u[0] - mean[0], u[1] - mean[1]);
                        cov[0][0] += g * ex * ex / total;
                        cov[0][1] += g * ex * ey / total;
                        cov[1][1] += g * ey * ey / total;
                    }
                    cov[1][0] = cov[0][1];

                    let Some(n_inv) = inverse2(cov) else {
                        confidence[i] = None;
                        continue;
                    };
                    let combined = mat_add(&belief.inv_cov, &n_inv);
                    let Some(combined_inv) = inverse2(combined) else {
                        confidence[i] = None;
                        continue;
                    };
                    let c = mat_vec(&belief.inv_cov, &belief.mean);
                    let n = mat_vec(&n_inv, &mean);
                    let u = mat_vec(&combined_inv, &[c[0] + n[0], c[1] + n[1]]);

                    let delta = (u[0] - current[i][0]).abs().max((u[1] - current[i][1]).abs());
                    max_delta = max_delta.max(delta);
                    next[i] = u;
                    confidence[i] = smaller_eigenvalue(combined).ok();
                }
            }
            std::mem::swap(&mut current, &mut next);
            trace!(iteration, max_delta, "singh stage 2 sweep");
            progress.stage(0.6, 1.0, iteration + 1, p.max_iterations);
            if max_delta < p.epsilon as f64 {
                break;
            }
        }
        (current, confidence)
    }
}

/// Offsets in `[-r, r]²` ordered by distance from the origin, raster order
/// within a distance.
fn peak_order(r: usize) -> Vec<(isize, isize)> {
    let r = r as isize;
    let mut order: Vec<(isize, isize)> =
        (-r..=r).flat_map(|dy| (-r..=r).map(move |dx| (dx, dy))).collect();
    order.sort_by_key(|&(dx, dy)| dx * dx + dy * dy);
    order
}

/// Mean of `|d|²` over the `(2m+1)²` offsets of a sub-window.
fn mean_squared_offset(m: usize) -> f64 {
    let m = m as f64;
    2.0 * m * (m + 1.0) / 3.0
}

fn smaller_eigenvalue(m: [[f64; 2]; 2]) -> std::result::Result<f64, Rejection> {
    let eig = jacobi(m).map_err(|_| Rejection::Singular)?;
    Ok(eig.values[0].min(eig.values[1]))
}

impl<T: Pixel> Estimator<T> for Singh {
    fn name(&self) -> &'static str {
        "singh"
    }

    fn support(&self) -> usize {
        SUPPORT
    }

    fn estimate_with_progress(
        &self,
        stack: &[Image<T>],
        center: usize,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Estimate> {
        let _span = info_span!("singh", center).entered();
        let filtered = self.filter(stack, center)?;
        Ok(filtered.compute_full_with_progress(progress))
    }
}
