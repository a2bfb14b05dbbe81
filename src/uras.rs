// uras.rs — Second-order (Hessian) flow after Uras et al.
//
// Differentiating brightness constancy once more in x and y gives two
// equations per pixel:
//
//     | Ixx  Ixy | · (u, v) = -(Ixt, Iyt)
//     | Ixy  Iyy |
//
// so every pixel yields a full velocity on its own, with no neighborhood
// sum. The price is noise: second derivatives amplify it, and the solve
// blows up wherever the Hessian is near singular.
//
// Propagation tames that. The field is cut into region × region tiles, and
// in each tile the single most trustworthy pixel is chosen:
//
//   candidate   Full, Hessian condition number κ < condition_limit,
//               discriminant D = ‖Hᵀ·∇U‖ / ‖(Ixt, Iyt)‖ < discriminant_limit
//   winner      smallest κ; ties by smaller D, then raster order
//
// ∇U is the Jacobian of the raw velocity field. A small D means the
// neighbors agree, i.e. the local flow really is a translation. The winner's
// vector is copied to the whole tile. A region of 1 makes this a per-pixel
// filter, and 0 switches it off entirely.

use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};

use crate::error::Result;
use crate::estimator::{
    check_support, require_non_negative, require_positive, Estimate, Estimator, Progress,
};
use crate::flow::{FlowField, FlowVector};
use crate::image::{Image, Pixel};
use crate::kernel::{Axis, Kernel1D};
use crate::linalg::{condition_number2, frobenius, mat_mul, transpose};
use crate::report::{PassReport, Rejection};
use crate::volume::Volume;

/// Uras configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrasParams {
    pub sigma_s: f32,
    pub sigma_t: f32,
    /// Speeds above this are clamped, keeping the direction.
    pub max_speed: f32,
    /// Propagation tile size; 0 keeps the raw per-pixel solution.
    pub region: usize,
    pub condition_limit: f32,
    pub discriminant_limit: f32,
}

impl Default for UrasParams {
    fn default() -> Self {
        UrasParams {
            sigma_s: 1.5,
            sigma_t: 1.5,
            max_speed: 20.0,
            region: 1,
            condition_limit: 10.0,
            discriminant_limit: 0.5,
        }
    }
}

/// Hessian flow estimator.
#[derive(Debug, Clone)]
pub struct Uras {
    params: UrasParams,
}

impl Uras {
    pub fn new(params: UrasParams) -> Result<Self> {
        require_non_negative("sigma_s", params.sigma_s)?;
        require_non_negative("sigma_t", params.sigma_t)?;
        require_positive("max_speed", params.max_speed)?;
        require_positive("condition_limit", params.condition_limit)?;
        require_positive("discriminant_limit", params.discriminant_limit)?;
        Ok(Uras { params })
    }

    pub fn params(&self) -> &UrasParams {
        &self.params
    }

    /// Frames read around the center: the temporal Gaussian plus the
    /// central difference along t.
    pub fn support(&self) -> usize {
        Kernel1D::gaussian(self.params.sigma_t).support() + CD_PLANES - 1
    }

    /// Compute the five second-order derivative planes at frame `center`.
    pub fn filter<T: Pixel>(&self, stack: &[Image<T>], center: usize) -> Result<UrasFiltered> {
        let (w, h) = check_support(stack, center, self.support())?;
        debug!(params = ?self.params, center, "uras filtering");

        let mut v = Volume::new(w, h, CD_PLANES);
        v.convolve_t_from_stack(stack, center, &Kernel1D::gaussian(self.params.sigma_t))?;
        v.convolve_xy(&Kernel1D::gaussian(self.params.sigma_s));

        let cd = Kernel1D::central_difference();
        let derive = |src: &Volume, axis: Axis| {
            let mut out = Volume::new(w, h, 1);
            out.convolve_1d(src, axis, &cd);
            out
        };
        let dx = derive(&v, Axis::X);
        let dy = derive(&v, Axis::Y);
        let dt = derive(&v, Axis::T);

        Ok(UrasFiltered {
            xx: derive(&dx, Axis::X),
            xy: derive(&dx, Axis::Y),
            yy: derive(&dy, Axis::Y),
            xt: derive(&dt, Axis::X),
            yt: derive(&dt, Axis::Y),
            params: self.params.clone(),
        })
    }
}

const CD_PLANES: usize = 5;

/// Second derivatives of one Uras pass.
#[derive(Debug, Clone)]
pub struct UrasFiltered {
    pub xx: Volume,
    pub xy: Volume,
    pub yy: Volume,
    pub xt: Volume,
    pub yt: Volume,
    params: UrasParams,
}

/// Raw per-pixel solution, image axes.
#[derive(Debug, Clone, Copy)]
struct Solve {
    v: [f64; 2],
    kappa: f64,
}

impl UrasFiltered {
    pub fn compute_full(self) -> Estimate {
        self.compute_full_with_progress(&mut |_| {})
    }

    pub fn compute_full_with_progress(self, progress: &mut dyn FnMut(f32)) -> Estimate {
        let mut progress = Progress::new(progress);
        let (w, h) = (self.xx.width(), self.xx.height());
        let mut field = FlowField::new(w, h);
        let edge = [&self.xx, &self.xy, &self.yy, &self.xt, &self.yt].map(Volume::edge);
        field.set_edge(edge.into_iter().max().unwrap_or(0));
        let mut report = PassReport::new("uras");

        let mut raw: Vec<Option<Solve>> = vec![None; w * h];
        for y in 0..h {
            for x in 0..w {
                if field.in_margin(x, y) {
                    continue;
                }
                match self.solve(x, y) {
                    Some(s) => raw[y * w + x] = Some(s),
                    None => {
                        if self.params.region == 0 {
                            report.reject(Rejection::Singular);
                        }
                    }
                }
            }
            progress.stage(0.0, 0.5, y + 1, h);
        }

        if self.params.region == 0 {
            for (i, s) in raw.iter().enumerate() {
                if let Some(s) = s {
                    field.set(i % w, i / w, to_field(s.v));
                }
            }
        } else {
            self.propagate(&raw, &mut field, &mut report, &mut progress);
        }

        report.finish(&field);
        progress.done();
        Estimate { field, report }
    }

    fn hessian(&self, x: usize, y: usize) -> [[f64; 2]; 2] {
        let xy = self.xy.get(x, y, 0) as f64;
        [[self.xx.get(x, y, 0) as f64, xy], [xy, self.yy.get(x, y, 0) as f64]]
    }

    fn temporal(&self, x: usize, y: usize) -> [f64; 2] {
        [self.xt.get(x, y, 0) as f64, self.yt.get(x, y, 0) as f64]
    }

    /// Closed-form solve of H·v = -(xt, yt), clamped to `max_speed`.
    fn solve(&self, x: usize, y: usize) -> Option<Solve> {
        let [[xx, xy], [_, yy]] = self.hessian(x, y);
        let [xt, yt] = self.temporal(x, y);
        let amp = xx * yy - xy * xy;
        if amp == 0.0 || !amp.is_finite() {
            return None;
        }
        let mut v = [(yt * xy - xt * yy) / amp, (xt * xy - yt * xx) / amp];
        let speed = v[0].hypot(v[1]);
        let max = self.params.max_speed as f64;
        if speed > max {
            v = [v[0] * max / speed, v[1] * max / speed];
        }
        let kappa = condition_number2(self.hessian(x, y)).unwrap_or(f64::INFINITY);
        Some(Solve { v, kappa })
    }

    /// `‖Hᵀ·∇U‖_F / ‖(xt, yt)‖`, with ∇U from central differences of the
    /// raw field. A missing neighbor zeroes that axis' derivative.
    fn discriminant(&self, raw: &[Option<Solve>], w: usize, x: usize, y: usize) -> f64 {
        let h = raw.len() / w;
        let at = |x: usize, y: usize| raw[y * w + x].map(|s| s.v);
        let diff = |a: Option<[f64; 2]>, b: Option<[f64; 2]>| match (a, b) {
            (Some(a), Some(b)) => [(b[0] - a[0]) / 2.0, (b[1] - a[1]) / 2.0],
            _ => [0.0, 0.0],
        };
        let d_dx = if x > 0 && x + 1 < w { diff(at(x - 1, y), at(x + 1, y)) } else { [0.0; 2] };
        let d_dy = if y > 0 && y + 1 < h { diff(at(x, y - 1), at(x, y + 1)) } else { [0.0; 2] };
        let jacobian = [[d_dx[0], d_dy[0]], [d_dx[1], d_dy[1]]];

        let [xt, yt] = self.temporal(x, y);
        let norm = xt.hypot(yt);
        if norm == 0.0 {
            return f64::INFINITY;
        }
        frobenius(&mat_mul(&transpose(&self.hessian(x, y)), &jacobian)) / norm
    }

    fn propagate(
        &self,
        raw: &[Option<Solve>],
        field: &mut FlowField,
        report: &mut PassReport,
        progress: &mut Progress<'_>,
    ) {
        let (w, h) = (field.width(), field.height());
        let region = self.params.region;
        let cond = self.params.condition_limit as f64;
        let disc = self.params.discriminant_limit as f64;
        let tiles_y = h.div_ceil(region);

        for (row, ty) in (0..h).step_by(region).enumerate() {
            for tx in (0..w).step_by(region) {
                let mut winner: Option<(f64, f64, [f64; 2])> = None;
                let mut cells = 0;
                for y in ty..(ty + region).min(h) {
                    for x in tx..(tx + region).min(w) {
                        if field.in_margin(x, y) {
                            continue;
                        }
                        cells += 1;
                        let Some(s) = raw[y * w + x] else { continue };
                        if s.kappa >= cond {
                            continue;
                        }
                        let d = self.discriminant(raw, w, x, y);
                        if d >= disc {
                            continue;
                        }
                        let better = match winner {
                            None => true,
                            Some((k, dd, _)) => s.kappa < k || (s.kappa == k && d < dd),
                        };
                        if better {
                            winner = Some((s.kappa, d, s.v));
                        }
                    }
                }

                match winner {
                    Some((_, _, v)) => {
                        for y in ty..(ty + region).min(h) {
                            for x in tx..(tx + region).min(w) {
                                field.set(x, y, to_field(v));
                            }
                        }
                    }
                    None => report.reject_many(Rejection::NoCandidate, cells),
                }
            }
            progress.stage(0.5, 1.0, row + 1, tiles_y);
        }
    }
}

/// Image-axis velocity to a field vector (y up).
fn to_field(v: [f64; 2]) -> FlowVector {
    FlowVector::full(v[0] as f32, -v[1] as f32)
}

impl<T: Pixel> Estimator<T> for Uras {
    fn name(&self) -> &'static str {
        "uras"
    }

    fn support(&self) -> usize {
        Uras::support(self)
    }

    fn estimate_with_progress(
        &self,
        stack: &[Image<T>],
        center: usize,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Estimate> {
        let _span = info_span!("uras", center).entered();
        let filtered = self.filter(stack, center)?;
        Ok(filtered.compute_full_with_progress(progress))
    }
}
