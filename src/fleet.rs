// fleet.rs — Phase-based flow after Fleet & Jepson (1990).
//
// A bank of complex 3D Gabor filters, each tuned to one spatial orientation
// and one speed, splits the sequence into narrow-band channels. In a narrow
// band, the phase φ of the response moves with the image far more reliably
// than the intensity does, so each channel contributes the constraint
//
//     φt + φx·u + φy·v = 0
//
// i.e. one normal velocity along ∇φ. Pooling the normals of all channels in
// a 5×5 window and fitting an affine motion model gives the full velocity.
//
// FILTER BANK
// 22 channels: 6 stationary (θ every 30°), 10 at speed 1/√3 (θ every 36°),
// 6 at speed √3 (θ every 60°). For bandwidth β = 0.8 octaves, b = 2^β:
//
//     ρ  = (b+1) / ((b-1)·σs·√(s²+1))       spatial tuning frequency
//     kt = -s·(b+1) / ((b-1)·σt·√(s²+1))    temporal tuning frequency
//     k  = (ρ cos θ, ρ sin θ, kt)
//
// PHASE GRADIENT
// Differentiating R directly would differentiate the carrier e^{ik·x} too.
// Instead the derivative is taken on the demodulated signal R·e^{-ik·x},
// which varies slowly, and the carrier term is added back:
//
//     ∂R ≈ Σ_q d(q)·e^{-ikq}·R(p+q) + i·k·R(p)
//     ∇φ = Im(R̄·∂R) / |R|²      ∇ρ/ρ = Re(R̄·∂R) / |R|²
//
// STABILITY
// A channel sample is kept only if its amplitude is a fair fraction of the
// strongest response anywhere, and if its local frequency (∇φ, ∇ρ/ρ) stays
// within τ·σk of the channel tuning. Near phase singularities both tests
// fail.
//
// Channels are filtered one at a time; only per-pixel phase data survives
// from one channel to the next.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, trace};

use crate::error::Result;
use crate::estimator::{check_support, require_positive, Estimate, Estimator, Progress};
use crate::flow::{FlowField, FlowVector};
use crate::image::{Image, Pixel};
use crate::kernel::{Axis, ComplexKernel, Kernel1D};
use crate::linalg::pseudoinverse;
use crate::report::{PassReport, Rejection};
use crate::volume::Volume;

/// Bandwidth in octaves.
const BETA: f32 = 0.8;

/// Planes of the filtered volume; the temporal demodulation reads all five.
const PLANES: usize = 5;

/// Halfwidth of the affine-fit window.
const FIT_RADIUS: usize = 2;

/// Singular values at or below this are dropped from the affine fit.
const SVD_TOLERANCE: f64 = 1e-9;

/// Normals shorter than this carry no direction.
const MIN_NORMAL: f32 = 1e-6;

/// Responses below this (intensity units) are rounding noise.
const MIN_AMPLITUDE: f32 = 1e-2;

/// Fleet-Jepson configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetJepsonParams {
    pub sigma_s: f32,
    pub sigma_t: f32,
    /// Frequency-deviation limit, in units of the channel bandwidth σk.
    pub tau: f32,
    /// Amplitude floor as a fraction of the strongest response.
    pub amplitude_fraction: f32,
    pub condition_limit: f32,
    pub residual_limit: f32,
}

impl Default for FleetJepsonParams {
    fn default() -> Self {
        FleetJepsonParams {
            sigma_s: 2.5,
            sigma_t: 2.5,
            tau: 2.5,
            amplitude_fraction: 0.05,
            condition_limit: 10.0,
            residual_limit: 0.5,
        }
    }
}

/// One velocity-tuned filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Channel {
    /// Spatial orientation, radians.
    pub theta: f32,
    /// Tuned speed, pixels per frame.
    pub speed: f32,
    /// Tuning frequency (kx, ky, kt), image axes.
    pub k: [f32; 3],
}

impl Channel {
    /// Radial bandwidth `‖k‖·(b-1)/(b+1)`.
    pub fn sigma_k(&self) -> f32 {
        let b = 2f32.powf(BETA);
        norm3(self.k) * (b - 1.0) / (b + 1.0)
    }
}

/// The 22-channel bank for the given envelopes.
pub fn channels(sigma_s: f32, sigma_t: f32) -> Vec<Channel> {
    let b = 2f32.powf(BETA);
    let c = (b + 1.0) / (b - 1.0);
    let sqrt3 = 3f32.sqrt();
    let mut bank = Vec::with_capacity(22);
    let rings = [(6, 30.0f32, 0.0f32), (10, 36.0, 1.0 / sqrt3), (6, 60.0, sqrt3)];
    for (count, step_deg, speed) in rings {
        let norm = (speed * speed + 1.0).sqrt();
        let rho = c / (sigma_s * norm);
        let kt = -speed * c / (sigma_t * norm);
        for j in 0..count {
            let theta = (j as f32 * step_deg).to_radians();
            bank.push(Channel {
                theta,
                speed,
                k: [rho * theta.cos(), rho * theta.sin(), kt],
            });
        }
    }
    bank
}

/// Phase-based estimator.
#[derive(Debug, Clone)]
pub struct FleetJepson {
    params: FleetJepsonParams,
}

impl FleetJepson {
    pub fn new(params: FleetJepsonParams) -> Result<Self> {
        require_positive("sigma_s", params.sigma_s)?;
        require_positive("sigma_t", params.sigma_t)?;
        require_positive("tau", params.tau)?;
        require_positive("amplitude_fraction", params.amplitude_fraction)?;
        require_positive("condition_limit", params.condition_limit)?;
        require_positive("residual_limit", params.residual_limit)?;
        Ok(FleetJepson { params })
    }

    pub fn params(&self) -> &FleetJepsonParams {
        &self.params
    }

    pub fn support(&self) -> usize {
        Kernel1D::gaussian(self.params.sigma_t).support() + PLANES - 1
    }

    /// Run every channel and keep its amplitude, phase gradient and
    /// frequency deviation on the center plane.
    pub fn filter<T: Pixel>(&self, stack: &[Image<T>], center: usize) -> Result<FleetJepsonFiltered> {
        self.filter_with_progress(stack, center, &mut Progress::new(&mut |_| {}))
    }

    fn filter_with_progress<T: Pixel>(
        &self,
        stack: &[Image<T>],
        center: usize,
        progress: &mut Progress<'_>,
    ) -> Result<FleetJepsonFiltered> {
        let (w, h) = check_support(stack, center, self.support())?;
        let bank = channels(self.params.sigma_s, self.params.sigma_t);
        debug!(params = ?self.params, channels = bank.len(), center, "fleet-jepson filtering");

        let g_s = Kernel1D::gaussian(self.params.sigma_s);
        let g_t = Kernel1D::gaussian(self.params.sigma_t);
        let mut smoothed = Volume::new(w, h, PLANES);
        smoothed.convolve_t_from_stack(stack, center, &g_t)?;
        smoothed.convolve_xy(&g_s);

        let mut phases = Vec::with_capacity(bank.len());
        let mut global_max = 0.0f32;
        for (i, channel) in bank.iter().enumerate() {
            let (re, im) = self.response(stack, center, channel, &smoothed)?;

            let mut amp = Volume::product(&re, &re);
            amp.add(&Volume::product(&im, &im));
            amp.sqrt();
            let max = amp.max_abs_valid(amp.center());
            global_max = global_max.max(max);
            trace!(channel = i, theta = channel.theta, speed = channel.speed, max, "channel filtered");

            phases.push(ChannelPhase::extract(channel, &re, &im, &amp));
            progress.stage(0.0, 0.8, i + 1, bank.len());
        }

        let edge = smoothed.edge() + Kernel1D::central_difference().halfwidth();
        Ok(FleetJepsonFiltered {
            width: w,
            height: h,
            edge,
            channels: phases,
            global_max,
            params: self.params.clone(),
        })
    }

    /// Complex response of one channel, DC leak removed from the real part.
    fn response<T: Pixel>(
        &self,
        stack: &[Image<T>],
        center: usize,
        channel: &Channel,
        smoothed: &Volume,
    ) -> Result<(Volume, Volume)> {
        let (w, h) = stack[center].dimensions();
        let [kx, ky, kt] = channel.k;
        let gx = ComplexKernel::gabor(self.params.sigma_s, kx);
        let gy = ComplexKernel::gabor(self.params.sigma_s, ky);
        let gt = ComplexKernel::gabor(self.params.sigma_t, kt);

        let mut re = Volume::new(w, h, PLANES);
        re.convolve_t_from_stack(stack, center, &gt.re)?;
        let mut im = Volume::new(w, h, PLANES);
        im.convolve_t_from_stack(stack, center, &gt.im)?;

        let (re, im) = complex_pass(&re, &im, Axis::X, &gx);
        let (mut re, im) = complex_pass(&re, &im, Axis::Y, &gy);

        let dc = gx.dc_response() * gy.dc_response() * gt.dc_response();
        re.add_scaled(smoothed, -dc);
        Ok((re, im))
    }
}

/// `(re + i·im) ⋆ (kr + i·ki)` along one axis.
fn complex_pass(re: &Volume, im: &Volume, axis: Axis, kernel: &ComplexKernel) -> (Volume, Volume) {
    let conv = |src: &Volume, k: &Kernel1D| {
        let mut out = Volume::new(src.width(), src.height(), src.depth());
        out.convolve_1d(src, axis, k);
        out
    };
    let mut out_re = conv(re, &kernel.re);
    out_re.sub(&conv(im, &kernel.im));
    let mut out_im = conv(re, &kernel.im);
    out_im.add(&conv(im, &kernel.re));
    (out_re, out_im)
}

/// Center-plane phase data of one channel.
#[derive(Debug, Clone)]
pub struct ChannelPhase {
    pub channel: Channel,
    pub amplitude: Vec<f32>,
    /// (φx, φy, φt) per pixel.
    pub gradient: Vec<[f32; 3]>,
    /// `‖∇ρ/ρ‖² + ‖∇φ - k‖²` per pixel; infinite where the phase is undefined.
    pub deviation: Vec<f32>,
}

impl ChannelPhase {
    fn extract(channel: &Channel, re: &Volume, im: &Volume, amp: &Volume) -> Self {
        let (w, h) = (re.width(), re.height());
        let c = re.center();
        let edge = re.edge() + Kernel1D::central_difference().halfwidth();
        let demod = channel.k.map(ComplexKernel::demodulation);
        let r = |x: usize, y: usize, t: usize| Complex32::new(re.get(x, y, t), im.get(x, y, t));

        let mut out = ChannelPhase {
            channel: *channel,
            amplitude: vec![0.0; w * h],
            gradient: vec![[0.0; 3]; w * h],
            deviation: vec![f32::INFINITY; w * h],
        };
        if 2 * edge >= w || 2 * edge >= h {
            return out;
        }

        let hw = demod[0].halfwidth() as isize;
        for y in edge..h - edge {
            for x in edge..w - edge {
                let i = y * w + x;
                out.amplitude[i] = amp.get(x, y, c);
                let r0 = r(x, y, c);
                let power = r0.norm_sqr();
                if power == 0.0 {
                    continue;
                }

                let mut deviation = 0.0;
                for (a, dm) in demod.iter().enumerate() {
                    let mut d = Complex32::new(0.0, channel.k[a]) * r0;
                    for q in -hw..=hw {
                        let tap = Complex32::new(dm.re.at(q), dm.im.at(q));
                        let (qx, qy, qt) = match a {
                            0 => (q, 0, 0),
                            1 => (0, q, 0),
                            _ => (0, 0, q),
                        };
                        let sample = r(
                            (x as isize + qx) as usize,
                            (y as isize + qy) as usize,
                            (c as isize + qt) as usize,
                        );
                        d += tap * sample;
                    }
                    let z = r0.conj() * d / power;
                    out.gradient[i][a] = z.im;
                    deviation += z.re * z.re + (z.im - channel.k[a]).powi(2);
                }
                out.deviation[i] = deviation;
            }
        }
        out
    }
}

/// Phase data of every channel for one frame.
#[derive(Debug, Clone)]
pub struct FleetJepsonFiltered {
    pub width: usize,
    pub height: usize,
    /// Margin of the phase data.
    pub edge: usize,
    pub channels: Vec<ChannelPhase>,
    /// Largest response amplitude over all channels.
    pub global_max: f32,
    params: FleetJepsonParams,
}

impl FleetJepsonFiltered {
    /// Stable component velocities of every channel.
    pub fn normals(&self, amplitude_fraction: f32, tau: f32) -> NormalBank {
        let floor = amplitude_fraction * self.global_max;
        let mut report = PassReport::new("fleet-jepson");
        let mut fields = Vec::with_capacity(self.channels.len());

        for phase in &self.channels {
            let mut field = FlowField::new(self.width, self.height);
            field.set_edge(self.edge);
            let limit = (tau * phase.channel.sigma_k()).powi(2);
            for y in 0..self.height {
                for x in 0..self.width {
                    if field.in_margin(x, y) {
                        continue;
                    }
                    let i = y * self.width + x;
                    let amp = phase.amplitude[i];
                    if amp < floor || amp < MIN_AMPLITUDE {
                        report.reject(Rejection::LowAmplitude);
                        continue;
                    }
                    if phase.deviation[i] > limit {
                        report.reject(Rejection::PhaseInconsistent);
                        continue;
                    }
                    let [px, py, pt] = phase.gradient[i];
                    let spatial = px * px + py * py;
                    if spatial == 0.0 {
                        report.reject(Rejection::PhaseInconsistent);
                        continue;
                    }
                    let s = -pt / spatial;
                    field.set(x, y, FlowVector::normal(s * px, -s * py));
                }
            }
            fields.push(field);
        }

        NormalBank {
            width: self.width,
            height: self.height,
            edge: self.edge,
            fields,
            report,
        }
    }

    pub fn compute_full(self) -> Estimate {
        let p = self.params.clone();
        self.normals(p.amplitude_fraction, p.tau)
            .compute_full(p.condition_limit as f64, p.residual_limit as f64)
    }
}

/// Per-channel normal velocities (y up), one field per channel.
#[derive(Debug, Clone)]
pub struct NormalBank {
    pub width: usize,
    pub height: usize,
    pub edge: usize,
    pub fields: Vec<FlowField>,
    report: PassReport,
}

impl NormalBank {
    /// Channel samples rejected so far.
    pub fn report(&self) -> &PassReport {
        &self.report
    }

    /// Number of normals available at (x, y) over all channels.
    pub fn count_at(&self, x: usize, y: usize) -> usize {
        self.fields.iter().filter(|f| !f.get(x, y).is_invalid()).count()
    }

    pub fn compute_full(self, condition_limit: f64, residual_limit: f64) -> Estimate {
        let mut sink = |_: f32| {};
        let mut progress = Progress::new(&mut sink);
        self.compute_full_with_progress(condition_limit, residual_limit, &mut progress)
    }

    fn compute_full_with_progress(
        self,
        condition_limit: f64,
        residual_limit: f64,
        progress: &mut Progress<'_>,
    ) -> Estimate {
        let mut report = self.report.clone();
        let mut field = FlowField::new(self.width, self.height);
        field.set_edge(self.edge + FIT_RADIUS);

        for y in 0..self.height {
            for x in 0..self.width {
                if field.in_margin(x, y) {
                    continue;
                }
                match self.fit(x, y, condition_limit, residual_limit) {
                    Ok(v) => field.set(x, y, v),
                    Err(reason) => report.reject(reason),
                }
            }
            progress.stage(0.8, 1.0, y + 1, self.height);
        }

        report.finish(&field);
        progress.done();
        Estimate { field, report }
    }

    /// Least-squares affine fit of the normals in the window around (x, y).
    fn fit(
        &self,
        x: usize,
        y: usize,
        condition_limit: f64,
        residual_limit: f64,
    ) -> std::result::Result<FlowVector, Rejection> {
        let r = FIT_RADIUS as isize;
        let mut rows: Vec<[f64; 6]> = Vec::new();
        let mut targets: Vec<f64> = Vec::new();
        for m in -r..=r {
            for l in -r..=r {
                let (nx, ny) = ((x as isize + l) as usize, (y as isize + m) as usize);
                for f in &self.fields {
                    let FlowVector::Normal { vx, vy } = f.get(nx, ny) else { continue };
                    let mag = vx.hypot(vy);
                    if mag <= MIN_NORMAL {
                        continue;
                    }
                    let (ux, uy) = ((vx / mag) as f64, (vy / mag) as f64);
                    let (l, m) = (l as f64, m as f64);
                    rows.push([ux, ux * l, ux * m, uy, uy * l, uy * m]);
                    targets.push(mag as f64);
                }
            }
        }
        if rows.len() < 6 {
            return Err(Rejection::TooFewConstraints);
        }

        let j = DMatrix::from_fn(rows.len(), 6, |i, c| rows[i][c]);
        let s = DVector::from_vec(targets);
        let pinv = pseudoinverse(&j, SVD_TOLERANCE);
        if pinv.rank < 6 || pinv.condition >= condition_limit {
            return Err(Rejection::IllConditioned);
        }
        let alpha = pinv.solve(&s);
        let residual = (&s - &j * &alpha).norm() / s.norm();
        if residual >= residual_limit {
            return Err(Rejection::LargeResidual);
        }
        Ok(FlowVector::full(alpha[0] as f32, alpha[3] as f32))
    }
}

fn norm3(v: [f32; 3]) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

impl<T: Pixel> Estimator<T> for FleetJepson {
    fn name(&self) -> &'static str {
        "fleet-jepson"
    }

    fn support(&self) -> usize {
        FleetJepson::support(self)
    }

    fn estimate_with_progress(
        &self,
        stack: &[Image<T>],
        center: usize,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Estimate> {
        let _span = info_span!("fleet_jepson", center).entered();
        let mut progress = Progress::new(progress);
        let filtered = self.filter_with_progress(stack, center, &mut progress)?;
        let p = &self.params;
        Ok(filtered
            .normals(p.amplitude_fraction, p.tau)
            .compute_full_with_progress(p.condition_limit as f64, p.residual_limit as f64, &mut progress))
    }
}
