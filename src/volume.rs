// volume.rs — Dense (x, y, t) float volume with edge-margin bookkeeping.
//
// Storage is plane-major: `data[t * width * height + y * width + x]`, i.e.
// time is the slowest-varying axis, matching the way frames arrive.
//
// THE EDGE MARGIN
// Convolutions here never read outside the data and never clamp or mirror.
// Instead, every pass records how far its kernel reaches into the image,
// separately for x and y:
//
//     out.margin[axis] = src.margin[axis] + reach of the kernel on that axis
//
// and only pixels inside both margins are computed; everything else is
// written as 0. Chaining passes therefore accumulates the margin, while a
// separable x-then-y pass costs its halfwidth once per axis, exactly like
// the 2D kernel it factors. `edge()` is the larger of the two margins; each
// estimator copies it into its FlowField, so pixels whose neighborhood ran
// off the image are Invalid by construction.
//
//   src.edge = 2        after a 5-tap x pass: margin x = 4, y = 2
//   ┌───────────────┐   ┌───────────────┐
//   │ . . . . . . . │   │ . . . . . . . │
//   │ . ■ ■ ■ ■ ■ . │   │ . . . . . . . │
//   │ . ■ ■ ■ ■ ■ . │   │ . . . ■ . . . │
//   │ . ■ ■ ■ ■ ■ . │   │ . . . . . . . │
//   └───────────────┘   └───────────────┘
//
// TIME
// Temporal reach is paid in depth, not in margin: a t-pass with halfwidth h
// maps a source of depth D to at most D - 2h output planes. When the output
// is shallower than the source, it is aligned on the source's central planes
// (offset (D - d) / 2), so "plane depth/2" is always the center frame.
//
// Every pass is a direct sum over a precomputed tap list, so 1D, 2D and 3D
// kernels share a single inner loop.

use crate::error::{FlowError, Result};
use crate::image::{Image, Pixel};
use crate::kernel::{Axis, Kernel, Kernel1D, Kernel2D, Kernel3D};

/// A 3D grid of f32 samples over (x, y, t).
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    width: usize,
    height: usize,
    depth: usize,
    /// Margins along x and y.
    margin: [usize; 2],
    data: Vec<f32>,
}

impl Volume {
    /// Zero-filled volume with no margin.
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Volume {
            width,
            height,
            depth,
            margin: [0, 0],
            data: vec![0.0; width * height * depth],
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Current margin: pixels closer than this to any border may be invalid.
    #[inline]
    pub fn edge(&self) -> usize {
        self.margin[0].max(self.margin[1])
    }

    /// Index of the central plane.
    #[inline]
    pub fn center(&self) -> usize {
        self.depth / 2
    }

    /// True if (x, y) lies inside the margin on both axes.
    #[inline]
    pub fn valid(&self, x: usize, y: usize) -> bool {
        let [mx, my] = self.margin;
        x >= mx && y >= my && x + mx < self.width && y + my < self.height
    }

    /// Sample at (x, y, t).
    ///
    /// # Panics
    /// Panics if out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize, t: usize) -> f32 {
        self.data[self.index(x, y, t)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, t: usize, value: f32) {
        let i = self.index(x, y, t);
        self.data[i] = value;
    }

    /// One time plane, row-major.
    pub fn plane(&self, t: usize) -> &[f32] {
        assert!(t < self.depth, "plane {t} out of range (depth {})", self.depth);
        let n = self.width * self.height;
        &self.data[t * n..(t + 1) * n]
    }

    #[inline]
    fn index(&self, x: usize, y: usize, t: usize) -> usize {
        assert!(
            x < self.width && y < self.height && t < self.depth,
            "sample ({x},{y},{t}) out of bounds for volume {}×{}×{}",
            self.width,
            self.height,
            self.depth,
        );
        (t * self.height + y) * self.width + x
    }

    // -----------------------------------------------------------------------
    // Filling from a stack
    // -----------------------------------------------------------------------

    /// Copy `depth` consecutive frames starting at `start`.
    pub fn load<T: Pixel>(&mut self, stack: &[Image<T>], start: usize) -> Result<()> {
        self.check_stack(stack)?;
        if start + self.depth > stack.len() {
            return Err(FlowError::InsufficientFrames {
                required: start + self.depth,
                available: stack.len(),
            });
        }
        let n = self.width * self.height;
        for (t, frame) in stack[start..start + self.depth].iter().enumerate() {
            for (dst, src) in self.data[t * n..(t + 1) * n].iter_mut().zip(frame.as_slice()) {
                *dst = src.to_f32();
            }
        }
        self.margin = [0, 0];
        Ok(())
    }

    /// Temporal convolution straight from the stack.
    ///
    /// Output plane `i` is centered on frame `center + i - depth/2` and equals
    /// `Σ_q kernel(q) · frame[center + i - depth/2 + q]`. Fails if any of
    /// those frames is missing.
    pub fn convolve_t_from_stack<T: Pixel>(
        &mut self,
        stack: &[Image<T>],
        center: usize,
        kernel: &Kernel1D,
    ) -> Result<()> {
        self.check_stack(stack)?;
        let h = kernel.halfwidth();
        let before = self.depth / 2 + h;
        let after = self.depth - 1 - self.depth / 2 + h;
        if stack.len() < before + after + 1 {
            return Err(FlowError::InsufficientFrames {
                required: before + after + 1,
                available: stack.len(),
            });
        }
        if center < before || center + after >= stack.len() {
            return Err(FlowError::CenterOutOfRange {
                center,
                min: before,
                max: stack.len() - 1 - after,
            });
        }

        let n = self.width * self.height;
        self.data.fill(0.0);
        for i in 0..self.depth {
            let plane = &mut self.data[i * n..(i + 1) * n];
            let frame_center = center + i - self.depth / 2;
            for (q, &w) in kernel.weights().iter().enumerate() {
                if w == 0.0 {
                    continue;
                }
                let frame = &stack[frame_center + q - h];
                for (dst, src) in plane.iter_mut().zip(frame.as_slice()) {
                    *dst += w * src.to_f32();
                }
            }
        }
        self.margin = [0, 0];
        Ok(())
    }

    fn check_stack<T: Pixel>(&self, stack: &[Image<T>]) -> Result<()> {
        for (index, frame) in stack.iter().enumerate() {
            if frame.dimensions() != (self.width, self.height) {
                return Err(FlowError::DimensionMismatch {
                    index,
                    width: self.width,
                    height: self.height,
                    found_width: frame.width(),
                    found_height: frame.height(),
                });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Convolution
    // -----------------------------------------------------------------------

    /// Convolve `src` along `axis`, writing into `self`.
    ///
    /// 2D kernels run across y (for X and T) or across x (for Y); 3D kernels
    /// run across the two remaining axes. See `TapSet` for the layout.
    ///
    /// # Panics
    /// Panics if the spatial sizes differ, or if `src` lacks the planes the
    /// kernel needs (`src.depth < self.depth + 2·temporal reach`).
    pub fn convolve(&mut self, src: &Volume, axis: Axis, kernel: &Kernel) {
        let taps = match kernel {
            Kernel::Dim1(k) => TapSet::dim1(k, axis),
            Kernel::Dim2(k) => TapSet::dim2(k, axis),
            Kernel::Dim3(k) => TapSet::dim3(k, axis),
        };
        self.apply(src, &taps);
    }

    /// Same as `convolve` for the common 1D case.
    pub fn convolve_1d(&mut self, src: &Volume, axis: Axis, kernel: &Kernel1D) {
        self.apply(src, &TapSet::dim1(kernel, axis));
    }

    /// Smooth in place with `kernel` along x, then along y.
    pub fn convolve_xy(&mut self, kernel: &Kernel1D) {
        let mut along_x = Volume::new(self.width, self.height, self.depth);
        along_x.convolve_1d(self, Axis::X, kernel);
        self.convolve_1d(&along_x, Axis::Y, kernel);
    }

    /// Frame-to-frame difference `v[i] = src[i + 1] - src[i]`, on the
    /// source's central planes.
    ///
    /// # Panics
    /// Panics if `src.depth < self.depth + 1` or the spatial sizes differ.
    pub fn frame_difference(&mut self, src: &Volume) {
        self.assert_same_plane(src);
        assert!(
            src.depth > self.depth,
            "difference of {} planes needs a source deeper than {}",
            self.depth,
            src.depth
        );
        let offset = (src.depth - 1 - self.depth) / 2;
        let n = self.width * self.height;
        for t in 0..self.depth {
            let a = &src.data[(t + offset) * n..(t + offset + 1) * n];
            let b = &src.data[(t + offset + 1) * n..(t + offset + 2) * n];
            for ((dst, &a), &b) in self.data[t * n..(t + 1) * n].iter_mut().zip(a).zip(b) {
                *dst = b - a;
            }
        }
        self.margin = src.margin;
    }

    fn apply(&mut self, src: &Volume, taps: &TapSet) {
        self.assert_same_plane(src);
        assert!(
            src.depth >= self.depth + 2 * taps.temporal,
            "{} output planes with temporal reach {} need {} source planes, got {}",
            self.depth,
            taps.temporal,
            self.depth + 2 * taps.temporal,
            src.depth,
        );

        let (w, h) = (self.width, self.height);
        let n = w * h;
        let offset = (src.depth - self.depth) / 2;
        let offsets: Vec<(isize, f32)> = taps
            .taps
            .iter()
            .map(|&(dx, dy, dt, wt)| ((dt * n as isize) + dy * w as isize + dx, wt))
            .collect();

        self.margin = [src.margin[0] + taps.reach[0], src.margin[1] + taps.reach[1]];
        self.data.fill(0.0);
        let [mx, my] = self.margin;
        if 2 * mx >= w || 2 * my >= h {
            return;
        }
        for t in 0..self.depth {
            for y in my..h - my {
                let row = (t * h + y) * w;
                let src_row = ((t + offset) * h + y) * w;
                for x in mx..w - mx {
                    let base = (src_row + x) as isize;
                    let mut acc = 0.0f32;
                    for &(o, wt) in &offsets {
                        acc += wt * src.data[(base + o) as usize];
                    }
                    self.data[row + x] = acc;
                }
            }
        }
    }

    fn assert_same_plane(&self, other: &Volume) {
        assert!(
            self.width == other.width && self.height == other.height,
            "volume {}×{} does not match {}×{}",
            self.width,
            self.height,
            other.width,
            other.height,
        );
    }

    fn assert_same_shape(&self, other: &Volume) {
        self.assert_same_plane(other);
        assert_eq!(self.depth, other.depth, "volume depths differ");
    }

    // -----------------------------------------------------------------------
    // Element-wise arithmetic
    // -----------------------------------------------------------------------
    // Binary ops keep the larger of the two margins.

    pub fn add(&mut self, other: &Volume) {
        self.zip_with(other, |a, b| a + b);
    }

    pub fn sub(&mut self, other: &Volume) {
        self.zip_with(other, |a, b| a - b);
    }

    pub fn mul(&mut self, other: &Volume) {
        self.zip_with(other, |a, b| a * b);
    }

    /// `self += c · other`.
    pub fn add_scaled(&mut self, other: &Volume, c: f32) {
        self.zip_with(other, |a, b| a + c * b);
    }

    pub fn scale(&mut self, c: f32) {
        for v in &mut self.data {
            *v *= c;
        }
    }

    pub fn sqrt(&mut self) {
        for v in &mut self.data {
            *v = v.sqrt();
        }
    }

    /// Element-wise product of two volumes as a new volume.
    pub fn product(a: &Volume, b: &Volume) -> Volume {
        let mut out = a.clone();
        out.mul(b);
        out
    }

    fn zip_with(&mut self, other: &Volume, f: impl Fn(f32, f32) -> f32) {
        self.assert_same_shape(other);
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a = f(*a, b);
        }
        self.margin = [
            self.margin[0].max(other.margin[0]),
            self.margin[1].max(other.margin[1]),
        ];
    }

    /// Largest |value| over the valid pixels of plane `t` (0 if none).
    pub fn max_abs_valid(&self, t: usize) -> f32 {
        let plane = self.plane(t);
        let [mx, my] = self.margin;
        let mut max = 0.0f32;
        for y in my..self.height.saturating_sub(my) {
            for x in mx..self.width.saturating_sub(mx) {
                max = max.max(plane[y * self.width + x].abs());
            }
        }
        max
    }
}

// ---------------------------------------------------------------------------
// Tap lists
// ---------------------------------------------------------------------------
// A kernel applied along an axis becomes a list of (dx, dy, dt, weight).
//
//   shape  axis   a (along)  b (across)  c (across)
//   1D     X/Y/T  axis       -           -
//   2D     X      x          y           -
//   2D     Y      y          x           -
//   2D     T      t          y           -
//   3D     X      x          y           t
//   3D     Y      y          x           t
//   3D     T      t          x           y

struct TapSet {
    taps: Vec<(isize, isize, isize, f32)>,
    /// Reach along x and y; the kernel's full halfwidth even where its
    /// outermost taps happen to be zero.
    reach: [usize; 2],
    temporal: usize,
}

impl TapSet {
    fn dim1(k: &Kernel1D, axis: Axis) -> Self {
        let h = k.halfwidth() as isize;
        let taps = (-h..=h)
            .filter(|&q| k.at(q) != 0.0)
            .map(|q| match axis {
                Axis::X => (q, 0, 0, k.at(q)),
                Axis::Y => (0, q, 0, k.at(q)),
                Axis::T => (0, 0, q, k.at(q)),
            })
            .collect();
        let hw = k.halfwidth();
        let (reach, temporal) = match axis {
            Axis::X => ([hw, 0], 0),
            Axis::Y => ([0, hw], 0),
            Axis::T => ([0, 0], hw),
        };
        TapSet { taps, reach, temporal }
    }

    fn dim2(k: &Kernel2D, axis: Axis) -> Self {
        let h = k.halfwidth() as isize;
        let mut taps = Vec::new();
        for a in -h..=h {
            for b in -h..=h {
                let wt = k.at(a, b);
                if wt == 0.0 {
                    continue;
                }
                taps.push(match axis {
                    Axis::X => (a, b, 0, wt),
                    Axis::Y => (b, a, 0, wt),
                    Axis::T => (0, b, a, wt),
                });
            }
        }
        let hw = k.halfwidth();
        let (reach, temporal) = match axis {
            Axis::X | Axis::Y => ([hw, hw], 0),
            Axis::T => ([0, hw], hw),
        };
        TapSet { taps, reach, temporal }
    }

    fn dim3(k: &Kernel3D, axis: Axis) -> Self {
        let h = k.halfwidth() as isize;
        let mut taps = Vec::new();
        for a in -h..=h {
            for b in -h..=h {
                for c in -h..=h {
                    let wt = k.at(a, b, c);
                    if wt == 0.0 {
                        continue;
                    }
                    taps.push(match axis {
                        Axis::X => (a, b, c, wt),
                        Axis::Y => (b, a, c, wt),
                        Axis::T => (b, c, a, wt),
                    });
                }
            }
        }
        let hw = k.halfwidth();
        TapSet {
            taps,
            reach: [hw, hw],
            temporal: hw,
        }
    }
}
