// flow.rs — Flow vectors, flow fields and the Burkitt binary format.
//
// AXIS CONVENTION
// Velocities are in grid units per frame. vx grows to the right (increasing
// column); vy grows *upward* (decreasing row). This is the convention of
// Barron, Fleet & Beauchemin's test sequences and of the Burkitt files they
// ship with, so fields written here compare directly against published
// ground truth. The estimators work in image axes internally and flip vy
// when they store a result.
//
// VALIDITY
// Every cell is a tri-state FlowVector. The Burkitt format has no validity
// flag and marks missing data with the pair (100, 100); that sentinel lives
// only in read_burkitt / write_burkitt below.
//
// FILE LAYOUT (little-endian f32)
//
//   width  height  computedWidth  computedHeight  xOffset  yOffset
//   vx vy  vx vy  ...  (width pairs)      ← row 0
//   ...                                    ← height rows
//
// computedWidth × computedHeight at (xOffset, yOffset) is the populated
// sub-rectangle; cells outside it read back as Invalid.

use std::f32::consts::{FRAC_PI_2, TAU};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::image::Image;

/// Sentinel component value for "no data" in Burkitt files.
pub const BURKITT_INVALID: f32 = 100.0;

// Largest grid a header may declare: 4096 × 4096.
const MAX_CELLS: usize = 1 << 24;

const HEADER_BYTES: u64 = 24;

// ---------------------------------------------------------------------------
// FlowVector
// ---------------------------------------------------------------------------

/// Velocity at one pixel, tagged with how much of it is known.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum FlowVector {
    /// Both components reliably determined.
    Full { vx: f32, vy: f32 },
    /// Only the component along the local gradient is known (aperture problem).
    Normal { vx: f32, vy: f32 },
    /// No usable estimate.
    #[default]
    Invalid,
}

impl FlowVector {
    #[inline]
    pub fn full(vx: f32, vy: f32) -> Self {
        FlowVector::Full { vx, vy }
    }

    #[inline]
    pub fn normal(vx: f32, vy: f32) -> Self {
        FlowVector::Normal { vx, vy }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        matches!(self, FlowVector::Full { .. })
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        matches!(self, FlowVector::Invalid)
    }

    /// Components of a Full or Normal vector.
    pub fn components(&self) -> Option<(f32, f32)> {
        match *self {
            FlowVector::Full { vx, vy } | FlowVector::Normal { vx, vy } => Some((vx, vy)),
            FlowVector::Invalid => None,
        }
    }

    /// Components of a Full vector only.
    pub fn full_components(&self) -> Option<(f32, f32)> {
        match *self {
            FlowVector::Full { vx, vy } => Some((vx, vy)),
            _ => None,
        }
    }

    /// Euclidean length of a Full or Normal vector.
    pub fn magnitude(&self) -> Option<f32> {
        self.components().map(|(vx, vy)| vx.hypot(vy))
    }
}

/// Rectangular to polar: `(magnitude, angle)` with angle in `[0, 2π)`.
pub fn polar(vx: f32, vy: f32) -> (f32, f32) {
    let mut angle = vy.atan2(vx);
    if angle < 0.0 {
        angle += TAU;
    }
    // -ε + 2π rounds to exactly 2π in f32.
    if angle >= TAU {
        angle = 0.0;
    }
    (vx.hypot(vy), angle)
}

/// Polar to rectangular.
pub fn from_polar(magnitude: f32, angle: f32) -> (f32, f32) {
    (magnitude * angle.cos(), magnitude * angle.sin())
}

// ---------------------------------------------------------------------------
// Calibration and regions
// ---------------------------------------------------------------------------

/// Physical scale for display strings. Never used in computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Physical size of one pixel, in `units`.
    pub pixel_size: f32,
    pub units: String,
    /// Seconds between frames; `None` reports speeds per frame.
    pub frame_interval: Option<f32>,
}

impl Calibration {
    /// Format a speed given in pixels per frame, e.g. `"1.25 µm/frame"`.
    pub fn magnitude_string(&self, magnitude: f32) -> String {
        let distance = magnitude * self.pixel_size;
        match self.frame_interval {
            Some(dt) if dt > 0.0 => format!("{:.2} {}/s", distance / dt, self.units),
            _ => format!("{:.2} {}/frame", distance, self.units),
        }
    }
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Region {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Region { x, y, width, height }
    }

    #[inline]
    pub fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }
}

// ---------------------------------------------------------------------------
// FlowField
// ---------------------------------------------------------------------------

/// A width × height grid of flow vectors with an always-Invalid margin.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    width: usize,
    height: usize,
    edge: usize,
    data: Vec<FlowVector>,
    calibration: Option<Calibration>,
}

impl FlowField {
    /// All-Invalid field.
    pub fn new(width: usize, height: usize) -> Self {
        FlowField {
            width,
            height,
            edge: 0,
            data: vec![FlowVector::Invalid; width * height],
            calibration: None,
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
    pub fn edge(&self) -> usize {
        self.edge
    }

    /// Set the margin, invalidating every cell inside it.
    pub fn set_edge(&mut self, edge: usize) {
        self.edge = edge;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.in_margin(x, y) {
                    self.data[y * self.width + x] = FlowVector::Invalid;
                }
            }
        }
    }

    /// True if (x, y) lies within `edge` of a border.
    #[inline]
    pub fn in_margin(&self, x: usize, y: usize) -> bool {
        x < self.edge || y < self.edge || x + self.edge >= self.width || y + self.edge >= self.height
    }

    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> FlowVector {
        self.bounds_check(x, y);
        self.data[y * self.width + x]
    }

    /// Store `v` at (x, y). Inside the margin the cell stays Invalid.
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, v: FlowVector) {
        self.bounds_check(x, y);
        let v = if self.in_margin(x, y) { FlowVector::Invalid } else { v };
        self.data[y * self.width + x] = v;
    }

    /// Iterate over `(x, y, vector)` in raster order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, FlowVector)> + '_ {
        let w = self.width;
        self.data.iter().enumerate().map(move |(i, &v)| (i % w, i / w, v))
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    pub fn set_calibration(&mut self, calibration: Option<Calibration>) {
        self.calibration = calibration;
    }

    /// Number of Full cells.
    pub fn count_full(&self) -> usize {
        self.data.iter().filter(|v| v.is_full()).count()
    }

    /// Fraction of all cells that are Full.
    pub fn density(&self) -> f32 {
        if self.data.is_empty() {
            0.0
        } else {
            self.count_full() as f32 / self.data.len() as f32
        }
    }

    /// Magnitude at (x, y) for Full or Normal cells.
    pub fn magnitude(&self, x: usize, y: usize) -> Option<f32> {
        self.get(x, y).magnitude()
    }

    /// Mean of the Full vectors inside `region` (whole field if `None`).
    pub fn average(&self, region: Option<Region>) -> Option<(f32, f32)> {
        let mut sum = (0.0f64, 0.0f64);
        let mut n = 0usize;
        for (x, y, v) in self.iter() {
            if region.map_or(true, |r| r.contains(x, y)) {
                if let Some((vx, vy)) = v.full_components() {
                    sum.0 += vx as f64;
                    sum.1 += vy as f64;
                    n += 1;
                }
            }
        }
        (n > 0).then(|| ((sum.0 / n as f64) as f32, (sum.1 / n as f64) as f32))
    }

    /// Rigid rotation about (cx, cy) by `angle` radians per frame.
    ///
    /// Each pixel's radius is measured with a half-pixel offset and the y
    /// axis pointing up, the speed is `r · tan(-angle)` and the direction is
    /// perpendicular to the radius. Cells outside `region` stay Invalid.
    pub fn rotation(
        width: usize,
        height: usize,
        cx: f32,
        cy: f32,
        angle: f32,
        region: Option<Region>,
    ) -> FlowField {
        let mut field = FlowField::new(width, height);
        let tan = (-angle).tan();
        for y in 0..height {
            for x in 0..width {
                if !region.map_or(true, |r| r.contains(x, y)) {
                    continue;
                }
                let (r, theta) = polar(x as f32 - cx + 0.5, -(y as f32 - cy) + 0.5);
                let (vx, vy) = from_polar(r * tan, theta + FRAC_PI_2);
                field.set(x, y, FlowVector::full(vx, vy));
            }
        }
        field
    }

    /// Split into vx and vy images; Invalid cells become NaN.
    pub fn to_images(&self) -> (Image<f32>, Image<f32>) {
        let vx = self.data.iter().map(|v| v.components().map_or(f32::NAN, |c| c.0)).collect();
        let vy = self.data.iter().map(|v| v.components().map_or(f32::NAN, |c| c.1)).collect();
        (
            Image::from_vec(self.width, self.height, vx),
            Image::from_vec(self.width, self.height, vy),
        )
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "cell ({x},{y}) out of bounds for field {}×{}",
            self.width,
            self.height,
        );
    }

    // -----------------------------------------------------------------------
    // Burkitt format
    // -----------------------------------------------------------------------

    /// Serialize the whole grid. Full and Normal cells are written as their
    /// vector (the format cannot tell them apart), Invalid as (100, 100).
    pub fn write_burkitt<W: Write>(&self, mut out: W) -> Result<()> {
        let (w, h) = (self.width as f32, self.height as f32);
        for v in [w, h, w, h, 0.0, 0.0] {
            out.write_all(&v.to_le_bytes())?;
        }
        let mut row = Vec::with_capacity(self.width * 8);
        for y in 0..self.height {
            row.clear();
            for x in 0..self.width {
                let (vx, vy) = self
                    .get(x, y)
                    .components()
                    .unwrap_or((BURKITT_INVALID, BURKITT_INVALID));
                row.extend_from_slice(&vx.to_le_bytes());
                row.extend_from_slice(&vy.to_le_bytes());
            }
            out.write_all(&row)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Parse a Burkitt stream.
    ///
    /// A stream that ends on a row boundary is legal, and the missing rows
    /// stay Invalid. A stream that ends inside a row or the header is
    /// rejected.
    pub fn read_burkitt<R: Read>(mut input: R) -> Result<FlowField> {
        let mut header = [0u8; HEADER_BYTES as usize];
        if read_up_to(&mut input, &mut header)? != header.len() {
            return Err(FlowError::Format("truncated header".into()));
        }
        let h: Vec<f32> = header
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let width = header_dimension(h[0], "width")?;
        let height = header_dimension(h[1], "height")?;
        let populated = Region::new(
            header_dimension(h[4], "xOffset")?,
            header_dimension(h[5], "yOffset")?,
            header_dimension(h[2], "computedWidth")?,
            header_dimension(h[3], "computedHeight")?,
        );
        if width.checked_mul(height).map_or(true, |n| n > MAX_CELLS) {
            return Err(FlowError::Format(format!("{width}×{height} grid is too large")));
        }

        // Rows are stored as they arrive; the grid is only padded out at the end.
        let mut data = Vec::new();
        let mut row = vec![0u8; width * 8];
        for y in 0..height {
            match read_up_to(&mut input, &mut row)? {
                0 => break,
                n if n < row.len() => {
                    return Err(FlowError::Format(format!("row {y} truncated after {n} bytes")));
                }
                _ => {}
            }
            data.extend(row.chunks_exact(8).enumerate().map(|(x, pair)| {
                let vx = f32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
                let vy = f32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
                let sentinel = vx == BURKITT_INVALID && vy == BURKITT_INVALID;
                if !sentinel && vx.is_finite() && vy.is_finite() && populated.contains(x, y) {
                    FlowVector::full(vx, vy)
                } else {
                    FlowVector::Invalid
                }
            }));
        }
        data.resize(width * height, FlowVector::Invalid);
        Ok(FlowField {
            width,
            height,
            edge: 0,
            data,
            calibration: None,
        })
    }

    /// Write a Burkitt file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        self.write_burkitt(BufWriter::new(file))
    }

    /// Read a Burkitt file. Besides the stream checks of `read_burkitt`, a
    /// file holding more bytes than its header accounts for is rejected.
    pub fn load(path: impl AsRef<Path>) -> Result<FlowField> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let field = FlowField::read_burkitt(BufReader::new(file))?;
        let expected = HEADER_BYTES + (field.width * field.height) as u64 * 8;
        if len > expected {
            return Err(FlowError::Format(format!(
                "{len} bytes on disk, header describes at most {expected}"
            )));
        }
        Ok(field)
    }
}

fn header_dimension(v: f32, name: &str) -> Result<usize> {
    if !v.is_finite() || v < 0.0 || v.fract() != 0.0 {
        return Err(FlowError::Format(format!("{name} = {v} is not a size")));
    }
    Ok(v as usize)
}

/// Fill `buf` as far as the stream allows; returns the number of bytes read.
fn read_up_to<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
