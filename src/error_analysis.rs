// error_analysis.rs — Angular error against ground truth.
//
// Barron, Fleet & Beauchemin score a flow estimate by the angle between the
// space-time direction vectors (vx, vy, 1) of the estimate and the truth:
//
//     ψ = acos( (ve·va + 1) / (√(|ve|²+1) · √(|va|²+1)) )
//
// measured in degrees. The third component makes the metric sensitive to
// speed as well as direction, and keeps it finite for zero vectors.

use std::f64::consts::PI;
use std::fmt;

use serde::Serialize;

use crate::error::{FlowError, Result};
use crate::flow::{FlowField, FlowVector};

/// Angular error in degrees, in `[0, 180]`.
///
/// Computed in f64 with the cosine clamped to [-1, 1], so identical vectors
/// give exactly 0.
pub fn angular_error(estimated: (f32, f32), expected: (f32, f32)) -> f64 {
    let (ex, ey) = (estimated.0 as f64, estimated.1 as f64);
    let (ax, ay) = (expected.0 as f64, expected.1 as f64);
    let dot = ex * ax + ey * ay + 1.0;
    let ne = ex * ex + ey * ey + 1.0;
    let na = ax * ax + ay * ay + 1.0;
    let cos = (dot / (ne * na).sqrt()).clamp(-1.0, 1.0);
    cos.acos() * 180.0 / PI
}

/// Summary of an estimate against ground truth, over the pixels where the
/// truth is Full.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ErrorStatistics {
    /// Pixels contributing to the error (both Full).
    pub count: usize,
    /// Mean angular error, degrees. NaN when `count` is 0.
    pub mean: f64,
    pub std_dev: f64,
    /// Fraction of ground-truth pixels with a Full estimate.
    pub density: f64,
    /// Ground-truth pixels with an Invalid estimate.
    pub missing: usize,
    /// Ground-truth pixels with only a Normal estimate.
    pub normal_only: usize,
}

/// Compare `estimated` against `expected` cell by cell.
pub fn compare(estimated: &FlowField, expected: &FlowField) -> Result<ErrorStatistics> {
    if (estimated.width(), estimated.height()) != (expected.width(), expected.height()) {
        return Err(FlowError::InvalidParameter(format!(
            "cannot compare a {}×{} field with a {}×{} ground truth",
            estimated.width(),
            estimated.height(),
            expected.width(),
            expected.height()
        )));
    }

    let mut truth = 0usize;
    let (mut missing, mut normal_only) = (0, 0);
    let mut errors = Vec::new();
    for (x, y, e) in expected.iter() {
        let Some(a) = e.full_components() else { continue };
        truth += 1;
        match estimated.get(x, y) {
            FlowVector::Full { vx, vy } => errors.push(angular_error((vx, vy), a)),
            FlowVector::Normal { .. } => normal_only += 1,
            FlowVector::Invalid => missing += 1,
        }
    }

    let count = errors.len();
    let mean = errors.iter().sum::<f64>() / count as f64;
    let var = errors.iter().map(|e| (e - mean) * (e - mean)).sum::<f64>() / count as f64;
    Ok(ErrorStatistics {
        count,
        mean,
        std_dev: var.sqrt(),
        density: if truth == 0 { 0.0 } else { count as f64 / truth as f64 },
        missing,
        normal_only,
    })
}

impl fmt::Display for ErrorStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}° ± {:.2}° over {} pixels ({:.1}% dense, {} missing, {} normal only)",
            self.mean,
            self.std_dev,
            self.count,
            100.0 * self.density,
            self.missing,
            self.normal_only
        )
    }
}
