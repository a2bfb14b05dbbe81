// report.rs — Per-pass diagnostics.
//
// Estimators never fail on a single pixel. When a local system is singular
// or a confidence test fails, the cell stays Invalid and the reason is
// tallied here. The tally is logged at the end of the pass and returned to
// the caller alongside the field.

use std::fmt;

use serde::Serialize;
use tracing::info;

use crate::flow::{FlowField, FlowVector};

/// Why a cell ended up Invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Rejection {
    /// Inside the convolution margin: no data to work with.
    Unsupported,
    /// A confidence score (eigenvalue, information) fell below its threshold.
    LowConfidence,
    /// Singular local system, zero denominator or Jacobi failure.
    Singular,
    /// Condition number above the limit.
    IllConditioned,
    /// Fit residual above the limit.
    LargeResidual,
    /// Fewer constraints than unknowns.
    TooFewConstraints,
    /// Filter response below the amplitude floor.
    LowAmplitude,
    /// Phase gradient too far from the channel tuning.
    PhaseInconsistent,
    /// No pixel in a propagation tile qualified.
    NoCandidate,
}

impl Rejection {
    pub const ALL: [Rejection; 9] = [
        Rejection::Unsupported,
        Rejection::LowConfidence,
        Rejection::Singular,
        Rejection::IllConditioned,
        Rejection::LargeResidual,
        Rejection::TooFewConstraints,
        Rejection::LowAmplitude,
        Rejection::PhaseInconsistent,
        Rejection::NoCandidate,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Outcome counts of one estimator pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    pub estimator: &'static str,
    /// Grid cells in the field.
    pub cells: usize,
    pub full: usize,
    pub normal: usize,
    rejected: [usize; 9],
}

impl PassReport {
    pub fn new(estimator: &'static str) -> Self {
        PassReport {
            estimator,
            ..Default::default()
        }
    }

    /// Count one rejection.
    #[inline]
    pub fn reject(&mut self, reason: Rejection) {
        self.rejected[reason.index()] += 1;
    }

    /// Count `n` rejections at once.
    pub fn reject_many(&mut self, reason: Rejection, n: usize) {
        self.rejected[reason.index()] += n;
    }

    pub fn rejected(&self, reason: Rejection) -> usize {
        self.rejected[reason.index()]
    }

    pub fn total_rejected(&self) -> usize {
        self.rejected.iter().sum()
    }

    /// Fraction of cells holding a Full vector.
    pub fn density(&self) -> f32 {
        if self.cells == 0 {
            0.0
        } else {
            self.full as f32 / self.cells as f32
        }
    }

    /// Take the final Full / Normal counts and margin size from `field`,
    /// then log the summary.
    pub fn finish(&mut self, field: &FlowField) {
        self.cells = field.width() * field.height();
        self.full = 0;
        self.normal = 0;
        let mut margin = 0;
        for (x, y, v) in field.iter() {
            match v {
                FlowVector::Full { .. } => self.full += 1,
                FlowVector::Normal { .. } => self.normal += 1,
                FlowVector::Invalid if field.in_margin(x, y) => margin += 1,
                FlowVector::Invalid => {}
            }
        }
        self.rejected[Rejection::Unsupported.index()] = margin;
        info!(
            estimator = self.estimator,
            cells = self.cells,
            full = self.full,
            normal = self.normal,
            density = self.density(),
            "flow pass complete: {self}"
        );
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} full ({:.1}%), {} normal",
            self.estimator,
            self.full,
            self.cells,
            100.0 * self.density(),
            self.normal
        )?;
        for reason in Rejection::ALL {
            let n = self.rejected(reason);
            if n > 0 {
                write!(f, ", {reason:?} {n}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_counts_field_and_margin() {
        let mut field = FlowField::new(5, 5);
        field.set_edge(1);
        field.set(2, 2, FlowVector::full(1.0, 0.0));
        field.set(1, 2, FlowVector::normal(1.0, 0.0));
        let mut r = PassReport::new("test");
        r.reject(Rejection::Singular);
        r.finish(&field);
        assert_eq!(r.cells, 25);
        assert_eq!(r.full, 1);
        assert_eq!(r.normal, 1);
        assert_eq!(r.rejected(Rejection::Unsupported), 16);
        assert_eq!(r.rejected(Rejection::Singular), 1);
        assert!((r.density() - 0.04).abs() < 1e-6);
        assert!(r.to_string().contains("Singular 1"));
    }
}
