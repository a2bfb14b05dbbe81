// estimator.rs — What the four flow estimators have in common.
//
// Each estimator runs in two phases:
//
//   filter(stack, center)  → a "filtered" value owning every intermediate
//                            volume (derivatives, products, channel phases)
//   filtered.compute_full  → consumes it and returns the FlowField
//
// Because compute_full takes the filtered value by value, intermediates
// cannot outlive a single pass; the borrow checker enforces what would
// otherwise be a convention.
//
// The Estimator trait wraps both phases behind one call so callers can pick a
// method at runtime, typically from a JSON EstimatorConfig.

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::fleet::{FleetJepson, FleetJepsonParams};
use crate::flow::FlowField;
use crate::image::{Image, Pixel};
use crate::lucas::{LucasKanade, LucasKanadeParams};
use crate::report::PassReport;
use crate::singh::{Singh, SinghParams};
use crate::uras::{Uras, UrasParams};

/// A computed field plus the diagnostics of the pass that produced it.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub field: FlowField,
    pub report: PassReport,
}

/// A dense flow method over a stack of frames of pixel type `T`.
pub trait Estimator<T: Pixel> {
    /// Short method name, used in logs and reports.
    fn name(&self) -> &'static str;

    /// Number of frames the method needs around (and including) the center.
    fn support(&self) -> usize;

    /// Compute the flow at frame `center`, reporting progress in `[0, 1]`.
    fn estimate_with_progress(
        &self,
        stack: &[Image<T>],
        center: usize,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Estimate>;

    /// Compute the flow at frame `center`.
    fn estimate(&self, stack: &[Image<T>], center: usize) -> Result<Estimate> {
        self.estimate_with_progress(stack, center, &mut |_| {})
    }
}

// ---------------------------------------------------------------------------
// Stack validation
// ---------------------------------------------------------------------------

/// Check that `stack` can feed a method of the given support centered on
/// `center`, and return the common frame size.
///
/// A support of `s` frames spans `(s-1)/2` frames before the center and the
/// rest after it, so the two-frame difference method needs only `center + 1`.
pub fn check_support<T: Pixel>(
    stack: &[Image<T>],
    center: usize,
    support: usize,
) -> Result<(usize, usize)> {
    if stack.len() < support.max(1) {
        return Err(FlowError::InsufficientFrames {
            required: support.max(1),
            available: stack.len(),
        });
    }
    let before = support.saturating_sub(1) / 2;
    let after = support.saturating_sub(1) - before;
    if center < before || center + after >= stack.len() {
        return Err(FlowError::CenterOutOfRange {
            center,
            min: before,
            max: stack.len() - 1 - after,
        });
    }

    let (width, height) = stack[0].dimensions();
    for (index, frame) in stack.iter().enumerate() {
        if frame.dimensions() != (width, height) {
            return Err(FlowError::DimensionMismatch {
                index,
                width,
                height,
                found_width: frame.width(),
                found_height: frame.height(),
            });
        }
    }
    Ok((width, height))
}

pub(crate) fn require_positive(name: &str, value: f32) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(FlowError::InvalidParameter(format!("{name} must be positive, got {value}")))
    }
}

pub(crate) fn require_non_negative(name: &str, value: f32) -> Result<()> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(FlowError::InvalidParameter(format!("{name} must be non-negative, got {value}")))
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Forwards monotone fractions to a caller's callback.
pub(crate) struct Progress<'a> {
    sink: &'a mut dyn FnMut(f32),
    last: f32,
}

impl<'a> Progress<'a> {
    pub(crate) fn new(sink: &'a mut dyn FnMut(f32)) -> Self {
        Progress { sink, last: 0.0 }
    }

    /// Report `done / total` of the stage spanning `[start, end]`.
    pub(crate) fn stage(&mut self, start: f32, end: f32, done: usize, total: usize) {
        let f = if total == 0 {
            end
        } else {
            start + (end - start) * done as f32 / total as f32
        };
        let f = f.clamp(self.last, 1.0);
        if f > self.last {
            self.last = f;
            (self.sink)(f);
        }
    }

    pub(crate) fn done(&mut self) {
        self.last = 1.0;
        (self.sink)(1.0);
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Method selection plus parameters, loadable from JSON:
///
/// ```
/// use denseflow::estimator::EstimatorConfig;
/// let cfg = EstimatorConfig::from_json(r#"{ "method": "lucas_kanade", "tau": 2.0 }"#).unwrap();
/// assert!(matches!(cfg, EstimatorConfig::LucasKanade(ref p) if p.tau == 2.0));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum EstimatorConfig {
    LucasKanade(LucasKanadeParams),
    Uras(UrasParams),
    Singh(SinghParams),
    FleetJepson(FleetJepsonParams),
}

impl EstimatorConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate the parameters and build the estimator.
    pub fn build<T: Pixel>(&self) -> Result<Box<dyn Estimator<T>>> {
        Ok(match self {
            EstimatorConfig::LucasKanade(p) => Box::new(LucasKanade::new(p.clone())?),
            EstimatorConfig::Uras(p) => Box::new(Uras::new(p.clone())?),
            EstimatorConfig::Singh(p) => Box::new(Singh::new(p.clone())?),
            EstimatorConfig::FleetJepson(p) => Box::new(FleetJepson::new(p.clone())?),
        })
    }
}
