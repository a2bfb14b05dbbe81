// error.rs — Crate-wide error type.
//
// Only *configuration* and *I/O* problems are errors. A pixel whose local
// system is singular, ill-conditioned or otherwise unusable is not an error:
// the estimators store FlowVector::Invalid there, count the reason in a
// PassReport (report.rs) and keep going.

use thiserror::Error;

/// Errors returned by stack validation, estimator setup and flow-file I/O.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The stack is shorter than the filter support of the chosen method.
    #[error("need at least {required} frames for this method, stack has {available}")]
    InsufficientFrames { required: usize, available: usize },

    /// The center frame leaves too few frames on one side for the support.
    #[error("center frame {center} out of range: must lie in [{min}, {max}]")]
    CenterOutOfRange { center: usize, min: usize, max: usize },

    /// Frames of a stack disagree in size.
    #[error("frame {index} is {found_width}×{found_height}, expected {width}×{height}")]
    DimensionMismatch {
        index: usize,
        width: usize,
        height: usize,
        found_width: usize,
        found_height: usize,
    },

    /// A numeric parameter outside its legal range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A flow file whose header or body cannot be parsed.
    #[error("malformed flow file: {0}")]
    Format(String),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
