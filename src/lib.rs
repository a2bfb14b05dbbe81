// denseflow: dense optical flow from image sequences
// CPU implementation of four classic differential, correlation and phase methods
//
// Reference: Barron, Fleet & Beauchemin — "Performance of Optical Flow
// Techniques" (IJCV 1994)

pub mod error;
pub mod image;
pub mod kernel;
pub mod volume;
pub mod linalg;
pub mod flow;
pub mod report;
pub mod estimator;

pub mod lucas;      // Lucas & Kanade, eigenvalue confidence
pub mod uras;       // Uras et al., Hessian constraint
pub mod singh;      // Singh, SSD correlation + neighborhood propagation
pub mod fleet;      // Fleet & Jepson, Gabor phase

pub mod error_analysis;

pub use error::{FlowError, Result};
pub use estimator::{Estimate, Estimator, EstimatorConfig};
pub use flow::{FlowField, FlowVector};
pub use image::{Image, Pixel};
