//! Sparse bundle adjustment core for multi-camera, multi-lens-model
//! calibration.
//!
//! A problem is built from a [`state::ProblemShape`] (how many cameras,
//! frames, and points, and which of them are free to move) plus the
//! observations that constrain it ([`observations::BoardObservation`] and
//! [`observations::PointObservation`]). [`solve::optimize`] packs the seed
//! state, drives the trust-region solver from `levenberg_marquardt`, and
//! loops [`outliers::reject_outliers`] until the solve stabilizes.
//!
//! Camera models are identified by [`lens::LensModel`] and evaluated through
//! [`project::project`] / [`unproject::unproject`]; [`model_file`] reads and
//! writes the on-disk camera-model text format.

pub mod error;
pub mod lens;
pub mod transform;
pub mod project;
pub mod unproject;
pub mod observations;
pub mod state;
pub mod measurements;
pub mod residuals;
pub mod outliers;
pub mod model_file;
pub mod solve;

pub use error::{Error, Result};
pub use lens::LensModel;
pub use model_file::CameraModel;
pub use observations::{BoardObservation, CalObjectGeometry, CalObjectWarp, PixelObservation, PointObservation};
pub use solve::{optimize, ProblemConstants, SolveInput, SolveResult};
pub use state::{OptimizeFlags, ProblemShape};
pub use transform::Pose;
