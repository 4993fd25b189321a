//! Crate-wide error type.

use thiserror::Error;

/// Everything that can go wrong building, configuring, or solving a
/// calibration problem.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unrecognized lens model tag {0:?}")]
    UnknownLensModel(String),

    #[error("lens model {0:?} has a configuration suffix but it could not be parsed")]
    BadLensModelConfig(String),

    #[error("buffer size mismatch: expected {expected}, got {actual} ({what})")]
    BufferSizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("no optimization variables selected: enable at least one of intrinsics/extrinsics/frames/warp")]
    NothingToOptimize,

    #[error("calobject_warp optimization requested but no warp seed was provided")]
    MissingWarpSeed,

    #[error("lens model {0} has no analytic gradient; cannot be used where gradients are required")]
    NoAnalyticGradient(&'static str),

    #[error("index out of range: {what} index {index} is not in [0, {len})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },

    #[error("spline control grid too small: Nx={nx} Ny={ny} must both be >= order+1={min}")]
    SplineGridTooSmall { nx: usize, ny: usize, min: usize },

    #[error("invalid problem constants: {0}")]
    InvalidProblemConstants(String),

    #[error("unprojection failed to converge after {0} iterations")]
    UnprojectNonConvergence(u32),

    #[error("failed to parse camera model file: {0}")]
    ModelFileParse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
