//! The solve driver (§4.9): validates configuration, packs the seed
//! state, runs the external trust-region solver, and loops outlier
//! rejection to convergence.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::lens::LensModel;
use crate::measurements::estimate_jacobian_nnz;
use crate::observations::{BoardObservation, CalObjectGeometry, CalObjectWarp, PointObservation};
use crate::outliers::reject_outliers;
use crate::residuals::BundleProblem;
use crate::state::{OptimizeFlags, ProblemShape};
use crate::transform::Pose;

/// Problem constants that aren't part of the packed state (§6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProblemConstants {
    pub point_min_range: f64,
    pub point_max_range: f64,
}

impl Default for ProblemConstants {
    fn default() -> Self {
        ProblemConstants {
            point_min_range: 0.1,
            point_max_range: 1.0e4,
        }
    }
}

impl ProblemConstants {
    pub fn validate(&self) -> Result<()> {
        if !(self.point_min_range > 0.0 && self.point_max_range > self.point_min_range) {
            return Err(Error::InvalidProblemConstants(
                "point_min_range must be positive and less than point_max_range".into(),
            ));
        }
        Ok(())
    }
}

/// Everything a caller must supply to run a solve.
pub struct SolveInput {
    pub lens_models: Vec<LensModel>,
    pub cal: CalObjectGeometry,
    pub board_obs: Vec<BoardObservation>,
    pub point_obs: Vec<PointObservation>,
    pub intrinsics_seed: Vec<Vec<f64>>,
    pub extrinsics_seed: Vec<Pose>,
    pub frames_seed: Vec<Pose>,
    pub points_seed: Vec<nalgebra::Vector3<f64>>,
    pub num_points_fixed: usize,
    pub warp_seed: Option<CalObjectWarp>,
    /// `(width, height)` per camera, in pixels. Only used to anchor the
    /// center-pixel regularization target; irrelevant when regularization
    /// is disabled.
    pub imager_sizes: Vec<(u32, u32)>,
    pub flags: OptimizeFlags,
    pub constants: ProblemConstants,
}

/// Result of a solve: the fitted semantic parameters plus fit statistics.
#[derive(Debug, Clone)]
pub struct SolveResult {
    pub intrinsics: Vec<Vec<f64>>,
    pub extrinsics: Vec<Pose>,
    pub frames: Vec<Pose>,
    pub points: Vec<nalgebra::Vector3<f64>>,
    pub warp: CalObjectWarp,
    pub rms_reproj_error: f64,
    pub num_outliers: usize,
}

fn validate_flags(flags: OptimizeFlags, warp_seed: &Option<CalObjectWarp>) -> Result<()> {
    if !flags.intrinsics_core
        && !flags.intrinsics_distortions
        && !flags.extrinsics
        && !flags.frames
        && !flags.calobject_warp
    {
        return Err(Error::NothingToOptimize);
    }
    if flags.calobject_warp && warp_seed.is_none() {
        return Err(Error::MissingWarpSeed);
    }
    Ok(())
}

/// Run a full calibration solve (§4.9, steps 1-6).
pub fn optimize(input: SolveInput) -> Result<SolveResult> {
    input.constants.validate()?;
    validate_flags(input.flags, &input.warp_seed)?;

    let shape = ProblemShape {
        lens_models: input.lens_models.clone(),
        num_cameras_extrinsics: input.extrinsics_seed.len(),
        num_frames: input.frames_seed.len(),
        num_points: input.points_seed.len(),
        num_points_fixed: input.num_points_fixed,
        flags: input.flags,
    };

    let expected_nnz = estimate_jacobian_nnz(
        &input.lens_models,
        &input.board_obs,
        &input.point_obs,
        &input.cal,
        input.flags,
    );
    info!(
        n_state = shape.num_states(),
        n_cameras = shape.num_cameras_intrinsics(),
        n_frames = shape.num_frames,
        expected_nnz,
        "starting bundle-adjustment solve"
    );

    let mut problem = BundleProblem::new(
        shape.clone(),
        input.cal,
        input.board_obs,
        input.point_obs,
        input.intrinsics_seed,
        input.extrinsics_seed,
        input.frames_seed,
        input.points_seed,
        input.warp_seed.unwrap_or_default(),
        input
            .imager_sizes
            .iter()
            .map(|&(w, h)| (w as f64, h as f64))
            .collect(),
    );
    problem.point_min_range = input.constants.point_min_range;
    problem.point_max_range = input.constants.point_max_range;

    let solver = LevenbergMarquardt::new();

    loop {
        let (solved, report) = solver.minimize(problem);
        problem = solved;
        if !report.termination.was_successful() {
            let termination = format!("{:?}", report.termination);
            warn!(%termination, "trust-region solve did not report success");
        }

        if !shape.flags.outlier_rejection {
            break;
        }
        // Cloned so the mutable borrow of `problem.board_obs` below doesn't
        // overlap a borrow of the rest of `problem`.
        let intrinsics = problem.intrinsics().to_vec();
        let extrinsics = problem.extrinsics().to_vec();
        let frames = problem.frames().to_vec();
        let warp = problem.warp();
        let cal = problem.cal;
        let changed = reject_outliers(
            &shape.lens_models,
            &intrinsics,
            &extrinsics,
            &frames,
            &warp,
            &cal,
            &mut problem.board_obs,
        );
        if !changed {
            break;
        }
        info!("outlier(s) newly marked, re-solving");
    }

    let (residual, _, _) = problem.residuals_and_jacobian();
    let nmeas = problem.num_measurements();
    let rms_reproj_error = (residual.norm_squared() * 2.0 / nmeas as f64).sqrt();

    let num_outliers = problem
        .board_obs
        .iter()
        .flat_map(|o| o.pixels.iter())
        .filter(|p| p.is_outlier())
        .count();

    if shape.flags.regularization {
        check_regularization_ratio(&residual, problem.measurement_counts());
    }

    Ok(SolveResult {
        intrinsics: problem.intrinsics().to_vec(),
        extrinsics: problem.extrinsics().to_vec(),
        frames: problem.frames().to_vec(),
        points: problem.points().to_vec(),
        warp: problem.warp(),
        rms_reproj_error,
        num_outliers,
    })
}

/// Warn if regularization contributes more than 1% of the total squared
/// residual: regularization is meant to break an otherwise-unconstrained
/// null space, not compete with the data.
fn check_regularization_ratio(residual: &nalgebra::DVector<f64>, counts: crate::measurements::MeasurementCounts) {
    let fit_norm_sq: f64 = residual.rows(0, counts.board + counts.point).iter().map(|v| v * v).sum();
    let reg_start = counts.reg_distortion_start();
    let reg_norm_sq: f64 = residual
        .rows(reg_start, counts.reg_distortion + counts.reg_center)
        .iter()
        .map(|v| v * v)
        .sum();
    if reg_norm_sq > 0.01 * (fit_norm_sq + reg_norm_sq) {
        warn!(fit_norm_sq, reg_norm_sq, "regularization residual exceeds 1% of total squared residual");
    }
}
