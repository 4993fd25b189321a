//! Outlier rejection (§4.8): board measurements whose residual is large
//! relative to the current fit's noise estimate are marked and excluded
//! from the next solve. Point observations are never rejected this way.

use crate::observations::{BoardObservation, CalObjectGeometry};
use crate::project::project;
use crate::transform::{compose_rt, rotate_point_jacobian};
use crate::lens::LensModel;

/// `k1` is the strict per-point rejection threshold; `k0 < k1` is applied
/// in the same pass as a margin, catching borderline points early so the
/// outlier set is more likely to stabilize in one extra re-solve rather
/// than oscillating. Since `k0 < k1`, thresholding at `k0` alone is
/// equivalent to applying both.
const K0: f64 = 4.0;
#[allow(dead_code)]
const K1: f64 = 5.0;

/// One pass of outlier detection over all board observations, given their
/// current reprojection residuals. Returns whether any observation's
/// outlier flag changed (callers re-solve while this keeps returning
/// `true`).
pub fn reject_outliers(
    lens_models: &[LensModel],
    intrinsics: &[Vec<f64>],
    extrinsics: &[crate::transform::Pose],
    frames: &[crate::transform::Pose],
    warp: &crate::observations::CalObjectWarp,
    cal: &CalObjectGeometry,
    board_obs: &mut [BoardObservation],
) -> bool {
    let mut sum_half_sq = 0.0;
    let mut count = 0usize;
    for obs in board_obs.iter() {
        for r in 0..cal.height {
            for c in 0..cal.width {
                let pix = obs.pixels[r * cal.width + c];
                if pix.is_outlier() {
                    continue;
                }
                let (dx, dy) = reprojection_error(lens_models, intrinsics, extrinsics, frames, warp, obs, cal, c, r);
                sum_half_sq += (dx * dx + dy * dy) / 2.0;
                count += 1;
            }
        }
    }
    if count == 0 {
        return false;
    }
    let sigma_sq = sum_half_sq / count as f64;
    let threshold = K0 * K0 * sigma_sq;

    let mut changed = false;
    for obs in board_obs.iter_mut() {
        for r in 0..cal.height {
            for c in 0..cal.width {
                let idx = r * cal.width + c;
                if obs.pixels[idx].is_outlier() {
                    continue;
                }
                let (dx, dy) = reprojection_error(lens_models, intrinsics, extrinsics, frames, warp, obs, cal, c, r);
                if dx * dx > threshold || dy * dy > threshold {
                    obs.pixels[idx].mark_outlier();
                    changed = true;
                }
            }
        }
    }
    changed
}

fn reprojection_error(
    lens_models: &[LensModel],
    intrinsics: &[Vec<f64>],
    extrinsics: &[crate::transform::Pose],
    frames: &[crate::transform::Pose],
    warp: &crate::observations::CalObjectWarp,
    obs: &BoardObservation,
    cal: &CalObjectGeometry,
    col: usize,
    row: usize,
) -> (f64, f64) {
    let (dz, _, _) = warp.deflection(cal, col, row);
    let p_board = nalgebra::Vector3::new(col as f64 * cal.spacing, row as f64 * cal.spacing, dz);
    let frame = frames[obs.iframe];
    let joint = match obs.icam_extrinsics {
        None => frame,
        Some(ic) => compose_rt(extrinsics[ic], frame).0,
    };
    let (v_cam, _) = rotate_point_jacobian(joint.r, p_board);
    let model = lens_models[obs.icam_intrinsics];
    let proj = project(&model, &intrinsics[obs.icam_intrinsics], v_cam);
    let pix = obs.pixels[row * cal.width + col];
    (proj.q.x - pix.px, proj.q.y - pix.py)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observations::PixelObservation;
    use crate::transform::Pose;

    fn flat_board(cal: &CalObjectGeometry, model: &LensModel, intrinsics: &[f64], frame: Pose, bad: Option<(usize, usize)>) -> BoardObservation {
        let mut pixels = Vec::with_capacity(cal.width * cal.height);
        for r in 0..cal.height {
            for c in 0..cal.width {
                let p_board = nalgebra::Vector3::new(c as f64 * cal.spacing, r as f64 * cal.spacing, 0.0);
                let (v_cam, _) = rotate_point_jacobian(frame.r, p_board);
                let v_cam = v_cam + frame.t;
                let mut q = project(model, intrinsics, v_cam).q;
                if bad == Some((c, r)) {
                    q.x += 50.0;
                }
                pixels.push(PixelObservation { px: q.x, py: q.y, weight: 1.0 });
            }
        }
        BoardObservation {
            icam_intrinsics: 0,
            icam_extrinsics: None,
            iframe: 0,
            pixels,
        }
    }

    #[test]
    fn single_bad_point_gets_marked() {
        let cal = CalObjectGeometry { width: 6, height: 6, spacing: 0.1 };
        let model = LensModel::Pinhole;
        let intrinsics = vec![1000.0, 1000.0, 500.0, 500.0];
        let frame = Pose { r: nalgebra::Vector3::new(0.05, 0.02, 0.0), t: nalgebra::Vector3::new(0.0, 0.0, 3.0) };
        let mut boards = vec![flat_board(&cal, &model, &intrinsics, frame, Some((3, 3)))];
        let warp = crate::observations::CalObjectWarp::default();
        let changed = reject_outliers(&[model], &[intrinsics], &[], &[frame], &warp, &cal, &mut boards);
        assert!(changed);
        assert!(boards[0].pixels[3 * cal.width + 3].is_outlier());
    }

    #[test]
    fn perfect_fit_marks_nothing() {
        let cal = CalObjectGeometry { width: 4, height: 4, spacing: 0.1 };
        let model = LensModel::Pinhole;
        let intrinsics = vec![1000.0, 1000.0, 500.0, 500.0];
        let frame = Pose { r: nalgebra::Vector3::zeros(), t: nalgebra::Vector3::new(0.0, 0.0, 3.0) };
        let mut boards = vec![flat_board(&cal, &model, &intrinsics, frame, None)];
        let warp = crate::observations::CalObjectWarp::default();
        let changed = reject_outliers(&[model], &[intrinsics], &[], &[frame], &warp, &cal, &mut boards);
        assert!(!changed);
    }
}
