//! Residual and Jacobian assembly: the single callback invoked by the
//! trust-region solver. Board observations first, then point
//! observations, then regularization — this order is observable (it
//! defines the Jacobian's row structure) and must not change.

use levenberg_marquardt::LeastSquaresProblem;
use nalgebra::{DMatrix, DVector, Dyn, Matrix2x4, Owned, Vector2, Vector3};
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::lens::LensModel;
use crate::measurements::{count_measurements, num_reg_center_terms, num_reg_distortion_terms, MeasurementCounts};
use crate::observations::{BoardObservation, CalObjectGeometry, CalObjectWarp, PointObservation};
use crate::project::{project, DistortionGrad};
use crate::state::{scale, OptimizeFlags, ProblemShape};
use crate::transform::{compose_rt, rotate_point_jacobian, Pose};

/// Regularization normal values (§4.7): the "typical" magnitude a
/// regularization term is scaled against, before the overall 0.5%-of-signal
/// budget is applied.
const NORMAL_DISTORTION_VALUE: f64 = 2.0;
const NORMAL_SPLINE_VALUE: f64 = 0.2;
const NORMAL_CENTER_VALUE: f64 = 500.0;
const OPENCV_DENOMINATOR_EXTRA_SCALE: f64 = 5.0;
const SPLINE_TANGENTIAL_EXTRA_SCALE: f64 = 10.0;
const REGULARIZATION_BUDGET_FRACTION: f64 = 0.005;

const POINT_MIN_RANGE_DEFAULT: f64 = 0.1;
const POINT_MAX_RANGE_DEFAULT: f64 = 1.0e4;

/// Owns everything the solver needs: problem shape, observations, and the
/// current (unpacked) value of every optimizer variable. `set_params`
/// rewrites the subset of these that are actually in the packed state;
/// everything else stays at its seed value for the life of the solve.
pub struct BundleProblem {
    pub shape: ProblemShape,
    pub cal: CalObjectGeometry,
    pub board_obs: Vec<BoardObservation>,
    pub point_obs: Vec<PointObservation>,
    pub point_min_range: f64,
    pub point_max_range: f64,

    /// `(width, height)` per camera, used only to compute the imager-center
    /// regularization target `((W-1)/2, (H-1)/2)`.
    imager_sizes: Vec<(f64, f64)>,
    intrinsics: Vec<Vec<f64>>,
    extrinsics: Vec<Pose>,
    frames: Vec<Pose>,
    points: Vec<Vector3<f64>>,
    warp: CalObjectWarp,

    params_cache: DVector<f64>,
    measurement_counts: MeasurementCounts,
}

impl BundleProblem {
    pub fn new(
        shape: ProblemShape,
        cal: CalObjectGeometry,
        board_obs: Vec<BoardObservation>,
        point_obs: Vec<PointObservation>,
        intrinsics_seed: Vec<Vec<f64>>,
        extrinsics_seed: Vec<Pose>,
        frames_seed: Vec<Pose>,
        points_seed: Vec<Vector3<f64>>,
        warp_seed: CalObjectWarp,
        imager_sizes: Vec<(f64, f64)>,
    ) -> Self {
        let measurement_counts = count_measurements(&shape.lens_models, &board_obs, &point_obs, &cal, shape.flags);
        let mut problem = BundleProblem {
            shape,
            cal,
            board_obs,
            point_obs,
            point_min_range: POINT_MIN_RANGE_DEFAULT,
            point_max_range: POINT_MAX_RANGE_DEFAULT,
            imager_sizes,
            intrinsics: intrinsics_seed,
            extrinsics: extrinsics_seed,
            frames: frames_seed,
            points: points_seed,
            warp: warp_seed,
            params_cache: DVector::zeros(0),
            measurement_counts,
        };
        problem.params_cache = problem.pack();
        problem
    }

    pub fn num_measurements(&self) -> usize {
        self.measurement_counts.total()
    }

    pub fn measurement_counts(&self) -> MeasurementCounts {
        self.measurement_counts
    }

    pub fn intrinsics(&self) -> &[Vec<f64>] {
        &self.intrinsics
    }
    pub fn extrinsics(&self) -> &[Pose] {
        &self.extrinsics
    }
    pub fn frames(&self) -> &[Pose] {
        &self.frames
    }
    pub fn points(&self) -> &[Vector3<f64>] {
        &self.points
    }
    pub fn warp(&self) -> CalObjectWarp {
        self.warp
    }

    /// Build the packed state from the current semantic values.
    fn pack(&self) -> DVector<f64> {
        let mut v = DVector::zeros(self.shape.num_states());
        for icam in 0..self.shape.num_cameras_intrinsics() {
            if let Some(off) = self.shape.state_index_intrinsics(icam) {
                let model = &self.shape.lens_models[icam];
                let info = model.info();
                let mut k = off;
                if self.shape.flags.intrinsics_core && info.has_core {
                    v[k] = self.intrinsics[icam][0] / scale::FOCAL_LENGTH;
                    v[k + 1] = self.intrinsics[icam][1] / scale::FOCAL_LENGTH;
                    v[k + 2] = self.intrinsics[icam][2] / scale::CENTER_PIXEL;
                    v[k + 3] = self.intrinsics[icam][3] / scale::CENTER_PIXEL;
                    k += 4;
                }
                if self.shape.flags.intrinsics_distortions {
                    let core_len = if info.has_core { 4 } else { 0 };
                    for (i, &d) in self.intrinsics[icam][core_len..].iter().enumerate() {
                        v[k + i] = d / scale::DISTORTION;
                    }
                }
            }
        }
        for icam in 0..self.shape.num_cameras_extrinsics {
            if let Some(off) = self.shape.state_index_extrinsics(icam) {
                let p = self.extrinsics[icam];
                v[off] = p.r.x / scale::CAMERA_ROTATION;
                v[off + 1] = p.r.y / scale::CAMERA_ROTATION;
                v[off + 2] = p.r.z / scale::CAMERA_ROTATION;
                v[off + 3] = p.t.x / scale::CAMERA_TRANSLATION;
                v[off + 4] = p.t.y / scale::CAMERA_TRANSLATION;
                v[off + 5] = p.t.z / scale::CAMERA_TRANSLATION;
            }
        }
        for iframe in 0..self.shape.num_frames {
            if let Some(off) = self.shape.state_index_frames(iframe) {
                let p = self.frames[iframe];
                v[off] = p.r.x / scale::FRAME_ROTATION;
                v[off + 1] = p.r.y / scale::FRAME_ROTATION;
                v[off + 2] = p.r.z / scale::FRAME_ROTATION;
                v[off + 3] = p.t.x / scale::FRAME_TRANSLATION;
                v[off + 4] = p.t.y / scale::FRAME_TRANSLATION;
                v[off + 5] = p.t.z / scale::FRAME_TRANSLATION;
            }
        }
        for ipoint in 0..(self.shape.num_points - self.shape.num_points_fixed) {
            if let Some(off) = self.shape.state_index_points(ipoint) {
                let p = self.points[ipoint];
                v[off] = p.x / scale::POINT_POSITION;
                v[off + 1] = p.y / scale::POINT_POSITION;
                v[off + 2] = p.z / scale::POINT_POSITION;
            }
        }
        if let Some(off) = self.shape.state_index_calobject_warp() {
            v[off] = self.warp.x2 / scale::CALOBJECT_WARP;
            v[off + 1] = self.warp.y2 / scale::CALOBJECT_WARP;
        }
        v
    }

    /// Overwrite the optimized subset of semantic variables from a packed
    /// state; anything not in the state keeps its prior (seed) value.
    fn unpack(&mut self, params: &DVector<f64>) {
        for icam in 0..self.shape.num_cameras_intrinsics() {
            if let Some(off) = self.shape.state_index_intrinsics(icam) {
                let model = self.shape.lens_models[icam];
                let info = model.info();
                let mut k = off;
                if self.shape.flags.intrinsics_core && info.has_core {
                    self.intrinsics[icam][0] = params[k] * scale::FOCAL_LENGTH;
                    self.intrinsics[icam][1] = params[k + 1] * scale::FOCAL_LENGTH;
                    self.intrinsics[icam][2] = params[k + 2] * scale::CENTER_PIXEL;
                    self.intrinsics[icam][3] = params[k + 3] * scale::CENTER_PIXEL;
                    k += 4;
                }
                if self.shape.flags.intrinsics_distortions {
                    let core_len = if info.has_core { 4 } else { 0 };
                    let n = self.intrinsics[icam].len() - core_len;
                    for i in 0..n {
                        self.intrinsics[icam][core_len + i] = params[k + i] * scale::DISTORTION;
                    }
                }
            }
        }
        for icam in 0..self.shape.num_cameras_extrinsics {
            if let Some(off) = self.shape.state_index_extrinsics(icam) {
                self.extrinsics[icam] = Pose {
                    r: Vector3::new(params[off], params[off + 1], params[off + 2]) * scale::CAMERA_ROTATION,
                    t: Vector3::new(params[off + 3], params[off + 4], params[off + 5]) * scale::CAMERA_TRANSLATION,
                };
            }
        }
        for iframe in 0..self.shape.num_frames {
            if let Some(off) = self.shape.state_index_frames(iframe) {
                self.frames[iframe] = Pose {
                    r: Vector3::new(params[off], params[off + 1], params[off + 2]) * scale::FRAME_ROTATION,
                    t: Vector3::new(params[off + 3], params[off + 4], params[off + 5]) * scale::FRAME_TRANSLATION,
                };
            }
        }
        for ipoint in 0..(self.shape.num_points - self.shape.num_points_fixed) {
            if let Some(off) = self.shape.state_index_points(ipoint) {
                self.points[ipoint] = Vector3::new(params[off], params[off + 1], params[off + 2]) * scale::POINT_POSITION;
            }
        }
        if let Some(off) = self.shape.state_index_calobject_warp() {
            self.warp = CalObjectWarp {
                x2: params[off] * scale::CALOBJECT_WARP,
                y2: params[off + 1] * scale::CALOBJECT_WARP,
            };
        }
        self.params_cache = params.clone();
    }

    /// Assemble the residual vector and Jacobian (both a dense matrix, for
    /// the default `LeastSquaresProblem` path, and the sparse triplet form
    /// named in the public interface) against the currently unpacked
    /// state.
    pub fn residuals_and_jacobian(&self) -> (DVector<f64>, DMatrix<f64>, CooMatrix<f64>) {
        let nmeas = self.measurement_counts.total();
        let nstate = self.shape.num_states();
        let mut residual = DVector::zeros(nmeas);
        let mut dense = DMatrix::zeros(nmeas, nstate);
        let mut coo = CooMatrix::new(nmeas, nstate);

        // Every computed entry is pushed, even when it happens to be exactly
        // zero (e.g. an outlier's zeroed-out weight): the sparsity pattern
        // must stay fixed across an outlier-rejection re-solve.
        let mut push = |row: usize, col: usize, val: f64| {
            dense[(row, col)] += val;
            coo.push(row, col, val);
        };

        let mut row = self.measurement_counts.board_start();
        for obs in &self.board_obs {
            row = self.assemble_board(obs, row, &mut push);
        }
        debug_assert_eq!(row, self.measurement_counts.point_start());
        for obs in &self.point_obs {
            row = self.assemble_point(obs, row, &mut push);
        }
        debug_assert_eq!(row, self.measurement_counts.reg_distortion_start());
        row = self.assemble_regularization_distortion(row, &mut push, &mut residual);
        debug_assert_eq!(row, self.measurement_counts.reg_center_start());
        row = self.assemble_regularization_center(row, &mut push, &mut residual);
        debug_assert_eq!(row, nmeas);

        drop(push);
        self.fill_board_point_residuals(&mut residual);
        (residual, dense, coo)
    }

    // Residual values are written by the same loops that write the
    // Jacobian; kept as a private re-walk here only for clarity of the
    // public return shape (dense matrix + sparse triplets + residual).
    fn fill_board_point_residuals(&self, residual: &mut DVector<f64>) {
        let mut row = self.measurement_counts.board_start();
        for obs in &self.board_obs {
            let model = &self.shape.lens_models[obs.icam_intrinsics];
            for r in 0..self.cal.height {
                for c in 0..self.cal.width {
                    let px_obs = obs.pixels[r * self.cal.width + c];
                    let (q, _) = self.project_board_point(model, obs, c, r);
                    if px_obs.is_outlier() {
                        residual[row] = 0.0;
                        residual[row + 1] = 0.0;
                    } else {
                        residual[row] = px_obs.weight * (q.x - px_obs.px);
                        residual[row + 1] = px_obs.weight * (q.y - px_obs.py);
                    }
                    row += 2;
                }
            }
        }
        for obs in &self.point_obs {
            let model = &self.shape.lens_models[obs.icam_intrinsics];
            let v_cam = self.point_in_camera_frame(obs);
            let proj = project(model, &self.intrinsics[obs.icam_intrinsics], v_cam);
            let w = obs.pixel.weight;
            if obs.pixel.is_outlier() {
                residual[row] = 0.0;
                residual[row + 1] = 0.0;
                residual[row + 2] = 0.0;
            } else {
                residual[row] = w * (proj.q.x - obs.pixel.px);
                residual[row + 1] = w * (proj.q.y - obs.pixel.py);
                residual[row + 2] = w * self.range_penalty(v_cam, model);
            }
            row += 3;
        }
        let _ = row;
    }

    fn point_in_camera_frame(&self, obs: &PointObservation) -> Vector3<f64> {
        let p = self.points[obs.i_point];
        match obs.icam_extrinsics {
            None => p,
            Some(ic) => {
                let ext = self.extrinsics[ic];
                rotate_point_jacobian(ext.r, p).0 + ext.t
            }
        }
    }

    fn range_penalty(&self, v_cam: Vector3<f64>, model: &LensModel) -> f64 {
        let mut d2 = v_cam.norm_squared();
        if !model.info().can_project_behind_camera && v_cam.z < 0.0 {
            d2 = -d2;
        }
        let max2 = self.point_max_range * self.point_max_range;
        let min2 = self.point_min_range * self.point_min_range;
        if d2 > max2 {
            d2 / max2 - 1.0
        } else if d2 < min2 {
            1.0 - d2 / min2
        } else {
            0.0
        }
    }

    fn board_point_world(&self, obs: &BoardObservation, col: usize, row: usize) -> (Vector3<f64>, f64, f64) {
        let (dz, dz_dx2, dz_dy2) = self.warp.deflection(&self.cal, col, row);
        let p = Vector3::new(col as f64 * self.cal.spacing, row as f64 * self.cal.spacing, dz);
        (p, dz_dx2, dz_dy2)
    }

    fn project_board_point(
        &self,
        model: &LensModel,
        obs: &BoardObservation,
        col: usize,
        row: usize,
    ) -> (Vector2<f64>, crate::project::Projection) {
        let (p_board, _, _) = self.board_point_world(obs, col, row);
        let frame = self.frames[obs.iframe];
        let v_cam = match obs.icam_extrinsics {
            None => rotate_point_jacobian(frame.r, p_board).0 + frame.t,
            Some(ic) => {
                let (joint, _) = compose_rt(self.extrinsics[ic], frame);
                rotate_point_jacobian(joint.r, p_board).0 + joint.t
            }
        };
        let proj = project(model, &self.intrinsics[obs.icam_intrinsics], v_cam);
        (proj.q, proj)
    }

    fn assemble_board(
        &self,
        obs: &BoardObservation,
        mut row: usize,
        push: &mut impl FnMut(usize, usize, f64),
    ) -> usize {
        let model = self.shape.lens_models[obs.icam_intrinsics];
        let frame = self.frames[obs.iframe];

        for r in 0..self.cal.height {
            for c in 0..self.cal.width {
                let pix = obs.pixels[r * self.cal.width + c];
                let (p_board, dz_dx2, dz_dy2) = self.board_point_world(obs, c, r);

                let (joint, compose_grad, rj_matrix) = match obs.icam_extrinsics {
                    None => (frame, None, crate::transform::rodrigues_r_to_matrix(frame.r)),
                    Some(ic) => {
                        let (joint, grad) = compose_rt(self.extrinsics[ic], frame);
                        let rjm = crate::transform::rodrigues_r_to_matrix(joint.r);
                        (joint, Some(grad), rjm)
                    }
                };
                let (v_cam, dv_drj) = rotate_point_jacobian(joint.r, p_board);
                let proj = project(&model, &self.intrinsics[obs.icam_intrinsics], v_cam);

                let w = if pix.is_outlier() { 0.0 } else { pix.weight };

                // dq/drj, dq/dtj (= dq/dv, since v = Rj p + tj).
                let dq_drj = proj.dq_dv * dv_drj;
                let dq_dtj = proj.dq_dv;

                if self.shape.flags.frames {
                    if let Some(off) = self.shape.state_index_frames(obs.iframe) {
                        let (dq_drf, dq_dtf) = match &compose_grad {
                            None => (dq_drj, dq_dtj),
                            Some(g) => (dq_drj * g.drj_drf, dq_dtj * g.dtj_dtf),
                        };
                        push_block2x3(push, row, off, dq_drf * scale::FRAME_ROTATION, w);
                        push_block2x3(push, row, off + 3, dq_dtf * scale::FRAME_TRANSLATION, w);
                    }
                }
                if self.shape.flags.extrinsics {
                    if let (Some(ic), Some(g)) = (obs.icam_extrinsics, &compose_grad) {
                        if let Some(off) = self.shape.state_index_extrinsics(ic) {
                            let dq_drc = dq_drj * g.drj_drc + dq_dtj * g.dtj_drc;
                            let dq_dtc = dq_dtj; // dtj/dtc = I
                            push_block2x3(push, row, off, dq_drc * scale::CAMERA_ROTATION, w);
                            push_block2x3(push, row, off + 3, dq_dtc * scale::CAMERA_TRANSLATION, w);
                        }
                    }
                }
                if self.shape.flags.calobject_warp {
                    if let Some(off) = self.shape.state_index_calobject_warp() {
                        let rj_col2 = Vector3::new(rj_matrix[(0, 2)], rj_matrix[(1, 2)], rj_matrix[(2, 2)]);
                        let d_dwarpx = dq_dtj * (rj_col2 * dz_dx2);
                        let d_dwarpy = dq_dtj * (rj_col2 * dz_dy2);
                        push(row, off, w * d_dwarpx.x * scale::CALOBJECT_WARP);
                        push(row + 1, off, w * d_dwarpx.y * scale::CALOBJECT_WARP);
                        push(row, off + 1, w * d_dwarpy.x * scale::CALOBJECT_WARP);
                        push(row + 1, off + 1, w * d_dwarpy.y * scale::CALOBJECT_WARP);
                    }
                }

                self.push_intrinsics_block(&model, obs.icam_intrinsics, &proj, row, w, push);

                row += 2;
            }
        }
        row
    }

    fn assemble_point(
        &self,
        obs: &PointObservation,
        mut row: usize,
        push: &mut impl FnMut(usize, usize, f64),
    ) -> usize {
        let model = self.shape.lens_models[obs.icam_intrinsics];
        let point = self.points[obs.i_point];
        // dv/dtc is the identity in both branches: with no extrinsics, v IS
        // the point (tc doesn't exist); with extrinsics, v = Rc*p + tc.
        let (v_cam, dv_dpoint, dv_drc) = match obs.icam_extrinsics {
            None => (point, nalgebra::Matrix3::identity(), nalgebra::Matrix3::zeros()),
            Some(ic) => {
                let ext = self.extrinsics[ic];
                let (v, dv_dr) = rotate_point_jacobian(ext.r, point);
                (v + ext.t, crate::transform::rodrigues_r_to_matrix(ext.r), dv_dr)
            }
        };
        let proj = project(&model, &self.intrinsics[obs.icam_intrinsics], v_cam);
        let w = if obs.pixel.is_outlier() { 0.0 } else { obs.pixel.weight };

        let is_fixed = obs.i_point >= self.shape.num_points - self.shape.num_points_fixed;
        if self.shape.flags.frames && !is_fixed {
            if let Some(off) = self.shape.state_index_points(obs.i_point) {
                let dq_dpoint = proj.dq_dv * dv_dpoint;
                push_block2x3(push, row, off, dq_dpoint * scale::POINT_POSITION, w);
            }
        }
        if self.shape.flags.extrinsics {
            if let Some(ic) = obs.icam_extrinsics {
                if let Some(off) = self.shape.state_index_extrinsics(ic) {
                    let dq_drc = proj.dq_dv * dv_drc;
                    let dq_dtc = proj.dq_dv; // dv/dtc = I
                    push_block2x3(push, row, off, dq_drc * scale::CAMERA_ROTATION, w);
                    push_block2x3(push, row, off + 3, dq_dtc * scale::CAMERA_TRANSLATION, w);
                }
            }
        }
        self.push_intrinsics_block(&model, obs.icam_intrinsics, &proj, row, w, push);

        // range penalty row: depends on v_cam only, through the same point/extrinsics blocks.
        let mut sign = 1.0;
        let mut d2 = v_cam.norm_squared();
        if !model.info().can_project_behind_camera && v_cam.z < 0.0 {
            sign = -1.0;
            d2 = -d2;
        }
        let max2 = self.point_max_range * self.point_max_range;
        let min2 = self.point_min_range * self.point_min_range;
        let (dpenalty_dd2, active) = if d2 > max2 {
            (1.0 / max2, true)
        } else if d2 < min2 {
            (-1.0 / min2, true)
        } else {
            (0.0, false)
        };
        if active {
            let dd2_dv = 2.0 * v_cam * sign;
            if self.shape.flags.frames && !is_fixed {
                if let Some(off) = self.shape.state_index_points(obs.i_point) {
                    let row3 = dpenalty_dd2 * (dv_dpoint.transpose() * dd2_dv);
                    push(row + 2, off, w * row3.x * scale::POINT_POSITION);
                    push(row + 2, off + 1, w * row3.y * scale::POINT_POSITION);
                    push(row + 2, off + 2, w * row3.z * scale::POINT_POSITION);
                }
            }
            if self.shape.flags.extrinsics {
                if let Some(ic) = obs.icam_extrinsics {
                    if let Some(off) = self.shape.state_index_extrinsics(ic) {
                        let drow_drc = dpenalty_dd2 * (dv_drc.transpose() * dd2_dv);
                        push(row + 2, off, w * drow_drc.x * scale::CAMERA_ROTATION);
                        push(row + 2, off + 1, w * drow_drc.y * scale::CAMERA_ROTATION);
                        push(row + 2, off + 2, w * drow_drc.z * scale::CAMERA_ROTATION);
                        push(row + 2, off + 3, w * dpenalty_dd2 * dd2_dv.x * scale::CAMERA_TRANSLATION);
                        push(row + 2, off + 4, w * dpenalty_dd2 * dd2_dv.y * scale::CAMERA_TRANSLATION);
                        push(row + 2, off + 5, w * dpenalty_dd2 * dd2_dv.z * scale::CAMERA_TRANSLATION);
                    }
                }
            }
        }

        row += 3;
        row
    }

    fn push_intrinsics_block(
        &self,
        model: &LensModel,
        icam: usize,
        proj: &crate::project::Projection,
        row: usize,
        w: f64,
        push: &mut impl FnMut(usize, usize, f64),
    ) {
        let Some(off) = self.shape.state_index_intrinsics(icam) else {
            return;
        };
        let info = model.info();
        let mut k = off;
        if self.shape.flags.intrinsics_core && info.has_core {
            let dqcore: Matrix2x4<f64> = proj.dq_dcore;
            for col in 0..4 {
                let s = if col < 2 { scale::FOCAL_LENGTH } else { scale::CENTER_PIXEL };
                push(row, k + col, w * dqcore[(0, col)] * s);
                push(row + 1, k + col, w * dqcore[(1, col)] * s);
            }
            k += 4;
        }
        if self.shape.flags.intrinsics_distortions {
            match &proj.dq_ddist {
                DistortionGrad::None => {}
                DistortionGrad::Dense(flat) => {
                    let n = flat.len() / 2;
                    for i in 0..n {
                        push(row, k + i, w * flat[i] * scale::DISTORTION);
                        push(row + 1, k + i, w * flat[n + i] * scale::DISTORTION);
                    }
                }
                DistortionGrad::Splined(g) => {
                    let order1 = g.basis_x.len();
                    for j in 0..order1 {
                        for i in 0..order1 {
                            let wgt = g.basis_x[i] * g.basis_y[j];
                            let col_x = k + 2 * ((g.iy0 + j) * g.nx + (g.ix0 + i));
                            let col_y = col_x + 1;
                            push(row, col_x, w * wgt * scale::DISTORTION);
                            push(row + 1, col_y, w * wgt * scale::DISTORTION);
                        }
                    }
                }
            }
        }
    }

    fn assemble_regularization_distortion(
        &self,
        mut row: usize,
        push: &mut impl FnMut(usize, usize, f64),
        residual: &mut DVector<f64>,
    ) -> usize {
        if !self.shape.flags.regularization || !self.shape.flags.intrinsics_distortions {
            return row;
        }
        let nmeas_nonreg = (self.measurement_counts.board + self.measurement_counts.point) as f64;
        for icam in 0..self.shape.num_cameras_intrinsics() {
            let model = self.shape.lens_models[icam];
            let core_len = if model.info().has_core { 4 } else { 0 };
            let Some(off) = self.shape.state_index_intrinsics(icam) else {
                row += num_reg_distortion_terms(&model);
                continue;
            };
            let dist_off = off + core_len;
            match model {
                LensModel::SplinedStereographic(cfg) => {
                    let nterms = num_reg_distortion_terms(&model);
                    let scale_sq = REGULARIZATION_BUDGET_FRACTION * nmeas_nonreg
                        / (nterms as f64 * NORMAL_SPLINE_VALUE * NORMAL_SPLINE_VALUE);
                    let reg_scale = scale_sq.sqrt();
                    for iy in 0..cfg.ny {
                        for ix in 0..cfg.nx {
                            let idx = dist_off + 2 * (iy * cfg.nx + ix);
                            let array_idx = core_len + 2 * (iy * cfg.nx + ix);
                            let dx = self.intrinsics[icam][array_idx];
                            let dy = self.intrinsics[icam][array_idx + 1];
                            let fx = 2.0 * ix as f64 - (cfg.nx as f64 - 1.0);
                            let fy = 2.0 * iy as f64 - (cfg.ny as f64 - 1.0);
                            let norm = (fx * fx + fy * fy).sqrt();
                            let (ux, uy) = if norm < 1e-12 { (1.0, 0.0) } else { (fx / norm, fy / norm) };
                            // radial term: delta . u
                            push(row, idx, reg_scale * ux);
                            push(row, idx + 1, reg_scale * uy);
                            residual[row] = reg_scale * (dx * ux + dy * uy);
                            // tangential term: delta . u_perp, extra weighted
                            push(row + 1, idx, -reg_scale * uy * SPLINE_TANGENTIAL_EXTRA_SCALE);
                            push(row + 1, idx + 1, reg_scale * ux * SPLINE_TANGENTIAL_EXTRA_SCALE);
                            residual[row + 1] = reg_scale * SPLINE_TANGENTIAL_EXTRA_SCALE * (-dx * uy + dy * ux);
                            row += 2;
                        }
                    }
                }
                _ => {
                    let nterms = num_reg_distortion_terms(&model);
                    let scale_sq = REGULARIZATION_BUDGET_FRACTION * nmeas_nonreg
                        / (nterms as f64 * NORMAL_DISTORTION_VALUE * NORMAL_DISTORTION_VALUE);
                    let reg_scale = scale_sq.sqrt();
                    let is_rational_denominator = |i: usize| matches!(model, LensModel::OpenCv8 | LensModel::OpenCv12) && (5..8).contains(&i);
                    for i in 0..nterms {
                        let extra = if is_rational_denominator(i) { OPENCV_DENOMINATOR_EXTRA_SCALE } else { 1.0 };
                        push(row, dist_off + i, reg_scale * extra);
                        residual[row] = reg_scale * extra * self.intrinsics[icam][core_len + i];
                        row += 1;
                    }
                }
            }
        }
        row
    }

    fn assemble_regularization_center(
        &self,
        mut row: usize,
        push: &mut impl FnMut(usize, usize, f64),
        residual: &mut DVector<f64>,
    ) -> usize {
        if !self.shape.flags.regularization || !self.shape.flags.intrinsics_core {
            return row;
        }
        let nmeas_nonreg = (self.measurement_counts.board + self.measurement_counts.point) as f64;
        for icam in 0..self.shape.num_cameras_intrinsics() {
            let model = self.shape.lens_models[icam];
            if !model.info().has_core {
                continue;
            }
            let nterms = num_reg_center_terms(&model) as f64;
            let scale_sq = REGULARIZATION_BUDGET_FRACTION * nmeas_nonreg / (nterms * NORMAL_CENTER_VALUE * NORMAL_CENTER_VALUE);
            let reg_scale = scale_sq.sqrt();
            let (imager_w, imager_h) = self.imager_sizes[icam];
            let target_cx = (imager_w - 1.0) / 2.0;
            let target_cy = (imager_h - 1.0) / 2.0;
            if let Some(off) = self.shape.state_index_intrinsics(icam) {
                push(row, off + 2, reg_scale * scale::CENTER_PIXEL);
                residual[row] = reg_scale * (self.intrinsics[icam][2] - target_cx);
                row += 1;
                push(row, off + 3, reg_scale * scale::CENTER_PIXEL);
                residual[row] = reg_scale * (self.intrinsics[icam][3] - target_cy);
                row += 1;
            } else {
                row += 2;
            }
        }
        row
    }
}

fn push_block2x3(push: &mut impl FnMut(usize, usize, f64), row: usize, col: usize, block: nalgebra::Matrix2x3<f64>, w: f64) {
    for j in 0..3 {
        push(row, col + j, w * block[(0, j)]);
        push(row + 1, col + j, w * block[(1, j)]);
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for BundleProblem {
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.unpack(params);
    }

    fn params(&self) -> DVector<f64> {
        self.params_cache.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let (r, _, _) = self.residuals_and_jacobian();
        Some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let (_, j, _) = self.residuals_and_jacobian();
        Some(j)
    }
}

impl BundleProblem {
    pub fn sparse_jacobian(&self) -> CsrMatrix<f64> {
        let (_, _, coo) = self.residuals_and_jacobian();
        CsrMatrix::from(&coo)
    }
}
