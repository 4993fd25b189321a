//! Rigid transforms in scaled-axis-angle + translation form, and their
//! hand-derived gradients.
//!
//! A pose is packed as `(r, t)`, a 6-vector: `r` is a Rodrigues rotation
//! vector (direction = axis, magnitude = angle in radians), `t` is a plain
//! translation. Composition of two poses needs the joint rotation's
//! gradient with respect to both input rotations; we get there via the
//! unit-quaternion exponential/log maps rather than differentiating the
//! matrix logarithm directly.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Matrix4x3, Vector3, Vector4};

/// A rigid transform: `p_out = R(r) p_in + t`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Pose {
    pub r: Vector3<f64>,
    pub t: Vector3<f64>,
}

impl Pose {
    pub fn identity() -> Self {
        Pose {
            r: Vector3::zeros(),
            t: Vector3::zeros(),
        }
    }

    pub fn to_array(&self) -> [f64; 6] {
        [self.r.x, self.r.y, self.r.z, self.t.x, self.t.y, self.t.z]
    }

    pub fn from_slice(s: &[f64]) -> Self {
        Pose {
            r: Vector3::new(s[0], s[1], s[2]),
            t: Vector3::new(s[3], s[4], s[5]),
        }
    }
}

const TINY_ANGLE: f64 = 1e-8;

pub fn skew(v: Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Rotation matrix for a Rodrigues vector `r`, via Rodrigues' formula.
pub fn rodrigues_r_to_matrix(r: Vector3<f64>) -> Matrix3<f64> {
    let theta = r.norm();
    if theta < TINY_ANGLE {
        return Matrix3::identity() + skew(r);
    }
    let k = r / theta;
    let kk = k * k.transpose();
    Matrix3::identity() * theta.cos()
        + skew(k) * theta.sin()
        + kk * (1.0 - theta.cos())
}

/// `R(r) p` and its gradient `d(R(r) p)/dr`, via the closed form of
/// Gallego & Yezzi ("A compact formula for the derivative of a 3-D
/// rotation in exponential coordinates").
pub fn rotate_point_jacobian(r: Vector3<f64>, p: Vector3<f64>) -> (Vector3<f64>, Matrix3<f64>) {
    let theta = r.norm();
    let rp = rodrigues_r_to_matrix(r) * p;
    if theta < TINY_ANGLE {
        return (rp, -skew(p));
    }
    let rmat = rodrigues_r_to_matrix(r);
    let d = -rmat
        * skew(p)
        * (r * r.transpose() + (rmat.transpose() - Matrix3::identity()) * skew(r))
        / (theta * theta);
    (rp, d)
}

/// Rodrigues vector `r` -> unit quaternion `(w, x, y, z)`, plus `dq/dr` (4x3):
/// row `i` is `d q_i / d r`.
fn quat_from_r(r: Vector3<f64>) -> (Vector4<f64>, Matrix4x3<f64>) {
    let theta = r.norm();
    if theta < TINY_ANGLE {
        let q = Vector4::new(1.0, r.x / 2.0, r.y / 2.0, r.z / 2.0);
        let mut dq_dr = Matrix4x3::zeros();
        dq_dr[(1, 0)] = 0.5;
        dq_dr[(2, 1)] = 0.5;
        dq_dr[(3, 2)] = 0.5;
        return (q, dq_dr);
    }
    let half = theta / 2.0;
    let (s, c) = (half.sin(), half.cos());
    let a = s / theta;
    let qw = c;
    let qv = r * a;
    let q = Vector4::new(qw, qv.x, qv.y, qv.z);

    let dqw_dr = -0.5 * a * r; // gradient row of the scalar qw wrt r
    let dqv_dr = Matrix3::identity() * a + (r * r.transpose()) * ((0.5 * c - a) / (theta * theta));

    let mut dq_dr = Matrix4x3::zeros();
    dq_dr.row_mut(0).copy_from(&dqw_dr.transpose());
    for row in 0..3 {
        dq_dr.row_mut(row + 1).copy_from(&dqv_dr.row(row));
    }
    (q, dq_dr)
}

/// Unit quaternion `(w,x,y,z)` -> Rodrigues vector, plus `dr/dq` (3x4).
///
/// nalgebra's `Vector4` fields are named `x,y,z,w`; we only ever index it
/// positionally here and treat slot 0 as the scalar part.
fn r_from_quat(q: Vector4<f64>) -> (Vector3<f64>, Matrix3x4<f64>) {
    let qw = q[0];
    let qv = Vector3::new(q[1], q[2], q[3]);
    let s = qv.norm();
    if s < TINY_ANGLE {
        let r = qv * 2.0;
        let mut dr_dq = Matrix3x4::zeros();
        dr_dq.column_mut(0).copy_from(&(-2.0 * qv));
        let two_i = Matrix3::identity() * 2.0;
        for col in 0..3 {
            dr_dq.column_mut(col + 1).copy_from(&two_i.column(col));
        }
        return (r, dr_dq);
    }
    let n = qv / s;
    let theta = 2.0 * s.atan2(qw);
    let r = n * theta;

    let dr_dqw = -2.0 * qv;
    let nnt = n * n.transpose();
    let dr_dqv = (Matrix3::identity() - nnt) * (theta / s) + nnt * (2.0 * qw);

    let mut dr_dq = Matrix3x4::zeros();
    dr_dq.column_mut(0).copy_from(&dr_dqw);
    for col in 0..3 {
        dr_dq.column_mut(col + 1).copy_from(&dr_dqv.column(col));
    }
    (r, dr_dq)
}

/// Hamilton-product "left multiply by q" matrix: `q ⊗ p == left_mult(q) * p`.
fn left_mult(q: Vector4<f64>) -> Matrix4<f64> {
    let (w, x, y, z) = (q[0], q[1], q[2], q[3]);
    Matrix4::new(
        w, -x, -y, -z, x, w, -z, y, y, z, w, -x, z, -y, x, w,
    )
}

/// Hamilton-product "right multiply by p" matrix: `q ⊗ p == right_mult(p) * q`.
fn right_mult(p: Vector4<f64>) -> Matrix4<f64> {
    let (w, x, y, z) = (p[0], p[1], p[2], p[3]);
    Matrix4::new(
        w, -x, -y, -z, x, w, z, -y, y, -z, w, x, z, y, -x, w,
    )
}

/// Gradient blocks for composing two rigid transforms:
/// `p_ref = Rf p_frame + tf`, `p_cam = Rc p_ref + tc`, so
/// `p_cam = Rj p_frame + tj` with `Rj = Rc Rf`, `tj = Rc tf + tc`.
///
/// Only the four nonzero blocks are computed; the rest (`drj/dtc`,
/// `drj/dtf`, `dtj/dtc` is the identity and not worth a field, `dtj/drf`)
/// are structurally zero or identity and are never materialized.
pub struct ComposeGrad {
    pub drj_drc: Matrix3<f64>,
    pub drj_drf: Matrix3<f64>,
    pub dtj_drc: Matrix3<f64>,
    pub dtj_dtf: Matrix3<f64>,
}

pub fn compose_rt(cam: Pose, frame: Pose) -> (Pose, ComposeGrad) {
    let (qc, dqc_dr) = quat_from_r(cam.r);
    let (qf, dqf_dr) = quat_from_r(frame.r);
    let qj = right_mult(qf) * qc; // = left_mult(qc) * qf, same result

    let (rj, drj_dqj) = r_from_quat(qj);

    // chain rule: drj/drc = drj_dqj * (dqj/dqc) * dqc_dr ; dqj/dqc = right_mult(qf)
    let drj_drc = drj_dqj * right_mult(qf) * dqc_dr;
    let drj_drf = drj_dqj * left_mult(qc) * dqf_dr;

    let (tj_rot, dtj_drc) = rotate_point_jacobian(cam.r, frame.t);
    let tj = tj_rot + cam.t;
    let dtj_dtf = rodrigues_r_to_matrix(cam.r);

    let pose = Pose { r: rj, t: tj };
    let grad = ComposeGrad {
        drj_drc,
        drj_drf,
        dtj_drc,
        dtj_dtf,
    };
    (pose, grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn fd_rotate(r: Vector3<f64>, p: Vector3<f64>) -> Matrix3<f64> {
        let h = 1e-6;
        let mut cols = Matrix3::zeros();
        for i in 0..3 {
            let mut rp = r;
            rp[i] += h;
            let mut rm = r;
            rm[i] -= h;
            let d = (rodrigues_r_to_matrix(rp) * p - rodrigues_r_to_matrix(rm) * p) / (2.0 * h);
            cols.column_mut(i).copy_from(&d);
        }
        cols
    }

    #[test]
    fn rotate_point_jacobian_matches_finite_difference() {
        let r = Vector3::new(0.3, -0.2, 0.1);
        let p = Vector3::new(1.0, 2.0, 3.0);
        let (_, jac) = rotate_point_jacobian(r, p);
        let fd = fd_rotate(r, p);
        assert_relative_eq!(jac, fd, epsilon = 1e-5);
    }

    #[test]
    fn identity_pose_is_noop() {
        let r = Vector3::zeros();
        let p = Vector3::new(1.0, 2.0, 3.0);
        let (rp, _) = rotate_point_jacobian(r, p);
        assert_relative_eq!(rp, p, epsilon = 1e-12);
    }

    #[test]
    fn compose_with_identity_camera_is_frame() {
        let cam = Pose::identity();
        let frame = Pose {
            r: Vector3::new(0.1, 0.2, 0.3),
            t: Vector3::new(1.0, 2.0, 3.0),
        };
        let (joint, _) = compose_rt(cam, frame);
        assert_relative_eq!(joint.r, frame.r, epsilon = 1e-9);
        assert_relative_eq!(joint.t, frame.t, epsilon = 1e-9);
    }
}
