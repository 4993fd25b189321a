//! Inverse projection: pixel -> camera-frame direction.
//!
//! Four models have closed forms; everything else is solved as a small
//! 2-variable Gauss-Newton problem over the stereographic representation
//! of the direction, independent of the big sparse bundle-adjustment
//! solve this crate otherwise treats as an external collaborator.

use nalgebra::{Vector2, Vector3};

use crate::lens::LensModel;
use crate::project::project;

fn stereographic_unproject_dir(u: Vector2<f64>) -> Vector3<f64> {
    let r2 = u.x * u.x + u.y * u.y;
    let z = (4.0 - r2) / (4.0 + r2);
    let scale = (1.0 + z) / 2.0;
    Vector3::new(u.x * scale, u.y * scale, z)
}

fn stereographic_project_dir(v: Vector3<f64>) -> Vector2<f64> {
    let n = v.norm();
    let s = 2.0 / (n + v.z);
    Vector2::new(v.x * s, v.y * s)
}

/// Unproject pixel `q` given full `intrinsics`. Returns `None` if Newton
/// iteration fails to converge (caller should emit NaN for that point, per
/// the documented contract).
pub fn unproject(model: &LensModel, intrinsics: &[f64], q: Vector2<f64>) -> Option<Vector3<f64>> {
    let (fx, fy, cx, cy) = (intrinsics[0], intrinsics[1], intrinsics[2], intrinsics[3]);
    let px = (q.x - cx) / fx;
    let py = (q.y - cy) / fy;

    match model {
        LensModel::Pinhole => Some(Vector3::new(px, py, 1.0)),
        LensModel::Stereographic => Some(stereographic_unproject_dir(Vector2::new(px, py))),
        LensModel::LonLat => {
            let lon = px;
            let lat = py;
            Some(Vector3::new(
                lon.sin() * lat.cos(),
                lat.sin(),
                lon.cos() * lat.cos(),
            ))
        }
        LensModel::LatLon => {
            let lat = px;
            let lon = py;
            Some(Vector3::new(
                lat.sin(),
                lon.sin() * lat.cos(),
                lon.cos() * lat.cos(),
            ))
        }
        _ => newton_unproject(model, intrinsics, q),
    }
}

/// Gauss-Newton unprojection: state is the 2-vector stereographic
/// representation `u` of the candidate direction; residual is the pixel
/// mismatch, minimized until `||residual||^2 / 2 < 1e-4` (100 iterations
/// max).
fn newton_unproject(model: &LensModel, intrinsics: &[f64], q: Vector2<f64>) -> Option<Vector3<f64>> {
    let (fx, fy, cx, cy) = (intrinsics[0], intrinsics[1], intrinsics[2], intrinsics[3]);
    let mut u = Vector2::new((q.x - cx) / fx, (q.y - cy) / fy);

    for _ in 0..100 {
        let v = stereographic_unproject_dir(u);
        let proj = project(model, intrinsics, v);
        let residual = proj.q - q;
        if residual.norm_squared() / 2.0 < 1e-4 {
            let dir = stereographic_unproject_dir(u);
            return Some(finalize_direction(model, dir));
        }

        // dq/du = dq/dv * dv/du, dv/du via finite difference on the cheap
        // stereographic<->direction map (2x2, local to this solve only).
        let h = 1e-6;
        let vp0 = stereographic_unproject_dir(u + Vector2::new(h, 0.0));
        let vm0 = stereographic_unproject_dir(u - Vector2::new(h, 0.0));
        let vp1 = stereographic_unproject_dir(u + Vector2::new(0.0, h));
        let vm1 = stereographic_unproject_dir(u - Vector2::new(0.0, h));
        let dv_du0 = (vp0 - vm0) / (2.0 * h);
        let dv_du1 = (vp1 - vm1) / (2.0 * h);

        let dq_dcol0 = proj.dq_dv * dv_du0;
        let dq_dcol1 = proj.dq_dv * dv_du1;
        let dq_du = nalgebra::Matrix2::new(
            dq_dcol0.x, dq_dcol1.x, dq_dcol0.y, dq_dcol1.y,
        );

        let det = dq_du[(0, 0)] * dq_du[(1, 1)] - dq_du[(0, 1)] * dq_du[(1, 0)];
        if det.abs() < 1e-300 {
            return None;
        }
        let inv = nalgebra::Matrix2::new(
            dq_du[(1, 1)] / det,
            -dq_du[(0, 1)] / det,
            -dq_du[(1, 0)] / det,
            dq_du[(0, 0)] / det,
        );
        u -= inv * residual;
    }
    None
}

fn finalize_direction(model: &LensModel, dir: Vector3<f64>) -> Vector3<f64> {
    if !model.info().can_project_behind_camera && dir.z < 0.0 {
        -dir
    } else {
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pinhole_roundtrip() {
        let intrinsics = [1000.0, 1000.0, 500.0, 500.0];
        let v = Vector3::new(1.0, 2.0, 10.0);
        let q = project(&LensModel::Pinhole, &intrinsics, v).q;
        let dir = unproject(&LensModel::Pinhole, &intrinsics, q).unwrap();
        let cos = dir.normalize().dot(&v.normalize());
        assert_relative_eq!(cos, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn stereographic_roundtrip_behind_camera() {
        let intrinsics = [1000.0, 1000.0, 500.0, 500.0];
        let v = Vector3::new(1.0, 0.0, -1.0);
        let q = project(&LensModel::Stereographic, &intrinsics, v).q;
        let dir = unproject(&LensModel::Stereographic, &intrinsics, q).unwrap();
        let cos = dir.normalize().dot(&v.normalize());
        assert_relative_eq!(cos, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn opencv4_newton_unprojection_converges() {
        let intrinsics = [900.0, 900.0, 500.0, 500.0, 0.05, -0.01, 0.0005, -0.0008];
        let v = Vector3::new(0.2, -0.1, 3.0);
        let q = project(&LensModel::OpenCv4, &intrinsics, v).q;
        let dir = unproject(&LensModel::OpenCv4, &intrinsics, q).unwrap();
        let cos = dir.normalize().dot(&v.normalize());
        assert!(cos > 1.0 - 1e-6);
    }
}
