//! Forward projection kernels: camera-frame point -> pixel, with
//! hand-derived gradients. Every model factors into a dimensionless
//! "normalize" step (model-specific) followed by a universal focal/center
//! scaling, since `qx = fx * px + cx` for every model here; the core
//! intrinsics gradient is therefore computed once, generically, rather
//! than per-kernel.

use nalgebra::{Matrix2x3, Vector2, Vector3};

use crate::lens::LensModel;

/// Sparse intrinsics-gradient structure for the splined model: a pixel
/// residual depends on only `(order+1)^2` control points, expressed as the
/// outer product of two 1D basis vectors rather than densified.
#[derive(Debug, Clone)]
pub struct SplineGrad {
    pub ix0: usize,
    pub iy0: usize,
    pub nx: usize,
    pub basis_x: Vec<f64>,
    pub basis_y: Vec<f64>,
}

#[derive(Debug, Clone)]
pub enum DistortionGrad {
    /// Row-major 2 x Ndistortion dense block.
    Dense(Vec<f64>),
    Splined(SplineGrad),
    /// The model has no analytic gradient (CAHVORE).
    None,
}

#[derive(Debug, Clone)]
pub struct Projection {
    pub q: Vector2<f64>,
    pub dq_dv: Matrix2x3<f64>,
    /// Always populated for `has_core` models; `[[px,0,1,0],[0,py,0,1]]`.
    pub dq_dcore: nalgebra::Matrix2x4<f64>,
    pub dq_ddist: DistortionGrad,
}

fn apply_core(
    px: f64,
    py: f64,
    dn_dv: Matrix2x3<f64>,
    dn_ddist: Option<Vec<[f64; 2]>>,
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
) -> Projection {
    let q = Vector2::new(fx * px + cx, fy * py + cy);
    let dq_dv = Matrix2x3::new(
        fx * dn_dv[(0, 0)],
        fx * dn_dv[(0, 1)],
        fx * dn_dv[(0, 2)],
        fy * dn_dv[(1, 0)],
        fy * dn_dv[(1, 1)],
        fy * dn_dv[(1, 2)],
    );
    let dq_dcore = nalgebra::Matrix2x4::new(px, 0.0, 1.0, 0.0, 0.0, py, 0.0, 1.0);
    let dq_ddist = match dn_ddist {
        None => DistortionGrad::Dense(vec![]),
        Some(rows) => {
            let mut flat = Vec::with_capacity(rows.len() * 2);
            for r in &rows {
                flat.push(fx * r[0]);
            }
            for r in &rows {
                flat.push(fy * r[1]);
            }
            DistortionGrad::Dense(flat)
        }
    };
    Projection {
        q,
        dq_dv,
        dq_dcore,
        dq_ddist,
    }
}

fn pinhole_normalize(v: Vector3<f64>) -> (f64, f64, Matrix2x3<f64>) {
    let (vx, vy, vz) = (v.x, v.y, v.z);
    let px = vx / vz;
    let py = vy / vz;
    let dn_dv = Matrix2x3::new(1.0 / vz, 0.0, -vx / (vz * vz), 0.0, 1.0 / vz, -vy / (vz * vz));
    (px, py, dn_dv)
}

fn stereographic_normalize(v: Vector3<f64>) -> (f64, f64, Matrix2x3<f64>) {
    let n = v.norm();
    let s = 2.0 / (n + v.z);
    let px = v.x * s;
    let py = v.y * s;

    let ds_dv = Vector3::new(
        -2.0 * (v.x / n) / (n + v.z).powi(2),
        -2.0 * (v.y / n) / (n + v.z).powi(2),
        -2.0 * (v.z / n + 1.0) / (n + v.z).powi(2),
    );
    let dn_dv = Matrix2x3::new(
        s + v.x * ds_dv.x,
        v.x * ds_dv.y,
        v.x * ds_dv.z,
        v.y * ds_dv.x,
        s + v.y * ds_dv.y,
        v.y * ds_dv.z,
    );
    (px, py, dn_dv)
}

fn lonlat_normalize(v: Vector3<f64>, swap: bool) -> (f64, f64, Matrix2x3<f64>) {
    // swap==false: px = atan2(vx,vz), py = asin(vy/||v||) (LONLAT)
    // swap==true:  px = asin(vx/||v||), py = atan2(vy,vz) (LATLON)
    let (a, b) = if swap { (v.y, v.x) } else { (v.x, v.y) };
    let n = v.norm();
    let d = a * a + v.z * v.z;
    let p_atan = a.atan2(v.z);
    let w = b / n;
    let p_asin = w.asin();

    let datan_da = v.z / d;
    let datan_dz = -a / d;
    let dw_da = -b * a / n.powi(3);
    let dw_db = (n * n - b * b) / n.powi(3);
    let dw_dz = -b * v.z / n.powi(3);
    let dasin_dw = 1.0 / (1.0 - w * w).sqrt();

    if !swap {
        let dn_dv = Matrix2x3::new(
            datan_da,
            0.0,
            datan_dz,
            dasin_dw * dw_da,
            dasin_dw * dw_db,
            dasin_dw * dw_dz,
        );
        (p_atan, p_asin, dn_dv)
    } else {
        // px = asin(vx/n) uses (a=vy,b=vx) swapped above, so recompute with
        // correct roles: a=vy feeds atan2 (that's py in LATLON), b=vx feeds asin (px).
        let dn_dv = Matrix2x3::new(
            dasin_dw * dw_db,
            dasin_dw * dw_da,
            dasin_dw * dw_dz,
            0.0,
            datan_da,
            datan_dz,
        );
        (p_asin, p_atan, dn_dv)
    }
}

struct OpenCvParams {
    k1: f64,
    k2: f64,
    p1: f64,
    p2: f64,
    k3: f64,
    k4: f64,
    k5: f64,
    k6: f64,
    s1: f64,
    s2: f64,
    s3: f64,
    s4: f64,
    n: usize,
}

impl OpenCvParams {
    fn from_slice(d: &[f64]) -> Self {
        let get = |i: usize| d.get(i).copied().unwrap_or(0.0);
        OpenCvParams {
            k1: get(0),
            k2: get(1),
            p1: get(2),
            p2: get(3),
            k3: get(4),
            k4: get(5),
            k5: get(6),
            k6: get(7),
            s1: get(8),
            s2: get(9),
            s3: get(10),
            s4: get(11),
            n: d.len(),
        }
    }
}

fn opencv_normalize(v: Vector3<f64>, dist: &[f64]) -> (f64, f64, Matrix2x3<f64>, Vec<[f64; 2]>) {
    let p = OpenCvParams::from_slice(dist);
    let (vx, vy, vz) = (v.x, v.y, v.z);
    let xp = vx / vz;
    let yp = vy / vz;
    let r2 = xp * xp + yp * yp;
    let r4 = r2 * r2;
    let r6 = r4 * r2;

    let num = 1.0 + p.k1 * r2 + p.k2 * r4 + p.k3 * r6;
    let den = if p.n >= 8 {
        1.0 + p.k4 * r2 + p.k5 * r4 + p.k6 * r6
    } else {
        1.0
    };
    let radial = num / den;
    let dnum_dr2 = p.k1 + 2.0 * p.k2 * r2 + 3.0 * p.k3 * r4;
    let dden_dr2 = if p.n >= 8 {
        p.k4 + 2.0 * p.k5 * r2 + 3.0 * p.k6 * r4
    } else {
        0.0
    };
    let dradial_dr2 = (dnum_dr2 * den - num * dden_dr2) / (den * den);

    let (thin_x, thin_y) = if p.n >= 12 {
        (p.s1 * r2 + p.s2 * r4, p.s3 * r2 + p.s4 * r4)
    } else {
        (0.0, 0.0)
    };

    let xd = xp * radial + 2.0 * p.p1 * xp * yp + p.p2 * (r2 + 2.0 * xp * xp) + thin_x;
    let yd = yp * radial + p.p1 * (r2 + 2.0 * yp * yp) + 2.0 * p.p2 * xp * yp + thin_y;

    let dthin_x_dr2 = if p.n >= 12 { p.s1 + 2.0 * p.s2 * r2 } else { 0.0 };
    let dthin_y_dr2 = if p.n >= 12 { p.s3 + 2.0 * p.s4 * r2 } else { 0.0 };

    let dxd_dxp = radial + xp * dradial_dr2 * 2.0 * xp + 2.0 * p.p1 * yp + p.p2 * 6.0 * xp
        + dthin_x_dr2 * 2.0 * xp;
    let dxd_dyp = xp * dradial_dr2 * 2.0 * yp + 2.0 * p.p1 * xp + p.p2 * 2.0 * yp
        + dthin_x_dr2 * 2.0 * yp;
    let dyd_dxp = yp * dradial_dr2 * 2.0 * xp + 2.0 * p.p2 * yp + p.p1 * 2.0 * xp
        + dthin_y_dr2 * 2.0 * xp;
    let dyd_dyp = radial + yp * dradial_dr2 * 2.0 * yp + 2.0 * p.p2 * xp + p.p1 * 6.0 * yp
        + dthin_y_dr2 * 2.0 * yp;

    let dxp_dv = Vector3::new(1.0 / vz, 0.0, -vx / (vz * vz));
    let dyp_dv = Vector3::new(0.0, 1.0 / vz, -vy / (vz * vz));

    let dxd_dv = dxp_dv * dxd_dxp + dyp_dv * dxd_dyp;
    let dyd_dv = dxp_dv * dyd_dxp + dyp_dv * dyd_dyp;
    let dn_dv = Matrix2x3::new(
        dxd_dv.x, dxd_dv.y, dxd_dv.z, dyd_dv.x, dyd_dv.y, dyd_dv.z,
    );

    let mut rows = Vec::with_capacity(p.n);
    let den2 = den * den;
    if p.n >= 4 {
        rows.push([xp * r2 / den, yp * r2 / den]); // k1
        rows.push([xp * r4 / den, yp * r4 / den]); // k2
        rows.push([2.0 * xp * yp, r2 + 2.0 * yp * yp]); // p1
        rows.push([r2 + 2.0 * xp * xp, 2.0 * xp * yp]); // p2
    }
    if p.n >= 5 {
        rows.push([xp * r6 / den, yp * r6 / den]); // k3
    }
    if p.n >= 8 {
        rows.push([-xp * num * r2 / den2, -yp * num * r2 / den2]); // k4
        rows.push([-xp * num * r4 / den2, -yp * num * r4 / den2]); // k5
        rows.push([-xp * num * r6 / den2, -yp * num * r6 / den2]); // k6
    }
    if p.n >= 12 {
        rows.push([r2, 0.0]); // s1
        rows.push([r4, 0.0]); // s2
        rows.push([0.0, r2]); // s3
        rows.push([0.0, r4]); // s4
    }

    (xd, yd, dn_dv, rows)
}

fn cahvor_axis(alpha: f64, beta: f64) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
    let (sa, ca) = alpha.sin_cos();
    let (sb, cb) = beta.sin_cos();
    let o = Vector3::new(sa * cb, sb, ca * cb);
    let do_dalpha = Vector3::new(ca * cb, 0.0, -sa * cb);
    let do_dbeta = Vector3::new(-sa * sb, cb, -ca * sb);
    (o, do_dalpha, do_dbeta)
}

/// CAHVOR warp of a camera-frame ray into the warped point `v'`, plus its
/// gradient w.r.t. `v` and w.r.t. `(alpha,beta,r0,r1,r2)`.
fn cahvor_warp(
    v: Vector3<f64>,
    alpha: f64,
    beta: f64,
    r0: f64,
    r1: f64,
    r2p: f64,
) -> (Vector3<f64>, nalgebra::Matrix3<f64>, [Vector3<f64>; 5]) {
    use nalgebra::Matrix3;
    let (o, do_dalpha, do_dbeta) = cahvor_axis(alpha, beta);
    let n2 = v.dot(&v);
    let omega = v.dot(&o);
    let tau = n2 / (omega * omega) - 1.0;
    let mu = r0 + tau * r1 + tau * tau * r2p;

    let domega_dalpha = v.dot(&do_dalpha);
    let domega_dbeta = v.dot(&do_dbeta);
    let dtau_domega = -2.0 * n2 / omega.powi(3);
    let dtau_dv = (2.0 * v) / (omega * omega) - o * (2.0 * n2 / omega.powi(3));
    let dtau_dalpha = dtau_domega * domega_dalpha;
    let dtau_dbeta = dtau_domega * domega_dbeta;

    let dmu_dtau = r1 + 2.0 * tau * r2p;
    let dmu_dv = dtau_dv * dmu_dtau;
    let dmu_dalpha = dmu_dtau * dtau_dalpha;
    let dmu_dbeta = dmu_dtau * dtau_dbeta;

    let vprime = (1.0 + mu) * v - mu * omega * o;

    let dvp_dv = Matrix3::identity() * (1.0 + mu)
        + v * dmu_dv.transpose()
        - o * (mu * o + omega * dmu_dv).transpose();

    let dvp_dalpha = dmu_dalpha * v
        - (dmu_dalpha * omega + mu * domega_dalpha) * o
        - mu * omega * do_dalpha;
    let dvp_dbeta =
        dmu_dbeta * v - (dmu_dbeta * omega + mu * domega_dbeta) * o - mu * omega * do_dbeta;
    let dvp_dr0 = v - omega * o;
    let dvp_dr1 = (v - omega * o) * tau;
    let dvp_dr2 = (v - omega * o) * tau * tau;

    (
        vprime,
        dvp_dv,
        [dvp_dalpha, dvp_dbeta, dvp_dr0, dvp_dr1, dvp_dr2],
    )
}

fn cahvor_normalize(v: Vector3<f64>, dist: &[f64]) -> (f64, f64, Matrix2x3<f64>, Vec<[f64; 2]>) {
    let (alpha, beta, r0, r1, r2p) = (dist[0], dist[1], dist[2], dist[3], dist[4]);
    let (vp, dvp_dv, dvp_dparams) = cahvor_warp(v, alpha, beta, r0, r1, r2p);
    let (px, py, dn_dvp) = pinhole_normalize(vp);
    let dn_dv = dn_dvp * dvp_dv;
    let rows: Vec<[f64; 2]> = dvp_dparams
        .iter()
        .map(|dvp_dparam| {
            let d = dn_dvp * dvp_dparam;
            [d.x, d.y]
        })
        .collect();
    (px, py, dn_dv, rows)
}

/// CAHVORE forward projection only (no analytic gradient): reproduces the
/// documented-as-unverified JPL CAHVORE math including the normalization
/// of the input ray, which the source notes may not have been the
/// original author's intent but which the comment insists on reproducing.
fn cahvore_project(v: Vector3<f64>, dist: &[f64], linearity: f64, fx: f64, fy: f64, cx: f64, cy: f64) -> Vector2<f64> {
    let (alpha, beta, r0, r1, r2p, e0, e1, e2) = (
        dist[0], dist[1], dist[2], dist[3], dist[4], dist[5], dist[6], dist[7],
    );
    let (o, _, _) = cahvor_axis(alpha, beta);
    let pnorm = v.norm();
    let vn = v / pnorm;
    let omega = vn.dot(&o);
    let u = omega * o;
    let ll = vn - u;
    let l = ll.norm();

    let mut theta = l.atan2(omega);
    for _ in 0..100 {
        let (sth, cth) = theta.sin_cos();
        let theta2 = theta * theta;
        let theta3 = theta * theta2;
        let theta4 = theta * theta3;
        let upsilon = omega * cth + l * sth
            - (1.0 - cth) * (e0 + e1 * theta2 + e2 * theta4)
            - (theta - sth) * (2.0 * e1 * theta + 4.0 * e2 * theta3);
        let dtheta = (omega * sth - l * cth - (theta - sth) * (e0 + e1 * theta2 + e2 * theta4))
            / upsilon;
        theta -= dtheta;
        if dtheta.abs() < 1e-8 {
            break;
        }
    }

    let wp = if theta > 1e-8 {
        let linth = linearity * theta;
        let chi = if linearity < -1e-15 {
            linth.sin() / linearity
        } else if linearity > 1e-15 {
            linth.tan() / linearity
        } else {
            theta
        };
        let chi2 = chi * chi;
        let chi4 = chi2 * chi2;
        let zetap = l / chi;
        let mu = r0 + r1 * chi2 + r2p * chi4;
        let uu = zetap * o;
        let vv = (1.0 + mu) * ll;
        uu + vv
    } else {
        vn
    };

    Vector2::new(fx * wp.x / wp.z + cx, fy * wp.y / wp.z + cy)
}

const SPLINE_MARGIN_ORDER3: usize = 2;
const SPLINE_MARGIN_ORDER2: usize = 1;

fn segments_per_u(order: u8, n: usize, fov_x_deg: f64) -> f64 {
    let margin = order as f64 - 1.0;
    (n as f64 - 1.0 - margin) / (2.0 * (fov_x_deg.to_radians() / 4.0).tan())
}

fn cubic_basis(x: f64) -> ([f64; 4], [f64; 4]) {
    let a = (-x.powi(3) + 3.0 * x * x - 3.0 * x + 1.0) / 6.0;
    let b = x.powi(3) / 2.0 - x * x + 2.0 / 3.0;
    let c = (-x.powi(3) / 2.0 + x * x / 2.0 + x / 2.0 + 1.0 / 6.0);
    let d = x.powi(3) / 6.0;
    let da = (-3.0 * x * x + 6.0 * x - 3.0) / 6.0;
    let db = 1.5 * x * x - 2.0 * x;
    let dc = -1.5 * x * x + x + 0.5;
    let dd = x * x / 2.0;
    ([a, b, c, d], [da, db, dc, dd])
}

fn quadratic_basis(x: f64) -> ([f64; 3], [f64; 3]) {
    let a = (4.0 * x * x - 4.0 * x + 1.0) / 8.0;
    let b = (3.0 - 4.0 * x * x) / 4.0;
    let c = (4.0 * x * x + 4.0 * x + 1.0) / 8.0;
    let da = x - 0.5;
    let db = -2.0 * x;
    let dc = x + 0.5;
    ([a, b, c], [da, db, dc])
}

fn splined_normalize(
    v: Vector3<f64>,
    control_points: &[f64],
    order: u8,
    nx: usize,
    ny: usize,
    fov_x_deg: f64,
    fx: f64,
    fy: f64,
) -> (f64, f64, Matrix2x3<f64>, SplineGrad) {
    let (ux, uy, du_dv) = stereographic_normalize(v);
    let spu = segments_per_u(order, nx, fov_x_deg);
    let ix = ux * spu + (nx as f64 - 1.0) / 2.0;
    let iy = uy * spu + (ny as f64 - 1.0) / 2.0;

    let (ix0, iy0, fracx, fracy, basis_x, basis_y, dbasis_x, dbasis_y) = if order == 3 {
        let mut ix0 = ix.floor() as i64;
        let mut iy0 = iy.floor() as i64;
        ix0 = ix0.clamp(1, nx as i64 - 3);
        iy0 = iy0.clamp(1, ny as i64 - 3);
        let fracx = ix - ix0 as f64;
        let fracy = iy - iy0 as f64;
        let (bx, dbx) = cubic_basis(fracx);
        let (by, dby) = cubic_basis(fracy);
        (
            (ix0 - 1) as usize,
            (iy0 - 1) as usize,
            fracx,
            fracy,
            bx.to_vec(),
            by.to_vec(),
            dbx.to_vec(),
            dby.to_vec(),
        )
    } else {
        let mut ix0 = (ix + 0.5).floor() as i64;
        let mut iy0 = (iy + 0.5).floor() as i64;
        ix0 = ix0.clamp(1, nx as i64 - 2);
        iy0 = iy0.clamp(1, ny as i64 - 2);
        let fracx = ix - ix0 as f64;
        let fracy = iy - iy0 as f64;
        let (bx, dbx) = quadratic_basis(fracx);
        let (by, dby) = quadratic_basis(fracy);
        (
            (ix0 - 1) as usize,
            (iy0 - 1) as usize,
            fracx,
            fracy,
            bx.to_vec(),
            by.to_vec(),
            dbx.to_vec(),
            dby.to_vec(),
        )
    };
    let _ = (fracx, fracy, SPLINE_MARGIN_ORDER3, SPLINE_MARGIN_ORDER2);

    let k = basis_x.len();
    let mut dux = 0.0;
    let mut duy = 0.0;
    let mut ddux_dux_local = 0.0; // d(deltau.x)/d(local x coordinate ix)
    let mut ddux_duy_local = 0.0;
    let mut dduy_dux_local = 0.0;
    let mut dduy_duy_local = 0.0;
    for j in 0..k {
        for i in 0..k {
            let row = iy0 + j;
            let col = ix0 + i;
            let idx = 2 * (row * nx + col);
            let cx_cp = control_points[idx];
            let cy_cp = control_points[idx + 1];
            let w = basis_x[i] * basis_y[j];
            dux += w * cx_cp;
            duy += w * cy_cp;
            ddux_dux_local += dbasis_x[i] * basis_y[j] * cx_cp;
            ddux_duy_local += basis_x[i] * dbasis_y[j] * cx_cp;
            dduy_dux_local += dbasis_x[i] * basis_y[j] * cy_cp;
            dduy_duy_local += basis_x[i] * dbasis_y[j] * cy_cp;
        }
    }

    let px = ux + dux;
    let py = uy + duy;

    // local-coordinate derivatives scale by segments_per_u to become du-space.
    let ddux_dux = ddux_dux_local * spu;
    let ddux_duy = ddux_duy_local * spu;
    let dduy_dux = dduy_dux_local * spu;
    let dduy_duy = dduy_duy_local * spu;

    // dq/dv = f * d(u+deltau(u))/dv = f * (I + ddeltau/du) * du/dv
    let jac_u = nalgebra::Matrix2::new(1.0 + ddux_dux, ddux_duy, dduy_dux, 1.0 + dduy_duy);
    let dn_dv = jac_u * du_dv;
    let _ = (fx, fy);

    (
        px,
        py,
        dn_dv,
        SplineGrad {
            ix0,
            iy0,
            nx,
            basis_x,
            basis_y,
        },
    )
}

/// Forward-project a camera-frame point through the given lens model.
/// `intrinsics` is the full parameter vector (core + distortion/control
/// points). Panics if `v.z <= 0` for a model that cannot project behind
/// the camera (callers are expected to have checked `ModelInfo` already).
pub fn project(model: &LensModel, intrinsics: &[f64], v: Vector3<f64>) -> Projection {
    let (fx, fy, cx, cy) = (intrinsics[0], intrinsics[1], intrinsics[2], intrinsics[3]);
    match model {
        LensModel::Pinhole => {
            let (px, py, dn_dv) = pinhole_normalize(v);
            apply_core(px, py, dn_dv, None, fx, fy, cx, cy)
        }
        LensModel::Stereographic => {
            let (px, py, dn_dv) = stereographic_normalize(v);
            apply_core(px, py, dn_dv, None, fx, fy, cx, cy)
        }
        LensModel::LonLat => {
            let (px, py, dn_dv) = lonlat_normalize(v, false);
            apply_core(px, py, dn_dv, None, fx, fy, cx, cy)
        }
        LensModel::LatLon => {
            let (px, py, dn_dv) = lonlat_normalize(v, true);
            apply_core(px, py, dn_dv, None, fx, fy, cx, cy)
        }
        LensModel::OpenCv4 | LensModel::OpenCv5 | LensModel::OpenCv8 | LensModel::OpenCv12 => {
            let (px, py, dn_dv, rows) = opencv_normalize(v, &intrinsics[4..]);
            apply_core(px, py, dn_dv, Some(rows), fx, fy, cx, cy)
        }
        LensModel::Cahvor => {
            let (px, py, dn_dv, rows) = cahvor_normalize(v, &intrinsics[4..9]);
            apply_core(px, py, dn_dv, Some(rows), fx, fy, cx, cy)
        }
        LensModel::Cahvore(cfg) => {
            let q = cahvore_project(v, &intrinsics[4..12], cfg.linearity, fx, fy, cx, cy);
            Projection {
                q,
                dq_dv: Matrix2x3::zeros(),
                dq_dcore: nalgebra::Matrix2x4::zeros(),
                dq_ddist: DistortionGrad::None,
            }
        }
        LensModel::SplinedStereographic(cfg) => {
            let (px, py, dn_dv, grad) = splined_normalize(
                v,
                &intrinsics[4..],
                cfg.order,
                cfg.nx,
                cfg.ny,
                cfg.fov_x_deg,
                fx,
                fy,
            );
            let mut p = apply_core(px, py, dn_dv, None, fx, fy, cx, cy);
            p.dq_ddist = DistortionGrad::Splined(grad);
            p
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pinhole_matches_scenario_1() {
        let intrinsics = [1000.0, 1000.0, 500.0, 500.0];
        let v = Vector3::new(1.0, 2.0, 10.0);
        let p = project(&LensModel::Pinhole, &intrinsics, v);
        assert_relative_eq!(p.q.x, 600.0, epsilon = 1e-9);
        assert_relative_eq!(p.q.y, 700.0, epsilon = 1e-9);
    }

    #[test]
    fn stereographic_matches_scenario_2() {
        let intrinsics = [1000.0, 1000.0, 500.0, 500.0];
        let v = Vector3::new(1.0, 0.0, -1.0);
        let p = project(&LensModel::Stereographic, &intrinsics, v);
        let expected_s = 2.0 / (2.0_f64.sqrt() - 1.0);
        assert_relative_eq!(p.q.x, 500.0 + 1000.0 * expected_s, epsilon = 1e-6);
        assert_relative_eq!(p.q.y, 500.0, epsilon = 1e-9);
    }

    fn fd_dq_dv(model: &LensModel, intrinsics: &[f64], v: Vector3<f64>) -> Matrix2x3<f64> {
        let h = 1e-6;
        let mut cols = Matrix2x3::zeros();
        for i in 0..3 {
            let mut vp = v;
            vp[i] += h;
            let mut vm = v;
            vm[i] -= h;
            let qp = project(model, intrinsics, vp).q;
            let qm = project(model, intrinsics, vm).q;
            let d = (qp - qm) / (2.0 * h);
            cols.set_column(i, &d);
        }
        cols
    }

    #[test]
    fn pinhole_gradient_matches_finite_difference() {
        let intrinsics = [1000.0, 1100.0, 500.0, 480.0];
        let v = Vector3::new(0.3, -0.2, 5.0);
        let p = project(&LensModel::Pinhole, &intrinsics, v);
        let fd = fd_dq_dv(&LensModel::Pinhole, &intrinsics, v);
        assert_relative_eq!(p.dq_dv, fd, epsilon = 1e-4);
    }

    #[test]
    fn stereographic_gradient_matches_finite_difference() {
        let intrinsics = [900.0, 950.0, 512.0, 384.0];
        let v = Vector3::new(0.4, 0.3, 2.0);
        let p = project(&LensModel::Stereographic, &intrinsics, v);
        let fd = fd_dq_dv(&LensModel::Stereographic, &intrinsics, v);
        assert_relative_eq!(p.dq_dv, fd, epsilon = 1e-4);
    }

    #[test]
    fn opencv4_gradient_matches_finite_difference() {
        let intrinsics = [900.0, 900.0, 500.0, 500.0, 0.1, -0.05, 0.001, -0.002];
        let v = Vector3::new(0.3, -0.25, 3.0);
        let p = project(&LensModel::OpenCv4, &intrinsics, v);
        let fd = fd_dq_dv(&LensModel::OpenCv4, &intrinsics, v);
        assert_relative_eq!(p.dq_dv, fd, epsilon = 1e-4);
    }

    #[test]
    fn cahvor_gradient_matches_finite_difference() {
        let intrinsics = [900.0, 900.0, 500.0, 500.0, 0.01, -0.02, 0.2, 0.05, -0.01];
        let v = Vector3::new(0.2, 0.15, 4.0);
        let p = project(&LensModel::Cahvor, &intrinsics, v);
        let fd = fd_dq_dv(&LensModel::Cahvor, &intrinsics, v);
        assert_relative_eq!(p.dq_dv, fd, epsilon = 1e-4);
    }
}
