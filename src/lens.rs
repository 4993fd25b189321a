//! The lens-model registry: the closed set of projection families this
//! crate knows about, their names, and their static metadata.

use crate::error::{Error, Result};

/// Configuration carried by the CAHVORE model alongside its 9 intrinsic
/// parameters.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CahvoreConfig {
    pub linearity: f64,
}

/// Configuration carried by the splined-stereographic model.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SplinedConfig {
    /// B-spline order: 2 or 3.
    pub order: u8,
    pub nx: usize,
    pub ny: usize,
    /// Nominal horizontal field of view, in degrees.
    pub fov_x_deg: f64,
}

impl SplinedConfig {
    pub fn validate(&self) -> Result<()> {
        let min = self.order as usize + 1;
        if self.nx < min || self.ny < min {
            return Err(Error::SplineGridTooSmall {
                nx: self.nx,
                ny: self.ny,
                min,
            });
        }
        Ok(())
    }
}

/// The closed enumeration of lens kinematic families.
///
/// Mirrors the shape of the source model: most variants carry no
/// per-instance data (their parameter layout is fixed), two carry a small
/// configuration struct.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum LensModel {
    Pinhole,
    Stereographic,
    LonLat,
    LatLon,
    OpenCv4,
    OpenCv5,
    OpenCv8,
    OpenCv12,
    Cahvor,
    Cahvore(CahvoreConfig),
    SplinedStereographic(SplinedConfig),
}

/// Static, tag-derived properties of a lens model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    /// The first four intrinsics are (fx, fy, cx, cy).
    pub has_core: bool,
    /// The model can represent points with negative z (behind the camera).
    pub can_project_behind_camera: bool,
    /// `project` has a hand-derived gradient implementation.
    pub analytic_grad: bool,
}

impl LensModel {
    /// Canonical name, including the `_key=value` configuration suffix for
    /// the two configured variants.
    pub fn name(&self) -> String {
        match self {
            LensModel::Pinhole => "PINHOLE".to_string(),
            LensModel::Stereographic => "STEREOGRAPHIC".to_string(),
            LensModel::LonLat => "LONLAT".to_string(),
            LensModel::LatLon => "LATLON".to_string(),
            LensModel::OpenCv4 => "OPENCV4".to_string(),
            LensModel::OpenCv5 => "OPENCV5".to_string(),
            LensModel::OpenCv8 => "OPENCV8".to_string(),
            LensModel::OpenCv12 => "OPENCV12".to_string(),
            LensModel::Cahvor => "CAHVOR".to_string(),
            LensModel::Cahvore(cfg) => format!("CAHVORE_linearity={}", cfg.linearity),
            LensModel::SplinedStereographic(cfg) => format!(
                "SPLINED_STEREOGRAPHIC_order={}_Nx={}_Ny={}_fov_x_deg={}",
                cfg.order, cfg.nx, cfg.ny, cfg.fov_x_deg
            ),
        }
    }

    /// Parse a canonical name (with configuration suffix where required).
    ///
    /// A bare tag that is missing its required configuration (e.g.
    /// `"CAHVORE"` with no `_linearity=...`) is rejected: [`Error::BadLensModelConfig`],
    /// not silently defaulted.
    pub fn parse(name: &str) -> Result<Self> {
        if let Some(rest) = name.strip_prefix("CAHVORE") {
            let linearity = parse_kv_f64(rest, "linearity")
                .ok_or_else(|| Error::BadLensModelConfig(name.to_string()))?;
            return Ok(LensModel::Cahvore(CahvoreConfig { linearity }));
        }
        if let Some(rest) = name.strip_prefix("SPLINED_STEREOGRAPHIC") {
            let order = parse_kv_f64(rest, "order")
                .ok_or_else(|| Error::BadLensModelConfig(name.to_string()))? as u8;
            let nx = parse_kv_f64(rest, "Nx")
                .ok_or_else(|| Error::BadLensModelConfig(name.to_string()))? as usize;
            let ny = parse_kv_f64(rest, "Ny")
                .ok_or_else(|| Error::BadLensModelConfig(name.to_string()))? as usize;
            let fov_x_deg = parse_kv_f64(rest, "fov_x_deg")
                .ok_or_else(|| Error::BadLensModelConfig(name.to_string()))?;
            let cfg = SplinedConfig {
                order,
                nx,
                ny,
                fov_x_deg,
            };
            cfg.validate()?;
            return Ok(LensModel::SplinedStereographic(cfg));
        }
        match name {
            "PINHOLE" => Ok(LensModel::Pinhole),
            "STEREOGRAPHIC" => Ok(LensModel::Stereographic),
            "LONLAT" => Ok(LensModel::LonLat),
            "LATLON" => Ok(LensModel::LatLon),
            "OPENCV4" => Ok(LensModel::OpenCv4),
            "OPENCV5" => Ok(LensModel::OpenCv5),
            "OPENCV8" => Ok(LensModel::OpenCv8),
            "OPENCV12" => Ok(LensModel::OpenCv12),
            "CAHVOR" => Ok(LensModel::Cahvor),
            _ => Err(Error::UnknownLensModel(name.to_string())),
        }
    }

    pub fn info(&self) -> ModelInfo {
        match self {
            LensModel::Pinhole | LensModel::OpenCv4 | LensModel::OpenCv5 | LensModel::OpenCv8
            | LensModel::OpenCv12 | LensModel::Cahvor => ModelInfo {
                has_core: true,
                can_project_behind_camera: false,
                analytic_grad: true,
            },
            LensModel::Stereographic | LensModel::LonLat | LensModel::LatLon => ModelInfo {
                has_core: true,
                can_project_behind_camera: true,
                analytic_grad: true,
            },
            LensModel::SplinedStereographic(_) => ModelInfo {
                has_core: true,
                can_project_behind_camera: true,
                analytic_grad: true,
            },
            LensModel::Cahvore(_) => ModelInfo {
                has_core: true,
                can_project_behind_camera: false,
                analytic_grad: false,
            },
        }
    }

    /// Total length of the intrinsics vector for this model (core + distortion).
    pub fn num_intrinsics_params(&self) -> usize {
        match self {
            LensModel::Pinhole | LensModel::Stereographic | LensModel::LonLat
            | LensModel::LatLon => 4,
            LensModel::OpenCv4 => 8,
            LensModel::OpenCv5 => 9,
            LensModel::OpenCv8 => 12,
            LensModel::OpenCv12 => 16,
            LensModel::Cahvor => 9,
            LensModel::Cahvore(_) => 12,
            LensModel::SplinedStereographic(cfg) => 4 + 2 * cfg.nx * cfg.ny,
        }
    }

    pub fn num_distortion_params(&self) -> usize {
        self.num_intrinsics_params() - if self.info().has_core { 4 } else { 0 }
    }
}

fn parse_kv_f64(suffix: &str, key: &str) -> Option<f64> {
    for part in suffix.split('_') {
        if let Some(v) = part.strip_prefix(&format!("{key}=")) {
            return v.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinhole_roundtrips() {
        let m = LensModel::Pinhole;
        assert_eq!(LensModel::parse(&m.name()).unwrap(), m);
        assert_eq!(m.num_intrinsics_params(), 4);
        assert!(m.info().analytic_grad);
        assert!(!m.info().can_project_behind_camera);
    }

    #[test]
    fn cahvore_roundtrips_with_config() {
        let m = LensModel::Cahvore(CahvoreConfig { linearity: 0.5 });
        let name = m.name();
        assert_eq!(name, "CAHVORE_linearity=0.5");
        assert_eq!(LensModel::parse(&name).unwrap(), m);
        assert!(!m.info().analytic_grad);
    }

    #[test]
    fn cahvore_bare_name_is_an_error() {
        assert!(LensModel::parse("CAHVORE").is_err());
    }

    #[test]
    fn splined_roundtrips_and_counts_params() {
        let cfg = SplinedConfig {
            order: 3,
            nx: 11,
            ny: 11,
            fov_x_deg: 100.0,
        };
        let m = LensModel::SplinedStereographic(cfg);
        assert_eq!(LensModel::parse(&m.name()).unwrap(), m);
        assert_eq!(m.num_intrinsics_params(), 4 + 2 * 11 * 11);
        assert_eq!(m.num_distortion_params(), 2 * 11 * 11);
    }

    #[test]
    fn unknown_model_is_an_error() {
        assert!(LensModel::parse("NOT_A_MODEL").is_err());
    }
}
