//! The packed optimizer state: layout, scaling, and the index/size query
//! family used by both the residual assembler and callers inspecting a
//! solution.

use crate::lens::LensModel;

/// Fixed per-variable-type scale factors. The packed state seen by the
/// trust-region solver is `semantic_value / scale`, chosen so every packed
/// variable is a dimensionless O(1) quantity. These are load-bearing
/// constants, not tuning knobs: changing one changes the solver's
/// trajectory.
pub mod scale {
    pub const FOCAL_LENGTH: f64 = 500.0;
    pub const CENTER_PIXEL: f64 = 20.0;
    pub const CAMERA_ROTATION: f64 = 0.1 * std::f64::consts::PI / 180.0;
    pub const CAMERA_TRANSLATION: f64 = 1.0;
    pub const FRAME_ROTATION: f64 = 15.0 * std::f64::consts::PI / 180.0;
    pub const FRAME_TRANSLATION: f64 = 1.0;
    pub const POINT_POSITION: f64 = 1.0;
    pub const CALOBJECT_WARP: f64 = 0.01;
    pub const DISTORTION: f64 = 1.0;
}

/// Which variable classes are included in the packed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeFlags {
    pub intrinsics_core: bool,
    pub intrinsics_distortions: bool,
    pub extrinsics: bool,
    pub frames: bool,
    pub calobject_warp: bool,
    pub regularization: bool,
    pub outlier_rejection: bool,
}

impl Default for OptimizeFlags {
    fn default() -> Self {
        OptimizeFlags {
            intrinsics_core: true,
            intrinsics_distortions: true,
            extrinsics: true,
            frames: true,
            calobject_warp: false,
            regularization: true,
            outlier_rejection: true,
        }
    }
}

/// The static shape of a problem: how many cameras, frames, and points
/// there are, and which lens model each camera uses. This is everything
/// the index/size queries need; it carries no per-iteration data.
#[derive(Debug, Clone)]
pub struct ProblemShape {
    pub lens_models: Vec<LensModel>,
    pub num_cameras_extrinsics: usize,
    pub num_frames: usize,
    pub num_points: usize,
    pub num_points_fixed: usize,
    pub flags: OptimizeFlags,
}

impl ProblemShape {
    pub fn num_cameras_intrinsics(&self) -> usize {
        self.lens_models.len()
    }

    fn intrinsics_block_len(&self, icam: usize) -> usize {
        let m = &self.lens_models[icam];
        let info = m.info();
        let mut n = 0;
        if self.flags.intrinsics_core && info.has_core {
            n += 4;
        }
        if self.flags.intrinsics_distortions {
            n += m.num_distortion_params();
        }
        n
    }

    /// Offset of camera `icam`'s intrinsics block in the packed state, or
    /// `None` if intrinsics are not being optimized for that camera (i.e.
    /// neither core nor distortions are selected).
    pub fn state_index_intrinsics(&self, icam: usize) -> Option<usize> {
        if !self.flags.intrinsics_core && !self.flags.intrinsics_distortions {
            return None;
        }
        let mut offset = 0;
        for i in 0..icam {
            offset += self.intrinsics_block_len(i);
        }
        Some(offset)
    }

    pub fn num_states_intrinsics(&self, icam: usize) -> usize {
        if !self.flags.intrinsics_core && !self.flags.intrinsics_distortions {
            return 0;
        }
        self.intrinsics_block_len(icam)
    }

    fn intrinsics_total(&self) -> usize {
        (0..self.num_cameras_intrinsics())
            .map(|i| self.intrinsics_block_len(i))
            .sum()
    }

    /// `icam_extrinsics == -1` (the reference camera) has no extrinsics
    /// state and is rejected by this query; callers must special-case it.
    pub fn state_index_extrinsics(&self, icam_extrinsics: usize) -> Option<usize> {
        if !self.flags.extrinsics {
            return None;
        }
        Some(self.intrinsics_total() + 6 * icam_extrinsics)
    }

    pub fn num_states_extrinsics(&self) -> usize {
        if self.flags.extrinsics { 6 } else { 0 }
    }

    fn extrinsics_total(&self) -> usize {
        if self.flags.extrinsics {
            6 * self.num_cameras_extrinsics
        } else {
            0
        }
    }

    pub fn state_index_frames(&self, iframe: usize) -> Option<usize> {
        if !self.flags.frames {
            return None;
        }
        Some(self.intrinsics_total() + self.extrinsics_total() + 6 * iframe)
    }

    pub fn num_states_frames(&self) -> usize {
        if self.flags.frames { 6 } else { 0 }
    }

    fn frames_total(&self) -> usize {
        if self.flags.frames {
            6 * self.num_frames
        } else {
            0
        }
    }

    /// Points are only in the state if frames are being optimized (a point
    /// with no frame to anchor it against is meaningless) and the point is
    /// not one of the trailing `num_points_fixed` constants.
    pub fn state_index_points(&self, ipoint: usize) -> Option<usize> {
        if !self.flags.frames || ipoint >= self.num_points - self.num_points_fixed {
            return None;
        }
        Some(
            self.intrinsics_total()
                + self.extrinsics_total()
                + self.frames_total()
                + 3 * ipoint,
        )
    }

    pub fn num_states_points(&self) -> usize {
        if self.flags.frames { 3 } else { 0 }
    }

    fn points_total(&self) -> usize {
        if self.flags.frames {
            3 * (self.num_points - self.num_points_fixed)
        } else {
            0
        }
    }

    pub fn state_index_calobject_warp(&self) -> Option<usize> {
        if !self.flags.calobject_warp {
            return None;
        }
        Some(self.intrinsics_total() + self.extrinsics_total() + self.frames_total() + self.points_total())
    }

    pub fn num_states_calobject_warp(&self) -> usize {
        if self.flags.calobject_warp { 2 } else { 0 }
    }

    pub fn num_states(&self) -> usize {
        self.intrinsics_total()
            + self.extrinsics_total()
            + self.frames_total()
            + self.points_total()
            + self.num_states_calobject_warp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::SplinedConfig;

    #[test]
    fn two_camera_mixed_model_layout() {
        let shape = ProblemShape {
            lens_models: vec![
                LensModel::SplinedStereographic(SplinedConfig {
                    order: 3,
                    nx: 11,
                    ny: 11,
                    fov_x_deg: 100.0,
                }),
                LensModel::Pinhole,
            ],
            num_cameras_extrinsics: 1,
            num_frames: 3,
            num_points: 0,
            num_points_fixed: 0,
            flags: OptimizeFlags {
                intrinsics_core: true,
                intrinsics_distortions: true,
                extrinsics: true,
                frames: true,
                calobject_warp: false,
                regularization: true,
                outlier_rejection: true,
            },
        };
        assert_eq!(shape.num_states_intrinsics(0), 246);
        assert_eq!(shape.num_states_intrinsics(1), 4);
        assert_eq!(shape.intrinsics_total(), 250);
        assert_eq!(shape.state_index_extrinsics(0), Some(250));
        assert_eq!(shape.state_index_frames(0), Some(256));
        assert_eq!(shape.num_states(), 274);
    }
}
