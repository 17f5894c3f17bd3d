//! Unit scaling and room calibration from source coordinates into bridge
//! coordinates.

use crate::pose::{self, IDENTITY};
use crate::types::{BodyType, Matrix3, Pose, RawAddress, RawPose};

/// Rigid calibration of one source: `p' = Rc * (s * p + offset)`, `R' = Rc * R`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSpec {
    /// Unit scale from source units into bridge units.
    pub scale: f64,
    /// Translation added after scaling, in bridge units.
    pub offset: [f64; 3],
    /// Room rotation applied to position and orientation.
    pub rotation: Matrix3,
}

impl CalibrationSpec {
    pub fn identity() -> CalibrationSpec {
        CalibrationSpec::scaled(1.0)
    }

    pub fn scaled(scale: f64) -> CalibrationSpec {
        CalibrationSpec {
            scale,
            offset: [0.0; 3],
            rotation: IDENTITY,
        }
    }

    /// Heading/pitch/roll in degrees plus an offset.
    pub fn from_hpr(scale: f64, hpr: [f64; 3], offset: [f64; 3]) -> CalibrationSpec {
        CalibrationSpec {
            scale,
            offset,
            rotation: pose::hpr_rotation(hpr[0], hpr[1], hpr[2]),
        }
    }

    /// Parse `"h p r x y z"`. Missing trailing values default to 0.
    pub fn parse_hpr_xyz(scale: f64, text: &str) -> Option<CalibrationSpec> {
        let mut values = [0.0f64; 6];
        let mut count = 0;
        for token in text.split(|c: char| c.is_whitespace() || c == ',').filter(|t| !t.is_empty()) {
            if count == values.len() {
                return None;
            }
            values[count] = token.parse().ok()?;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        Some(CalibrationSpec::from_hpr(
            scale,
            [values[0], values[1], values[2]],
            [values[3], values[4], values[5]],
        ))
    }
}

impl Default for CalibrationSpec {
    fn default() -> Self {
        CalibrationSpec::identity()
    }
}

/// Map a raw pose into bridge coordinates. Pure: same input, same output.
pub fn calibrate(spec: &CalibrationSpec, raw: &RawPose) -> Pose {
    let rotation = pose::rotation_matrix(&raw.rotation);
    let scaled = [
        spec.scale * raw.position[0] + spec.offset[0],
        spec.scale * raw.position[1] + spec.offset[1],
        spec.scale * raw.position[2] + spec.offset[2],
    ];
    Pose {
        translation: pose::mat_vec(&spec.rotation, &scaled),
        rotation: pose::mat_mul(&spec.rotation, &rotation),
    }
}

/// Calibration for every source of one device connection.
///
/// DTrack can carry separate calibrations for standard bodies and
/// flysticks; other families use the device-wide one.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceCalibration {
    pub default: CalibrationSpec,
    pub standard: Option<CalibrationSpec>,
    pub flystick: Option<CalibrationSpec>,
}

impl DeviceCalibration {
    pub fn uniform(spec: CalibrationSpec) -> DeviceCalibration {
        DeviceCalibration {
            default: spec,
            standard: None,
            flystick: None,
        }
    }

    pub fn set_body(&mut self, body: BodyType, spec: CalibrationSpec) {
        match body {
            BodyType::Standard => self.standard = Some(spec),
            BodyType::Flystick => self.flystick = Some(spec),
        }
    }

    pub fn for_address(&self, address: &RawAddress) -> &CalibrationSpec {
        let specific = match address {
            RawAddress::Dtrack {
                body: BodyType::Standard,
                ..
            } => self.standard.as_ref(),
            RawAddress::Dtrack {
                body: BodyType::Flystick,
                ..
            } => self.flystick.as_ref(),
            _ => None,
        };
        specific.unwrap_or(&self.default)
    }

    pub fn apply(&self, address: &RawAddress, raw: &RawPose) -> Pose {
        calibrate(self.for_address(address), raw)
    }
}
