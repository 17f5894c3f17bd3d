use std::fmt;

/// 3x3 row-major rotation matrix.
pub type Matrix3 = [[f64; 3]; 3];

/// Normalized 6DOF pose as seen by the host application.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Translation [x, y, z] in bridge units (feet unless rescaled).
    pub translation: [f64; 3],
    /// 3x3 row-major rotation matrix.
    pub rotation: Matrix3,
}

/// The three tracking server families the bridge can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// ART DTrack optical tracker, line-oriented ASCII over UDP.
    Dtrack,
    /// Vrui VRDeviceDaemon, fixed-layout binary records over TCP.
    Vruidd,
    /// VRPN device server, tagged binary messages over TCP.
    Vrpn,
}

impl Family {
    pub fn from_name(name: &str) -> Option<Family> {
        match name.trim().to_ascii_lowercase().as_str() {
            "dtrack" | "art" => Some(Family::Dtrack),
            "vruidd" | "vrdevicedaemon" => Some(Family::Vruidd),
            "vrpn" => Some(Family::Vrpn),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Family::Dtrack => "dtrack",
            Family::Vruidd => "vruidd",
            Family::Vrpn => "vrpn",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// DTrack tracker types with their own unit arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyType {
    /// Standard 6DOF body (`6d` records).
    Standard,
    /// Flystick2 wand (`6df2` records) carrying buttons and joystick valuators.
    Flystick,
}

impl BodyType {
    pub fn from_name(name: &str) -> Option<BodyType> {
        match name.trim().to_ascii_lowercase().as_str() {
            "6d" | "6body" => Some(BodyType::Standard),
            "6df2" | "fs2" => Some(BodyType::Flystick),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BodyType::Standard => "6d",
            BodyType::Flystick => "fs2",
        }
    }
}

/// Physical origin of a raw update within one device connection.
///
/// Buttons, valuators and trackers use separate index spaces; the update
/// variant carrying the address says which one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawAddress {
    /// DTrack body unit. `channel` is the button bit or controller index
    /// for flystick buttons and valuators, and 0 for poses.
    Dtrack { body: BodyType, unit: u8, channel: u8 },
    /// VRDeviceDaemon tracker, button or valuator index.
    Vruidd { index: u16 },
    /// VRPN sender slot (0 is the local simulator) and channel index.
    Vrpn { sender: u8, index: u8 },
}

impl fmt::Display for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawAddress::Dtrack { body, unit, channel } => {
                write!(f, "{}[{}, {}]", body.name(), unit, channel)
            }
            RawAddress::Vruidd { index } => write!(f, "vruidd[{}]", index),
            RawAddress::Vrpn { sender, index } => write!(f, "vrpn#{}[{}]", sender, index),
        }
    }
}

/// Rotation as delivered on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawRotation {
    /// Row-major 3x3 matrix.
    Matrix(Matrix3),
    /// Quaternion [qx, qy, qz, qw].
    Quaternion([f64; 4]),
}

/// Pose in the source device's units and axis convention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPose {
    pub position: [f64; 3],
    pub rotation: RawRotation,
    /// Tracking quality reported by the source, 1.0 where the protocol has none.
    pub quality: f64,
}

impl RawPose {
    pub fn zeroed() -> RawPose {
        RawPose {
            position: [0.0; 3],
            rotation: RawRotation::Matrix([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]),
            quality: 0.0,
        }
    }
}

/// One decoded value from a physical channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawChannelUpdate {
    Button { address: RawAddress, value: bool },
    Valuator { address: RawAddress, value: f64 },
    Pose { address: RawAddress, pose: RawPose },
}

impl RawChannelUpdate {
    pub fn address(&self) -> RawAddress {
        match self {
            RawChannelUpdate::Button { address, .. }
            | RawChannelUpdate::Valuator { address, .. }
            | RawChannelUpdate::Pose { address, .. } => *address,
        }
    }
}

/// Per-slot tracker state kept by a decoder for the life of a connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceUnit {
    /// Frame counter of the last record that mentioned this unit.
    pub frame: u32,
    /// Source timestamp in seconds of that record.
    pub timestamp: f64,
    pub active: bool,
    pub quality: f64,
    /// Last pose reported for this unit, if any.
    pub latched: Option<RawPose>,
}

impl Default for DeviceUnit {
    fn default() -> Self {
        DeviceUnit {
            frame: 0,
            timestamp: 0.0,
            active: false,
            quality: 0.0,
            latched: None,
        }
    }
}

/// Tracker velocity report from a VRPN server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityReport {
    pub sensor: i32,
    /// Linear velocity [x, y, z] in source units per second.
    pub velocity: [f64; 3],
    /// Angular velocity quaternion [qx, qy, qz, qw].
    pub velocity_quat: [f64; 4],
    /// Trailing field of the velocity body. Its meaning is not documented
    /// by the server, so it is carried through untouched.
    pub trailing: f64,
}

/// Logical input kinds exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Switch,
    Valuator,
    Sensor6,
}

impl InputKind {
    pub fn from_name(name: &str) -> Option<InputKind> {
        match name.trim().to_ascii_lowercase().as_str() {
            "switch" | "2switch" | "button" => Some(InputKind::Switch),
            "valuator" => Some(InputKind::Valuator),
            "6sensor" | "sensor6" => Some(InputKind::Sensor6),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InputKind::Switch => "switch",
            InputKind::Valuator => "valuator",
            InputKind::Sensor6 => "6sensor",
        }
    }
}

bitflags::bitflags! {
    /// Behavior switches of the simulated 6-sensor controller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C)]
    pub struct Sim6Flags: u32 {
        /// Move and turn along the sensor's own axes instead of world axes.
        const RELATIVE_AXIS  = 1 << 0;
        /// Start each update from identity instead of the current pose.
        const RETURN_TO_ZERO = 1 << 1;
        /// Clamp translation to the working volume.
        const RESTRICT_SPACE = 1 << 2;
        /// Skip translation while set.
        const IGNORE_TRANS   = 1 << 3;
        /// Skip all valuator input while set.
        const IGNORE_ALL     = 1 << 4;
        /// Exchange the translation and rotation valuators.
        const SWAP_TRANSROT  = 1 << 5;
        /// Exchange the Y and Z axes.
        const SWAP_YZ        = 1 << 6;
    }
}

impl Default for Sim6Flags {
    fn default() -> Self {
        Sim6Flags::RELATIVE_AXIS | Sim6Flags::RESTRICT_SPACE
    }
}

/// Axis that the simulated sensor's azimuth valuator spins around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Payload of a control action: a button state or a float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlValue {
    Switch(bool),
    Value(f64),
}

impl ControlValue {
    /// Buttons count as pressed when set; floats when non-zero.
    pub fn pressed(&self) -> bool {
        match *self {
            ControlValue::Switch(on) => on,
            ControlValue::Value(v) => v != 0.0,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            ControlValue::Switch(on) => {
                if on {
                    1.0
                } else {
                    0.0
                }
            }
            ControlValue::Value(v) => v,
        }
    }
}
