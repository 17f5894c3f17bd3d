//! Rotation and rigid-transform helpers shared by calibration and the
//! simulated sensor.

use crate::types::{Axis, Matrix3, Pose, RawRotation};

pub const IDENTITY: Matrix3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Convert quaternion [w, x, y, z] to a 3x3 rotation matrix (row-major).
pub fn quaternion_to_rotation(w: f64, x: f64, y: f64, z: f64) -> Matrix3 {
    [
        [1.0 - 2.0*(y*y + z*z), 2.0*(x*y - z*w),       2.0*(x*z + y*w)],
        [2.0*(x*y + z*w),       1.0 - 2.0*(x*x + z*z), 2.0*(y*z - x*w)],
        [2.0*(x*z - y*w),       2.0*(y*z + x*w),       1.0 - 2.0*(x*x + y*y)],
    ]
}

/// Convert a rotation matrix to quaternion [qx, qy, qz, qw].
pub fn rotation_to_quaternion(m: &Matrix3) -> [f64; 4] {
    let trace = m[0][0] + m[1][1] + m[2][2];
    if trace > 0.0 {
        let s = (trace + 1.0).sqrt() * 2.0;
        [
            (m[2][1] - m[1][2]) / s,
            (m[0][2] - m[2][0]) / s,
            (m[1][0] - m[0][1]) / s,
            0.25 * s,
        ]
    } else if m[0][0] > m[1][1] && m[0][0] > m[2][2] {
        let s = (1.0 + m[0][0] - m[1][1] - m[2][2]).sqrt() * 2.0;
        [
            0.25 * s,
            (m[0][1] + m[1][0]) / s,
            (m[0][2] + m[2][0]) / s,
            (m[2][1] - m[1][2]) / s,
        ]
    } else if m[1][1] > m[2][2] {
        let s = (1.0 + m[1][1] - m[0][0] - m[2][2]).sqrt() * 2.0;
        [
            (m[0][1] + m[1][0]) / s,
            0.25 * s,
            (m[1][2] + m[2][1]) / s,
            (m[0][2] - m[2][0]) / s,
        ]
    } else {
        let s = (1.0 + m[2][2] - m[0][0] - m[1][1]).sqrt() * 2.0;
        [
            (m[0][2] + m[2][0]) / s,
            (m[1][2] + m[2][1]) / s,
            0.25 * s,
            (m[1][0] - m[0][1]) / s,
        ]
    }
}

/// Convert a 3x3 rotation matrix to Euler angles [roll, pitch, yaw] in degrees.
pub fn rotation_to_euler(m: &Matrix3) -> [f64; 3] {
    let pitch = (-m[2][0]).clamp(-1.0, 1.0).asin();
    let (roll, yaw) = if pitch.cos().abs() > 1e-6 {
        let roll = m[2][1].atan2(m[2][2]);
        let yaw = m[1][0].atan2(m[0][0]);
        (roll, yaw)
    } else {
        let roll = m[0][1].atan2(m[1][1]);
        (roll, 0.0)
    };
    [roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees()]
}

/// Heading/pitch/roll rotation in degrees, heading about Z, pitch about X,
/// roll about Y.
pub fn hpr_rotation(heading: f64, pitch: f64, roll: f64) -> Matrix3 {
    let (sh, ch) = heading.to_radians().sin_cos();
    let (sp, cp) = pitch.to_radians().sin_cos();
    let (sr, cr) = roll.to_radians().sin_cos();
    [
        [ch*cr - sh*sp*sr, -sh*cp, ch*sr + sh*sp*cr],
        [sh*cr + ch*sp*sr,  ch*cp, sh*sr - ch*sp*cr],
        [-cp*sr,            sp,    cp*cr],
    ]
}

/// Right-handed rotation about a principal axis, angle in degrees.
pub fn axis_rotation(axis: Axis, degrees: f64) -> Matrix3 {
    let (s, c) = degrees.to_radians().sin_cos();
    match axis {
        Axis::X => [[1.0, 0.0, 0.0], [0.0, c, -s], [0.0, s, c]],
        Axis::Y => [[c, 0.0, s], [0.0, 1.0, 0.0], [-s, 0.0, c]],
        Axis::Z => [[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]],
    }
}

pub fn mat_mul(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut out = [[0.0; 3]; 3];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, cell) in row.iter_mut().enumerate() {
            *cell = a[r][0] * b[0][c] + a[r][1] * b[1][c] + a[r][2] * b[2][c];
        }
    }
    out
}

pub fn mat_vec(m: &Matrix3, v: &[f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

pub fn transpose(m: &Matrix3) -> Matrix3 {
    [
        [m[0][0], m[1][0], m[2][0]],
        [m[0][1], m[1][1], m[2][1]],
        [m[0][2], m[1][2], m[2][2]],
    ]
}

/// Resolve a wire rotation into a matrix.
pub fn rotation_matrix(rotation: &RawRotation) -> Matrix3 {
    match *rotation {
        RawRotation::Matrix(m) => m,
        RawRotation::Quaternion([x, y, z, w]) => quaternion_to_rotation(w, x, y, z),
    }
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        translation: [0.0; 3],
        rotation: IDENTITY,
    };

    /// `self * other`: apply `other` expressed in this pose's frame.
    pub fn compose(&self, other: &Pose) -> Pose {
        let moved = mat_vec(&self.rotation, &other.translation);
        Pose {
            translation: [
                self.translation[0] + moved[0],
                self.translation[1] + moved[1],
                self.translation[2] + moved[2],
            ],
            rotation: mat_mul(&self.rotation, &other.rotation),
        }
    }

    /// Translate along world axes.
    pub fn pre_translate(&mut self, delta: [f64; 3]) {
        for (t, d) in self.translation.iter_mut().zip(delta) {
            *t += d;
        }
    }

    /// Translate along the pose's own axes.
    pub fn post_translate(&mut self, delta: [f64; 3]) {
        let moved = mat_vec(&self.rotation, &delta);
        self.pre_translate(moved);
    }

    /// Rotate about a world axis through the pose's origin.
    pub fn pre_rotate_in_place(&mut self, axis: Axis, degrees: f64) {
        self.rotation = mat_mul(&axis_rotation(axis, degrees), &self.rotation);
    }

    /// Rotate about one of the pose's own axes.
    pub fn post_rotate(&mut self, axis: Axis, degrees: f64) {
        self.rotation = mat_mul(&self.rotation, &axis_rotation(axis, degrees));
    }

    /// Orientation as quaternion [qx, qy, qz, qw].
    pub fn quaternion(&self) -> [f64; 4] {
        rotation_to_quaternion(&self.rotation)
    }

    /// Orientation as Euler angles [roll, pitch, yaw] in degrees.
    pub fn euler_deg(&self) -> [f64; 3] {
        rotation_to_euler(&self.rotation)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Pose::IDENTITY
    }
}
