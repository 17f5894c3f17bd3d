//! ART DTrack line-oriented ASCII decoder.
//!
//! A DTrack datagram is a sequence of newline-terminated records:
//!
//! ```text
//! fr 21753
//! ts 39596.024831
//! 6d 1 [0 1.000][326.848 -187.216 1109.503 -160.4704 -3.6963 -7.0913][-0.940508 -0.332545 0.069779 0.339607 -0.925450 0.167860 0.008843 0.181687 0.983317]
//! 6df2 1 1 [0 1.000 6 2][-50.105 31.029 1076.702][0.932 0.119 -0.342 0.029 0.914 0.404 0.360 -0.387 0.849][0 0.000 -0.031]
//! ```
//!
//! Rotation blocks list the matrix column by column: `b0 b1 b2` is the first
//! column.

use crate::decoder::{DecodeSink, Decoder};
use crate::pose;
use crate::types::{BodyType, DeviceUnit, Family, Matrix3, RawAddress, RawChannelUpdate, RawPose, RawRotation};
use std::fmt::Write as _;
use std::str::FromStr;

// -- Network defaults --
pub const DEFAULT_DATA_PORT: u16 = 5000;
pub const DEFAULT_CMD_PORT: u16 = 5001;
pub const DEFAULT_CMD_HOST: &str = "127.0.0.1";
pub const BUFFER_SIZE: usize = 2048;

// -- Unit geometry --
/// Slots per tracker type.
pub const UNITS_PER_TYPE: usize = 5;
pub const MAX_BUTTONS: usize = 32;
pub const MAX_CONTROLLERS: usize = 32;

/// DTrack reports millimetres; the bridge defaults to feet.
pub const SCALE_MM_TO_FEET: f64 = 1.0 / 304.8;

// -- Server commands --
pub const CMD_CAMERAS_ON: &str = "dtrack 10 3";
pub const CMD_START: &str = "dtrack 31";
pub const CMD_STOP: &str = "dtrack 32";

fn command(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

/// Axis convention applied while reading position and rotation fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AxisRemap {
    /// Keep DTrack's native room axes.
    #[default]
    None,
    /// Z-up room into Y-up: wire y lands in -z, wire z lands in y.
    ZUpToYUp,
}

impl AxisRemap {
    pub fn from_name(name: &str) -> Option<AxisRemap> {
        match name.trim().to_ascii_lowercase().as_str() {
            "none" | "native" => Some(AxisRemap::None),
            "zup2yup" | "yup" => Some(AxisRemap::ZUpToYUp),
            _ => None,
        }
    }

    /// Output slot and sign for each wire axis.
    fn slots(&self) -> [(usize, f64); 3] {
        match self {
            AxisRemap::None => [(0, 1.0), (1, 1.0), (2, 1.0)],
            AxisRemap::ZUpToYUp => [(0, 1.0), (2, -1.0), (1, 1.0)],
        }
    }

    pub fn apply_position(&self, wire: [f64; 3]) -> [f64; 3] {
        let mut out = [0.0; 3];
        for (i, (slot, sign)) in self.slots().into_iter().enumerate() {
            out[slot] = sign * wire[i];
        }
        out
    }

    pub fn undo_position(&self, out: [f64; 3]) -> [f64; 3] {
        let mut wire = [0.0; 3];
        for (i, (slot, sign)) in self.slots().into_iter().enumerate() {
            wire[i] = sign * out[slot];
        }
        wire
    }

    pub fn apply_rotation(&self, wire: &Matrix3) -> Matrix3 {
        let mut out = [[0.0; 3]; 3];
        for (row, (slot, sign)) in self.slots().into_iter().enumerate() {
            for col in 0..3 {
                out[slot][col] = sign * wire[row][col];
            }
        }
        out
    }

    pub fn undo_rotation(&self, out: &Matrix3) -> Matrix3 {
        let mut wire = [[0.0; 3]; 3];
        for (row, (slot, sign)) in self.slots().into_iter().enumerate() {
            for col in 0..3 {
                wire[row][col] = sign * out[slot][col];
            }
        }
        wire
    }
}

/// Whitespace-tolerant scanner over one record, in the spirit of `sscanf`.
struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Scanner<'a> {
        Scanner { text, pos: 0 }
    }

    fn skip_ws(&mut self) {
        let rest = &self.text[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn token(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let rest = &self.text[self.pos..];
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '[' || c == ']')
            .unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        self.pos += end;
        Some(&rest[..end])
    }

    fn number<T: FromStr>(&mut self) -> Option<T> {
        let save = self.pos;
        let value = self.token().and_then(|t| t.parse().ok());
        if value.is_none() {
            self.pos = save;
        }
        value
    }

    fn expect(&mut self, c: char) -> Option<()> {
        self.skip_ws();
        if self.text[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            Some(())
        } else {
            None
        }
    }

    fn vector(&mut self, remap: AxisRemap) -> Option<[f64; 3]> {
        let mut wire = [0.0; 3];
        for v in wire.iter_mut() {
            *v = self.number()?;
        }
        Some(remap.apply_position(wire))
    }

    /// Nine values, column by column.
    fn matrix(&mut self, remap: AxisRemap) -> Option<Matrix3> {
        let mut wire = [[0.0; 3]; 3];
        for col in 0..3 {
            for row in wire.iter_mut() {
                row[col] = self.number()?;
            }
        }
        Some(remap.apply_rotation(&wire))
    }
}

/// A standard body entry of a `6d` record.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyEntry {
    pub id: u32,
    pub quality: f64,
    pub position: [f64; 3],
    pub rotation: Matrix3,
}

/// A flystick entry of a `6df2` record.
#[derive(Debug, Clone, PartialEq)]
pub struct FlystickEntry {
    pub id: u32,
    pub quality: f64,
    pub position: [f64; 3],
    pub rotation: Matrix3,
    pub buttons: Vec<bool>,
    pub controllers: Vec<f64>,
}

/// What one flystick entry carried this frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FlystickReading {
    /// Tracked: pose, buttons and controllers are all valid.
    Full(FlystickEntry),
    /// Not seen by the cameras: only buttons and controllers are valid and
    /// the pose fields are zero.
    ButtonsOnly(FlystickEntry),
    /// The entry did not match the grammar.
    NoData,
}

fn parse_body(sc: &mut Scanner, remap: AxisRemap) -> Option<BodyEntry> {
    sc.expect('[')?;
    let id = sc.number()?;
    let quality = sc.number()?;
    sc.expect(']')?;

    sc.expect('[')?;
    let position = sc.vector(remap)?;
    // Euler angles duplicate the matrix.
    for _ in 0..3 {
        sc.number::<f64>()?;
    }
    sc.expect(']')?;

    sc.expect('[')?;
    let rotation = sc.matrix(remap)?;
    sc.expect(']')?;

    Some(BodyEntry {
        id,
        quality,
        position,
        rotation,
    })
}

fn parse_flystick_entry(sc: &mut Scanner, remap: AxisRemap) -> Option<FlystickEntry> {
    sc.expect('[')?;
    let id = sc.number()?;
    let quality = sc.number()?;
    let num_buttons: usize = sc.number()?;
    let num_controllers: usize = sc.number()?;
    sc.expect(']')?;
    if num_buttons > MAX_BUTTONS || num_controllers > MAX_CONTROLLERS {
        log::debug!(
            "Flystick {} claims {} buttons and {} controllers, limit is {}/{}",
            id,
            num_buttons,
            num_controllers,
            MAX_BUTTONS,
            MAX_CONTROLLERS
        );
        return None;
    }

    sc.expect('[')?;
    let position = sc.vector(remap)?;
    sc.expect(']')?;

    sc.expect('[')?;
    let rotation = sc.matrix(remap)?;
    sc.expect(']')?;

    // One button word per 32 buttons, then the controller values.
    sc.expect('[')?;
    let mut buttons = Vec::with_capacity(num_buttons);
    for _ in 0..num_buttons.div_ceil(32) {
        let word: u32 = sc.number()?;
        for bit in 0..32 {
            if buttons.len() < num_buttons {
                buttons.push(word & (1 << bit) != 0);
            }
        }
    }
    let mut controllers = Vec::with_capacity(num_controllers);
    for _ in 0..num_controllers {
        controllers.push(sc.number()?);
    }
    sc.expect(']')?;

    Some(FlystickEntry {
        id,
        quality,
        position,
        rotation,
        buttons,
        controllers,
    })
}

/// Parse one flystick entry and classify it by its quality value.
pub fn parse_flystick(text: &str, remap: AxisRemap) -> FlystickReading {
    classify(parse_flystick_entry(&mut Scanner::new(text), remap))
}

fn classify(entry: Option<FlystickEntry>) -> FlystickReading {
    match entry {
        Some(entry) if entry.quality > 0.0 => FlystickReading::Full(entry),
        Some(mut entry) => {
            entry.position = [0.0; 3];
            FlystickReading::ButtonsOnly(entry)
        }
        None => FlystickReading::NoData,
    }
}

/// Decoder for the DTrack ASCII output stream.
pub struct DtrackDecoder {
    remap: AxisRemap,
    send_commands: bool,
    frame: u32,
    timestamp: f64,
    bodies: [DeviceUnit; UNITS_PER_TYPE],
    flysticks: [DeviceUnit; UNITS_PER_TYPE],
    records: u64,
    skipped: u64,
}

impl DtrackDecoder {
    pub fn new(remap: AxisRemap, send_commands: bool) -> DtrackDecoder {
        DtrackDecoder {
            remap,
            send_commands,
            frame: 0,
            timestamp: 0.0,
            bodies: [DeviceUnit::default(); UNITS_PER_TYPE],
            flysticks: [DeviceUnit::default(); UNITS_PER_TYPE],
            records: 0,
            skipped: 0,
        }
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    fn units(&self, body: BodyType) -> &[DeviceUnit; UNITS_PER_TYPE] {
        match body {
            BodyType::Standard => &self.bodies,
            BodyType::Flystick => &self.flysticks,
        }
    }

    fn units_mut(&mut self, body: BodyType) -> &mut [DeviceUnit; UNITS_PER_TYPE] {
        match body {
            BodyType::Standard => &mut self.bodies,
            BodyType::Flystick => &mut self.flysticks,
        }
    }

    /// Update a unit slot for this frame. Returns None for ids out of range.
    fn touch(&mut self, body: BodyType, id: u32, quality: f64, active: bool) -> Option<&mut DeviceUnit> {
        let (frame, timestamp) = (self.frame, self.timestamp);
        let Some(unit) = self.units_mut(body).get_mut(id as usize) else {
            log::debug!("Ignoring {} unit {} (maximum {})", body.name(), id, UNITS_PER_TYPE - 1);
            return None;
        };
        if unit.active && unit.frame == frame && frame != 0 {
            log::warn!("Duplicate {} unit {} in frame {}", body.name(), id, frame);
        }
        unit.frame = frame;
        unit.timestamp = timestamp;
        unit.active = active;
        unit.quality = quality;
        Some(unit)
    }

    fn decode_bodies(&mut self, sc: &mut Scanner, sink: &mut DecodeSink) -> bool {
        for unit in self.bodies.iter_mut() {
            unit.active = false;
        }
        let Some(count) = sc.number::<u32>() else {
            return false;
        };
        for _ in 0..count {
            let Some(entry) = parse_body(sc, self.remap) else {
                log::debug!("Malformed 6d entry in frame {}", self.frame);
                return false;
            };
            let pose = RawPose {
                position: entry.position,
                rotation: RawRotation::Matrix(entry.rotation),
                quality: entry.quality,
            };
            if let Some(unit) = self.touch(BodyType::Standard, entry.id, entry.quality, true) {
                unit.latched = Some(pose);
                sink.updates.push(RawChannelUpdate::Pose {
                    address: RawAddress::Dtrack {
                        body: BodyType::Standard,
                        unit: entry.id as u8,
                        channel: 0,
                    },
                    pose,
                });
            }
        }
        true
    }

    fn decode_flysticks(&mut self, sc: &mut Scanner, sink: &mut DecodeSink) -> bool {
        for unit in self.flysticks.iter_mut() {
            unit.active = false;
        }
        let (Some(_exist), Some(count)) = (sc.number::<u32>(), sc.number::<u32>()) else {
            return false;
        };
        for _ in 0..count {
            let (entry, tracked) = match classify(parse_flystick_entry(sc, self.remap)) {
                FlystickReading::Full(entry) => (entry, true),
                FlystickReading::ButtonsOnly(entry) => (entry, false),
                FlystickReading::NoData => {
                    log::debug!("Malformed 6df2 entry in frame {}", self.frame);
                    return false;
                }
            };
            let id = entry.id;
            let pose = if tracked {
                RawPose {
                    position: entry.position,
                    rotation: RawRotation::Matrix(entry.rotation),
                    quality: entry.quality,
                }
            } else {
                RawPose {
                    quality: entry.quality,
                    ..RawPose::zeroed()
                }
            };
            let Some(unit) = self.touch(BodyType::Flystick, id, entry.quality, tracked) else {
                continue;
            };
            unit.latched = Some(pose);

            let address = |channel: usize| RawAddress::Dtrack {
                body: BodyType::Flystick,
                unit: id as u8,
                channel: channel as u8,
            };
            if tracked {
                sink.updates.push(RawChannelUpdate::Pose {
                    address: address(0),
                    pose,
                });
            }
            for (bit, &value) in entry.buttons.iter().take(MAX_BUTTONS).enumerate() {
                sink.updates.push(RawChannelUpdate::Button {
                    address: address(bit),
                    value,
                });
            }
            for (idx, &value) in entry.controllers.iter().take(MAX_CONTROLLERS).enumerate() {
                sink.updates.push(RawChannelUpdate::Valuator {
                    address: address(idx),
                    value,
                });
            }
        }
        true
    }

    fn decode_record(&mut self, line: &str, sink: &mut DecodeSink) {
        let mut sc = Scanner::new(line);
        let Some(tag) = sc.token() else {
            return;
        };
        let ok = match tag {
            "fr" => sc.number().map(|n| self.frame = n).is_some(),
            "ts" => sc.number().map(|t| self.timestamp = t).is_some(),
            "6d" => self.decode_bodies(&mut sc, sink),
            "6df2" => self.decode_flysticks(&mut sc, sink),
            "6dcal" | "6df" | "3d" | "6dmt" | "gl" | "glcal" => {
                log::trace!("Unhandled DTrack record type '{}'", tag);
                true
            }
            _ => {
                log::debug!("Unknown DTrack record '{}'", tag);
                false
            }
        };
        if ok {
            self.records += 1;
        } else {
            self.skipped += 1;
        }
    }
}

impl Decoder for DtrackDecoder {
    fn family(&self) -> Family {
        Family::Dtrack
    }

    fn open_request(&mut self) -> Vec<Vec<u8>> {
        if self.send_commands {
            vec![command(CMD_CAMERAS_ON), command(CMD_START)]
        } else {
            Vec::new()
        }
    }

    fn decode(&mut self, input: &[u8], sink: &mut DecodeSink) -> usize {
        let mut consumed = 0;
        while let Some(nl) = input[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &input[consumed..consumed + nl];
            consumed += nl + 1;
            match std::str::from_utf8(raw) {
                Ok(line) => {
                    let line = line.trim_end_matches(['\r', '\0']);
                    if !line.is_empty() {
                        self.decode_record(line, sink);
                    }
                }
                Err(_) => {
                    log::debug!("Skipping non-ASCII DTrack record ({} bytes)", raw.len());
                    self.skipped += 1;
                }
            }
        }
        consumed
    }

    fn close_request(&mut self) -> Vec<Vec<u8>> {
        if self.send_commands {
            vec![command(CMD_STOP)]
        } else {
            Vec::new()
        }
    }

    fn reset(&mut self) {
        self.frame = 0;
        self.timestamp = 0.0;
        self.bodies = [DeviceUnit::default(); UNITS_PER_TYPE];
        self.flysticks = [DeviceUnit::default(); UNITS_PER_TYPE];
    }

    fn unit(&self, address: &RawAddress) -> Option<&DeviceUnit> {
        match address {
            RawAddress::Dtrack { body, unit, .. } => self.units(*body).get(*unit as usize),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "DTrack: frame {} ts {:.6} remap {:?} records {} skipped {}",
            self.frame, self.timestamp, self.remap, self.records, self.skipped
        );
        for body in [BodyType::Standard, BodyType::Flystick] {
            for (id, unit) in self.units(body).iter().enumerate() {
                if let Some(pose) = unit.latched {
                    let _ = writeln!(
                        out,
                        "  {}[{}] active={} q={:.3} frame={} pos=[{:.3}, {:.3}, {:.3}]",
                        body.name(),
                        id,
                        unit.active,
                        unit.quality,
                        unit.frame,
                        pose.position[0],
                        pose.position[1],
                        pose.position[2]
                    );
                }
            }
        }
        out
    }
}

/// Builds DTrack output text, used by the simulator demo and tests.
pub struct RecordWriter {
    remap: AxisRemap,
    text: String,
}

impl RecordWriter {
    pub fn new(remap: AxisRemap) -> RecordWriter {
        RecordWriter {
            remap,
            text: String::new(),
        }
    }

    pub fn frame(&mut self, frame: u32) -> &mut Self {
        let _ = writeln!(self.text, "fr {}", frame);
        self
    }

    pub fn timestamp(&mut self, ts: f64) -> &mut Self {
        let _ = writeln!(self.text, "ts {:.6}", ts);
        self
    }

    fn write_vector(&mut self, v: [f64; 3]) {
        let w = self.remap.undo_position(v);
        let _ = write!(self.text, "{:.3} {:.3} {:.3}", w[0], w[1], w[2]);
    }

    fn write_matrix(&mut self, m: &Matrix3) {
        let w = self.remap.undo_rotation(m);
        let cells: Vec<String> = (0..9).map(|i| format!("{:.6}", w[i % 3][i / 3])).collect();
        let _ = write!(self.text, "[{}]", cells.join(" "));
    }

    pub fn bodies(&mut self, bodies: &[BodyEntry]) -> &mut Self {
        let _ = write!(self.text, "6d {}", bodies.len());
        for b in bodies {
            let _ = write!(self.text, " [{} {:.3}][", b.id, b.quality);
            self.write_vector(b.position);
            let euler = pose::rotation_to_euler(&self.remap.undo_rotation(&b.rotation));
            let _ = write!(self.text, " {:.4} {:.4} {:.4}]", euler[0], euler[1], euler[2]);
            self.write_matrix(&b.rotation);
        }
        self.text.push('\n');
        self
    }

    pub fn flysticks(&mut self, sticks: &[FlystickEntry]) -> &mut Self {
        let _ = write!(self.text, "6df2 {} {}", sticks.len(), sticks.len());
        for s in sticks {
            let _ = write!(
                self.text,
                " [{} {:.3} {} {}][",
                s.id,
                s.quality,
                s.buttons.len(),
                s.controllers.len()
            );
            self.write_vector(s.position);
            self.text.push(']');
            self.write_matrix(&s.rotation);
            self.text.push('[');
            let words: Vec<String> = s
                .buttons
                .chunks(32)
                .map(|bits| {
                    bits.iter()
                        .enumerate()
                        .fold(0u32, |acc, (i, &b)| if b { acc | (1 << i) } else { acc })
                        .to_string()
                })
                .collect();
            let controllers: Vec<String> = s.controllers.iter().map(|c| format!("{:.3}", c)).collect();
            let fields: Vec<String> = words.into_iter().chain(controllers).collect();
            let _ = write!(self.text, "{}]", fields.join(" "));
        }
        self.text.push('\n');
        self
    }

    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.text)
    }
}
