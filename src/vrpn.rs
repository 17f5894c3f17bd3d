//! VRPN device server decoder.
//!
//! Every message starts with a 24-byte big-endian header:
//!
//! - `[0..4]`: total size (header plus unpadded body)
//! - `[4..8]`, `[8..12]`: timestamp seconds and microseconds
//! - `[12..16]`: sender code
//! - `[16..20]`: message type (negative for connection metadata)
//! - `[20..24]`: padding
//!
//! Messages are padded to 8 bytes. Positive message types only gain meaning
//! once the server has announced their name with a type description.

use crate::decoder::{DecodeSink, Decoder};
use crate::types::{
    DeviceUnit, Family, RawAddress, RawChannelUpdate, RawPose, RawRotation, VelocityReport,
};
use crate::wire::{Endian, Reader};
use std::fmt::Write as _;

// -- Network defaults --
pub const DEFAULT_PORT: u16 = 3883;
pub const DEFAULT_HOST: &str = "localhost";
pub const BUFFER_SIZE: usize = 2048;

/// Servers report meters; the bridge defaults to feet.
pub const SCALE_METERS_TO_FEET: f64 = 3.28084;

// -- Handshake --
pub const COOKIE_SIZE: usize = 24;
pub const COOKIE_MAGIC: &str = "vrpn: ver. ";
pub const CLIENT_COOKIE: &str = "vrpn: ver. 07.28  0";

// -- Framing --
pub const HEADER_SIZE: usize = 24;

// -- Metadata message types --
pub const SENDER_DESCRIPTION: i32 = -1;
pub const TYPE_DESCRIPTION: i32 = -2;
pub const UDP_DESCRIPTION: i32 = -3;
pub const LOG_DESCRIPTION: i32 = -4;
pub const DISCONNECT_MESSAGE: i32 = -5;

// -- Announced type names --
pub const TYPE_POS_QUAT: &str = "vrpn_Tracker Pos_Quat";
pub const TYPE_VELOCITY: &str = "vrpn_Tracker Velocity";
pub const TYPE_ACCELERATION: &str = "vrpn_Tracker Acceleration";
pub const TYPE_BUTTON: &str = "vrpn_Button Change";
pub const TYPE_ANALOG: &str = "vrpn_Analog Channel";

// -- Limits --
/// Sender slots, including slot 0 for the local simulator.
pub const MAX_DEVICES: usize = 8;
pub const MAX_CODES: usize = 128;
pub const MAX_BUTTONS: usize = 16;
pub const MAX_ANALOGS: usize = 16;
pub const MAX_TRACKERS: usize = 16;

/// Name reserved for sender slot 0.
pub const SIMULATOR_NAME: &str = "simulator";

/// Round a message size up to the 8-byte wire alignment.
pub fn padded(size: usize) -> usize {
    (size + 7) & !7
}

/// The 24-byte, NUL-padded cookie the client sends on connect.
pub fn client_cookie() -> Vec<u8> {
    let mut cookie = CLIENT_COOKIE.as_bytes().to_vec();
    cookie.resize(COOKIE_SIZE, 0);
    cookie
}

/// Parse `"vrpn: ver. MM.mm"` out of a server cookie.
pub fn parse_cookie(cookie: &[u8]) -> Option<(u32, u32)> {
    let end = cookie.iter().position(|&b| b == 0).unwrap_or(cookie.len());
    let text = std::str::from_utf8(&cookie[..end]).ok()?;
    let version = text.strip_prefix(COOKIE_MAGIC)?;
    let version = version.split_whitespace().next()?;
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub size: u32,
    pub sec: u32,
    pub usec: u32,
    pub sender: i32,
    pub kind: i32,
}

impl Header {
    pub fn read(r: &mut Reader) -> Option<Header> {
        let header = Header {
            size: r.u32()?,
            sec: r.u32()?,
            usec: r.u32()?,
            sender: r.i32()?,
            kind: r.i32()?,
        };
        r.skip(4)?;
        Some(header)
    }

    pub fn timestamp(&self) -> f64 {
        self.sec as f64 + self.usec as f64 * 1e-6
    }

    /// Bytes the message occupies on the wire, never less than the header.
    pub fn wire_size(&self) -> usize {
        padded((self.size as usize).max(HEADER_SIZE))
    }
}

/// Meaning assigned to an announced message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Known {
    PosQuat,
    Velocity,
    Acceleration,
    Button,
    Analog,
}

impl Known {
    fn from_name(name: &str) -> Option<Known> {
        match name {
            TYPE_POS_QUAT => Some(Known::PosQuat),
            TYPE_VELOCITY => Some(Known::Velocity),
            TYPE_ACCELERATION => Some(Known::Acceleration),
            TYPE_BUTTON => Some(Known::Button),
            TYPE_ANALOG => Some(Known::Analog),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingCookie,
    Streaming,
}

/// Decoder for the VRPN TCP message stream.
pub struct VrpnDecoder {
    phase: Phase,
    server_version: Option<(u32, u32)>,
    senders: [Option<String>; MAX_DEVICES],
    codes: Vec<Option<String>>,
    known: Vec<Option<Known>>,
    biggest_code: i32,
    trackers: Vec<[DeviceUnit; MAX_TRACKERS]>,
    messages: u64,
}

impl VrpnDecoder {
    pub fn new() -> VrpnDecoder {
        let mut senders: [Option<String>; MAX_DEVICES] = Default::default();
        senders[0] = Some(SIMULATOR_NAME.to_string());
        VrpnDecoder {
            phase: Phase::AwaitingCookie,
            server_version: None,
            senders,
            codes: vec![None; MAX_CODES],
            known: vec![None; MAX_CODES],
            biggest_code: -1,
            trackers: vec![[DeviceUnit::default(); MAX_TRACKERS]; MAX_DEVICES],
            messages: 0,
        }
    }

    pub fn server_version(&self) -> Option<(u32, u32)> {
        self.server_version
    }

    /// Announced name of a sender slot.
    pub fn sender_name(&self, slot: u8) -> Option<&str> {
        self.senders.get(slot as usize)?.as_deref()
    }

    /// Announced name of a message type code.
    pub fn type_name(&self, code: i32) -> Option<&str> {
        let index = usize::try_from(code).ok()?;
        self.codes.get(index)?.as_deref()
    }

    fn known(&self, kind: i32) -> Option<Known> {
        let index = usize::try_from(kind).ok()?;
        self.known.get(index).copied().flatten()
    }

    /// Sender slot for a header sender code. Slot 0 belongs to the simulator.
    fn slot(sender: i32) -> Option<u8> {
        let slot = usize::try_from(sender).ok()? + 1;
        (slot < MAX_DEVICES).then_some(slot as u8)
    }

    fn describe_sender(&mut self, header: &Header, body: &mut Reader, sink: &mut DecodeSink) {
        let Some(name) = body.string() else {
            log::debug!("Truncated VRPN sender description");
            return;
        };
        match VrpnDecoder::slot(header.sender) {
            Some(slot) => {
                log::info!("VRPN sender {} is '{}'", header.sender, name);
                self.senders[slot as usize] = Some(name);
                sink.names_changed = true;
            }
            None => log::warn!(
                "VRPN sender code {} exceeds the {} device limit, ignoring '{}'",
                header.sender,
                MAX_DEVICES - 1,
                name
            ),
        }
    }

    fn describe_type(&mut self, header: &Header, body: &mut Reader) {
        let Some(name) = body.string() else {
            log::debug!("Truncated VRPN type description");
            return;
        };
        let code = header.sender;
        let Some(index) = usize::try_from(code).ok().filter(|&i| i < MAX_CODES) else {
            log::warn!("VRPN type code {} out of range, ignoring '{}'", code, name);
            return;
        };
        if code > self.biggest_code {
            self.biggest_code = code;
        } else {
            log::warn!("Duplicate VRPN message code {} ('{}')", code, name);
        }
        let known = Known::from_name(&name);
        log::debug!("VRPN type {} is '{}' ({:?})", code, name, known);
        self.known[index] = known;
        self.codes[index] = Some(name);
    }

    fn pos_quat(&mut self, header: &Header, slot: u8, body: &mut Reader, sink: &mut DecodeSink) {
        let Some((sensor, v)) = read_sensor_doubles::<7>(body) else {
            log::debug!("Truncated VRPN position report");
            return;
        };
        let Some(index) = usize::try_from(sensor).ok().filter(|&i| i < MAX_TRACKERS) else {
            log::debug!("VRPN tracker {} exceeds the {} tracker limit", sensor, MAX_TRACKERS);
            return;
        };
        let pose = RawPose {
            position: [v[0], v[1], v[2]],
            rotation: RawRotation::Quaternion([v[3], v[4], v[5], v[6]]),
            quality: 1.0,
        };
        let unit = &mut self.trackers[slot as usize][index];
        unit.frame = unit.frame.wrapping_add(1);
        unit.timestamp = header.timestamp();
        unit.active = true;
        unit.quality = 1.0;
        unit.latched = Some(pose);
        sink.updates.push(RawChannelUpdate::Pose {
            address: RawAddress::Vrpn {
                sender: slot,
                index: index as u8,
            },
            pose,
        });
    }

    fn button(&mut self, slot: u8, body: &mut Reader, sink: &mut DecodeSink) {
        let (Some(button), Some(state)) = (body.u32(), body.u32()) else {
            log::debug!("Truncated VRPN button report");
            return;
        };
        if button as usize >= MAX_BUTTONS {
            log::debug!("VRPN button {} exceeds the {} button limit", button, MAX_BUTTONS);
            return;
        }
        sink.updates.push(RawChannelUpdate::Button {
            address: RawAddress::Vrpn {
                sender: slot,
                index: button as u8,
            },
            value: state != 0,
        });
    }

    fn analog(&mut self, slot: u8, body: &mut Reader, sink: &mut DecodeSink) {
        let Some(count) = body.f64() else {
            log::debug!("Truncated VRPN analog report");
            return;
        };
        let mut count = if count.is_finite() && count > 0.0 { count as usize } else { 0 };
        if count > MAX_ANALOGS {
            log::debug!("VRPN reports {} analog channels, keeping {}", count, MAX_ANALOGS);
            count = MAX_ANALOGS;
        }
        for index in 0..count {
            let Some(value) = body.f64() else {
                log::debug!("VRPN analog report ends after {} channels", index);
                return;
            };
            sink.updates.push(RawChannelUpdate::Valuator {
                address: RawAddress::Vrpn {
                    sender: slot,
                    index: index as u8,
                },
                value,
            });
        }
    }

    fn velocity(&mut self, slot: u8, body: &mut Reader, sink: &mut DecodeSink) {
        let Some((sensor, v)) = read_sensor_doubles::<7>(body) else {
            log::debug!("Truncated VRPN velocity report");
            return;
        };
        let trailing = body.f64().unwrap_or(0.0);
        sink.velocities.push((
            slot,
            VelocityReport {
                sensor,
                velocity: [v[0], v[1], v[2]],
                velocity_quat: [v[3], v[4], v[5], v[6]],
                trailing,
            },
        ));
    }

    fn message(&mut self, header: &Header, body: &[u8], sink: &mut DecodeSink) {
        let mut r = Reader::new(body, Endian::Big);
        match header.kind {
            SENDER_DESCRIPTION => self.describe_sender(header, &mut r, sink),
            TYPE_DESCRIPTION => self.describe_type(header, &mut r),
            UDP_DESCRIPTION | LOG_DESCRIPTION | DISCONNECT_MESSAGE => {
                log::debug!("Skipping VRPN metadata message {}", header.kind);
            }
            kind => {
                let Some(slot) = VrpnDecoder::slot(header.sender) else {
                    log::debug!("VRPN message from unknown sender {}", header.sender);
                    return;
                };
                match self.known(kind) {
                    Some(Known::PosQuat) => self.pos_quat(header, slot, &mut r, sink),
                    Some(Known::Velocity) => self.velocity(slot, &mut r, sink),
                    Some(Known::Acceleration) => {}
                    Some(Known::Button) => self.button(slot, &mut r, sink),
                    Some(Known::Analog) => self.analog(slot, &mut r, sink),
                    None => log::debug!(
                        "Skipping VRPN message type {} ({:?}) from sender {}",
                        kind,
                        self.type_name(kind),
                        header.sender
                    ),
                }
            }
        }
    }
}

impl Default for VrpnDecoder {
    fn default() -> Self {
        VrpnDecoder::new()
    }
}

/// `i32 sensor`, 4 pad bytes, then N doubles.
fn read_sensor_doubles<const N: usize>(r: &mut Reader) -> Option<(i32, [f64; N])> {
    let sensor = r.i32()?;
    r.skip(4)?;
    let mut out = [0.0; N];
    for slot in out.iter_mut() {
        *slot = r.f64()?;
    }
    Some((sensor, out))
}

impl Decoder for VrpnDecoder {
    fn family(&self) -> Family {
        Family::Vrpn
    }

    fn open_request(&mut self) -> Vec<Vec<u8>> {
        vec![client_cookie()]
    }

    fn decode(&mut self, input: &[u8], sink: &mut DecodeSink) -> usize {
        let mut consumed = 0;

        if self.phase == Phase::AwaitingCookie {
            if input.len() < COOKIE_SIZE {
                return 0;
            }
            let cookie = &input[..COOKIE_SIZE];
            match parse_cookie(cookie) {
                Some(version) => {
                    log::info!("VRPN server version {}.{:02}", version.0, version.1);
                    self.server_version = Some(version);
                }
                None => log::warn!(
                    "Unexpected VRPN cookie {:?}",
                    String::from_utf8_lossy(cookie).trim_end_matches('\0')
                ),
            }
            self.phase = Phase::Streaming;
            consumed = COOKIE_SIZE;
        }

        while input.len() - consumed >= HEADER_SIZE {
            let rest = &input[consumed..];
            let mut r = Reader::new(rest, Endian::Big);
            let Some(header) = Header::read(&mut r) else {
                break;
            };
            let wire = header.wire_size();
            if rest.len() < wire {
                break;
            }
            let end = (header.size as usize).clamp(HEADER_SIZE, wire);
            self.message(&header, &rest[HEADER_SIZE..end], sink);
            self.messages += 1;
            consumed += wire;
        }
        consumed
    }

    fn close_request(&mut self) -> Vec<Vec<u8>> {
        Vec::new()
    }

    fn reset(&mut self) {
        *self = VrpnDecoder::new();
    }

    fn unit(&self, address: &RawAddress) -> Option<&DeviceUnit> {
        match address {
            RawAddress::Vrpn { sender, index } => {
                self.trackers.get(*sender as usize)?.get(*index as usize)
            }
            _ => None,
        }
    }

    fn resolve_sender(&self, name: &str) -> Option<u8> {
        self.senders
            .iter()
            .position(|s| s.as_deref() == Some(name))
            .map(|slot| slot as u8)
    }

    fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "VRPN: phase {:?} server {:?} messages {}",
            self.phase, self.server_version, self.messages
        );
        for (slot, name) in self.senders.iter().enumerate() {
            if let Some(name) = name {
                let _ = writeln!(out, "  sender slot {}: {}", slot, name);
            }
        }
        for (code, name) in self.codes.iter().enumerate() {
            if let Some(name) = name {
                let _ = writeln!(out, "  type {}: {}", code, name);
            }
        }
        out
    }
}
