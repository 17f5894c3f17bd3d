//! Vrui VRDeviceDaemon binary streaming decoder.
//!
//! All fields are little-endian. After the connect handshake every frame is
//! a `PACKET_REPLY` id followed by a fixed-size device state record:
//!
//! - `[0..2]`: message id (6)
//! - N trackers x 13 f32: position xyz, quaternion xyzw, 6 velocity floats (unused)
//! - M buttons x 1 byte
//! - K valuators x f32

use crate::decoder::{DecodeSink, Decoder};
use crate::types::{DeviceUnit, Family, RawAddress, RawChannelUpdate, RawPose, RawRotation};
use crate::wire::{Endian, Reader, Writer};
use std::fmt::Write as _;

// -- Network defaults --
pub const DEFAULT_PORT: u16 = 8555;
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PROTOCOL: u32 = 2;
pub const BUFFER_SIZE: usize = 2048;

/// The daemon reports inches; the bridge defaults to feet.
pub const SCALE_INCH_TO_FEET: f64 = 1.0 / 12.0;

// -- Message ids --
pub const CONNECT_REQUEST: u16 = 0;
pub const CONNECT_REPLY: u16 = 1;
pub const DISCONNECT_REQUEST: u16 = 2;
pub const ACTIVATE_REQUEST: u16 = 3;
pub const DEACTIVATE_REQUEST: u16 = 4;
pub const PACKET_REQUEST: u16 = 5;
pub const PACKET_REPLY: u16 = 6;
pub const STARTSTREAM_REQUEST: u16 = 7;
pub const STOPSTREAM_REQUEST: u16 = 8;
pub const STOPSTREAM_REPLY: u16 = 9;

// -- Record geometry --
pub const FLOATS_PER_TRACKER: usize = 13;
/// Idle polls without a connect reply before retrying as protocol 1.
pub const JUMP_START_POLLS: u32 = 5;

/// Size in bytes of one streaming frame, including the message id.
///
/// Saturates, so absurd counts compare as larger than any buffer.
pub fn packet_size(trackers: usize, buttons: usize, valuators: usize) -> usize {
    trackers
        .saturating_mul(FLOATS_PER_TRACKER * 4)
        .saturating_add(buttons)
        .saturating_add(valuators.saturating_mul(4))
        .saturating_add(2)
}

/// Length of the fixed connect reply for a protocol revision.
pub fn reply_header_len(protocol: u32) -> usize {
    match protocol {
        0 => 14,
        1 => 18,
        _ => 22,
    }
}

fn message(id: u16) -> Vec<u8> {
    let mut w = Writer::new(Endian::Little);
    w.u16(id);
    w.finish()
}

/// Input device layout advertised by protocol-2 daemons.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualDevice {
    pub name: String,
    pub track_type: i32,
    pub ray_direction: [f32; 3],
    /// Word following the ray direction; its meaning is unknown.
    pub unknown: u32,
    /// Tracker feeding this device, -1 if none.
    pub tracker_index: i32,
    pub buttons: Vec<(String, u32)>,
    pub valuators: Vec<(String, u32)>,
}

fn read_named_indices(r: &mut Reader) -> Option<Vec<(String, u32)>> {
    let count = r.u32()? as usize;
    let mut names = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        names.push(r.string()?);
    }
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        out.push((name, r.u32()?));
    }
    Some(out)
}

fn read_virtual_device(r: &mut Reader) -> Option<VirtualDevice> {
    let name = r.string()?;
    let track_type = r.i32()?;
    let ray_direction = [r.f32()?, r.f32()?, r.f32()?];
    let unknown = r.u32()?;
    let tracker_index = r.i32()?;
    let buttons = read_named_indices(r)?;
    let valuators = read_named_indices(r)?;
    Some(VirtualDevice {
        name,
        track_type,
        ray_direction,
        unknown,
        tracker_index,
        buttons,
        valuators,
    })
}

/// Device layout from a connect reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerLayout {
    pub protocol: u32,
    pub trackers: usize,
    pub buttons: usize,
    pub valuators: usize,
    pub virtual_devices: Vec<VirtualDevice>,
}

impl ServerLayout {
    pub fn packet_size(&self) -> usize {
        packet_size(self.trackers, self.buttons, self.valuators)
    }
}

/// Parse a complete connect reply at the start of `input`.
///
/// `expected` is the protocol negotiated so far; for revisions above 0 the
/// server's own protocol field decides the rest of the layout. Returns the
/// layout and the bytes used, or None while the reply is incomplete.
pub fn parse_connect_reply(input: &[u8], expected: u32) -> Option<(ServerLayout, usize)> {
    let mut r = Reader::new(input, Endian::Little);
    if r.u16()? != CONNECT_REPLY {
        return None;
    }
    let protocol = if expected == 0 { 0 } else { r.u32()? };
    let trackers = r.u32()? as usize;
    let buttons = r.u32()? as usize;
    let valuators = r.u32()? as usize;
    let mut virtual_devices = Vec::new();
    if protocol >= 2 {
        let count = r.u32()? as usize;
        for _ in 0..count {
            virtual_devices.push(read_virtual_device(&mut r)?);
        }
    }
    Some((
        ServerLayout {
            protocol,
            trackers,
            buttons,
            valuators,
            virtual_devices,
        },
        r.position(),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingReply,
    Streaming,
    Stopped,
}

/// Decoder for the VRDeviceDaemon protocol, revisions 0 to 2.
pub struct VruiddDecoder {
    requested: u32,
    negotiated: u32,
    phase: Phase,
    idle_polls: u32,
    layout: Option<ServerLayout>,
    packet_size: usize,
    frames: u32,
    trackers: Vec<DeviceUnit>,
}

impl VruiddDecoder {
    pub fn new(protocol: u32) -> VruiddDecoder {
        VruiddDecoder {
            requested: protocol,
            negotiated: protocol,
            phase: Phase::AwaitingReply,
            idle_polls: 0,
            layout: None,
            packet_size: 0,
            frames: 0,
            trackers: Vec::new(),
        }
    }

    /// Protocol revision currently in effect.
    pub fn protocol(&self) -> u32 {
        self.negotiated
    }

    pub fn layout(&self) -> Option<&ServerLayout> {
        self.layout.as_ref()
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    fn accept_layout(&mut self, layout: ServerLayout, sink: &mut DecodeSink) {
        if self.negotiated > 0 && layout.protocol != self.negotiated {
            log::warn!(
                "VRDeviceDaemon speaks protocol {} (requested {}), adopting it",
                layout.protocol,
                self.negotiated
            );
        }
        self.negotiated = layout.protocol;
        self.packet_size = layout.packet_size();
        self.trackers = vec![DeviceUnit::default(); layout.trackers];
        log::info!(
            "VRDeviceDaemon protocol {}: {} trackers, {} buttons, {} valuators, {} virtual devices, {} byte frames",
            layout.protocol,
            layout.trackers,
            layout.buttons,
            layout.valuators,
            layout.virtual_devices.len(),
            self.packet_size
        );
        self.layout = Some(layout);
        self.phase = Phase::Streaming;
        sink.outgoing.push(message(ACTIVATE_REQUEST));
        sink.outgoing.push(message(STARTSTREAM_REQUEST));
    }

    fn decode_frame(&mut self, frame: &[u8], sink: &mut DecodeSink) {
        let Some(layout) = &self.layout else {
            return;
        };
        let (buttons, valuators) = (layout.buttons, layout.valuators);
        let mut r = Reader::new(frame, Endian::Little);
        // Length was checked against packet_size; the id is skipped.
        let _ = r.u16();
        self.frames = self.frames.wrapping_add(1);

        for (index, unit) in self.trackers.iter_mut().enumerate() {
            let mut v = [0.0f64; FLOATS_PER_TRACKER];
            for slot in v.iter_mut() {
                *slot = r.f32().unwrap_or(0.0) as f64;
            }
            let pose = RawPose {
                position: [v[0], v[1], v[2]],
                rotation: RawRotation::Quaternion([v[3], v[4], v[5], v[6]]),
                quality: 1.0,
            };
            unit.frame = self.frames;
            unit.active = true;
            unit.quality = 1.0;
            unit.latched = Some(pose);
            sink.updates.push(RawChannelUpdate::Pose {
                address: RawAddress::Vruidd { index: index as u16 },
                pose,
            });
        }
        for index in 0..buttons {
            let value = r.u8().unwrap_or(0) != 0;
            sink.updates.push(RawChannelUpdate::Button {
                address: RawAddress::Vruidd { index: index as u16 },
                value,
            });
        }
        for index in 0..valuators {
            let value = r.f32().unwrap_or(0.0) as f64;
            sink.updates.push(RawChannelUpdate::Valuator {
                address: RawAddress::Vruidd { index: index as u16 },
                value,
            });
        }
    }
}

impl Decoder for VruiddDecoder {
    fn family(&self) -> Family {
        Family::Vruidd
    }

    fn open_request(&mut self) -> Vec<Vec<u8>> {
        let mut w = Writer::new(Endian::Little);
        w.u16(CONNECT_REQUEST);
        if self.requested > 0 {
            w.u32(self.requested);
        }
        vec![w.finish()]
    }

    fn decode(&mut self, input: &[u8], sink: &mut DecodeSink) -> usize {
        let mut consumed = 0;
        while input.len() - consumed >= 2 {
            let rest = &input[consumed..];
            let id = u16::from_le_bytes([rest[0], rest[1]]);
            match self.phase {
                Phase::AwaitingReply => {
                    if id != CONNECT_REPLY {
                        log::warn!("Expected CONNECT_REPLY from VRDeviceDaemon, got {:#04x}; skipping two bytes", id);
                        consumed += 2;
                        continue;
                    }
                    match parse_connect_reply(rest, self.negotiated) {
                        Some((layout, _)) if layout.packet_size() > BUFFER_SIZE => {
                            log::warn!(
                                "VRDeviceDaemon layout of {} trackers, {} buttons, {} valuators needs {} byte frames (buffer {}), reconnecting",
                                layout.trackers,
                                layout.buttons,
                                layout.valuators,
                                layout.packet_size(),
                                BUFFER_SIZE
                            );
                            self.reset();
                            sink.reconnect = true;
                            return input.len();
                        }
                        Some((layout, used)) => {
                            consumed += used;
                            self.accept_layout(layout, sink);
                        }
                        None => break,
                    }
                }
                Phase::Streaming | Phase::Stopped => match id {
                    PACKET_REPLY => {
                        if rest.len() < self.packet_size {
                            break;
                        }
                        self.decode_frame(&rest[..self.packet_size], sink);
                        consumed += self.packet_size;
                    }
                    STOPSTREAM_REPLY => {
                        consumed += 2;
                        self.phase = Phase::Stopped;
                        sink.stream_stopped = true;
                        log::info!("VRDeviceDaemon stream stopped");
                        break;
                    }
                    other => {
                        log::warn!("Expected PACKET_REPLY from VRDeviceDaemon, got {:#04x}; skipping two bytes", other);
                        consumed += 2;
                    }
                },
            }
        }
        consumed
    }

    fn on_idle(&mut self, sink: &mut DecodeSink) {
        if self.phase != Phase::AwaitingReply || self.negotiated != 0 {
            return;
        }
        self.idle_polls += 1;
        if self.idle_polls == JUMP_START_POLLS {
            log::warn!(
                "No reply after {} polls; retrying VRDeviceDaemon handshake as protocol 1",
                JUMP_START_POLLS
            );
            self.negotiated = 1;
            let mut w = Writer::new(Endian::Little);
            w.u32(1);
            sink.outgoing.push(w.finish());
        }
    }

    fn close_request(&mut self) -> Vec<Vec<u8>> {
        if self.phase == Phase::AwaitingReply {
            return vec![message(DISCONNECT_REQUEST)];
        }
        vec![
            message(STOPSTREAM_REQUEST),
            message(DEACTIVATE_REQUEST),
            message(DISCONNECT_REQUEST),
        ]
    }

    fn reset(&mut self) {
        *self = VruiddDecoder::new(self.requested);
    }

    fn unit(&self, address: &RawAddress) -> Option<&DeviceUnit> {
        match address {
            RawAddress::Vruidd { index } => self.trackers.get(*index as usize),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "VRDeviceDaemon: phase {:?} protocol {} (requested {}) frames {} packet {} bytes",
            self.phase, self.negotiated, self.requested, self.frames, self.packet_size
        );
        if let Some(layout) = &self.layout {
            let _ = writeln!(
                out,
                "  {} trackers, {} buttons, {} valuators",
                layout.trackers, layout.buttons, layout.valuators
            );
            for vd in &layout.virtual_devices {
                let _ = writeln!(
                    out,
                    "  virtual device '{}' type {} tracker {} ray {:?} buttons {:?} valuators {:?}",
                    vd.name, vd.track_type, vd.tracker_index, vd.ray_direction, vd.buttons, vd.valuators
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::testing::decode_chunked;

    fn reply_v0(trackers: u32, buttons: u32, valuators: u32) -> Vec<u8> {
        let mut w = Writer::new(Endian::Little);
        w.u16(CONNECT_REPLY).u32(trackers).u32(buttons).u32(valuators);
        w.finish()
    }

    fn reply_v1(trackers: u32, buttons: u32, valuators: u32) -> Vec<u8> {
        let mut w = Writer::new(Endian::Little);
        w.u16(CONNECT_REPLY).u32(1).u32(trackers).u32(buttons).u32(valuators);
        w.finish()
    }

    fn frame(trackers: &[[f32; 7]], buttons: &[u8], valuators: &[f32]) -> Vec<u8> {
        let mut w = Writer::new(Endian::Little);
        w.u16(PACKET_REPLY);
        for t in trackers {
            for v in t {
                w.f32(*v);
            }
            for _ in 0..6 {
                w.f32(0.0);
            }
        }
        w.bytes(buttons);
        for v in valuators {
            w.f32(*v);
        }
        w.finish()
    }

    #[test]
    fn test_packet_size() {
        assert_eq!(packet_size(1, 2, 0), 56);
        assert_eq!(packet_size(2, 3, 4), 2 + 104 + 3 + 16);
        assert_eq!(reply_header_len(0), 14);
        assert_eq!(reply_header_len(1), 18);
        assert_eq!(reply_header_len(2), 22);
    }

    #[test]
    fn test_oversized_layout_requests_reconnect() {
        assert_eq!(packet_size(usize::MAX, 0, 0), usize::MAX);

        let mut decoder = VruiddDecoder::new(0);
        let mut sink = DecodeSink::default();
        let mut bytes = reply_v0(u32::MAX, 0, 0);
        bytes.extend_from_slice(&[0x06, 0x00, 0xff]);
        assert_eq!(decoder.decode(&bytes, &mut sink), bytes.len());
        assert!(sink.reconnect);
        assert!(sink.outgoing.is_empty());
        assert!(sink.updates.is_empty());
        assert!(decoder.layout().is_none());
        assert_eq!(decoder.packet_size(), 0);

        // One frame past the buffer is refused too; one that fits is accepted.
        let trackers = (BUFFER_SIZE - 2) / (FLOATS_PER_TRACKER * 4);
        let spill = BUFFER_SIZE - packet_size(trackers, 0, 0) + 1;
        let mut sink = DecodeSink::default();
        let reply = reply_v0(trackers as u32, spill as u32, 0);
        decoder.decode(&reply, &mut sink);
        assert!(sink.reconnect);

        decoder.reset();
        let mut sink = DecodeSink::default();
        let reply = reply_v0(trackers as u32, 0, 0);
        assert_eq!(decoder.decode(&reply, &mut sink), reply.len());
        assert!(!sink.reconnect);
        assert!(decoder.packet_size() <= BUFFER_SIZE);
    }

    #[test]
    fn test_connect_request_encoding() {
        assert_eq!(VruiddDecoder::new(0).open_request(), vec![vec![0x00, 0x00]]);
        assert_eq!(
            VruiddDecoder::new(2).open_request(),
            vec![vec![0x00, 0x00, 0x02, 0x00, 0x00, 0x00]]
        );
    }

    #[test]
    fn test_handshake_then_one_frame() {
        let mut bytes = reply_v0(1, 2, 0);
        let data = frame(&[[1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 1.0]], &[1, 0], &[]);
        assert_eq!(data.len(), 56);
        bytes.extend_from_slice(&data);

        let mut decoder = VruiddDecoder::new(0);
        let mut sink = DecodeSink::default();
        let used = decoder.decode(&bytes, &mut sink);
        assert_eq!(used, bytes.len());

        assert_eq!(
            sink.outgoing,
            vec![vec![0x03, 0x00], vec![0x07, 0x00]]
        );

        let poses: Vec<_> = sink
            .updates
            .iter()
            .filter(|u| matches!(u, RawChannelUpdate::Pose { .. }))
            .collect();
        assert_eq!(poses.len(), 1);
        match poses[0] {
            RawChannelUpdate::Pose { address, pose } => {
                assert_eq!(*address, RawAddress::Vruidd { index: 0 });
                assert_eq!(pose.position, [1.0, 2.0, 3.0]);
                assert_eq!(pose.rotation, RawRotation::Quaternion([0.0, 0.0, 0.0, 1.0]));
            }
            _ => unreachable!(),
        }
        let buttons: Vec<bool> = sink
            .updates
            .iter()
            .filter_map(|u| match u {
                RawChannelUpdate::Button { value, .. } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(buttons, vec![true, false]);
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut decoder = VruiddDecoder::new(0);
        let mut sink = DecodeSink::default();
        let reply = reply_v0(1, 0, 1);
        assert_eq!(decoder.decode(&reply, &mut sink), reply.len());

        let data = frame(&[[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]], &[], &[0.5]);
        assert_eq!(decoder.decode(&data[..data.len() - 1], &mut sink), 0);
        assert_eq!(decoder.decode(&data, &mut sink), data.len());
    }

    #[test]
    fn test_v0_request_against_v1_server() {
        let mut decoder = VruiddDecoder::new(0);
        let mut sink = DecodeSink::default();

        // A v1 server waits for the protocol number and never replies.
        for _ in 0..JUMP_START_POLLS {
            decoder.on_idle(&mut sink);
        }
        assert_eq!(sink.outgoing, vec![vec![0x01, 0x00, 0x00, 0x00]]);
        assert_eq!(decoder.protocol(), 1);
        sink.clear();

        let mut bytes = reply_v1(1, 2, 0);
        assert_eq!(bytes.len(), 18);
        bytes.extend_from_slice(&frame(&[[4.0, 5.0, 6.0, 0.0, 0.0, 0.0, 1.0]], &[0, 1], &[]));

        let used = decoder.decode(&bytes, &mut sink);
        assert_eq!(used, bytes.len());
        let layout = decoder.layout().unwrap();
        assert_eq!((layout.trackers, layout.buttons, layout.valuators), (1, 2, 0));
        assert_eq!(sink.updates.len(), 3);
        match sink.updates[0] {
            RawChannelUpdate::Pose { pose, .. } => assert_eq!(pose.position, [4.0, 5.0, 6.0]),
            _ => panic!("expected pose"),
        }
    }

    #[test]
    fn test_protocol2_virtual_devices_consumed() {
        let mut w = Writer::new(Endian::Little);
        w.u16(CONNECT_REPLY).u32(2).u32(1).u32(1).u32(1).u32(1);
        w.string("Wand")
            .i32(7)
            .f32(0.0)
            .f32(0.0)
            .f32(-1.0)
            .u32(0)
            .i32(0)
            .u32(1)
            .string("Trigger")
            .u32(0)
            .u32(1)
            .string("JoyX")
            .u32(0);
        let mut bytes = w.finish();
        bytes.extend_from_slice(&frame(&[[0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0]], &[1], &[0.25]));

        // Requested 1, server answers 2: its layout wins.
        let mut decoder = VruiddDecoder::new(1);
        let (updates, left) = decode_chunked(&mut decoder, &bytes, 3);
        assert_eq!(left, 0);
        assert_eq!(decoder.protocol(), 2);
        let vd = &decoder.layout().unwrap().virtual_devices[0];
        assert_eq!(vd.name, "Wand");
        assert_eq!(vd.ray_direction, [0.0, 0.0, -1.0]);
        assert_eq!(vd.buttons, vec![("Trigger".to_string(), 0)]);
        assert_eq!(vd.valuators, vec![("JoyX".to_string(), 0)]);
        assert_eq!(updates.len(), 3);
        assert!(matches!(updates[2], RawChannelUpdate::Valuator { value, .. } if value == 0.25));
    }

    #[test]
    fn test_stop_reply_and_unknown_ids() {
        let mut decoder = VruiddDecoder::new(0);
        let mut sink = DecodeSink::default();
        let mut bytes = reply_v0(0, 1, 0);
        bytes.extend_from_slice(&[0x0f, 0x00]);
        bytes.extend_from_slice(&frame(&[], &[1], &[]));
        bytes.extend_from_slice(&[0x09, 0x00]);

        let used = decoder.decode(&bytes, &mut sink);
        assert_eq!(used, bytes.len());
        assert!(sink.stream_stopped);
        assert_eq!(sink.updates.len(), 1);
        assert_eq!(
            decoder.close_request(),
            vec![vec![0x08, 0x00], vec![0x04, 0x00], vec![0x02, 0x00]]
        );
    }

    #[test]
    fn test_fragmentation_independent() {
        let mut bytes = reply_v0(2, 3, 2);
        for i in 0..4 {
            let f = i as f32;
            bytes.extend_from_slice(&frame(
                &[[f, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0], [0.0, f, 0.0, 0.0, 0.0, 0.0, 1.0]],
                &[i as u8 & 1, 0, 1],
                &[f * 0.5, -f],
            ));
        }
        let (expected, _) = decode_chunked(&mut VruiddDecoder::new(0), &bytes, bytes.len());
        assert_eq!(expected.len(), 4 * 7);
        for chunk in [1, 5, 13, 56] {
            let (updates, left) = decode_chunked(&mut VruiddDecoder::new(0), &bytes, chunk);
            assert_eq!(updates, expected);
            assert_eq!(left, 0);
        }
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(128))]

        #[test]
        fn prop_chunking_does_not_change_updates(
            chunk in 1usize..=80,
            values in proptest::collection::vec(-100.0f32..100.0, 1..=4),
        ) {
            let mut bytes = reply_v0(1, 1, 1);
            for v in &values {
                bytes.extend_from_slice(&frame(&[[*v, 0.0, -*v, 0.0, 0.0, 0.0, 1.0]], &[1], &[*v]));
            }
            let (expected, _) = decode_chunked(&mut VruiddDecoder::new(0), &bytes, bytes.len());
            let (updates, left) = decode_chunked(&mut VruiddDecoder::new(0), &bytes, chunk);
            prop_assert_eq!(updates, expected);
            prop_assert_eq!(left, 0);
        }
    }
}
