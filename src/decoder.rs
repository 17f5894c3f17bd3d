//! The contract shared by the three protocol decoders.

use crate::types::{DeviceUnit, Family, RawAddress, RawChannelUpdate, VelocityReport};

/// Everything a decode pass produced besides the consumed byte count.
#[derive(Debug, Default)]
pub struct DecodeSink {
    /// Raw channel updates in wire order.
    pub updates: Vec<RawChannelUpdate>,
    /// Bytes the decoder wants sent back to the server.
    pub outgoing: Vec<Vec<u8>>,
    /// VRPN velocity reports, tagged with the sender slot.
    pub velocities: Vec<(u8, VelocityReport)>,
    /// The server acknowledged a graceful end of stream.
    pub stream_stopped: bool,
    /// New sender names were learned; pending name bindings may now resolve.
    pub names_changed: bool,
    /// The stream cannot continue on this connection; drop it and reconnect.
    pub reconnect: bool,
}

impl DecodeSink {
    pub fn clear(&mut self) {
        self.updates.clear();
        self.outgoing.clear();
        self.velocities.clear();
        self.stream_stopped = false;
        self.names_changed = false;
        self.reconnect = false;
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
            && self.outgoing.is_empty()
            && self.velocities.is_empty()
            && !self.stream_stopped
            && !self.names_changed
            && !self.reconnect
    }
}

/// A protocol state machine turning buffered bytes into raw updates.
///
/// Decoders are pure over byte slices: they never touch sockets, so a
/// stream can be fed in any fragmentation and must produce the same
/// updates.
pub trait Decoder: Send {
    fn family(&self) -> Family;

    /// Messages to send right after the connection opens.
    fn open_request(&mut self) -> Vec<Vec<u8>>;

    /// Decode as many complete frames from `input` as possible.
    ///
    /// Returns the number of bytes consumed. Incomplete trailing frames are
    /// left in place for the next call.
    fn decode(&mut self, input: &[u8], sink: &mut DecodeSink) -> usize;

    /// Called after a poll that delivered no bytes.
    fn on_idle(&mut self, _sink: &mut DecodeSink) {}

    /// Messages to send before the connection closes.
    fn close_request(&mut self) -> Vec<Vec<u8>>;

    /// Forget per-connection state after a reset.
    fn reset(&mut self);

    /// Tracker slot state backing `address`, if the protocol has one.
    fn unit(&self, address: &RawAddress) -> Option<&DeviceUnit>;

    /// Map a server-side device name to its sender slot.
    fn resolve_sender(&self, _name: &str) -> Option<u8> {
        None
    }

    /// Multi-line dump of the decoder state for diagnostics.
    fn describe(&self) -> String;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::connector::RecvBuffer;

    /// Feed `bytes` through a receive buffer `chunk` bytes at a time,
    /// decoding after every append.
    pub fn decode_chunked(
        decoder: &mut dyn Decoder,
        bytes: &[u8],
        chunk: usize,
    ) -> (Vec<RawChannelUpdate>, usize) {
        let mut buffer = RecvBuffer::with_capacity(4096);
        let mut sink = DecodeSink::default();
        let mut updates = Vec::new();
        for piece in bytes.chunks(chunk.max(1)) {
            buffer.extend(piece).unwrap();
            let used = decoder.decode(buffer.pending(), &mut sink);
            buffer.consume(used);
            updates.append(&mut sink.updates);
        }
        (updates, buffer.pending().len())
    }
}
