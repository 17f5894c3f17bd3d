//! Byte-stream connector: one socket plus a bounded receive buffer.
//!
//! The connector reads without blocking and hands out the undecoded bytes.
//! It never looks inside the payload.

use crate::{BridgeError, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_RETRIES: u32 = 200;
/// Largest UDP payload; datagrams land here whole before entering the buffer.
const MAX_DATAGRAM: usize = 65_536;

/// Fixed-capacity receive buffer with a cursor to the first undecoded byte.
pub struct RecvBuffer {
    data: Vec<u8>,
    start: usize,
    end: usize,
}

impl RecvBuffer {
    pub fn with_capacity(capacity: usize) -> RecvBuffer {
        RecvBuffer {
            data: vec![0u8; capacity],
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes received but not yet consumed by a decoder.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Shift pending bytes to the front, dropping already-decoded ones.
    fn compact(&mut self) {
        if self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }

    /// Free space for the next read, compacting first.
    pub fn spare(&mut self) -> Result<&mut [u8]> {
        self.compact();
        if self.end == self.data.len() {
            return Err(BridgeError::FrameTooLarge(self.data.len()));
        }
        Ok(&mut self.data[self.end..])
    }

    pub fn commit(&mut self, n: usize) {
        self.end = (self.end + n).min(self.data.len());
    }

    /// Append bytes from memory, as a socket read would.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        let spare = self.spare()?;
        if bytes.len() > spare.len() {
            return Err(BridgeError::FrameTooLarge(self.data.len()));
        }
        spare[..bytes.len()].copy_from_slice(bytes);
        self.commit(bytes.len());
        Ok(())
    }
}

/// Where a device connection points.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    /// Connect to a TCP server.
    Tcp { host: String, port: u16 },
    /// Listen for datagrams on a local port, optionally sending commands to
    /// a remote address.
    Udp {
        port: u16,
        command: Option<(String, u16)>,
    },
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Endpoint::Udp { port, .. } => write!(f, "udp://0.0.0.0:{}", port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    /// The peer went away. Buffered bytes are kept until reopen.
    NeedsReopen,
    Closed,
}

enum Socket {
    Tcp(TcpStream),
    Udp {
        socket: UdpSocket,
        command: Option<SocketAddr>,
        scratch: Vec<u8>,
        /// Length of a datagram in `scratch` still waiting for buffer space.
        held: usize,
    },
}

/// An open socket to one tracking server.
pub struct Connection {
    endpoint: Endpoint,
    socket: Socket,
    buffer: RecvBuffer,
    state: ConnState,
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| BridgeError::Resolve(format!("{}:{} ({})", host, port, e)))?
        .next()
        .ok_or_else(|| BridgeError::Resolve(format!("{}:{}", host, port)))
}

fn open_socket(endpoint: &Endpoint) -> Result<Socket> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let addr = resolve(host, *port)?;
            let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
            stream.set_nonblocking(true)?;
            stream.set_nodelay(true)?;
            Ok(Socket::Tcp(stream))
        }
        Endpoint::Udp { port, command } => {
            let socket = UdpSocket::bind(("0.0.0.0", *port))?;
            socket.set_nonblocking(true)?;
            let command = match command {
                Some((host, port)) => Some(resolve(host, *port)?),
                None => None,
            };
            Ok(Socket::Udp {
                socket,
                command,
                scratch: vec![0u8; MAX_DATAGRAM],
                held: 0,
            })
        }
    }
}

impl Connection {
    /// Open a socket to `endpoint` with a receive buffer of `capacity` bytes.
    pub fn open(endpoint: Endpoint, capacity: usize) -> Result<Connection> {
        let socket = open_socket(&endpoint)?;
        log::info!("Opened {}", endpoint);
        Ok(Connection {
            endpoint,
            socket,
            buffer: RecvBuffer::with_capacity(capacity),
            state: ConnState::Open,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn needs_reopen(&self) -> bool {
        self.state == ConnState::NeedsReopen
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(match &self.socket {
            Socket::Tcp(stream) => stream.local_addr()?,
            Socket::Udp { socket, .. } => socket.local_addr()?,
        })
    }

    pub fn pending(&self) -> &[u8] {
        self.buffer.pending()
    }

    pub fn consume(&mut self, n: usize) {
        self.buffer.consume(n);
    }

    /// Read whatever is available without blocking.
    ///
    /// Returns the number of bytes appended. A TCP peer close moves the
    /// connection to [`ConnState::NeedsReopen`] and keeps the buffered bytes.
    /// UDP datagrams are appended whole or not at all.
    pub fn poll(&mut self) -> Result<usize> {
        if self.state != ConnState::Open {
            return Ok(0);
        }
        if matches!(self.socket, Socket::Udp { .. }) {
            return self.poll_datagrams();
        }

        let mut total = 0;
        loop {
            let spare = match self.buffer.spare() {
                Ok(spare) => spare,
                // Stop once full; the caller decodes before the next poll.
                Err(e) if total > 0 => {
                    log::trace!("Receive buffer filled in one poll: {}", e);
                    return Ok(total);
                }
                Err(e) => return Err(e),
            };

            let Socket::Tcp(stream) = &mut self.socket else {
                return Ok(total);
            };

            match stream.read(spare) {
                Ok(0) => {
                    log::warn!("{} closed by peer", self.endpoint);
                    self.state = ConnState::NeedsReopen;
                    return Ok(total);
                }
                Ok(n) => {
                    self.buffer.commit(n);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Move whole datagrams into the buffer.
    ///
    /// A datagram that does not fit waits in the scratch area until the
    /// decoder frees space. If it cannot fit even after decoding, the poll
    /// fails with [`BridgeError::FrameTooLarge`] and the datagram is dropped.
    fn poll_datagrams(&mut self) -> Result<usize> {
        let Connection { socket, buffer, endpoint, .. } = self;
        let Socket::Udp { socket, scratch, held, .. } = socket else {
            return Ok(0);
        };

        let mut total = 0;
        loop {
            if *held == 0 {
                match socket.recv(scratch) {
                    Ok(0) => continue,
                    Ok(n) => *held = n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(total),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            match buffer.extend(&scratch[..*held]) {
                Ok(()) => {
                    total += *held;
                    *held = 0;
                }
                // Keep it for the next poll; the caller decodes first.
                Err(_) if total > 0 => return Ok(total),
                Err(e) => {
                    log::warn!(
                        "{}: {} byte datagram does not fit beside {} pending bytes, dropping",
                        endpoint,
                        *held,
                        buffer.pending().len()
                    );
                    *held = 0;
                    return Err(e);
                }
            }
        }
    }

    /// Send bytes to the peer, or to the command address for UDP sources.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.socket {
            Socket::Tcp(stream) => {
                let mut offset = 0;
                let mut retries = 0;
                while offset < bytes.len() {
                    match stream.write(&bytes[offset..]) {
                        Ok(0) => return Err(BridgeError::PeerClosed),
                        Ok(n) => offset += n,
                        Err(e) if e.kind() == ErrorKind::WouldBlock && retries < WRITE_RETRIES => {
                            retries += 1;
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
            Socket::Udp { socket, command, .. } => match command {
                Some(addr) => {
                    socket.send_to(bytes, *addr)?;
                    Ok(())
                }
                None => {
                    log::debug!("No command address for {}, dropping {} bytes", self.endpoint, bytes.len());
                    Ok(())
                }
            },
        }
    }

    /// Drop the socket and open a fresh one to the same endpoint.
    ///
    /// A UDP socket keeps its binding, since the old socket would still hold
    /// the port; only the buffered bytes are dropped.
    pub fn reopen(&mut self) -> Result<()> {
        if let Socket::Udp { held, .. } = &mut self.socket {
            *held = 0;
            self.buffer.clear();
            self.state = ConnState::Open;
            log::info!("Reset {}", self.endpoint);
            return Ok(());
        }
        self.close();
        self.socket = open_socket(&self.endpoint)?;
        self.buffer.clear();
        self.state = ConnState::Open;
        log::info!("Reopened {}", self.endpoint);
        Ok(())
    }

    pub fn close(&mut self) {
        if let Socket::Tcp(stream) = &self.socket {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.state = ConnState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    fn poll_until(conn: &mut Connection, want: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut total = 0;
        while total < want && Instant::now() < deadline {
            total += conn.poll().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        total
    }

    #[test]
    fn test_buffer_compacts_before_append() {
        let mut buf = RecvBuffer::with_capacity(8);
        buf.extend(b"abcdef").unwrap();
        buf.consume(4);
        assert_eq!(buf.pending(), b"ef");

        // Only 2 bytes free at the tail, but 6 after compaction.
        buf.extend(b"ghijkl").unwrap();
        assert_eq!(buf.pending(), b"efghijkl");
    }

    #[test]
    fn test_buffer_full_is_frame_error() {
        let mut buf = RecvBuffer::with_capacity(4);
        buf.extend(b"abcd").unwrap();
        assert!(matches!(buf.spare(), Err(BridgeError::FrameTooLarge(4))));
        assert!(matches!(buf.extend(b"e"), Err(BridgeError::FrameTooLarge(4))));
        assert_eq!(buf.pending(), b"abcd");
    }

    #[test]
    fn test_consume_all_resets_cursor() {
        let mut buf = RecvBuffer::with_capacity(4);
        buf.extend(b"ab").unwrap();
        buf.consume(5);
        assert!(buf.pending().is_empty());
        buf.extend(b"wxyz").unwrap();
        assert_eq!(buf.pending(), b"wxyz");
    }

    #[test]
    fn test_tcp_peer_close_keeps_buffered_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut conn = Connection::open(
            Endpoint::Tcp {
                host: "127.0.0.1".into(),
                port,
            },
            64,
        )
        .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        peer.write_all(b"partial").unwrap();
        assert_eq!(poll_until(&mut conn, 7), 7);

        drop(peer);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !conn.needs_reopen() && Instant::now() < deadline {
            conn.poll().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(conn.needs_reopen());
        assert_eq!(conn.pending(), b"partial");
        assert_eq!(conn.poll().unwrap(), 0);
    }

    #[test]
    fn test_udp_datagrams_are_never_split() {
        let mut conn = Connection::open(Endpoint::Udp { port: 0, command: None }, 64).unwrap();
        let port = conn.local_addr().unwrap().port();
        let first = format!("fr 1\n6d 0 {}\n", "x".repeat(28));
        let second = format!("fr 2\n6d 0 {}\n", "y".repeat(28));
        assert_eq!(first.len(), 39);

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(first.as_bytes(), ("127.0.0.1", port)).unwrap();
        sender.send_to(second.as_bytes(), ("127.0.0.1", port)).unwrap();

        // Only the first fits; the second waits rather than being cut.
        assert_eq!(poll_until(&mut conn, 39), 39);
        assert_eq!(conn.pending(), first.as_bytes());

        conn.consume(39);
        assert_eq!(poll_until(&mut conn, 39), 39);
        assert_eq!(conn.pending(), second.as_bytes());
    }

    #[test]
    fn test_udp_datagram_larger_than_buffer_is_frame_error() {
        let mut conn = Connection::open(Endpoint::Udp { port: 0, command: None }, 16).unwrap();
        let port = conn.local_addr().unwrap().port();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[b'z'; 40], ("127.0.0.1", port)).unwrap();
        sender.send_to(b"fr 3\n", ("127.0.0.1", port)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let err = loop {
            match conn.poll() {
                Err(e) => break e,
                Ok(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(1)),
                Ok(_) => panic!("oversized datagram was accepted"),
            }
        };
        assert!(matches!(err, BridgeError::FrameTooLarge(16)));
        assert!(conn.pending().is_empty());
        assert_eq!(poll_until(&mut conn, 5), 5);
        assert_eq!(conn.pending(), b"fr 3\n");
    }

    #[test]
    fn test_udp_receive_and_command() {
        let commands = UdpSocket::bind("127.0.0.1:0").unwrap();
        let cmd_port = commands.local_addr().unwrap().port();

        let mut conn = Connection::open(
            Endpoint::Udp {
                port: 0,
                command: Some(("127.0.0.1".into(), cmd_port)),
            },
            128,
        )
        .unwrap();
        let port = conn.local_addr().unwrap().port();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"fr 1\n", ("127.0.0.1", port)).unwrap();
        assert_eq!(poll_until(&mut conn, 5), 5);
        assert_eq!(conn.pending(), b"fr 1\n");

        conn.send(b"dtrack 31").unwrap();
        let mut buf = [0u8; 32];
        commands.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let n = commands.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"dtrack 31");
    }
}
