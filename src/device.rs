//! One worker thread per configured tracking device.
//!
//! The worker owns the connection, the decoder and the dispatcher. The
//! host talks to it through the shared logical inputs, the event channel
//! and a small command queue.

use crate::channel_map::ChannelMap;
use crate::config::{DeviceConfig, FamilySettings, RuntimeOptions};
use crate::connector::Connection;
use crate::decoder::{DecodeSink, Decoder};
use crate::dispatcher::{Dispatcher, InputEvent};
use crate::dtrack::DtrackDecoder;
use crate::error::BridgeError;
use crate::input::LogicalInput;
use crate::types::ControlValue;
use crate::vrpn::VrpnDecoder;
use crate::vruidd::VruiddDecoder;
use crate::Result;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

const COMMAND_QUEUE: usize = 64;

/// Requests from the host to a device worker.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    Control { action: String, value: ControlValue },
}

/// Build the decoder for a device's family.
pub fn make_decoder(settings: &FamilySettings) -> Box<dyn Decoder> {
    match settings {
        FamilySettings::Dtrack(s) => Box::new(DtrackDecoder::new(s.remap, s.start_commands)),
        FamilySettings::Vruidd(s) => Box::new(VruiddDecoder::new(s.protocol)),
        FamilySettings::Vrpn(_) => Box::new(VrpnDecoder::new()),
    }
}

/// Handle to a running device worker.
pub struct DeviceWorker {
    name: String,
    inputs: Vec<Arc<LogicalInput>>,
    commands: Sender<Command>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeviceWorker {
    /// Build the channel map and start the worker thread.
    ///
    /// The connection is opened by the worker, so an unreachable server
    /// does not fail the spawn; the worker keeps retrying.
    pub(crate) fn spawn(config: DeviceConfig, options: RuntimeOptions, events: Sender<InputEvent>) -> Result<DeviceWorker> {
        let map = ChannelMap::build(&config.name, config.family, &config.inputs, &config.controls);
        let inputs = map.inputs().to_vec();
        let name = config.name.clone();
        let (commands, command_rx) = crossbeam_channel::bounded(COMMAND_QUEUE);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();

        log::info!(
            "Starting {} device '{}' with {} inputs",
            config.family,
            config.name,
            inputs.len()
        );

        let thread = std::thread::Builder::new()
            .name(format!("trackbridge-{}", name))
            .spawn(move || {
                let decoder = make_decoder(&config.settings);
                let endpoint = config.settings.endpoint();
                let capacity = config.settings.buffer_size();
                let dispatcher = Dispatcher::new(config, map, events, options.log_raw);
                let worker = Worker {
                    decoder,
                    dispatcher,
                    endpoint,
                    capacity,
                    options,
                    commands: command_rx,
                    stop_flag: stop_clone,
                };
                worker.run();
            })
            .map_err(|e| BridgeError::Spawn(format!("'{}': {}", name, e)))?;

        Ok(DeviceWorker {
            name,
            inputs,
            commands,
            stop_flag,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[Arc<LogicalInput>] {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&Arc<LogicalInput>> {
        self.inputs.iter().find(|i| i.name() == name)
    }

    pub(crate) fn send(&self, command: Command) -> Result<()> {
        self.commands.try_send(command).map_err(|e| match e {
            crossbeam_channel::TrySendError::Full(_) => BridgeError::Timeout,
            crossbeam_channel::TrySendError::Disconnected(_) => BridgeError::ChannelDisconnected,
        })
    }

    pub fn is_active(&self) -> bool {
        !self.stop_flag.load(Ordering::Relaxed)
    }

    /// Raise the stop flag without waiting, so several workers can wind
    /// down together.
    pub(crate) fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// Stop the worker and wait for it to send its close sequence.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    decoder: Box<dyn Decoder>,
    dispatcher: Dispatcher,
    endpoint: crate::connector::Endpoint,
    capacity: usize,
    options: RuntimeOptions,
    commands: Receiver<Command>,
    stop_flag: Arc<AtomicBool>,
}

impl Worker {
    fn stopping(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed)
    }

    fn send_all(&self, conn: &mut Connection, messages: Vec<Vec<u8>>) {
        for message in messages {
            if let Err(e) = conn.send(&message) {
                log::warn!("{}: send to {} failed: {}", self.dispatcher.device(), conn.endpoint(), e);
            }
        }
    }

    fn open(&mut self) -> Option<Connection> {
        match Connection::open(self.endpoint.clone(), self.capacity) {
            Ok(mut conn) => {
                self.decoder.reset();
                let hello = self.decoder.open_request();
                self.send_all(&mut conn, hello);
                Some(conn)
            }
            Err(e) => {
                log::warn!(
                    "{}: cannot open {}: {}, retrying in {:?}",
                    self.dispatcher.device(),
                    self.endpoint,
                    e,
                    self.options.reconnect_delay
                );
                None
            }
        }
    }

    /// Drain queued host commands. Returns false once the host is gone.
    fn handle_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Control { action, value }) => {
                    self.dispatcher.control(&action, value, self.decoder.as_ref());
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Decode everything buffered, then dispatch it.
    ///
    /// Returns true when the decoder gave up on this connection.
    fn drain(&mut self, conn: &mut Connection, sink: &mut DecodeSink) -> bool {
        loop {
            let used = self.decoder.decode(conn.pending(), sink);
            if used == 0 {
                break;
            }
            conn.consume(used);
        }
        let outgoing = std::mem::take(&mut sink.outgoing);
        self.send_all(conn, outgoing);
        if sink.names_changed {
            self.dispatcher.resolve_names(self.decoder.as_ref());
        }
        if sink.stream_stopped {
            log::info!("{}: server confirmed end of stream", self.dispatcher.device());
        }
        self.dispatcher.dispatch(sink, self.decoder.as_ref());
        let reconnect = sink.reconnect;
        sink.clear();
        reconnect
    }

    fn run(mut self) {
        let device = self.dispatcher.device().to_string();
        log::info!("{} worker started ({})", device, self.endpoint);

        let mut conn: Option<Connection> = None;
        let mut last_attempt: Option<Instant> = None;
        let mut sink = DecodeSink::default();

        loop {
            if self.stopping() {
                log::info!("{} worker stopping (stop flag set)", device);
                break;
            }
            if !self.handle_commands() {
                log::info!("{} command channel disconnected, stopping worker", device);
                break;
            }

            let Some(c) = conn.as_mut() else {
                let due = last_attempt.map_or(true, |t| t.elapsed() >= self.options.reconnect_delay);
                if due {
                    last_attempt = Some(Instant::now());
                    conn = self.open();
                }
                if conn.is_none() {
                    self.dispatcher.step_sim6();
                    std::thread::sleep(self.options.poll_interval);
                }
                continue;
            };

            let reconnect = match c.poll() {
                Ok(0) => {
                    self.decoder.on_idle(&mut sink);
                    if sink.is_empty() {
                        self.dispatcher.step_sim6();
                        std::thread::sleep(self.options.poll_interval);
                        false
                    } else {
                        self.drain(c, &mut sink)
                    }
                }
                Ok(_) => self.drain(c, &mut sink),
                Err(BridgeError::FrameTooLarge(size)) => {
                    log::warn!("{}: no complete frame in {} buffered bytes, resetting", device, size);
                    self.decoder.reset();
                    match c.reopen() {
                        Ok(()) => {
                            let hello = self.decoder.open_request();
                            self.send_all(c, hello);
                        }
                        Err(e) => {
                            log::warn!("{}: reopen failed: {}", device, e);
                            conn = None;
                            last_attempt = Some(Instant::now());
                        }
                    }
                    continue;
                }
                Err(e) => {
                    log::warn!("{}: read from {} failed: {}", device, c.endpoint(), e);
                    conn = None;
                    last_attempt = Some(Instant::now());
                    continue;
                }
            };

            if reconnect {
                log::warn!("{}: dropping connection to {}", device, c.endpoint());
                c.close();
                self.decoder.reset();
                conn = None;
                last_attempt = Some(Instant::now());
                continue;
            }

            if c.needs_reopen() {
                // Decode what the peer sent before it left.
                self.drain(c, &mut sink);
                self.decoder.reset();
                conn = None;
                last_attempt = Some(Instant::now());
            }
        }

        if let Some(mut c) = conn {
            let bye = self.decoder.close_request();
            self.send_all(&mut c, bye);
            c.close();
        }
        log::info!("{} worker exited", device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::input::InputValue;
    use crate::vruidd;
    use crate::wire::{Endian, Writer};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn options() -> RuntimeOptions {
        RuntimeOptions {
            poll_interval: Duration::from_millis(1),
            reconnect_delay: Duration::from_millis(20),
            ..RuntimeOptions::default()
        }
    }

    fn vruidd_config(port: u16) -> DeviceConfig {
        vruidd_config_with(port, 1)
    }

    fn vruidd_config_with(port: u16, protocol: u32) -> DeviceConfig {
        let text = format!(
            r#"inputdevice "vd" = {{
                type = "vruidd";
                args = "host = 127.0.0.1; port = {}; protocol = {}";
                input "trigger" = "switch(button[0])";
            }}"#,
            port, protocol
        );
        BridgeConfig::parse(&text).unwrap().devices.remove(0)
    }

    fn accept_within(listener: &TcpListener, limit: Duration) -> std::net::TcpStream {
        listener.set_nonblocking(true).unwrap();
        let deadline = Instant::now() + limit;
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).unwrap();
                    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
                    return stream;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("no connection: {}", e),
            }
        }
    }

    #[test]
    fn test_worker_streams_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = crossbeam_channel::bounded(16);
        let worker = DeviceWorker::spawn(vruidd_config(port), options(), tx).unwrap();

        let (mut server, _) = listener.accept().unwrap();
        server.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut request = [0u8; 6];
        server.read_exact(&mut request).unwrap();
        assert_eq!(request, [0, 0, 1, 0, 0, 0]);

        // Protocol 1 reply: no trackers, one button, no valuators.
        let mut w = Writer::new(Endian::Little);
        w.u16(vruidd::CONNECT_REPLY).u32(1).u32(0).u32(1).u32(0);
        server.write_all(&w.finish()).unwrap();
        let mut start = [0u8; 4];
        server.read_exact(&mut start).unwrap();
        assert_eq!(start, [3, 0, 7, 0]);

        let mut w = Writer::new(Endian::Little);
        w.u16(vruidd::PACKET_REPLY).bytes(&[1]);
        server.write_all(&w.finish()).unwrap();

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            InputEvent::Input { name, value, .. } => {
                assert_eq!(name, "trigger");
                assert_eq!(value, InputValue::Switch(true));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(worker.input("trigger").unwrap().get(), InputValue::Switch(true));

        worker.stop();
        let mut rest = Vec::new();
        let _ = server.read_to_end(&mut rest);
        assert_eq!(rest, vec![8, 0, 4, 0, 2, 0]);
    }

    #[test]
    fn test_unframeable_stream_reopens_and_repeats_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, _rx) = crossbeam_channel::bounded(16);
        let worker = DeviceWorker::spawn(vruidd_config_with(port, 2), options(), tx).unwrap();

        let mut first = accept_within(&listener, Duration::from_secs(2));
        let mut request = [0u8; 6];
        first.read_exact(&mut request).unwrap();
        assert_eq!(request, [0, 0, 2, 0, 0, 0]);

        // A connect reply whose first device name never ends fills the buffer.
        let mut w = Writer::new(Endian::Little);
        w.u16(vruidd::CONNECT_REPLY).u32(2).u32(0).u32(1).u32(0).u32(1).u32(0x7fff_ffff);
        w.bytes(&vec![b'x'; vruidd::BUFFER_SIZE + 512]);
        first.write_all(&w.finish()).unwrap();

        let mut second = accept_within(&listener, Duration::from_secs(2));
        let mut request = [0u8; 6];
        second.read_exact(&mut request).unwrap();
        assert_eq!(request, [0, 0, 2, 0, 0, 0]);
        assert!(worker.is_active());
        worker.stop();
    }

    #[test]
    fn test_oversized_layout_drops_connection_and_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, _rx) = crossbeam_channel::bounded(16);
        let worker = DeviceWorker::spawn(vruidd_config(port), options(), tx).unwrap();

        let mut first = accept_within(&listener, Duration::from_secs(2));
        let mut request = [0u8; 6];
        first.read_exact(&mut request).unwrap();

        let mut w = Writer::new(Endian::Little);
        w.u16(vruidd::CONNECT_REPLY).u32(1).u32(u32::MAX).u32(0).u32(0);
        first.write_all(&w.finish()).unwrap();

        // No activate request follows; the worker hangs up and dials again.
        let mut rest = Vec::new();
        let _ = first.read_to_end(&mut rest);
        assert!(rest.is_empty());

        let mut second = accept_within(&listener, Duration::from_secs(2));
        second.read_exact(&mut request).unwrap();
        assert_eq!(request, [0, 0, 1, 0, 0, 0]);
        worker.stop();
    }

    #[test]
    fn test_unreachable_server_does_not_fail_spawn() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (tx, _rx) = crossbeam_channel::bounded(16);
        let worker = DeviceWorker::spawn(vruidd_config(port), options(), tx).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(worker.is_active());
        let started = Instant::now();
        worker.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
