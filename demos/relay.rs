//! Relay 6-sensor poses from a bridge to WebSocket clients as JSON.
//!
//! Usage:
//!   cargo run --example relay -- bridge.cfg
//!   Connect a WebSocket client to ws://localhost:8090

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use trackbridge::{Bridge, BridgeError, InputEvent, InputValue};
use tungstenite::Message;

const PORT: u16 = 8090;

type WsClient = Arc<Mutex<tungstenite::WebSocket<TcpStream>>>;

fn main() {
    env_logger::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Usage: relay <config file>");
        std::process::exit(2);
    });
    let text = std::fs::read_to_string(&path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path, e);
        std::process::exit(1);
    });
    let bridge = Bridge::open(&text).unwrap_or_else(|e| {
        eprintln!("Failed to start bridge: {}", e);
        std::process::exit(1);
    });

    let clients: Arc<Mutex<Vec<WsClient>>> = Arc::new(Mutex::new(Vec::new()));
    let running = Arc::new(AtomicBool::new(true));

    let relay_clients = clients.clone();
    let relay_running = running.clone();
    let relay_thread = std::thread::Builder::new()
        .name("trackbridge-relay".into())
        .spawn(move || relay_loop(bridge, relay_clients, relay_running))
        .unwrap_or_else(|e| {
            eprintln!("Failed to spawn relay thread: {}", e);
            std::process::exit(1);
        });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", PORT)).unwrap_or_else(|e| {
        eprintln!("Failed to bind port {}: {}", PORT, e);
        std::process::exit(1);
    });
    eprintln!("[WS] Listening on ws://localhost:{}", PORT);

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                eprintln!("[TCP] accept error: {}", e);
                continue;
            }
        };
        // Write timeout keeps a slow client from stalling the relay.
        stream.set_write_timeout(Some(Duration::from_secs(2))).ok();
        stream.set_nodelay(true).ok();
        match tungstenite::accept(stream) {
            Ok(ws) => {
                let mut list = clients.lock().unwrap_or_else(PoisonError::into_inner);
                list.push(Arc::new(Mutex::new(ws)));
                eprintln!("[WS] Client connected ({} total)", list.len());
            }
            Err(e) => eprintln!("[WS] handshake error: {}", e),
        }
    }

    running.store(false, Ordering::Relaxed);
    let _ = relay_thread.join();
}

fn relay_loop(bridge: Bridge, clients: Arc<Mutex<Vec<WsClient>>>, running: Arc<AtomicBool>) {
    let mut count: u64 = 0;
    let mut last_report = Instant::now();

    while running.load(Ordering::Relaxed) {
        let event = match bridge.recv_timeout(Duration::from_secs(2)) {
            Ok(e) => e,
            Err(BridgeError::Timeout) => continue,
            Err(e) => {
                eprintln!("[BRIDGE] Error: {}", e);
                break;
            }
        };

        let json = match event {
            InputEvent::Input {
                device,
                name,
                value: InputValue::Sensor6(s),
            } => {
                let t = s.pose.translation;
                let q = s.pose.quaternion();
                format!(
                    "{{\"device\":\"{}\",\"name\":\"{}\",\"x\":{:.4},\"y\":{:.4},\"z\":{:.4},\"qx\":{:.4},\"qy\":{:.4},\"qz\":{:.4},\"qw\":{:.4},\"active\":{}}}",
                    device, name, t[0], t[1], t[2], q[0], q[1], q[2], q[3], s.active
                )
            }
            InputEvent::Input {
                device,
                name,
                value: InputValue::Switch(on),
            } => format!("{{\"device\":\"{}\",\"name\":\"{}\",\"switch\":{}}}", device, name, on),
            InputEvent::Input {
                device,
                name,
                value: InputValue::Valuator(v),
            } => format!("{{\"device\":\"{}\",\"name\":\"{}\",\"valuator\":{:.4}}}", device, name, v),
            InputEvent::Velocity { .. } => continue,
        };

        let msg = Message::Text(json);
        let mut list = clients.lock().unwrap_or_else(PoisonError::into_inner);
        list.retain(|ws| {
            let mut ws = ws.lock().unwrap_or_else(PoisonError::into_inner);
            ws.send(msg.clone()).is_ok()
        });
        let connected = list.len();
        drop(list);
        count += 1;

        if last_report.elapsed() >= Duration::from_secs(5) {
            eprintln!(
                "[BRIDGE] {} events/s, {} client(s)",
                (count as f64 / last_report.elapsed().as_secs_f64()) as u32,
                connected
            );
            count = 0;
            last_report = Instant::now();
        }
    }
    bridge.stop();
}
