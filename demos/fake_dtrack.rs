//! Send synthetic DTrack records over UDP: a head circling and a wand
//! whose trigger toggles every second.
//!
//! Usage: cargo run --example fake_dtrack -- [host:port]   (default 127.0.0.1:5000)

use std::net::UdpSocket;
use std::time::{Duration, Instant};
use trackbridge::dtrack::{AxisRemap, BodyEntry, FlystickEntry, RecordWriter};
use trackbridge::pose::{self, IDENTITY};
use trackbridge::Axis;

fn main() {
    env_logger::init();

    let target = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:5000".to_string());
    let socket = match UdpSocket::bind("0.0.0.0:0") {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to bind UDP socket: {}", e);
            std::process::exit(1);
        }
    };
    println!("Sending DTrack records to {} at 60 Hz (Ctrl+C to stop)...", target);

    let start = Instant::now();
    let mut writer = RecordWriter::new(AxisRemap::None);
    let mut frame: u32 = 0;

    loop {
        let t = start.elapsed().as_secs_f64();
        let angle = (t * 45.0) % 360.0;
        let (s, c) = angle.to_radians().sin_cos();

        let head = BodyEntry {
            id: 0,
            quality: 1.0,
            position: [500.0 * c, 1700.0, 500.0 * s],
            rotation: pose::axis_rotation(Axis::Y, -angle),
        };
        let wand = FlystickEntry {
            id: 0,
            quality: 1.0,
            position: [200.0, 1200.0, -300.0],
            rotation: IDENTITY,
            buttons: vec![(t as u64) % 2 == 0, false, false, false, false, false],
            controllers: vec![c, s],
        };

        let text = writer
            .frame(frame)
            .timestamp(t)
            .bodies(&[head])
            .flysticks(&[wand])
            .finish();
        if let Err(e) = socket.send_to(text.as_bytes(), &target) {
            eprintln!("Send failed: {}", e);
        }

        frame = frame.wrapping_add(1);
        if frame % 300 == 0 {
            println!("--- {} frames in {:.1}s ---", frame, t);
        }
        std::thread::sleep(Duration::from_millis(16));
    }
}
