//! Print input events from a bridge configuration to stdout.
//!
//! Usage: cargo run --example monitor -- bridge.cfg
//! Press Ctrl+C to stop.

use std::time::{Duration, Instant};
use trackbridge::{Bridge, BridgeError, InputEvent, InputValue};

fn main() {
    env_logger::init();

    let path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            eprintln!("Usage: monitor <config file>");
            std::process::exit(2);
        }
    };
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to read {}: {}", path, e);
            std::process::exit(1);
        }
    };

    let bridge = match Bridge::open(&text) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Failed to start bridge: {}", e);
            std::process::exit(1);
        }
    };

    println!("Devices: {}", bridge.devices().collect::<Vec<_>>().join(", "));
    println!("Inputs:  {}", bridge.input_names().collect::<Vec<_>>().join(", "));
    println!();

    let start = Instant::now();
    let mut count: u64 = 0;
    let mut last_report = Instant::now();

    loop {
        match bridge.recv_timeout(Duration::from_secs(2)) {
            Ok(event) => {
                count += 1;
                match event {
                    InputEvent::Input { device, name, value } => match value {
                        InputValue::Switch(on) => println!("{}/{} = {}", device, name, on),
                        InputValue::Valuator(v) => println!("{}/{} = {:+.3}", device, name, v),
                        InputValue::Sensor6(s) => {
                            let t = s.pose.translation;
                            let e = s.pose.euler_deg();
                            println!(
                                "{}/{} pos=[{:+.3}, {:+.3}, {:+.3}] rpy=[{:+.1}, {:+.1}, {:+.1}]{}{}",
                                device,
                                name,
                                t[0],
                                t[1],
                                t[2],
                                e[0],
                                e[1],
                                e[2],
                                if s.active { "" } else { " (inactive)" },
                                if s.out_of_bounds { " (out of bounds)" } else { "" },
                            );
                        }
                    },
                    InputEvent::Velocity { device, sender, report } => {
                        println!("{} sender {} velocity {:?}", device, sender, report.velocity);
                    }
                }

                let now = Instant::now();
                if now.duration_since(last_report) >= Duration::from_secs(5) {
                    let elapsed = start.elapsed().as_secs_f64();
                    println!("--- {} events in {:.1}s ({:.1}/s) ---", count, elapsed, count as f64 / elapsed);
                    last_report = now;
                }
            }
            Err(BridgeError::Timeout) => eprintln!("No events in the last 2s"),
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        }
    }
}
