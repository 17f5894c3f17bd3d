//! # trackbridge - VR tracking protocol bridge
//!
//! Connects to tracking servers and exposes their data as named logical
//! inputs. Provides:
//! - DTrack line-ASCII records over UDP
//! - Vrui VRDeviceDaemon binary streams over TCP
//! - VRPN tagged binary messages over TCP, plus valuator-driven simulated sensors
//! - Calibration into a common coordinate frame, change events and a C FFI
//!
//! ## Quick Start
//! ```no_run
//! use trackbridge::{Bridge, InputEvent};
//! use std::time::Duration;
//!
//! let bridge = Bridge::open(r#"
//!     inputdevice "dtrack" = {
//!         type = "dtrack";
//!         args = "port = 5000";
//!         input "head" = "6sensor(6d[0])";
//!         input "trigger" = "switch(fs2[0, 0])";
//!     }
//! "#).unwrap();
//!
//! for _ in 0..100 {
//!     if let Ok(InputEvent::Input { name, value, .. }) = bridge.recv_timeout(Duration::from_secs(1)) {
//!         println!("{} = {:?}", name, value);
//!     }
//! }
//! println!("head: {:?}", bridge.sensor6("head").unwrap().pose.translation);
//! ```

pub mod error;
pub mod types;
pub mod pose;
pub mod wire;
pub mod connector;
pub mod decoder;
pub mod dtrack;
pub mod vruidd;
pub mod vrpn;
pub mod calibration;
pub mod input;
pub mod channel_map;
pub mod config;
pub mod sim6;
pub mod dispatcher;
pub mod device;
pub mod bridge;
pub mod ffi;

pub use bridge::Bridge;
pub use config::{BridgeConfig, RuntimeOptions};
pub use dispatcher::InputEvent;
pub use error::BridgeError;
pub use input::{InputValue, Sensor6State};
pub use types::*;

/// Result type alias for trackbridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
