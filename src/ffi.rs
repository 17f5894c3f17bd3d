//! C FFI layer for trackbridge.
//!
//! Provides an opaque handle-based API for C/C++ consumers.
//! The generated C header is written to `include/trackbridge.h` by cbindgen.

use crate::bridge::Bridge;
use crate::dispatcher::InputEvent;
use crate::error::{BridgeError, LastError};
use crate::input::{InputValue, Sensor6State};
use crate::types::ControlValue;
use crate::Result;
use std::ffi::{c_char, c_int, CStr};
use std::time::Duration;

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

/// Opaque bridge handle for C consumers.
pub struct TbBridge(Bridge);

/// 6-sensor state in C-compatible layout.
#[repr(C)]
pub struct TbSensor6 {
    /// Translation [x, y, z] in bridge units.
    pub translation: [f64; 3],
    /// Rotation matrix, flat row-major (9 elements).
    pub rotation: [f64; 9],
    /// Quaternion [qx, qy, qz, qw].
    pub quaternion: [f64; 4],
    /// Euler angles [roll, pitch, yaw] in degrees.
    pub euler_deg: [f64; 3],
    pub active: bool,
    pub out_of_bounds: bool,
}

/// Input change in C-compatible layout.
#[repr(C)]
pub struct TbEvent {
    /// Null-terminated device name.
    pub device: [c_char; 64],
    /// Null-terminated input name; empty for velocity events.
    pub name: [c_char; 64],
    /// 0 = switch, 1 = valuator, 2 = 6-sensor, 3 = velocity.
    pub kind: c_int,
    pub switch_value: bool,
    pub valuator_value: f64,
    pub sensor: TbSensor6,
    /// Velocity events: VRPN sender slot.
    pub sender: u8,
    /// Velocity events: linear velocity [x, y, z].
    pub velocity: [f64; 3],
}

pub const TB_CONTROL_SWITCH: c_int = 0;
pub const TB_CONTROL_VALUE: c_int = 1;

fn str_to_fixed<const N: usize>(s: &str) -> [c_char; N] {
    let mut buf = [0 as c_char; N];
    let bytes = s.as_bytes();
    let len = bytes.len().min(N - 1);
    for (i, &b) in bytes[..len].iter().enumerate() {
        buf[i] = b as c_char;
    }
    buf
}

fn sensor_to_c(state: &Sensor6State) -> TbSensor6 {
    let r = &state.pose.rotation;
    TbSensor6 {
        translation: state.pose.translation,
        rotation: [
            r[0][0], r[0][1], r[0][2], r[1][0], r[1][1], r[1][2], r[2][0], r[2][1], r[2][2],
        ],
        quaternion: state.pose.quaternion(),
        euler_deg: state.pose.euler_deg(),
        active: state.active,
        out_of_bounds: state.out_of_bounds,
    }
}

fn event_to_c(event: &InputEvent) -> TbEvent {
    let mut out = TbEvent {
        device: [0; 64],
        name: [0; 64],
        kind: 0,
        switch_value: false,
        valuator_value: 0.0,
        sensor: sensor_to_c(&Sensor6State::default()),
        sender: 0,
        velocity: [0.0; 3],
    };
    match event {
        InputEvent::Input { device, name, value } => {
            out.device = str_to_fixed(device);
            out.name = str_to_fixed(name);
            match value {
                InputValue::Switch(on) => out.switch_value = *on,
                InputValue::Valuator(v) => {
                    out.kind = 1;
                    out.valuator_value = *v;
                }
                InputValue::Sensor6(state) => {
                    out.kind = 2;
                    out.sensor = sensor_to_c(state);
                }
            }
        }
        InputEvent::Velocity { device, sender, report } => {
            out.device = str_to_fixed(device);
            out.kind = 3;
            out.sender = *sender;
            out.velocity = report.velocity;
        }
    }
    out
}

/// Borrow a C string, recording an error for null or non-UTF-8 input.
unsafe fn c_str<'a>(ptr: *const c_char, what: &str) -> Option<&'a str> {
    if ptr.is_null() {
        LAST_ERROR.set(&BridgeError::Config {
            line: 0,
            message: format!("{} is NULL", what),
        });
        return None;
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(s) => Some(s),
        Err(_) => {
            LAST_ERROR.set(&BridgeError::Config {
                line: 0,
                message: format!("{} is not valid UTF-8", what),
            });
            None
        }
    }
}

fn report<T>(result: Result<T>, write: impl FnOnce(T)) -> c_int {
    match result {
        Ok(value) => {
            write(value);
            0
        }
        Err(e) => {
            LAST_ERROR.set(&e);
            -1
        }
    }
}

/// Parse a configuration text and start its devices.
/// Returns NULL on error (check tb_last_error()).
///
/// # Safety
/// `config_text` must be a null-terminated string, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_bridge_open(config_text: *const c_char) -> *mut TbBridge {
    let Some(text) = c_str(config_text, "config_text") else {
        return std::ptr::null_mut();
    };
    match Bridge::open(text) {
        Ok(bridge) => {
            LAST_ERROR.clear();
            Box::into_raw(Box::new(TbBridge(bridge)))
        }
        Err(e) => {
            LAST_ERROR.set(&e);
            std::ptr::null_mut()
        }
    }
}

/// Stop every device and free the bridge.
///
/// # Safety
/// `bridge` must be a pointer returned by `tb_bridge_open`, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_bridge_close(bridge: *mut TbBridge) {
    if !bridge.is_null() {
        drop(Box::from_raw(bridge));
    }
}

/// Read a switch input. Returns 0 on success, -1 on error.
///
/// # Safety
/// `bridge` must be a valid bridge pointer; `name` a null-terminated
/// string; `out` a writable bool. Any may be null.
#[no_mangle]
pub unsafe extern "C" fn tb_switch(bridge: *const TbBridge, name: *const c_char, out: *mut bool) -> c_int {
    if bridge.is_null() || out.is_null() {
        return -1;
    }
    let Some(name) = c_str(name, "name") else {
        return -1;
    };
    report((*bridge).0.switch(name), |v| out.write(v))
}

/// Read a valuator input. Returns 0 on success, -1 on error.
///
/// # Safety
/// `bridge` must be a valid bridge pointer; `name` a null-terminated
/// string; `out` a writable double. Any may be null.
#[no_mangle]
pub unsafe extern "C" fn tb_valuator(bridge: *const TbBridge, name: *const c_char, out: *mut f64) -> c_int {
    if bridge.is_null() || out.is_null() {
        return -1;
    }
    let Some(name) = c_str(name, "name") else {
        return -1;
    };
    report((*bridge).0.valuator(name), |v| out.write(v))
}

/// Read a 6-sensor input. Returns 0 on success, -1 on error.
///
/// # Safety
/// `bridge` must be a valid bridge pointer; `name` a null-terminated
/// string; `out` a writable `TbSensor6`. Any may be null.
#[no_mangle]
pub unsafe extern "C" fn tb_sensor6(bridge: *const TbBridge, name: *const c_char, out: *mut TbSensor6) -> c_int {
    if bridge.is_null() || out.is_null() {
        return -1;
    }
    let Some(name) = c_str(name, "name") else {
        return -1;
    };
    report((*bridge).0.sensor6(name), |state| out.write(sensor_to_c(&state)))
}

/// Queue a control action on a device.
/// `kind`: `TB_CONTROL_SWITCH` (value != 0 means pressed) or `TB_CONTROL_VALUE`.
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// `bridge` must be a valid bridge pointer; `device` and `action`
/// null-terminated strings. Any may be null.
#[no_mangle]
pub unsafe extern "C" fn tb_control(
    bridge: *const TbBridge,
    device: *const c_char,
    action: *const c_char,
    kind: c_int,
    value: f64,
) -> c_int {
    if bridge.is_null() {
        return -1;
    }
    let (Some(device), Some(action)) = (c_str(device, "device"), c_str(action, "action")) else {
        return -1;
    };
    let payload = if kind == TB_CONTROL_SWITCH {
        ControlValue::Switch(value != 0.0)
    } else {
        ControlValue::Value(value)
    };
    report((*bridge).0.control(device, action, payload), |_| ())
}

/// Receive the next input event with timeout.
/// `timeout_ms`: timeout in milliseconds (0 = try without blocking, -1 = block forever).
/// Returns 0 on success, -1 on error/timeout.
///
/// # Safety
/// `bridge` and `event` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn tb_recv(bridge: *const TbBridge, event: *mut TbEvent, timeout_ms: c_int) -> c_int {
    if bridge.is_null() || event.is_null() {
        return -1;
    }
    let bridge = &(*bridge).0;

    let result = if timeout_ms == 0 {
        bridge.try_recv().ok_or(BridgeError::Timeout)
    } else if timeout_ms < 0 {
        bridge.recv()
    } else {
        bridge.recv_timeout(Duration::from_millis(timeout_ms as u64))
    };
    report(result, |e| event.write(event_to_c(&e)))
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next trackbridge API call.
#[no_mangle]
pub extern "C" fn tb_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    const CONFIG: &str = r#"
        inputdevice "vd" = {
            type = "vruidd";
            args = "host = 127.0.0.1; port = 1";
            input "trigger" = "switch(button[0])";
            input "head" = "6sensor(tracker[0])";
        }
    "#;

    #[test]
    fn test_open_read_close() {
        let text = CString::new(CONFIG).unwrap();
        let name = CString::new("trigger").unwrap();
        let head = CString::new("head").unwrap();
        let missing = CString::new("nope").unwrap();
        unsafe {
            let bridge = tb_bridge_open(text.as_ptr());
            assert!(!bridge.is_null());

            let mut on = true;
            assert_eq!(tb_switch(bridge, name.as_ptr(), &mut on), 0);
            assert!(!on);

            let mut value = 1.0;
            assert_eq!(tb_valuator(bridge, name.as_ptr(), &mut value), -1);
            assert!(!tb_last_error().is_null());
            assert_eq!(tb_valuator(bridge, missing.as_ptr(), &mut value), -1);

            let mut sensor = sensor_to_c(&Sensor6State::default());
            sensor.active = true;
            assert_eq!(tb_sensor6(bridge, head.as_ptr(), &mut sensor), 0);
            assert!(!sensor.active);
            assert_eq!(sensor.quaternion, [0.0, 0.0, 0.0, 1.0]);

            let device = CString::new("vd").unwrap();
            let action = CString::new("print_input").unwrap();
            assert_eq!(tb_control(bridge, device.as_ptr(), action.as_ptr(), TB_CONTROL_SWITCH, 1.0), 0);
            assert_eq!(tb_switch(bridge, std::ptr::null(), &mut on), -1);

            tb_bridge_close(bridge);
        }
    }

    #[test]
    fn test_open_rejects_bad_config() {
        let text = CString::new("inputdevice \"x\" = { args = \"\"; }").unwrap();
        unsafe {
            assert!(tb_bridge_open(text.as_ptr()).is_null());
            assert!(tb_bridge_open(std::ptr::null()).is_null());
        }
        assert!(!tb_last_error().is_null());
    }

    #[test]
    fn test_event_layout() {
        let event = InputEvent::Input {
            device: "dt".to_string(),
            name: "joy".to_string(),
            value: InputValue::Valuator(0.5),
        };
        let c = event_to_c(&event);
        assert_eq!(c.kind, 1);
        assert_eq!(c.valuator_value, 0.5);
        assert_eq!(c.device[0], b'd' as c_char);
        assert_eq!(c.name[3], 0);
    }
}
