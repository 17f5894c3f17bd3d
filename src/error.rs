use std::fmt;

/// Errors surfaced by the bridge.
///
/// Most protocol-level trouble never reaches the host as an error: malformed
/// records are skipped and configuration problems are logged as warnings.
/// What remains are failures the caller has to act on.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot resolve address {0}")]
    Resolve(String),

    #[error("Receive buffer full ({0} bytes) before a complete frame arrived")]
    FrameTooLarge(usize),

    #[error("Connection closed by peer")]
    PeerClosed,

    #[error("Configuration error at line {line}: {message}")]
    Config { line: usize, message: String },

    #[error("Unknown device type '{0}'")]
    UnknownFamily(String),

    #[error("No device named '{0}'")]
    UnknownDevice(String),

    #[error("No logical input named '{0}'")]
    UnknownInput(String),

    #[error("Input '{name}' is a {actual}, not a {expected}")]
    KindMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Failed to spawn device thread: {0}")]
    Spawn(String),

    #[error("Event stream stopped")]
    StreamStopped,

    #[error("Timeout waiting for data")]
    Timeout,

    #[error("Channel disconnected")]
    ChannelDisconnected,
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &BridgeError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut msg) = self.message.lock() {
            msg.clear();
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}
