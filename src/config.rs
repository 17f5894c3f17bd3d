//! Configuration text, per-family device arguments and environment
//! overrides.
//!
//! ```text
//! inputdevice "tracker" = {
//!     type = "dtrack";
//!     args = "port = 5000; remap = zup2yup; calib.fs2 = 0 -90 0";
//!     input "head" = "6sensor(6d[0])";
//!     input "wand" = "6sensor(fs2[0, r2e])";
//!     control "print_context" = "switch(fs2[0, 5])";
//! }
//! ```

use crate::calibration::{CalibrationSpec, DeviceCalibration};
use crate::connector::Endpoint;
use crate::dtrack::{self, AxisRemap};
use crate::error::BridgeError;
use crate::sim6::Sim6Options;
use crate::types::{Axis, BodyType, Family, InputKind, Sim6Flags};
use crate::{vrpn, vruidd, Result};
use std::time::Duration;

// -- Environment overrides --
pub const ENV_POLL_INTERVAL_MS: &str = "TRACKBRIDGE_POLL_INTERVAL_MS";
pub const ENV_RECONNECT_MS: &str = "TRACKBRIDGE_RECONNECT_MS";
pub const ENV_EVENT_QUEUE: &str = "TRACKBRIDGE_EVENT_QUEUE";
pub const ENV_LOG_RAW: &str = "TRACKBRIDGE_LOG_RAW";

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2;
pub const DEFAULT_RECONNECT_MS: u64 = 1000;
pub const DEFAULT_EVENT_QUEUE: u64 = 256;

/// Parse the boolean spellings accepted in arguments and environment.
pub fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

pub fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Process-wide runtime knobs, read from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub event_queue: usize,
    pub log_raw: bool,
}

impl RuntimeOptions {
    pub fn from_env() -> RuntimeOptions {
        RuntimeOptions {
            poll_interval: Duration::from_millis(read_env_u64(ENV_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS).max(1)),
            reconnect_delay: Duration::from_millis(read_env_u64(ENV_RECONNECT_MS, DEFAULT_RECONNECT_MS)),
            event_queue: read_env_u64(ENV_EVENT_QUEUE, DEFAULT_EVENT_QUEUE).max(1) as usize,
            log_raw: read_env_bool(ENV_LOG_RAW, false),
        }
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_MS),
            event_queue: DEFAULT_EVENT_QUEUE as usize,
            log_raw: false,
        }
    }
}

/// `input "<name>" = "<kind>(<source>)"`.
#[derive(Debug, Clone, PartialEq)]
pub struct InputDecl {
    pub name: String,
    pub kind: InputKind,
    pub source: String,
    pub line: usize,
}

/// `control "<action>" = "<kind>(<source>)"`.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlDecl {
    pub action: String,
    pub kind: InputKind,
    pub source: String,
    pub line: usize,
}

/// Split `"<kind>(<source>)"`.
pub fn parse_binding(text: &str) -> std::result::Result<(InputKind, String), String> {
    let text = text.trim();
    let open = text.find('(').ok_or_else(|| format!("'{}' is not kind(source)", text))?;
    let close = text
        .rfind(')')
        .filter(|&c| c > open)
        .ok_or_else(|| format!("'{}' is missing ')'", text))?;
    let kind_name = &text[..open];
    let kind = InputKind::from_name(kind_name).ok_or_else(|| format!("unknown input kind '{}'", kind_name.trim()))?;
    Ok((kind, text[open + 1..close].trim().to_string()))
}

/// `key = value; key = value` argument list of one device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceArgs {
    entries: Vec<(String, String)>,
}

impl DeviceArgs {
    pub fn parse(text: &str) -> DeviceArgs {
        let mut entries = Vec::new();
        for item in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            match item.split_once('=') {
                Some((key, value)) => {
                    entries.push((key.trim().to_ascii_lowercase(), value.trim().to_string()))
                }
                None => log::warn!("Ignoring argument '{}' without a value", item),
            }
        }
        DeviceArgs { entries }
    }

    /// Last value given for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match value.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("Argument {} = '{}' is not valid, using the default", key, value);
                None
            }
        }
    }

    fn flag(&self, key: &str) -> Option<bool> {
        let value = self.get(key)?;
        let parsed = parse_bool(value);
        if parsed.is_none() {
            log::warn!("Argument {} = '{}' is not on/off, using the default", key, value);
        }
        parsed
    }

    fn floats(&self, key: &str) -> Option<Vec<f64>> {
        let value = self.get(key)?;
        let parsed: std::result::Result<Vec<f64>, _> = value
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(str::parse)
            .collect();
        match parsed {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("Argument {} = '{}' is not a list of numbers", key, value);
                None
            }
        }
    }

    fn calibration(&self, key: &str, scale: f64) -> Option<CalibrationSpec> {
        let value = self.get(key)?;
        let spec = CalibrationSpec::parse_hpr_xyz(scale, value);
        if spec.is_none() {
            log::warn!("Argument {} = '{}' is not 'h p r x y z'", key, value);
        }
        spec
    }

    fn warn_unknown(&self, device: &str, known: &[&str]) {
        for key in self.keys() {
            if !known.contains(&key) {
                log::warn!("{}: unknown argument '{}'", device, key);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DtrackSettings {
    pub port: u16,
    pub cmd_host: String,
    pub cmd_port: u16,
    pub scale: f64,
    pub valuator_scale: f64,
    pub remap: AxisRemap,
    pub calibration: DeviceCalibration,
    pub start_commands: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VruiddSettings {
    pub host: String,
    pub port: u16,
    pub protocol: u32,
    pub scale: f64,
    pub valuator_scale: f64,
    pub calibration: DeviceCalibration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VrpnSettings {
    pub host: String,
    pub port: u16,
    pub scale: f64,
    pub valuator_scale: f64,
    pub calibration: DeviceCalibration,
    pub sim6: Sim6Options,
}

/// Family-specific connection settings of one device.
#[derive(Debug, Clone, PartialEq)]
pub enum FamilySettings {
    Dtrack(DtrackSettings),
    Vruidd(VruiddSettings),
    Vrpn(VrpnSettings),
}

const DTRACK_ARGS: &[&str] = &[
    "port", "cmdhost", "cmdport", "transscale", "scale", "valscale", "remap", "calib", "calib.6d",
    "calib.fs2", "startcmds",
];
const VRUIDD_ARGS: &[&str] = &["host", "port", "protocol", "transscale", "scale", "valscale", "calib"];
const VRPN_ARGS: &[&str] = &[
    "host", "hostname", "port", "transscale", "scale", "valscale", "calib", "restrict",
    "valuatoroverride", "returntozero", "relativerot", "swaptransrot", "swap_yz", "workingvolume",
    "transscale_sim", "rotscale", "azimuth",
];

fn trans_scale(args: &DeviceArgs, default: f64) -> f64 {
    args.parsed("transscale")
        .or_else(|| args.parsed("scale"))
        .unwrap_or(default)
}

fn uniform_calibration(args: &DeviceArgs, scale: f64) -> DeviceCalibration {
    DeviceCalibration::uniform(
        args.calibration("calib", scale)
            .unwrap_or_else(|| CalibrationSpec::scaled(scale)),
    )
}

fn sim6_options(args: &DeviceArgs) -> Sim6Options {
    let mut options = Sim6Options::default();
    let mut set = |flag: Sim6Flags, key: &str| {
        if let Some(on) = args.flag(key) {
            options.flags.set(flag, on);
        }
    };
    set(Sim6Flags::RESTRICT_SPACE, "restrict");
    set(Sim6Flags::IGNORE_TRANS, "valuatoroverride");
    set(Sim6Flags::RETURN_TO_ZERO, "returntozero");
    set(Sim6Flags::RELATIVE_AXIS, "relativerot");
    set(Sim6Flags::SWAP_TRANSROT, "swaptransrot");
    set(Sim6Flags::SWAP_YZ, "swap_yz");

    if let Some(volume) = args.floats("workingvolume") {
        if volume.len() == 6 {
            options.volume_min = [volume[0], volume[2], volume[4]];
            options.volume_max = [volume[1], volume[3], volume[5]];
        } else {
            log::warn!("workingvolume needs 6 values (xmin xmax ymin ymax zmin zmax), got {}", volume.len());
        }
    }
    if let Some(scale) = args.parsed("transscale_sim") {
        options.trans_scale = scale;
    }
    if let Some(scale) = args.parsed("rotscale") {
        options.rot_scale = scale;
    }
    if let Some(axis) = args.get("azimuth") {
        match axis.trim().to_ascii_lowercase().as_str() {
            "x" => options.azimuth_axis = Axis::X,
            "y" => options.azimuth_axis = Axis::Y,
            "z" => options.azimuth_axis = Axis::Z,
            other => log::warn!("azimuth axis '{}' is not x, y or z", other),
        }
    }
    options
}

impl FamilySettings {
    /// Build settings from a device's argument list, warning about and
    /// defaulting anything that does not parse.
    pub fn from_args(device: &str, family: Family, args: &DeviceArgs) -> FamilySettings {
        match family {
            Family::Dtrack => {
                args.warn_unknown(device, DTRACK_ARGS);
                let scale = trans_scale(args, dtrack::SCALE_MM_TO_FEET);
                let remap = match args.get("remap") {
                    Some(name) => AxisRemap::from_name(name).unwrap_or_else(|| {
                        log::warn!("{}: unknown remap '{}', using none", device, name);
                        AxisRemap::None
                    }),
                    None => AxisRemap::None,
                };
                let mut calibration = uniform_calibration(args, scale);
                for body in [BodyType::Standard, BodyType::Flystick] {
                    let key = format!("calib.{}", body.name());
                    if let Some(spec) = args.calibration(&key, scale) {
                        calibration.set_body(body, spec);
                    }
                }
                FamilySettings::Dtrack(DtrackSettings {
                    port: args.parsed("port").unwrap_or(dtrack::DEFAULT_DATA_PORT),
                    cmd_host: args
                        .get("cmdhost")
                        .unwrap_or(dtrack::DEFAULT_CMD_HOST)
                        .to_string(),
                    cmd_port: args.parsed("cmdport").unwrap_or(dtrack::DEFAULT_CMD_PORT),
                    scale,
                    valuator_scale: args.parsed("valscale").unwrap_or(1.0),
                    remap,
                    calibration,
                    start_commands: args.flag("startcmds").unwrap_or(false),
                })
            }
            Family::Vruidd => {
                args.warn_unknown(device, VRUIDD_ARGS);
                let scale = trans_scale(args, vruidd::SCALE_INCH_TO_FEET);
                FamilySettings::Vruidd(VruiddSettings {
                    host: args.get("host").unwrap_or(vruidd::DEFAULT_HOST).to_string(),
                    port: args.parsed("port").unwrap_or(vruidd::DEFAULT_PORT),
                    protocol: args.parsed("protocol").unwrap_or(vruidd::DEFAULT_PROTOCOL),
                    scale,
                    valuator_scale: args.parsed("valscale").unwrap_or(1.0),
                    calibration: uniform_calibration(args, scale),
                })
            }
            Family::Vrpn => {
                args.warn_unknown(device, VRPN_ARGS);
                let scale = trans_scale(args, vrpn::SCALE_METERS_TO_FEET);
                FamilySettings::Vrpn(VrpnSettings {
                    host: args
                        .get("host")
                        .or_else(|| args.get("hostname"))
                        .unwrap_or(vrpn::DEFAULT_HOST)
                        .to_string(),
                    port: args.parsed("port").unwrap_or(vrpn::DEFAULT_PORT),
                    scale,
                    valuator_scale: args.parsed("valscale").unwrap_or(1.0),
                    calibration: uniform_calibration(args, scale),
                    sim6: sim6_options(args),
                })
            }
        }
    }

    pub fn family(&self) -> Family {
        match self {
            FamilySettings::Dtrack(_) => Family::Dtrack,
            FamilySettings::Vruidd(_) => Family::Vruidd,
            FamilySettings::Vrpn(_) => Family::Vrpn,
        }
    }

    pub fn valuator_scale(&self) -> f64 {
        match self {
            FamilySettings::Dtrack(s) => s.valuator_scale,
            FamilySettings::Vruidd(s) => s.valuator_scale,
            FamilySettings::Vrpn(s) => s.valuator_scale,
        }
    }

    pub fn calibration(&self) -> DeviceCalibration {
        match self {
            FamilySettings::Dtrack(s) => s.calibration,
            FamilySettings::Vruidd(s) => s.calibration,
            FamilySettings::Vrpn(s) => s.calibration,
        }
    }

    /// Simulated-sensor options; only VRPN devices carry them.
    pub fn sim6_options(&self) -> Option<Sim6Options> {
        match self {
            FamilySettings::Vrpn(s) => Some(s.sim6),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        match self {
            FamilySettings::Dtrack(s) => Endpoint::Udp {
                port: s.port,
                command: s
                    .start_commands
                    .then(|| (s.cmd_host.clone(), s.cmd_port)),
            },
            FamilySettings::Vruidd(s) => Endpoint::Tcp {
                host: s.host.clone(),
                port: s.port,
            },
            FamilySettings::Vrpn(s) => Endpoint::Tcp {
                host: s.host.clone(),
                port: s.port,
            },
        }
    }

    pub fn buffer_size(&self) -> usize {
        match self {
            FamilySettings::Dtrack(_) => dtrack::BUFFER_SIZE,
            FamilySettings::Vruidd(_) => vruidd::BUFFER_SIZE,
            FamilySettings::Vrpn(_) => vrpn::BUFFER_SIZE,
        }
    }
}

/// One `inputdevice` block.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    pub family: Family,
    pub args: DeviceArgs,
    pub settings: FamilySettings,
    pub inputs: Vec<InputDecl>,
    pub controls: Vec<ControlDecl>,
}

/// Every device of a configuration text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeConfig {
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Text(String),
    Equals,
    Semicolon,
    Open,
    Close,
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>> {
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '#' => {
                while chars.peek().is_some_and(|&c| c != '\n') {
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'/') => {
                while chars.peek().is_some_and(|&c| c != '\n') {
                    chars.next();
                }
            }
            '=' => tokens.push((Token::Equals, line)),
            ';' => tokens.push((Token::Semicolon, line)),
            '{' => tokens.push((Token::Open, line)),
            '}' => tokens.push((Token::Close, line)),
            '"' => {
                let start = line;
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                s.push(escaped);
                            }
                        }
                        Some('\n') => {
                            line += 1;
                            s.push('\n');
                        }
                        Some(c) => s.push(c),
                        None => {
                            return Err(BridgeError::Config {
                                line: start,
                                message: "unterminated string".to_string(),
                            })
                        }
                    }
                }
                tokens.push((Token::Text(s), start));
            }
            c if c.is_alphanumeric() || c == '_' || c == '.' => {
                let mut word = c.to_string();
                while let Some(&n) = chars.peek() {
                    if n.is_alphanumeric() || n == '_' || n == '.' {
                        word.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Word(word.to_ascii_lowercase()), line));
            }
            other => {
                return Err(BridgeError::Config {
                    line,
                    message: format!("unexpected character '{}'", other),
                })
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, l)| *l)
            .unwrap_or(1)
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(BridgeError::Config {
            line: self.line(),
            message: message.into(),
        })
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn expect(&mut self, want: Token, what: &str) -> Result<()> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            _ => {
                self.pos -= 1;
                self.error(format!("expected {}", what))
            }
        }
    }

    fn text(&mut self, what: &str) -> Result<String> {
        match self.next() {
            Some(Token::Text(s)) => Ok(s),
            _ => {
                self.pos -= 1;
                self.error(format!("expected quoted {}", what))
            }
        }
    }

    fn skip_statement(&mut self) {
        while let Some(t) = self.next() {
            if t == Token::Semicolon {
                break;
            }
        }
    }

    fn device(&mut self) -> Result<DeviceConfig> {
        let name = self.text("device name")?;
        self.expect(Token::Equals, "'='")?;
        self.expect(Token::Open, "'{'")?;

        let mut family = None;
        let mut args_text = String::new();
        let mut inputs = Vec::new();
        let mut controls = Vec::new();

        loop {
            let line = self.line();
            match self.next() {
                Some(Token::Close) => break,
                Some(Token::Semicolon) => continue,
                Some(Token::Word(key)) => match key.as_str() {
                    "type" => {
                        self.expect(Token::Equals, "'=' after type")?;
                        let value = self.text("device type")?;
                        let f = Family::from_name(&value).ok_or(BridgeError::UnknownFamily(value))?;
                        family = Some(f);
                        self.expect(Token::Semicolon, "';'")?;
                    }
                    "args" => {
                        self.expect(Token::Equals, "'=' after args")?;
                        let value = self.text("argument list")?;
                        args_text.push_str(&value);
                        args_text.push(';');
                        self.expect(Token::Semicolon, "';'")?;
                    }
                    "input" | "control" => {
                        let target = self.text("name")?;
                        self.expect(Token::Equals, "'='")?;
                        let binding = self.text("binding")?;
                        self.expect(Token::Semicolon, "';'")?;
                        match parse_binding(&binding) {
                            Ok((kind, source)) if key == "input" => inputs.push(InputDecl {
                                name: target,
                                kind,
                                source,
                                line,
                            }),
                            Ok((kind, source)) => controls.push(ControlDecl {
                                action: target.to_ascii_lowercase(),
                                kind,
                                source,
                                line,
                            }),
                            Err(reason) => log::warn!(
                                "{}: {} '{}' ignored at line {}: {}",
                                name,
                                key,
                                target,
                                line,
                                reason
                            ),
                        }
                    }
                    other => {
                        log::warn!("{}: unknown statement '{}' at line {}", name, other, line);
                        self.skip_statement();
                    }
                },
                Some(_) => return self.error("expected a statement"),
                None => return self.error(format!("device '{}' is missing '}}'", name)),
            }
        }

        let Some(family) = family else {
            return self.error(format!("device '{}' has no type", name));
        };
        let args = DeviceArgs::parse(&args_text);
        let settings = FamilySettings::from_args(&name, family, &args);
        Ok(DeviceConfig {
            name,
            family,
            args,
            settings,
            inputs,
            controls,
        })
    }
}

impl BridgeConfig {
    /// Parse configuration text.
    ///
    /// Syntax errors fail the whole text. Bad arguments and bindings are
    /// logged and skipped.
    pub fn parse(text: &str) -> Result<BridgeConfig> {
        let mut parser = Parser {
            tokens: tokenize(text)?,
            pos: 0,
        };
        let mut devices: Vec<DeviceConfig> = Vec::new();
        while let Some(token) = parser.next() {
            match token {
                Token::Semicolon => continue,
                Token::Word(w) if w == "inputdevice" => {
                    let device = parser.device()?;
                    if let Some(existing) = devices.iter_mut().find(|d| d.name == device.name) {
                        log::warn!("Device '{}' declared twice, the later declaration wins", device.name);
                        *existing = device;
                    } else {
                        devices.push(device);
                    }
                }
                _ => {
                    parser.pos -= 1;
                    return parser.error("expected 'inputdevice'");
                }
            }
        }
        Ok(BridgeConfig { devices })
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }
}
