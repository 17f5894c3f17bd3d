//! Binding of physical source channels to logical inputs.
//!
//! The map is built once per device from its declarations. Logical inputs
//! live in an arena and are addressed by [`InputId`]; bindings point into
//! it. Bad declarations are logged and left out rather than failing the
//! whole device.

use crate::config::{ControlDecl, InputDecl};
use crate::decoder::Decoder;
use crate::dtrack;
use crate::input::LogicalInput;
use crate::types::{BodyType, Family, InputKind, RawAddress};
use crate::vrpn;
use std::collections::HashMap;
use std::sync::Arc;

/// Highest vruidd index accepted in a declaration, exclusive.
pub const VRUIDD_MAX_INDEX: usize = 256;

/// Checked index into a channel map's input arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputId(usize);

impl InputId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Where a binding reads its value from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// A fixed raw address.
    Address(RawAddress),
    /// A VRPN channel on a device known by name until the server announces
    /// its sender slot.
    Named {
        device: String,
        index: u8,
        sender: Option<u8>,
    },
    /// A sensor driven by the simulated-sensor controller.
    Sim6 { index: u8 },
}

impl Source {
    /// Raw address the source currently maps to, if resolved.
    pub fn address(&self) -> Option<RawAddress> {
        match self {
            Source::Address(address) => Some(*address),
            Source::Named {
                index,
                sender: Some(sender),
                ..
            } => Some(RawAddress::Vrpn {
                sender: *sender,
                index: *index,
            }),
            Source::Named { sender: None, .. } => None,
            Source::Sim6 { index } => Some(RawAddress::Vrpn {
                sender: 0,
                index: *index,
            }),
        }
    }

    pub fn is_sim6(&self) -> bool {
        matches!(self, Source::Sim6 { .. })
    }
}

/// A parsed source declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub source: Source,
    /// -1.0 for inverted valuators, otherwise 1.0.
    pub sign: f64,
    /// The 6-sensor carries a runtime reference frame (`r2e`).
    pub reference: bool,
}

fn split_source(text: &str) -> std::result::Result<(&str, Vec<&str>), String> {
    let text = text.trim();
    let open = text
        .find('[')
        .ok_or_else(|| format!("'{}' has no [index]", text))?;
    let close = text
        .rfind(']')
        .filter(|&c| c > open)
        .ok_or_else(|| format!("'{}' is missing ']'", text))?;
    let head = text[..open].trim();
    let args = text[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .collect();
    Ok((head, args))
}

fn parse_index(text: &str, max: usize, what: &str) -> std::result::Result<usize, String> {
    let value: usize = text
        .parse()
        .map_err(|_| format!("{} index '{}' is not a number", what, text))?;
    if value >= max {
        return Err(format!("{} index {} out of range (max {})", what, value, max - 1));
    }
    Ok(value)
}

/// Split an optional leading '-' off a valuator index.
fn signed(text: &str) -> (f64, &str) {
    match text.strip_prefix('-') {
        Some(rest) => (-1.0, rest.trim()),
        None => (1.0, text.strip_prefix('+').unwrap_or(text).trim()),
    }
}

fn reference_option(arg: Option<&&str>) -> std::result::Result<bool, String> {
    match arg.map(|a| a.to_ascii_lowercase()) {
        None => Ok(false),
        Some(a) if a == "id" => Ok(false),
        Some(a) if a == "r2e" => Ok(true),
        Some(a) => Err(format!("unknown 6-sensor option '{}'", a)),
    }
}

fn fixed(address: RawAddress) -> SourceSpec {
    SourceSpec {
        source: Source::Address(address),
        sign: 1.0,
        reference: false,
    }
}

fn parse_dtrack(kind: InputKind, head: &str, args: &[&str]) -> std::result::Result<SourceSpec, String> {
    let body = BodyType::from_name(head).ok_or_else(|| format!("unknown DTrack body type '{}'", head))?;
    let unit_text = args.first().ok_or("missing DTrack unit")?;
    let unit = parse_index(unit_text, dtrack::UNITS_PER_TYPE, "unit")? as u8;
    match kind {
        InputKind::Sensor6 => {
            let reference = reference_option(args.get(1))?;
            Ok(SourceSpec {
                reference,
                ..fixed(RawAddress::Dtrack { body, unit, channel: 0 })
            })
        }
        InputKind::Switch | InputKind::Valuator if body != BodyType::Flystick => {
            Err(format!("{} has no {} channels", body.name(), kind.name()))
        }
        InputKind::Switch => {
            let bit = args.get(1).ok_or("missing flystick button bit")?;
            let bit = parse_index(bit, dtrack::MAX_BUTTONS, "button")? as u8;
            Ok(fixed(RawAddress::Dtrack { body, unit, channel: bit }))
        }
        InputKind::Valuator => {
            let (sign, index) = signed(args.get(1).ok_or("missing flystick controller")?);
            let index = parse_index(index, dtrack::MAX_CONTROLLERS, "controller")? as u8;
            Ok(SourceSpec {
                sign,
                ..fixed(RawAddress::Dtrack { body, unit, channel: index })
            })
        }
    }
}

fn parse_vruidd(kind: InputKind, head: &str, args: &[&str]) -> std::result::Result<SourceSpec, String> {
    let first = args.first().ok_or("missing index")?;
    let expected = match head.to_ascii_lowercase().as_str() {
        "button" => InputKind::Switch,
        "valuator" => InputKind::Valuator,
        "6sensor" | "tracker" => InputKind::Sensor6,
        other => return Err(format!("unknown VRDeviceDaemon channel '{}'", other)),
    };
    if expected != kind {
        return Err(format!("{}[..] cannot feed a {}", head, kind.name()));
    }
    match kind {
        InputKind::Valuator => {
            let (mut sign, index) = signed(first);
            if args.get(1) == Some(&"-") {
                sign = -sign;
            }
            let index = parse_index(index, VRUIDD_MAX_INDEX, "valuator")? as u16;
            Ok(SourceSpec {
                sign,
                ..fixed(RawAddress::Vruidd { index })
            })
        }
        InputKind::Switch => {
            let index = parse_index(first, VRUIDD_MAX_INDEX, "button")? as u16;
            Ok(fixed(RawAddress::Vruidd { index }))
        }
        InputKind::Sensor6 => {
            let index = parse_index(first, VRUIDD_MAX_INDEX, "tracker")? as u16;
            Ok(SourceSpec {
                reference: reference_option(args.get(1))?,
                ..fixed(RawAddress::Vruidd { index })
            })
        }
    }
}

fn parse_vrpn(kind: InputKind, head: &str, args: &[&str]) -> std::result::Result<SourceSpec, String> {
    let first = args.first().ok_or("missing index")?;
    if head.eq_ignore_ascii_case("sim6") {
        if kind != InputKind::Sensor6 {
            return Err(format!("sim6[..] cannot feed a {}", kind.name()));
        }
        let index = parse_index(first, vrpn::MAX_TRACKERS, "sim6")? as u8;
        return Ok(SourceSpec {
            source: Source::Sim6 { index },
            sign: 1.0,
            reference: reference_option(args.get(1))?,
        });
    }

    let (device, channel) = head
        .rsplit_once(':')
        .ok_or_else(|| format!("'{}' needs the form Device:channel", head))?;
    // "Tracker0@host" announces itself as "Tracker0".
    let device = device.split('@').next().unwrap_or(device).trim();
    if device.is_empty() {
        return Err("empty VRPN device name".to_string());
    }
    let (expected, max) = match channel.trim().to_ascii_lowercase().as_str() {
        "button" => (InputKind::Switch, vrpn::MAX_BUTTONS),
        "analog" => (InputKind::Valuator, vrpn::MAX_ANALOGS),
        "tracker" => (InputKind::Sensor6, vrpn::MAX_TRACKERS),
        other => return Err(format!("unknown VRPN channel '{}'", other)),
    };
    if expected != kind {
        return Err(format!("{} channels cannot feed a {}", channel, kind.name()));
    }
    let (sign, index) = if kind == InputKind::Valuator { signed(first) } else { (1.0, *first) };
    let index = parse_index(index, max, channel)? as u8;
    let reference = if kind == InputKind::Sensor6 {
        reference_option(args.get(1))?
    } else {
        false
    };
    Ok(SourceSpec {
        source: Source::Named {
            device: device.to_string(),
            index,
            sender: None,
        },
        sign,
        reference,
    })
}

/// Parse `text` (the part inside `kind(...)`) for a device of `family`.
///
/// The error string is a human-readable reason for a warning.
pub fn parse_source(family: Family, kind: InputKind, text: &str) -> std::result::Result<SourceSpec, String> {
    let (head, args) = split_source(text)?;
    match family {
        Family::Dtrack => parse_dtrack(kind, head, &args),
        Family::Vruidd => parse_vruidd(kind, head, &args),
        Family::Vrpn => parse_vrpn(kind, head, &args),
    }
}

/// A logical input bound to its source.
#[derive(Debug, Clone)]
pub struct Binding {
    pub input: InputId,
    pub kind: InputKind,
    pub source: Source,
    pub sign: f64,
}

/// A control action bound to a source.
#[derive(Debug, Clone)]
pub struct ControlBinding {
    pub action: String,
    pub kind: InputKind,
    pub source: Source,
    pub sign: f64,
}

/// Logical inputs and controls of one device, with a lookup from raw
/// addresses.
#[derive(Debug, Default)]
pub struct ChannelMap {
    inputs: Vec<Arc<LogicalInput>>,
    bindings: Vec<Binding>,
    controls: Vec<ControlBinding>,
    by_address: HashMap<(InputKind, RawAddress), Vec<usize>>,
    controls_by_address: HashMap<(InputKind, RawAddress), Vec<usize>>,
}

impl ChannelMap {
    /// Build the map for one device. Invalid declarations are logged and
    /// skipped; a repeated input name replaces the earlier binding.
    pub fn build(device: &str, family: Family, inputs: &[InputDecl], controls: &[ControlDecl]) -> ChannelMap {
        let mut map = ChannelMap::default();

        for decl in inputs {
            let spec = match parse_source(family, decl.kind, &decl.source) {
                Ok(spec) => spec,
                Err(reason) => {
                    log::warn!(
                        "{}: input '{}' = {}({}) ignored at line {}: {}",
                        device,
                        decl.name,
                        decl.kind.name(),
                        decl.source,
                        decl.line,
                        reason
                    );
                    continue;
                }
            };
            let input = Arc::new(LogicalInput::new(&decl.name, decl.kind));
            if spec.reference {
                input.set_reference(Some(crate::types::Pose::IDENTITY));
            }
            let binding = |id| Binding {
                input: id,
                kind: decl.kind,
                source: spec.source.clone(),
                sign: spec.sign,
            };
            match map.find(&decl.name) {
                Some(id) => {
                    log::warn!(
                        "{}: input '{}' declared again at line {}, the later declaration wins",
                        device,
                        decl.name,
                        decl.line
                    );
                    map.inputs[id.0] = input;
                    if let Some(b) = map.bindings.iter_mut().find(|b| b.input == id) {
                        *b = binding(id);
                    }
                }
                None => {
                    let id = InputId(map.inputs.len());
                    map.inputs.push(input);
                    map.bindings.push(binding(id));
                }
            }
        }

        for decl in controls {
            if decl.kind == InputKind::Sensor6 {
                log::warn!("{}: control '{}' cannot be driven by a 6-sensor", device, decl.action);
                continue;
            }
            match parse_source(family, decl.kind, &decl.source) {
                Ok(spec) => map.controls.push(ControlBinding {
                    action: decl.action.clone(),
                    kind: decl.kind,
                    source: spec.source,
                    sign: spec.sign,
                }),
                Err(reason) => log::warn!(
                    "{}: control '{}' ignored at line {}: {}",
                    device,
                    decl.action,
                    decl.line,
                    reason
                ),
            }
        }

        map.reindex();
        map
    }

    fn reindex(&mut self) {
        self.by_address.clear();
        for (i, b) in self.bindings.iter().enumerate() {
            if let Some(address) = b.source.address() {
                self.by_address.entry((b.kind, address)).or_default().push(i);
            }
        }
        self.controls_by_address.clear();
        for (i, c) in self.controls.iter().enumerate() {
            if let Some(address) = c.source.address() {
                self.controls_by_address.entry((c.kind, address)).or_default().push(i);
            }
        }
    }

    /// Resolve pending VRPN device names against the decoder's sender table.
    ///
    /// Returns the number of sources newly resolved.
    pub fn resolve_names(&mut self, decoder: &dyn Decoder) -> usize {
        let mut resolved = 0;
        let sources = self
            .bindings
            .iter_mut()
            .map(|b| &mut b.source)
            .chain(self.controls.iter_mut().map(|c| &mut c.source));
        for source in sources {
            if let Source::Named { device, sender, .. } = source {
                let slot = decoder.resolve_sender(device);
                if slot.is_some() && slot != *sender {
                    log::info!("VRPN device '{}' is sender slot {:?}", device, slot);
                    *sender = slot;
                    resolved += 1;
                }
            }
        }
        if resolved > 0 {
            self.reindex();
        }
        resolved
    }

    /// VRPN device names that no announced sender has matched yet.
    pub fn unresolved_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .bindings
            .iter()
            .map(|b| &b.source)
            .chain(self.controls.iter().map(|c| &c.source))
            .filter_map(|source| match source {
                Source::Named { device, sender: None, .. } => Some(device.as_str()),
                _ => None,
            })
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn input(&self, id: InputId) -> Option<&Arc<LogicalInput>> {
        self.inputs.get(id.0)
    }

    pub fn inputs(&self) -> &[Arc<LogicalInput>] {
        &self.inputs
    }

    pub fn find(&self, name: &str) -> Option<InputId> {
        self.inputs.iter().position(|i| i.name() == name).map(InputId)
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn controls(&self) -> &[ControlBinding] {
        &self.controls
    }

    /// Bindings fed by `address` for inputs of `kind`.
    pub fn bound_to(&self, kind: InputKind, address: &RawAddress) -> impl Iterator<Item = &Binding> {
        self.by_address
            .get(&(kind, *address))
            .into_iter()
            .flatten()
            .map(|&i| &self.bindings[i])
    }

    /// Controls fed by `address` through a `kind` channel, with their
    /// position in [`ChannelMap::controls`].
    pub fn controls_bound_to(
        &self,
        kind: InputKind,
        address: &RawAddress,
    ) -> impl Iterator<Item = (usize, &ControlBinding)> {
        self.controls_by_address
            .get(&(kind, *address))
            .into_iter()
            .flatten()
            .map(|&i| (i, &self.controls[i]))
    }

    /// 6-sensor bindings in declaration order.
    pub fn sensors(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter().filter(|b| b.kind == InputKind::Sensor6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vrpn::VrpnDecoder;

    fn decl(name: &str, kind: InputKind, source: &str) -> InputDecl {
        InputDecl {
            name: name.to_string(),
            kind,
            source: source.to_string(),
            line: 1,
        }
    }

    #[test]
    fn test_dtrack_sources() {
        let head = parse_source(Family::Dtrack, InputKind::Sensor6, "6d[0]").unwrap();
        assert_eq!(
            head.source,
            Source::Address(RawAddress::Dtrack { body: BodyType::Standard, unit: 0, channel: 0 })
        );
        let wand = parse_source(Family::Dtrack, InputKind::Sensor6, "fs2[1, r2e]").unwrap();
        assert!(wand.reference);
        let button = parse_source(Family::Dtrack, InputKind::Switch, "fs2[0, 3]").unwrap();
        assert_eq!(
            button.source,
            Source::Address(RawAddress::Dtrack { body: BodyType::Flystick, unit: 0, channel: 3 })
        );
        let joy = parse_source(Family::Dtrack, InputKind::Valuator, "fs2[0, -1]").unwrap();
        assert_eq!(joy.sign, -1.0);
        assert!(parse_source(Family::Dtrack, InputKind::Switch, "6d[0, 1]").is_err());
        assert!(parse_source(Family::Dtrack, InputKind::Switch, "fs2[0]").is_err());
        assert!(parse_source(Family::Dtrack, InputKind::Sensor6, "3d[0]").is_err());
    }

    #[test]
    fn test_index_bounds() {
        let max = dtrack::UNITS_PER_TYPE;
        assert!(parse_source(Family::Dtrack, InputKind::Sensor6, &format!("6d[{}]", max)).is_err());
        assert!(parse_source(Family::Dtrack, InputKind::Sensor6, &format!("6d[{}]", max - 1)).is_ok());

        let max = vrpn::MAX_BUTTONS;
        assert!(parse_source(Family::Vrpn, InputKind::Switch, &format!("Wand:button[{}]", max)).is_err());
        assert!(parse_source(Family::Vrpn, InputKind::Switch, &format!("Wand:button[{}]", max - 1)).is_ok());

        assert!(parse_source(Family::Vruidd, InputKind::Switch, &format!("button[{}]", VRUIDD_MAX_INDEX)).is_err());
    }

    #[test]
    fn test_vruidd_sources() {
        let v = parse_source(Family::Vruidd, InputKind::Valuator, "valuator[-2]").unwrap();
        assert_eq!((v.source, v.sign), (Source::Address(RawAddress::Vruidd { index: 2 }), -1.0));
        let v = parse_source(Family::Vruidd, InputKind::Valuator, "valuator[1, -]").unwrap();
        assert_eq!(v.sign, -1.0);
        assert!(parse_source(Family::Vruidd, InputKind::Sensor6, "tracker[0]").is_ok());
        assert!(parse_source(Family::Vruidd, InputKind::Switch, "valuator[0]").is_err());
    }

    #[test]
    fn test_vrpn_sources() {
        let t = parse_source(Family::Vrpn, InputKind::Sensor6, "Tracker0@tracker.local:tracker[1]").unwrap();
        assert_eq!(
            t.source,
            Source::Named { device: "Tracker0".to_string(), index: 1, sender: None }
        );
        let a = parse_source(Family::Vrpn, InputKind::Valuator, "Joy:analog[-0]").unwrap();
        assert_eq!(a.sign, -1.0);
        let s = parse_source(Family::Vrpn, InputKind::Sensor6, "sim6[2]").unwrap();
        assert_eq!(s.source.address(), Some(RawAddress::Vrpn { sender: 0, index: 2 }));
        assert!(parse_source(Family::Vrpn, InputKind::Switch, "Joy:analog[0]").is_err());
        assert!(parse_source(Family::Vrpn, InputKind::Switch, "button[0]").is_err());
    }

    #[test]
    fn test_later_duplicate_wins() {
        let inputs = [
            decl("button", InputKind::Switch, "fs2[0, 0]"),
            decl("head", InputKind::Sensor6, "6d[0]"),
            decl("button", InputKind::Switch, "fs2[0, 5]"),
        ];
        let map = ChannelMap::build("dt", Family::Dtrack, &inputs, &[]);
        assert_eq!(map.len(), 2);
        let old = RawAddress::Dtrack { body: BodyType::Flystick, unit: 0, channel: 0 };
        let new = RawAddress::Dtrack { body: BodyType::Flystick, unit: 0, channel: 5 };
        assert_eq!(map.bound_to(InputKind::Switch, &old).count(), 0);
        let bound: Vec<_> = map.bound_to(InputKind::Switch, &new).collect();
        assert_eq!(bound.len(), 1);
        assert_eq!(map.input(bound[0].input).unwrap().name(), "button");
    }

    #[test]
    fn test_invalid_entries_omitted() {
        let inputs = [
            decl("head", InputKind::Sensor6, "6d[9]"),
            decl("wand", InputKind::Sensor6, "fs2[0]"),
        ];
        let map = ChannelMap::build("dt", Family::Dtrack, &inputs, &[]);
        assert_eq!(map.len(), 1);
        assert!(map.find("head").is_none());
        assert!(map.find("wand").is_some());
    }

    #[test]
    fn test_names_resolve_on_announcement() {
        use crate::decoder::DecodeSink;
        use crate::wire::{Endian, Writer};

        let inputs = [decl("wand", InputKind::Sensor6, "Wand:tracker[0]")];
        let mut map = ChannelMap::build("vr", Family::Vrpn, &inputs, &[]);
        let address = RawAddress::Vrpn { sender: 1, index: 0 };
        assert_eq!(map.bound_to(InputKind::Sensor6, &address).count(), 0);

        let mut decoder = VrpnDecoder::new();
        assert_eq!(map.resolve_names(&decoder), 0);

        let mut bytes = vrpn::client_cookie();
        let mut w = Writer::new(Endian::Big);
        w.u32(24 + 9).u32(0).u32(0).i32(0).i32(vrpn::SENDER_DESCRIPTION).u32(0);
        w.u32(5).bytes(b"Wand\0");
        let mut msg = w.finish();
        msg.resize(vrpn::padded(msg.len()), 0);
        bytes.extend(msg);
        let mut sink = DecodeSink::default();
        decoder.decode(&bytes, &mut sink);
        assert!(sink.names_changed);

        assert_eq!(map.resolve_names(&decoder), 1);
        assert_eq!(map.bound_to(InputKind::Sensor6, &address).count(), 1);
    }

    #[test]
    fn test_unresolved_names_listed_once() {
        let inputs = [
            decl("wand", InputKind::Sensor6, "Wand:tracker[0]"),
            decl("b0", InputKind::Switch, "Stick:button[0]"),
            decl("b1", InputKind::Switch, "Stick:button[1]"),
        ];
        let map = ChannelMap::build("vr", Family::Vrpn, &inputs, &[]);
        assert_eq!(map.unresolved_names(), vec!["Stick", "Wand"]);

        let dtrack = ChannelMap::build("dt", Family::Dtrack, &[decl("head", InputKind::Sensor6, "6d[0]")], &[]);
        assert!(dtrack.unresolved_names().is_empty());
    }
}
