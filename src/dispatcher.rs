//! Push raw updates into logical inputs and emit change events.

use crate::calibration::DeviceCalibration;
use crate::channel_map::{ChannelMap, InputId};
use crate::config::DeviceConfig;
use crate::decoder::{DecodeSink, Decoder};
use crate::input::{InputValue, Sensor6State};
use crate::sim6::Sim6Controller;
use crate::types::{ControlValue, InputKind, RawChannelUpdate, VelocityReport};
use crossbeam_channel::{Sender, TrySendError};
use std::fmt::Write as _;

/// A change the host can react to.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    /// A logical input took a new value.
    Input {
        device: String,
        name: String,
        value: InputValue,
    },
    /// A VRPN server reported a tracker velocity.
    Velocity {
        device: String,
        sender: u8,
        report: VelocityReport,
    },
}

const ACTIONS: &[&str] = &[
    "system_pause_toggle",
    "print_context",
    "print_config",
    "print_input",
    "print_struct",
    "print_help",
    "print_sim6opts",
    "sensor_next",
    "sensor_prev",
    "setsensor(n)",
    "sensor_reset",
    "sensor_resetall",
    "temp_valuator",
    "toggle_valuator",
    "temp_valuator_only",
    "toggle_valuator_only",
    "toggle_relative",
    "toggle_space_limit",
    "toggle_return_to_zero",
    "toggle_swap_transrot",
    "toggle_swap_yz",
    "set_transx",
    "set_transy",
    "set_transz",
    "set_azim",
    "set_elev",
    "set_roll",
];

/// Per-device dispatch state, owned by the device worker.
pub struct Dispatcher {
    config: DeviceConfig,
    map: ChannelMap,
    calibration: DeviceCalibration,
    valuator_scale: f64,
    sim6: Option<Sim6Controller>,
    /// Last value each bound control saw, indexed like `map.controls()`.
    control_state: Vec<Option<ControlValue>>,
    paused: bool,
    log_raw: bool,
    events: Sender<InputEvent>,
    events_closed: bool,
    unresolved_warned: bool,
}

impl Dispatcher {
    pub fn new(config: DeviceConfig, map: ChannelMap, events: Sender<InputEvent>, log_raw: bool) -> Dispatcher {
        let sim6 = config
            .settings
            .sim6_options()
            .map(|options| Sim6Controller::new(options, &map))
            .filter(Sim6Controller::has_sensors);
        Dispatcher {
            calibration: config.settings.calibration(),
            valuator_scale: config.settings.valuator_scale(),
            control_state: vec![None; map.controls().len()],
            config,
            map,
            sim6,
            paused: false,
            log_raw,
            events,
            events_closed: false,
            unresolved_warned: false,
        }
    }

    pub fn device(&self) -> &str {
        &self.config.name
    }

    pub fn map(&self) -> &ChannelMap {
        &self.map
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn sim6(&self) -> Option<&Sim6Controller> {
        self.sim6.as_ref()
    }

    /// Resolve VRPN names after the decoder learned new senders.
    pub fn resolve_names(&mut self, decoder: &dyn Decoder) {
        let resolved = self.map.resolve_names(decoder);
        if resolved > 0 {
            log::debug!("{}: {} sources resolved", self.config.name, resolved);
        }
        let pending = self.map.unresolved_names();
        if !pending.is_empty() && !self.unresolved_warned {
            log::warn!(
                "{}: server has not announced device(s) {}; their inputs stay idle",
                self.config.name,
                pending.join(", ")
            );
            self.unresolved_warned = true;
        }
    }

    /// Whether the unresolved-name warning has been issued.
    pub fn warned_unresolved(&self) -> bool {
        self.unresolved_warned
    }

    fn emit(&mut self, event: InputEvent) {
        if self.events_closed {
            return;
        }
        if let Err(e) = self.events.try_send(event) {
            match e {
                TrySendError::Full(_) => {
                    log::trace!("{}: event channel full, dropping event", self.config.name);
                }
                TrySendError::Disconnected(_) => {
                    log::info!("{}: event channel disconnected, values stay readable", self.config.name);
                    self.events_closed = true;
                }
            }
        }
    }

    fn emit_input(&mut self, id: InputId) {
        let Some(input) = self.map.input(id) else {
            return;
        };
        let event = InputEvent::Input {
            device: self.config.name.clone(),
            name: input.name().to_string(),
            value: input.get(),
        };
        self.emit(event);
    }

    fn store(&mut self, id: InputId, value: InputValue) {
        let changed = match self.map.input(id).map(|input| input.accept(value)) {
            Some(Ok(changed)) => changed,
            Some(Err(e)) => {
                log::warn!("{}: {}", self.config.name, e);
                false
            }
            None => false,
        };
        if changed {
            self.emit_input(id);
        }
    }

    /// Run one cycle's worth of decoder output through the map.
    pub fn dispatch(&mut self, sink: &DecodeSink, decoder: &dyn Decoder) {
        for update in &sink.updates {
            if self.log_raw {
                log::trace!("{} raw {:?}", self.config.name, update);
            }
            self.fire_bound_controls(update, decoder);
            if !self.paused {
                self.apply_update(update, decoder);
            }
        }
        if self.paused {
            return;
        }

        self.follow_units(decoder);

        for (sender, report) in &sink.velocities {
            let event = InputEvent::Velocity {
                device: self.config.name.clone(),
                sender: *sender,
                report: *report,
            };
            self.emit(event);
        }

        self.step_sim6();
    }

    /// Let the simulated sensor move even when no bytes arrived.
    pub fn step_sim6(&mut self) {
        if self.paused {
            return;
        }
        let moved = match self.sim6.as_mut() {
            Some(sim) => sim.step(&self.map),
            None => None,
        };
        if let Some(id) = moved {
            self.emit_input(id);
        }
    }

    fn apply_update(&mut self, update: &RawChannelUpdate, decoder: &dyn Decoder) {
        let mut pending: Vec<(InputId, InputValue)> = Vec::new();
        match update {
            RawChannelUpdate::Pose { address, pose } => {
                let active = decoder.unit(address).map_or(true, |unit| unit.active);
                let calibrated = self.calibration.apply(address, pose);
                for binding in self.map.bound_to(InputKind::Sensor6, address) {
                    if let Some(input) = self.map.input(binding.input) {
                        let state = Sensor6State {
                            pose: input.to_reference(calibrated),
                            active,
                            out_of_bounds: false,
                        };
                        pending.push((binding.input, InputValue::Sensor6(state)));
                    }
                }
            }
            RawChannelUpdate::Button { address, value } => {
                for binding in self.map.bound_to(InputKind::Switch, address) {
                    pending.push((binding.input, InputValue::Switch(*value)));
                }
            }
            RawChannelUpdate::Valuator { address, value } => {
                for binding in self.map.bound_to(InputKind::Valuator, address) {
                    let scaled = value * self.valuator_scale * binding.sign;
                    pending.push((binding.input, InputValue::Valuator(scaled)));
                }
            }
        }
        for (id, value) in pending {
            self.store(id, value);
        }
    }

    /// Copy each real 6-sensor's active flag from its decoder unit.
    fn follow_units(&mut self, decoder: &dyn Decoder) {
        let flips: Vec<InputId> = self
            .map
            .sensors()
            .filter(|b| !b.source.is_sim6())
            .filter_map(|b| {
                let unit = decoder.unit(&b.source.address()?)?;
                let input = self.map.input(b.input)?;
                input.set_active(unit.active).then_some(b.input)
            })
            .collect();
        for id in flips {
            self.emit_input(id);
        }
    }

    fn fire_bound_controls(&mut self, update: &RawChannelUpdate, decoder: &dyn Decoder) {
        let address = update.address();
        let fired: Vec<(String, ControlValue)> = match update {
            RawChannelUpdate::Button { value, .. } => self
                .map
                .controls_bound_to(InputKind::Switch, &address)
                .map(|(i, c)| (i, c.action.clone(), ControlValue::Switch(*value)))
                .collect::<Vec<_>>(),
            RawChannelUpdate::Valuator { value, .. } => self
                .map
                .controls_bound_to(InputKind::Valuator, &address)
                .map(|(i, c)| {
                    let scaled = value * self.valuator_scale * c.sign;
                    (i, c.action.clone(), ControlValue::Value(scaled))
                })
                .collect::<Vec<_>>(),
            RawChannelUpdate::Pose { .. } => Vec::new(),
        }
        .into_iter()
        .filter_map(|(i, action, value)| {
            let last = self.control_state.get_mut(i)?;
            if *last == Some(value) {
                return None;
            }
            *last = Some(value);
            Some((action, value))
        })
        .collect();
        for (action, value) in fired {
            self.control(&action, value, decoder);
        }
    }

    /// Run a control action. Returns false when the action is unknown.
    pub fn control(&mut self, action: &str, value: ControlValue, decoder: &dyn Decoder) -> bool {
        let name = &self.config.name;
        match action {
            "system_pause_toggle" => {
                if value.pressed() {
                    self.paused = !self.paused;
                    log::info!("{}: dispatch {}", name, if self.paused { "paused" } else { "resumed" });
                }
            }
            "print_context" => {
                if value.pressed() {
                    log::info!(
                        "{}: {} device, {} inputs, {} controls, paused = {}, unresolved devices = [{}]",
                        name,
                        self.config.family,
                        self.map.len(),
                        self.map.controls().len(),
                        self.paused,
                        self.map.unresolved_names().join(", ")
                    );
                }
            }
            "print_config" => {
                if value.pressed() {
                    log::info!("{}: {:#?}", name, self.config.settings);
                }
            }
            "print_input" => {
                if value.pressed() {
                    let mut out = String::new();
                    for input in self.map.inputs() {
                        let _ = writeln!(out, "  {} = {:?}", input.name(), input.get());
                    }
                    log::info!("{} inputs:\n{}", name, out);
                }
            }
            "print_struct" => {
                if value.pressed() {
                    log::info!("{}:\n{}", name, decoder.describe());
                }
            }
            "print_help" => {
                if value.pressed() {
                    log::info!("{} control actions: {}", name, ACTIONS.join(", "));
                }
            }
            "print_sim6opts" => {
                if value.pressed() {
                    match &self.sim6 {
                        Some(sim) => log::info!("{}: {}", name, sim.describe()),
                        None => log::info!("{}: no simulated sensors", name),
                    }
                }
            }
            _ => {
                let touched = match self.sim6.as_mut() {
                    Some(sim) => sim.control(action, value, &self.map),
                    None => None,
                };
                match touched {
                    Some(ids) => {
                        for id in ids {
                            self.emit_input(id);
                        }
                    }
                    None => {
                        log::warn!("{}: unknown control action '{}'", name, action);
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::types::{BodyType, DeviceUnit, Family, RawAddress, RawPose};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Units(HashMap<RawAddress, DeviceUnit>);

    impl Decoder for Units {
        fn family(&self) -> Family {
            Family::Dtrack
        }
        fn open_request(&mut self) -> Vec<Vec<u8>> {
            Vec::new()
        }
        fn decode(&mut self, _input: &[u8], _sink: &mut DecodeSink) -> usize {
            0
        }
        fn close_request(&mut self) -> Vec<Vec<u8>> {
            Vec::new()
        }
        fn reset(&mut self) {}
        fn unit(&self, address: &RawAddress) -> Option<&DeviceUnit> {
            self.0.get(address)
        }
        fn describe(&self) -> String {
            "units".to_string()
        }
    }

    const DTRACK: &str = r#"
        inputdevice "dt" = {
            type = "dtrack";
            args = "scale = 1; valscale = 2";
            input "head" = "6sensor(6d[0])";
            input "trigger" = "switch(fs2[0, 0])";
            input "joy" = "valuator(fs2[0, -1])";
            control "system_pause_toggle" = "switch(fs2[0, 3])";
        }
    "#;

    fn setup(text: &str) -> (Dispatcher, crossbeam_channel::Receiver<InputEvent>) {
        let config = BridgeConfig::parse(text).unwrap().devices.remove(0);
        let map = ChannelMap::build(&config.name, config.family, &config.inputs, &config.controls);
        let (tx, rx) = crossbeam_channel::bounded(64);
        (Dispatcher::new(config, map, tx, false), rx)
    }

    fn head() -> RawAddress {
        RawAddress::Dtrack {
            body: BodyType::Standard,
            unit: 0,
            channel: 0,
        }
    }

    fn fs(channel: u8) -> RawAddress {
        RawAddress::Dtrack {
            body: BodyType::Flystick,
            unit: 0,
            channel,
        }
    }

    fn names(rx: &crossbeam_channel::Receiver<InputEvent>) -> Vec<String> {
        rx.try_iter()
            .filter_map(|e| match e {
                InputEvent::Input { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_events_only_on_change() {
        let (mut dispatcher, rx) = setup(DTRACK);
        let decoder = Units::default();
        let mut sink = DecodeSink::default();
        sink.updates.push(RawChannelUpdate::Button {
            address: fs(0),
            value: true,
        });
        sink.updates.push(RawChannelUpdate::Valuator {
            address: fs(1),
            value: 0.25,
        });
        dispatcher.dispatch(&sink, &decoder);
        assert_eq!(names(&rx), vec!["trigger", "joy"]);

        let joy = dispatcher.map().find("joy").unwrap();
        assert_eq!(dispatcher.map().input(joy).unwrap().get(), InputValue::Valuator(-0.5));

        dispatcher.dispatch(&sink, &decoder);
        assert!(names(&rx).is_empty());
    }

    #[test]
    fn test_pose_follows_unit_activity() {
        let (mut dispatcher, rx) = setup(DTRACK);
        let mut decoder = Units::default();
        decoder.0.insert(
            head(),
            DeviceUnit {
                active: true,
                ..DeviceUnit::default()
            },
        );
        let mut pose = RawPose::zeroed();
        pose.position = [1.0, 2.0, 3.0];
        let mut sink = DecodeSink::default();
        sink.updates.push(RawChannelUpdate::Pose { address: head(), pose });
        dispatcher.dispatch(&sink, &decoder);
        assert_eq!(names(&rx), vec!["head"]);

        decoder.0.get_mut(&head()).unwrap().active = false;
        dispatcher.dispatch(&DecodeSink::default(), &decoder);
        match rx.try_recv().unwrap() {
            InputEvent::Input {
                value: InputValue::Sensor6(state),
                ..
            } => {
                assert!(!state.active);
                assert_eq!(state.pose.translation, [1.0, 2.0, 3.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pause_control_suspends_dispatch() {
        let (mut dispatcher, rx) = setup(DTRACK);
        let decoder = Units::default();
        let press = |on| {
            let mut sink = DecodeSink::default();
            sink.updates.push(RawChannelUpdate::Button { address: fs(3), value: on });
            sink.updates.push(RawChannelUpdate::Button { address: fs(0), value: on });
            sink
        };
        dispatcher.dispatch(&press(true), &decoder);
        assert!(dispatcher.is_paused());
        assert!(names(&rx).is_empty());

        dispatcher.dispatch(&press(false), &decoder);
        assert!(dispatcher.is_paused());
        dispatcher.dispatch(&press(true), &decoder);
        assert!(!dispatcher.is_paused());
        assert_eq!(names(&rx), vec!["trigger"]);
    }

    #[test]
    fn test_unknown_action() {
        let (mut dispatcher, _rx) = setup(DTRACK);
        let decoder = Units::default();
        assert!(dispatcher.control("print_input", ControlValue::Switch(true), &decoder));
        assert!(!dispatcher.control("sensor_next", ControlValue::Switch(true), &decoder));
        assert!(!dispatcher.control("launch_rocket", ControlValue::Switch(true), &decoder));
    }

    #[test]
    fn test_sim6_driven_by_bound_valuator() {
        let (mut dispatcher, rx) = setup(
            r#"
            inputdevice "sim" = {
                type = "vrpn";
                args = "restrict = on";
                input "head" = "6sensor(sim6[0])";
                control "set_transx" = "valuator(Joy:analog[0])";
            }
            "#,
        );
        let decoder = Units::default();
        let head = dispatcher.map().find("head").unwrap();
        assert!(dispatcher.sim6().is_some());

        let mut vrpn = crate::vrpn::VrpnDecoder::new();
        let mut bytes = crate::vrpn::client_cookie();
        let mut w = crate::wire::Writer::new(crate::wire::Endian::Big);
        w.u32(24 + 8).u32(0).u32(0).i32(0).i32(crate::vrpn::SENDER_DESCRIPTION).u32(0);
        w.u32(4).bytes(b"Joy\0");
        bytes.extend(w.finish());
        let mut sink = DecodeSink::default();
        vrpn.decode(&bytes, &mut sink);
        dispatcher.resolve_names(&vrpn);

        let mut sink = DecodeSink::default();
        sink.updates.push(RawChannelUpdate::Valuator {
            address: RawAddress::Vrpn { sender: 1, index: 0 },
            value: 1.0,
        });
        dispatcher.dispatch(&sink, &decoder);
        assert_eq!(names(&rx), vec!["head"]);
        match dispatcher.map().input(head).unwrap().get() {
            InputValue::Sensor6(state) => {
                assert!(state.active);
                assert!((state.pose.translation[0] - 0.1).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }

        dispatcher.step_sim6();
        assert_eq!(names(&rx), vec!["head"]);
    }

    #[test]
    fn test_unannounced_device_is_reported() {
        let (mut dispatcher, _rx) = setup(
            r#"
            inputdevice "vr" = {
                type = "vrpn";
                args = "host = localhost";
                input "x" = "valuator(Joy:analog[0])";
                input "fire" = "switch(Gone:button[0])";
            }
            "#,
        );
        assert!(!dispatcher.warned_unresolved());

        let mut vrpn = crate::vrpn::VrpnDecoder::new();
        let mut bytes = crate::vrpn::client_cookie();
        let mut w = crate::wire::Writer::new(crate::wire::Endian::Big);
        w.u32(24 + 8).u32(0).u32(0).i32(0).i32(crate::vrpn::SENDER_DESCRIPTION).u32(0);
        w.u32(4).bytes(b"Joy\0");
        bytes.extend(w.finish());
        let mut sink = DecodeSink::default();
        vrpn.decode(&bytes, &mut sink);
        dispatcher.resolve_names(&vrpn);

        assert_eq!(dispatcher.map().unresolved_names(), vec!["Gone"]);
        assert!(dispatcher.warned_unresolved());
        assert!(dispatcher.control("print_context", ControlValue::Switch(true), &vrpn));
    }
}
