//! Simulated 6-sensor controller.
//!
//! Six valuator-driven values `[x, y, z, azim, elev, roll]` move whichever
//! `sim6` sensor is selected. The controller only reads and writes logical
//! inputs in the channel map; it never sees raw protocol data.

use crate::channel_map::{ChannelMap, InputId};
use crate::input::{InputValue, Sensor6State};
use crate::types::{Axis, ControlValue, Pose, Sim6Flags};
use std::fmt::Write as _;

pub const DEFAULT_TRANS_SCALE: f64 = 0.1;
pub const DEFAULT_ROT_SCALE: f64 = 1.0;

const X: usize = 0;
const Y: usize = 1;
const Z: usize = 2;
const AZIM: usize = 3;
const ELEV: usize = 4;
const ROLL: usize = 5;

/// How valuator values turn into sensor motion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sim6Options {
    pub flags: Sim6Flags,
    pub azimuth_axis: Axis,
    pub trans_scale: f64,
    /// Degrees per unit valuator value.
    pub rot_scale: f64,
    pub volume_min: [f64; 3],
    pub volume_max: [f64; 3],
}

impl Default for Sim6Options {
    fn default() -> Self {
        Sim6Options {
            flags: Sim6Flags::default(),
            azimuth_axis: Axis::Y,
            trans_scale: DEFAULT_TRANS_SCALE,
            rot_scale: DEFAULT_ROT_SCALE,
            volume_min: [-5.0, 0.0, -5.0],
            volume_max: [5.0, 10.0, 5.0],
        }
    }
}

fn nonzero(scale: f64) -> f64 {
    if scale == 0.0 {
        1.0
    } else {
        scale
    }
}

/// Reorder the six values according to the swap flags.
fn arrange(values: &[f64; 6], flags: Sim6Flags) -> [f64; 6] {
    let mut out = *values;
    if flags.contains(Sim6Flags::SWAP_TRANSROT) {
        out[X] = -values[AZIM];
        out[Z] = values[ELEV];
        out[Y] = -values[ROLL];
        out[AZIM] = -values[X];
        out[ELEV] = values[Z];
        out[ROLL] = -values[Y];
    }
    if flags.contains(Sim6Flags::SWAP_YZ) {
        // Reads the unswapped values, so it overrides the matching slots.
        out[Z] = -values[Y];
        out[Y] = -values[Z];
        out[ELEV] = values[ROLL];
        out[ROLL] = values[ELEV];
    }
    out
}

/// Apply one step of valuator motion to a sensor state.
pub fn drive(current: &Sensor6State, values: &[f64; 6], options: &Sim6Options) -> Sensor6State {
    let flags = options.flags;
    if flags.contains(Sim6Flags::IGNORE_ALL) {
        return *current;
    }
    let ts = nonzero(options.trans_scale);
    let rs = nonzero(options.rot_scale);
    let v = arrange(values, flags);

    let mut next = *current;
    if flags.contains(Sim6Flags::RETURN_TO_ZERO) {
        next.pose = Pose::IDENTITY;
    }

    if !flags.contains(Sim6Flags::IGNORE_TRANS) {
        let delta = [v[X] * ts, v[Y] * ts, v[Z] * ts];
        if flags.contains(Sim6Flags::RELATIVE_AXIS) {
            next.pose.post_translate(delta);
        } else {
            next.pose.pre_translate(delta);
        }
        let t = &mut next.pose.translation;
        if flags.contains(Sim6Flags::RESTRICT_SPACE) {
            for i in 0..3 {
                t[i] = t[i].clamp(options.volume_min[i], options.volume_max[i]);
            }
            next.out_of_bounds = false;
        } else {
            next.out_of_bounds = (0..3).any(|i| t[i] > options.volume_max[i] || t[i] < options.volume_min[i]);
        }
    }

    let order = match options.azimuth_axis {
        Axis::X => [Axis::X, Axis::Z, Axis::Y],
        Axis::Y => [Axis::Y, Axis::X, Axis::Z],
        Axis::Z => [Axis::Z, Axis::Y, Axis::X],
    };
    let angles = [v[AZIM] * rs, v[ELEV] * rs, v[ROLL] * rs];
    for (axis, degrees) in order.into_iter().zip(angles) {
        if flags.contains(Sim6Flags::RELATIVE_AXIS) {
            next.pose.post_rotate(axis, degrees);
        } else {
            next.pose.pre_rotate_in_place(axis, degrees);
        }
    }
    next
}

/// Selection and motion state for the `sim6` sensors of one device.
#[derive(Debug)]
pub struct Sim6Controller {
    options: Sim6Options,
    values: [f64; 6],
    changed: bool,
    /// Every 6-sensor of the device in declaration order, flagged when
    /// it is simulated.
    sensors: Vec<(InputId, bool)>,
    active: Option<usize>,
}

fn sensor_state(map: &ChannelMap, id: InputId) -> Option<Sensor6State> {
    match map.input(id)?.get() {
        InputValue::Sensor6(state) => Some(state),
        _ => None,
    }
}

fn store(map: &ChannelMap, id: InputId, state: Sensor6State, touched: &mut Vec<InputId>) {
    if let Some(input) = map.input(id) {
        if let Ok(true) = input.accept(InputValue::Sensor6(state)) {
            touched.push(id);
        }
    }
}

impl Sim6Controller {
    /// Collect the device's sensors and activate the first simulated one.
    pub fn new(options: Sim6Options, map: &ChannelMap) -> Sim6Controller {
        let sensors: Vec<(InputId, bool)> = map.sensors().map(|b| (b.input, b.source.is_sim6())).collect();
        let active = sensors.iter().position(|&(_, sim)| sim);
        let controller = Sim6Controller {
            options,
            values: [0.0; 6],
            changed: false,
            sensors,
            active,
        };
        if let Some(id) = controller.active_input() {
            if let Some(input) = map.input(id) {
                input.set_active(true);
            }
        }
        controller
    }

    pub fn options(&self) -> &Sim6Options {
        &self.options
    }

    pub fn has_sensors(&self) -> bool {
        self.sensors.iter().any(|&(_, sim)| sim)
    }

    pub fn active_input(&self) -> Option<InputId> {
        self.active.map(|i| self.sensors[i].0)
    }

    pub fn values(&self) -> [f64; 6] {
        self.values
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    fn set_value(&mut self, slot: usize, value: f64) {
        self.values[slot] = value;
        self.changed = true;
    }

    fn toggle(&mut self, flag: Sim6Flags) {
        self.options.flags.toggle(flag);
        log::info!("sim6 {:?} = {}", flag, self.options.flags.contains(flag));
    }

    /// Move the active sensor by the current values.
    ///
    /// Returns the sensor if its value changed. Once all six values are zero
    /// the controller goes quiet until a value changes again.
    pub fn step(&mut self, map: &ChannelMap) -> Option<InputId> {
        if !self.changed || self.options.flags.contains(Sim6Flags::IGNORE_ALL) {
            return None;
        }
        let id = self.active_input()?;
        let current = sensor_state(map, id)?;
        let next = drive(&current, &self.values, &self.options);
        if self.values.iter().all(|&v| v == 0.0) {
            self.changed = false;
        }
        let mut touched = Vec::new();
        store(map, id, next, &mut touched);
        touched.pop()
    }

    fn select(&mut self, index: usize, map: &ChannelMap, touched: &mut Vec<InputId>) {
        if self.active == Some(index) {
            return;
        }
        if let Some(old) = self.active_input() {
            if map.input(old).is_some_and(|i| i.set_active(false)) {
                touched.push(old);
            }
        }
        self.active = Some(index);
        let id = self.sensors[index].0;
        if map.input(id).is_some_and(|i| i.set_active(true)) {
            touched.push(id);
        }
        self.changed = true;
        log::info!("sim6 sensor {} now active", index);
    }

    /// Step the selection forward or backward to the next simulated sensor.
    pub fn sensor_step(&mut self, forward: bool, map: &ChannelMap) -> Vec<InputId> {
        let mut touched = Vec::new();
        let n = self.sensors.len();
        if n == 0 {
            log::info!("No simulated 6-sensor available");
            return touched;
        }
        let start = self.active.unwrap_or(if forward { n - 1 } else { 0 });
        for k in 1..=n {
            let i = if forward { (start + k) % n } else { (start + n * k - k) % n };
            if self.sensors[i].1 {
                self.select(i, map, &mut touched);
                break;
            }
        }
        touched
    }

    /// Select the n-th 6-sensor of the device, if it is simulated.
    pub fn set_sensor(&mut self, n: usize, map: &ChannelMap) -> Vec<InputId> {
        let mut touched = Vec::new();
        match self.sensors.get(n) {
            Some(&(_, true)) => self.select(n, map, &mut touched),
            Some(_) => log::info!("6-sensor {} is not simulated", n),
            None => log::info!("No 6-sensor {} to select", n),
        }
        touched
    }

    /// Return the active sensor to identity.
    pub fn sensor_reset(&mut self, map: &ChannelMap) -> Vec<InputId> {
        let mut touched = Vec::new();
        if let Some(id) = self.active_input() {
            let state = Sensor6State {
                pose: Pose::IDENTITY,
                active: true,
                out_of_bounds: false,
            };
            store(map, id, state, &mut touched);
        }
        touched
    }

    /// Return every simulated sensor to identity; only the selected one
    /// stays active.
    pub fn sensor_reset_all(&mut self, map: &ChannelMap) -> Vec<InputId> {
        let mut touched = Vec::new();
        for (i, &(id, sim)) in self.sensors.iter().enumerate() {
            if !sim {
                continue;
            }
            let state = Sensor6State {
                pose: Pose::IDENTITY,
                active: self.active == Some(i),
                out_of_bounds: false,
            };
            store(map, id, state, &mut touched);
        }
        touched
    }

    /// Run a sim6 control action.
    ///
    /// Returns None when `action` is not a sim6 action, otherwise the inputs
    /// whose value changed.
    pub fn control(&mut self, action: &str, value: ControlValue, map: &ChannelMap) -> Option<Vec<InputId>> {
        let pressed = value.pressed();
        let none = Vec::new;
        let touched = match action {
            "set_transx" => {
                self.set_value(X, value.as_f64());
                none()
            }
            "set_transy" => {
                self.set_value(Y, value.as_f64());
                none()
            }
            "set_transz" => {
                self.set_value(Z, value.as_f64());
                none()
            }
            "set_azim" => {
                self.set_value(AZIM, value.as_f64());
                none()
            }
            "set_elev" => {
                self.set_value(ELEV, value.as_f64());
                none()
            }
            "set_roll" => {
                self.set_value(ROLL, value.as_f64());
                none()
            }
            "temp_valuator" => {
                self.options.flags.set(Sim6Flags::IGNORE_TRANS, pressed);
                self.changed = true;
                none()
            }
            "temp_valuator_only" => {
                self.options.flags.set(Sim6Flags::IGNORE_ALL, pressed);
                self.changed = true;
                none()
            }
            "sensor_next" | "sensor_prev" | "setsensor" | "sensor_reset" | "sensor_resetall" | "toggle_valuator"
            | "toggle_valuator_only" | "toggle_relative" | "toggle_space_limit" | "toggle_return_to_zero"
            | "toggle_swap_transrot" | "toggle_swap_yz"
                if !pressed =>
            {
                none()
            }
            "sensor_next" => self.sensor_step(true, map),
            "sensor_prev" => self.sensor_step(false, map),
            "setsensor" => self.set_sensor(value.as_f64().max(0.0) as usize, map),
            "sensor_reset" => self.sensor_reset(map),
            "sensor_resetall" => self.sensor_reset_all(map),
            "toggle_valuator" => {
                self.toggle(Sim6Flags::IGNORE_TRANS);
                self.changed = true;
                none()
            }
            "toggle_valuator_only" => {
                self.toggle(Sim6Flags::IGNORE_ALL);
                self.changed = true;
                none()
            }
            "toggle_relative" => {
                self.toggle(Sim6Flags::RELATIVE_AXIS);
                none()
            }
            "toggle_space_limit" => {
                self.toggle(Sim6Flags::RESTRICT_SPACE);
                none()
            }
            "toggle_return_to_zero" => {
                self.toggle(Sim6Flags::RETURN_TO_ZERO);
                none()
            }
            "toggle_swap_transrot" => {
                self.toggle(Sim6Flags::SWAP_TRANSROT);
                none()
            }
            "toggle_swap_yz" => {
                self.toggle(Sim6Flags::SWAP_YZ);
                none()
            }
            other => {
                // "setsensor(3)" selects without a payload.
                let n = other
                    .strip_prefix("setsensor(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .and_then(|n| n.trim().parse::<usize>().ok())?;
                if pressed {
                    self.set_sensor(n, map)
                } else {
                    none()
                }
            }
        };
        Some(touched)
    }

    /// Multi-line dump of the options for `print_sim6opts`.
    pub fn describe(&self) -> String {
        let o = &self.options;
        let mut out = String::new();
        let _ = writeln!(out, "sim6 options:");
        let _ = writeln!(out, "  flags = {:?}", o.flags);
        let _ = writeln!(out, "  azimuth axis = {:?}", o.azimuth_axis);
        let _ = writeln!(out, "  trans_scale = {}, rot_scale = {}", o.trans_scale, o.rot_scale);
        let _ = writeln!(out, "  working volume = {:?} .. {:?}", o.volume_min, o.volume_max);
        let _ = writeln!(
            out,
            "  values = {:?}, changed = {}, active = {:?}",
            self.values, self.changed, self.active
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputDecl;
    use crate::types::{Family, InputKind};

    fn map(sources: &[(&str, &str)]) -> ChannelMap {
        let decls: Vec<InputDecl> = sources
            .iter()
            .map(|(name, source)| InputDecl {
                name: name.to_string(),
                kind: InputKind::Sensor6,
                source: source.to_string(),
                line: 1,
            })
            .collect();
        ChannelMap::build("vrpn", Family::Vrpn, &decls, &[])
    }

    fn state(map: &ChannelMap, name: &str) -> Sensor6State {
        sensor_state(map, map.find(name).unwrap()).unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_world_translation_clamped() {
        let options = Sim6Options {
            flags: Sim6Flags::RESTRICT_SPACE,
            ..Sim6Options::default()
        };
        let start = Sensor6State::default();
        let next = drive(&start, &[100.0, 0.0, 0.0, 0.0, 0.0, 0.0], &options);
        assert_eq!(next.pose.translation, [5.0, 0.0, 0.0]);
        assert!(!next.out_of_bounds);
    }

    #[test]
    fn test_out_of_bounds_without_restriction() {
        let options = Sim6Options {
            flags: Sim6Flags::empty(),
            ..Sim6Options::default()
        };
        let next = drive(&Sensor6State::default(), &[0.0, -10.0, 0.0, 0.0, 0.0, 0.0], &options);
        assert!(close(next.pose.translation[1], -1.0));
        assert!(next.out_of_bounds);
    }

    #[test]
    fn test_relative_translation_follows_rotation() {
        let options = Sim6Options {
            flags: Sim6Flags::RELATIVE_AXIS,
            trans_scale: 1.0,
            ..Sim6Options::default()
        };
        let mut start = Sensor6State::default();
        start.pose.rotation = crate::pose::axis_rotation(Axis::Y, 90.0);
        let next = drive(&start, &[0.0, 0.0, -1.0, 0.0, 0.0, 0.0], &options);
        // Forward (-z) of a sensor turned 90 degrees left is world -x.
        assert!(close(next.pose.translation[0], -1.0));
        assert!(close(next.pose.translation[2], 0.0));
    }

    #[test]
    fn test_azimuth_rotation_and_zero_scale() {
        let options = Sim6Options {
            flags: Sim6Flags::empty(),
            rot_scale: 0.0,
            ..Sim6Options::default()
        };
        let next = drive(&Sensor6State::default(), &[0.0, 0.0, 0.0, 90.0, 0.0, 0.0], &options);
        let expected = crate::pose::axis_rotation(Axis::Y, 90.0);
        for r in 0..3 {
            for c in 0..3 {
                assert!(close(next.pose.rotation[r][c], expected[r][c]));
            }
        }
    }

    #[test]
    fn test_world_rotation_keeps_position() {
        let options = Sim6Options {
            flags: Sim6Flags::IGNORE_TRANS,
            ..Sim6Options::default()
        };
        let mut start = Sensor6State::default();
        start.pose.translation = [1.0, 2.0, 3.0];
        let next = drive(&start, &[5.0, 5.0, 5.0, 45.0, 10.0, 0.0], &options);
        assert_eq!(next.pose.translation, [1.0, 2.0, 3.0]);
        assert_ne!(next.pose.rotation, start.pose.rotation);
    }

    #[test]
    fn test_swaps() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(arrange(&v, Sim6Flags::SWAP_TRANSROT), [-4.0, -6.0, 5.0, -1.0, 3.0, -2.0]);
        assert_eq!(arrange(&v, Sim6Flags::SWAP_YZ), [1.0, -3.0, -2.0, 4.0, 6.0, 5.0]);
    }

    #[test]
    fn test_ignore_all_and_return_to_zero() {
        let mut start = Sensor6State::default();
        start.pose.translation = [1.0, 1.0, 1.0];
        let ignore = Sim6Options {
            flags: Sim6Flags::IGNORE_ALL,
            ..Sim6Options::default()
        };
        assert_eq!(drive(&start, &[1.0; 6], &ignore), start);

        let zero = Sim6Options {
            flags: Sim6Flags::RETURN_TO_ZERO,
            trans_scale: 1.0,
            ..Sim6Options::default()
        };
        let next = drive(&start, &[2.0, 0.0, 0.0, 0.0, 0.0, 0.0], &zero);
        assert_eq!(next.pose.translation, [2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_selection_skips_real_sensors() {
        let map = map(&[("head", "sim6[0]"), ("real", "Tracker0:tracker[0]"), ("wand", "sim6[1]")]);
        let mut sim = Sim6Controller::new(Sim6Options::default(), &map);
        assert_eq!(sim.active_input(), map.find("head"));
        assert!(state(&map, "head").active);

        let touched = sim.sensor_step(true, &map);
        assert_eq!(sim.active_input(), map.find("wand"));
        assert_eq!(touched.len(), 2);
        assert!(!state(&map, "head").active);
        assert!(state(&map, "wand").active);

        // Wraps around past the real tracker.
        sim.sensor_step(true, &map);
        assert_eq!(sim.active_input(), map.find("head"));
        sim.sensor_step(false, &map);
        assert_eq!(sim.active_input(), map.find("wand"));

        assert!(sim.set_sensor(1, &map).is_empty());
        assert_eq!(sim.active_input(), map.find("wand"));
        sim.control("setsensor(0)", ControlValue::Switch(true), &map);
        assert_eq!(sim.active_input(), map.find("head"));
    }

    #[test]
    fn test_step_and_change_flag() {
        let map = map(&[("head", "sim6[0]")]);
        let mut sim = Sim6Controller::new(Sim6Options::default(), &map);
        assert_eq!(sim.step(&map), None);

        sim.control("set_transx", ControlValue::Value(1.0), &map);
        assert_eq!(sim.step(&map), map.find("head"));
        assert_eq!(sim.step(&map), map.find("head"));
        assert!(close(state(&map, "head").pose.translation[0], 0.2));

        sim.control("set_transx", ControlValue::Value(0.0), &map);
        assert!(sim.is_changed());
        assert_eq!(sim.step(&map), None);
        assert!(!sim.is_changed());
    }

    #[test]
    fn test_reset_controls() {
        let map = map(&[("head", "sim6[0]"), ("wand", "sim6[1]")]);
        let mut sim = Sim6Controller::new(Sim6Options::default(), &map);
        sim.control("set_transy", ControlValue::Value(10.0), &map);
        sim.step(&map);
        assert!(close(state(&map, "head").pose.translation[1], 1.0));

        assert_eq!(sim.control("sensor_reset", ControlValue::Switch(false), &map), Some(vec![]));
        sim.control("sensor_reset", ControlValue::Switch(true), &map);
        assert_eq!(state(&map, "head").pose, Pose::IDENTITY);

        sim.sensor_step(true, &map);
        sim.control("sensor_resetall", ControlValue::Switch(true), &map);
        assert!(!state(&map, "head").active);
        assert!(state(&map, "wand").active);
    }

    #[test]
    fn test_toggles() {
        let map = map(&[("head", "sim6[0]")]);
        let mut sim = Sim6Controller::new(Sim6Options::default(), &map);
        sim.control("toggle_relative", ControlValue::Switch(true), &map);
        assert!(!sim.options().flags.contains(Sim6Flags::RELATIVE_AXIS));
        sim.control("toggle_relative", ControlValue::Switch(false), &map);
        assert!(!sim.options().flags.contains(Sim6Flags::RELATIVE_AXIS));

        sim.control("temp_valuator", ControlValue::Switch(true), &map);
        assert!(sim.options().flags.contains(Sim6Flags::IGNORE_TRANS));
        sim.control("temp_valuator", ControlValue::Switch(false), &map);
        assert!(!sim.options().flags.contains(Sim6Flags::IGNORE_TRANS));

        assert!(sim.control("print_context", ControlValue::Switch(true), &map).is_none());
    }
}
