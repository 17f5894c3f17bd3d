//! Logical inputs: the named, typed values the host reads.

use crate::error::BridgeError;
use crate::types::{InputKind, Pose};
use crate::Result;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Current state of a 6-sensor input.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sensor6State {
    pub pose: Pose,
    /// The tracker is currently delivering data (or is the selected
    /// simulated sensor).
    pub active: bool,
    /// The pose left the working volume of a simulated sensor.
    pub out_of_bounds: bool,
}

impl Default for Sensor6State {
    fn default() -> Self {
        Sensor6State {
            pose: Pose::IDENTITY,
            active: false,
            out_of_bounds: false,
        }
    }
}

/// Tagged value of one logical input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputValue {
    Switch(bool),
    Valuator(f64),
    Sensor6(Sensor6State),
}

impl InputValue {
    pub fn kind(&self) -> InputKind {
        match self {
            InputValue::Switch(_) => InputKind::Switch,
            InputValue::Valuator(_) => InputKind::Valuator,
            InputValue::Sensor6(_) => InputKind::Sensor6,
        }
    }

    pub fn initial(kind: InputKind) -> InputValue {
        match kind {
            InputKind::Switch => InputValue::Switch(false),
            InputKind::Valuator => InputValue::Valuator(0.0),
            InputKind::Sensor6 => InputValue::Sensor6(Sensor6State::default()),
        }
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One named input. The device worker writes it, any thread may read it.
#[derive(Debug)]
pub struct LogicalInput {
    name: String,
    kind: InputKind,
    value: Mutex<InputValue>,
    /// Reference frame post-multiplied onto calibrated poses.
    reference: Mutex<Option<Pose>>,
}

impl LogicalInput {
    pub fn new(name: &str, kind: InputKind) -> LogicalInput {
        LogicalInput {
            name: name.to_string(),
            kind,
            value: Mutex::new(InputValue::initial(kind)),
            reference: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> InputKind {
        self.kind
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> InputValue {
        *guard(&self.value)
    }

    /// Store `value` if it matches this input's kind.
    ///
    /// Returns whether the stored value changed.
    pub fn accept(&self, value: InputValue) -> Result<bool> {
        if value.kind() != self.kind {
            return Err(BridgeError::KindMismatch {
                name: self.name.clone(),
                expected: self.kind.name(),
                actual: value.kind().name(),
            });
        }
        let mut current = guard(&self.value);
        if *current == value {
            return Ok(false);
        }
        *current = value;
        Ok(true)
    }

    /// Update only the active flag of a 6-sensor. Returns whether it changed.
    pub fn set_active(&self, active: bool) -> bool {
        let mut current = guard(&self.value);
        match &mut *current {
            InputValue::Sensor6(state) if state.active != active => {
                state.active = active;
                true
            }
            _ => false,
        }
    }

    pub fn reference(&self) -> Option<Pose> {
        *guard(&self.reference)
    }

    pub fn set_reference(&self, frame: Option<Pose>) {
        *guard(&self.reference) = frame;
    }

    /// Apply the reference frame, if any, to a calibrated pose.
    pub fn to_reference(&self, pose: Pose) -> Pose {
        match self.reference() {
            Some(frame) => pose.compose(&frame),
            None => pose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_checks_kind() {
        let input = LogicalInput::new("button[1]", InputKind::Switch);
        assert_eq!(input.get(), InputValue::Switch(false));
        assert!(input.accept(InputValue::Switch(true)).unwrap());
        assert!(!input.accept(InputValue::Switch(true)).unwrap());
        let err = input.accept(InputValue::Valuator(1.0)).unwrap_err();
        assert!(matches!(err, BridgeError::KindMismatch { expected: "switch", .. }));
        assert_eq!(input.get(), InputValue::Switch(true));
    }

    #[test]
    fn test_set_active() {
        let head = LogicalInput::new("head", InputKind::Sensor6);
        assert!(head.set_active(true));
        assert!(!head.set_active(true));
        match head.get() {
            InputValue::Sensor6(state) => assert!(state.active),
            other => panic!("unexpected {:?}", other),
        }
        let button = LogicalInput::new("b", InputKind::Switch);
        assert!(!button.set_active(true));
    }

    #[test]
    fn test_reference_frame() {
        let wand = LogicalInput::new("wand", InputKind::Sensor6);
        let mut pose = Pose::IDENTITY;
        pose.translation = [1.0, 0.0, 0.0];
        assert_eq!(wand.to_reference(pose), pose);

        let mut frame = Pose::IDENTITY;
        frame.translation = [0.0, 2.0, 0.0];
        wand.set_reference(Some(frame));
        assert_eq!(wand.to_reference(pose).translation, [1.0, 2.0, 0.0]);
    }
}
