//! The host-facing handle: every configured device plus the event stream.

use crate::config::{BridgeConfig, RuntimeOptions};
use crate::device::{Command, DeviceWorker};
use crate::dispatcher::InputEvent;
use crate::error::BridgeError;
use crate::input::{InputValue, LogicalInput, Sensor6State};
use crate::types::{ControlValue, InputKind, Pose};
use crate::Result;
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::Duration;

/// Running bridge over all devices of one configuration.
///
/// Values can be polled by name at any time; changes also arrive as
/// [`InputEvent`]s. Dropping the bridge stops every device worker.
pub struct Bridge {
    workers: Vec<DeviceWorker>,
    events: Receiver<InputEvent>,
}

impl Bridge {
    /// Parse `config_text` and start its devices with options from the
    /// environment.
    pub fn open(config_text: &str) -> Result<Bridge> {
        let config = BridgeConfig::parse(config_text)?;
        Bridge::from_config(config, RuntimeOptions::from_env())
    }

    pub fn from_config(config: BridgeConfig, options: RuntimeOptions) -> Result<Bridge> {
        let (sender, events) = crossbeam_channel::bounded(options.event_queue);
        let mut workers = Vec::with_capacity(config.devices.len());
        for device in config.devices {
            workers.push(DeviceWorker::spawn(device, options, sender.clone())?);
        }
        if workers.is_empty() {
            log::warn!("Configuration declares no input devices");
        }
        Ok(Bridge { workers, events })
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|w| w.name())
    }

    /// Names of every logical input, in device then declaration order.
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().flat_map(|w| w.inputs().iter().map(|i| i.name()))
    }

    fn lookup(&self, name: &str) -> Result<&Arc<LogicalInput>> {
        self.workers
            .iter()
            .find_map(|w| w.input(name))
            .ok_or_else(|| BridgeError::UnknownInput(name.to_string()))
    }

    fn expect_kind(input: &LogicalInput, kind: InputKind) -> Result<()> {
        if input.kind() != kind {
            return Err(BridgeError::KindMismatch {
                name: input.name().to_string(),
                expected: kind.name(),
                actual: input.kind().name(),
            });
        }
        Ok(())
    }

    /// Current value of any input.
    pub fn input(&self, name: &str) -> Result<InputValue> {
        Ok(self.lookup(name)?.get())
    }

    pub fn switch(&self, name: &str) -> Result<bool> {
        let input = self.lookup(name)?;
        match input.get() {
            InputValue::Switch(on) => Ok(on),
            _ => Bridge::expect_kind(input, InputKind::Switch).map(|_| false),
        }
    }

    pub fn valuator(&self, name: &str) -> Result<f64> {
        let input = self.lookup(name)?;
        match input.get() {
            InputValue::Valuator(v) => Ok(v),
            _ => Bridge::expect_kind(input, InputKind::Valuator).map(|_| 0.0),
        }
    }

    pub fn sensor6(&self, name: &str) -> Result<Sensor6State> {
        let input = self.lookup(name)?;
        match input.get() {
            InputValue::Sensor6(state) => Ok(state),
            _ => Bridge::expect_kind(input, InputKind::Sensor6).map(|_| Sensor6State::default()),
        }
    }

    /// Replace the reference frame applied to a 6-sensor's calibrated pose.
    ///
    /// `None` removes it. Takes effect with the next pose update.
    pub fn set_reference_frame(&self, name: &str, frame: Option<Pose>) -> Result<()> {
        let input = self.lookup(name)?;
        Bridge::expect_kind(input, InputKind::Sensor6)?;
        input.set_reference(frame);
        Ok(())
    }

    /// Queue a control action on one device.
    pub fn control(&self, device: &str, action: &str, value: ControlValue) -> Result<()> {
        let worker = self
            .workers
            .iter()
            .find(|w| w.name() == device)
            .ok_or_else(|| BridgeError::UnknownDevice(device.to_string()))?;
        worker.send(Command::Control {
            action: action.to_string(),
            value,
        })
    }

    /// Receive the next event (blocks until available).
    pub fn recv(&self) -> Result<InputEvent> {
        self.events.recv().map_err(|_| BridgeError::StreamStopped)
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&self) -> Option<InputEvent> {
        self.events.try_recv().ok()
    }

    /// Receive an event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<InputEvent> {
        self.events.recv_timeout(timeout).map_err(|e| match e {
            crossbeam_channel::RecvTimeoutError::Timeout => BridgeError::Timeout,
            crossbeam_channel::RecvTimeoutError::Disconnected => BridgeError::StreamStopped,
        })
    }

    /// Stop every device and wait for the workers to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for worker in &self.workers {
            worker.request_stop();
        }
        for worker in self.workers.drain(..) {
            worker.stop();
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
