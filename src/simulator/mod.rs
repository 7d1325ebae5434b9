//! Hardware simulator.
//!
//! Plays the instrument's side of the link: keeps a writable copy of every
//! register, reacts to command frames through callbacks keyed by numeric
//! command id, models actuator travel and heater drift, and streams status
//! frames to a hardware server.

pub mod client;
pub mod state;
pub mod thermal;
pub mod travel;

pub use client::{run_simulator, ClientConfig};
pub use state::SimulatedState;
pub use thermal::DriftModel;
pub use travel::{TravelModel, TravelRule};

use crate::codec::Codec;
use crate::commands::{CommandTable, COMMAND_HEADER_LEN};
use crate::config::SystemConfig;
use crate::error::{HalError, HalResult};
use crate::format::{FormatCode, Value};
use crate::schema::{build_schema, ParamFormat};
use crate::state::StateAccess;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Reaction to one command: `(state, device_id, params)`.
pub type Callback = Box<dyn Fn(&SimulatedState, i32, &[Value]) -> HalResult<()> + Send + Sync>;

struct Registered {
    label: String,
    param_format: ParamFormat,
    callback: Callback,
}

pub struct Simulator {
    commands: CommandTable,
    state: SimulatedState,
    travel: Arc<TravelModel>,
    drift: DriftModel,
    param_size: usize,
    callbacks: HashMap<i32, Registered>,
}

impl Simulator {
    /// Simulator for `config`, at power-on state, with the default callbacks.
    pub fn new(config: &SystemConfig) -> HalResult<Self> {
        let schema = build_schema(config)?;
        let codec = Codec::new(schema.clone());
        let state = SimulatedState::power_on(codec, &config.simulator.initial)?;
        let travel = TravelModel::from_config(&config.simulator.travel_rules)?;

        let mut simulator = Self {
            commands: CommandTable::new(&schema),
            state,
            travel: Arc::new(travel),
            drift: DriftModel::from(&config.simulator),
            param_size: schema.parameter_size(),
            callbacks: HashMap::new(),
        };
        simulator.register_defaults()?;
        Ok(simulator)
    }

    pub fn state(&self) -> &SimulatedState {
        &self.state
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub fn travel(&self) -> &TravelModel {
        &self.travel
    }

    /// React to `subsystem.name` with `callback`, replacing any earlier one.
    pub fn register<F>(&mut self, subsystem: &str, name: &str, callback: F) -> HalResult<()>
    where
        F: Fn(&SimulatedState, i32, &[Value]) -> HalResult<()> + Send + Sync + 'static,
    {
        let command = self.commands.lookup(subsystem, name)?;
        self.callbacks.insert(
            command.numeric_id(),
            Registered {
                label: format!("{}.{}", subsystem, name),
                param_format: command.param_format().clone(),
                callback: Box::new(callback),
            },
        );
        Ok(())
    }

    /// Decode a command frame and run its callback.
    ///
    /// Unknown command ids are `Protocol` errors, which the client treats as
    /// fatal. Everything else fails only this frame.
    pub fn handle_frame(&self, frame: &[u8]) -> HalResult<()> {
        if frame.len() < COMMAND_HEADER_LEN {
            return Err(HalError::Format(format!(
                "command frame is {} bytes, header alone is {}",
                frame.len(),
                COMMAND_HEADER_LEN
            )));
        }
        let numeric_id = i32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let device_id = i32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);

        let registered = self
            .callbacks
            .get(&numeric_id)
            .ok_or_else(|| HalError::Protocol(format!("no callback for command id {}", numeric_id)))?;

        let param_len: usize = registered.param_format.iter().map(FormatCode::size).sum();
        let expected = COMMAND_HEADER_LEN + param_len.max(self.param_size);
        if frame.len() != expected {
            return Err(HalError::Format(format!(
                "{} frame is {} bytes, expected {}",
                registered.label,
                frame.len(),
                expected
            )));
        }

        let mut params = Vec::with_capacity(registered.param_format.len());
        let mut offset = COMMAND_HEADER_LEN;
        for code in &registered.param_format {
            let end = offset + code.size();
            params.push(code.decode(&frame[offset..end])?);
            offset = end;
        }

        debug!(command = %registered.label, device = device_id, params = ?params, "command received");
        (registered.callback)(&self.state, device_id, &params)
    }

    /// Current state as a status frame, with a fresh packet id.
    pub fn generate_frame(&self) -> HalResult<Vec<u8>> {
        self.state.next_frame()
    }

    pub fn spawn_drift(&self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        self.drift.clone().spawn(self.state.clone(), stop)
    }

    fn register_defaults(&mut self) -> HalResult<()> {
        self.register_if_declared("Mixers", "set_period", |s, dev, p| {
            s.set_unit("Mixers", unit(dev)?, "period", first(p)?)
        })?;
        self.register_if_declared("Mixers", "set_duty_cycle", |s, dev, p| {
            s.set_unit("Mixers", unit(dev)?, "duty_cycle", first(p)?)
        })?;

        for (command, word, travels) in [
            ("set_state0", "state0", true),
            ("set_state1", "state1", true),
            ("set_state2", "state2", false),
        ] {
            let travel = self.travel.clone();
            self.register_if_declared("Valves", command, move |s, _dev, p| {
                s.set(travel::VALVES, word, first(p)?)?;
                if travels {
                    travel.evaluate(s)?;
                }
                Ok(())
            })?;
        }

        self.register_if_declared(thermal::TEMPERATURE_CONTROLLERS, "set_setpoint", |s, dev, p| {
            s.set_unit(thermal::TEMPERATURE_CONTROLLERS, unit(dev)?, "setpoint", first(p)?)
        })?;
        self.register_if_declared(thermal::TEMPERATURE_CONTROLLERS, "turn_on", |s, dev, _p| {
            s.set_unit(thermal::TEMPERATURE_CONTROLLERS, unit(dev)?, "error_code", Value::Char(1))
        })?;
        self.register_if_declared(thermal::TEMPERATURE_CONTROLLERS, "turn_off", |s, dev, _p| {
            s.set_unit(thermal::TEMPERATURE_CONTROLLERS, unit(dev)?, "error_code", Value::Char(0))
        })?;

        self.register_if_declared("SMCInterfaces", "set_analog_out", |s, dev, p| {
            s.set_unit("SMCInterfaces", unit(dev)?, "analog_out", first(p)?)
        })?;

        self.register_if_declared("Fans", "turn_on", |s, dev, _p| set_fan(s, dev, true))?;
        self.register_if_declared("Fans", "turn_off", |s, dev, _p| set_fan(s, dev, false))?;

        self.register_if_declared("LinearActuators", "set_requested_position", |s, dev, p| {
            s.set_unit("LinearActuators", unit(dev)?, "requested_position", first(p)?)
        })?;
        self.register_if_declared("LinearActuators", "home_axis", |s, dev, _p| {
            let axis = unit(dev)?;
            s.set_unit("LinearActuators", axis, "requested_position", Value::U32(0))?;
            s.set_unit("LinearActuators", axis, "position", Value::U32(0))
        })?;
        Ok(())
    }

    /// Like [`register`](Self::register), but quietly skips commands the
    /// configured layout does not declare.
    fn register_if_declared<F>(&mut self, subsystem: &str, name: &str, callback: F) -> HalResult<()>
    where
        F: Fn(&SimulatedState, i32, &[Value]) -> HalResult<()> + Send + Sync + 'static,
    {
        match self.register(subsystem, name, callback) {
            Err(HalError::NotFound { .. }) => {
                debug!(subsystem, command = name, "no such command, callback skipped");
                Ok(())
            }
            other => other,
        }
    }
}

fn unit(device_id: i32) -> HalResult<usize> {
    usize::try_from(device_id)
        .map_err(|_| HalError::Value(format!("negative device_id {}", device_id)))
}

fn first(params: &[Value]) -> HalResult<Value> {
    params
        .first()
        .cloned()
        .ok_or_else(|| HalError::Format("command carries no parameter".to_string()))
}

/// One bit per fan in the fan state byte.
fn set_fan(state: &SimulatedState, device_id: i32, on: bool) -> HalResult<()> {
    let fan = unit(device_id)?;
    let count = state
        .codec()
        .schema()
        .subsystem("Fans")
        .map(|s| s.unit_count)
        .unwrap_or(0);
    if fan >= count || fan >= 64 {
        return Err(HalError::Value(format!("Fans has no unit {}", fan)));
    }
    state.with(|snapshot| {
        let word = snapshot.get("Fans", "state").and_then(Value::as_u64).unwrap_or(0);
        let mask = 1u64 << fan;
        let word = if on { word | mask } else { word & !mask };
        snapshot.set("Fans", "state", Value::U64(word))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulator() -> Simulator {
        Simulator::new(&SystemConfig::bundled().unwrap()).unwrap()
    }

    fn frame(sim: &Simulator, subsystem: &str, name: &str, device: Option<i64>, value: Value) -> Vec<u8> {
        let mut cmd = sim.commands().lookup(subsystem, name).unwrap();
        if let Some(device) = device {
            cmd = cmd.for_device(device).unwrap();
        }
        cmd.with_param(value).unwrap().to_bytes()
    }

    #[test]
    fn test_short_frame_is_format_error() {
        let sim = simulator();
        assert!(matches!(sim.handle_frame(&[1, 0, 0]), Err(HalError::Format(_))));
    }

    #[test]
    fn test_unknown_id_is_protocol_error() {
        let sim = simulator();
        let mut bytes = 999i32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        let err = sim.handle_frame(&bytes).unwrap_err();
        assert!(matches!(err, HalError::Protocol(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_wrong_slot_size_is_format_error() {
        let sim = simulator();
        let mut bytes = frame(&sim, "Valves", "set_state2", None, Value::U16(1));
        bytes.push(0);
        assert!(matches!(sim.handle_frame(&bytes), Err(HalError::Format(_))));
    }

    #[test]
    fn test_setpoint_and_power_callbacks() {
        let sim = simulator();
        sim.handle_frame(&frame(&sim, "TemperatureControllers", "set_setpoint", Some(2), Value::F32(150.0)))
            .unwrap();
        sim.handle_frame(&frame(&sim, "TemperatureControllers", "turn_on", Some(2), Value::I32(0)))
            .unwrap();
        let state = sim.state();
        assert_eq!(state.get_unit_f64("TemperatureControllers", 2, "setpoint"), Some(150.0));
        assert_eq!(
            state.get_unit("TemperatureControllers", 2, "error_code"),
            Some(Value::Char(1))
        );
    }

    #[test]
    fn test_fan_bits() {
        let sim = simulator();
        sim.handle_frame(&frame(&sim, "Fans", "turn_on", Some(2), Value::I32(0))).unwrap();
        assert_eq!(sim.state().get("Fans", "state"), Some(Value::U8(0b101)));
        sim.handle_frame(&frame(&sim, "Fans", "turn_off", Some(0), Value::I32(0))).unwrap();
        assert_eq!(sim.state().get("Fans", "state"), Some(Value::U8(0b100)));
    }

    #[test]
    fn test_valve_state2_has_no_travel() {
        let sim = simulator();
        sim.handle_frame(&frame(&sim, "Valves", "set_state2", None, Value::U16(0xffff)))
            .unwrap();
        assert_eq!(sim.state().get("Valves", "state2"), Some(Value::U16(0xffff)));
        assert_eq!(sim.state().get("DigitalInputs", "state"), Some(Value::U16(4095)));
    }

    #[test]
    fn test_custom_callback_replaces_default() {
        let mut sim = simulator();
        sim.register("Mixers", "set_period", |s, _dev, _p| {
            s.set("Valves", "state2", Value::U16(42))
        })
        .unwrap();
        sim.handle_frame(&frame(&sim, "Mixers", "set_period", Some(0), Value::I32(5)))
            .unwrap();
        assert_eq!(sim.state().get("Valves", "state2"), Some(Value::U16(42)));
        assert_eq!(sim.state().get_unit("Mixers", 0, "period"), Some(Value::I32(0)));
    }
}
