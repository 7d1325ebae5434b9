use super::state::SimulatedState;
use crate::config::SimulatorSection;
use crate::error::HalResult;
use crate::format::Value;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, trace, warn};

pub const TEMPERATURE_CONTROLLERS: &str = "TemperatureControllers";
pub const THERMOCOUPLES: &str = "Thermocouples";

/// Controller `error_code` value meaning "heating".
pub const CONTROLLER_ON: u64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct DriftModel {
    pub ambient_c: f64,
    pub heat_step_c: f64,
    pub cool_step_c: f64,
    pub period: Duration,
}

impl Default for DriftModel {
    fn default() -> Self {
        Self::from(&SimulatorSection::default())
    }
}

impl From<&SimulatorSection> for DriftModel {
    fn from(section: &SimulatorSection) -> Self {
        Self {
            ambient_c: section.ambient_c,
            heat_step_c: section.drift_up_c,
            cool_step_c: section.drift_down_c,
            period: section.drift_period(),
        }
    }
}

impl DriftModel {
    /// Next reading for one thermocouple.
    ///
    /// A controller that is on heats towards its setpoint and then holds;
    /// one that is off lets the reading fall back to ambient.
    pub fn next_temperature(&self, on: bool, temperature: f64, setpoint: f64) -> f64 {
        if on {
            if temperature < setpoint {
                temperature + self.heat_step_c
            } else {
                temperature
            }
        } else if temperature > self.ambient_c {
            temperature - self.cool_step_c
        } else {
            temperature
        }
    }

    /// Advance every controller/thermocouple pair by one tick. Returns how
    /// many readings changed.
    pub fn step(&self, state: &SimulatedState) -> HalResult<usize> {
        state.with(|snapshot| -> HalResult<usize> {
            let schema = snapshot.schema().clone();
            let (Some(ctrls), Some(probes)) = (
                schema.subsystem(TEMPERATURE_CONTROLLERS),
                schema.subsystem(THERMOCOUPLES),
            ) else {
                return Ok(0);
            };

            let mut changed = 0;
            for unit in 0..ctrls.unit_count.min(probes.unit_count) {
                let on = snapshot
                    .get_unit(TEMPERATURE_CONTROLLERS, unit, "error_code")
                    .and_then(Value::as_u64)
                    == Some(CONTROLLER_ON);
                let setpoint = snapshot
                    .get_unit(TEMPERATURE_CONTROLLERS, unit, "setpoint")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let Some(temperature) = snapshot
                    .get_unit(THERMOCOUPLES, unit, "temperature")
                    .and_then(Value::as_f64)
                else {
                    continue;
                };

                let next = self.next_temperature(on, temperature, setpoint);
                if next != temperature {
                    snapshot.set_unit(THERMOCOUPLES, unit, "temperature", Value::F64(next))?;
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    /// Step `state` every `period` until `stop` flips or its sender is dropped.
    pub fn spawn(self, state: SimulatedState, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.period.is_zero() {
                error!("temperature drift period is zero, drift disabled");
                return;
            }
            let mut ticker = time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_ms = self.period.as_millis() as u64, "temperature drift started");
            loop {
                if *stop.borrow() {
                    break;
                }
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => match self.step(&state) {
                        Ok(n) => trace!(changed = n, "temperature drift tick"),
                        Err(e) => warn!(error = %e, "temperature drift failed"),
                    },
                }
            }
            info!("temperature drift stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heating_until_setpoint() {
        let model = DriftModel::default();
        assert_eq!(model.next_temperature(true, 25.0, 30.0), 25.5);
        assert_eq!(model.next_temperature(true, 30.0, 30.0), 30.0);
        assert_eq!(model.next_temperature(true, 40.0, 30.0), 40.0);
    }

    #[test]
    fn test_cooling_to_ambient() {
        let model = DriftModel::default();
        assert!((model.next_temperature(false, 30.0, 0.0) - 29.95).abs() < 1e-9);
        assert_eq!(model.next_temperature(false, 25.0, 0.0), 25.0);
        assert_eq!(model.next_temperature(false, 20.0, 100.0), 20.0);
    }
}
