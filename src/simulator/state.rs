use crate::codec::Codec;
use crate::config::InitialValue;
use crate::error::{HalError, HalResult};
use crate::format::Value;
use crate::state::{StateAccess, StateSnapshot};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

pub const HEADER: &str = "Header";
pub const PACKET_ID: &str = "packet_id";

/// The simulated instrument's registers, shared by command callbacks,
/// travel timers and the drift loop.
#[derive(Debug, Clone)]
pub struct SimulatedState {
    codec: Codec,
    inner: Arc<Mutex<StateSnapshot>>,
}

impl SimulatedState {
    /// Every field zeroed.
    pub fn new(codec: Codec) -> Self {
        let snapshot = StateSnapshot::zeroed(codec.schema().clone());
        Self {
            codec,
            inner: Arc::new(Mutex::new(snapshot)),
        }
    }

    /// Zeroed, then the configured power-on values.
    pub fn power_on(codec: Codec, initial: &[InitialValue]) -> HalResult<Self> {
        let state = Self::new(codec);
        state.apply(initial)?;
        Ok(state)
    }

    pub fn apply(&self, initial: &[InitialValue]) -> HalResult<()> {
        for init in initial {
            let value = init.typed_value()?;
            let spec = self
                .codec
                .schema()
                .subsystem(&init.subsystem)
                .ok_or_else(|| HalError::not_found(&init.subsystem, &init.field))?;

            if spec.repeated_index(&init.field).is_some() {
                let units: Vec<usize> = match init.unit {
                    Some(unit) => vec![unit],
                    None => (0..spec.unit_count).collect(),
                };
                for unit in units {
                    self.set_unit(&init.subsystem, unit, &init.field, value.clone())?;
                }
            } else {
                self.set(&init.subsystem, &init.field, value)?;
            }
            debug!(subsystem = %init.subsystem, field = %init.field, "applied power-on value");
        }
        Ok(())
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Run `f` with exclusive access, for read-modify-write updates.
    pub fn with<R>(&self, f: impl FnOnce(&mut StateSnapshot) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.with(|snapshot| snapshot.clone())
    }

    /// Encode the current state as a status frame, bumping the header's
    /// packet id first when the layout has one.
    pub fn next_frame(&self) -> HalResult<Vec<u8>> {
        let values = self.with(|snapshot| {
            let next = snapshot
                .get(HEADER, PACKET_ID)
                .and_then(Value::as_i64)
                .map(|id| id.wrapping_add(1));
            if let Some(id) = next {
                // restart at zero past i32::MAX
                let id = i32::try_from(id).unwrap_or(0);
                snapshot.set(HEADER, PACKET_ID, Value::I32(id))?;
            }
            Ok::<_, HalError>(snapshot.values())
        })?;
        self.codec.encode(&values)
    }
}

impl StateAccess for SimulatedState {
    fn get(&self, subsystem: &str, field: &str) -> Option<Value> {
        self.with(|snapshot| snapshot.get(subsystem, field).cloned())
    }

    fn get_unit(&self, subsystem: &str, unit: usize, field: &str) -> Option<Value> {
        self.with(|snapshot| snapshot.get_unit(subsystem, unit, field).cloned())
    }

    fn set(&self, subsystem: &str, field: &str, value: Value) -> HalResult<()> {
        self.with(|snapshot| snapshot.set(subsystem, field, value))
    }

    fn set_unit(&self, subsystem: &str, unit: usize, field: &str, value: Value) -> HalResult<()> {
        self.with(|snapshot| snapshot.set_unit(subsystem, unit, field, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::schema::build_schema;

    fn power_on() -> SimulatedState {
        let config = SystemConfig::bundled().unwrap();
        let codec = Codec::new(build_schema(&config).unwrap());
        SimulatedState::power_on(codec, &config.simulator.initial).unwrap()
    }

    #[test]
    fn test_power_on_values() {
        let state = power_on();
        assert_eq!(state.get("Header", "packet_type"), Some(Value::I32(63)));
        assert_eq!(state.get("DigitalInputs", "state"), Some(Value::U16(4095)));
        assert_eq!(state.get("Fans", "state"), Some(Value::U8(1)));
        for unit in 0..9 {
            assert_eq!(state.get_unit_f64("Thermocouples", unit, "temperature"), Some(25.0));
        }
        assert_eq!(state.get_unit_f64("Mixers", 0, "duty_cycle"), Some(0.0));
    }

    #[test]
    fn test_simulated_state_is_writable() {
        let state = power_on();
        state.set("Valves", "state2", Value::I32(7)).unwrap();
        assert_eq!(state.get("Valves", "state2"), Some(Value::U16(7)));
    }

    #[test]
    fn test_frames_bump_packet_id() {
        let state = power_on();
        let first = state.codec().decode_snapshot(&state.next_frame().unwrap()).unwrap();
        let second = state.codec().decode_snapshot(&state.next_frame().unwrap()).unwrap();
        assert_eq!(first.get("Header", "packet_id"), Some(&Value::I32(1)));
        assert_eq!(second.get("Header", "packet_id"), Some(&Value::I32(2)));
        assert_eq!(second.get("Header", "packet_type"), Some(&Value::I32(63)));
    }
}
