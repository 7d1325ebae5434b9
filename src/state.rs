//! Live hardware state: immutable snapshots decoded from status frames and
//! the shared store the rest of the application reads them from.

use crate::codec::Codec;
use crate::error::{HalError, HalResult};
use crate::format::Value;
use crate::queue::{InboundMessage, InboundReceiver};
use crate::schema::Schema;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DIGITAL_INPUTS: &str = "DigitalInputs";
pub const DIGITAL_INPUT_WORD: &str = "state";

#[derive(Debug, Clone, PartialEq)]
pub struct SubsystemState {
    pub scalars: Vec<Value>,
    pub units: Vec<Vec<Value>>,
}

/// Values of every subsystem, always shaped exactly like its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    schema: Arc<Schema>,
    subsystems: Vec<SubsystemState>,
}

impl StateSnapshot {
    /// Every field at its code's zero value.
    pub fn zeroed(schema: Arc<Schema>) -> Self {
        let subsystems = schema
            .subsystems()
            .iter()
            .map(|sub| SubsystemState {
                scalars: sub.scalar_fields.iter().map(|f| f.code.zero()).collect(),
                units: (0..sub.unit_count)
                    .map(|_| sub.repeated_fields.iter().map(|f| f.code.zero()).collect())
                    .collect(),
            })
            .collect();
        Self { schema, subsystems }
    }

    /// Rebuild from values in wire order.
    pub fn from_values(schema: Arc<Schema>, values: Vec<Value>) -> HalResult<Self> {
        if values.len() != schema.field_count() {
            return Err(HalError::Format(format!(
                "snapshot takes {} values, got {}",
                schema.field_count(),
                values.len()
            )));
        }

        let mut values = values.into_iter();
        let mut subsystems = Vec::with_capacity(schema.subsystems().len());
        for sub in schema.subsystems() {
            let scalars: Vec<Value> = values.by_ref().take(sub.scalar_fields.len()).collect();
            let mut units = Vec::with_capacity(sub.unit_count);
            for _ in 0..sub.unit_count {
                units.push(values.by_ref().take(sub.repeated_fields.len()).collect());
            }
            subsystems.push(SubsystemState { scalars, units });
        }
        Ok(Self { schema, subsystems })
    }

    /// Values flattened back into wire order.
    pub fn values(&self) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.schema.field_count());
        for state in &self.subsystems {
            out.extend(state.scalars.iter().cloned());
            for unit in &state.units {
                out.extend(unit.iter().cloned());
            }
        }
        out
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn subsystem(&self, name: &str) -> Option<&SubsystemState> {
        self.schema
            .subsystem_index(name)
            .and_then(|i| self.subsystems.get(i))
    }

    pub fn get(&self, subsystem: &str, field: &str) -> Option<&Value> {
        let index = self.schema.subsystem_index(subsystem)?;
        let field = self.schema.subsystems()[index].scalar_index(field)?;
        self.subsystems[index].scalars.get(field)
    }

    pub fn get_unit(&self, subsystem: &str, unit: usize, field: &str) -> Option<&Value> {
        let index = self.schema.subsystem_index(subsystem)?;
        let field = self.schema.subsystems()[index].repeated_index(field)?;
        self.subsystems[index].units.get(unit)?.get(field)
    }

    /// Write a scalar field, coercing into its declared code.
    pub(crate) fn set(&mut self, subsystem: &str, field: &str, value: Value) -> HalResult<()> {
        let index = self
            .schema
            .subsystem_index(subsystem)
            .ok_or_else(|| HalError::not_found(subsystem, field))?;
        let spec = &self.schema.subsystems()[index];
        let field_index = spec
            .scalar_index(field)
            .ok_or_else(|| HalError::not_found(subsystem, field))?;
        let coerced = spec.scalar_fields[field_index].code.coerce(value)?;
        self.subsystems[index].scalars[field_index] = coerced;
        Ok(())
    }

    pub(crate) fn set_unit(
        &mut self,
        subsystem: &str,
        unit: usize,
        field: &str,
        value: Value,
    ) -> HalResult<()> {
        let index = self
            .schema
            .subsystem_index(subsystem)
            .ok_or_else(|| HalError::not_found(subsystem, field))?;
        let spec = &self.schema.subsystems()[index];
        let field_index = spec
            .repeated_index(field)
            .ok_or_else(|| HalError::not_found(subsystem, field))?;
        if unit >= spec.unit_count {
            return Err(HalError::Value(format!(
                "{} has no unit {} (count {})",
                subsystem, unit, spec.unit_count
            )));
        }
        let coerced = spec.repeated_fields[field_index].code.coerce(value)?;
        self.subsystems[index].units[unit][field_index] = coerced;
        Ok(())
    }
}

/// Read and write access to named hardware fields.
///
/// The live store only reads; the simulator's state also writes.
pub trait StateAccess {
    fn get(&self, subsystem: &str, field: &str) -> Option<Value>;

    fn get_unit(&self, subsystem: &str, unit: usize, field: &str) -> Option<Value>;

    fn set(&self, subsystem: &str, field: &str, value: Value) -> HalResult<()>;

    fn set_unit(&self, subsystem: &str, unit: usize, field: &str, value: Value) -> HalResult<()>;

    fn get_f64(&self, subsystem: &str, field: &str) -> Option<f64> {
        self.get(subsystem, field).and_then(|v| v.as_f64())
    }

    fn get_unit_f64(&self, subsystem: &str, unit: usize, field: &str) -> Option<f64> {
        self.get_unit(subsystem, unit, field).and_then(|v| v.as_f64())
    }

    /// Digital inputs are raw bits; an input is tripped when its bit is set.
    fn input_tripped(&self, input: u8) -> Option<bool> {
        if input >= 64 {
            return None;
        }
        let word = self.get(DIGITAL_INPUTS, DIGITAL_INPUT_WORD)?.as_u64()?;
        Some(word & (1u64 << input) != 0)
    }
}

/// Shared, read-mostly view of the most recent status frame.
///
/// Only the status updater writes; everybody else reads. A store is invalid
/// until its first frame decodes and never becomes invalid again.
#[derive(Debug)]
pub struct StateStore {
    codec: Codec,
    current: RwLock<Option<Arc<StateSnapshot>>>,
    updates: AtomicU64,
}

impl StateStore {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            current: RwLock::new(None),
            updates: AtomicU64::new(0),
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn is_valid(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn snapshot(&self) -> Option<Arc<StateSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }

    /// Decode `frame` and swap it in. On error the store is left untouched.
    pub fn update(&self, frame: &[u8]) -> HalResult<()> {
        let snapshot = match self.codec.decode_snapshot(frame) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(len = frame.len(), error = %e, "dropping status frame");
                return Err(e);
            }
        };
        self.install(snapshot);
        Ok(())
    }

    /// Swap in a snapshot that was decoded elsewhere.
    pub fn replace(&self, snapshot: StateSnapshot) -> HalResult<()> {
        if snapshot.schema().as_ref() != self.codec.schema().as_ref() {
            return Err(HalError::Format(
                "snapshot was built from a different schema".to_string(),
            ));
        }
        self.install(snapshot);
        Ok(())
    }

    fn install(&self, snapshot: StateSnapshot) {
        let snapshot = Arc::new(snapshot);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(snapshot);
        let count = self.updates.fetch_add(1, Ordering::AcqRel) + 1;
        drop(guard);
        debug!(count, "status snapshot updated");
    }
}

impl StateAccess for StateStore {
    fn get(&self, subsystem: &str, field: &str) -> Option<Value> {
        self.snapshot()?.get(subsystem, field).cloned()
    }

    fn get_unit(&self, subsystem: &str, unit: usize, field: &str) -> Option<Value> {
        self.snapshot()?.get_unit(subsystem, unit, field).cloned()
    }

    fn set(&self, subsystem: &str, field: &str, _value: Value) -> HalResult<()> {
        Err(HalError::ReadOnly(format!(
            "{}/{} is reported by the hardware",
            subsystem, field
        )))
    }

    fn set_unit(&self, subsystem: &str, unit: usize, field: &str, _value: Value) -> HalResult<()> {
        Err(HalError::ReadOnly(format!(
            "{}[{}]/{} is reported by the hardware",
            subsystem, unit, field
        )))
    }
}

/// Consume the inbound queue and keep `store` current until `stop` flips,
/// its sender goes away, or the queue closes.
pub fn spawn_status_updater(
    store: Arc<StateStore>,
    mut inbound: InboundReceiver,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("status updater started");
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
                message = inbound.recv() => match message {
                    Some(InboundMessage::Frame(bytes)) => {
                        // decode failures are logged by the store
                        let _ = store.update(&bytes);
                    }
                    Some(InboundMessage::Snapshot(snapshot)) => {
                        if let Err(e) = store.replace(snapshot) {
                            warn!(error = %e, "dropping status snapshot");
                        }
                    }
                    None => break,
                },
            }
        }
        info!(updates = store.update_count(), "status updater stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::schema::build_schema;

    fn store() -> StateStore {
        let schema = build_schema(&SystemConfig::bundled().unwrap()).unwrap();
        StateStore::new(Codec::new(schema))
    }

    #[test]
    fn test_store_starts_invalid() {
        let store = store();
        assert!(!store.is_valid());
        assert!(store.snapshot().is_none());
        assert_eq!(store.get("Header", "packet_id"), None);
        assert_eq!(store.update_count(), 0);
    }

    #[test]
    fn test_update_makes_store_valid() {
        let store = store();
        let frame = vec![0u8; store.codec().frame_len()];
        store.update(&frame).unwrap();
        assert!(store.is_valid());
        assert_eq!(store.update_count(), 1);
        assert_eq!(store.get("Header", "packet_type"), Some(Value::I32(0)));
    }

    #[test]
    fn test_failed_update_leaves_store_unchanged() {
        let store = store();
        let mut frame = vec![0u8; store.codec().frame_len()];
        frame[0] = 63;
        store.update(&frame).unwrap();
        let before = store.snapshot().unwrap();

        assert!(store.update(&frame[1..]).is_err());
        assert!(store.is_valid());
        assert_eq!(store.update_count(), 1);
        assert_eq!(*store.snapshot().unwrap(), *before);
    }

    #[test]
    fn test_external_writes_are_read_only() {
        let store = store();
        assert!(matches!(
            store.set("Valves", "state0", Value::U16(1)),
            Err(HalError::ReadOnly(_))
        ));
        assert!(matches!(
            store.set_unit("Mixers", 0, "period", Value::I32(1)),
            Err(HalError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_snapshot_set_coerces_and_checks_units() {
        let schema = build_schema(&SystemConfig::bundled().unwrap()).unwrap();
        let mut snapshot = StateSnapshot::zeroed(schema);
        snapshot.set("DigitalInputs", "state", Value::I64(4095)).unwrap();
        assert_eq!(snapshot.get("DigitalInputs", "state"), Some(&Value::U16(4095)));

        snapshot
            .set_unit("Thermocouples", 8, "temperature", Value::F64(25.0))
            .unwrap();
        assert_eq!(
            snapshot.get_unit("Thermocouples", 8, "temperature"),
            Some(&Value::F32(25.0))
        );
        assert!(snapshot
            .set_unit("Thermocouples", 9, "temperature", Value::F64(25.0))
            .is_err());
        assert!(matches!(
            snapshot.set("Valves", "nope", Value::U16(0)),
            Err(HalError::NotFound { .. })
        ));
    }

    #[test]
    fn test_input_tripped_reads_raw_bits() {
        let store = store();
        let codec = store.codec().clone();
        let mut snapshot = StateSnapshot::zeroed(codec.schema().clone());
        snapshot.set("DigitalInputs", "state", Value::U16(0b10)).unwrap();
        store.update(&codec.encode_snapshot(&snapshot).unwrap()).unwrap();
        assert_eq!(store.input_tripped(0), Some(false));
        assert_eq!(store.input_tripped(1), Some(true));
    }
}
