use crate::error::{HalError, HalResult};
use crate::format::Value;
use crate::schema::{CommandSpec, ParamFormat, Schema};
use static_assertions::const_assert_eq;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// `i32 numeric_id || i32 device_id` ahead of the parameter bytes.
pub const COMMAND_HEADER_LEN: usize = 8;

const_assert_eq!(COMMAND_HEADER_LEN, 2 * core::mem::size_of::<i32>());

/// A device command ready to be queued.
///
/// Commands are values: addressing a unit or setting a parameter returns a
/// new command and leaves the original as it was.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    spec: Arc<CommandSpec>,
    unit_count: usize,
    param_size: usize,
    device_id: Option<u32>,
    params: Vec<Value>,
}

impl Command {
    fn fresh(spec: Arc<CommandSpec>, unit_count: usize, param_size: usize) -> Self {
        let params = spec.param_format.iter().map(|code| code.zero()).collect();
        Self {
            spec,
            unit_count,
            param_size,
            device_id: None,
            params,
        }
    }

    pub fn subsystem(&self) -> &str {
        &self.spec.subsystem
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn numeric_id(&self) -> i32 {
        self.spec.id
    }

    pub fn device_id(&self) -> Option<u32> {
        self.device_id
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn param_format(&self) -> &ParamFormat {
        &self.spec.param_format
    }

    /// Copy addressed to unit `id`, which must be in `0..unit_count`.
    pub fn for_device(&self, id: i64) -> HalResult<Command> {
        if id < 0 || id >= self.unit_count as i64 {
            return Err(HalError::Value(format!(
                "{} has no unit with device_id = {}",
                self.subsystem(),
                id
            )));
        }
        let mut cmd = self.clone();
        cmd.device_id = Some(id as u32);
        Ok(cmd)
    }

    /// Copy carrying `value` as its only parameter.
    pub fn with_param(&self, value: impl Into<Value>) -> HalResult<Command> {
        if self.spec.param_format.len() != 1 {
            return Err(HalError::Value(format!(
                "{}/{} takes {} parameters, use with_params",
                self.subsystem(),
                self.name(),
                self.spec.param_format.len()
            )));
        }
        self.with_params(vec![value.into()])
    }

    pub fn with_params(&self, values: Vec<Value>) -> HalResult<Command> {
        if values.len() != self.spec.param_format.len() {
            return Err(HalError::Value(format!(
                "{}/{} takes {} parameters, got {}",
                self.subsystem(),
                self.name(),
                self.spec.param_format.len(),
                values.len()
            )));
        }
        let params = self
            .spec
            .param_format
            .iter()
            .zip(values)
            .map(|(code, value)| code.coerce(value))
            .collect::<HalResult<Vec<_>>>()?;
        let mut cmd = self.clone();
        cmd.params = params;
        Ok(cmd)
    }

    /// Length of the serialized frame.
    pub fn frame_len(&self) -> usize {
        COMMAND_HEADER_LEN + self.spec.param_len().max(self.param_size)
    }

    /// Little-endian wire frame. The parameter region is zero-padded to the
    /// firmware's parameter slot.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.frame_len());
        out.extend_from_slice(&self.spec.id.to_le_bytes());
        let device = self.device_id.unwrap_or(0) as i32;
        out.extend_from_slice(&device.to_le_bytes());
        for value in &self.params {
            value.write_le(&mut out);
        }
        if out.len() < COMMAND_HEADER_LEN + self.param_size {
            out.resize(COMMAND_HEADER_LEN + self.param_size, 0);
        }
        out
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.subsystem(), self.name())?;
        if let Some(id) = self.device_id {
            write!(f, "[{}]", id)?;
        }
        write!(f, "(")?;
        for (i, value) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, ")")
    }
}

/// Every command the schema declares, by subsystem and name.
#[derive(Debug, Clone)]
pub struct CommandTable {
    commands: Vec<Command>,
    by_name: HashMap<(String, String), usize>,
    by_id: HashMap<i32, usize>,
}

impl CommandTable {
    pub fn new(schema: &Schema) -> Self {
        let mut commands = Vec::new();
        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();

        for sub in schema.subsystems() {
            for spec in &sub.commands {
                let index = commands.len();
                by_name.insert((sub.name.clone(), spec.name.clone()), index);
                by_id.insert(spec.id, index);
                commands.push(Command::fresh(
                    Arc::new(spec.clone()),
                    sub.unit_count,
                    schema.parameter_size(),
                ));
            }
        }

        Self {
            commands,
            by_name,
            by_id,
        }
    }

    /// Fresh, unaddressed command with zero parameters.
    pub fn lookup(&self, subsystem: &str, name: &str) -> HalResult<Command> {
        self.by_name
            .get(&(subsystem.to_string(), name.to_string()))
            .map(|&i| self.commands[i].clone())
            .ok_or_else(|| HalError::not_found(subsystem, name))
    }

    pub fn lookup_id(&self, numeric_id: i32) -> HalResult<Command> {
        self.by_id
            .get(&numeric_id)
            .map(|&i| self.commands[i].clone())
            .ok_or_else(|| HalError::not_found("command", &numeric_id.to_string()))
    }

    /// Commands in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::schema::build_schema;

    fn table() -> CommandTable {
        let schema = build_schema(&SystemConfig::bundled().unwrap()).unwrap();
        CommandTable::new(&schema)
    }

    #[test]
    fn test_valve_state_frame() {
        let cmd = table()
            .lookup("Valves", "set_state0")
            .unwrap()
            .with_param(0xAAAAu32)
            .unwrap();
        assert_eq!(
            cmd.to_bytes(),
            vec![0x0a, 0, 0, 0, 0, 0, 0, 0, 0xaa, 0xaa, 0, 0]
        );
    }

    #[test]
    fn test_fresh_command_has_zero_param() {
        let cmd = table().lookup("TemperatureControllers", "set_setpoint").unwrap();
        assert_eq!(cmd.params(), &[Value::F32(0.0)]);
        assert_eq!(cmd.device_id(), None);
        assert_eq!(cmd.frame_len(), 12);
    }

    #[test]
    fn test_for_device_range() {
        let cmd = table().lookup("Mixers", "set_period").unwrap();
        assert_eq!(cmd.for_device(0).unwrap().device_id(), Some(0));
        assert_eq!(cmd.for_device(3).unwrap().device_id(), Some(3));
        assert!(matches!(cmd.for_device(4), Err(HalError::Value(_))));
        assert!(matches!(cmd.for_device(-1), Err(HalError::Value(_))));
    }

    #[test]
    fn test_for_device_leaves_original_untouched() {
        let cmd = table().lookup("Mixers", "set_period").unwrap();
        let addressed = cmd.for_device(2).unwrap().with_param(100).unwrap();
        assert_eq!(cmd.device_id(), None);
        assert_eq!(cmd.params(), &[Value::I32(0)]);
        assert_eq!(addressed.device_id(), Some(2));
        assert_eq!(addressed.params(), &[Value::I32(100)]);
    }

    #[test]
    fn test_no_units_means_no_device_ids() {
        let cmd = table().lookup("Valves", "set_state1").unwrap();
        assert!(cmd.for_device(0).is_err());
    }

    #[test]
    fn test_param_coercion_errors() {
        let cmd = table().lookup("Valves", "set_state0").unwrap();
        assert!(matches!(cmd.with_param(0x1_0000), Err(HalError::Value(_))));
        assert!(matches!(cmd.with_param(1.5f32), Err(HalError::Type(_))));
        assert!(matches!(
            cmd.with_params(vec![Value::U16(1), Value::U16(2)]),
            Err(HalError::Value(_))
        ));
    }

    #[test]
    fn test_lookup_errors_and_ids() {
        let table = table();
        assert!(matches!(
            table.lookup("Valves", "explode"),
            Err(HalError::NotFound { .. })
        ));
        assert_eq!(table.lookup_id(21).unwrap().name(), "turn_on");
        assert_eq!(table.lookup_id(21).unwrap().subsystem(), "TemperatureControllers");
        assert!(table.lookup_id(999).is_err());
    }

    #[test]
    fn test_display() {
        let cmd = table()
            .lookup("Mixers", "set_duty_cycle")
            .unwrap()
            .for_device(1)
            .unwrap()
            .with_param(0.5f32)
            .unwrap();
        assert_eq!(cmd.to_string(), "Mixers.set_duty_cycle[1](0.5)");
    }
}
