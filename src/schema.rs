use crate::config::{CommandConfig, SubsystemConfig, SystemConfig};
use crate::error::{HalError, HalResult};
use crate::format::{format_string, parse_format, FormatCode};
use heapless::Vec as BoundedVec;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Upper bound on the codes in one command parameter format.
pub const MAX_PARAM_CODES: usize = 8;

pub type ParamFormat = BoundedVec<FormatCode, MAX_PARAM_CODES>;

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub code: FormatCode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub subsystem: String,
    pub name: String,
    pub id: i32,
    pub param_format: ParamFormat,
}

impl CommandSpec {
    pub fn param_len(&self) -> usize {
        self.param_format.iter().map(FormatCode::size).sum()
    }

    pub fn format_str(&self) -> String {
        format_string(&self.param_format)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubsystemSpec {
    pub name: String,
    pub short_name: String,
    /// Zero when the subsystem has no unit concept.
    pub unit_count: usize,
    pub scalar_fields: Vec<FieldSpec>,
    pub repeated_fields: Vec<FieldSpec>,
    pub commands: Vec<CommandSpec>,
}

impl SubsystemSpec {
    pub fn scalar_index(&self, name: &str) -> Option<usize> {
        self.scalar_fields.iter().position(|f| f.name == name)
    }

    pub fn repeated_index(&self, name: &str) -> Option<usize> {
        self.repeated_fields.iter().position(|f| f.name == name)
    }

    pub fn command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Bytes this subsystem contributes to a status frame.
    pub fn frame_len(&self) -> usize {
        let scalars: usize = self.scalar_fields.iter().map(|f| f.code.size()).sum();
        let unit: usize = self.repeated_fields.iter().map(|f| f.code.size()).sum();
        scalars + unit * self.unit_count
    }
}

/// Ordered, immutable device description. Built once, shared by `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    subsystems: Vec<SubsystemSpec>,
    parameter_size: usize,
}

impl Schema {
    pub fn subsystems(&self) -> &[SubsystemSpec] {
        &self.subsystems
    }

    pub fn subsystem(&self, name: &str) -> Option<&SubsystemSpec> {
        self.subsystems.iter().find(|s| s.name == name)
    }

    pub fn subsystem_index(&self, name: &str) -> Option<usize> {
        self.subsystems.iter().position(|s| s.name == name)
    }

    pub fn parameter_size(&self) -> usize {
        self.parameter_size
    }

    pub fn frame_len(&self) -> usize {
        self.subsystems.iter().map(SubsystemSpec::frame_len).sum()
    }

    /// Number of values in one status frame.
    pub fn field_count(&self) -> usize {
        self.subsystems
            .iter()
            .map(|s| s.scalar_fields.len() + s.repeated_fields.len() * s.unit_count)
            .sum()
    }

    pub fn commands(&self) -> impl Iterator<Item = &CommandSpec> {
        self.subsystems.iter().flat_map(|s| s.commands.iter())
    }
}

/// Validate the configuration and build the layout every other component
/// derives from.
pub fn build_schema(config: &SystemConfig) -> HalResult<Arc<Schema>> {
    let mut subsystems = Vec::with_capacity(config.subsystems.len());
    let mut subsystem_names = HashSet::new();
    let mut command_ids = HashSet::new();

    for sub in &config.subsystems {
        if sub.name.trim().is_empty() {
            return Err(HalError::Config("subsystem with empty name".to_string()));
        }
        if !subsystem_names.insert(sub.name.clone()) {
            return Err(HalError::Config(format!("duplicate subsystem {}", sub.name)));
        }

        let spec = build_subsystem(sub, &mut command_ids)?;
        debug!(
            subsystem = %spec.name,
            units = spec.unit_count,
            bytes = spec.frame_len(),
            "schema subsystem"
        );
        subsystems.push(spec);
    }

    Ok(Arc::new(Schema {
        subsystems,
        parameter_size: config.command_format.parameter_size,
    }))
}

fn build_subsystem(sub: &SubsystemConfig, command_ids: &mut HashSet<i32>) -> HalResult<SubsystemSpec> {
    let message_format = sub.message_format.clone().unwrap_or_default();

    let mut scalar_fields = Vec::new();
    for (name, code) in &message_format.fields {
        let codes = parse_format(code)?;
        for (i, code) in codes.into_iter().enumerate() {
            let name = if i == 0 {
                name.clone()
            } else {
                format!("{}_{}", name, i)
            };
            scalar_fields.push(FieldSpec { name, code });
        }
    }
    check_unique_fields(&sub.name, &scalar_fields)?;

    let mut repeated_fields = Vec::new();
    for (name, code) in &message_format.repeat {
        let codes = parse_format(code)?;
        if codes.len() != 1 {
            return Err(HalError::Config(format!(
                "{}: repeated field {} must be a single code, got \"{}\"",
                sub.name, name, code
            )));
        }
        repeated_fields.push(FieldSpec {
            name: name.clone(),
            code: codes[0],
        });
    }
    check_unique_fields(&sub.name, &repeated_fields)?;

    if !repeated_fields.is_empty() && sub.count.is_none() {
        return Err(HalError::Config(format!(
            "{}: repeated block without a unit count",
            sub.name
        )));
    }

    let mut commands = Vec::with_capacity(sub.commands.len());
    for cmd in &sub.commands {
        if commands.iter().any(|c: &CommandSpec| c.name == cmd.name) {
            return Err(HalError::Config(format!(
                "{}: duplicate command {}",
                sub.name, cmd.name
            )));
        }
        if !command_ids.insert(cmd.id) {
            return Err(HalError::Config(format!(
                "{}: command id {} is already in use",
                sub.name, cmd.id
            )));
        }
        commands.push(build_command(&sub.name, cmd)?);
    }

    Ok(SubsystemSpec {
        name: sub.name.clone(),
        short_name: sub.short_name.clone().unwrap_or_else(|| sub.name.clone()),
        unit_count: sub.count.unwrap_or(0),
        scalar_fields,
        repeated_fields,
        commands,
    })
}

fn build_command(subsystem: &str, cmd: &CommandConfig) -> HalResult<CommandSpec> {
    if cmd.name.trim().is_empty() {
        return Err(HalError::Config(format!("{}: command with empty name", subsystem)));
    }
    let mut param_format = ParamFormat::new();
    for code in parse_format(&cmd.format)? {
        param_format.push(code).map_err(|_| {
            HalError::Config(format!(
                "{}/{}: more than {} parameter codes",
                subsystem, cmd.name, MAX_PARAM_CODES
            ))
        })?;
    }
    Ok(CommandSpec {
        subsystem: subsystem.to_string(),
        name: cmd.name.clone(),
        id: cmd.id,
        param_format,
    })
}

fn check_unique_fields(subsystem: &str, fields: &[FieldSpec]) -> HalResult<()> {
    let mut seen = HashSet::new();
    for field in fields {
        if field.name.trim().is_empty() {
            return Err(HalError::Config(format!("{}: field with empty name", subsystem)));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(HalError::Config(format!(
                "{}: duplicate field {}",
                subsystem, field.name
            )));
        }
    }
    Ok(())
}
