//! System configuration: the device description plus the runtime knobs of
//! the server, the simulator and the control box.
//!
//! Subsystems, their fields and their commands are ordered JSON arrays so
//! the wire layout follows declaration order exactly.

use crate::error::{HalError, HalResult};
use crate::format::Value;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Device description bundled with the crate.
pub const DEFAULT_CONFIG: &str = include_str!("../config/elixys.json");

fn default_parameter_size() -> usize {
    4
}

fn default_bind() -> String {
    "0.0.0.0:8888".to_string()
}

fn default_path() -> String {
    "/ws".to_string()
}

fn default_send_period_ms() -> u64 {
    100
}

fn default_send_timeout_ms() -> u64 {
    2_000
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_url() -> String {
    "ws://127.0.0.1:8888/ws".to_string()
}

fn default_status_period_ms() -> u64 {
    200
}

fn default_drift_period_ms() -> u64 {
    500
}

fn default_ambient_c() -> f64 {
    25.0
}

fn default_drift_up_c() -> f64 {
    0.5
}

fn default_drift_down_c() -> f64 {
    0.05
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud() -> u32 {
    115_200
}

fn default_scale() -> [f64; 2] {
    [1.0, 1.0]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub subsystems: Vec<SubsystemConfig>,
    #[serde(default)]
    pub command_format: CommandFormatConfig,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub simulator: SimulatorSection,
    #[serde(default)]
    pub control_box: ControlBoxSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemConfig {
    pub name: String,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub message_format: Option<MessageFormatConfig>,
    #[serde(default)]
    pub commands: Vec<CommandConfig>,
}

/// Scalar fields and the per-unit `repeat` block, each as `[name, code]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageFormatConfig {
    #[serde(default)]
    pub fields: Vec<(String, String)>,
    #[serde(default)]
    pub repeat: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    pub name: String,
    pub id: i32,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFormatConfig {
    /// Width of the firmware's fixed parameter slot.
    #[serde(default = "default_parameter_size")]
    pub parameter_size: usize,
}

impl Default for CommandFormatConfig {
    fn default() -> Self {
        Self {
            parameter_size: default_parameter_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_send_period_ms")]
    pub send_period_ms: u64,
    /// Longest a single outbound drain may block before the client is dropped.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            path: default_path(),
            send_period_ms: default_send_period_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ServerSection {
    pub fn send_period(&self) -> Duration {
        Duration::from_millis(self.send_period_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorSection {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_status_period_ms")]
    pub status_period_ms: u64,
    #[serde(default = "default_drift_period_ms")]
    pub drift_period_ms: u64,
    #[serde(default = "default_ambient_c")]
    pub ambient_c: f64,
    #[serde(default = "default_drift_up_c")]
    pub drift_up_c: f64,
    #[serde(default = "default_drift_down_c")]
    pub drift_down_c: f64,
    #[serde(default)]
    pub initial: Vec<InitialValue>,
    #[serde(default)]
    pub travel_rules: Vec<TravelRuleConfig>,
}

impl Default for SimulatorSection {
    fn default() -> Self {
        Self {
            url: default_url(),
            status_period_ms: default_status_period_ms(),
            drift_period_ms: default_drift_period_ms(),
            ambient_c: default_ambient_c(),
            drift_up_c: default_drift_up_c(),
            drift_down_c: default_drift_down_c(),
            initial: Vec::new(),
            travel_rules: Vec::new(),
        }
    }
}

impl SimulatorSection {
    pub fn status_period(&self) -> Duration {
        Duration::from_millis(self.status_period_ms)
    }

    pub fn drift_period(&self) -> Duration {
        Duration::from_millis(self.drift_period_ms)
    }
}

/// Power-on override for one field. Without `unit` a repeated field is set
/// on every unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialValue {
    pub subsystem: String,
    pub field: String,
    #[serde(default)]
    pub unit: Option<usize>,
    pub value: serde_json::Value,
}

impl InitialValue {
    /// Typed value ready for coercion into the field's format.
    pub fn typed_value(&self) -> HalResult<Value> {
        match &self.value {
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Ok(Value::I64(v))
                } else if let Some(v) = n.as_u64() {
                    Ok(Value::U64(v))
                } else if let Some(v) = n.as_f64() {
                    Ok(Value::F64(v))
                } else {
                    Err(HalError::Config(format!("unrepresentable number {}", n)))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Bytes(s.as_bytes().to_vec())),
            other => Err(HalError::Config(format!(
                "initial value for {}/{} must be a number, bool or string, got {}",
                self.subsystem, self.field, other
            ))),
        }
    }
}

/// One travel-time rule, see [`crate::simulator::travel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TravelRuleConfig {
    pub label: String,
    pub driven: String,
    pub opposite: String,
    pub valve_bit: u8,
    pub set_bit: u8,
    pub clear_bit: u8,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlBoxSection {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_scale")]
    pub adc_scale: [f64; 2],
    #[serde(default = "default_scale")]
    pub dac_scale: [f64; 2],
}

impl Default for ControlBoxSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            adc_scale: default_scale(),
            dac_scale: default_scale(),
        }
    }
}

impl SystemConfig {
    /// Environment variable naming a config file that overrides the default.
    pub const ENV_CONFIG_PATH: &'static str = "ELIXYS_HAL_CONFIG";

    pub fn from_json_str(text: &str) -> HalResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| HalError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Runtime settings every task relies on. Timer periods must be non-zero.
    pub fn validate(&self) -> HalResult<()> {
        for (name, ms) in [
            ("server.send_period_ms", self.server.send_period_ms),
            ("server.send_timeout_ms", self.server.send_timeout_ms),
            ("server.handshake_timeout_ms", self.server.handshake_timeout_ms),
            ("simulator.status_period_ms", self.simulator.status_period_ms),
            ("simulator.drift_period_ms", self.simulator.drift_period_ms),
        ] {
            if ms == 0 {
                return Err(HalError::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> HalResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HalError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "loaded configuration");
        Self::from_json_str(&text)
    }

    /// Explicit path if given, then `ELIXYS_HAL_CONFIG`, then the bundled document.
    pub fn resolve(path: Option<&str>) -> HalResult<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return Self::load(env_path);
        }
        Self::bundled()
    }

    pub fn bundled() -> HalResult<Self> {
        Self::from_json_str(DEFAULT_CONFIG)
    }

    pub fn subsystem(&self, name: &str) -> Option<&SubsystemConfig> {
        self.subsystems.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_config_parses() {
        let config = SystemConfig::bundled().unwrap();
        assert_eq!(config.subsystems.len(), 12);
        assert_eq!(config.subsystems[0].name, "Header");
        assert_eq!(config.command_format.parameter_size, 4);
        assert_eq!(config.server.send_period(), Duration::from_millis(100));
        assert_eq!(config.simulator.travel_rules.len(), 12);
    }

    #[test]
    fn test_sections_default_when_missing() {
        let config = SystemConfig::from_json_str(r#"{"subsystems": []}"#).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8888");
        assert_eq!(config.simulator.status_period_ms, 200);
        assert_eq!(config.simulator.ambient_c, 25.0);
        assert!(config.simulator.travel_rules.is_empty());
    }

    #[test]
    fn test_field_order_is_preserved() {
        let config = SystemConfig::bundled().unwrap();
        let valves = config.subsystem("Valves").unwrap();
        let names: Vec<&str> = valves
            .message_format
            .as_ref()
            .unwrap()
            .fields
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, vec!["error_code", "state0", "state1", "state2"]);
    }

    #[test]
    fn test_zero_periods_rejected() {
        for section in [
            r#""server":{"send_period_ms":0}"#,
            r#""server":{"send_timeout_ms":0}"#,
            r#""simulator":{"status_period_ms":0}"#,
            r#""simulator":{"drift_period_ms":0}"#,
        ] {
            let text = format!(r#"{{"subsystems": [], {}}}"#, section);
            assert!(
                matches!(SystemConfig::from_json_str(&text), Err(HalError::Config(_))),
                "accepted {}",
                section
            );
        }
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let result = SystemConfig::from_json_str("{ not json");
        assert!(matches!(result, Err(HalError::Config(_))));
    }

    #[test]
    fn test_initial_value_typing() {
        let initial = InitialValue {
            subsystem: "Header".into(),
            field: "packet_type".into(),
            unit: None,
            value: serde_json::json!(63),
        };
        assert_eq!(initial.typed_value().unwrap(), Value::I64(63));

        let initial = InitialValue {
            value: serde_json::json!(25.0),
            ..initial
        };
        assert_eq!(initial.typed_value().unwrap(), Value::F64(25.0));
    }
}
