//! Actuator travel time.
//!
//! A pneumatic actuator moved by a pair of valve bits reports its new end
//! position on a digital input right away, but only releases the old end
//! position once it has physically travelled. Each rule models one such
//! direction of travel.
//!
//! Every input bit carries a generation that moves on each time a rule sets
//! it. A pending clear only lands if its bit's generation is unchanged, so
//! a reversed actuator is not released by the timer of its earlier move.

use super::state::SimulatedState;
use crate::config::TravelRuleConfig;
use crate::error::{HalError, HalResult};
use crate::format::Value;
use crate::state::{StateAccess, DIGITAL_INPUTS, DIGITAL_INPUT_WORD};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

pub const VALVES: &str = "Valves";

#[derive(Debug, Clone, PartialEq)]
pub struct TravelRule {
    pub label: String,
    pub driven: String,
    pub opposite: String,
    pub valve_bit: u8,
    pub set_bit: u8,
    pub clear_bit: u8,
    pub delay: Duration,
}

impl TryFrom<&TravelRuleConfig> for TravelRule {
    type Error = HalError;

    fn try_from(config: &TravelRuleConfig) -> HalResult<Self> {
        for (what, bit) in [
            ("valve_bit", config.valve_bit),
            ("set_bit", config.set_bit),
            ("clear_bit", config.clear_bit),
        ] {
            if bit >= 64 {
                return Err(HalError::Config(format!(
                    "travel rule '{}': {} {} is out of range",
                    config.label, what, bit
                )));
            }
        }
        Ok(Self {
            label: config.label.clone(),
            driven: config.driven.clone(),
            opposite: config.opposite.clone(),
            valve_bit: config.valve_bit,
            set_bit: config.set_bit,
            clear_bit: config.clear_bit,
            delay: Duration::from_millis(config.delay_ms),
        })
    }
}

impl TravelRule {
    /// Driven bit set, opposite bit clear.
    pub fn triggered(&self, driven_word: u64, opposite_word: u64) -> bool {
        let mask = 1u64 << self.valve_bit;
        driven_word & mask != 0 && opposite_word & mask == 0
    }
}

type Generations = Arc<[AtomicU64; 64]>;

#[derive(Debug, Clone)]
pub struct TravelModel {
    rules: Vec<TravelRule>,
    generations: Generations,
}

impl Default for TravelModel {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl TravelModel {
    pub fn new(rules: Vec<TravelRule>) -> Self {
        Self {
            rules,
            generations: Arc::new(std::array::from_fn(|_| AtomicU64::new(0))),
        }
    }

    pub fn from_config(rules: &[TravelRuleConfig]) -> HalResult<Self> {
        let rules = rules
            .iter()
            .map(TravelRule::try_from)
            .collect::<HalResult<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &[TravelRule] {
        &self.rules
    }

    /// Rules that fire for the valve words currently in `state`.
    pub fn triggered(&self, state: &SimulatedState) -> Vec<&TravelRule> {
        let word = |name: &str| {
            state
                .get(VALVES, name)
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        self.rules
            .iter()
            .filter(|rule| rule.triggered(word(&rule.driven), word(&rule.opposite)))
            .collect()
    }

    /// Apply every triggered rule: set its input now, clear the other end
    /// once the travel delay has passed, unless that end was set again in
    /// the meantime. Timers run on the current tokio runtime.
    pub fn evaluate(&self, state: &SimulatedState) -> HalResult<usize> {
        let fired = self.triggered(state);
        if fired.is_empty() {
            return Ok(0);
        }
        let runtime = Handle::try_current()
            .map_err(|e| HalError::Transport(format!("travel timers need a runtime: {}", e)))?;

        for rule in &fired {
            debug!(rule = %rule.label, set = rule.set_bit, clear = rule.clear_bit, "actuator travelling");
            self.generations[usize::from(rule.set_bit)].fetch_add(1, Ordering::SeqCst);
            update_input(state, rule.set_bit, true)?;

            let state = state.clone();
            let rule = (*rule).clone();
            let generations = Arc::clone(&self.generations);
            let armed = generations[usize::from(rule.clear_bit)].load(Ordering::SeqCst);
            runtime.spawn(async move {
                tokio::time::sleep(rule.delay).await;
                if generations[usize::from(rule.clear_bit)].load(Ordering::SeqCst) != armed {
                    debug!(rule = %rule.label, bit = rule.clear_bit, "travel superseded");
                    return;
                }
                match update_input(&state, rule.clear_bit, false) {
                    Ok(()) => debug!(rule = %rule.label, bit = rule.clear_bit, "actuator arrived"),
                    Err(e) => warn!(rule = %rule.label, error = %e, "travel timer failed"),
                }
            });
        }
        Ok(fired.len())
    }
}

/// Set or clear one bit of the digital input word.
pub fn update_input(state: &SimulatedState, bit: u8, on: bool) -> HalResult<()> {
    state.with(|snapshot| -> HalResult<()> {
        let word = snapshot
            .get(DIGITAL_INPUTS, DIGITAL_INPUT_WORD)
            .and_then(Value::as_u64)
            .ok_or_else(|| HalError::not_found(DIGITAL_INPUTS, DIGITAL_INPUT_WORD))?;
        let mask = 1u64 << bit;
        let word = if on { word | mask } else { word & !mask };
        snapshot.set(DIGITAL_INPUTS, DIGITAL_INPUT_WORD, Value::U64(word))
    })
}
