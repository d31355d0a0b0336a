//! Simulation and session configuration.
//!
//! Both structs are plain data threaded through constructors. Serialization
//! is derived so an external persistence layer can own the on-disk format.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDefinition {
    pub name: String,
    pub steps: usize,
}

impl RowDefinition {
    pub fn new(name: impl Into<String>, steps: usize) -> Self {
        Self { name: name.into(), steps }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    pub rows: Vec<RowDefinition>,
    pub initial_chance: f64,
    pub minimal_chance: f64,
    pub maximal_chance: f64,
    pub success_chance_change: f64,
    pub failure_chance_change: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            rows: vec![
                RowDefinition::new("primary", 10),
                RowDefinition::new("secondary", 10),
                RowDefinition::new("negative", 10),
            ],
            initial_chance: 0.75,
            minimal_chance: 0.25,
            maximal_chance: 0.75,
            success_chance_change: -0.1,
            failure_chance_change: 0.1,
        }
    }
}

impl SimulationConfig {
    /// Defaults overridden by `SIM_*` environment variables.
    ///
    /// `SIM_ROW_STEPS` sets the step count of every default row.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let steps: Option<usize> = std::env::var("SIM_ROW_STEPS").ok().and_then(|v| v.parse().ok());
        Self {
            rows: match steps {
                Some(steps) => defaults.rows.iter().map(|r| RowDefinition::new(r.name.clone(), steps)).collect(),
                None => defaults.rows,
            },
            initial_chance: std::env::var("SIM_INITIAL_CHANCE").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.initial_chance),
            minimal_chance: std::env::var("SIM_MINIMAL_CHANCE").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.minimal_chance),
            maximal_chance: std::env::var("SIM_MAXIMAL_CHANCE").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.maximal_chance),
            success_chance_change: std::env::var("SIM_SUCCESS_CHANGE").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.success_chance_change),
            failure_chance_change: std::env::var("SIM_FAILURE_CHANGE").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.failure_chance_change),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rows.is_empty() {
            return Err(SimError::InvalidConfig("at least one row is required".into()));
        }
        if let Some(row) = self.rows.iter().find(|r| r.steps == 0) {
            return Err(SimError::InvalidConfig(format!("row '{}' has no steps", row.name)));
        }
        for (name, value) in [
            ("initialChance", self.initial_chance),
            ("minimalChance", self.minimal_chance),
            ("maximalChance", self.maximal_chance),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SimError::InvalidConfig(format!("{} {} outside [0, 1]", name, value)));
            }
        }
        if !self.success_chance_change.is_finite() || !self.failure_chance_change.is_finite() {
            return Err(SimError::InvalidConfig("chance changes must be finite".into()));
        }
        if !(self.minimal_chance <= self.initial_chance && self.initial_chance <= self.maximal_chance) {
            return Err(SimError::InvalidConfig(format!(
                "expected minimal ({}) <= initial ({}) <= maximal ({})",
                self.minimal_chance, self.initial_chance, self.maximal_chance
            )));
        }
        Ok(())
    }

    pub fn total_steps(&self) -> usize {
        self.rows.iter().map(|r| r.steps).sum()
    }
}

/// Partial configuration merged over [`SimulationConfig::default`].
///
/// A provided `rows` list replaces the default rows entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationOverrides {
    pub rows: Option<Vec<RowDefinition>>,
    pub initial_chance: Option<f64>,
    pub minimal_chance: Option<f64>,
    pub maximal_chance: Option<f64>,
    pub success_chance_change: Option<f64>,
    pub failure_chance_change: Option<f64>,
}

impl SimulationOverrides {
    pub fn merge_over(self, base: SimulationConfig) -> SimulationConfig {
        SimulationConfig {
            rows: self.rows.unwrap_or(base.rows),
            initial_chance: self.initial_chance.unwrap_or(base.initial_chance),
            minimal_chance: self.minimal_chance.unwrap_or(base.minimal_chance),
            maximal_chance: self.maximal_chance.unwrap_or(base.maximal_chance),
            success_chance_change: self.success_chance_change.unwrap_or(base.success_chance_change),
            failure_chance_change: self.failure_chance_change.unwrap_or(base.failure_chance_change),
        }
    }

    /// Merge over defaults and validate.
    pub fn resolve(self) -> Result<SimulationConfig> {
        let cfg = self.merge_over(SimulationConfig::default());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SimError::InvalidConfig(e.to_string()))
    }
}

/// Pacing preferences for interactive runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Delay between steps in timed mode.
    pub delay_ms: u64,
    /// When set, every step waits for an explicit advance signal.
    pub step_by_step: bool,
    pub last_used_strategy_name: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            delay_ms: 100,
            step_by_step: false,
            last_used_strategy_name: None,
        }
    }
}

impl SessionSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            delay_ms: std::env::var("STEP_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.delay_ms),
            step_by_step: std::env::var("STEP_BY_STEP").map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes")).unwrap_or(defaults.step_by_step),
            last_used_strategy_name: None,
        }
    }
}
