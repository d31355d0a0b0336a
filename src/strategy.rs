//! Strategy API: decision functions, metadata and the per-strategy run lock.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::error::{Result, SimError};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::script;
use crate::sim::RowState;

/// Picks the next row to roll.
///
/// Receives the row outcomes, remaining steps per row, the current chance and
/// the simulation config, and returns a row index. Returning an index that
/// cannot be advanced aborts the run.
pub trait DecisionFunction: Send + Sync {
    fn decide(&self, rows: &[RowState], remaining: &[usize], chance: f64, config: &SimulationConfig) -> i64;
}

impl<F> DecisionFunction for F
where
    F: Fn(&[RowState], &[usize], f64, &SimulationConfig) -> i64 + Send + Sync,
{
    fn decide(&self, rows: &[RowState], remaining: &[usize], chance: f64, config: &SimulationConfig) -> i64 {
        self(rows, remaining, chance, config)
    }
}

/// First row in `order` with at least one remaining step, else `fallback`.
pub fn remaining_in_order(remaining: &[usize], order: &[usize], fallback: i64) -> i64 {
    order
        .iter()
        .find(|&&row| remaining.get(row).copied().unwrap_or(0) > 0)
        .map(|&row| row as i64)
        .unwrap_or(fallback)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Finished,
    Aborted,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Finished => "finished",
            RunState::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyMetadata {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub author: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub enum Implementation {
    /// Decision logic compiled into the host program.
    Native(Arc<dyn DecisionFunction>),
    /// Rule source compiled by [`script::compile`].
    Source(String),
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Implementation::Native(_) => f.write_str("Native(..)"),
            Implementation::Source(src) => f.debug_tuple("Source").field(src).finish(),
        }
    }
}

/// Raw registration input.
#[derive(Debug, Clone)]
pub struct StrategyDefinition {
    pub metadata: StrategyMetadata,
    pub implementation: Implementation,
}

impl StrategyDefinition {
    pub fn native<F>(name: &str, description: &str, decide: F) -> Self
    where
        F: DecisionFunction + 'static,
    {
        Self::new(name, description, Implementation::Native(Arc::new(decide)))
    }

    pub fn source(name: &str, description: &str, source: &str) -> Self {
        Self::new(name, description, Implementation::Source(source.to_string()))
    }

    fn new(name: &str, description: &str, implementation: Implementation) -> Self {
        Self {
            metadata: StrategyMetadata {
                name: name.to_string(),
                description: description.to_string(),
                tags: BTreeSet::new(),
                author: None,
                last_modified: None,
            },
            implementation,
        }
    }

    pub fn with_tags<'a>(mut self, tags: impl IntoIterator<Item = &'a str>) -> Self {
        self.metadata.tags.extend(tags.into_iter().map(str::to_string));
        self
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.metadata.author = Some(author.to_string());
        self
    }

    pub fn modified_at(mut self, ts: DateTime<Utc>) -> Self {
        self.metadata.last_modified = Some(ts);
        self
    }
}

/// A registered strategy.
///
/// A strategy whose source failed to compile stays registered without a
/// decision function until [`Strategy::recompile`] succeeds.
pub struct Strategy {
    metadata: StrategyMetadata,
    decision: RwLock<Option<Arc<dyn DecisionFunction>>>,
    source: RwLock<Option<String>>,
    compile_error: RwLock<Option<SimError>>,
    run_state: Mutex<RunState>,
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("metadata", &self.metadata)
            .field("run_state", &self.run_state())
            .finish_non_exhaustive()
    }
}

impl Strategy {
    pub fn from_definition(definition: StrategyDefinition) -> Self {
        let strategy = Self {
            metadata: definition.metadata,
            decision: RwLock::new(None),
            source: RwLock::new(None),
            compile_error: RwLock::new(None),
            run_state: Mutex::new(RunState::Idle),
        };
        match definition.implementation {
            Implementation::Native(decide) => {
                *strategy.decision.write().unwrap_or_else(PoisonError::into_inner) = Some(decide);
            }
            Implementation::Source(source) => {
                // A failed compile is kept on the strategy, not returned.
                let _ = strategy.recompile(&source);
            }
        }
        strategy
    }

    pub fn metadata(&self) -> &StrategyMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_built_in(&self) -> bool {
        self.metadata.tags.contains("built-in")
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.metadata.name = name;
    }

    /// Source text for script strategies (normalized).
    pub fn source(&self) -> Option<String> {
        self.source.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn compile_error(&self) -> Option<SimError> {
        self.compile_error.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn decision_function(&self) -> Option<Arc<dyn DecisionFunction>> {
        self.decision.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the decision function with one compiled from `source`.
    ///
    /// On failure the previous decision function is dropped, and the error is
    /// both stored and returned.
    pub fn recompile(&self, source: &str) -> Result<()> {
        let normalized = script::normalize_indent(source);
        let compiled = script::compile(&normalized);
        *self.source.write().unwrap_or_else(PoisonError::into_inner) = Some(normalized);
        let mut decision = self.decision.write().unwrap_or_else(PoisonError::into_inner);
        let mut error = self.compile_error.write().unwrap_or_else(PoisonError::into_inner);
        match compiled {
            Ok(program) => {
                *decision = Some(Arc::new(program));
                *error = None;
                Ok(())
            }
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Registry,
                    "compile_failed",
                    obj(&[("strategy", v_str(self.name())), ("msg", v_str(&err.to_string()))]),
                );
                *decision = None;
                *error = Some(err.clone());
                Err(err)
            }
        }
    }

    pub fn run_state(&self) -> RunState {
        *self.run_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the run lock; fails fast if a run is already active.
    pub fn begin_run(&self) -> Result<RunGuard<'_>> {
        let mut state = self.run_state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == RunState::Running {
            return Err(SimError::RunAlreadyInProgress { name: self.metadata.name.clone() });
        }
        *state = RunState::Running;
        Ok(RunGuard { strategy: self, outcome: RunState::Aborted })
    }
}

/// Holds a strategy in `Running`; releases it on drop.
///
/// Dropping without [`RunGuard::finish`] records `Aborted`, which covers
/// errors, cancellation and a dropped run future alike.
#[derive(Debug)]
pub struct RunGuard<'a> {
    strategy: &'a Strategy,
    outcome: RunState,
}

impl RunGuard<'_> {
    pub fn finish(mut self) {
        self.outcome = RunState::Finished;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.strategy.run_state.lock().unwrap_or_else(PoisonError::into_inner) = self.outcome;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_row(_: &[RowState], remaining: &[usize], _: f64, _: &SimulationConfig) -> i64 {
        remaining_in_order(remaining, &[0, 1, 2], -1)
    }

    #[test]
    fn test_remaining_in_order() {
        assert_eq!(remaining_in_order(&[0, 2], &[0, 1, 2], -1), 0);
        assert_eq!(remaining_in_order(&[0, 0, 2], &[0, 1, 2], -1), 2);
        assert_eq!(remaining_in_order(&[0, 0, 0], &[0, 1, 2], -1), -1);
        assert_eq!(remaining_in_order(&[1, 1, 1], &[2, 0, 1], -1), 2);
        assert_eq!(remaining_in_order(&[0, 0, 0], &[0, 1, 2], 7), 7);
    }

    #[test]
    fn test_remaining_in_order_skips_unknown_rows() {
        assert_eq!(remaining_in_order(&[3], &[1, 2, 0], -1), 0);
    }

    #[test]
    fn test_native_definition_is_usable() {
        let s = Strategy::from_definition(StrategyDefinition::native("first", "", first_row));
        let decide = s.decision_function().unwrap();
        let cfg = SimulationConfig::default();
        assert_eq!(decide.decide(&[], &[0, 4, 1], 0.5, &cfg), 1);
        assert!(s.compile_error().is_none());
    }

    #[test]
    fn test_bad_source_leaves_strategy_without_function() {
        let s = Strategy::from_definition(StrategyDefinition::source("broken", "", "chance >= => 0"));
        assert!(s.decision_function().is_none());
        assert!(matches!(s.compile_error(), Some(SimError::Compilation { .. })));
        s.recompile("else => 0 1 2").unwrap();
        assert!(s.decision_function().is_some());
        assert!(s.compile_error().is_none());
    }

    #[test]
    fn test_run_guard_locks_and_releases() {
        let s = Strategy::from_definition(StrategyDefinition::native("lock", "", first_row));
        assert_eq!(s.run_state(), RunState::Idle);
        let guard = s.begin_run().unwrap();
        assert_eq!(s.run_state(), RunState::Running);
        assert!(matches!(s.begin_run(), Err(SimError::RunAlreadyInProgress { .. })));
        drop(guard);
        assert_eq!(s.run_state(), RunState::Aborted);
        s.begin_run().unwrap().finish();
        assert_eq!(s.run_state(), RunState::Finished);
    }

    #[test]
    fn test_definition_builders() {
        let def = StrategyDefinition::source("x", "desc", "else => 0")
            .with_tags(["naive", "built-in"])
            .with_author("someone");
        let s = Strategy::from_definition(def);
        assert!(s.is_built_in());
        assert_eq!(s.metadata().author.as_deref(), Some("someone"));
        assert_eq!(s.metadata().tags.len(), 2);
    }
}
