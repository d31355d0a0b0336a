//! The rolling simulation: one shared chance scalar and a fixed set of rows.
//!
//! Every roll, whichever row it lands in, moves the shared chance, so all
//! row updates are funneled through [`Simulation::roll`].

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::SimulationConfig;
use crate::error::{Result, SimError};
use crate::logging::log_roll;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pending,
    Success,
    Failure,
}

impl Outcome {
    pub fn from_roll(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Per-step outcomes of one row, filled strictly left to right.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowState {
    slots: Vec<Outcome>,
}

impl RowState {
    pub fn pending(steps: usize) -> Self {
        Self { slots: vec![Outcome::Pending; steps] }
    }

    pub fn slots(&self) -> &[Outcome] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Index of the left-most pending slot.
    pub fn next_pending(&self) -> Option<usize> {
        self.slots.iter().position(|s| *s == Outcome::Pending)
    }

    /// Pending slots are contiguous at the tail.
    pub fn remaining(&self) -> usize {
        self.next_pending().map(|i| self.slots.len() - i).unwrap_or(0)
    }

    pub fn successes(&self) -> usize {
        self.slots.iter().filter(|s| **s == Outcome::Success).count()
    }

    pub fn failures(&self) -> usize {
        self.slots.iter().filter(|s| **s == Outcome::Failure).count()
    }

    fn record(&mut self, index: usize, outcome: Outcome) {
        self.slots[index] = outcome;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSnapshot {
    pub chance: f64,
    pub rows: Vec<RowState>,
    pub remaining_per_row: Vec<usize>,
    pub remaining_total: usize,
    pub finished: bool,
}

impl SimulationSnapshot {
    /// Hex sha256 over the canonical JSON form of the snapshot.
    pub fn digest(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }

    pub fn successes_per_row(&self) -> Vec<usize> {
        self.rows.iter().map(RowState::successes).collect()
    }
}

pub(crate) fn clamp(min: f64, max: f64, val: f64) -> f64 {
    max.min(min.max(val))
}

/// Round to four decimal places so repeated adjustments do not drift.
pub(crate) fn round4(num: f64) -> f64 {
    ((num + f64::EPSILON) * 10000.0).round() / 10000.0
}

/// Random source that replays a fixed list of outcomes.
///
/// A success yields a draw of `0.0`, a failure the largest draw below `1.0`,
/// so any chance strictly between the two reproduces the scripted result.
/// Once the script is exhausted every further roll fails.
#[derive(Debug, Clone, Default)]
pub struct ScriptedOutcomes {
    script: std::collections::VecDeque<bool>,
}

impl ScriptedOutcomes {
    pub fn new(outcomes: impl IntoIterator<Item = bool>) -> Self {
        Self { script: outcomes.into_iter().collect() }
    }

    pub fn always(success: bool, count: usize) -> Self {
        Self::new(std::iter::repeat(success).take(count))
    }
}

impl RngCore for ScriptedOutcomes {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        match self.script.pop_front() {
            Some(true) => 0,
            _ => u64::MAX,
        }
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

pub struct Simulation {
    config: SimulationConfig,
    chance: f64,
    rows: Vec<RowState>,
    rng: Box<dyn RngCore + Send + Sync>,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("config", &self.config)
            .field("chance", &self.chance)
            .field("rows", &self.rows)
            .finish_non_exhaustive()
    }
}

impl Simulation {
    /// New simulation drawing from an entropy-seeded generator.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        Self::with_rng(config, Box::new(StdRng::from_entropy()))
    }

    pub fn seeded(config: SimulationConfig, seed: u64) -> Result<Self> {
        Self::with_rng(config, Box::new(StdRng::seed_from_u64(seed)))
    }

    pub fn with_rng(config: SimulationConfig, rng: Box<dyn RngCore + Send + Sync>) -> Result<Self> {
        config.validate()?;
        let mut sim = Self {
            chance: config.initial_chance,
            rows: Vec::new(),
            config,
            rng,
        };
        sim.reset();
        Ok(sim)
    }

    /// Swap the random source, keeping state.
    pub fn set_rng(&mut self, rng: Box<dyn RngCore + Send + Sync>) {
        self.rng = rng;
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn chance(&self) -> f64 {
        self.chance
    }

    pub fn reset(&mut self) {
        self.chance = self.config.initial_chance;
        self.rows = self.config.rows.iter().map(|def| RowState::pending(def.steps)).collect();
    }

    pub fn row(&self, index: usize) -> Option<&RowState> {
        self.rows.get(index)
    }

    pub fn snapshot(&self) -> SimulationSnapshot {
        let remaining_per_row: Vec<usize> = self.rows.iter().map(RowState::remaining).collect();
        let remaining_total = remaining_per_row.iter().sum();
        SimulationSnapshot {
            chance: self.chance,
            rows: self.rows.clone(),
            remaining_per_row,
            remaining_total,
            finished: remaining_total == 0,
        }
    }

    /// Draw against the current chance, then move the chance.
    ///
    /// Row state is untouched.
    pub fn roll(&mut self) -> bool {
        let before = self.chance;
        let success = self.rng.gen::<f64>() < before;
        let delta = if success {
            self.config.success_chance_change
        } else {
            self.config.failure_chance_change
        };
        // Rounding can step past a bound that is not on the 1e-4 grid.
        let (min, max) = (self.config.minimal_chance, self.config.maximal_chance);
        self.chance = clamp(min, max, round4(clamp(min, max, before + delta)));
        log_roll(success, before, self.chance);
        success
    }

    /// Roll into the left-most pending slot of `row_index`.
    pub fn advance(&mut self, row_index: usize) -> Result<bool> {
        let next = match self.rows.get(row_index) {
            None => {
                return Err(SimError::InvalidRowState {
                    row: row_index as i64,
                    reason: "row index out of range",
                })
            }
            Some(row) => row.next_pending().ok_or(SimError::InvalidRowState {
                row: row_index as i64,
                reason: "row is already complete",
            })?,
        };
        let success = self.roll();
        self.rows[row_index].record(next, Outcome::from_roll(success));
        Ok(success)
    }

    /// Like [`advance`](Self::advance) for an untrusted, possibly negative index.
    pub fn advance_selected(&mut self, selected: i64) -> Result<bool> {
        let index = usize::try_from(selected).map_err(|_| SimError::InvalidRowState {
            row: selected,
            reason: "negative row index",
        })?;
        self.advance(index)
    }
}
