//! Strategies shipped with the simulator.

use rand::seq::SliceRandom;

use crate::config::SimulationConfig;
use crate::registry::StrategyRegistry;
use crate::sim::RowState;
use crate::strategy::{remaining_in_order, StrategyDefinition};

pub const NAIVE_RANGES: &str = "Naive ranges";
pub const RANDOM: &str = "Random";

/// Primary row at 65%+, secondary at 55%+, negative row otherwise.
pub fn naive_ranges(_rows: &[RowState], remaining: &[usize], chance: f64, _config: &SimulationConfig) -> i64 {
    if chance >= 0.65 {
        return remaining_in_order(remaining, &[0, 1, 2], -1);
    }
    if chance >= 0.55 {
        return remaining_in_order(remaining, &[1, 0, 2], -1);
    }
    remaining_in_order(remaining, &[2, 1, 0], -1)
}

/// Any row that still has steps, uniformly.
pub fn random_row(_rows: &[RowState], remaining: &[usize], _chance: f64, _config: &SimulationConfig) -> i64 {
    let mut order: Vec<usize> = (0..remaining.len()).collect();
    order.shuffle(&mut rand::thread_rng());
    remaining_in_order(remaining, &order, -1)
}

pub fn definitions() -> Vec<StrategyDefinition> {
    vec![
        StrategyDefinition::native(
            NAIVE_RANGES,
            "Uses 65%+ for the primary row, 55%+ for the secondary row and the rest for the negative row.",
            naive_ranges,
        )
        .with_tags(["built-in", "naive"]),
        StrategyDefinition::native(RANDOM, "Selects a row at random.", random_row)
            .with_tags(["built-in", "stupid"]),
    ]
}

pub fn register_builtins(registry: &mut StrategyRegistry) {
    for definition in definitions() {
        registry.register(definition);
    }
}
