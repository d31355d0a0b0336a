//! Headless benchmark: many seeded runs of one strategy without pacing.
//!
//! Run `i` uses seed `seed + i`, so a report is reproducible from its
//! `(strategy, config, runs, seed)` inputs.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::SimulationConfig;
use crate::error::{Result, SimError};
use crate::logging::{log, obj, ts_now, v_num, v_str, Domain, Level, ProfileScope};
use crate::pacing::{PacingController, PacingMode};
use crate::runner;
use crate::sim::Simulation;
use crate::strategy::Strategy;

#[derive(Debug, Clone, Serialize)]
pub struct RowStats {
    pub name: String,
    pub steps: usize,
    pub mean_successes: f64,
    /// `histogram[k]` counts completed runs with exactly `k` successes.
    pub histogram: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub timestamp: String,
    pub strategy: String,
    pub config_hash: String,
    pub runs: u64,
    pub seed: u64,
    pub completed: u64,
    pub aborted: u64,
    pub first_error: Option<String>,
    pub rows: Vec<RowStats>,
    pub elapsed_ms: f64,
}

/// Short sha256 of the config's JSON form.
pub fn config_hash(config: &SimulationConfig) -> String {
    let json = serde_json::to_string(config).unwrap_or_default();
    let digest = Sha256::digest(json.as_bytes());
    hex::encode(&digest[..8])
}

/// Run `strategy` `runs` times on fresh seeded simulations.
///
/// Runs that abort are counted, not returned. A strategy that cannot run at
/// all (no decision function, or already running elsewhere) fails the whole
/// benchmark.
pub async fn benchmark(
    strategy: &Strategy,
    config: &SimulationConfig,
    runs: u64,
    seed: u64,
) -> Result<BenchReport> {
    config.validate()?;
    let profile = ProfileScope::with_context("bench", &[("strategy", v_str(strategy.name()))]);
    let pacing = PacingController::new();

    let mut rows: Vec<RowStats> = config
        .rows
        .iter()
        .map(|row| RowStats {
            name: row.name.clone(),
            steps: row.steps,
            mean_successes: 0.0,
            histogram: vec![0; row.steps + 1],
        })
        .collect();
    let mut completed = 0u64;
    let mut aborted = 0u64;
    let mut first_error = None;

    for i in 0..runs {
        let mut simulation = Simulation::seeded(config.clone(), seed.wrapping_add(i))?;
        let permission = pacing.prepare(PacingMode::Immediate).await;
        match runner::run(strategy, &mut simulation, &permission).await {
            Ok(report) => {
                completed += 1;
                for (stats, successes) in rows.iter_mut().zip(report.snapshot.successes_per_row()) {
                    stats.histogram[successes] += 1;
                    stats.mean_successes += successes as f64;
                }
            }
            Err(err @ (SimError::MissingDecisionFunction(_) | SimError::RunAlreadyInProgress { .. })) => {
                return Err(err);
            }
            Err(err) => {
                aborted += 1;
                first_error.get_or_insert_with(|| err.to_string());
            }
        }
    }
    pacing.terminate().await;

    if completed > 0 {
        for stats in &mut rows {
            stats.mean_successes /= completed as f64;
        }
    }
    let elapsed_ms = profile.elapsed_ms();
    log(
        Level::Info,
        Domain::Simulation,
        "bench_done",
        obj(&[
            ("strategy", v_str(strategy.name())),
            ("completed", v_num(completed as f64)),
            ("aborted", v_num(aborted as f64)),
            ("elapsed_ms", v_num(elapsed_ms)),
        ]),
    );

    Ok(BenchReport {
        timestamp: ts_now(),
        strategy: strategy.name().to_string(),
        config_hash: config_hash(config),
        runs,
        seed,
        completed,
        aborted,
        first_error,
        rows,
        elapsed_ms,
    })
}
