//! Drives one simulation to completion with one strategy.
//!
//! ```text
//! Idle ──run──► Running ──finished──► Finished
//!                  │
//!                  └──invalid row / cancelled──► Aborted
//! ```
//!
//! The pacing gate is the only suspension point in the loop.

use serde::Serialize;
use tokio::sync::watch;

use crate::error::{Result, SimError};
use crate::logging::{log_run_state, log_step};
use crate::pacing::PermissionRequest;
use crate::sim::{Simulation, SimulationSnapshot};
use crate::strategy::{RunState, Strategy};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub strategy: String,
    pub state: RunState,
    pub steps: u64,
    pub snapshot: SimulationSnapshot,
}

/// Run `strategy` against `simulation` until it finishes or the run aborts.
///
/// Fails fast with `RunAlreadyInProgress` if the strategy is already running.
/// An invalid row selection or a cancelled pacing wait ends the run in
/// `Aborted` and is returned as the error. The run lock is released on every
/// exit path, including when this future is dropped mid-run.
pub async fn run(
    strategy: &Strategy,
    simulation: &mut Simulation,
    permission: &PermissionRequest,
) -> Result<RunReport> {
    run_observed(strategy, simulation, permission, None).await
}

/// [`run`], publishing the snapshot after every step to `observer`.
pub async fn run_observed(
    strategy: &Strategy,
    simulation: &mut Simulation,
    permission: &PermissionRequest,
    observer: Option<&watch::Sender<SimulationSnapshot>>,
) -> Result<RunReport> {
    let guard = strategy.begin_run()?;
    let name = strategy.name();
    log_run_state(name, RunState::Running.as_str(), 0, None);

    let mut steps = 0u64;
    let outcome = drive(strategy, simulation, permission, observer, &mut steps).await;
    match outcome {
        Ok(snapshot) => {
            guard.finish();
            let digest = snapshot.digest();
            log_run_state(name, RunState::Finished.as_str(), steps, Some(&digest));
            Ok(RunReport {
                strategy: name.to_string(),
                state: RunState::Finished,
                steps,
                snapshot,
            })
        }
        Err(err) => {
            drop(guard);
            log_run_state(name, RunState::Aborted.as_str(), steps, None);
            Err(err)
        }
    }
}

async fn drive(
    strategy: &Strategy,
    simulation: &mut Simulation,
    permission: &PermissionRequest,
    observer: Option<&watch::Sender<SimulationSnapshot>>,
    steps: &mut u64,
) -> Result<SimulationSnapshot> {
    let decide = strategy
        .decision_function()
        .ok_or_else(|| SimError::MissingDecisionFunction(strategy.name().to_string()))?;
    loop {
        let snapshot = simulation.snapshot();
        if let Some(observer) = observer {
            observer.send_replace(snapshot.clone());
        }
        if snapshot.finished {
            return Ok(snapshot);
        }
        permission.request().await?;
        let selected = decide.decide(
            &snapshot.rows,
            &snapshot.remaining_per_row,
            snapshot.chance,
            simulation.config(),
        );
        let success = simulation.advance_selected(selected)?;
        *steps += 1;
        log_step(strategy.name(), *steps, selected as usize, success, simulation.chance());
    }
}
