//! Strategy runs under each pacing mode, on a paused clock.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use engravesim::builtin::naive_ranges;
use engravesim::config::SimulationConfig;
use engravesim::pacing::{PacingController, PacingMode};
use engravesim::runner::{self, RunReport};
use engravesim::sim::Simulation;
use engravesim::strategy::{RunState, Strategy, StrategyDefinition};
use engravesim::{Result, SimError};

fn naive() -> Arc<Strategy> {
    Arc::new(Strategy::from_definition(StrategyDefinition::native("naive", "", naive_ranges)))
}

/// Spawn a run and hand back the simulation with its result.
async fn spawn_run(
    strategy: Arc<Strategy>,
    pacing: &PacingController,
    mode: PacingMode,
) -> JoinHandle<(Result<RunReport>, Simulation)> {
    let gate = pacing.prepare(mode).await;
    tokio::spawn(async move {
        let mut sim = Simulation::seeded(SimulationConfig::default(), 11).unwrap();
        let result = runner::run(&strategy, &mut sim, &gate).await;
        (result, sim)
    })
}

async fn until_pending(pacing: &PacingController) {
    while !pacing.is_pending() {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn timed_run_waits_one_period_per_step() {
    let pacing = PacingController::new();
    let started = Instant::now();
    let handle = spawn_run(naive(), &pacing, PacingMode::Timed(Duration::from_millis(100))).await;
    let (result, _) = handle.await.unwrap();
    let report = result.unwrap();
    assert_eq!(report.steps, 30);
    assert!(started.elapsed() >= Duration::from_millis(3000));
}

#[tokio::test(start_paused = true)]
async fn terminate_aborts_pending_run() {
    let strategy = naive();
    let pacing = PacingController::new();
    let handle = spawn_run(strategy.clone(), &pacing, PacingMode::Manual).await;
    until_pending(&pacing).await;
    assert_eq!(strategy.run_state(), RunState::Running);

    pacing.terminate().await;
    let (result, sim) = handle.await.unwrap();
    assert_eq!(result.unwrap_err(), SimError::Cancelled);
    assert_eq!(strategy.run_state(), RunState::Aborted);
    assert_eq!(sim.snapshot().remaining_total, 30);
}

#[tokio::test(start_paused = true)]
async fn manual_signals_advance_one_step_each() {
    let pacing = PacingController::new();
    let handle = spawn_run(naive(), &pacing, PacingMode::Manual).await;
    for _ in 0..3 {
        until_pending(&pacing).await;
        pacing.signal_advance();
    }
    until_pending(&pacing).await;
    pacing.terminate().await;
    let (result, sim) = handle.await.unwrap();
    assert!(result.unwrap_err().is_cancellation());
    assert_eq!(sim.snapshot().remaining_total, 27);
}

#[tokio::test(start_paused = true)]
async fn signal_before_request_is_kept() {
    let pacing = PacingController::new();
    let gate = pacing.prepare(PacingMode::Manual).await;
    pacing.signal_advance();
    let mut sim = Simulation::seeded(SimulationConfig::default(), 2).unwrap();
    let strategy = naive();
    let run = tokio::spawn({
        let gate = gate.clone();
        let strategy = strategy.clone();
        async move {
            let result = runner::run(&strategy, &mut sim, &gate).await;
            (result, sim)
        }
    });
    until_pending(&pacing).await;
    pacing.terminate().await;
    let (_, sim) = run.await.unwrap();
    assert_eq!(sim.snapshot().remaining_total, 29);
}

#[tokio::test(start_paused = true)]
async fn drain_finishes_manual_run() {
    let strategy = naive();
    let pacing = PacingController::new();
    let handle = spawn_run(strategy.clone(), &pacing, PacingMode::Manual).await;
    until_pending(&pacing).await;
    pacing.signal_advance();
    until_pending(&pacing).await;
    pacing.drain_remaining();
    let (result, sim) = handle.await.unwrap();
    assert_eq!(result.unwrap().steps, 30);
    assert!(sim.snapshot().finished);
    assert_eq!(strategy.run_state(), RunState::Finished);
}

#[tokio::test(start_paused = true)]
async fn shorter_interval_speeds_up_run() {
    let pacing = PacingController::new();
    let started = Instant::now();
    let handle = spawn_run(naive(), &pacing, PacingMode::Timed(Duration::from_secs(1))).await;
    until_pending(&pacing).await;
    pacing.change_interval(Duration::from_millis(10));
    assert_eq!(pacing.mode(), PacingMode::Timed(Duration::from_millis(10)));
    let (result, _) = handle.await.unwrap();
    assert_eq!(result.unwrap().steps, 30);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn second_run_of_same_strategy_fails_fast() {
    let strategy = naive();
    let pacing = PacingController::new();
    let handle = spawn_run(strategy.clone(), &pacing, PacingMode::Manual).await;
    until_pending(&pacing).await;

    let other = PacingController::new().prepare(PacingMode::Immediate).await;
    let mut sim = Simulation::seeded(SimulationConfig::default(), 5).unwrap();
    let err = runner::run(&strategy, &mut sim, &other).await.unwrap_err();
    assert!(matches!(err, SimError::RunAlreadyInProgress { .. }));
    assert_eq!(sim.snapshot().remaining_total, 30);

    pacing.terminate().await;
    let _ = handle.await.unwrap();
}
