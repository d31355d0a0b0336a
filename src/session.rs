//! A simulation, its strategies and the pacing controller, wired together.
//!
//! `Session` is what an interactive front end talks to: it starts runs by
//! strategy name, exposes the pacing controls (`set_delay`,
//! `enable_manual_step`, `request_next_step`) and lets the user roll rows by
//! hand between runs. Its simulation sits behind an async mutex that a run
//! holds for its whole duration, so overlapping runs fail fast. The latest
//! snapshot is published on a watch channel after every step, so readers
//! never wait for a run to end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Duration;

use crate::config::{SessionSettings, SimulationConfig};
use crate::error::{Result, SimError};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::pacing::{PacingController, PacingMode};
use crate::registry::StrategyRegistry;
use crate::runner::{self, RunReport};
use crate::sim::{Simulation, SimulationSnapshot};
use crate::strategy::{Strategy, StrategyDefinition};

/// Callbacks awaited around every session run.
#[async_trait]
pub trait RunHooks: Send + Sync {
    async fn on_run_begin(&self, _strategy: &Strategy, _simulation: &Simulation) {}
    async fn on_run_end(&self, _strategy: &Strategy, _simulation: &Simulation) {}
}

pub struct Session {
    simulation: tokio::sync::Mutex<Simulation>,
    registry: RwLock<StrategyRegistry>,
    pacing: PacingController,
    settings: Mutex<SessionSettings>,
    hooks: Option<Arc<dyn RunHooks>>,
    latest: watch::Sender<SimulationSnapshot>,
    cancel_requested: AtomicBool,
}

impl Session {
    pub fn new(config: SimulationConfig, settings: SessionSettings) -> Result<Self> {
        Ok(Self::with_simulation(Simulation::new(config)?, settings))
    }

    pub fn with_simulation(simulation: Simulation, settings: SessionSettings) -> Self {
        let (latest, _) = watch::channel(simulation.snapshot());
        Self {
            latest,
            cancel_requested: AtomicBool::new(false),
            simulation: tokio::sync::Mutex::new(simulation),
            registry: RwLock::new(StrategyRegistry::new()),
            pacing: PacingController::new(),
            settings: Mutex::new(settings),
            hooks: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    fn settings_lock(&self) -> MutexGuard<'_, SessionSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings_lock().clone()
    }

    pub fn pacing(&self) -> &PacingController {
        &self.pacing
    }

    // ---------------------------------------------------------------------
    // Strategies
    // ---------------------------------------------------------------------

    pub fn register(&self, definition: StrategyDefinition) -> Arc<Strategy> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner).register(definition)
    }

    pub fn find_strategy(&self, name: &str) -> Option<Arc<Strategy>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner).find_by_name(name)
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner).names()
    }

    // ---------------------------------------------------------------------
    // Runs
    // ---------------------------------------------------------------------

    pub async fn run_strategy(&self, name: &str) -> Result<RunReport> {
        let strategy = self
            .find_strategy(name)
            .ok_or_else(|| SimError::StrategyNotFound(name.to_string()))?;
        self.run(&strategy).await
    }

    /// Rerun the strategy that was started last.
    pub async fn run_last_used(&self) -> Result<RunReport> {
        let name = self
            .settings_lock()
            .last_used_strategy_name
            .clone()
            .ok_or_else(|| SimError::StrategyNotFound("<none used yet>".to_string()))?;
        self.run_strategy(&name).await
    }

    /// Reset the simulation and run `strategy` on it with the session pacing.
    pub async fn run(&self, strategy: &Arc<Strategy>) -> Result<RunReport> {
        let mut simulation = self
            .simulation
            .try_lock()
            .map_err(|_| SimError::RunAlreadyInProgress { name: strategy.name().to_string() })?;
        simulation.reset();
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.latest.send_replace(simulation.snapshot());

        let mode = {
            let mut settings = self.settings_lock();
            settings.last_used_strategy_name = Some(strategy.name().to_string());
            if settings.step_by_step {
                PacingMode::Manual
            } else {
                PacingMode::Timed(Duration::from_millis(settings.delay_ms))
            }
        };

        if let Some(hooks) = &self.hooks {
            hooks.on_run_begin(strategy, &simulation).await;
        }
        let permission = self.pacing.prepare(mode).await;
        if self.cancel_requested.load(Ordering::SeqCst) {
            // Terminated while the begin hook ran; the run sees Cancelled at its first step.
            self.pacing.terminate().await;
        }
        let result = runner::run_observed(strategy, &mut simulation, &permission, Some(&self.latest)).await;
        self.pacing.terminate().await;
        if let Some(hooks) = &self.hooks {
            hooks.on_run_end(strategy, &simulation).await;
        }
        if let Err(err) = &result {
            let level = if err.is_cancellation() { Level::Info } else { Level::Warn };
            log(
                level,
                Domain::Strategy,
                "run_failed",
                obj(&[("strategy", v_str(strategy.name())), ("msg", v_str(&err.to_string()))]),
            );
        }
        result
    }

    // ---------------------------------------------------------------------
    // Pacing controls
    // ---------------------------------------------------------------------

    pub fn set_delay(&self, delay_ms: u64) {
        self.settings_lock().delay_ms = delay_ms;
        self.pacing.change_interval(Duration::from_millis(delay_ms));
    }

    /// Toggle step-by-step mode. Turning it off mid-run flushes the run to
    /// completion without further pacing.
    pub fn enable_manual_step(&self, enabled: bool) {
        self.settings_lock().step_by_step = enabled;
        if !enabled && self.pacing.mode() == PacingMode::Manual {
            self.drain_remaining();
        }
    }

    pub fn request_next_step(&self) {
        self.pacing.signal_advance();
    }

    /// Let the active run finish without further pacing.
    pub fn drain_remaining(&self) {
        self.pacing.drain_remaining();
    }

    /// Abort the active run, if any, including one still in its begin hook.
    pub async fn terminate(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.pacing.terminate().await;
    }

    // ---------------------------------------------------------------------
    // Manual play
    // ---------------------------------------------------------------------

    /// Latest published state; mid-run this is the state after the last step.
    pub fn snapshot(&self) -> SimulationSnapshot {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SimulationSnapshot> {
        self.latest.subscribe()
    }

    /// Roll a row by hand. Refused while a run owns the simulation.
    pub fn advance(&self, row: usize) -> Result<bool> {
        let mut simulation = self.try_simulation()?;
        let success = simulation.advance(row)?;
        self.latest.send_replace(simulation.snapshot());
        Ok(success)
    }

    pub fn reset(&self) -> Result<()> {
        let mut simulation = self.try_simulation()?;
        simulation.reset();
        self.latest.send_replace(simulation.snapshot());
        Ok(())
    }

    fn try_simulation(&self) -> Result<tokio::sync::MutexGuard<'_, Simulation>> {
        self.simulation.try_lock().map_err(|_| SimError::RunAlreadyInProgress {
            name: self.settings_lock().last_used_strategy_name.clone().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::register_builtins;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHooks {
        begun: AtomicUsize,
        ended: AtomicUsize,
    }

    #[async_trait]
    impl RunHooks for CountingHooks {
        async fn on_run_begin(&self, _strategy: &Strategy, simulation: &Simulation) {
            assert_eq!(simulation.snapshot().remaining_total, 30);
            self.begun.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_run_end(&self, _strategy: &Strategy, _simulation: &Simulation) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_settings() -> SessionSettings {
        SessionSettings { delay_ms: 1, ..Default::default() }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_by_name_calls_hooks() {
        let hooks = Arc::new(CountingHooks::default());
        let session = Session::with_simulation(
            Simulation::seeded(SimulationConfig::default(), 9).unwrap(),
            fast_settings(),
        )
        .with_hooks(hooks.clone());
        {
            let mut registry = session.registry.write().unwrap();
            register_builtins(&mut registry);
        }
        let report = session.run_strategy("Naive ranges").await.unwrap();
        assert!(report.snapshot.finished);
        assert_eq!(hooks.begun.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.ended.load(Ordering::SeqCst), 1);
        assert_eq!(session.settings().last_used_strategy_name.as_deref(), Some("Naive ranges"));

        let again = session.run_last_used().await.unwrap();
        assert_eq!(again.steps, 30);
    }

    #[tokio::test]
    async fn test_unknown_strategy() {
        let session = Session::new(SimulationConfig::default(), fast_settings()).unwrap();
        assert!(matches!(
            session.run_strategy("missing").await,
            Err(SimError::StrategyNotFound(_))
        ));
        assert!(matches!(session.run_last_used().await, Err(SimError::StrategyNotFound(_))));
    }

    #[tokio::test]
    async fn test_manual_play_between_runs() {
        let session = Session::new(SimulationConfig::default(), fast_settings()).unwrap();
        session.advance(2).unwrap();
        assert_eq!(session.snapshot().remaining_per_row, vec![10, 10, 9]);
        session.reset().unwrap();
        assert_eq!(session.snapshot().remaining_total, 30);
        assert!(session.advance(5).is_err());
    }
}
