//! Step pacing: the gate a strategy run awaits before every decision.
//!
//! A controller is prepared in one of three modes and hands out a
//! [`PermissionRequest`]. Each `request()` suspends until permission is
//! granted (immediately, by the interval timer, or by an explicit
//! [`PacingController::signal_advance`]) or fails with
//! [`SimError::Cancelled`] once the controller is terminated.
//!
//! Gate states:
//! ```text
//! Idle ──request──► Armed ──grant──► Granted
//!                     │
//!                     └──terminate──► Cancelled
//! ```
//!
//! At most one wait is expected to be pending at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use crate::error::{Result, SimError};
use crate::logging::{log_pacing, log_warn, v_str, Domain};

/// Shortest timer period; a zero delay runs at this pace.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingMode {
    /// Every request is granted at once.
    Immediate,
    /// A recurring timer grants the pending request, if any.
    Timed(Duration),
    /// Only [`PacingController::signal_advance`] grants requests.
    Manual,
}

impl PacingMode {
    fn label(&self) -> &'static str {
        match self {
            PacingMode::Immediate => "immediate",
            PacingMode::Timed(_) => "timed",
            PacingMode::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Armed,
    Granted,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrantSource {
    Tick,
    Signal,
    Drain,
}

type Verdict = std::result::Result<(), SimError>;

#[derive(Debug)]
struct Waiter {
    grant: oneshot::Sender<Verdict>,
    // Closed by the waiting side once it has seen the verdict.
    observed: oneshot::Receiver<()>,
}

#[derive(Debug)]
struct Inner {
    mode: PacingMode,
    period: Duration,
    generation: u64,
    state: GateState,
    drain: bool,
    terminated: bool,
    signalled: bool,
    superseded: u64,
    waiter: Option<Waiter>,
    ticker: Option<JoinHandle<()>>,
    runtime: Option<Handle>,
}

impl Inner {
    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

/// Shared, cloneable handle to one pacing gate.
#[derive(Debug, Clone)]
pub struct PacingController {
    inner: Arc<Mutex<Inner>>,
}

impl Default for PacingController {
    fn default() -> Self {
        Self::new()
    }
}

impl PacingController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                mode: PacingMode::Immediate,
                period: Duration::from_millis(100),
                generation: 0,
                state: GateState::Idle,
                drain: false,
                terminated: true,
                signalled: false,
                superseded: 0,
                waiter: None,
                ticker: None,
                runtime: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> PacingMode {
        self.lock().mode
    }

    pub fn state(&self) -> GateState {
        self.lock().state
    }

    /// Timer period, kept across modes so a later timed run picks it up.
    pub fn period(&self) -> Duration {
        self.lock().period
    }

    /// Waits cancelled because `prepare` or a second `request` replaced them.
    pub fn superseded_waits(&self) -> u64 {
        self.lock().superseded
    }

    /// Whether a request is currently suspended.
    pub fn is_pending(&self) -> bool {
        self.lock().waiter.as_ref().map(|w| !w.grant.is_closed()).unwrap_or(false)
    }

    /// Re-initialize for a new run and return its permission handle.
    ///
    /// An unresolved wait from a previous run is cancelled with a warning.
    pub async fn prepare(&self, mode: PacingMode) -> PermissionRequest {
        let mode = match mode {
            PacingMode::Timed(period) => PacingMode::Timed(period.max(MIN_PERIOD)),
            other => other,
        };
        if self.is_pending() {
            self.lock().superseded += 1;
            log_warn(
                Domain::Pacing,
                "prepare_while_pending",
                "Preparing step controller before previous process was terminated.",
            );
        }
        self.terminate().await;

        let generation = {
            let mut inner = self.lock();
            inner.generation += 1;
            inner.mode = mode;
            inner.state = GateState::Idle;
            inner.drain = false;
            inner.terminated = false;
            inner.signalled = false;
            let runtime = Handle::try_current().ok();
            if let PacingMode::Timed(period) = mode {
                inner.period = period;
                inner.ticker = self.spawn_ticker(runtime.as_ref(), period);
            }
            inner.runtime = runtime;
            inner.generation
        };
        log_pacing("prepare", &[("mode", v_str(mode.label())), ("generation", json!(generation))]);
        PermissionRequest { controller: self.clone(), generation }
    }

    fn spawn_ticker(&self, runtime: Option<&Handle>, period: Duration) -> Option<JoinHandle<()>> {
        let Some(runtime) = runtime else {
            log_warn(Domain::Pacing, "no_runtime", "timed pacing needs a tokio runtime");
            return None;
        };
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        Some(runtime.spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                PacingController { inner }.grant(GrantSource::Tick);
            }
        }))
    }

    /// Grant the pending wait, if any. Returns whether a waiter was released.
    fn grant(&self, source: GrantSource) -> bool {
        let mut inner = self.lock();
        if let Some(waiter) = inner.waiter.take() {
            if waiter.grant.send(Ok(())).is_ok() {
                inner.state = GateState::Granted;
                return true;
            }
        }
        if source == GrantSource::Signal && !inner.terminated {
            // Edge-triggered: remember a single signal for the next request.
            inner.signalled = true;
        }
        false
    }

    /// Manual trigger: release one pending wait or arm the next request.
    pub fn signal_advance(&self) {
        let released = self.grant(GrantSource::Signal);
        log_pacing("signal", &[("released", Value::Bool(released))]);
    }

    /// Change the timed period, keeping any pending wait.
    pub fn change_interval(&self, period: Duration) {
        let period = period.max(MIN_PERIOD);
        let mut inner = self.lock();
        inner.period = period;
        if let PacingMode::Timed(_) = inner.mode {
            inner.mode = PacingMode::Timed(period);
            if inner.ticker.is_some() {
                inner.stop_ticker();
                let runtime = inner.runtime.clone();
                inner.ticker = self.spawn_ticker(runtime.as_ref(), period);
            }
        }
        log_pacing("change_interval", &[("period_ms", json!(period.as_millis() as u64))]);
    }

    /// Grant everything from now on and release the pending wait.
    pub fn drain_remaining(&self) {
        {
            let mut inner = self.lock();
            inner.drain = true;
            inner.stop_ticker();
        }
        let released = self.grant(GrantSource::Drain);
        log_pacing("drain", &[("released", Value::Bool(released))]);
    }

    /// Stop the timer and cancel the pending wait.
    ///
    /// Returns once the cancelled waiter has observed its error. Calling it
    /// again is a no-op.
    pub async fn terminate(&self) {
        let observed = {
            let mut inner = self.lock();
            inner.stop_ticker();
            inner.terminated = true;
            inner.signalled = false;
            match inner.waiter.take() {
                Some(waiter) => {
                    let _ = waiter.grant.send(Err(SimError::Cancelled));
                    inner.state = GateState::Cancelled;
                    Some(waiter.observed)
                }
                None => None,
            }
        };
        if let Some(observed) = observed {
            // Err means the waiting future was dropped; either way it is settled.
            let _ = observed.await;
            log_pacing("terminated", &[("cancelled_wait", Value::Bool(true))]);
        }
    }
}

/// Per-run permission handle returned by [`PacingController::prepare`].
///
/// A handle from an earlier `prepare` is stale and only yields `Cancelled`.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    controller: PacingController,
    generation: u64,
}

impl PermissionRequest {
    pub fn controller(&self) -> &PacingController {
        &self.controller
    }

    /// Suspend until the next permission, or fail with `Cancelled`.
    pub async fn request(&self) -> Result<()> {
        let (verdict, observed) = {
            let mut inner = self.controller.lock();
            if inner.generation != self.generation || inner.terminated {
                return Err(SimError::Cancelled);
            }
            if inner.drain || inner.mode == PacingMode::Immediate {
                inner.state = GateState::Granted;
                return Ok(());
            }
            if inner.signalled {
                inner.signalled = false;
                inner.state = GateState::Granted;
                return Ok(());
            }
            let (grant_tx, grant_rx) = oneshot::channel();
            let (observed_tx, observed_rx) = oneshot::channel();
            let previous = inner.waiter.replace(Waiter { grant: grant_tx, observed: observed_rx });
            if let Some(previous) = previous {
                if !previous.grant.is_closed() {
                    inner.superseded += 1;
                    log_warn(Domain::Pacing, "concurrent_wait", "second wait replaced a pending one");
                    let _ = previous.grant.send(Err(SimError::Cancelled));
                }
            }
            inner.state = GateState::Armed;
            (grant_rx, observed_tx)
        };
        let result = verdict.await.unwrap_or(Err(SimError::Cancelled));
        let _ = observed.send(());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_immediate_grants_without_waiting() {
        let pacing = PacingController::new();
        let gate = pacing.prepare(PacingMode::Immediate).await;
        for _ in 0..5 {
            gate.request().await.unwrap();
        }
        assert_eq!(pacing.state(), GateState::Granted);
    }

    #[tokio::test]
    async fn test_request_after_terminate_is_cancelled() {
        let pacing = PacingController::new();
        let gate = pacing.prepare(PacingMode::Manual).await;
        pacing.terminate().await;
        assert_eq!(gate.request().await, Err(SimError::Cancelled));
    }

    #[tokio::test]
    async fn test_stale_handle_is_cancelled() {
        let pacing = PacingController::new();
        let old = pacing.prepare(PacingMode::Immediate).await;
        let _new = pacing.prepare(PacingMode::Immediate).await;
        assert_eq!(old.request().await, Err(SimError::Cancelled));
    }

    #[tokio::test]
    async fn test_signal_is_buffered_once() {
        let pacing = PacingController::new();
        let gate = pacing.prepare(PacingMode::Manual).await;
        pacing.signal_advance();
        pacing.signal_advance();
        gate.request().await.unwrap();

        let waiting = tokio::spawn({
            let gate = gate.clone();
            async move { gate.request().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());
        pacing.terminate().await;
        assert_eq!(waiting.await.unwrap(), Err(SimError::Cancelled));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let pacing = PacingController::new();
        let _gate = pacing.prepare(PacingMode::Manual).await;
        pacing.terminate().await;
        pacing.terminate().await;
        assert!(!pacing.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_runs_at_minimum_pace() {
        let pacing = PacingController::new();
        let gate = pacing.prepare(PacingMode::Timed(Duration::ZERO)).await;
        assert_eq!(pacing.mode(), PacingMode::Timed(MIN_PERIOD));
        for _ in 0..3 {
            gate.request().await.unwrap();
        }
        pacing.change_interval(Duration::ZERO);
        assert_eq!(pacing.period(), MIN_PERIOD);
        gate.request().await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_cancels_pending_wait() {
        let pacing = PacingController::new();
        let old = pacing.prepare(PacingMode::Manual).await;
        let waiting = tokio::spawn(async move { old.request().await });
        while !pacing.is_pending() {
            tokio::task::yield_now().await;
        }

        let new = pacing.prepare(PacingMode::Manual).await;
        assert_eq!(waiting.await.unwrap(), Err(SimError::Cancelled));
        assert_eq!(pacing.superseded_waits(), 1);

        pacing.signal_advance();
        new.request().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_returns_after_waiter_saw_cancel() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let pacing = PacingController::new();
        let gate = pacing.prepare(PacingMode::Manual).await;
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let waiting = tokio::spawn({
            let saw_cancel = saw_cancel.clone();
            async move {
                let verdict = gate.request().await;
                saw_cancel.store(verdict == Err(SimError::Cancelled), Ordering::SeqCst);
            }
        });
        while !pacing.is_pending() {
            tokio::task::yield_now().await;
        }
        pacing.terminate().await;
        assert!(saw_cancel.load(Ordering::SeqCst));
        waiting.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_releases_and_stays_open() {
        let pacing = PacingController::new();
        let gate = pacing.prepare(PacingMode::Manual).await;
        let waiting = tokio::spawn({
            let gate = gate.clone();
            async move { gate.request().await }
        });
        while !pacing.is_pending() {
            tokio::task::yield_now().await;
        }
        pacing.drain_remaining();
        waiting.await.unwrap().unwrap();
        gate.request().await.unwrap();
        gate.request().await.unwrap();
    }
}
