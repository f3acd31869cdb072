//! Per-target failure isolation: closed / open / half-open with a single
//! in-flight trial.
//!
//! Adapted from `tower-circuitbreaker`'s `Circuit` (failure-rate over a
//! sliding window) to the simpler consecutive-failure-count model this
//! core requires, plus the half-open single-trial latch that model needs
//! and the rate-window one doesn't (it permits `permitted_calls_in_half_open`
//! concurrent trials; this one permits exactly one).

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{
    CIRCUIT_DEFAULT_FAILURE_THRESHOLD, CIRCUIT_DEFAULT_MONITOR_INTERVAL_MILLIS,
    CIRCUIT_DEFAULT_RESET_TIMEOUT_MILLIS,
};

#[derive(Error, Debug)]
pub enum CircuitBreakerError {
    #[error("circuit open")]
    CircuitOpen,
    #[error("trial in progress")]
    TrialInProgress,
    #[error("action failed: {0}")]
    ActionFailed(#[source] anyhow::Error),
}

pub type CircuitBreakerResult<T> = Result<T, CircuitBreakerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_timeout: Duration,
    pub monitor_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        let reset_timeout = Duration::from_millis(CIRCUIT_DEFAULT_RESET_TIMEOUT_MILLIS);
        Self {
            failure_threshold: CIRCUIT_DEFAULT_FAILURE_THRESHOLD,
            reset_timeout,
            half_open_timeout: reset_timeout / 2,
            monitor_interval: Duration::from_millis(CIRCUIT_DEFAULT_MONITOR_INTERVAL_MILLIS),
        }
    }
}

/// Internal mutable state, guarded by a single mutex so transitions are
/// atomic with respect to concurrent `run` callers.
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    half_open_start: Option<Instant>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            half_open_start: None,
        }
    }
}

/// Failure isolation wrapper for a single target (a peer, or the
/// discovery path). `label` is used only in logs/metrics, not for equality.
pub struct CircuitBreaker {
    label: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    /// Single-trial latch for half-open: exactly one caller may hold it.
    trial_in_flight: AtomicBool,
    transitions: AtomicU64,
    failures_total: AtomicU64,
    successes_total: AtomicU64,
    half_open_trials_rejected: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(label: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            label: label.into(),
            config,
            inner: Mutex::new(Inner::new()),
            trial_in_flight: AtomicBool::new(false),
            transitions: AtomicU64::new(0),
            failures_total: AtomicU64::new(0),
            successes_total: AtomicU64::new(0),
            half_open_trials_rejected: AtomicU32::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Re-evaluates time-based transitions (open -> half-open, half-open
    /// expiry) without requiring a call to `run`. Intended to be driven by
    /// a periodic monitor task at `config.monitor_interval`.
    pub fn tick(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.advance_time_locked(&mut inner);
    }

    fn advance_time_locked(&self, inner: &mut Inner) {
        match inner.state {
            CircuitState::Open => {
                if let Some(last_failure) = inner.last_failure {
                    if last_failure.elapsed() >= self.config.reset_timeout {
                        self.transition_locked(inner, CircuitState::HalfOpen);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if let Some(start) = inner.half_open_start {
                    if start.elapsed() >= self.config.half_open_timeout
                        && !self.trial_in_flight.load(Ordering::SeqCst)
                    {
                        self.transition_locked(inner, CircuitState::Open);
                    }
                }
            }
            CircuitState::Closed => {}
        }
    }

    fn transition_locked(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        if log::log_enabled!(log::Level::Info) {
            log::info!(
                "circuit '{}' transition {:?} -> {:?}",
                self.label,
                inner.state,
                to
            );
        }
        self.transitions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("circuit_breaker_transitions_total", "label" => self.label.clone())
            .increment(1);
        inner.state = to;
        match to {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.last_failure = None;
                inner.half_open_start = None;
            }
            CircuitState::Open => {
                inner.last_failure.get_or_insert_with(Instant::now);
                inner.half_open_start = None;
            }
            CircuitState::HalfOpen => {
                inner.half_open_start = Some(Instant::now());
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.advance_time_locked(&mut inner);
        inner.state
    }

    /// Runs `action` under the breaker. See module docs for the contract.
    pub async fn run<F, Fut, T>(&self, action: F) -> CircuitBreakerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let should_run = {
            let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
            self.advance_time_locked(&mut inner);
            match inner.state {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    if self
                        .trial_in_flight
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        true
                    } else {
                        self.half_open_trials_rejected.fetch_add(1, Ordering::Relaxed);
                        false
                    }
                }
            }
        };

        if !should_run {
            let state = self.state();
            return Err(match state {
                CircuitState::Open => CircuitBreakerError::CircuitOpen,
                _ => CircuitBreakerError::TrialInProgress,
            });
        }

        let was_half_open_trial = matches!(self.state(), CircuitState::HalfOpen);
        let result = action().await;

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        if was_half_open_trial {
            self.trial_in_flight.store(false, Ordering::SeqCst);
        }

        result.map_err(CircuitBreakerError::ActionFailed)
    }

    /// Records a success outside of `run` (e.g. the caller ran the action
    /// itself and only wants the breaker's bookkeeping). No-op while open.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.advance_time_locked(&mut inner);
        if inner.state == CircuitState::Open {
            log::warn!("circuit '{}' onSuccess ignored while open", self.label);
            return;
        }
        self.successes_total.fetch_add(1, Ordering::Relaxed);
        match inner.state {
            CircuitState::HalfOpen => {
                self.transition_locked(&mut inner, CircuitState::Closed);
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => unreachable!(),
        }
    }

    /// Records a failure outside of `run`. No-op while open: must not
    /// refresh the reset timer.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.advance_time_locked(&mut inner);
        if inner.state == CircuitState::Open {
            return;
        }
        self.failures_total.fetch_add(1, Ordering::Relaxed);
        match inner.state {
            CircuitState::HalfOpen => {
                self.transition_locked(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition_locked(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => unreachable!(),
        }
    }

    pub fn force_open(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.transition_locked(&mut inner, CircuitState::Open);
    }

    pub fn force_closed(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.transition_locked(&mut inner, CircuitState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn breaker(threshold: u32, reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout,
                half_open_timeout: reset_timeout / 2,
                monitor_interval: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn opens_on_nth_consecutive_failure() {
        let cb = breaker(3, Duration::from_millis(1000));
        for _ in 0..2 {
            let _ = cb
                .run(|| async { Err::<(), _>(anyhow::anyhow!("boom")) })
                .await;
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        let _ = cb
            .run(|| async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_rejects_immediately() {
        let cb = breaker(1, Duration::from_secs(60));
        let _ = cb
            .run(|| async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .await;
        assert_eq!(cb.state(), CircuitState::Open);
        let result = cb.run(|| async { Ok::<(), anyhow::Error>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn on_failure_while_open_does_not_refresh_timer() {
        let cb = breaker(1, Duration::from_millis(50));
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        let first_last_failure = {
            let inner = cb.inner.lock().unwrap();
            inner.last_failure
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cb.on_failure();
        let second_last_failure = {
            let inner = cb.inner.lock().unwrap();
            inner.last_failure
        };
        assert_eq!(first_last_failure, second_last_failure);
    }

    #[tokio::test]
    async fn on_success_while_open_is_ignored() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_reset_timeout() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_allows_single_concurrent_trial() {
        let cb = Arc::new(breaker(1, Duration::from_millis(10)));
        cb.on_failure();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let rx = Arc::new(tokio::sync::Mutex::new(Some(rx)));
        let cb2 = cb.clone();
        let rx2 = rx.clone();
        let trial = tokio::spawn(async move {
            cb2.run(|| async move {
                let rx = rx2.lock().await.take().unwrap();
                let _ = rx.await;
                Ok::<(), anyhow::Error>(())
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = cb.run(|| async { Ok::<(), anyhow::Error>(()) }).await;
        assert!(matches!(second, Err(CircuitBreakerError::TrialInProgress)));

        tx.send(()).unwrap();
        let first = trial.await.unwrap();
        assert!(first.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn successful_half_open_trial_closes_and_resets() {
        let cb = breaker(2, Duration::from_millis(10));
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let result = cb.run(|| async { Ok::<(), anyhow::Error>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
