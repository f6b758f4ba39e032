//! Circuit breaker for a single guarded dependency.
//!
//! ```text
//!   ┌────────┐  threshold reached  ┌──────┐  cooldown elapsed  ┌──────────┐
//!   │ Closed │ ──────────────────► │ Open │ ─────────────────► │ HalfOpen │
//!   └────────┘                     └──────┘                    └────┬─────┘
//!       ▲                              ▲          any trial fails   │
//!       │                              └────────────────────────────┤
//!       │            all trials succeed                             │
//!       └───────────────────────────────────────────────────────────┘
//! ```
//!
//! One breaker per dependency instance, shared by every caller in the
//! process. The lock is never held across an await.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Calls pass through.
    #[default]
    Closed,
    /// Calls are rejected without touching the dependency.
    Open,
    /// A limited number of trial calls test the dependency.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Admission ticket for one guarded call. Hand it back through
/// [`CircuitBreaker::on_success`] or [`CircuitBreaker::on_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Permit {
    Normal,
    Trial,
}

/// A permit that settles itself. Dropping it unresolved (the caller's future
/// was cancelled mid-call) fails a trial, reopening the breaker, so a
/// half-open slot is never held forever. An abandoned normal call counts
/// as neither outcome.
#[must_use]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    permit: Option<Permit>,
}

impl Admission<'_> {
    pub fn permit(&self) -> Option<Permit> {
        self.permit
    }

    pub fn succeed(mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.on_success(permit);
        }
    }

    pub fn fail(mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.on_failure(permit);
        }
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if let Some(Permit::Trial) = self.permit.take() {
            warn!(dependency = %self.breaker.name, "trial call abandoned");
            self.breaker.on_failure(Permit::Trial);
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Start of the current failure streak.
    streak_started: Option<Instant>,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
    trial_successes: u32,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            streak_started: None,
            opened_at: None,
            trials_in_flight: 0,
            trial_successes: 0,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, advancing Open -> HalfOpen if the cooldown has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Ask to make a call. Fails fast with `DependencyUnavailable` while open
    /// or while every half-open trial slot is taken.
    pub fn try_acquire(&self) -> Result<Permit> {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                let retry_after = self.config.cooldown().saturating_sub(elapsed);
                Err(self.reject(retry_after))
            }
            CircuitState::HalfOpen => {
                if inner.trials_in_flight + inner.trial_successes < self.config.half_open_trials {
                    inner.trials_in_flight += 1;
                    Ok(Permit::Trial)
                } else {
                    // Trial slots are busy; try again once they resolve.
                    Err(self.reject(Duration::from_millis(100)))
                }
            }
        }
    }

    /// [`CircuitBreaker::try_acquire`] wrapped in a self-settling guard.
    pub fn admit(&self) -> Result<Admission<'_>> {
        let permit = self.try_acquire()?;
        Ok(Admission {
            breaker: self,
            permit: Some(permit),
        })
    }

    pub fn on_success(&self, permit: Permit) {
        let mut inner = self.lock();
        match permit {
            Permit::Normal => {
                inner.consecutive_failures = 0;
                inner.streak_started = None;
            }
            Permit::Trial => {
                // A trial that outlived a reopen no longer counts.
                if inner.state != CircuitState::HalfOpen {
                    return;
                }
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.half_open_trials {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
        }
    }

    pub fn on_failure(&self, permit: Permit) {
        let mut inner = self.lock();
        match (permit, inner.state) {
            (Permit::Trial, CircuitState::HalfOpen) => {
                self.transition(&mut inner, CircuitState::Open);
            }
            (Permit::Normal, CircuitState::Closed) => {
                let now = Instant::now();
                let in_window = inner
                    .streak_started
                    .is_some_and(|start| now.duration_since(start) <= self.config.failure_window());
                if in_window {
                    inner.consecutive_failures += 1;
                } else {
                    inner.consecutive_failures = 1;
                    inner.streak_started = Some(now);
                }
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            // Late results from calls admitted before the last transition.
            _ => {}
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain counters behind.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|t| t.elapsed() >= self.config.cooldown())
        {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.trials_in_flight = 0;
        inner.trial_successes = 0;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                warn!(
                    dependency = %self.name,
                    %from,
                    failures = inner.consecutive_failures,
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(dependency = %self.name, %from, "circuit half-open, probing");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.streak_started = None;
                inner.opened_at = None;
                info!(dependency = %self.name, %from, "circuit closed");
            }
        }
        metrics::breaker_transitions().add(
            1,
            &[
                KeyValue::new("dependency", self.name.clone()),
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }

    fn reject(&self, retry_after: Duration) -> Error {
        metrics::breaker_rejections().add(1, &[KeyValue::new("dependency", self.name.clone())]);
        Error::DependencyUnavailable {
            dependency: self.name.clone(),
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 5,
                failure_window_ms: 60_000,
                cooldown_ms,
                half_open_trials: 3,
            },
        )
    }

    fn fail(b: &CircuitBreaker) {
        let permit = b.try_acquire().expect("admitted");
        b.on_failure(permit);
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let b = breaker(30_000);
        for _ in 0..4 {
            fail(&b);
            assert_eq!(b.state(), CircuitState::Closed);
        }
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);

        match b.try_acquire() {
            Err(Error::DependencyUnavailable { retry_after, .. }) => {
                assert!(retry_after <= Duration::from_secs(30));
                assert!(retry_after > Duration::from_secs(25));
            }
            other => panic!("expected DependencyUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn success_resets_the_streak() {
        let b = breaker(30_000);
        for _ in 0..4 {
            fail(&b);
        }
        let permit = b.try_acquire().unwrap();
        b.on_success(permit);
        for _ in 0..4 {
            fail(&b);
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_closes_after_all_trials_succeed() {
        let b = breaker(0);
        for _ in 0..5 {
            fail(&b);
        }
        assert_eq!(b.state(), CircuitState::HalfOpen);

        for i in 0..3 {
            let permit = b.try_acquire().unwrap();
            assert_eq!(permit, Permit::Trial);
            b.on_success(permit);
            if i < 2 {
                assert_eq!(b.state(), CircuitState::HalfOpen);
            }
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_limits_concurrent_trials() {
        let b = breaker(0);
        for _ in 0..5 {
            fail(&b);
        }
        let permits: Vec<_> = (0..3).map(|_| b.try_acquire().unwrap()).collect();
        assert!(matches!(
            b.try_acquire(),
            Err(Error::DependencyUnavailable { .. })
        ));
        for p in permits {
            b.on_success(p);
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn any_trial_failure_reopens() {
        let b = breaker(50);
        for _ in 0..5 {
            fail(&b);
        }
        std::thread::sleep(Duration::from_millis(60));
        let first = b.try_acquire().unwrap();
        b.on_success(first);
        let second = b.try_acquire().unwrap();
        b.on_failure(second);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[test]
    fn dropped_trial_admission_reopens() {
        let b = breaker(50);
        for _ in 0..5 {
            fail(&b);
        }
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(b.state(), CircuitState::HalfOpen);

        let admission = b.admit().unwrap();
        assert_eq!(admission.permit(), Some(Permit::Trial));
        drop(admission);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn dropped_normal_admission_leaves_the_streak_alone() {
        let b = breaker(30_000);
        for _ in 0..4 {
            fail(&b);
        }
        drop(b.admit().unwrap());
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn failures_outside_the_window_start_a_new_streak() {
        let b = CircuitBreaker::new(
            "windowed",
            BreakerConfig {
                failure_threshold: 3,
                failure_window_ms: 20,
                cooldown_ms: 30_000,
                half_open_trials: 1,
            },
        );
        fail(&b);
        fail(&b);
        std::thread::sleep(Duration::from_millis(40));
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);
    }
}
