//! Resilience layer: every call to the state store, the event bus or any
//! other dependency goes through a [`Guarded`] handle.
//!
//! A guarded call asks the dependency's breaker for admission, then runs the
//! operation with a per-attempt timeout, retrying retryable failures with
//! exponential backoff. Only the final outcome is reported to the breaker.

pub mod breaker;
pub mod retry;

pub use breaker::{Admission, CircuitBreaker, CircuitState, Permit};
pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Breaker + retry + timeout for one dependency. Cheap to clone; clones share
/// the breaker.
#[derive(Clone)]
pub struct Guarded {
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Guarded {
    pub fn new(breaker: Arc<CircuitBreaker>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            breaker,
            retry,
            timeout,
        }
    }

    /// A guard for `name` built from engine config.
    pub fn from_config(name: &str, config: &EngineConfig) -> Self {
        Self::new(
            Arc::new(CircuitBreaker::new(name, config.breaker.clone())),
            RetryPolicy::from(&config.retry),
            config.timeout(),
        )
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn dependency(&self) -> &str {
        self.breaker.name()
    }

    /// Run `op` under the breaker. `op` is invoked once per attempt. If the
    /// returned future is dropped mid-call the admission settles itself.
    pub async fn call<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.breaker.admit()?;
        let mut retry = 0;

        loop {
            let outcome = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(self.timeout)),
            };

            match outcome {
                Ok(value) => {
                    admission.succeed();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && retry < self.retry.max_retries => {
                    let delay = self.retry.backoff(retry);
                    retry += 1;
                    debug!(
                        dependency = self.dependency(),
                        operation,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying dependency call"
                    );
                    metrics::dependency_retries().add(
                        1,
                        &[
                            KeyValue::new("dependency", self.dependency().to_string()),
                            KeyValue::new("operation", operation.to_string()),
                        ],
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_dependency_failure() {
                        warn!(
                            dependency = self.dependency(),
                            operation,
                            attempts = retry + 1,
                            error = %e,
                            "dependency call failed"
                        );
                        admission.fail();
                    } else {
                        admission.succeed();
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// The guarded dependencies of one engine process. Created once at startup
/// and handed to every component that talks to the outside world.
#[derive(Clone)]
pub struct Dependencies {
    pub store: Guarded,
    pub bus: Guarded,
}

impl Dependencies {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            store: Guarded::from_config("state_store", config),
            bus: Guarded::from_config("event_bus", config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn guard(max_retries: u32, timeout: Duration) -> Guarded {
        Guarded::new(
            Arc::new(CircuitBreaker::new(
                "dep",
                BreakerConfig {
                    failure_threshold: 2,
                    failure_window_ms: 60_000,
                    cooldown_ms: 30_000,
                    half_open_trials: 1,
                },
            )),
            RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
            timeout,
        )
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let g = guard(3, Duration::from_secs(1));
        let calls = &AtomicU32::new(0);
        let value = g
            .call("flaky", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transient("reset"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(g.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn non_retryable_errors_are_not_retried() {
        let g = guard(3, Duration::from_secs(1));
        let calls = &AtomicU32::new(0);
        let result: Result<()> = g
            .call("bad", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::fatal("rejected"))
            })
            .await;
        assert!(matches!(result, Err(Error::Dependency { retryable: false, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_attempts_time_out_and_count_as_failures() {
        let g = guard(0, Duration::from_millis(10));
        for _ in 0..2 {
            let result: Result<()> = g
                .call("slow", || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                })
                .await;
            assert!(matches!(result, Err(Error::Timeout(_))));
        }
        assert_eq!(g.breaker().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn conflicts_pass_through_without_tripping() {
        let g = guard(3, Duration::from_secs(1));
        for _ in 0..5 {
            let result: Result<()> = g
                .call("cas", || async {
                    Err(Error::ConcurrentModification { key: "k".into() })
                })
                .await;
            assert!(matches!(result, Err(Error::ConcurrentModification { .. })));
        }
        assert_eq!(g.breaker().state(), CircuitState::Closed);
    }
}
