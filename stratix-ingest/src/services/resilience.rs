//! Resilience Layer
//!
//! Retry with capped, jittered exponential backoff plus one circuit breaker
//! per external dependency. Breakers are shared by every job so a failing
//! store is detected once, not once per job.
//!
//! ```text
//!   Closed ──N consecutive transient failures──▶ Open
//!     ▲                                            │ cool-down elapsed
//!     └──────── trial succeeds ◀── HalfOpen ◀──────┘
//!                                     │ trial fails
//!                                     └──────────▶ Open
//! ```
//!
//! A trial that never reports back (its caller was dropped) expires after
//! one cool-down and the next caller becomes the trial.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::models::{CircuitState, Dependency};
use crate::services::health_monitor::HealthRegistry;

/// Errors that know whether retrying could help
pub trait Transience {
    fn is_transient(&self) -> bool;
}

impl Transience for sqlx::Error {
    fn is_transient(&self) -> bool {
        stratix_common::error::is_transient_sqlx(self)
    }
}

impl Transience for stratix_common::Error {
    fn is_transient(&self) -> bool {
        stratix_common::Error::is_transient(self)
    }
}

/// Backoff tuning
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in [0.5, 1.0]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let uncapped = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = uncapped.min(self.max_delay);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            capped.mul_f64(factor)
        } else {
            capped
        }
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive transient failures that open the circuit
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before admitting a trial
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { trial_started: Instant },
}

/// Per-dependency circuit breaker
pub struct CircuitBreaker {
    dependency: Dependency,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    health: HealthRegistry,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("dependency", &self.dependency)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(dependency: Dependency, config: BreakerConfig, health: HealthRegistry) -> Self {
        health.set_circuit(dependency, CircuitState::Closed);
        Self {
            dependency,
            config,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
            health,
        }
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    pub fn state(&self) -> CircuitState {
        match *self.lock() {
            BreakerState::Closed { .. } => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Admit a call, or report how long until the circuit may close
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.lock();
        match *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { until } => {
                let now = Instant::now();
                if now >= until {
                    *state = BreakerState::HalfOpen { trial_started: now };
                    drop(state);
                    info!(dependency = %self.dependency, "Circuit half-open, admitting trial call");
                    self.health.set_circuit(self.dependency, CircuitState::HalfOpen);
                    Ok(())
                } else {
                    Err(until - now)
                }
            }
            BreakerState::HalfOpen { trial_started } => {
                let waited = trial_started.elapsed();
                if waited < self.config.cool_down {
                    Err(self.config.cool_down - waited)
                } else {
                    *state = BreakerState::HalfOpen {
                        trial_started: Instant::now(),
                    };
                    drop(state);
                    warn!(dependency = %self.dependency, "Trial call never reported back, admitting another");
                    Ok(())
                }
            }
        }
    }

    /// The dependency answered (success or a permanent, non-infrastructure error)
    pub fn record_success(&self) {
        let mut state = self.lock();
        let was_closed = matches!(*state, BreakerState::Closed { .. });
        *state = BreakerState::Closed { failures: 0 };
        drop(state);
        if !was_closed {
            info!(dependency = %self.dependency, "Circuit closed");
            self.health.set_circuit(self.dependency, CircuitState::Closed);
        }
    }

    /// The dependency failed transiently
    pub fn record_failure(&self, reason: &str) {
        let mut state = self.lock();
        let opened = match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    *state = BreakerState::Open {
                        until: Instant::now() + self.config.cool_down,
                    };
                    true
                } else {
                    *state = BreakerState::Closed { failures };
                    false
                }
            }
            BreakerState::HalfOpen { .. } => {
                *state = BreakerState::Open {
                    until: Instant::now() + self.config.cool_down,
                };
                true
            }
            BreakerState::Open { .. } => false,
        };
        drop(state);

        if opened {
            error!(
                dependency = %self.dependency,
                cool_down_ms = self.config.cool_down.as_millis() as u64,
                reason,
                "Circuit opened"
            );
            self.health.set_circuit(self.dependency, CircuitState::Open);
            self.health.record_failure(self.dependency, reason);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Failure of a call routed through [`Resilience::call`]
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// Circuit open; the call was not attempted
    #[error("{dependency} circuit open, retry after {}ms", retry_after.as_millis())]
    CircuitOpen {
        dependency: Dependency,
        retry_after: Duration,
    },

    /// Transient failures outlasted the retry budget
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// Not worth retrying (constraint violation, missing object, ...)
    #[error("{0}")]
    Permanent(E),
}

/// Shared retry policy and per-dependency breakers
#[derive(Clone)]
pub struct Resilience {
    policy: RetryPolicy,
    relational: Arc<CircuitBreaker>,
    storage: Arc<CircuitBreaker>,
}

impl Resilience {
    pub fn new(policy: RetryPolicy, breaker: BreakerConfig, health: HealthRegistry) -> Self {
        Self {
            policy,
            relational: Arc::new(CircuitBreaker::new(
                Dependency::RelationalStore,
                breaker.clone(),
                health.clone(),
            )),
            storage: Arc::new(CircuitBreaker::new(
                Dependency::ObjectStorage,
                breaker,
                health,
            )),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self, dependency: Dependency) -> &CircuitBreaker {
        match dependency {
            Dependency::RelationalStore => &self.relational,
            Dependency::ObjectStorage => &self.storage,
        }
    }

    /// Run `operation` against `dependency` with retries and breaker gating
    ///
    /// Transient errors are retried up to `max_retries` times with backoff.
    /// Permanent errors return immediately and never count against the
    /// breaker. Every attempt re-checks the breaker, so a circuit opened by
    /// another job stops this one as well.
    pub async fn call<T, E, F, Fut>(
        &self,
        dependency: Dependency,
        operation: &str,
        f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transience + fmt::Display,
    {
        self.attempt(dependency, operation, Some(self.breaker(dependency)), f)
            .await
    }

    /// Retry like [`Resilience::call`] without consulting or tripping the breaker
    ///
    /// For job bookkeeping (job rows, row failure reports) that has to land
    /// even while batch writes are short-circuited. Never returns
    /// [`ResilienceError::CircuitOpen`].
    pub async fn call_ungated<T, E, F, Fut>(
        &self,
        dependency: Dependency,
        operation: &str,
        f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transience + fmt::Display,
    {
        self.attempt(dependency, operation, None, f).await
    }

    async fn attempt<T, E, F, Fut>(
        &self,
        dependency: Dependency,
        operation: &str,
        breaker: Option<&CircuitBreaker>,
        mut f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transience + fmt::Display,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if let Some(Err(retry_after)) = breaker.map(CircuitBreaker::try_acquire) {
                warn!(
                    dependency = %dependency,
                    operation,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Skipping call - circuit breaker open"
                );
                return Err(ResilienceError::CircuitOpen {
                    dependency,
                    retry_after,
                });
            }

            attempt += 1;
            match f().await {
                Ok(value) => {
                    if let Some(breaker) = breaker {
                        breaker.record_success();
                    }
                    if attempt > 1 {
                        let elapsed_ms = started.elapsed().as_millis() as u64;
                        if elapsed_ms > 2000 {
                            warn!(operation, attempt, elapsed_ms, "Succeeded after significant retry period (>2s)");
                        } else {
                            debug!(operation, attempt, elapsed_ms, "Succeeded after retry");
                        }
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => {
                    if let Some(breaker) = breaker {
                        breaker.record_success();
                    }
                    return Err(ResilienceError::Permanent(e));
                }
                Err(e) => {
                    let reason = e.to_string();
                    if let Some(breaker) = breaker {
                        breaker.record_failure(&reason);
                    }
                    if attempt > self.policy.max_retries {
                        error!(
                            dependency = %dependency,
                            operation,
                            attempts = attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            error = %reason,
                            "Retries exhausted"
                        );
                        return Err(ResilienceError::Exhausted {
                            attempts: attempt,
                            last: e,
                        });
                    }
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        dependency = %dependency,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test error (transient: {})", self.transient)
        }
    }

    impl Transience for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: true,
        }
    }

    fn resilience(max_retries: u32, failure_threshold: u32) -> Resilience {
        Resilience::new(
            fast_policy(max_retries),
            BreakerConfig {
                failure_threshold,
                cool_down: Duration::from_millis(30),
            },
            HealthRegistry::new(),
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let delay = policy.delay_for(3);
            assert!(delay >= Duration::from_millis(200), "{:?}", delay);
            assert!(delay <= Duration::from_millis(400), "{:?}", delay);
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let resilience = resilience(3, 10);
        let calls = AtomicU32::new(0);

        let result = resilience
            .call(Dependency::RelationalStore, "test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError { transient: true })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            resilience.breaker(Dependency::RelationalStore).state(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let resilience = resilience(3, 10);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = resilience
            .call(Dependency::RelationalStore, "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { transient: false }) }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let resilience = resilience(2, 10);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = resilience
            .call(Dependency::ObjectStorage, "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { transient: true }) }
            })
            .await;

        match result {
            Err(ResilienceError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {:?}", other.err()),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_short_circuits() {
        let resilience = resilience(10, 3);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = resilience
            .call(Dependency::RelationalStore, "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { transient: true }) }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            resilience.breaker(Dependency::RelationalStore).state(),
            CircuitState::Open
        );

        // Other dependency unaffected
        assert_eq!(
            resilience.breaker(Dependency::ObjectStorage).state(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let health = HealthRegistry::new();
        let breaker = CircuitBreaker::new(
            Dependency::ObjectStorage,
            BreakerConfig {
                failure_threshold: 1,
                cool_down: Duration::from_millis(20),
            },
            health.clone(),
        );

        breaker.record_failure("connection refused");
        assert!(breaker.try_acquire().is_err());
        assert_eq!(health.get(Dependency::ObjectStorage).circuit, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_err(), "second caller must wait for the trial");

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(health.get(Dependency::ObjectStorage).circuit, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_abandoned_trial_expires_after_cool_down() {
        let resilience = Resilience::new(
            fast_policy(0),
            BreakerConfig {
                failure_threshold: 1,
                cool_down: Duration::from_millis(20),
            },
            HealthRegistry::new(),
        );
        let breaker = resilience.breaker(Dependency::RelationalStore);

        breaker.record_failure("database is locked");
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The trial's caller goes away before the call reports back
        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            resilience.call(Dependency::RelationalStore, "test", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, TestError>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_err(), "trial still counts as in flight");

        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = resilience
            .call(Dependency::RelationalStore, "test", || async { Ok::<_, TestError>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_ungated_call_ignores_open_circuit() {
        let resilience = resilience(2, 1);
        let breaker = resilience.breaker(Dependency::RelationalStore);
        breaker.record_failure("database is locked");
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result = resilience
            .call_ungated(Dependency::RelationalStore, "save job", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(TestError { transient: true })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Bookkeeping neither closes nor re-trips the circuit
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new(
            Dependency::RelationalStore,
            BreakerConfig {
                failure_threshold: 1,
                cool_down: Duration::from_millis(10),
            },
            HealthRegistry::new(),
        );

        breaker.record_failure("timeout");
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(breaker.try_acquire().is_ok());
        breaker.record_failure("timeout again");
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
