//! Circuit breaker for the vector index backend.
//!
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls are rejected without touching the backend until the
//!   cooldown has elapsed
//! - **HalfOpen**: exactly one trial call is let through; success closes the
//!   circuit, failure re-opens it for another cooldown
//!
//! Admission hands out an [`Admission`] guard. A call that is dropped before
//! it settles counts as a failure, so an abandoned trial cannot leave the
//! circuit half-open forever.
//!
//! Time is read from `tokio::time::Instant` so paused-clock tests can drive
//! the cooldown.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_duration: Duration::from_secs(60),
        }
    }
}

/// Returned instead of running the call while the circuit is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen {
    pub retry_in: Duration,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_rejections: u64,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    total_calls: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            total_calls: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state.lock();
        CircuitBreakerMetrics {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Run `f` unless the circuit is open. The outcome of `f` feeds the
    /// failure count.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<Result<T, E>, CircuitOpen>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.try_admit()?;
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let result = f().await;
        match &result {
            Ok(_) => admission.succeeded(),
            Err(_) => admission.failed(),
        }
        Ok(result)
    }

    /// Admission check. Moves Open -> HalfOpen once the cooldown is over and
    /// admits a single trial.
    pub fn try_admit(&self) -> Result<Admission<'_>, CircuitOpen> {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => Ok(Admission::new(self)),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.open_duration);
                if elapsed >= self.config.open_duration {
                    info!("Circuit breaker half-open after {:?}", self.config.open_duration);
                    state.state = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    Ok(Admission::new(self))
                } else {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    Err(CircuitOpen {
                        retry_in: self.config.open_duration - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    Err(CircuitOpen {
                        retry_in: Duration::ZERO,
                    })
                } else {
                    state.trial_in_flight = true;
                    Ok(Admission::new(self))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.state != CircuitState::Closed {
            info!("Circuit breaker closed after successful trial");
        }
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.trial_in_flight = false;

        let should_open = match state.state {
            CircuitState::Closed => state.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if should_open {
            warn!(
                "Circuit breaker opened after {} consecutive failures, cooling down for {:?}",
                state.consecutive_failures, self.config.open_duration
            );
            state.state = CircuitState::Open;
            state.opened_at = Some(Instant::now());
            crate::metrics::inc_breaker_open();
        }
    }
}

/// One admitted call. Settle it with [`Admission::succeeded`] or
/// [`Admission::failed`]; dropping it unsettled records a failure.
#[must_use = "an unsettled admission counts as a failure"]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl<'a> Admission<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            settled: false,
        }
    }

    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Circuit breaker call dropped before completing");
            self.breaker.record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            open_duration: Duration::from_secs(60),
        })
    }

    async fn failing(attempts: &AtomicUsize) -> Result<(), &'static str> {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err("connection refused")
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_blocks_attempts() {
        let breaker = breaker();
        let attempts = AtomicUsize::new(0);

        for _ in 0..3 {
            let outcome = breaker.call(|| failing(&attempts)).await;
            assert!(matches!(outcome, Ok(Err(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // Fourth call inside the cooldown never reaches the backend
        tokio::time::advance(Duration::from_secs(30)).await;
        let outcome = breaker.call(|| failing(&attempts)).await;
        assert!(outcome.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // After the cooldown one trial goes through
        tokio::time::advance(Duration::from_secs(31)).await;
        let outcome = breaker.call(|| failing(&attempts)).await;
        assert!(matches!(outcome, Ok(Err(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_trial_closes_circuit() {
        let breaker = breaker();
        let attempts = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = breaker.call(|| failing(&attempts)).await;
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        let outcome = breaker.call(|| async { Ok::<_, &str>(7) }).await;
        assert_eq!(outcome, Ok(Ok(7)));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().consecutive_failures, 0);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::ZERO,
        });
        breaker.record_failure();
        let trial = breaker.try_admit().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_admit().is_err());
        assert_eq!(breaker.metrics().total_rejections, 1);
        trial.succeeded();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_reopens_instead_of_sticking() {
        let breaker = breaker();
        let attempts = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = breaker.call(|| failing(&attempts)).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        // the trial hangs and its caller gives up
        let abandoned = tokio::time::timeout(
            Duration::from_secs(5),
            breaker.call(|| std::future::pending::<Result<(), &str>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(3600)).await;
        let outcome = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert_eq!(outcome, Ok(Ok(())));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
