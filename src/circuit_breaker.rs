//! Circuit breaker guarding every call made through a client.
//!
//! # States
//!
//! ```text
//! CLOSED ──[failure_threshold consecutive failures]──► OPEN
//!   ▲                                                    │
//!   │                                          [reset_timeout elapsed]
//!   │                                                    ▼
//!   └───────────[trial succeeds]──────────────────── HALF-OPEN
//!                                                        │
//!                         OPEN ◄──[trial fails]──────────┘
//! ```
//!
//! While half-open exactly one trial call is in flight; every other call fails
//! fast with [`Error::CircuitOpen`] until the trial settles. A trial that is
//! dropped or cancelled before settling frees the slot for the next caller.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Cooldown between opening and admitting a trial call.
    pub reset_timeout: Duration,
    /// When `false` the breaker lets everything through and records nothing.
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            enabled: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// When the most recent failure was recorded.
    pub last_failure_at: Option<Instant>,
    /// When the breaker last opened.
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// A circuit breaker.
///
/// Cloning shares the underlying state, which is how several clients can be
/// deliberately wired to one breaker.
///
/// # Examples
///
/// ```
/// use querykit::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Error};
/// use std::time::Duration;
///
/// # async fn example() {
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig {
///     failure_threshold: 1,
///     reset_timeout: Duration::from_secs(30),
///     ..Default::default()
/// });
///
/// let _ = breaker
///     .execute(|| async { Err::<(), _>(Error::network(std::io::Error::other("refused"))) })
///     .await;
/// assert_eq!(breaker.state(), CircuitState::Open);
///
/// let fast = breaker.execute(|| async { Ok::<_, Error>(()) }).await;
/// assert!(matches!(fast, Err(Error::CircuitOpen { .. })));
/// # }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(BreakerState::new())),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the stored state. An open breaker whose cooldown has elapsed
    /// still reports `Open` until a call arrives to probe it.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Failures recorded since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Returns a snapshot of the breaker.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state.lock();
        CircuitBreakerSnapshot {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            last_failure_at: state.last_failure_at,
            opened_at: state.opened_at,
        }
    }

    /// Forces the breaker closed and clears its counters.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = BreakerState::new();
        tracing::info!("Circuit breaker reset");
    }

    /// Runs `operation` if the breaker admits it.
    ///
    /// The operation's result is returned untouched; the breaker only decides
    /// whether the operation runs and records its outcome.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.config.enabled {
            return operation().await;
        }

        let mut permit = self.acquire()?;
        let result = operation().await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(Error::Aborted) | Err(Error::CircuitOpen { .. }) => permit.release(),
            Err(_) => permit.fail(),
        }
        result
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let mut state = self.state.lock();
        let now = Instant::now();

        match state.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let opened_at = state.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.config.reset_timeout && !state.trial_in_flight {
                    state.state = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    tracing::info!(
                        from = %CircuitState::Open,
                        to = %CircuitState::HalfOpen,
                        "Circuit breaker admitting trial call"
                    );
                    Ok(Permit::new(self, true))
                } else {
                    tracing::debug!("Circuit breaker open, rejecting call");
                    Err(Error::CircuitOpen {
                        retry_in: self.config.reset_timeout.saturating_sub(elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    tracing::debug!("Circuit breaker trial in flight, rejecting call");
                    Err(Error::CircuitOpen {
                        retry_in: Duration::ZERO,
                    })
                } else {
                    state.trial_in_flight = true;
                    Ok(Permit::new(self, true))
                }
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        if trial {
            state.trial_in_flight = false;
            state.state = CircuitState::Closed;
            state.opened_at = None;
            tracing::info!(
                from = %CircuitState::HalfOpen,
                to = %CircuitState::Closed,
                "Circuit breaker closed after successful trial"
            );
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_at = Some(now);

        if trial {
            state.trial_in_flight = false;
            state.state = CircuitState::Open;
            state.opened_at = Some(now);
            tracing::warn!(
                from = %CircuitState::HalfOpen,
                to = %CircuitState::Open,
                "Circuit breaker trial failed, reopening"
            );
        } else if state.state == CircuitState::Closed
            && state.consecutive_failures >= self.config.failure_threshold
        {
            state.state = CircuitState::Open;
            state.opened_at = Some(now);
            tracing::warn!(
                from = %CircuitState::Closed,
                to = %CircuitState::Open,
                failures = state.consecutive_failures,
                "Circuit breaker opened"
            );
        }
    }

    fn release_trial(&self) {
        let mut state = self.state.lock();
        state.trial_in_flight = false;
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &state.state)
            .field("consecutive_failures", &state.consecutive_failures)
            .finish()
    }
}

/// Admission ticket for one call. Dropping an unsettled trial frees the slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn succeed(&mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    fn fail(&mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }

    fn release(&mut self) {
        self.settled = true;
        if self.trial {
            self.breaker.release_trial();
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}
