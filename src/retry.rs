//! Bounded exponential-backoff retries.
//!
//! A [`RetryPolicy`] runs an async operation up to
//! [`RetryConfig::max_attempts`] times. Whether a failure is worth another
//! attempt is decided by a [`RetryPredicate`]; the delay before attempt
//! `n + 1` is `initial_delay * backoff_multiplier^(n - 1)`, capped at
//! `max_delay`. Attempts are strictly sequential and the backoff sleep can be
//! interrupted by a [`CancellationToken`].

use crate::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry configuration.
///
/// # Examples
///
/// ```
/// use querykit::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig {
///     max_attempts: 4,
///     initial_delay: Duration::from_millis(100),
///     ..Default::default()
/// };
///
/// // 100ms, 200ms, 400ms
/// assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
/// assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included. `1` disables retries.
    pub max_attempts: usize,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Growth factor applied for every further attempt.
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay.
    pub max_delay: Option<Duration>,
    /// Scale each delay by a random factor between 0.5 and 1.0.
    pub jitter: bool,
    /// Wait at least as long as a `Retry-After` header asks (still capped by `max_delay`).
    pub respect_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Some(Duration::from_secs(10)),
            jitter: false,
            respect_retry_after: true,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Returns the backoff delay that follows failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let factor = self.backoff_multiplier.max(0.0).powi(exponent);
        let mut secs = self.initial_delay.as_secs_f64() * factor;
        if let Some(max_delay) = self.max_delay {
            secs = secs.min(max_delay.as_secs_f64());
        }
        if !secs.is_finite() {
            return self.max_delay.unwrap_or(Duration::MAX);
        }

        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        if self.jitter {
            let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(jitter_factor)
        } else {
            delay
        }
    }

    fn delay_after(&self, error: &Error, attempt: usize) -> Duration {
        let backoff = self.delay_for_attempt(attempt);
        match error.retry_after() {
            Some(hint) if self.respect_retry_after => {
                let delay = backoff.max(hint);
                self.max_delay.map_or(delay, |max| delay.min(max))
            }
            _ => backoff,
        }
    }
}

/// Trait for determining whether a failed attempt should be retried.
///
/// # Examples
///
/// ```
/// use querykit::{Error, RetryPredicate};
///
/// struct RetryOnRateLimit;
///
/// impl RetryPredicate for RetryOnRateLimit {
///     fn should_retry(&self, error: &Error, _attempt: usize) -> bool {
///         error.status().is_some_and(|s| s.as_u16() == 429)
///     }
/// }
/// ```
pub trait RetryPredicate: Send + Sync {
    /// Returns `true` if another attempt should follow failed attempt `attempt` (1-indexed).
    fn should_retry(&self, error: &Error, attempt: usize) -> bool;
}

/// The default predicate: retries unless [`Error::is_retryable`] marks the
/// error as permanent.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnRetryable;

impl RetryPredicate for RetryOnRetryable {
    fn should_retry(&self, error: &Error, _attempt: usize) -> bool {
        error.is_retryable()
    }
}

/// Retries only 5xx responses.
#[derive(Debug, Clone, Copy)]
pub struct RetryOn5xx;

impl RetryPredicate for RetryOn5xx {
    fn should_retry(&self, error: &Error, _attempt: usize) -> bool {
        matches!(error, Error::Api(api) if api.status.is_server_error())
    }
}

/// Retries only timeouts.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnTimeout;

impl RetryPredicate for RetryOnTimeout {
    fn should_retry(&self, error: &Error, _attempt: usize) -> bool {
        error.is_timeout()
    }
}

/// Retries when any of the wrapped predicates does.
///
/// ```
/// use querykit::retry::{OrPredicate, RetryOn5xx, RetryOnTimeout};
///
/// let predicate = OrPredicate::new(vec![Box::new(RetryOn5xx), Box::new(RetryOnTimeout)]);
/// # let _ = predicate;
/// ```
pub struct OrPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl OrPredicate {
    /// Creates a new `OrPredicate` from a list of predicates.
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }
}

impl RetryPredicate for OrPredicate {
    fn should_retry(&self, error: &Error, attempt: usize) -> bool {
        self.predicates
            .iter()
            .any(|p| p.should_retry(error, attempt))
    }
}

/// Runs operations with retries.
///
/// The policy itself is stateless between calls: every `execute` starts a
/// fresh attempt counter.
///
/// # Examples
///
/// ```
/// use querykit::{Error, RetryConfig, RetryPolicy};
/// use std::time::Duration;
///
/// # async fn example() {
/// let policy = RetryPolicy::new(RetryConfig {
///     max_attempts: 2,
///     initial_delay: Duration::from_millis(1),
///     ..Default::default()
/// });
///
/// let result: Result<(), Error> = policy
///     .execute(|| async { Err(Error::network(std::io::Error::other("reset"))) })
///     .await;
///
/// assert!(matches!(result, Err(Error::RetryExhausted { attempts: 2, .. })));
/// # }
/// ```
pub struct RetryPolicy {
    config: RetryConfig,
    predicate: Box<dyn RetryPredicate>,
}

impl RetryPolicy {
    /// Creates a policy using [`RetryOnRetryable`].
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            predicate: Box::new(RetryOnRetryable),
        }
    }

    /// Replaces the retry predicate.
    pub fn with_predicate(mut self, predicate: Box<dyn RetryPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_cancel(operation, None).await
    }

    /// Like [`execute`](Self::execute), but aborts with [`Error::Aborted`] as
    /// soon as `cancel` fires, including during a backoff sleep.
    pub async fn execute_with_cancel<F, Fut, T>(
        &self,
        mut operation: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                return Err(Error::Aborted);
            }

            attempt += 1;
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !self.predicate.should_retry(&error, attempt) {
                return Err(error);
            }

            if attempt >= max_attempts {
                tracing::warn!(
                    error = %error,
                    attempts = attempt,
                    "Retry attempts exhausted"
                );
                return Err(Error::RetryExhausted {
                    attempts: attempt,
                    last_error: Box::new(error),
                });
            }

            let delay = self.config.delay_after(&error, attempt);
            tracing::info!(
                error = %error,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying after delay"
            );

            match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(Error::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
