//! Bounded exponential backoff for transient transport and storage failures.
//!
//! Every publish and every order-store write in the pipeline may hit a broker hiccup or
//! a dropped database connection. Two helpers cover the two ways the pipeline waits:
//!
//! - [`retry_with_backoff`] / [`retry_with_predicate`]: repeat one operation until it
//!   succeeds or the policy's budget is spent, then hand back the last error so the
//!   caller can dead-letter the message.
//! - [`Backoff`]: an open-ended delay sequence for loops that never give up, such as a
//!   consumer re-subscribing or the publish buffer waiting for the broker.
//!
//! # Example
//!
//! ```rust
//! use fulfillment_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .build();
//!
//! retry_with_backoff(&policy, || async {
//!     // publish the order message here
//!     Ok::<_, String>(())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// How often and how patiently a failed operation is repeated.
///
/// The wait before retry `n` (0-based) is `initial_delay * multiplier^n`, never more
/// than `max_delay`. Defaults: 3 retries, 100ms doubling up to 30s.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Wait before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single wait
    pub max_delay: Duration,
    /// Growth factor between consecutive waits
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Start from the defaults and override what differs.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Retry `max_retries` times without sleeping. Used by tests.
    #[must_use]
    pub const fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Wait before retry number `attempt` (0-based).
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let cap = self.max_delay;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if millis.is_finite() && millis < cap.as_millis() as f64 {
            Duration::from_millis(millis as u64)
        } else {
            cap
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Retries after the first attempt.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Wait before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Upper bound for any single wait.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Growth factor between consecutive waits.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Finish the policy.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Open-ended delay sequence with jitter.
///
/// Follows the policy's growth curve but ignores `max_retries`; up to 10% jitter is
/// added so consumers that lost the broker together do not come back in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: usize,
}

impl Backoff {
    /// Start a fresh sequence.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// The next wait.
    #[allow(clippy::cast_possible_truncation)]
    pub fn next_delay(&mut self) -> Duration {
        let base = self.policy.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        match base.as_millis() as u64 / 10 {
            0 => base,
            spread => base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread)),
        }
    }

    /// Waits handed out since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> usize {
        self.attempt
    }

    /// Back to the initial delay, after a healthy session.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Repeat `operation` on every error until it succeeds or the budget is spent.
///
/// # Errors
///
/// Returns the last error once `policy.max_retries` retries have failed.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_: &E| true).await
}

/// Repeat `operation` while its errors are transient.
///
/// # Errors
///
/// Returns the first error `is_transient` rejects as is, or the last error once the
/// budget is spent.
///
/// # Example
///
/// ```rust
/// use fulfillment_runtime::retry::{RetryPolicy, retry_with_predicate};
///
/// # async fn example() -> Result<(), String> {
/// let stock = retry_with_predicate(
///     &RetryPolicy::default(),
///     || async { Ok::<u32, String>(3) },
///     |err: &String| err.starts_with("connection"),
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retries = 0;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    RetryMetrics::record_success();
                    tracing::info!(retries, "Recovered after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !is_transient(&error) {
            tracing::debug!(error = %error, "Permanent failure, not retrying");
            return Err(error);
        }
        if retries >= policy.max_retries {
            RetryMetrics::record_exhausted();
            tracing::error!(retries, error = %error, "Retry budget exhausted");
            return Err(error);
        }

        let delay = policy.delay_for_attempt(retries);
        RetryMetrics::record_attempt();
        tracing::warn!(retry = retries + 1, delay_ms = delay.as_millis(), error = %error, "Transient failure, retrying");
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}
