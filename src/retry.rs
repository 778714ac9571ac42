//! Retry and polling utilities.
//!
//! Remote operations use a small fixed number of attempts with a fixed delay
//! between them; there is no exponential backoff. Polling loops are bounded
//! by an absolute [`Deadline`] computed once at workflow entry and re-checked
//! before every attempt.
//!
//! # Example
//!
//! ```ignore
//! use cluster_orchestrator::retry::{retry_fixed, RetryPolicy};
//!
//! let output = retry_fixed(
//!     &RetryPolicy::new(3, Duration::from_secs(2)),
//!     "kubectl get nodes",
//!     |e: &Error| e.is_retryable(),
//!     || async { transport.exec(&target, "kubectl get nodes", timeout).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::Error;

/// Fixed-delay retry policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts (at least 1)
    pub max_attempts: u32,
    /// Sleep between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempts and delay
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// A policy that tries exactly once
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Outcome of a retried operation that exhausted its attempts
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Attempts made
    pub attempts: u32,
    /// Error of the last attempt
    pub last_error: E,
}

/// Execute an async operation, retrying with a fixed delay.
///
/// `should_retry` decides whether an error is transient; a non-transient
/// error is returned immediately. The returned [`Exhausted`] carries the
/// number of attempts so callers can report it.
pub async fn retry_fixed<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= policy.max_attempts || !should_retry(&e) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed, giving up"
                    );
                    return Err(Exhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = policy.delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

/// Absolute point in time a workflow must finish polling by
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Deadline `budget` from now
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// Returns true once the deadline has passed
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left before the deadline (zero once expired)
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Original time budget
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Error describing a wait that ran past this deadline
    pub fn exceeded(&self, operation: impl Into<String>) -> Error {
        Error::timeout(operation, self.budget)
    }
}

/// Poll `check` every `interval` until it yields `Some`, or the deadline passes.
///
/// The deadline is checked before every attempt, so an already-expired
/// deadline fails without calling `check`. Errors from `check` are treated
/// as "not yet" and logged; the poll only fails on the deadline.
pub async fn poll_until<F, Fut, T>(
    deadline: &Deadline,
    interval: Duration,
    operation_name: &str,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let mut attempt = 0u32;
    loop {
        if deadline.is_expired() {
            warn!(operation = %operation_name, attempt, "deadline passed");
            return Err(deadline.exceeded(operation_name));
        }
        attempt += 1;

        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                debug!(operation = %operation_name, attempt, "condition not met yet");
            }
            Err(e) => {
                debug!(operation = %operation_name, attempt, error = %e, "poll attempt failed");
            }
        }

        let pause = interval.min(deadline.remaining());
        if pause.is_zero() {
            continue;
        }
        tokio::time::sleep(pause).await;
    }
}
