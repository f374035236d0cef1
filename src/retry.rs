//! Bounded retry with a fixed, cancellable wait.
//!
//! A [`RetryPolicy`] wraps exactly one logical backend call. Each attempt
//! reports one of three outcomes through [`Attempt`]: success, a retryable
//! [`BackendError`], or a fatal error that must bypass the policy (budget
//! breach, oversized input). `max_retries = n` therefore means at most
//! `n + 1` attempts.
//!
//! The wait between attempts is a `tokio::select!` over the sleep and the
//! caller's [`CancellationToken`], so a cancelled extraction stops mid-wait
//! instead of sleeping out the full interval.

use crate::error::BackendError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// `{max_retries, wait}` retry rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Fixed wait before each retry.
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            wait: Duration::from_secs(30),
        }
    }
}

/// Outcome of a single attempt.
pub enum Attempt<T, E> {
    Done(T),
    Retry(BackendError),
    Fatal(E),
}

/// Why [`RetryPolicy::run`] gave up.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// Every attempt failed with a retryable error; `last` is the final one.
    Exhausted { attempts: u32, last: BackendError },
    /// An attempt reported a non-retryable error.
    Fatal(E),
    /// The token was cancelled while waiting to retry.
    Cancelled,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, wait: Duration) -> Self {
        Self { max_retries, wait }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Drive `op` until it succeeds, fails fatally, or runs out of attempts.
    ///
    /// `op` receives the zero-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(e) => return Err(RetryFailure::Fatal(e)),
                Attempt::Retry(err) => {
                    if attempt >= self.max_retries {
                        return Err(RetryFailure::Exhausted {
                            attempts: attempt + 1,
                            last: err,
                        });
                    }
                    attempt += 1;
                    warn!(
                        "Attempt {} failed ({}); retry {}/{} in {:?}",
                        attempt, err, attempt, self.max_retries, self.wait
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryFailure::Cancelled),
                        _ = sleep(self.wait) => {}
                    }
                }
            }
        }
    }
}
