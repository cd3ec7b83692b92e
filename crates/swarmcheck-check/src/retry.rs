//! Bounded retry with backoff.
//!
//! Every check waits for the network the same way: probe, sleep, probe
//! again, until the probe reports success, the budget runs out or the
//! invocation deadline passes.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backoff {
    /// Same delay after every attempt.
    Fixed(Duration),
    /// Delay grows with the attempt index: `d`, `2d`, `3d`, ...
    Linear(Duration),
}

impl Backoff {
    /// Delay to wait after the given 1-based attempt.
    pub fn delay_after(&self, attempt: usize) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear(delay) => delay.saturating_mul(u32::try_from(attempt).unwrap_or(u32::MAX)),
        }
    }
}

/// A retry budget, schedule and optional deadline.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    budget: usize,
    backoff: Backoff,
    deadline: Option<Instant>,
}

impl Retry {
    pub fn new(budget: usize, backoff: Backoff) -> Self {
        Self {
            budget,
            backoff,
            deadline: None,
        }
    }

    pub fn fixed(budget: usize, delay: Duration) -> Self {
        Self::new(budget, Backoff::Fixed(delay))
    }

    pub fn linear(budget: usize, delay: Duration) -> Self {
        Self::new(budget, Backoff::Linear(delay))
    }

    /// Abort with [`Error::DeadlineExceeded`] once `deadline` passes, even
    /// in the middle of a probe or a sleep.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Probe until it yields a value.
    ///
    /// `Ok(None)` and retryable errors count as "not yet". Any other error
    /// ends the loop immediately. When the budget is spent the result is
    /// [`Error::ExceededRetries`] carrying the last transient error, if any.
    pub async fn poll<T, F, Fut>(&self, mut probe: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let mut last = None;

        for attempt in 1..=self.budget {
            if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(Error::DeadlineExceeded);
            }

            match self.bounded(probe(attempt)).await? {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    debug!(attempt, budget = self.budget, "not converged yet");
                }
                Err(e) if e.is_retryable() => {
                    debug!(attempt, budget = self.budget, error = %e, "transient probe failure");
                    last = Some(Box::new(e));
                }
                Err(e) => return Err(e),
            }

            if attempt < self.budget {
                self.bounded(tokio::time::sleep(self.backoff.delay_after(attempt)))
                    .await?;
            }
        }

        Err(Error::ExceededRetries {
            attempts: self.budget,
            last,
        })
    }

    /// Probe until it returns `true`. Returns the attempt that succeeded.
    pub async fn until<F, Fut>(&self, mut probe: F) -> Result<usize>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.poll(|attempt| {
            let fut = probe(attempt);
            async move { Ok(fut.await?.then_some(attempt)) }
        })
        .await
    }

    async fn bounded<F: Future>(&self, fut: F) -> Result<F::Output> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| Error::DeadlineExceeded),
            None => Ok(fut.await),
        }
    }
}
