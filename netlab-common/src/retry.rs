use std::{future::Future, time::Duration};

use tokio::time::sleep;

/// Returned when every attempt failed. Carries the error of the last attempt.
#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct RetryError<E> {
    /// Attempts made before giving up.
    pub attempts: usize,
    pub last: E,
}

/// A bounded retry policy with a fixed delay between attempts.
///
/// Only meant for OS operations that are known to fail transiently, like moving an interface into
/// a namespace that is still being set up, or removing a cgroup right after its last task exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Total number of attempts, including the first one. Zero is treated as one.
    pub attempts: usize,
    /// Delay between two attempts.
    pub delay: Duration,
}

impl Retry {
    /// A policy making at most `attempts` attempts, sleeping `delay` in between.
    pub const fn new(attempts: usize, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Runs `f` until it succeeds or the attempts are exhausted. `f` receives the zero-based
    /// attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut f: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;

        loop {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(last) => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(RetryError { attempts, last });
                    }

                    tracing::debug!(attempt, delay = ?self.delay, "retrying");
                    sleep(self.delay).await;
                }
            }
        }
    }
}
