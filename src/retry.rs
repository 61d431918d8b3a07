//! Retry with backoff around flaky external calls.
//!
//! A [`RetryPolicy`] is a maximum attempt count plus a schedule of waits. The
//! wait before attempt `n + 1` is `delays[n - 1]`; when the schedule is shorter
//! than the attempt budget its last entry repeats. Whether a failure is worth
//! retrying is decided per call site by a predicate.

use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Attempt budget and backoff schedule for one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delays: Vec<Duration>,
}

/// A successful call and how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Why a retried call gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted {
        attempts: u32,
        last: E,
        delays: Vec<Duration>,
    },
    /// An attempt failed with an error the predicate refused to retry.
    Fatal { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Fatal { attempt, .. } => *attempt,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal { error, .. } => error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last, .. } => {
                write!(f, "gave up after {} attempts: {}", attempts, last)
            }
            RetryError::Fatal { attempt, error } => {
                write!(f, "attempt {} failed permanently: {}", attempt, error)
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

impl RetryPolicy {
    /// A policy with at least one attempt. An empty schedule means no waiting.
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delays,
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self::new(1, Vec::new())
    }

    /// Magnet rendering: 4 attempts, two short waits then a long one.
    pub fn render(short: Duration, long: Duration) -> Self {
        Self::new(4, vec![short, short, long])
    }

    /// Scene composition: 3 attempts, an immediate retry then a long wait.
    pub fn compose(long: Duration) -> Self {
        Self::new(3, vec![Duration::ZERO, long])
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before attempt `attempt` (1-based). The first attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let index = (attempt - 2) as usize;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Every wait the policy would perform if all attempts failed.
    pub fn schedule(&self) -> Vec<Duration> {
        (2..=self.max_attempts).map(|a| self.delay_before(a)).collect()
    }

    /// Runs `op` until it succeeds, the predicate rejects an error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        mut op: F,
        is_retryable: P,
    ) -> Result<Retried<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let mut waited = Vec::new();
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, "Call succeeded after retry");
                    }
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) if !is_retryable(&error) => {
                    return Err(RetryError::Fatal { attempt, error });
                }
                Err(error) if attempt >= self.max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                        delays: waited,
                    });
                }
                Err(error) => {
                    let delay = self.delay_before(attempt + 1);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient error, will retry"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    waited.push(delay);
                    attempt += 1;
                }
            }
        }
    }
}
