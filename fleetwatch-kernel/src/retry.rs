//! Bounded retries with exponential backoff
//!
//! Wraps probe executions and storage writes. Errors say whether another
//! attempt makes sense through `Retryable`; fatal errors fail fast.

use fleetwatch_probe::ProbeError;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Classifies an error for the retry loop
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ProbeError {
    fn is_retryable(&self) -> bool {
        ProbeError::is_retryable(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Adds up to half the delay at random
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

/// Successful value plus the number of attempts it took
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("non-retryable failure on attempt {attempts}: {error}")]
    Fatal { error: E, attempts: u32 },
    #[error("gave up after {attempts} attempts: {error}")]
    Exhausted { error: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. } | RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn error(&self) -> &E {
        match self {
            RetryError::Fatal { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }

    pub fn into_error(self) -> E {
        match self {
            RetryError::Fatal { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the next attempt, after `failed` attempts failed (1-based)
    pub fn delay_after(&self, failed: u32) -> Duration {
        let exp = failed.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        let base = if secs.is_finite() {
            Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
        } else {
            self.max_delay
        };
        if self.jitter {
            let extra_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
            base + Duration::from_millis(extra_ms)
        } else {
            base
        }
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<Attempted<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = label, attempt, "succeeded after retry");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) if !error.is_retryable() => {
                    return Err(RetryError::Fatal {
                        error,
                        attempts: attempt,
                    });
                }
                Err(error) if attempt >= max_attempts => {
                    return Err(RetryError::Exhausted {
                        error,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        op = label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
