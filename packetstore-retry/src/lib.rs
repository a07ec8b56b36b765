//! Bounded retry and backoff schedules for packetstore backends
//!
//! Connection establishment is the only place in packetstore that retries.
//! This crate provides the retry loop and the fixed delay schedule it runs on,
//! so the relational backend can never block indefinitely while a database
//! is unreachable.

use backoff::backoff::Backoff;
use futures::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' gave up after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RetryError {
    /// Number of attempts made before giving up, if the schedule was exhausted
    pub fn attempts(&self) -> Option<usize> {
        match self {
            RetryError::MaxRetriesExceeded { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Boxed future for retry operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RetryResult<T>> + Send + 'a>>;

/// Delay schedule with an explicit, finite list of waits
///
/// Every delay sits between two attempts, so a schedule of `n` delays allows
/// `n + 1` attempts in total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedBackoff {
    delays: Vec<Duration>,
    position: usize,
}

impl FixedBackoff {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays, position: 0 }
    }

    /// The schedule used when opening database connections:
    /// 200ms, 500ms, 1s, 2s, 5s.
    pub fn connection_default() -> Self {
        Self::new(vec![
            Duration::from_millis(200),
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(5),
        ])
    }

    /// Total time spent sleeping if every attempt fails
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }
}

impl Backoff for FixedBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.delays.get(self.position).copied();
        if delay.is_some() {
            self.position += 1;
        }
        delay
    }

    fn reset(&mut self) {
        self.position = 0;
    }
}

/// Execute an operation, retrying transient failures on the connection schedule
pub async fn with_backoff<'a, F, T>(op_name: &'static str, f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'a, T>,
{
    retry_with_backoff(op_name, FixedBackoff::connection_default(), f).await
}

/// Execute an operation, retrying transient failures until the backoff is exhausted
///
/// `f` receives the 1-based attempt number. A `Permanent` error stops immediately.
pub async fn retry_with_backoff<'a, B, F, T>(
    op_name: &'static str,
    mut backoff: B,
    mut f: F,
) -> RetryResult<T>
where
    B: Backoff,
    F: FnMut(usize) -> BoxFuture<'a, T>,
{
    backoff.reset();
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "Attempting operation");

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = op_name,
                        attempts = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(err @ RetryError::Permanent { .. }) => {
                warn!(operation = op_name, attempt, error = %err, "Operation failed permanently");
                return Err(err);
            }
            Err(err) => {
                let Some(delay) = backoff.next_backoff() else {
                    warn!(
                        operation = op_name,
                        attempts = attempt,
                        error = %err,
                        "Retry schedule exhausted"
                    );
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        attempts: attempt,
                        source: into_source(err),
                    });
                };

                warn!(
                    operation = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );

                #[cfg(feature = "async-rt")]
                tokio::time::sleep(delay).await;

                #[cfg(not(feature = "async-rt"))]
                std::thread::sleep(delay);

                attempt += 1;
            }
        }
    }
}

fn into_source(err: RetryError) -> Box<dyn std::error::Error + Send + Sync> {
    match err {
        RetryError::Transient { source, .. }
        | RetryError::Permanent { source, .. }
        | RetryError::MaxRetriesExceeded { source, .. } => source,
    }
}

/// Helper macro for creating transient errors
#[macro_export]
macro_rules! transient_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Transient {
            operation: $op,
            source: Box::new($err),
        }
    };
}

/// Helper macro for creating permanent errors
#[macro_export]
macro_rules! permanent_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Permanent {
            operation: $op,
            source: Box::new($err),
        }
    };
}
