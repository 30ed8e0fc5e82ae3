//! Bounded retry with exponential backoff
//!
//! Every I/O path in the crate runs through [`RetryExecutor`]. A classifier
//! decides per failure whether another attempt is worth making; the delay
//! doubles after each failed attempt up to a cap, and the last error is
//! returned once the attempt budget is spent.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::config::BackupRestoreConfig;
use crate::coordination::CoordinationError;
use crate::error::{BackupRestoreError, FailureKind};
use crate::store::StoreError;

#[cfg(unix)]
const NAME_TOO_LONG_OS_ERROR: i32 = 36;
#[cfg(windows)]
const NAME_TOO_LONG_OS_ERROR: i32 = 206;
#[cfg(not(any(unix, windows)))]
const NAME_TOO_LONG_OS_ERROR: i32 = -1;

/// Outcome of classifying a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait and try again
    Retry,
    /// Give up immediately and propagate the error
    Abort,
}

/// Errors that can represent cancellation of the surrounding operation.
///
/// The async executor never retries a cancellation and produces one itself
/// when the token fires between attempts.
pub trait CancellableError: Display {
    /// Build the cancellation error
    fn cancelled() -> Self;

    /// Whether this error is a cancellation
    fn is_cancelled(&self) -> bool;
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay after the first failed attempt
    pub initial_interval: Duration,
    /// Upper bound for the delay between attempts
    pub max_interval: Duration,
    /// Total number of attempts before the last error propagates
    pub max_retry_count: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(1000),
            max_interval: Duration::from_millis(5000),
            max_retry_count: 5,
        }
    }
}

impl RetryConfig {
    /// Retry settings for remote API calls taken from the agent configuration
    pub fn from_config(config: &BackupRestoreConfig) -> Self {
        Self {
            initial_interval: config.api_retry_interval(),
            max_interval: config.max_api_retry_interval(),
            max_retry_count: config.max_api_retry_count,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_interval)
    }
}

/// Retry executor
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create an executor with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The configuration this executor runs with
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delays slept between attempts when every attempt fails
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let waits = self.config.max_retry_count.saturating_sub(1) as usize;
        let mut delays = Vec::with_capacity(waits);
        let mut delay = self.config.initial_interval;
        for _ in 0..waits {
            delays.push(delay);
            delay = self.config.next_delay(delay);
        }
        delays
    }

    /// Execute an async operation with retry logic.
    ///
    /// `context` is cloned into each attempt along with a child of
    /// `cancellation`. Cancellation is checked before every attempt and
    /// interrupts the backoff delay.
    #[instrument(skip(self, context, cancellation, classify, operation))]
    pub async fn execute<C, F, Fut, T, E, K>(
        &self,
        operation_name: &str,
        context: C,
        cancellation: &CancellationToken,
        classify: K,
        operation: F,
    ) -> Result<T, E>
    where
        C: Clone,
        F: Fn(C, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: CancellableError,
        K: Fn(&E) -> RetryDecision,
    {
        let mut attempt: u32 = 0;
        let mut delay = self.config.initial_interval;

        loop {
            if cancellation.is_cancelled() {
                return Err(E::cancelled());
            }

            match operation(context.clone(), cancellation.child_token()).await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("{} succeeded after {} failed attempts", operation_name, attempt);
                    }
                    return Ok(result);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    attempt += 1;

                    if classify(&err) == RetryDecision::Abort {
                        warn!("{} failed with a non-retryable error: {}", operation_name, err);
                        return Err(err);
                    }

                    if attempt >= self.config.max_retry_count {
                        error!("{} exhausted {} attempts: {}", operation_name, attempt, err);
                        return Err(err);
                    }

                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed, retrying: {}",
                        operation_name,
                        err
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancellation.cancelled() => return Err(E::cancelled()),
                    }

                    delay = self.config.next_delay(delay);
                }
            }
        }
    }

    /// Execute a blocking operation with retry logic.
    ///
    /// Sleeps the calling thread between attempts, so only call this from
    /// synchronous code or inside `spawn_blocking`.
    pub fn execute_blocking<C, F, T, E, K>(
        &self,
        operation_name: &str,
        context: &C,
        classify: K,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut(&C) -> Result<T, E>,
        E: Display,
        K: Fn(&E) -> RetryDecision,
    {
        let mut attempt: u32 = 0;
        let mut delay = self.config.initial_interval;

        loop {
            match operation(context) {
                Ok(result) => return Ok(result),
                Err(err) => {
                    attempt += 1;

                    let exhausted = attempt >= self.config.max_retry_count;
                    if classify(&err) == RetryDecision::Abort || exhausted {
                        warn!("{} failed after {} attempts: {}", operation_name, attempt, err);
                        return Err(err);
                    }

                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed, retrying: {}",
                        operation_name,
                        err
                    );
                    std::thread::sleep(delay);
                    delay = self.config.next_delay(delay);
                }
            }
        }
    }
}

/// Whether a local I/O error is worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    classify_io_error(err) == RetryDecision::Retry
}

/// Classify local I/O errors: retry unless the failure cannot go away by
/// itself (path too long, malformed input, access denied).
pub fn classify_io_error(err: &std::io::Error) -> RetryDecision {
    if err.raw_os_error() == Some(NAME_TOO_LONG_OS_ERROR) {
        return RetryDecision::Abort;
    }

    match err.kind() {
        std::io::ErrorKind::InvalidInput
        | std::io::ErrorKind::InvalidData
        | std::io::ErrorKind::PermissionDenied
        | std::io::ErrorKind::Unsupported
        | std::io::ErrorKind::OutOfMemory => RetryDecision::Abort,
        _ => RetryDecision::Retry,
    }
}

/// Classify coordination service errors: retry timeouts and transient
/// unavailability, abort on everything else.
pub fn classify_coordination_error(err: &CoordinationError) -> RetryDecision {
    if err.is_transient() {
        RetryDecision::Retry
    } else {
        RetryDecision::Abort
    }
}

/// Classify artifact store errors: retry 5xx-class and recoverable I/O
/// failures, abort on not-found, path-too-long and authorization failures.
pub fn classify_store_error(err: &StoreError) -> RetryDecision {
    if err.is_transient() {
        RetryDecision::Retry
    } else {
        RetryDecision::Abort
    }
}

/// Classify failures of replica calls such as restore.
pub fn classify_backup_error(err: &BackupRestoreError) -> RetryDecision {
    match err.failure_kind() {
        FailureKind::Transient | FailureKind::NotReadable => RetryDecision::Retry,
        _ => RetryDecision::Abort,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn executor(max_retry_count: u32) -> RetryExecutor {
        RetryExecutor::new(RetryConfig {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(350),
            max_retry_count,
        })
    }

    fn transient() -> StoreError {
        StoreError::Transient("503 service unavailable".to_string())
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let delays = executor(6).backoff_schedule();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
                Duration::from_millis(350),
                Duration::from_millis(350),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_fewer_failures_than_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let start = Instant::now();

        let result = executor(5)
            .execute("upload", calls.clone(), &token, classify_store_error, |calls, _| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 350
        assert_eq!(start.elapsed(), Duration::from_millis(650));
    }

    #[tokio::test(start_paused = true)]
    async fn last_error_propagates_when_budget_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let result: Result<(), StoreError> = executor(3)
            .execute("upload", calls.clone(), &token, classify_store_error, |calls, _| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Transient(format!("attempt {n}")))
            })
            .await;

        match result {
            Err(StoreError::Transient(msg)) => assert_eq!(msg, "attempt 2"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_is_never_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let result: Result<(), StoreError> = executor(5)
            .execute(
                "download",
                calls.clone(),
                &token,
                classify_store_error,
                |calls, _| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::NotFound("missing.tgz".into()))
                },
            )
            .await;

        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let canceller = token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result: Result<(), StoreError> = executor(5)
            .execute("upload", calls.clone(), &token, classify_store_error, |calls, _| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_skips_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<(), StoreError> = executor(5)
            .execute("upload", calls.clone(), &token, classify_store_error, |calls, _| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn blocking_variant_retries_io() {
        let exec = RetryExecutor::new(RetryConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_retry_count: 4,
        });
        let mut calls = 0;

        let result = exec.execute_blocking("extract", &(), classify_io_error, |_| {
            calls += 1;
            if calls < 3 {
                Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "busy"))
            } else {
                Ok("done")
            }
        });

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls, 3);
    }

    #[test]
    fn io_classification() {
        let retry = [
            std::io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted,
            std::io::ErrorKind::NotFound,
        ];
        for kind in retry {
            let err = std::io::Error::new(kind, "test");
            assert_eq!(classify_io_error(&err), RetryDecision::Retry, "{kind:?}");
        }

        let abort = [
            std::io::ErrorKind::InvalidInput,
            std::io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::InvalidData,
        ];
        for kind in abort {
            let err = std::io::Error::new(kind, "test");
            assert_eq!(classify_io_error(&err), RetryDecision::Abort, "{kind:?}");
        }

        #[cfg(unix)]
        assert_eq!(
            classify_io_error(&std::io::Error::from_raw_os_error(NAME_TOO_LONG_OS_ERROR)),
            RetryDecision::Abort
        );
    }

    #[test]
    fn coordination_classification() {
        assert_eq!(classify_coordination_error(&CoordinationError::Timeout), RetryDecision::Retry);
        assert_eq!(
            classify_coordination_error(&CoordinationError::Unavailable("restarting".into())),
            RetryDecision::Retry
        );
        assert_eq!(
            classify_coordination_error(&CoordinationError::Rejected {
                code: 400,
                message: "bad request".into()
            }),
            RetryDecision::Abort
        );
    }
}
