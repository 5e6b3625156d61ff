//! Retry policy with exponential backoff and error classification.
//!
//! Retry is a policy applied from the outside: [`run_with_retry`] takes the
//! operation as a closure and knows nothing about what it does.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, warn};

/// Retry configuration.
///
/// Attempts are 1-indexed. After failed attempt `n` (when retryable and
/// attempts remain) the policy sleeps
/// `initial_delay * backoff_multiplier^(n - 1)`. A multiplier that is not
/// finite or is below 1 counts as 1 (constant delay).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (minimum 1).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            backoff_multiplier: sanitize_backoff(backoff_multiplier),
        }
    }

    /// Projection writes: 3 attempts, 1s initial delay, doubling.
    pub fn for_projection() -> Self {
        Self::new(3, Duration::from_secs(1), 2.0)
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = sanitize_backoff(self.backoff_multiplier);
        let secs = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

fn sanitize_backoff(multiplier: f64) -> f64 {
    if multiplier.is_finite() && multiplier >= 1.0 {
        multiplier
    } else {
        1.0
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_projection()
    }
}

/// Coarse error kind tags used for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Timeout,
    /// Constraint violation: the data is wrong, retrying cannot help.
    Integrity,
    /// Bad input: retrying cannot help.
    Validation,
    Other,
}

/// Errors that can report their kind to the retry classifier.
pub trait Classify {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

const PERMANENT_INDICATORS: &[&str] = &[
    "duplicate entry",
    "duplicate key",
    "integrity",
    "unique constraint",
    "foreign key",
];

const TRANSIENT_INDICATORS: &[&str] = &[
    "connection",
    "refused",
    "reset",
    "broken pipe",
    "network",
    "socket",
    "timeout",
    "timed out",
    "deadlock",
    "lock wait timeout",
    "gone away",
    "too many connections",
    "lost connection",
    "temporarily unavailable",
    "temporary failure",
    "service unavailable",
    "503",
    "504",
];

/// Whether an error is worth retrying.
///
/// Integrity and validation errors never are. Connection and timeout kinds
/// always are. Anything else is decided by the error message.
pub fn is_retryable<E>(err: &E) -> bool
where
    E: Classify + Display + ?Sized,
{
    match err.kind() {
        ErrorKind::Integrity | ErrorKind::Validation => false,
        ErrorKind::Connection | ErrorKind::Timeout => true,
        ErrorKind::Other => is_transient_message(&err.to_string()),
    }
}

/// Substring classification of an error message.
pub fn is_transient_message(message: &str) -> bool {
    let message = message.to_lowercase();
    if PERMANENT_INDICATORS.iter().any(|s| message.contains(s)) {
        return false;
    }
    TRANSIENT_INDICATORS.iter().any(|s| message.contains(s))
}

/// Run `operation` under `policy`.
///
/// Returns the first success, or the last error once it is classified as
/// non-retryable by `retryable` or attempts are exhausted.
pub async fn run_with_retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if attempt > 1 {
            debug!(operation = operation_name, attempt, max_attempts, "retry attempt");
        }

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !retryable(&err) {
            warn!(
                operation = operation_name,
                attempt,
                error = %err,
                "non-retryable failure"
            );
            return Err(err);
        }

        if attempt >= max_attempts {
            error!(
                operation = operation_name,
                attempts = attempt,
                error = %err,
                "retries exhausted"
            );
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            operation = operation_name,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "attempt failed; retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        kind: ErrorKind,
        message: &'static str,
    }

    impl TestError {
        fn new(kind: ErrorKind, message: &'static str) -> Self {
            Self { kind, message }
        }
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.message)
        }
    }

    impl Classify for TestError {
        fn kind(&self) -> ErrorKind {
            self.kind
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(10), 2.0)
    }

    /// Fails transiently `failures` times, then succeeds.
    async fn flaky(calls: &AtomicU32, failures: u32) -> Result<u32, TestError> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures {
            Err(TestError::new(ErrorKind::Connection, "connection refused"))
        } else {
            Ok(n)
        }
    }

    #[test]
    fn classification_table() {
        assert!(is_retryable(&TestError::new(ErrorKind::Connection, "refused")));
        assert!(!is_retryable(&TestError::new(ErrorKind::Validation, "x")));
        assert!(is_retryable(&TestError::new(
            ErrorKind::Other,
            "Deadlock found when trying to get lock; try restarting transaction"
        )));
        assert!(!is_retryable(&TestError::new(
            ErrorKind::Other,
            "Duplicate entry 'e1' for key 'PRIMARY'"
        )));
    }

    #[test]
    fn kind_overrides_message() {
        assert!(!is_retryable(&TestError::new(ErrorKind::Integrity, "connection reset")));
        assert!(is_retryable(&TestError::new(ErrorKind::Timeout, "no details")));
        assert!(!is_retryable(&TestError::new(ErrorKind::Other, "syntax error near 'FROM'")));
        assert!(is_transient_message("MySQL server has gone away"));
        assert!(is_transient_message("HTTP 503 Service Unavailable"));
    }

    #[test]
    fn delays_grow_exponentially() {
        let policy = RetryPolicy::for_projection();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));

        let huge = RetryPolicy::new(3, Duration::from_secs(1), 1e300);
        assert_eq!(huge.delay_for_attempt(5), Duration::MAX);
    }

    #[test]
    fn unusable_backoff_means_constant_delay() {
        for multiplier in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 0.5, 0.0, -2.0] {
            let policy = RetryPolicy::new(3, Duration::from_millis(100), multiplier);
            assert_eq!(policy.backoff_multiplier, 1.0, "{multiplier}");
            assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
            assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(100));
        }

        let mut policy = RetryPolicy::for_projection();
        policy.backoff_multiplier = f64::NAN;
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = run_with_retry(&RetryPolicy::for_projection(), "flaky", is_retryable, || {
            flaky(&calls, 2)
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3_100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_stops_at_max_attempts() {
        let calls = AtomicU32::new(0);

        let result = run_with_retry(&RetryPolicy::for_projection(), "down", is_retryable, || {
            flaky(&calls, u32::MAX)
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<(), TestError> =
            run_with_retry(&RetryPolicy::for_projection(), "dup", is_retryable, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::new(ErrorKind::Other, "Duplicate entry 'e1'")) }
            })
            .await;

        assert_eq!(result.unwrap_err().message, "Duplicate entry 'e1'");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(1));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: k transient failures cost min(k + 1, max) invocations.
        #[test]
        fn invocation_count(max_attempts in 1u32..6, failures in 0u32..8) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let calls = AtomicU32::new(0);
            let result = rt.block_on(run_with_retry(
                &fast_policy(max_attempts),
                "prop",
                is_retryable,
                || flaky(&calls, failures),
            ));

            let expected_calls = (failures + 1).min(max_attempts);
            prop_assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
            prop_assert_eq!(result.is_ok(), failures < max_attempts);
        }
    }
}
